use crate::{
    backend::types::{
        DispatchRaysDesc, GpuAddressRange, GpuAddressRangeAndStride, GpuDescriptorHandle, HeapType, RayTracingCaps,
        ResourceFlags, ShaderIdentifier,
    },
    basic::align::align_up,
    error::{GfxResult, GraphicsError},
    pipelines::{root_signature::RootParameter, state_object::StateObject},
    resources::{handles::BufferHandle, manager::GpuResourceManager, resource_factory::ResourceFactory},
};

/// `[identifier | GPU descriptor handles...]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderRecord {
    pub export: String,
    pub identifier: ShaderIdentifier,
    pub root_arguments: Vec<GpuDescriptorHandle>,
}

impl ShaderRecord {
    #[inline]
    fn unaligned_size(&self) -> u64 {
        self.identifier.as_bytes().len() as u64
            + self.root_arguments.len() as u64 * RootParameter::DESCRIPTOR_TABLE_SIZE as u64
    }

    fn write_into(&self, dst: &mut [u8]) {
        let id = self.identifier.as_bytes();
        dst[..id.len()].copy_from_slice(id);
        for (i, handle) in self.root_arguments.iter().enumerate() {
            let offset = id.len() + i * RootParameter::DESCRIPTOR_TABLE_SIZE as usize;
            dst[offset..offset + 8].copy_from_slice(&handle.0.to_le_bytes());
        }
    }
}

/// 一个区域内的 record 使用相同的 stride，区域的起始地址按照 table alignment 对齐
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShaderTableRegion {
    pub offset: u64,
    pub stride: u64,
    pub count: u64,
    /// 对齐之后占用的字节数
    pub aligned_size: u64,
}

impl ShaderTableRegion {
    /// 区域内 record 实际占用的字节数
    #[inline]
    pub fn size(&self) -> u64 {
        self.stride * self.count
    }

    fn new(records: &[ShaderRecord], offset: u64, caps: &RayTracingCaps) -> GfxResult<Self> {
        let max_record = records.iter().map(ShaderRecord::unaligned_size).max().unwrap_or(0);
        let stride = align_up(max_record, caps.shader_record_alignment as u64)?;
        let count = records.len() as u64;
        Ok(Self {
            offset,
            stride,
            count,
            aligned_size: align_up(stride * count, caps.shader_table_alignment as u64)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShaderTableLayout {
    pub ray_generation: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    pub hit_group: ShaderTableRegion,
}

impl ShaderTableLayout {
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.hit_group.offset + self.hit_group.aligned_size
    }
}

/// ray-gen / miss / hit group 三个区域放在同一个 upload buffer 中，创建之后不再修改
#[derive(Clone, Copy, Debug)]
pub struct ShaderTable {
    buffer: BufferHandle,
    layout: ShaderTableLayout,
    dispatch: DispatchRaysDesc,
}

impl ShaderTable {
    #[inline]
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    #[inline]
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    #[inline]
    pub fn dispatch_desc(&self) -> DispatchRaysDesc {
        self.dispatch
    }

    pub fn destroy(self, resources: &mut GpuResourceManager, fence_value: u64) -> GfxResult<()> {
        resources.destroy_buffer_deferred(self.buffer, fence_value)
    }
}

pub struct ShaderTableBuilder<'a> {
    state_object: &'a StateObject,
    caps: RayTracingCaps,
    ray_generation: Option<ShaderRecord>,
    miss: Vec<ShaderRecord>,
    hit_groups: Vec<ShaderRecord>,
}

impl<'a> ShaderTableBuilder<'a> {
    pub fn new(state_object: &'a StateObject, caps: RayTracingCaps) -> Self {
        Self {
            state_object,
            caps,
            ray_generation: None,
            miss: Vec::new(),
            hit_groups: Vec::new(),
        }
    }

    /// 查询 identifier 并检查 root 参数与 local root signature 一致
    fn make_record(&self, export: &str, root_arguments: &[GpuDescriptorHandle]) -> GfxResult<ShaderRecord> {
        let identifier = self.state_object.shader_identifier(export)?;
        let expected = self.state_object.desc().local_argument_size(export);
        let actual = root_arguments.len() as u32 * RootParameter::DESCRIPTOR_TABLE_SIZE;
        if expected != actual {
            return Err(GraphicsError::ShaderRecordMismatch {
                export: export.to_string(),
                expected,
                actual,
            });
        }
        Ok(ShaderRecord {
            export: export.to_string(),
            identifier,
            root_arguments: root_arguments.to_vec(),
        })
    }

    pub fn ray_generation(mut self, export: &str, root_arguments: &[GpuDescriptorHandle]) -> GfxResult<Self> {
        self.ray_generation = Some(self.make_record(export, root_arguments)?);
        Ok(self)
    }

    pub fn miss(mut self, export: &str, root_arguments: &[GpuDescriptorHandle]) -> GfxResult<Self> {
        let record = self.make_record(export, root_arguments)?;
        self.miss.push(record);
        Ok(self)
    }

    pub fn hit_group(mut self, export: &str, root_arguments: &[GpuDescriptorHandle]) -> GfxResult<Self> {
        let record = self.make_record(export, root_arguments)?;
        self.hit_groups.push(record);
        Ok(self)
    }

    pub fn layout(&self) -> GfxResult<ShaderTableLayout> {
        let ray_generation = ShaderTableRegion::new(self.ray_generation.as_slice(), 0, &self.caps)?;
        let miss = ShaderTableRegion::new(&self.miss, ray_generation.aligned_size, &self.caps)?;
        let hit_group = ShaderTableRegion::new(&self.hit_groups, miss.offset + miss.aligned_size, &self.caps)?;
        Ok(ShaderTableLayout {
            ray_generation,
            miss,
            hit_group,
        })
    }

    /// 写入 upload buffer，并生成 `DispatchRaysDesc`
    pub fn build(self, factory: &mut ResourceFactory, width: u32, height: u32, name: &str) -> GfxResult<ShaderTable> {
        let Some(ray_generation) = &self.ray_generation else {
            return Err(GraphicsError::invalid_state("a ray generation record", "no ray generation record"));
        };
        let layout = self.layout()?;

        let mut bytes = vec![0u8; layout.total_size() as usize];
        let regions = [
            (std::slice::from_ref(ray_generation), &layout.ray_generation),
            (self.miss.as_slice(), &layout.miss),
            (self.hit_groups.as_slice(), &layout.hit_group),
        ];
        for (records, region) in regions {
            for (i, record) in records.iter().enumerate() {
                let offset = (region.offset + i as u64 * region.stride) as usize;
                record.write_into(&mut bytes[offset..offset + region.stride as usize]);
            }
        }

        let buffer = factory.create_buffer(
            layout.total_size(),
            Some(&bytes),
            HeapType::Upload,
            ResourceFlags::empty(),
            name,
        )?;
        let base = factory.resources().buffer(buffer)?.gpu_address;

        let dispatch = DispatchRaysDesc {
            ray_generation: GpuAddressRange {
                start: base + layout.ray_generation.offset,
                size: layout.ray_generation.stride,
            },
            miss: GpuAddressRangeAndStride {
                start: base + layout.miss.offset,
                size: layout.miss.size(),
                stride: layout.miss.stride,
            },
            hit_group: GpuAddressRangeAndStride {
                start: base + layout.hit_group.offset,
                size: layout.hit_group.size(),
                stride: layout.hit_group.stride,
            },
            callable: GpuAddressRangeAndStride::default(),
            width,
            height,
            depth: 1,
        };
        log::info!(
            "shader table `{}`: {} bytes (ray gen {}x{}, miss {}x{}, hit group {}x{})",
            name,
            layout.total_size(),
            layout.ray_generation.count,
            layout.ray_generation.stride,
            layout.miss.count,
            layout.miss.stride,
            layout.hit_group.count,
            layout.hit_group.stride
        );
        Ok(ShaderTable {
            buffer,
            layout,
            dispatch,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        backend::{GfxBackend, headless::HeadlessBackend},
        pipelines::{
            root_signature::{DescriptorRange, RootSignature, RootSignatureDesc},
            shader::ShaderBlob,
            state_object::{HitGroupDesc, LocalRootAssociation, ShaderExport, ShaderStage, StateObjectDesc},
        },
        render_context::{RenderingContext, RenderingContextConfig},
    };

    struct Pipeline {
        _global: RootSignature,
        _ray_gen: RootSignature,
        _hit: RootSignature,
        state_object: StateObject,
    }

    fn pipeline(backend: Rc<HeadlessBackend>) -> Pipeline {
        let global = RootSignature::new(
            backend.clone(),
            RootSignatureDesc::global("global").descriptor_table(&[DescriptorRange::srv(0, 0)]),
        )
        .unwrap();
        let ray_gen = RootSignature::new(
            backend.clone(),
            RootSignatureDesc::local("ray-gen").descriptor_table(&[DescriptorRange::uav(0, 1)]),
        )
        .unwrap();
        let hit = RootSignature::new(
            backend.clone(),
            RootSignatureDesc::local("hit")
                .descriptor_table(&[DescriptorRange::srv(0, 1)])
                .descriptor_table(&[DescriptorRange::srv(1, 1)]),
        )
        .unwrap();

        let exports = ["mainRayGen", "mainMS", "mainCHS"];
        let library = ShaderBlob::new(b"dxil".to_vec(), exports.iter().map(|e| e.to_string()).collect(), None);
        let desc = StateObjectDesc {
            name: "test-pipeline".to_string(),
            library_exports: vec![
                ShaderExport::new("mainRayGen", ShaderStage::RayGeneration),
                ShaderExport::new("mainMS", ShaderStage::Miss),
                ShaderExport::new("mainCHS", ShaderStage::ClosestHit),
            ],
            hit_groups: vec![HitGroupDesc::triangles("HitGroup", "mainCHS")],
            payload_size: 16,
            attribute_size: 8,
            max_recursion_depth: 1,
            global_root_signature: global.id(),
            local_root_signatures: vec![
                LocalRootAssociation::new(&ray_gen, &["mainRayGen"]),
                LocalRootAssociation::new(&hit, &["HitGroup"]),
            ],
        };
        let state_object = StateObject::new(backend, desc, &library).unwrap();
        Pipeline {
            _global: global,
            _ray_gen: ray_gen,
            _hit: hit,
            state_object,
        }
    }

    fn builder(pipeline: &Pipeline, caps: RayTracingCaps) -> ShaderTableBuilder<'_> {
        ShaderTableBuilder::new(&pipeline.state_object, caps)
            .ray_generation("mainRayGen", &[GpuDescriptorHandle(0x10)])
            .unwrap()
            .miss("mainMS", &[])
            .unwrap()
            .hit_group("HitGroup", &[GpuDescriptorHandle(0x20), GpuDescriptorHandle(0x40)])
            .unwrap()
            .hit_group("HitGroup", &[GpuDescriptorHandle(0x60), GpuDescriptorHandle(0x80)])
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let headless = Rc::new(HeadlessBackend::new());
        let pipeline = pipeline(headless.clone());
        let layout = builder(&pipeline, headless.ray_tracing_caps()).layout().unwrap();

        // identifier 32 字节，record 按 32 对齐，区域按 64 对齐
        assert_eq!(
            layout.ray_generation,
            ShaderTableRegion {
                offset: 0,
                stride: 64,
                count: 1,
                aligned_size: 64
            }
        );
        assert_eq!(
            layout.miss,
            ShaderTableRegion {
                offset: 64,
                stride: 32,
                count: 1,
                aligned_size: 64
            }
        );
        assert_eq!(
            layout.hit_group,
            ShaderTableRegion {
                offset: 128,
                stride: 64,
                count: 2,
                aligned_size: 128
            }
        );
        assert_eq!(layout.total_size(), 256);
    }

    #[test]
    fn test_build_writes_records() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut ctx = RenderingContext::new(headless.clone(), &RenderingContextConfig::default()).unwrap();
        let pipeline = pipeline(headless.clone());
        let table = builder(&pipeline, ctx.ray_tracing_caps()).build(&mut ctx.factory(), 8, 4, "sbt").unwrap();

        let buffer = ctx.resources().buffer(table.buffer()).unwrap();
        let base = buffer.gpu_address;
        let bytes = headless.resource_data(buffer.native).unwrap();
        assert_eq!(bytes.len(), 256);

        let ray_gen_id = pipeline.state_object.shader_identifier("mainRayGen").unwrap();
        assert_eq!(&bytes[..32], ray_gen_id.as_bytes());
        assert_eq!(&bytes[32..40], &0x10u64.to_le_bytes());
        let hit_id = pipeline.state_object.shader_identifier("HitGroup").unwrap();
        assert_eq!(&bytes[192..224], hit_id.as_bytes());
        assert_eq!(&bytes[224..232], &0x60u64.to_le_bytes());
        assert_eq!(&bytes[232..240], &0x80u64.to_le_bytes());

        let dispatch = table.dispatch_desc();
        assert_eq!(dispatch.ray_generation, GpuAddressRange { start: base, size: 64 });
        assert_eq!(
            dispatch.miss,
            GpuAddressRangeAndStride {
                start: base + 64,
                size: 32,
                stride: 32
            }
        );
        assert_eq!(
            dispatch.hit_group,
            GpuAddressRangeAndStride {
                start: base + 128,
                size: 128,
                stride: 64
            }
        );
        assert_eq!((dispatch.width, dispatch.height, dispatch.depth), (8, 4, 1));
    }

    #[test]
    fn test_record_mismatch() {
        let headless = Rc::new(HeadlessBackend::new());
        let pipeline = pipeline(headless.clone());
        let caps = headless.ray_tracing_caps();

        let result = ShaderTableBuilder::new(&pipeline.state_object, caps).hit_group("HitGroup", &[GpuDescriptorHandle(0x20)]);
        match result.err() {
            Some(GraphicsError::ShaderRecordMismatch { export, expected, actual }) => {
                assert_eq!(export, "HitGroup");
                assert_eq!((expected, actual), (16, 8));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let result = ShaderTableBuilder::new(&pipeline.state_object, caps).miss("mainCHS", &[]);
        assert!(matches!(result.err(), Some(GraphicsError::ExportNotFound(export)) if export == "mainCHS"));
    }
}
