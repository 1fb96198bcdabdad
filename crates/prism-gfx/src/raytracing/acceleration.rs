use glam::Mat4;

use crate::{
    backend::types::{
        AsBuildDesc, AsBuildFlags, AsInputs, AsPrebuildInfo, GpuVirtualAddress, HeapType, ResourceFlags,
        ResourceState, TrianglesGeometry,
    },
    error::{GfxResult, GraphicsError},
    raytracing::instance::InstanceDesc,
    resources::{
        handles::BufferHandle, manager::GpuResourceManager, resource_factory::ResourceFactory,
        typed_buffer::StructuredUploadBuffer,
    },
};

/// 加速结构相关的 buffer
///
/// - scratch：构建时的临时内存，大小为 `scratch_data_size`，构建完成后释放
/// - result：加速结构本身，大小为 `result_data_max_size`
/// - update：`ALLOW_UPDATE` 时用于增量更新的临时内存，大小为 `update_scratch_data_size`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccelerationStructureBuffers {
    pub scratch: Option<BufferHandle>,
    pub result: BufferHandle,
    pub update: Option<BufferHandle>,
    pub prebuild: AsPrebuildInfo,
}

impl AccelerationStructureBuffers {
    pub fn result_address(&self, resources: &GpuResourceManager) -> GfxResult<GpuVirtualAddress> {
        Ok(resources.buffer(self.result)?.gpu_address)
    }
}

/// 构建好的 BLAS，只能通过 [`AccelerationStructureBuilder::build_bottom_level`] 得到
#[derive(Debug)]
pub struct BottomLevelAs {
    buffers: AccelerationStructureBuffers,
    geometry_count: u32,
    name: String,
}

impl BottomLevelAs {
    #[inline]
    pub fn buffers(&self) -> &AccelerationStructureBuffers {
        &self.buffers
    }

    #[inline]
    pub fn geometry_count(&self) -> u32 {
        self.geometry_count
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self, resources: &GpuResourceManager) -> GfxResult<GpuVirtualAddress> {
        self.buffers.result_address(resources)
    }
}

/// TLAS 中的一个 instance
#[derive(Clone, Copy, Debug)]
pub struct TlasInstance<'a> {
    pub blas: &'a BottomLevelAs,
    pub transform: Mat4,
    pub instance_id: u32,
    pub hit_group_contribution: u32,
    pub mask: u8,
}

impl<'a> TlasInstance<'a> {
    pub fn new(blas: &'a BottomLevelAs, transform: Mat4, instance_id: u32, hit_group_contribution: u32) -> Self {
        Self {
            blas,
            transform,
            instance_id,
            hit_group_contribution,
            mask: InstanceDesc::DEFAULT_MASK,
        }
    }
}

/// 构建好的 TLAS
pub struct TopLevelAs {
    buffers: AccelerationStructureBuffers,
    instances: StructuredUploadBuffer<InstanceDesc>,
    name: String,
}

impl TopLevelAs {
    #[inline]
    pub fn buffers(&self) -> &AccelerationStructureBuffers {
        &self.buffers
    }

    #[inline]
    pub fn instances(&self) -> &StructuredUploadBuffer<InstanceDesc> {
        &self.instances
    }

    #[inline]
    pub fn instance_count(&self) -> u32 {
        self.instances.capacity()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self, resources: &GpuResourceManager) -> GfxResult<GpuVirtualAddress> {
        self.buffers.result_address(resources)
    }
}

pub struct AccelerationStructureBuilder;

impl AccelerationStructureBuilder {
    /// 查询内存需求并创建 scratch/result/update buffer
    pub fn create_acceleration_structure(
        factory: &mut ResourceFactory,
        inputs: &AsInputs,
        name: &str,
    ) -> GfxResult<AccelerationStructureBuffers> {
        let prebuild = factory.resources().backend().acceleration_structure_prebuild_info(inputs)?;
        if prebuild.result_data_max_size == 0 || prebuild.scratch_data_size == 0 {
            return Err(GraphicsError::device_call(
                "GetRaytracingAccelerationStructurePrebuildInfo",
                format!("`{name}` reported empty sizes: {prebuild:?}"),
            ));
        }

        let scratch = factory.create_buffer_with_state(
            prebuild.scratch_data_size,
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            ResourceState::UnorderedAccess,
            &format!("{name}-scratch"),
        )?;
        let result = factory.create_buffer_with_state(
            prebuild.result_data_max_size,
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            ResourceState::AccelerationStructure,
            &format!("{name}-result"),
        )?;
        let update = if inputs.flags().contains(AsBuildFlags::ALLOW_UPDATE) && prebuild.update_scratch_data_size > 0 {
            Some(factory.create_buffer_with_state(
                prebuild.update_scratch_data_size,
                HeapType::Default,
                ResourceFlags::ALLOW_UNORDERED_ACCESS,
                ResourceState::UnorderedAccess,
                &format!("{name}-update"),
            )?)
        } else {
            None
        };

        log::info!(
            "acceleration structure `{}`: result {} bytes, scratch {} bytes, update {} bytes",
            name,
            prebuild.result_data_max_size,
            prebuild.scratch_data_size,
            prebuild.update_scratch_data_size
        );
        Ok(AccelerationStructureBuffers {
            scratch: Some(scratch),
            result,
            update,
            prebuild,
        })
    }

    /// 记录构建命令，以及 result buffer 上的 UAV barrier
    pub fn record_build(
        factory: &mut ResourceFactory,
        inputs: &AsInputs,
        buffers: &AccelerationStructureBuffers,
    ) -> GfxResult<()> {
        let Some(scratch) = buffers.scratch else {
            return Err(GraphicsError::invalid_state("scratch buffer", "scratch already retired"));
        };
        let (resources, cmd) = factory.resources_and_commands()?;
        let desc = AsBuildDesc {
            inputs: inputs.clone(),
            dest: resources.buffer(buffers.result)?.gpu_address,
            scratch: resources.buffer(scratch)?.gpu_address,
            source: None,
        };
        cmd.build_acceleration_structure(desc);
        // 后续的 TLAS 构建或者 DispatchRays 必须等待构建完成
        resources.uav_barrier(cmd, buffers.result)
    }

    pub fn build_bottom_level(
        factory: &mut ResourceFactory,
        geometries: &[TrianglesGeometry],
        flags: AsBuildFlags,
        name: &str,
    ) -> GfxResult<BottomLevelAs> {
        let inputs = AsInputs::BottomLevel {
            geometries: geometries.to_vec(),
            flags,
        };
        let mut buffers = Self::create_acceleration_structure(factory, &inputs, name)?;
        Self::record_build(factory, &inputs, &buffers)?;
        Self::retire_scratch(factory, &mut buffers)?;
        Ok(BottomLevelAs {
            buffers,
            geometry_count: geometries.len() as u32,
            name: name.to_string(),
        })
    }

    /// 只接受已经构建好的 BLAS，它们的构建与 UAV barrier 都已经记录在 TLAS 之前
    pub fn build_top_level(
        factory: &mut ResourceFactory,
        instances: &[TlasInstance],
        flags: AsBuildFlags,
        name: &str,
    ) -> GfxResult<TopLevelAs> {
        let descs = instances
            .iter()
            .map(|instance| {
                let blas = instance.blas.address(factory.resources())?;
                Ok(InstanceDesc::new(&instance.transform, instance.instance_id, instance.hit_group_contribution, blas)
                    .with_mask(instance.mask))
            })
            .collect::<GfxResult<Vec<_>>>()?;
        let instance_buffer = StructuredUploadBuffer::from_slice(factory, &descs, &format!("{name}-instances"))?;

        let inputs = AsInputs::TopLevel {
            instance_descs: instance_buffer.gpu_address(factory.resources(), 0)?,
            instance_count: descs.len() as u32,
            flags,
        };
        let mut buffers = Self::create_acceleration_structure(factory, &inputs, name)?;
        Self::record_build(factory, &inputs, &buffers)?;
        Self::retire_scratch(factory, &mut buffers)?;
        Ok(TopLevelAs {
            buffers,
            instances: instance_buffer,
            name: name.to_string(),
        })
    }

    /// scratch 在本次构建的 fence 值完成之后释放
    fn retire_scratch(factory: &mut ResourceFactory, buffers: &mut AccelerationStructureBuffers) -> GfxResult<()> {
        if let Some(scratch) = buffers.scratch.take() {
            factory.retire_buffer(scratch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        backend::{
            headless::HeadlessBackend,
            types::{Format, GeometryFlags},
        },
        render_context::{RenderingContext, RenderingContextConfig},
    };

    fn headless_context() -> (Rc<HeadlessBackend>, RenderingContext) {
        let headless = Rc::new(HeadlessBackend::new());
        let ctx = RenderingContext::new(headless.clone(), &RenderingContextConfig::default()).unwrap();
        (headless, ctx)
    }

    fn triangle(ctx: &mut RenderingContext) -> TrianglesGeometry {
        let vertices: [[f32; 3]; 3] = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let indices: [u16; 3] = [0, 1, 2];
        let mut factory = ctx.factory();
        let vb = factory
            .create_buffer(36, Some(bytemuck::cast_slice(&vertices)), HeapType::Default, ResourceFlags::empty(), "vb")
            .unwrap();
        let ib = factory
            .create_buffer(6, Some(bytemuck::cast_slice(&indices)), HeapType::Default, ResourceFlags::empty(), "ib")
            .unwrap();
        TrianglesGeometry {
            vertex_buffer: ctx.resources().buffer(vb).unwrap().gpu_address,
            vertex_stride: 12,
            vertex_count: 3,
            vertex_format: Format::Rgb32Float,
            index_buffer: ctx.resources().buffer(ib).unwrap().gpu_address,
            index_count: 3,
            index_format: Format::R16Uint,
            flags: GeometryFlags::OPAQUE,
        }
    }

    #[test]
    fn test_blas_then_tlas() {
        let (headless, mut ctx) = headless_context();
        ctx.begin_upload("acceleration structures").unwrap();
        let geometry = triangle(&mut ctx);

        let mut factory = ctx.factory();
        let blas = AccelerationStructureBuilder::build_bottom_level(
            &mut factory,
            &[geometry],
            AsBuildFlags::PREFER_FAST_TRACE,
            "blas",
        )
        .unwrap();
        let tlas = AccelerationStructureBuilder::build_top_level(
            &mut factory,
            &[TlasInstance::new(&blas, Mat4::IDENTITY, 0, 0), TlasInstance::new(&blas, Mat4::IDENTITY, 1, 1)],
            AsBuildFlags::PREFER_FAST_TRACE,
            "tlas",
        )
        .unwrap();
        assert!(blas.buffers().scratch.is_none());
        assert!(tlas.buffers().scratch.is_none());

        let stats = ctx.end_upload().unwrap();
        // 两个 staging buffer 与两个 scratch buffer
        assert_eq!(stats.retired, 4);

        let blas_native = ctx.resources().buffer(blas.buffers().result).unwrap().native;
        let tlas_native = ctx.resources().buffer(tlas.buffers().result).unwrap().native;
        assert_eq!(&headless.resource_data(blas_native).unwrap()[..8], b"BLAS\x01\0\0\0");
        assert_eq!(&headless.resource_data(tlas_native).unwrap()[..8], b"TLAS\x02\0\0\0");
        assert_eq!(tlas.instance_count(), 2);
    }

    #[test]
    fn test_buffers_sized_from_prebuild() {
        let (_headless, mut ctx) = headless_context();
        let geometry = triangle(&mut ctx);
        let inputs = AsInputs::BottomLevel {
            geometries: vec![geometry],
            flags: AsBuildFlags::ALLOW_UPDATE,
        };
        let prebuild = ctx.backend().acceleration_structure_prebuild_info(&inputs).unwrap();
        let buffers =
            AccelerationStructureBuilder::create_acceleration_structure(&mut ctx.factory(), &inputs, "blas").unwrap();

        let resources = ctx.resources();
        let scratch = resources.buffer(buffers.scratch.unwrap()).unwrap();
        assert_eq!(scratch.size, prebuild.scratch_data_size);
        assert_eq!(scratch.state, ResourceState::UnorderedAccess);
        let result = resources.buffer(buffers.result).unwrap();
        assert_eq!(result.size, prebuild.result_data_max_size);
        assert_eq!(result.state, ResourceState::AccelerationStructure);
        assert_eq!(resources.buffer(buffers.update.unwrap()).unwrap().size, prebuild.update_scratch_data_size);
    }

    #[test]
    fn test_tlas_rejected_without_blas_barrier() {
        let (_headless, mut ctx) = headless_context();
        ctx.begin_upload("broken").unwrap();
        let geometry = triangle(&mut ctx);
        let blas_inputs = AsInputs::BottomLevel {
            geometries: vec![geometry],
            flags: AsBuildFlags::empty(),
        };

        let mut factory = ctx.factory();
        let blas = AccelerationStructureBuilder::create_acceleration_structure(&mut factory, &blas_inputs, "blas").unwrap();
        // 只记录构建，不记录 UAV barrier
        let (resources, cmd) = factory.resources_and_commands().unwrap();
        let blas_address = resources.buffer(blas.result).unwrap().gpu_address;
        cmd.build_acceleration_structure(AsBuildDesc {
            inputs: blas_inputs.clone(),
            dest: blas_address,
            scratch: resources.buffer(blas.scratch.unwrap()).unwrap().gpu_address,
            source: None,
        });

        let instances = StructuredUploadBuffer::from_slice(
            &mut factory,
            &[InstanceDesc::new(&Mat4::IDENTITY, 0, 0, blas_address)],
            "instances",
        )
        .unwrap();
        let tlas_inputs = AsInputs::TopLevel {
            instance_descs: instances.gpu_address(factory.resources(), 0).unwrap(),
            instance_count: 1,
            flags: AsBuildFlags::empty(),
        };
        let tlas = AccelerationStructureBuilder::create_acceleration_structure(&mut factory, &tlas_inputs, "tlas").unwrap();
        AccelerationStructureBuilder::record_build(&mut factory, &tlas_inputs, &tlas).unwrap();

        match ctx.end_upload() {
            Err(GraphicsError::DeviceCallFailed { call, reason }) => {
                assert_eq!(call, "ExecuteCommandLists");
                assert!(reason.contains("UAV barrier"), "{reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
