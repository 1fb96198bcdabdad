//! 提交时的 command list 校验
//!
//! 校验基于提交时刻的资源状态进行，所有的状态变化先记录在 overlay 中，
//! 整个 command list 校验通过后才会写回，失败的提交不会留下任何痕迹。

use std::collections::HashMap;

use crate::{
    backend::{
        headless::sim::{AsBuildRecord, Effect, SimObjects, SimResource, SimResourceKind},
        types::{
            AsBuildDesc, AsInputs, CpuDescriptorHandle, DispatchRaysDesc, GpuAddressRangeAndStride,
            GpuDescriptorHandle, GpuVirtualAddress, NativeResourceId, RayTracingCaps, ResourceFlags, ResourceState,
            ViewDesc,
        },
    },
    commands::{barrier::ResourceBarrier, command_list::Command},
    error::{GfxResult, GraphicsError},
    pipelines::{
        root_signature::{DescriptorRangeType, RootParameter, RootSignatureKind},
        state_object::{ShaderStage, StateObjectDesc},
    },
    raytracing::instance::InstanceDesc,
};

type CheckResult<T = ()> = Result<T, String>;

/// 校验通过后需要写回的结果
#[derive(Debug, Default)]
pub(super) struct SubmitPlan {
    pub states: HashMap<u64, ResourceState>,
    pub as_builds: HashMap<u64, AsBuildRecord>,
    pub effects: Vec<Effect>,
}

pub(super) struct CommandValidator<'a> {
    objects: &'a SimObjects,
    caps: RayTracingCaps,
    plan: SubmitPlan,

    label_depth: usize,
    bound_heaps: Vec<u64>,
    root_signature: Option<u64>,
    root_tables: HashMap<u32, (u64, u32)>,
    pipeline: Option<u64>,
}

impl<'a> CommandValidator<'a> {
    pub fn new(objects: &'a SimObjects, caps: RayTracingCaps) -> Self {
        Self {
            objects,
            caps,
            plan: SubmitPlan::default(),
            label_depth: 0,
            bound_heaps: Vec::new(),
            root_signature: None,
            root_tables: HashMap::new(),
            pipeline: None,
        }
    }

    pub fn validate(mut self, commands: &[Command]) -> GfxResult<SubmitPlan> {
        for (i, command) in commands.iter().enumerate() {
            self.check(command).map_err(|reason| {
                GraphicsError::device_call("ExecuteCommandLists", format!("command #{i} {}: {reason}", command_name(command)))
            })?;
        }
        if self.label_depth != 0 {
            return Err(GraphicsError::device_call(
                "ExecuteCommandLists",
                format!("{} debug label(s) left open at close", self.label_depth),
            ));
        }
        Ok(self.plan)
    }

    fn check(&mut self, command: &Command) -> CheckResult {
        match command {
            Command::BeginLabel(_) => {
                self.label_depth += 1;
                Ok(())
            }
            Command::EndLabel => {
                self.label_depth = self.label_depth.checked_sub(1).ok_or("no open debug label")?;
                Ok(())
            }
            Command::ResourceBarrier(barriers) => barriers.iter().try_for_each(|b| self.check_barrier(b)),
            Command::CopyResource { dst, src } => {
                let (dst_res, src_res) = self.copy_endpoints(*dst, *src)?;
                if dst_res.size() != src_res.size() || dst_res.kind != src_res.kind {
                    return Err(format!(
                        "`{}` ({} bytes) and `{}` ({} bytes) are not compatible",
                        dst_res.name,
                        dst_res.size(),
                        src_res.name,
                        src_res.size()
                    ));
                }
                self.plan.effects.push(Effect::Copy {
                    dst: *dst,
                    dst_offset: 0,
                    src: *src,
                    src_offset: 0,
                    size: src_res.size(),
                });
                Ok(())
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let (dst_res, src_res) = self.copy_endpoints(*dst, *src)?;
                if dst_offset + size > dst_res.size() || src_offset + size > src_res.size() {
                    return Err(format!("copy range of {size} bytes is out of bounds"));
                }
                self.plan.effects.push(Effect::Copy {
                    dst: *dst,
                    dst_offset: *dst_offset,
                    src: *src,
                    src_offset: *src_offset,
                    size: *size,
                });
                Ok(())
            }
            Command::ClearRenderTarget { rtv, target, color } => self.check_clear(*rtv, *target, *color),
            Command::BuildAccelerationStructure(desc) => self.check_as_build(desc),
            Command::SetDescriptorHeaps(heaps) => {
                for heap in heaps {
                    let sim = self.objects.heaps.get(&heap.0).ok_or_else(|| format!("heap #{} does not exist", heap.0))?;
                    if !sim.desc.shader_visible {
                        return Err(format!("heap `{}` is not shader visible", sim.desc.name));
                    }
                }
                self.bound_heaps = heaps.iter().map(|h| h.0).collect();
                Ok(())
            }
            Command::SetComputeRootSignature(id) => {
                let desc = self.objects.root_signatures.get(&id.0).ok_or("root signature does not exist")?;
                if desc.kind != RootSignatureKind::Global {
                    return Err(format!("`{}` is not a global root signature", desc.name));
                }
                self.root_signature = Some(id.0);
                self.root_tables.clear();
                Ok(())
            }
            Command::SetComputeRootDescriptorTable { parameter, handle } => {
                let root_signature = self.root_signature.ok_or("no root signature bound")?;
                let param_count = self.objects.root_signatures[&root_signature].parameters.len() as u32;
                if *parameter >= param_count {
                    return Err(format!("root parameter {parameter} out of range ({param_count} parameters)"));
                }
                let slot = self.decode_bound_gpu_handle(*handle)?;
                self.root_tables.insert(*parameter, slot);
                Ok(())
            }
            Command::SetPipelineState(id) => {
                if !self.objects.state_objects.contains_key(&id.0) {
                    return Err("state object does not exist".to_string());
                }
                self.pipeline = Some(id.0);
                Ok(())
            }
            Command::DispatchRays(desc) => self.check_dispatch(desc),
        }
    }

    // region 资源状态

    fn resource(&self, id: NativeResourceId) -> CheckResult<&'a SimResource> {
        self.objects.resources.get(&id.0).ok_or_else(|| format!("resource #{} does not exist", id.0))
    }

    fn state_of(&self, id: NativeResourceId) -> CheckResult<ResourceState> {
        let res = self.resource(id)?;
        Ok(self.plan.states.get(&id.0).copied().unwrap_or(res.state))
    }

    fn as_record(&self, id: NativeResourceId) -> Option<AsBuildRecord> {
        self.plan.as_builds.get(&id.0).copied().or_else(|| self.objects.resources.get(&id.0)?.as_build)
    }

    fn resource_at(&self, address: GpuVirtualAddress, usage: &str) -> CheckResult<(NativeResourceId, &'a SimResource)> {
        self.objects.resource_at(address).ok_or_else(|| format!("{usage} address {address:#x} is not backed by any buffer"))
    }

    fn require_state(&self, id: NativeResourceId, expected: ResourceState, usage: &str) -> CheckResult {
        let state = self.state_of(id)?;
        if state != expected {
            let name = &self.resource(id)?.name;
            return Err(format!("{usage} `{name}` must be in {expected:?} state, found {state:?}"));
        }
        Ok(())
    }

    fn require_readable(&self, id: NativeResourceId, usage: &str) -> CheckResult {
        let state = self.state_of(id)?;
        if !state.allows_shader_read() {
            let name = &self.resource(id)?.name;
            return Err(format!("{usage} `{name}` is not readable in {state:?} state"));
        }
        Ok(())
    }

    fn check_barrier(&mut self, barrier: &ResourceBarrier) -> CheckResult {
        match *barrier {
            ResourceBarrier::Transition { resource, before, after } => {
                let current = self.state_of(resource)?;
                if current != before {
                    let name = &self.resource(resource)?.name;
                    return Err(format!(
                        "transition of `{name}` declares before state {before:?}, but the resource is in {current:?}"
                    ));
                }
                let res = self.resource(resource)?;
                if res.heap.is_host_visible() && after != ResourceState::GenericRead && after != ResourceState::CopyDest {
                    return Err(format!("`{}` lives in a {:?} heap and cannot enter {after:?}", res.name, res.heap));
                }
                self.plan.states.insert(resource.0, after);
            }
            ResourceBarrier::Uav { resource } => {
                self.resource(resource)?;
                if let Some(mut record) = self.as_record(resource) {
                    record.uav_pending = false;
                    self.plan.as_builds.insert(resource.0, record);
                }
            }
        }
        Ok(())
    }

    fn copy_endpoints(
        &self,
        dst: NativeResourceId,
        src: NativeResourceId,
    ) -> CheckResult<(&'a SimResource, &'a SimResource)> {
        if dst == src {
            return Err("source and destination are the same resource".to_string());
        }
        self.require_state(dst, ResourceState::CopyDest, "copy destination")?;
        let src_state = self.state_of(src)?;
        if !src_state.allows_copy_source() {
            return Err(format!("copy source `{}` is in {src_state:?} state", self.resource(src)?.name));
        }
        Ok((self.resource(dst)?, self.resource(src)?))
    }

    // endregion

    fn check_clear(&mut self, rtv: CpuDescriptorHandle, target: NativeResourceId, color: [f32; 4]) -> CheckResult {
        let (heap, index) = self.objects.decode_cpu_handle(rtv).ok_or("invalid RTV handle")?;
        match self.objects.view_at(heap, index) {
            Some(ViewDesc::RenderTarget { resource, .. }) if *resource == target => {}
            _ => return Err(format!("RTV slot {index} does not reference the cleared resource")),
        }
        let res = self.resource(target)?;
        if !res.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
            return Err(format!("`{}` was not created with ALLOW_RENDER_TARGET", res.name));
        }
        self.require_state(target, ResourceState::RenderTarget, "render target")?;
        self.plan.effects.push(Effect::Fill { target, color });
        Ok(())
    }

    // region 加速结构

    fn check_as_build(&mut self, desc: &AsBuildDesc) -> CheckResult {
        let (dest, dest_res) = self.resource_at(desc.dest, "destination")?;
        self.require_state(dest, ResourceState::AccelerationStructure, "acceleration structure")?;
        let (scratch, _) = self.resource_at(desc.scratch, "scratch")?;
        if scratch == dest {
            return Err("scratch and destination share the same buffer".to_string());
        }
        self.require_state(scratch, ResourceState::UnorderedAccess, "scratch buffer")?;
        if desc.dest % 256 != 0 || desc.scratch % 256 != 0 {
            return Err("acceleration structure addresses must be 256-byte aligned".to_string());
        }
        if let Some(source) = desc.source {
            let (source, _) = self.resource_at(source, "update source")?;
            if self.as_record(source).is_none() {
                return Err("update source has never been built".to_string());
            }
        }

        match &desc.inputs {
            AsInputs::BottomLevel { geometries, .. } => {
                if geometries.is_empty() {
                    return Err("bottom level build without geometry".to_string());
                }
                for geometry in geometries {
                    let (vb, _) = self.resource_at(geometry.vertex_buffer, "vertex buffer")?;
                    self.require_readable(vb, "vertex buffer")?;
                    if geometry.index_count > 0 {
                        let (ib, _) = self.resource_at(geometry.index_buffer, "index buffer")?;
                        self.require_readable(ib, "index buffer")?;
                    }
                }
            }
            AsInputs::TopLevel {
                instance_descs,
                instance_count,
                ..
            } => self.check_instances(*instance_descs, *instance_count)?,
        }

        self.plan.as_builds.insert(
            dest.0,
            AsBuildRecord {
                top_level: desc.inputs.is_top_level(),
                uav_pending: true,
            },
        );
        self.plan.effects.push(Effect::WriteAsHeader {
            dest,
            offset: desc.dest - dest_res.gpu_address,
            top_level: desc.inputs.is_top_level(),
            input_count: desc.inputs.input_count(),
        });
        Ok(())
    }

    /// TLAS 引用的每个 BLAS 都必须在之前构建完成，并且经过了 UAV barrier
    fn check_instances(&self, instance_descs: GpuVirtualAddress, instance_count: u32) -> CheckResult {
        let (instances, instances_res) = self.resource_at(instance_descs, "instance descs")?;
        self.require_readable(instances, "instance buffer")?;

        let offset = (instance_descs - instances_res.gpu_address) as usize;
        let stride = size_of::<InstanceDesc>();
        let end = offset + stride * instance_count as usize;
        if end > instances_res.data.len() {
            return Err(format!("{instance_count} instances do not fit in `{}`", instances_res.name));
        }

        for (i, chunk) in instances_res.data[offset..end].chunks_exact(stride).enumerate() {
            let instance: InstanceDesc = bytemuck::pod_read_unaligned(chunk);
            let address = instance.acceleration_structure;
            let blas = self
                .objects
                .resources
                .iter()
                .find(|(_, r)| r.kind == SimResourceKind::Buffer && r.gpu_address == address)
                .map(|(id, _)| NativeResourceId(*id))
                .ok_or_else(|| format!("instance {i} references {address:#x}, which is not an acceleration structure"))?;
            match self.as_record(blas) {
                None => return Err(format!("instance {i} references a BLAS that has not been built")),
                Some(record) if record.top_level => return Err(format!("instance {i} references a top level AS")),
                Some(record) if record.uav_pending => {
                    return Err(format!("instance {i} references a BLAS without a UAV barrier after its build"));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    // endregion

    // region DispatchRays

    fn decode_bound_gpu_handle(&self, handle: GpuDescriptorHandle) -> CheckResult<(u64, u32)> {
        let (heap, index) = self.objects.decode_gpu_handle(handle).ok_or("invalid GPU descriptor handle")?;
        if !self.bound_heaps.contains(&heap) {
            return Err(format!("descriptor heap of handle {:#x} is not bound", handle.0));
        }
        Ok((heap, index))
    }

    fn bound_view(&self, handle: GpuDescriptorHandle) -> CheckResult<&'a ViewDesc> {
        let (heap, index) = self.decode_bound_gpu_handle(handle)?;
        self.objects.view_at(heap, index).ok_or_else(|| format!("descriptor slot {index} is empty"))
    }

    fn check_dispatch(&mut self, desc: &DispatchRaysDesc) -> CheckResult {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err("dispatch dimensions must be non-zero".to_string());
        }
        let pipeline = self.pipeline.ok_or("no state object bound")?;
        let root_signature = self.root_signature.ok_or("no global root signature bound")?;
        let state_object = &self.objects.state_objects[&pipeline];
        if state_object.desc.global_root_signature.0 != root_signature {
            return Err("bound root signature differs from the state object's global root signature".to_string());
        }

        // global root 参数：每个 table 都必须绑定，SRV 指向的加速结构必须是构建好的 TLAS
        let global = &self.objects.root_signatures[&root_signature];
        for (parameter, RootParameter::DescriptorTable(ranges)) in global.parameters.iter().enumerate() {
            let (heap, index) =
                *self.root_tables.get(&(parameter as u32)).ok_or_else(|| format!("root parameter {parameter} not bound"))?;
            if let Some(ViewDesc::AccelerationStructure { location }) = self.objects.view_at(heap, index) {
                let (tlas, _) = self.resource_at(*location, "TLAS")?;
                match self.as_record(tlas) {
                    Some(record) if record.top_level => {}
                    _ => return Err("global SRV does not reference a built TLAS".to_string()),
                }
            } else if ranges.iter().any(|r| r.range_type == DescriptorRangeType::Srv) {
                return Err(format!("root parameter {parameter} does not reference an acceleration structure"));
            }
        }

        let sim_desc = &state_object.desc;
        let ray_gen = desc.ray_generation;
        let ray_gen_records = self.read_table(
            GpuAddressRangeAndStride {
                start: ray_gen.start,
                size: ray_gen.size,
                stride: ray_gen.size,
            },
            "ray generation",
        )?;
        if ray_gen_records.len() != 1 {
            return Err("exactly one ray generation record is required".to_string());
        }
        let miss_records = self.read_table(desc.miss, "miss")?;
        let hit_records = self.read_table(desc.hit_group, "hit group")?;

        let mut output = None;
        for record in &ray_gen_records {
            let export = self.record_export(pipeline, record, &[ShaderStage::RayGeneration])?;
            for handle in self.record_handles(record, sim_desc, export)? {
                if let ViewDesc::Texture2dUav { resource, .. } = self.bound_view(handle)? {
                    self.require_state(*resource, ResourceState::UnorderedAccess, "ray tracing output")?;
                    output = Some(*resource);
                }
            }
        }
        for record in &miss_records {
            self.record_export(pipeline, record, &[ShaderStage::Miss])?;
        }
        for record in &hit_records {
            let export = self.record_export(pipeline, record, &[])?;
            for handle in self.record_handles(record, sim_desc, export)? {
                if let ViewDesc::StructuredBuffer { resource, .. } = self.bound_view(handle)? {
                    self.require_readable(*resource, "geometry buffer")?;
                }
            }
        }

        if let Some(output) = output {
            self.plan.effects.push(Effect::TraceGradient {
                output,
                width: desc.width,
                height: desc.height,
            });
        }
        Ok(())
    }

    /// 读取 shader table 的一个区域，按 stride 切分为 record
    fn read_table(&self, range: GpuAddressRangeAndStride, region: &str) -> CheckResult<Vec<Vec<u8>>> {
        if range.size == 0 {
            return Ok(Vec::new());
        }
        if range.start % self.caps.shader_table_alignment as u64 != 0 {
            return Err(format!("{region} table start {:#x} is not aligned", range.start));
        }
        if range.stride == 0
            || range.stride % self.caps.shader_record_alignment as u64 != 0
            || range.size % range.stride != 0
        {
            return Err(format!("{region} table has invalid size {} / stride {}", range.size, range.stride));
        }

        let (table, table_res) = self.resource_at(range.start, "shader table")?;
        self.require_readable(table, "shader table")?;
        let offset = (range.start - table_res.gpu_address) as usize;
        let end = offset + range.size as usize;
        if end > table_res.data.len() {
            return Err(format!("{region} table exceeds the shader table buffer"));
        }
        Ok(table_res.data[offset..end].chunks(range.stride as usize).map(<[u8]>::to_vec).collect())
    }

    /// record 开头的 identifier 对应的 export，`stages` 为空表示 hit group
    fn record_export(&self, pipeline: u64, record: &[u8], stages: &[ShaderStage]) -> CheckResult<&'a str> {
        let id_size = self.caps.shader_identifier_size as usize;
        let identifier = record.get(..id_size).ok_or("record shorter than a shader identifier")?;
        let state_object = &self.objects.state_objects[&pipeline];
        let export = state_object.export_of(identifier).ok_or("record does not start with a known shader identifier")?;

        let desc = &state_object.desc;
        let in_region = if stages.is_empty() {
            desc.hit_groups.iter().any(|h| h.export == export)
        } else {
            desc.library_exports.iter().any(|e| e.name == export && stages.contains(&e.stage))
        };
        if !in_region {
            return Err(format!("record for `{export}` is placed in the wrong table region"));
        }
        Ok(export)
    }

    fn record_handles(
        &self,
        record: &[u8],
        desc: &StateObjectDesc,
        export: &str,
    ) -> CheckResult<Vec<GpuDescriptorHandle>> {
        let id_size = self.caps.shader_identifier_size as usize;
        let args_size = desc.local_argument_size(export) as usize;
        let args = record
            .get(id_size..id_size + args_size)
            .ok_or_else(|| format!("record for `{export}` is too small for its local root arguments"))?;
        Ok(args
            .chunks_exact(RootParameter::DESCRIPTOR_TABLE_SIZE as usize)
            .map(|bytes| GpuDescriptorHandle(u64::from_le_bytes(bytes.try_into().unwrap_or_default())))
            .collect())
    }

    // endregion
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::BeginLabel(_) => "BeginEvent",
        Command::EndLabel => "EndEvent",
        Command::ResourceBarrier(_) => "ResourceBarrier",
        Command::CopyResource { .. } => "CopyResource",
        Command::CopyBufferRegion { .. } => "CopyBufferRegion",
        Command::ClearRenderTarget { .. } => "ClearRenderTargetView",
        Command::BuildAccelerationStructure(_) => "BuildRaytracingAccelerationStructure",
        Command::SetDescriptorHeaps(_) => "SetDescriptorHeaps",
        Command::SetComputeRootSignature(_) => "SetComputeRootSignature",
        Command::SetComputeRootDescriptorTable { .. } => "SetComputeRootDescriptorTable",
        Command::SetPipelineState(_) => "SetPipelineState1",
        Command::DispatchRays(_) => "DispatchRays",
    }
}
