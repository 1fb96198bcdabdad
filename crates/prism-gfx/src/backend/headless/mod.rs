//! 无需驱动的模拟后端
//!
//! - 提交时按照提交顺序跟踪资源状态，并校验 barrier、拷贝、加速结构构建与 DispatchRays 的前置条件
//! - GPU 时间线是惰性的：提交的命令与 signal 进入队列，只有在 `wait_fence`、`wait_idle`
//!   或者显式的 [`HeadlessBackend::step`] / [`HeadlessBackend::flush`] 时才会执行
//! - 记录事件日志，供测试检查提交与等待的次数

mod sim;
mod validation;

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    time::Duration,
};

use crate::{
    backend::{
        GfxBackend,
        descriptor_handle::{CPU_HANDLE_TAG, DESCRIPTOR_INCREMENT, GPU_HANDLE_TAG, capacity_fits, heap_start},
        headless::{
            sim::{
                Effect, GPU_ADDRESS_ALIGNMENT, GPU_ADDRESS_BASE, QueueOp, SimAllocator, SimDescriptorHeap, SimFence,
                SimObjects, SimResource, SimResourceKind, SimStateObject, make_shader_identifier, to_unorm8,
            },
            validation::CommandValidator,
        },
        types::{
            AllocatorId, AsInputs, AsPrebuildInfo, BufferDesc, CpuDescriptorHandle, DescriptorHeapDesc,
            DescriptorHeapId, DescriptorHeapInfo, DescriptorHeapType, FenceId, FenceWait, Format, GpuDescriptorHandle,
            HeapType, NativeResource, NativeResourceId, RayTracingCaps, ResourceFlags, ResourceState, RootSignatureId,
            ShaderIdentifier, StateObjectId, TextureDesc, ViewDesc,
        },
    },
    basic::align::align_up,
    commands::command_list::Command,
    error::{GfxResult, GraphicsError},
    pipelines::{
        root_signature::{RootSignatureDesc, RootSignatureKind},
        shader::ShaderBlob,
        state_object::StateObjectDesc,
    },
};

/// 模拟后端记录的事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadlessEvent {
    ResetAllocator(AllocatorId),
    Submit { allocator: AllocatorId, command_count: usize },
    Signal { fence: FenceId, value: u64 },
    Wait { fence: FenceId, value: u64 },
    FenceCompleted { fence: FenceId, value: u64 },
}

/// 事件日志只保留最近的这些条目
pub const MAX_RECORDED_EVENTS: usize = 1024;

#[derive(Default)]
struct HeadlessState {
    objects: SimObjects,
    queue: VecDeque<QueueOp>,
    events: VecDeque<HeadlessEvent>,
    submit_count: usize,
    wait_count: usize,
    next_address: u64,
    /// 执行过程中出现错误后设备进入丢失状态
    lost: Option<String>,
}

impl HeadlessState {
    fn record(&mut self, event: HeadlessEvent) {
        match &event {
            HeadlessEvent::Submit { .. } => self.submit_count += 1,
            HeadlessEvent::Wait { .. } => self.wait_count += 1,
            _ => {}
        }
        if self.events.len() == MAX_RECORDED_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

pub struct HeadlessBackend {
    state: RefCell<HeadlessState>,
    next_id: Cell<u64>,
    caps: RayTracingCaps,
    /// 模拟 GPU 卡死：队列不再推进，等待会超时
    stalled: Cell<bool>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        log::info!("headless backend created");
        Self {
            state: RefCell::new(HeadlessState {
                next_address: GPU_ADDRESS_BASE,
                ..Default::default()
            }),
            next_id: Cell::new(1),
            caps: RayTracingCaps::D3D12,
            stalled: Cell::new(false),
        }
    }

    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn check_alive(state: &HeadlessState) -> GfxResult<()> {
        match &state.lost {
            Some(reason) => Err(GraphicsError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}

// 测试与调试用的接口
impl HeadlessBackend {
    pub fn set_gpu_stalled(&self, stalled: bool) {
        self.stalled.set(stalled);
    }

    /// GPU 执行队列中的下一个操作，队列为空时返回 false
    pub fn step(&self) -> GfxResult<bool> {
        let mut state = self.state.borrow_mut();
        Self::check_alive(&state)?;
        Self::execute_next(&mut state)
    }

    /// 执行队列中所有的操作
    pub fn flush(&self) -> GfxResult<()> {
        while self.step()? {}
        Ok(())
    }

    pub fn pending_operations(&self) -> usize {
        self.state.borrow().queue.len()
    }

    /// 最近的 [`MAX_RECORDED_EVENTS`] 条事件，按发生顺序排列
    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.state.borrow().events.iter().cloned().collect()
    }

    /// 只清空事件日志，提交与等待的计数不受影响
    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn submit_count(&self) -> usize {
        self.state.borrow().submit_count
    }

    pub fn wait_count(&self) -> usize {
        self.state.borrow().wait_count
    }

    /// 提交时刻跟踪的资源状态
    pub fn resource_state(&self, resource: NativeResourceId) -> Option<ResourceState> {
        self.state.borrow().objects.resources.get(&resource.0).map(|r| r.state)
    }

    /// 资源在 GPU 上的内容，不限制 heap 类型
    pub fn resource_data(&self, resource: NativeResourceId) -> Option<Vec<u8>> {
        self.state.borrow().objects.resources.get(&resource.0).map(|r| r.data.clone())
    }

    pub fn live_resource_count(&self) -> usize {
        self.state.borrow().objects.resources.len()
    }

    pub fn descriptor_view(&self, heap: DescriptorHeapId, index: u32) -> Option<ViewDesc> {
        self.state.borrow().objects.view_at(heap.0, index).cloned()
    }
}

// GPU 时间线
impl HeadlessBackend {
    fn execute_next(state: &mut HeadlessState) -> GfxResult<bool> {
        let Some(op) = state.queue.pop_front() else {
            return Ok(false);
        };
        match op {
            QueueOp::Execute { allocator, effects } => {
                for effect in &effects {
                    if let Err(reason) = Self::apply_effect(&mut state.objects, effect) {
                        log::error!("headless GPU fault: {reason}");
                        state.lost = Some(reason.clone());
                        return Err(GraphicsError::DeviceLost(reason));
                    }
                }
                if let Some(alloc) = state.objects.allocators.get_mut(&allocator.0) {
                    alloc.executing = alloc.executing.saturating_sub(1);
                }
            }
            QueueOp::Signal { fence, value } => {
                if let Some(sim) = state.objects.fences.get_mut(&fence.0) {
                    sim.completed = value;
                    state.record(HeadlessEvent::FenceCompleted { fence, value });
                }
            }
        }
        Ok(true)
    }

    fn apply_effect(objects: &mut SimObjects, effect: &Effect) -> Result<(), String> {
        let missing = |id: NativeResourceId| format!("resource #{} was destroyed while in use by the GPU", id.0);
        match *effect {
            Effect::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                let bytes = objects
                    .resources
                    .get(&src.0)
                    .ok_or_else(|| missing(src))?
                    .data
                    .get(src_offset as usize..(src_offset + size) as usize)
                    .ok_or("copy source range out of bounds")?
                    .to_vec();
                let dst_res = objects.resources.get_mut(&dst.0).ok_or_else(|| missing(dst))?;
                dst_res
                    .data
                    .get_mut(dst_offset as usize..(dst_offset + size) as usize)
                    .ok_or("copy destination range out of bounds")?
                    .copy_from_slice(&bytes);
            }
            Effect::Fill { target, color } => {
                let res = objects.resources.get_mut(&target.0).ok_or_else(|| missing(target))?;
                let texel = texel_bytes(res.kind, color);
                for chunk in res.data.chunks_exact_mut(texel.len().max(1)) {
                    chunk.copy_from_slice(&texel);
                }
            }
            Effect::WriteAsHeader {
                dest,
                offset,
                top_level,
                input_count,
            } => {
                let res = objects.resources.get_mut(&dest.0).ok_or_else(|| missing(dest))?;
                let mut header = Vec::with_capacity(8);
                header.extend_from_slice(if top_level { b"TLAS" } else { b"BLAS" });
                header.extend_from_slice(&input_count.to_le_bytes());
                let offset = offset as usize;
                res.data
                    .get_mut(offset..offset + header.len())
                    .ok_or("acceleration structure buffer too small")?
                    .copy_from_slice(&header);
            }
            Effect::TraceGradient { output, width, height } => {
                let res = objects.resources.get_mut(&output.0).ok_or_else(|| missing(output))?;
                let SimResourceKind::Texture {
                    width: tex_width,
                    height: tex_height,
                    ..
                } = res.kind
                else {
                    return Err("ray tracing output is not a texture".to_string());
                };
                let bpp = (res.data.len() as u64 / (tex_width as u64 * tex_height as u64).max(1)) as usize;
                for y in 0..height.min(tex_height) {
                    for x in 0..width.min(tex_width) {
                        let u = x as f32 / (width.max(2) - 1) as f32;
                        let v = y as f32 / (height.max(2) - 1) as f32;
                        let texel = texel_bytes(res.kind, [u, v, 0.0, 1.0]);
                        let offset = (y as usize * tex_width as usize + x as usize) * bpp;
                        if let Some(dst) = res.data.get_mut(offset..offset + texel.len()) {
                            dst.copy_from_slice(&texel);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 推进 GPU 时间线直到 fence 达到目标值，或者队列为空
    fn drain_until(state: &mut HeadlessState, fence: FenceId, value: u64) -> GfxResult<bool> {
        loop {
            let completed = state.objects.fences.get(&fence.0).map_or(0, |f| f.completed);
            if completed >= value {
                return Ok(true);
            }
            if !Self::execute_next(state)? {
                return Ok(false);
            }
        }
    }
}

/// 一个像素的字节表示
fn texel_bytes(kind: SimResourceKind, color: [f32; 4]) -> Vec<u8> {
    let [r, g, b, a] = color.map(to_unorm8);
    match kind {
        SimResourceKind::Texture {
            format: Format::Bgra8Unorm,
            ..
        } => vec![b, g, r, a],
        SimResourceKind::Texture {
            format: Format::Rgba8Unorm,
            ..
        } => vec![r, g, b, a],
        SimResourceKind::Texture { format, .. } => vec![r; format.bytes_per_element() as usize],
        SimResourceKind::Buffer => vec![r],
    }
}

impl GfxBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn ray_tracing_caps(&self) -> RayTracingCaps {
        self.caps
    }

    // region command allocator & queue

    fn create_command_allocator(&self, name: &str) -> GfxResult<AllocatorId> {
        let id = self.alloc_id();
        self.state.borrow_mut().objects.allocators.insert(
            id,
            SimAllocator {
                name: name.to_string(),
                executing: 0,
            },
        );
        log::debug!("command allocator `{name}` created");
        Ok(AllocatorId(id))
    }

    fn reset_command_allocator(&self, allocator: AllocatorId) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        Self::check_alive(&state)?;
        let sim = state
            .objects
            .allocators
            .get(&allocator.0)
            .ok_or_else(|| GraphicsError::device_call("ResetCommandAllocator", "unknown allocator"))?;
        if sim.executing > 0 {
            return Err(GraphicsError::device_call(
                "ResetCommandAllocator",
                format!("allocator `{}` still has {} command list(s) executing", sim.name, sim.executing),
            ));
        }
        state.record(HeadlessEvent::ResetAllocator(allocator));
        Ok(())
    }

    fn destroy_command_allocator(&self, allocator: AllocatorId) {
        self.state.borrow_mut().objects.allocators.remove(&allocator.0);
    }

    fn execute_command_list(&self, allocator: AllocatorId, commands: &[Command]) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        Self::check_alive(&state)?;
        if !state.objects.allocators.contains_key(&allocator.0) {
            return Err(GraphicsError::device_call("ExecuteCommandLists", "unknown allocator"));
        }

        let plan = CommandValidator::new(&state.objects, self.caps).validate(commands)?;
        for (id, resource_state) in plan.states {
            if let Some(res) = state.objects.resources.get_mut(&id) {
                res.state = resource_state;
            }
        }
        for (id, record) in plan.as_builds {
            if let Some(res) = state.objects.resources.get_mut(&id) {
                res.as_build = Some(record);
            }
        }
        if let Some(alloc) = state.objects.allocators.get_mut(&allocator.0) {
            alloc.executing += 1;
        }
        state.queue.push_back(QueueOp::Execute {
            allocator,
            effects: plan.effects,
        });
        state.record(HeadlessEvent::Submit {
            allocator,
            command_count: commands.len(),
        });
        Ok(())
    }

    // endregion

    // region fence

    fn create_fence(&self, initial_value: u64, name: &str) -> GfxResult<FenceId> {
        let id = self.alloc_id();
        self.state.borrow_mut().objects.fences.insert(
            id,
            SimFence {
                name: name.to_string(),
                completed: initial_value,
            },
        );
        log::debug!("fence `{name}` created");
        Ok(FenceId(id))
    }

    fn signal_fence(&self, fence: FenceId, value: u64) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        Self::check_alive(&state)?;
        if !state.objects.fences.contains_key(&fence.0) {
            return Err(GraphicsError::device_call("Signal", "unknown fence"));
        }
        state.queue.push_back(QueueOp::Signal { fence, value });
        state.record(HeadlessEvent::Signal { fence, value });
        Ok(())
    }

    fn fence_completed_value(&self, fence: FenceId) -> GfxResult<u64> {
        let state = self.state.borrow();
        Self::check_alive(&state)?;
        state
            .objects
            .fences
            .get(&fence.0)
            .map(|f| f.completed)
            .ok_or_else(|| GraphicsError::device_call("GetCompletedValue", "unknown fence"))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Duration) -> GfxResult<FenceWait> {
        let mut state = self.state.borrow_mut();
        Self::check_alive(&state)?;
        let fence_name = state
            .objects
            .fences
            .get(&fence.0)
            .map(|f| f.name.clone())
            .ok_or_else(|| GraphicsError::device_call("SetEventOnCompletion", "unknown fence"))?;
        state.record(HeadlessEvent::Wait { fence, value });

        if self.stalled.get() {
            let completed = state.objects.fences[&fence.0].completed;
            if completed >= value {
                return Ok(FenceWait::Reached);
            }
            log::warn!("fence `{fence_name}` stalled at {completed}, {timeout:?} elapsed waiting for {value}");
            return Ok(FenceWait::TimedOut);
        }
        if Self::drain_until(&mut state, fence, value)? {
            Ok(FenceWait::Reached)
        } else {
            // 没有任何排队的 signal 能让 fence 达到目标值，真实的 GPU 会一直等下去
            Ok(FenceWait::TimedOut)
        }
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.borrow_mut().objects.fences.remove(&fence.0);
    }

    fn wait_idle(&self) -> GfxResult<()> {
        if self.stalled.get() && self.pending_operations() > 0 {
            return Err(GraphicsError::DeviceLost("queue stalled while waiting for idle".to_string()));
        }
        self.flush()
    }

    // endregion

    // region resource

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<NativeResource> {
        if desc.size == 0 {
            return Err(GraphicsError::device_call("CreateCommittedResource", format!("`{}` has zero size", desc.name)));
        }
        match (desc.heap, desc.initial_state) {
            (HeapType::Upload, ResourceState::GenericRead) | (HeapType::Readback, ResourceState::CopyDest) => {}
            (HeapType::Default, _) => {}
            (heap, state) => {
                return Err(GraphicsError::device_call(
                    "CreateCommittedResource",
                    format!("`{}`: {heap:?} heap resources cannot start in {state:?}", desc.name),
                ));
            }
        }
        if desc.initial_state == ResourceState::UnorderedAccess
            && !desc.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS)
        {
            return Err(GraphicsError::device_call(
                "CreateCommittedResource",
                format!("`{}` starts in UnorderedAccess without ALLOW_UNORDERED_ACCESS", desc.name),
            ));
        }

        let id = self.alloc_id();
        let mut state = self.state.borrow_mut();
        let gpu_address = state.next_address;
        state.next_address = gpu_address + align_up(desc.size, GPU_ADDRESS_ALIGNMENT)?;
        state.objects.resources.insert(
            id,
            SimResource {
                name: desc.name.clone(),
                kind: SimResourceKind::Buffer,
                heap: desc.heap,
                flags: desc.flags,
                gpu_address,
                data: vec![0; desc.size as usize],
                state: desc.initial_state,
                as_build: None,
            },
        );
        Ok(NativeResource {
            id: NativeResourceId(id),
            gpu_address,
            size: desc.size,
        })
    }

    fn create_texture_2d(&self, desc: &TextureDesc) -> GfxResult<NativeResource> {
        if desc.width == 0 || desc.height == 0 || desc.format == Format::Unknown {
            return Err(GraphicsError::device_call(
                "CreateCommittedResource",
                format!("`{}`: invalid texture {}x{} {:?}", desc.name, desc.width, desc.height, desc.format),
            ));
        }
        let id = self.alloc_id();
        self.state.borrow_mut().objects.resources.insert(
            id,
            SimResource {
                name: desc.name.clone(),
                kind: SimResourceKind::Texture {
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                },
                heap: HeapType::Default,
                flags: desc.flags,
                gpu_address: 0,
                data: vec![0; desc.byte_size() as usize],
                state: desc.initial_state,
                as_build: None,
            },
        );
        Ok(NativeResource {
            id: NativeResourceId(id),
            gpu_address: 0,
            size: desc.byte_size(),
        })
    }

    fn write_host_visible(&self, resource: NativeResourceId, offset: u64, data: &[u8]) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let res = state
            .objects
            .resources
            .get_mut(&resource.0)
            .ok_or_else(|| GraphicsError::device_call("Map", "unknown resource"))?;
        if !res.heap.is_host_visible() {
            return Err(GraphicsError::device_call("Map", format!("`{}` is not host visible", res.name)));
        }
        let name = res.name.clone();
        let dst = res
            .data
            .get_mut(offset as usize..offset as usize + data.len())
            .ok_or_else(|| GraphicsError::device_call("Map", format!("write out of bounds of `{name}`")))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_host_visible(&self, resource: NativeResourceId, offset: u64, size: u64) -> GfxResult<Vec<u8>> {
        let state = self.state.borrow();
        let res = state
            .objects
            .resources
            .get(&resource.0)
            .ok_or_else(|| GraphicsError::device_call("Map", "unknown resource"))?;
        if !res.heap.is_host_visible() {
            return Err(GraphicsError::device_call("Map", format!("`{}` is not host visible", res.name)));
        }
        res.data
            .get(offset as usize..(offset + size) as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| GraphicsError::device_call("Map", format!("read out of bounds of `{}`", res.name)))
    }

    fn destroy_resource(&self, resource: NativeResourceId) {
        if let Some(res) = self.state.borrow_mut().objects.resources.remove(&resource.0) {
            log::debug!("resource `{}` destroyed", res.name);
        }
    }

    // endregion

    // region descriptor

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<DescriptorHeapInfo> {
        if desc.capacity == 0 {
            return Err(GraphicsError::device_call("CreateDescriptorHeap", "capacity must be non-zero"));
        }
        if desc.shader_visible && !desc.ty.can_be_shader_visible() {
            return Err(GraphicsError::device_call(
                "CreateDescriptorHeap",
                format!("{:?} heaps cannot be shader visible", desc.ty),
            ));
        }
        if !capacity_fits(desc.capacity) {
            return Err(GraphicsError::device_call("CreateDescriptorHeap", "capacity too large"));
        }

        let id = self.alloc_id();
        self.state.borrow_mut().objects.heaps.insert(
            id,
            SimDescriptorHeap {
                desc: desc.clone(),
                slots: vec![None; desc.capacity as usize],
            },
        );
        Ok(DescriptorHeapInfo {
            id: DescriptorHeapId(id),
            cpu_start: CpuDescriptorHandle(heap_start(CPU_HANDLE_TAG, id)),
            gpu_start: desc.shader_visible.then(|| GpuDescriptorHandle(heap_start(GPU_HANDLE_TAG, id))),
            increment: DESCRIPTOR_INCREMENT,
        })
    }

    fn write_descriptor(&self, heap: DescriptorHeapId, index: u32, view: &ViewDesc) -> GfxResult<()> {
        let mut state = self.state.borrow_mut();
        let fail = |reason: String| GraphicsError::device_call("CreateView", reason);

        let heap_type = state.objects.heaps.get(&heap.0).ok_or_else(|| fail("unknown heap".to_string()))?.desc.ty;
        let (expected_heap, resource, flag) = match view {
            ViewDesc::StructuredBuffer { resource, .. } => (DescriptorHeapType::CbvSrvUav, Some(*resource), None),
            ViewDesc::AccelerationStructure { location } => {
                if state.objects.resource_at(*location).is_none() {
                    return Err(fail(format!("no buffer at {location:#x}")));
                }
                (DescriptorHeapType::CbvSrvUav, None, None)
            }
            ViewDesc::Texture2dUav { resource, .. } => {
                (DescriptorHeapType::CbvSrvUav, Some(*resource), Some(ResourceFlags::ALLOW_UNORDERED_ACCESS))
            }
            ViewDesc::RenderTarget { resource, .. } => {
                (DescriptorHeapType::Rtv, Some(*resource), Some(ResourceFlags::ALLOW_RENDER_TARGET))
            }
        };
        if heap_type != expected_heap {
            return Err(fail(format!("{view:?} cannot be written into a {heap_type:?} heap")));
        }
        if let Some(resource) = resource {
            let res = state.objects.resources.get(&resource.0).ok_or_else(|| fail("unknown resource".to_string()))?;
            if let Some(flag) = flag.filter(|f| !res.flags.contains(*f)) {
                return Err(fail(format!("`{}` was not created with {flag:?}", res.name)));
            }
        }

        let sim_heap = state.objects.heaps.get_mut(&heap.0).ok_or_else(|| fail("unknown heap".to_string()))?;
        let slot = sim_heap
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| fail(format!("slot {index} out of range")))?;
        *slot = Some(view.clone());
        Ok(())
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) {
        self.state.borrow_mut().objects.heaps.remove(&heap.0);
    }

    // endregion

    // region ray tracing

    fn acceleration_structure_prebuild_info(&self, inputs: &AsInputs) -> GfxResult<AsPrebuildInfo> {
        let (result, scratch) = match inputs {
            AsInputs::BottomLevel { geometries, .. } => {
                if geometries.is_empty() {
                    return Err(GraphicsError::device_call(
                        "GetRaytracingAccelerationStructurePrebuildInfo",
                        "no geometry",
                    ));
                }
                let triangles: u64 = geometries.iter().map(|g| g.triangle_count() as u64).sum();
                let vertices: u64 = geometries.iter().map(|g| g.vertex_count as u64).sum();
                (128 + 64 * triangles + 16 * vertices, 256 + 32 * triangles)
            }
            AsInputs::TopLevel { instance_count, .. } => {
                // 对齐之后 result 总是大于 scratch
                (256 + 128 * *instance_count as u64, 64 + 32 * *instance_count as u64)
            }
        };
        let update = if inputs.flags().contains(crate::backend::types::AsBuildFlags::ALLOW_UPDATE) {
            align_up(scratch / 2, 256)?
        } else {
            0
        };
        Ok(AsPrebuildInfo {
            result_data_max_size: align_up(result, 256)?,
            scratch_data_size: align_up(scratch, 256)?,
            update_scratch_data_size: update,
        })
    }

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId> {
        let id = self.alloc_id();
        self.state.borrow_mut().objects.root_signatures.insert(id, desc.clone());
        log::debug!("root signature `{}` created ({} parameters)", desc.name, desc.parameters.len());
        Ok(RootSignatureId(id))
    }

    fn destroy_root_signature(&self, root_signature: RootSignatureId) {
        self.state.borrow_mut().objects.root_signatures.remove(&root_signature.0);
    }

    fn create_state_object(&self, desc: &StateObjectDesc, library: &ShaderBlob) -> GfxResult<StateObjectId> {
        let fail = |reason: String| GraphicsError::device_call("CreateStateObject", reason);
        if library.bytecode().is_empty() {
            return Err(fail("empty DXIL library".to_string()));
        }

        let mut state = self.state.borrow_mut();
        let root_kind = |id: RootSignatureId| state.objects.root_signatures.get(&id.0).map(|r| r.kind);
        if root_kind(desc.global_root_signature) != Some(RootSignatureKind::Global) {
            return Err(fail("global root signature is missing or not global".to_string()));
        }
        for association in &desc.local_root_signatures {
            if root_kind(association.root_signature) != Some(RootSignatureKind::Local) {
                return Err(fail(format!("local root signature for {:?} is missing or not local", association.exports)));
            }
        }

        let id = self.alloc_id();
        let identifiers = desc
            .identifiable_exports()
            .map(|export| {
                (export.to_string(), make_shader_identifier(id, export, self.caps.shader_identifier_size))
            })
            .collect();
        state.objects.state_objects.insert(
            id,
            SimStateObject {
                desc: desc.clone(),
                identifiers,
            },
        );
        Ok(StateObjectId(id))
    }

    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<ShaderIdentifier> {
        self.state.borrow().objects.state_objects.get(&state_object.0)?.identifiers.get(export).cloned()
    }

    fn destroy_state_object(&self, state_object: StateObjectId) {
        self.state.borrow_mut().objects.state_objects.remove(&state_object.0);
    }

    // endregion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::barrier::ResourceBarrier;

    fn upload_buffer(backend: &HeadlessBackend, size: u64) -> NativeResource {
        backend
            .create_buffer(&BufferDesc {
                size,
                heap: HeapType::Upload,
                flags: ResourceFlags::empty(),
                initial_state: ResourceState::GenericRead,
                name: "upload".to_string(),
            })
            .unwrap()
    }

    fn default_buffer(backend: &HeadlessBackend, size: u64, state: ResourceState) -> NativeResource {
        backend
            .create_buffer(&BufferDesc {
                size,
                heap: HeapType::Default,
                flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
                initial_state: state,
                name: "default".to_string(),
            })
            .unwrap()
    }

    #[test]
    fn test_queue_is_lazy_until_wait() {
        let backend = HeadlessBackend::new();
        let allocator = backend.create_command_allocator("alloc").unwrap();
        let fence = backend.create_fence(0, "fence").unwrap();

        backend.execute_command_list(allocator, &[]).unwrap();
        backend.signal_fence(fence, 1).unwrap();
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 0);
        assert!(backend.reset_command_allocator(allocator).is_err());

        assert_eq!(backend.wait_fence(fence, 1, Duration::from_secs(1)).unwrap(), FenceWait::Reached);
        assert_eq!(backend.fence_completed_value(fence).unwrap(), 1);
        backend.reset_command_allocator(allocator).unwrap();
    }

    #[test]
    fn test_wait_without_signal_times_out() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(0, "fence").unwrap();
        assert_eq!(backend.wait_fence(fence, 1, Duration::from_millis(1)).unwrap(), FenceWait::TimedOut);

        backend.signal_fence(fence, 1).unwrap();
        backend.set_gpu_stalled(true);
        assert_eq!(backend.wait_fence(fence, 1, Duration::from_millis(1)).unwrap(), FenceWait::TimedOut);
        backend.set_gpu_stalled(false);
        assert_eq!(backend.wait_fence(fence, 1, Duration::from_millis(1)).unwrap(), FenceWait::Reached);
    }

    #[test]
    fn test_copy_executes_on_gpu_timeline() {
        let backend = HeadlessBackend::new();
        let allocator = backend.create_command_allocator("alloc").unwrap();
        let src = upload_buffer(&backend, 16);
        let dst = default_buffer(&backend, 16, ResourceState::CopyDest);
        backend.write_host_visible(src.id, 0, &[7; 16]).unwrap();

        backend.execute_command_list(allocator, &[Command::CopyResource { dst: dst.id, src: src.id }]).unwrap();
        assert_eq!(backend.resource_data(dst.id).unwrap(), vec![0; 16]);
        backend.flush().unwrap();
        assert_eq!(backend.resource_data(dst.id).unwrap(), vec![7; 16]);
    }

    #[test]
    fn test_barrier_before_state_must_match() {
        let backend = HeadlessBackend::new();
        let allocator = backend.create_command_allocator("alloc").unwrap();
        let buffer = default_buffer(&backend, 16, ResourceState::CopyDest);

        let wrong = [Command::ResourceBarrier(vec![ResourceBarrier::transition(
            buffer.id,
            ResourceState::UnorderedAccess,
            ResourceState::CopySource,
        )])];
        let err = backend.execute_command_list(allocator, &wrong).unwrap_err();
        assert!(matches!(err, GraphicsError::DeviceCallFailed { call: "ExecuteCommandLists", .. }));
        // 失败的提交不会改变状态
        assert_eq!(backend.resource_state(buffer.id), Some(ResourceState::CopyDest));
        assert_eq!(backend.submit_count(), 0);

        let right = [Command::ResourceBarrier(vec![ResourceBarrier::transition(
            buffer.id,
            ResourceState::CopyDest,
            ResourceState::CopySource,
        )])];
        backend.execute_command_list(allocator, &right).unwrap();
        assert_eq!(backend.resource_state(buffer.id), Some(ResourceState::CopySource));
    }

    #[test]
    fn test_copy_requires_copy_dest() {
        let backend = HeadlessBackend::new();
        let allocator = backend.create_command_allocator("alloc").unwrap();
        let src = upload_buffer(&backend, 16);
        let dst = default_buffer(&backend, 16, ResourceState::NonPixelShaderResource);
        assert!(backend.execute_command_list(allocator, &[Command::CopyResource { dst: dst.id, src: src.id }]).is_err());
    }

    #[test]
    fn test_descriptor_heap_rules() {
        let backend = HeadlessBackend::new();
        let rtv_visible = DescriptorHeapDesc {
            ty: DescriptorHeapType::Rtv,
            capacity: 4,
            shader_visible: true,
            name: "rtv".to_string(),
        };
        assert!(backend.create_descriptor_heap(&rtv_visible).is_err());

        let heap = backend
            .create_descriptor_heap(&DescriptorHeapDesc {
                ty: DescriptorHeapType::CbvSrvUav,
                capacity: 4,
                shader_visible: true,
                name: "srv".to_string(),
            })
            .unwrap();
        assert!(heap.gpu_start.is_some_and(|h| !h.is_null()));

        let buffer = upload_buffer(&backend, 64);
        let view = ViewDesc::StructuredBuffer {
            resource: buffer.id,
            first_element: 0,
            num_elements: 4,
            stride: 16,
        };
        backend.write_descriptor(heap.id, 3, &view).unwrap();
        assert_eq!(backend.descriptor_view(heap.id, 3), Some(view.clone()));
        assert!(backend.write_descriptor(heap.id, 4, &view).is_err());
    }

    #[test]
    fn test_event_log_is_bounded_on_long_runs() {
        let backend = HeadlessBackend::new();
        let allocator = backend.create_command_allocator("alloc").unwrap();
        let fence = backend.create_fence(0, "fence").unwrap();

        let frames = 2 * MAX_RECORDED_EVENTS as u64;
        for value in 1..=frames {
            backend.execute_command_list(allocator, &[]).unwrap();
            backend.signal_fence(fence, value).unwrap();
            assert_eq!(backend.wait_fence(fence, value, Duration::from_secs(1)).unwrap(), FenceWait::Reached);
        }

        let events = backend.events();
        assert_eq!(events.len(), MAX_RECORDED_EVENTS);
        assert_eq!(events.last(), Some(&HeadlessEvent::FenceCompleted { fence, value: frames }));
        assert_eq!(backend.submit_count(), frames as usize);
        assert_eq!(backend.wait_count(), frames as usize);

        backend.clear_events();
        assert!(backend.events().is_empty());
        assert_eq!(backend.submit_count(), frames as usize);
    }

    #[test]
    fn test_prebuild_sizes_are_aligned_and_distinct() {
        let backend = HeadlessBackend::new();
        for instance_count in [1, 2, 3, 4, 8, 100] {
            let info = backend
                .acceleration_structure_prebuild_info(&AsInputs::TopLevel {
                    instance_descs: 0,
                    instance_count,
                    flags: crate::backend::types::AsBuildFlags::ALLOW_UPDATE,
                })
                .unwrap();
            assert_eq!(info.result_data_max_size % 256, 0);
            assert_eq!(info.scratch_data_size % 256, 0);
            assert_ne!(info.result_data_max_size, info.scratch_data_size, "{instance_count} instances");
            assert!(info.update_scratch_data_size > 0);
        }
    }
}
