use crate::{
    backend::types::{
        AsBuildDesc, CpuDescriptorHandle, DescriptorHeapId, DispatchRaysDesc, GpuDescriptorHandle, NativeResourceId,
        RootSignatureId, StateObjectId,
    },
    commands::barrier::ResourceBarrier,
};

/// command list 中记录的一条命令
///
/// 命令先在 CPU 侧记录，`Close` 时由后端翻译为原生命令并提交。
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BeginLabel(String),
    EndLabel,
    ResourceBarrier(Vec<ResourceBarrier>),
    /// 整个资源的拷贝，两者的尺寸必须一致
    CopyResource {
        dst: NativeResourceId,
        src: NativeResourceId,
    },
    CopyBufferRegion {
        dst: NativeResourceId,
        dst_offset: u64,
        src: NativeResourceId,
        src_offset: u64,
        size: u64,
    },
    ClearRenderTarget {
        rtv: CpuDescriptorHandle,
        target: NativeResourceId,
        color: [f32; 4],
    },
    BuildAccelerationStructure(AsBuildDesc),
    SetDescriptorHeaps(Vec<DescriptorHeapId>),
    SetComputeRootSignature(RootSignatureId),
    SetComputeRootDescriptorTable {
        parameter: u32,
        handle: GpuDescriptorHandle,
    },
    SetPipelineState(StateObjectId),
    DispatchRays(DispatchRaysDesc),
}

/// 唯一的 command list，由 [`CommandCycler`](super::command_cycler::CommandCycler) 持有
#[derive(Debug)]
pub struct GfxCommandList {
    commands: Vec<Command>,
    name: String,
}

impl GfxCommandList {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            commands: Vec::new(),
            name: name.into(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// 丢弃已经记录的命令，对应 command list 针对新的 allocator 重新 reset
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.commands.clear();
    }
}

// debug 相关命令
impl GfxCommandList {
    pub fn begin_label(&mut self, label: impl Into<String>) {
        self.commands.push(Command::BeginLabel(label.into()));
    }

    pub fn end_label(&mut self) {
        self.commands.push(Command::EndLabel);
    }
}

// 同步相关命令
impl GfxCommandList {
    /// 空的 barrier 数组以及 before == after 的转换会被忽略
    pub fn resource_barrier(&mut self, barriers: &[ResourceBarrier]) {
        let barriers: Vec<_> = barriers.iter().filter(|b| !b.is_noop()).copied().collect();
        if barriers.is_empty() {
            return;
        }
        self.commands.push(Command::ResourceBarrier(barriers));
    }
}

// 数据传输类型的命令
impl GfxCommandList {
    /// - command type: action
    pub fn copy_resource(&mut self, dst: NativeResourceId, src: NativeResourceId) {
        self.commands.push(Command::CopyResource { dst, src });
    }

    /// - command type: action
    pub fn copy_buffer_region(
        &mut self,
        dst: NativeResourceId,
        dst_offset: u64,
        src: NativeResourceId,
        src_offset: u64,
        size: u64,
    ) {
        self.commands.push(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }

    /// - command type: action
    pub fn clear_render_target_view(&mut self, rtv: CpuDescriptorHandle, target: NativeResourceId, color: [f32; 4]) {
        self.commands.push(Command::ClearRenderTarget { rtv, target, color });
    }
}

// 绑定相关命令
impl GfxCommandList {
    /// - command type: state
    pub fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapId]) {
        self.commands.push(Command::SetDescriptorHeaps(heaps.to_vec()));
    }

    /// - command type: state
    pub fn set_compute_root_signature(&mut self, root_signature: RootSignatureId) {
        self.commands.push(Command::SetComputeRootSignature(root_signature));
    }

    /// - command type: state
    pub fn set_compute_root_descriptor_table(&mut self, parameter: u32, handle: GpuDescriptorHandle) {
        self.commands.push(Command::SetComputeRootDescriptorTable { parameter, handle });
    }

    /// - command type: state
    pub fn set_pipeline_state(&mut self, state_object: StateObjectId) {
        self.commands.push(Command::SetPipelineState(state_object));
    }
}

// 光追相关命令
impl GfxCommandList {
    /// - command type: action
    pub fn build_acceleration_structure(&mut self, desc: AsBuildDesc) {
        self.commands.push(Command::BuildAccelerationStructure(desc));
    }

    /// - command type: action
    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) {
        self.commands.push(Command::DispatchRays(desc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::ResourceState;

    #[test]
    fn test_noop_barriers_are_dropped() {
        let mut cmd = GfxCommandList::new("test");
        let res = NativeResourceId(1);
        cmd.resource_barrier(&[ResourceBarrier::transition(res, ResourceState::Present, ResourceState::Present)]);
        assert!(cmd.is_empty());

        cmd.resource_barrier(&[
            ResourceBarrier::transition(res, ResourceState::Present, ResourceState::Present),
            ResourceBarrier::transition(res, ResourceState::Present, ResourceState::CopyDest),
        ]);
        assert_eq!(
            cmd.commands(),
            &[Command::ResourceBarrier(vec![ResourceBarrier::transition(
                res,
                ResourceState::Present,
                ResourceState::CopyDest
            )])]
        );
    }
}
