//! 设备边界
//!
//! 上层所有的设备调用都经过 [`GfxBackend`]：
//! - [`headless::HeadlessBackend`]：模拟的 GPU 时间线，带状态校验，不依赖驱动
//! - `vulkan::VulkanBackend`：基于 ash + vk-mem 的实现，需要开启 `vulkan` feature
//!
//! 后端通过 `Rc<dyn GfxBackend>` 共享，方法都是 `&self`，内部状态使用内部可变性。

use std::time::Duration;

use crate::{
    backend::types::{
        AllocatorId, AsInputs, AsPrebuildInfo, BufferDesc, DescriptorHeapDesc, DescriptorHeapId, DescriptorHeapInfo,
        FenceId, FenceWait, NativeResource, NativeResourceId, RayTracingCaps, RootSignatureId, ShaderIdentifier,
        StateObjectId, TextureDesc, ViewDesc,
    },
    commands::command_list::Command,
    error::GfxResult,
    pipelines::{root_signature::RootSignatureDesc, shader::ShaderBlob, state_object::StateObjectDesc},
};

pub(crate) mod descriptor_handle;
pub mod headless;
pub mod types;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub trait GfxBackend {
    fn name(&self) -> &str;

    fn ray_tracing_caps(&self) -> RayTracingCaps;

    // region command allocator & queue

    fn create_command_allocator(&self, name: &str) -> GfxResult<AllocatorId>;

    /// allocator 上提交的命令必须已经在 GPU 上执行完成
    fn reset_command_allocator(&self, allocator: AllocatorId) -> GfxResult<()>;

    fn destroy_command_allocator(&self, allocator: AllocatorId);

    /// Close 并提交到唯一的 direct queue
    fn execute_command_list(&self, allocator: AllocatorId, commands: &[Command]) -> GfxResult<()>;

    // endregion

    // region fence

    fn create_fence(&self, initial_value: u64, name: &str) -> GfxResult<FenceId>;

    /// 在 queue 上排队一个 signal，GPU 执行到这里时 fence 的值变为 `value`
    fn signal_fence(&self, fence: FenceId, value: u64) -> GfxResult<()>;

    fn fence_completed_value(&self, fence: FenceId) -> GfxResult<u64>;

    /// 阻塞直到 fence 的值 >= `value` 或者超时
    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Duration) -> GfxResult<FenceWait>;

    fn destroy_fence(&self, fence: FenceId);

    fn wait_idle(&self) -> GfxResult<()>;

    // endregion

    // region resource

    fn create_buffer(&self, desc: &BufferDesc) -> GfxResult<NativeResource>;

    fn create_texture_2d(&self, desc: &TextureDesc) -> GfxResult<NativeResource>;

    /// 只能用于 upload/readback heap 上的资源
    fn write_host_visible(&self, resource: NativeResourceId, offset: u64, data: &[u8]) -> GfxResult<()>;

    fn read_host_visible(&self, resource: NativeResourceId, offset: u64, size: u64) -> GfxResult<Vec<u8>>;

    fn destroy_resource(&self, resource: NativeResourceId);

    // endregion

    // region descriptor

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> GfxResult<DescriptorHeapInfo>;

    fn write_descriptor(&self, heap: DescriptorHeapId, index: u32, view: &ViewDesc) -> GfxResult<()>;

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId);

    // endregion

    // region ray tracing

    fn acceleration_structure_prebuild_info(&self, inputs: &AsInputs) -> GfxResult<AsPrebuildInfo>;

    fn create_root_signature(&self, desc: &RootSignatureDesc) -> GfxResult<RootSignatureId>;

    fn destroy_root_signature(&self, root_signature: RootSignatureId);

    fn create_state_object(&self, desc: &StateObjectDesc, library: &ShaderBlob) -> GfxResult<StateObjectId>;

    /// export 不存在时返回 None
    fn shader_identifier(&self, state_object: StateObjectId, export: &str) -> Option<ShaderIdentifier>;

    fn destroy_state_object(&self, state_object: StateObjectId);

    // endregion
}
