use crate::{
    backend::types::{BufferDesc, Format, HeapType, ResourceFlags, ResourceState, TextureDesc},
    commands::{
        command_cycler::CommandCycler, command_list::GfxCommandList, fence_sync::FenceSync,
        upload_context::UploadContext,
    },
    error::{GfxResult, GraphicsError},
    resources::{
        handles::{BufferHandle, TextureHandle},
        manager::GpuResourceManager,
    },
};

/// committed resource 的创建入口
///
/// 从 [`RenderingContext::factory`](crate::render_context::RenderingContext::factory) 借用得到，
/// default heap 上带初始数据的 buffer 会在当前的 command list 中记录 staging 拷贝。
pub struct ResourceFactory<'a> {
    resources: &'a mut GpuResourceManager,
    cycler: &'a mut CommandCycler,
    fence: &'a FenceSync,
    upload: &'a mut UploadContext,
}

impl<'a> ResourceFactory<'a> {
    pub fn new(
        resources: &'a mut GpuResourceManager,
        cycler: &'a mut CommandCycler,
        fence: &'a FenceSync,
        upload: &'a mut UploadContext,
    ) -> Self {
        Self {
            resources,
            cycler,
            fence,
            upload,
        }
    }

    #[inline]
    pub fn resources(&self) -> &GpuResourceManager {
        self.resources
    }

    #[inline]
    pub fn resources_mut(&mut self) -> &mut GpuResourceManager {
        &mut *self.resources
    }

    /// 同时借用资源管理器与正在录制的 command list
    pub fn resources_and_commands(&mut self) -> GfxResult<(&mut GpuResourceManager, &mut GfxCommandList)> {
        Ok((&mut *self.resources, self.cycler.command_list()?))
    }

    /// 当前录制的命令完成时 fence 将要达到的值
    #[inline]
    pub fn next_fence_value(&self) -> u64 {
        self.fence.fence_value() + 1
    }

    /// 当前录制的命令执行完成之后释放 buffer
    pub fn retire_buffer(&mut self, buffer: BufferHandle) -> GfxResult<()> {
        let fence_value = self.next_fence_value();
        self.resources.destroy_buffer_deferred(buffer, fence_value)
    }

    /// 创建 buffer，并写入初始数据
    ///
    /// - upload heap：状态为 `GenericRead`，数据直接写入映射的内存
    /// - default heap：状态为 `CopyDest`，数据经过临时的 upload buffer 拷贝，
    ///   拷贝之后在同一个 command list 中转换到 `NonPixelShaderResource`；
    ///   临时 buffer 在下一个 fence 值完成后释放
    pub fn create_buffer(
        &mut self,
        size: u64,
        initial_data: Option<&[u8]>,
        heap: HeapType,
        flags: ResourceFlags,
        name: &str,
    ) -> GfxResult<BufferHandle> {
        if let Some(data) = initial_data.filter(|data| data.len() as u64 > size) {
            return Err(GraphicsError::CapacityExceeded {
                what: format!("initial data of `{name}`"),
                requested: data.len() as u64,
                capacity: size,
            });
        }

        let initial_state = match heap {
            HeapType::Upload => ResourceState::GenericRead,
            HeapType::Default | HeapType::Readback => ResourceState::CopyDest,
        };
        let buffer = self.create_buffer_with_state(size, heap, flags, initial_state, name)?;

        match (heap, initial_data) {
            (_, None) => {}
            (_, Some([])) => {}
            (HeapType::Upload, Some(data)) => self.resources.write_buffer(buffer, 0, data)?,
            (HeapType::Default, Some(data)) => self.stage_upload(buffer, data, name)?,
            (HeapType::Readback, Some(_)) => {
                return Err(GraphicsError::invalid_state("upload or default heap", "initial data for a readback buffer"));
            }
        }
        Ok(buffer)
    }

    /// 创建 buffer，不写入数据（例如加速结构相关的 buffer）
    pub fn create_buffer_with_state(
        &mut self,
        size: u64,
        heap: HeapType,
        flags: ResourceFlags,
        initial_state: ResourceState,
        name: &str,
    ) -> GfxResult<BufferHandle> {
        self.resources.create_buffer(&BufferDesc {
            size,
            heap,
            flags,
            initial_state,
            name: name.to_string(),
        })
    }

    pub fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        format: Format,
        flags: ResourceFlags,
        initial_state: ResourceState,
        name: &str,
    ) -> GfxResult<TextureHandle> {
        self.resources.create_texture_2d(&TextureDesc {
            width,
            height,
            format,
            flags,
            initial_state,
            name: name.to_string(),
        })
    }

    fn stage_upload(&mut self, dst: BufferHandle, data: &[u8], name: &str) -> GfxResult<()> {
        let staging = self.create_buffer_with_state(
            data.len() as u64,
            HeapType::Upload,
            ResourceFlags::empty(),
            ResourceState::GenericRead,
            &format!("{name}-staging"),
        )?;
        self.resources.write_buffer(staging, 0, data)?;

        let dst_native = self.resources.buffer(dst)?.native;
        let staging_native = self.resources.buffer(staging)?.native;
        let cmd = self.cycler.command_list()?;
        cmd.copy_buffer_region(dst_native, 0, staging_native, 0, data.len() as u64);
        // 拷贝完成之后才能被 shader 读取
        self.resources.transition_buffer(cmd, dst, ResourceState::NonPixelShaderResource)?;

        self.retire_buffer(staging)?;
        self.upload.record_staged_copy(data.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        commands::{command_list::Command, fence_sync::DEFAULT_FENCE_TIMEOUT},
    };

    struct Fixture {
        headless: Rc<HeadlessBackend>,
        resources: GpuResourceManager,
        cycler: CommandCycler,
        fence: FenceSync,
        upload: UploadContext,
    }

    fn fixture() -> Fixture {
        let headless = Rc::new(HeadlessBackend::new());
        Fixture {
            resources: GpuResourceManager::new(headless.clone()),
            cycler: CommandCycler::new(headless.clone(), 2, "test").unwrap(),
            fence: FenceSync::new(headless.clone(), DEFAULT_FENCE_TIMEOUT, "test").unwrap(),
            upload: UploadContext::new(),
            headless,
        }
    }

    #[test]
    fn test_upload_heap_writes_directly() {
        let mut f = fixture();
        let mut factory = ResourceFactory::new(&mut f.resources, &mut f.cycler, &f.fence, &mut f.upload);
        let buffer =
            factory.create_buffer(8, Some(&[1, 2, 3, 4]), HeapType::Upload, ResourceFlags::empty(), "upload").unwrap();
        let gpu = factory.resources().buffer(buffer).unwrap().clone();
        assert_eq!(gpu.state, ResourceState::GenericRead);
        assert_eq!(f.headless.resource_data(gpu.native).unwrap(), vec![1, 2, 3, 4, 0, 0, 0, 0]);
        assert!(f.cycler.command_list().unwrap().is_empty());
    }

    #[test]
    fn test_default_heap_stages_copy() {
        let mut f = fixture();
        let mut factory = ResourceFactory::new(&mut f.resources, &mut f.cycler, &f.fence, &mut f.upload);
        let buffer =
            factory.create_buffer(4, Some(&[9, 8, 7, 6]), HeapType::Default, ResourceFlags::empty(), "vb").unwrap();
        let gpu = factory.resources().buffer(buffer).unwrap().clone();
        assert_eq!(gpu.state, ResourceState::NonPixelShaderResource);
        assert_eq!(f.resources.pending_destroy_count(), 1);

        let commands = f.cycler.command_list().unwrap().commands().to_vec();
        assert!(matches!(commands[0], Command::CopyBufferRegion { dst, size: 4, .. } if dst == gpu.native));
        assert!(matches!(commands[1], Command::ResourceBarrier(_)));

        // 数据在 GPU 执行之后才可见
        f.cycler.close().unwrap();
        f.fence.add_fence_value();
        f.cycler.signal(&f.fence).unwrap();
        f.fence.wait_gpu().unwrap();
        assert_eq!(f.headless.resource_data(gpu.native).unwrap(), vec![9, 8, 7, 6]);
        assert_eq!(f.resources.cleanup_retired(f.fence.completed_value().unwrap()), 1);
        assert_eq!(f.headless.resource_state(gpu.native), Some(ResourceState::NonPixelShaderResource));
    }

    #[test]
    fn test_initial_data_larger_than_buffer() {
        let mut f = fixture();
        let mut factory = ResourceFactory::new(&mut f.resources, &mut f.cycler, &f.fence, &mut f.upload);
        let err = factory.create_buffer(2, Some(&[0; 4]), HeapType::Upload, ResourceFlags::empty(), "small");
        assert!(matches!(err, Err(GraphicsError::CapacityExceeded { .. })));
    }
}
