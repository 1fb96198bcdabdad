use std::{rc::Rc, time::Duration};

use crate::{
    backend::{GfxBackend, types::RayTracingCaps},
    commands::{
        command_cycler::{CommandCycler, DEFAULT_ALLOCATOR_COUNT},
        command_list::GfxCommandList,
        fence_sync::{DEFAULT_FENCE_TIMEOUT, FenceSync},
        upload_context::{UploadContext, UploadStats},
    },
    descriptors::descriptor_pool::{DescriptorHeapCapacities, DescriptorPool},
    error::GfxResult,
    resources::{manager::GpuResourceManager, resource_factory::ResourceFactory},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderingContextConfig {
    pub name: String,
    pub allocator_count: usize,
    pub fence_timeout: Duration,
    pub descriptor_capacities: DescriptorHeapCapacities,
}

impl Default for RenderingContextConfig {
    fn default() -> Self {
        Self {
            name: "prism".to_string(),
            allocator_count: DEFAULT_ALLOCATOR_COUNT,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            descriptor_capacities: DescriptorHeapCapacities::default(),
        }
    }
}

/// 同时借用 command list、资源与描述符
pub struct FrameParts<'a> {
    pub cmd: &'a mut GfxCommandList,
    pub resources: &'a mut GpuResourceManager,
    pub descriptors: &'a mut DescriptorPool,
}

/// 显式持有 GFX 层的所有服务：后端、command cycler、fence、描述符池、资源 arena 与 upload context
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct RenderingContext {
    cycler: CommandCycler,
    fence: FenceSync,
    descriptors: DescriptorPool,
    resources: GpuResourceManager,
    upload: UploadContext,

    backend: Rc<dyn GfxBackend>,
}

// 创建与销毁
impl RenderingContext {
    pub fn new(backend: Rc<dyn GfxBackend>, config: &RenderingContextConfig) -> GfxResult<Self> {
        log::info!("creating rendering context `{}` on {} backend", config.name, backend.name());
        let cycler = CommandCycler::new(backend.clone(), config.allocator_count, &config.name)?;
        let descriptors = DescriptorPool::new(backend.clone(), config.descriptor_capacities)?;
        let fence = FenceSync::new(backend.clone(), config.fence_timeout, format!("{}-fence", config.name))?;
        let resources = GpuResourceManager::new(backend.clone());

        Ok(Self {
            cycler,
            fence,
            descriptors,
            resources,
            upload: UploadContext::new(),
            backend,
        })
    }

    /// 等待 GPU 空闲之后释放所有对象
    pub fn destroy(self) -> GfxResult<()> {
        let idle = self.backend.wait_idle();
        if let Err(err) = &idle {
            log::error!("wait idle failed during destroy: {err}");
        }
        let Self {
            cycler,
            fence,
            descriptors,
            mut resources,
            ..
        } = self;
        resources.destroy_all();
        descriptors.destroy();
        cycler.destroy();
        fence.destroy();
        log::info!("rendering context destroyed");
        idle
    }
}

// getters
impl RenderingContext {
    #[inline]
    pub fn backend(&self) -> &Rc<dyn GfxBackend> {
        &self.backend
    }

    #[inline]
    pub fn ray_tracing_caps(&self) -> RayTracingCaps {
        self.backend.ray_tracing_caps()
    }

    #[inline]
    pub fn cycler(&self) -> &CommandCycler {
        &self.cycler
    }

    #[inline]
    pub fn fence(&self) -> &FenceSync {
        &self.fence
    }

    #[inline]
    pub fn descriptors(&self) -> &DescriptorPool {
        &self.descriptors
    }

    #[inline]
    pub fn descriptors_mut(&mut self) -> &mut DescriptorPool {
        &mut self.descriptors
    }

    #[inline]
    pub fn resources(&self) -> &GpuResourceManager {
        &self.resources
    }

    #[inline]
    pub fn resources_mut(&mut self) -> &mut GpuResourceManager {
        &mut self.resources
    }

    #[inline]
    pub fn is_uploading(&self) -> bool {
        self.upload.is_active()
    }

    /// 创建 view 时需要同时借用资源与描述符池
    pub fn resources_and_descriptors(&mut self) -> (&mut GpuResourceManager, &mut DescriptorPool) {
        (&mut self.resources, &mut self.descriptors)
    }

    pub fn factory(&mut self) -> ResourceFactory<'_> {
        ResourceFactory::new(&mut self.resources, &mut self.cycler, &self.fence, &mut self.upload)
    }

    pub fn command_list(&mut self) -> GfxResult<&mut GfxCommandList> {
        self.cycler.command_list()
    }

    pub fn frame_parts(&mut self) -> GfxResult<FrameParts<'_>> {
        Ok(FrameParts {
            cmd: self.cycler.command_list()?,
            resources: &mut self.resources,
            descriptors: &mut self.descriptors,
        })
    }
}

// 提交与同步
impl RenderingContext {
    pub fn begin_upload(&mut self, label: &str) -> GfxResult<()> {
        self.upload.begin(&mut self.cycler, label)
    }

    /// 一次提交、一次等待
    pub fn end_upload(&mut self) -> GfxResult<UploadStats> {
        self.upload.end(&mut self.cycler, &mut self.fence, &mut self.resources)
    }

    /// 提交当前的 command list
    pub fn close(&mut self) -> GfxResult<()> {
        self.cycler.close()
    }

    /// 已经 close 之后：add fence value → signal → wait → 回收资源 → reset，返回本帧的 fence 值
    pub fn end_frame_sync(&mut self) -> GfxResult<u64> {
        let value = self.fence.add_fence_value();
        self.cycler.signal(&self.fence)?;
        self.fence.wait_gpu()?;
        self.resources.cleanup_retired(self.fence.completed_value()?);
        self.cycler.reset()?;
        Ok(value)
    }

    /// close → add fence value → signal → wait → 回收资源 → reset
    pub fn flush_and_wait(&mut self) -> GfxResult<u64> {
        self.cycler.close()?;
        self.end_frame_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{
            headless::HeadlessBackend,
            types::{HeapType, ResourceFlags, ResourceState},
        },
        error::GraphicsError,
    };

    fn headless_context() -> (Rc<HeadlessBackend>, RenderingContext) {
        let headless = Rc::new(HeadlessBackend::new());
        let ctx = RenderingContext::new(headless.clone(), &RenderingContextConfig::default()).unwrap();
        (headless, ctx)
    }

    #[test]
    fn test_upload_batches_into_one_submission() {
        let (headless, mut ctx) = headless_context();
        ctx.begin_upload("geometry").unwrap();
        let mut buffers = Vec::new();
        for i in 0..3u8 {
            let data = [i; 16];
            buffers.push(
                ctx.factory()
                    .create_buffer(16, Some(&data), HeapType::Default, ResourceFlags::empty(), "vb")
                    .unwrap(),
            );
        }
        assert_eq!(headless.submit_count(), 0);
        let stats = ctx.end_upload().unwrap();

        assert_eq!(headless.submit_count(), 1);
        assert_eq!(headless.wait_count(), 1);
        assert_eq!(stats.copies, 3);
        assert_eq!(stats.staged_bytes, 48);
        assert_eq!(stats.retired, 3);
        assert_eq!(stats.fence_value, 1);
        for (i, buffer) in buffers.into_iter().enumerate() {
            let native = ctx.resources().buffer(buffer).unwrap().native;
            assert_eq!(headless.resource_data(native).unwrap(), vec![i as u8; 16]);
            assert_eq!(headless.resource_state(native), Some(ResourceState::NonPixelShaderResource));
        }
        ctx.destroy().unwrap();
        assert_eq!(headless.live_resource_count(), 0);
    }

    #[test]
    fn test_nested_upload_is_rejected() {
        let (_headless, mut ctx) = headless_context();
        ctx.begin_upload("a").unwrap();
        assert!(matches!(ctx.begin_upload("b"), Err(GraphicsError::InvalidState { .. })));
        ctx.end_upload().unwrap();
        assert!(matches!(ctx.end_upload(), Err(GraphicsError::InvalidState { .. })));
    }

    #[test]
    fn test_fence_value_after_n_frames() {
        let (_headless, mut ctx) = headless_context();
        for frame in 1..=4u64 {
            ctx.command_list().unwrap().begin_label("frame");
            ctx.command_list().unwrap().end_label();
            assert_eq!(ctx.flush_and_wait().unwrap(), frame);
        }
        assert_eq!(ctx.fence().completed_value().unwrap(), 4);
        assert_eq!(ctx.cycler().back_allocator_index(), 0);
    }
}
