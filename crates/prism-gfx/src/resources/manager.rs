use std::rc::Rc;

use slotmap::SlotMap;

use crate::{
    backend::{
        GfxBackend,
        types::{
            BufferDesc, Format, GpuVirtualAddress, HeapType, NativeResourceId, ResourceFlags, ResourceState,
            TextureDesc,
        },
    },
    commands::{barrier::ResourceBarrier, command_list::GfxCommandList},
    error::{GfxResult, GraphicsError},
    resources::handles::{BufferHandle, InnerBufferHandle, InnerTextureHandle, TextureHandle},
};

/// arena 中的 buffer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub native: NativeResourceId,
    pub heap: HeapType,
    pub flags: ResourceFlags,
    pub size: u64,
    pub gpu_address: GpuVirtualAddress,
    /// 由记录 barrier 的辅助函数维护
    pub state: ResourceState,
    pub name: String,
}

/// arena 中的 2D texture
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuTexture {
    pub native: NativeResourceId,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub flags: ResourceFlags,
    pub state: ResourceState,
    pub name: String,
}

/// 资源管理器
///
/// 使用 SlotMap 存储 GPU 资源，对外提供轻量级的 Handle。
/// 支持按照 fence 值延迟销毁：提交销毁时记录 GPU 最后使用该资源的 fence 值，
/// 等到该值完成之后才真正释放。
pub struct GpuResourceManager {
    buffers: SlotMap<InnerBufferHandle, GpuBuffer>,
    textures: SlotMap<InnerTextureHandle, GpuTexture>,

    /// 待销毁的 Buffer 队列，存储 (Handle, 最后使用的 fence 值)
    pending_destroy_buffers: Vec<(InnerBufferHandle, u64)>,
    /// 待销毁的 Texture 队列
    pending_destroy_textures: Vec<(InnerTextureHandle, u64)>,

    backend: Rc<dyn GfxBackend>,
}

impl GpuResourceManager {
    pub fn new(backend: Rc<dyn GfxBackend>) -> Self {
        Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            pending_destroy_buffers: Vec::new(),
            pending_destroy_textures: Vec::new(),
            backend,
        }
    }

    #[inline]
    pub fn backend(&self) -> &Rc<dyn GfxBackend> {
        &self.backend
    }

    /// 清理已过期的资源
    ///
    /// 销毁那些提交销毁时的 fence 值 <= `completed_fence_value` 的资源，返回销毁的数量。
    pub fn cleanup_retired(&mut self, completed_fence_value: u64) -> usize {
        let mut buffers_to_destroy = Vec::new();
        self.pending_destroy_buffers.retain(|(handle, fence_value)| {
            if *fence_value <= completed_fence_value {
                buffers_to_destroy.push(*handle);
                false
            } else {
                true
            }
        });
        let mut textures_to_destroy = Vec::new();
        self.pending_destroy_textures.retain(|(handle, fence_value)| {
            if *fence_value <= completed_fence_value {
                textures_to_destroy.push(*handle);
                false
            } else {
                true
            }
        });

        let mut destroyed = 0;
        for handle in buffers_to_destroy {
            if let Some(buffer) = self.buffers.remove(handle) {
                self.backend.destroy_resource(buffer.native);
                destroyed += 1;
            }
        }
        for handle in textures_to_destroy {
            if let Some(texture) = self.textures.remove(handle) {
                self.backend.destroy_resource(texture.native);
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            log::debug!("{} retired resources destroyed at fence value {}", destroyed, completed_fence_value);
        }
        destroyed
    }

    #[inline]
    pub fn pending_destroy_count(&self) -> usize {
        self.pending_destroy_buffers.len() + self.pending_destroy_textures.len()
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    #[inline]
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// 立即销毁所有资源，调用前 GPU 必须已经空闲
    pub fn destroy_all(&mut self) {
        for (_, buffer) in self.buffers.drain() {
            self.backend.destroy_resource(buffer.native);
        }
        for (_, texture) in self.textures.drain() {
            self.backend.destroy_resource(texture.native);
        }
        self.pending_destroy_buffers.clear();
        self.pending_destroy_textures.clear();
    }
}

// Buffer API
impl GpuResourceManager {
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> GfxResult<BufferHandle> {
        let native = self.backend.create_buffer(desc)?;
        let inner = self.buffers.insert(GpuBuffer {
            native: native.id,
            heap: desc.heap,
            flags: desc.flags,
            size: desc.size,
            gpu_address: native.gpu_address,
            state: desc.initial_state,
            name: desc.name.clone(),
        });
        log::debug!("buffer `{}` created: {} bytes, {:?} heap, {:?}", desc.name, desc.size, desc.heap, desc.initial_state);
        Ok(BufferHandle { inner })
    }

    /// 获取 Buffer 资源引用
    #[inline]
    pub fn get_buffer(&self, handle: BufferHandle) -> Option<&GpuBuffer> {
        self.buffers.get(handle.inner)
    }

    pub fn buffer(&self, handle: BufferHandle) -> GfxResult<&GpuBuffer> {
        self.buffers.get(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "buffer",
            detail: format!("{handle:?} has been destroyed"),
        })
    }

    /// 写入 upload/readback heap 上的 buffer
    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> GfxResult<()> {
        let buffer = self.buffer(handle)?;
        if offset + data.len() as u64 > buffer.size {
            return Err(GraphicsError::CapacityExceeded {
                what: format!("buffer `{}`", buffer.name),
                requested: offset + data.len() as u64,
                capacity: buffer.size,
            });
        }
        self.backend.write_host_visible(buffer.native, offset, data)
    }

    pub fn read_buffer(&self, handle: BufferHandle) -> GfxResult<Vec<u8>> {
        let buffer = self.buffer(handle)?;
        self.backend.read_host_visible(buffer.native, 0, buffer.size)
    }

    /// 记录状态转换并更新跟踪的状态，状态相同时不记录
    pub fn transition_buffer(
        &mut self,
        cmd: &mut GfxCommandList,
        handle: BufferHandle,
        after: ResourceState,
    ) -> GfxResult<()> {
        let buffer = self.buffers.get_mut(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "buffer",
            detail: format!("{handle:?} has been destroyed"),
        })?;
        cmd.resource_barrier(&[ResourceBarrier::transition(buffer.native, buffer.state, after)]);
        buffer.state = after;
        Ok(())
    }

    pub fn uav_barrier(&self, cmd: &mut GfxCommandList, handle: BufferHandle) -> GfxResult<()> {
        cmd.resource_barrier(&[ResourceBarrier::uav(self.buffer(handle)?.native)]);
        Ok(())
    }

    pub fn destroy_buffer_immediate(&mut self, handle: BufferHandle) -> GfxResult<()> {
        let buffer = self.buffers.remove(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "buffer",
            detail: format!("double destroy of {handle:?}"),
        })?;
        self.pending_destroy_buffers.retain(|(h, _)| *h != handle.inner);
        self.backend.destroy_resource(buffer.native);
        Ok(())
    }

    /// 在 GPU 完成 `fence_value` 之后销毁
    pub fn destroy_buffer_deferred(&mut self, handle: BufferHandle, fence_value: u64) -> GfxResult<()> {
        self.buffer(handle)?;
        if self.pending_destroy_buffers.iter().any(|(h, _)| *h == handle.inner) {
            return Err(GraphicsError::InvalidHandle {
                kind: "buffer",
                detail: format!("{handle:?} is already retired"),
            });
        }
        self.pending_destroy_buffers.push((handle.inner, fence_value));
        Ok(())
    }
}

// Texture API
impl GpuResourceManager {
    pub fn create_texture_2d(&mut self, desc: &TextureDesc) -> GfxResult<TextureHandle> {
        let native = self.backend.create_texture_2d(desc)?;
        let inner = self.textures.insert(GpuTexture {
            native: native.id,
            width: desc.width,
            height: desc.height,
            format: desc.format,
            flags: desc.flags,
            state: desc.initial_state,
            name: desc.name.clone(),
        });
        log::debug!("texture `{}` created: {}x{} {:?}", desc.name, desc.width, desc.height, desc.format);
        Ok(TextureHandle { inner })
    }

    #[inline]
    pub fn get_texture(&self, handle: TextureHandle) -> Option<&GpuTexture> {
        self.textures.get(handle.inner)
    }

    pub fn texture(&self, handle: TextureHandle) -> GfxResult<&GpuTexture> {
        self.textures.get(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "texture",
            detail: format!("{handle:?} has been destroyed"),
        })
    }

    pub fn transition_texture(
        &mut self,
        cmd: &mut GfxCommandList,
        handle: TextureHandle,
        after: ResourceState,
    ) -> GfxResult<()> {
        let texture = self.textures.get_mut(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "texture",
            detail: format!("{handle:?} has been destroyed"),
        })?;
        cmd.resource_barrier(&[ResourceBarrier::transition(texture.native, texture.state, after)]);
        texture.state = after;
        Ok(())
    }

    pub fn destroy_texture_immediate(&mut self, handle: TextureHandle) -> GfxResult<()> {
        let texture = self.textures.remove(handle.inner).ok_or_else(|| GraphicsError::InvalidHandle {
            kind: "texture",
            detail: format!("double destroy of {handle:?}"),
        })?;
        self.pending_destroy_textures.retain(|(h, _)| *h != handle.inner);
        self.backend.destroy_resource(texture.native);
        Ok(())
    }

    pub fn destroy_texture_deferred(&mut self, handle: TextureHandle, fence_value: u64) -> GfxResult<()> {
        self.texture(handle)?;
        if self.pending_destroy_textures.iter().any(|(h, _)| *h == handle.inner) {
            return Err(GraphicsError::InvalidHandle {
                kind: "texture",
                detail: format!("{handle:?} is already retired"),
            });
        }
        self.pending_destroy_textures.push((handle.inner, fence_value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    fn upload_desc(size: u64) -> BufferDesc {
        BufferDesc {
            size,
            heap: HeapType::Upload,
            flags: ResourceFlags::empty(),
            initial_state: ResourceState::GenericRead,
            name: "upload".to_string(),
        }
    }

    #[test]
    fn test_deferred_destroy_waits_for_fence() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut manager = GpuResourceManager::new(headless.clone());
        let a = manager.create_buffer(&upload_desc(64)).unwrap();
        let b = manager.create_buffer(&upload_desc(64)).unwrap();

        manager.destroy_buffer_deferred(a, 1).unwrap();
        manager.destroy_buffer_deferred(b, 2).unwrap();
        assert!(manager.destroy_buffer_deferred(a, 3).is_err());

        assert_eq!(manager.cleanup_retired(0), 0);
        assert_eq!(manager.cleanup_retired(1), 1);
        assert!(manager.get_buffer(a).is_none());
        assert!(manager.get_buffer(b).is_some());
        assert_eq!(manager.cleanup_retired(5), 1);
        assert_eq!(headless.live_resource_count(), 0);
    }

    #[test]
    fn test_double_destroy_is_invalid_handle() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut manager = GpuResourceManager::new(headless);
        let a = manager.create_buffer(&upload_desc(16)).unwrap();
        manager.destroy_buffer_immediate(a).unwrap();
        assert!(matches!(manager.destroy_buffer_immediate(a), Err(GraphicsError::InvalidHandle { .. })));
        assert!(matches!(manager.buffer(a), Err(GraphicsError::InvalidHandle { .. })));
    }

    #[test]
    fn test_transition_tracks_state() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut manager = GpuResourceManager::new(headless);
        let texture = manager
            .create_texture_2d(&TextureDesc {
                width: 4,
                height: 4,
                format: Format::Rgba8Unorm,
                flags: ResourceFlags::ALLOW_UNORDERED_ACCESS,
                initial_state: ResourceState::CopySource,
                name: "output".to_string(),
            })
            .unwrap();
        let mut cmd = GfxCommandList::new("test");
        manager.transition_texture(&mut cmd, texture, ResourceState::UnorderedAccess).unwrap();
        manager.transition_texture(&mut cmd, texture, ResourceState::UnorderedAccess).unwrap();
        assert_eq!(cmd.len(), 1);
        assert_eq!(manager.texture(texture).unwrap().state, ResourceState::UnorderedAccess);
    }

    #[test]
    fn test_write_out_of_range() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut manager = GpuResourceManager::new(headless);
        let a = manager.create_buffer(&upload_desc(8)).unwrap();
        manager.write_buffer(a, 0, &[1; 8]).unwrap();
        assert!(matches!(manager.write_buffer(a, 4, &[1; 8]), Err(GraphicsError::CapacityExceeded { .. })));
        assert_eq!(manager.read_buffer(a).unwrap(), vec![1; 8]);
    }
}
