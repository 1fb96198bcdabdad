//! swap chain 边界
//!
//! 窗口与系统 swap chain 不在本 crate 的范围内，[`OffscreenSwapChain`] 用一组离屏的
//! render target 模拟 back buffer 的轮转。

use crate::{
    backend::types::{Format, ResourceFlags, ResourceState, TextureDesc},
    descriptors::descriptor_pool::{DescriptorPool, DescriptorSlot},
    error::{GfxResult, GraphicsError},
    resources::{handles::TextureHandle, manager::GpuResourceManager},
};

pub trait SwapChain {
    fn back_buffer_count(&self) -> u32;

    fn current_back_buffer_index(&self) -> u32;

    fn back_buffer(&self, index: u32) -> GfxResult<TextureHandle>;

    fn rtv(&self, index: u32) -> GfxResult<DescriptorSlot>;

    fn extent(&self) -> (u32, u32);

    fn format(&self) -> Format;

    /// back buffer 必须处于 `Present` 状态
    fn present(&mut self, resources: &GpuResourceManager) -> GfxResult<()>;
}

/// 不依赖窗口的 swap chain
pub struct OffscreenSwapChain {
    back_buffers: Vec<TextureHandle>,
    rtvs: Vec<DescriptorSlot>,
    current: u32,
    width: u32,
    height: u32,
    format: Format,
    present_count: u64,
}

impl OffscreenSwapChain {
    pub fn new(
        resources: &mut GpuResourceManager,
        descriptors: &mut DescriptorPool,
        back_buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
    ) -> GfxResult<Self> {
        if back_buffer_count == 0 {
            return Err(GraphicsError::invalid_state("at least one back buffer", "0 back buffers"));
        }
        let mut back_buffers = Vec::with_capacity(back_buffer_count as usize);
        let mut rtvs = Vec::with_capacity(back_buffer_count as usize);
        for i in 0..back_buffer_count {
            let texture = resources.create_texture_2d(&TextureDesc {
                width,
                height,
                format,
                flags: ResourceFlags::ALLOW_RENDER_TARGET,
                initial_state: ResourceState::Present,
                name: format!("back-buffer-{i}"),
            })?;
            rtvs.push(descriptors.create_render_target_view(resources, texture)?);
            back_buffers.push(texture);
        }
        log::info!("offscreen swap chain created: {} x {}x{} {:?}", back_buffer_count, width, height, format);
        Ok(Self {
            back_buffers,
            rtvs,
            current: 0,
            width,
            height,
            format,
            present_count: 0,
        })
    }

    #[inline]
    pub fn present_count(&self) -> u64 {
        self.present_count
    }

    pub fn destroy(self, resources: &mut GpuResourceManager, descriptors: &mut DescriptorPool) -> GfxResult<()> {
        for rtv in self.rtvs {
            descriptors.erase(rtv)?;
        }
        for texture in self.back_buffers {
            resources.destroy_texture_immediate(texture)?;
        }
        Ok(())
    }

    fn check_index(&self, index: u32) -> GfxResult<usize> {
        if index as usize >= self.back_buffers.len() {
            return Err(GraphicsError::InvalidHandle {
                kind: "back buffer",
                detail: format!("index {index} out of {}", self.back_buffers.len()),
            });
        }
        Ok(index as usize)
    }
}

impl SwapChain for OffscreenSwapChain {
    #[inline]
    fn back_buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    #[inline]
    fn current_back_buffer_index(&self) -> u32 {
        self.current
    }

    fn back_buffer(&self, index: u32) -> GfxResult<TextureHandle> {
        Ok(self.back_buffers[self.check_index(index)?])
    }

    fn rtv(&self, index: u32) -> GfxResult<DescriptorSlot> {
        Ok(self.rtvs[self.check_index(index)?])
    }

    #[inline]
    fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    fn format(&self) -> Format {
        self.format
    }

    fn present(&mut self, resources: &GpuResourceManager) -> GfxResult<()> {
        let back_buffer = resources.texture(self.back_buffer(self.current)?)?;
        if back_buffer.state != ResourceState::Present {
            return Err(GraphicsError::invalid_state(
                format!("back buffer `{}` in Present", back_buffer.name),
                format!("{:?}", back_buffer.state),
            ));
        }
        self.present_count += 1;
        self.current = (self.current + 1) % self.back_buffer_count();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        backend::{headless::HeadlessBackend, types::DescriptorHeapType},
        commands::command_list::GfxCommandList,
        descriptors::descriptor_pool::DescriptorHeapCapacities,
    };

    #[test]
    fn test_present_rotates_back_buffers() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut resources = GpuResourceManager::new(headless.clone());
        let mut descriptors = DescriptorPool::new(headless.clone(), DescriptorHeapCapacities::default()).unwrap();
        let mut swap_chain =
            OffscreenSwapChain::new(&mut resources, &mut descriptors, 2, 8, 4, Format::Rgba8Unorm).unwrap();
        assert_eq!(descriptors.allocated_count(DescriptorHeapType::Rtv), 2);
        assert_ne!(swap_chain.rtv(0).unwrap(), swap_chain.rtv(1).unwrap());

        swap_chain.present(&resources).unwrap();
        assert_eq!(swap_chain.current_back_buffer_index(), 1);
        swap_chain.present(&resources).unwrap();
        assert_eq!(swap_chain.current_back_buffer_index(), 0);
        assert!(swap_chain.back_buffer(2).is_err());

        // 不在 Present 状态时不能 present
        let mut cmd = GfxCommandList::new("test");
        let back_buffer = swap_chain.back_buffer(0).unwrap();
        resources.transition_texture(&mut cmd, back_buffer, ResourceState::RenderTarget).unwrap();
        assert!(matches!(swap_chain.present(&resources), Err(GraphicsError::InvalidState { .. })));

        swap_chain.destroy(&mut resources, &mut descriptors).unwrap();
        assert_eq!(descriptors.allocated_count(DescriptorHeapType::Rtv), 0);
        assert_eq!(resources.texture_count(), 0);
    }
}
