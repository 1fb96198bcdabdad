use std::marker::PhantomData;

use bytemuck::Pod;

use crate::{
    backend::types::{GpuVirtualAddress, HeapType, ResourceFlags},
    error::{GfxResult, GraphicsError},
    resources::{
        handles::{BufferHandle, StructuredBufferHandle},
        manager::GpuResourceManager,
        resource_factory::ResourceFactory,
    },
};

/// upload heap 上的强类型结构化 buffer
///
/// 元素按照 `size_of::<T>()` 紧密排列，写入时检查下标。
pub struct StructuredUploadBuffer<T: Pod> {
    handle: StructuredBufferHandle<T>,
    capacity: u32,
}

impl<T: Pod> StructuredUploadBuffer<T> {
    pub const STRIDE: u64 = size_of::<T>() as u64;

    pub fn new(factory: &mut ResourceFactory, capacity: u32, name: &str) -> GfxResult<Self> {
        let size = (Self::STRIDE * capacity as u64).max(1);
        let buffer = factory.create_buffer(size, None, HeapType::Upload, ResourceFlags::empty(), name)?;
        Ok(Self {
            handle: StructuredBufferHandle {
                inner: buffer.inner,
                _marker: PhantomData,
            },
            capacity,
        })
    }

    /// 创建并写入全部元素
    pub fn from_slice(factory: &mut ResourceFactory, elements: &[T], name: &str) -> GfxResult<Self> {
        let buffer = Self::new(factory, elements.len() as u32, name)?;
        buffer.write_all(factory.resources(), elements)?;
        Ok(buffer)
    }

    #[inline]
    pub fn handle(&self) -> StructuredBufferHandle<T> {
        self.handle
    }

    #[inline]
    pub fn buffer(&self) -> BufferHandle {
        self.handle.into()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn check_range(&self, first: u32, count: usize) -> GfxResult<()> {
        let end = first as u64 + count as u64;
        if end > self.capacity as u64 {
            return Err(GraphicsError::CapacityExceeded {
                what: format!("structured buffer of {}", std::any::type_name::<T>()),
                requested: end,
                capacity: self.capacity as u64,
            });
        }
        Ok(())
    }

    pub fn write(&self, resources: &GpuResourceManager, index: u32, element: &T) -> GfxResult<()> {
        self.check_range(index, 1)?;
        resources.write_buffer(self.buffer(), index as u64 * Self::STRIDE, bytemuck::bytes_of(element))
    }

    pub fn write_all(&self, resources: &GpuResourceManager, elements: &[T]) -> GfxResult<()> {
        self.check_range(0, elements.len())?;
        resources.write_buffer(self.buffer(), 0, bytemuck::cast_slice(elements))
    }

    /// 第 `index` 个元素的 GPU 地址
    pub fn gpu_address(&self, resources: &GpuResourceManager, index: u32) -> GfxResult<GpuVirtualAddress> {
        self.check_range(index, 1)?;
        Ok(resources.buffer(self.buffer())?.gpu_address + index as u64 * Self::STRIDE)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        commands::{
            command_cycler::CommandCycler,
            fence_sync::{DEFAULT_FENCE_TIMEOUT, FenceSync},
            upload_context::UploadContext,
        },
    };

    #[test]
    fn test_bounds_checked_writes() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut resources = GpuResourceManager::new(headless.clone());
        let mut cycler = CommandCycler::new(headless.clone(), 2, "test").unwrap();
        let fence = FenceSync::new(headless.clone(), DEFAULT_FENCE_TIMEOUT, "test").unwrap();
        let mut upload = UploadContext::new();
        let mut factory = ResourceFactory::new(&mut resources, &mut cycler, &fence, &mut upload);

        let buffer = StructuredUploadBuffer::<[u32; 2]>::new(&mut factory, 3, "pairs").unwrap();
        buffer.write(factory.resources(), 2, &[5, 6]).unwrap();
        assert!(matches!(
            buffer.write(factory.resources(), 3, &[0, 0]),
            Err(GraphicsError::CapacityExceeded { requested: 4, capacity: 3, .. })
        ));

        let base = buffer.gpu_address(factory.resources(), 0).unwrap();
        assert_eq!(buffer.gpu_address(factory.resources(), 2).unwrap(), base + 16);

        let bytes = factory.resources().read_buffer(buffer.buffer()).unwrap();
        assert_eq!(&bytes[16..24], bytemuck::bytes_of(&[5u32, 6]));
    }
}
