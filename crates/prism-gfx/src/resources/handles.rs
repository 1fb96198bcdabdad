use std::marker::PhantomData;

use slotmap::new_key_type;

new_key_type! {
    /// 内部 Buffer Handle Key
    pub struct InnerBufferHandle;
    /// 内部 Texture Handle Key
    pub struct InnerTextureHandle;
}

/// 通用 Buffer Handle
///
/// 指向 [`GpuResourceManager`](super::manager::GpuResourceManager) 中的一个 buffer。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub(crate) inner: InnerBufferHandle,
}

/// 2D Texture Handle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    pub(crate) inner: InnerTextureHandle,
}

/// 强类型结构化 Buffer Handle
///
/// 泛型 `T` 表示 Buffer 中存储的元素类型。
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StructuredBufferHandle<T> {
    pub(crate) inner: InnerBufferHandle,
    pub(crate) _marker: PhantomData<T>,
}

impl<T> Clone for StructuredBufferHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StructuredBufferHandle<T> {}

impl<T> From<StructuredBufferHandle<T>> for BufferHandle {
    fn from(handle: StructuredBufferHandle<T>) -> Self {
        BufferHandle { inner: handle.inner }
    }
}
