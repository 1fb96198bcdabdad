//! 后端 id 到 Vulkan 对象的映射

use std::collections::HashMap;

use ash::vk;

use crate::{
    backend::{
        descriptor_handle,
        types::{DescriptorHeapDesc, GpuVirtualAddress, HeapType, NativeResourceId, ShaderIdentifier, ViewDesc},
    },
    pipelines::root_signature::RootSignatureDesc,
};

/// command pool 以及从中分配的 command buffer；reset 之后 command buffer 可以复用
pub(super) struct VkAllocator {
    pub name: String,
    pub pool: vk::CommandPool,
    pub buffers: Vec<vk::CommandBuffer>,
    pub used: usize,
}

/// fence 使用 timeline semaphore 实现
pub(super) struct VkFence {
    pub name: String,
    pub semaphore: vk::Semaphore,
}

pub(super) enum VkResourceKind {
    Buffer {
        buffer: vk::Buffer,
    },
    Texture {
        image: vk::Image,
        view: vk::ImageView,
        width: u32,
        height: u32,
    },
}

pub(super) struct VkResource {
    pub name: String,
    pub kind: VkResourceKind,
    pub allocation: vk_mem::Allocation,
    pub heap: HeapType,
    pub size: u64,
    pub gpu_address: GpuVirtualAddress,
    /// host visible 的资源在创建时映射，销毁时解除映射
    pub mapped: Option<*mut u8>,
}

impl VkResource {
    #[inline]
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match self.kind {
            VkResourceKind::Buffer { buffer } => Some(buffer),
            VkResourceKind::Texture { .. } => None,
        }
    }

    #[inline]
    pub fn image(&self) -> Option<vk::Image> {
        match self.kind {
            VkResourceKind::Texture { image, .. } => Some(image),
            VkResourceKind::Buffer { .. } => None,
        }
    }

    #[inline]
    pub fn contains_address(&self, address: GpuVirtualAddress) -> bool {
        self.buffer().is_some() && address >= self.gpu_address && address < self.gpu_address + self.size
    }
}

/// shader visible 的 CBV/SRV/UAV heap 对应一个 bindless descriptor set，其余的 heap 只记录 view
pub(super) struct VkDescriptorHeap {
    pub desc: DescriptorHeapDesc,
    pub slots: Vec<Option<ViewDesc>>,
    pub set: Option<(vk::DescriptorPool, vk::DescriptorSet)>,
}

/// local root signature 没有对应的 Vulkan 对象，参数通过 shader record 传递
pub(super) struct VkRootSignature {
    pub desc: RootSignatureDesc,
    pub layout: Option<vk::PipelineLayout>,
}

pub(super) struct VkStateObject {
    pub name: String,
    pub pipeline: vk::Pipeline,
    pub module: vk::ShaderModule,
    pub identifiers: HashMap<String, ShaderIdentifier>,
}

/// 在加速结构 buffer 上创建的 `VkAccelerationStructureKHR`
#[derive(Clone, Copy, Debug)]
pub(super) struct VkAccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: NativeResourceId,
    pub top_level: bool,
    /// `vkGetAccelerationStructureDeviceAddressKHR` 的结果，TLAS 的 instance 需要引用这个地址
    pub device_address: u64,
}

#[derive(Default)]
pub(super) struct VkObjects {
    pub allocators: HashMap<u64, VkAllocator>,
    pub fences: HashMap<u64, VkFence>,
    pub resources: HashMap<u64, VkResource>,
    pub heaps: HashMap<u64, VkDescriptorHeap>,
    pub root_signatures: HashMap<u64, VkRootSignature>,
    pub state_objects: HashMap<u64, VkStateObject>,
    /// key 为加速结构在 buffer 中的 GPU 地址
    pub acceleration_structures: HashMap<GpuVirtualAddress, VkAccelerationStructure>,
    /// 新创建的 texture 需要在下一次提交时从 UNDEFINED 转换到初始状态
    pub pending_image_inits: Vec<(NativeResourceId, vk::ImageLayout)>,
}

impl VkObjects {
    pub fn resource(&self, id: NativeResourceId) -> Option<&VkResource> {
        self.resources.get(&id.0)
    }

    /// 包含 `address` 的 buffer
    pub fn buffer_at(&self, address: GpuVirtualAddress) -> Option<(NativeResourceId, &VkResource)> {
        self.resources
            .iter()
            .find(|(_, r)| r.contains_address(address))
            .map(|(id, r)| (NativeResourceId(*id), r))
    }

    /// 根据 GPU descriptor handle 找到 heap 与 slot
    pub fn decode_gpu_handle(&self, raw: u64) -> Option<(&VkDescriptorHeap, u32)> {
        let (heap_id, index) = descriptor_handle::decode(raw, descriptor_handle::GPU_HANDLE_TAG)?;
        let heap = self.heaps.get(&heap_id).filter(|h| h.desc.shader_visible)?;
        (index < heap.desc.capacity).then_some((heap, index))
    }

    pub fn decode_cpu_handle(&self, raw: u64) -> Option<(&VkDescriptorHeap, u32)> {
        let (heap_id, index) = descriptor_handle::decode(raw, descriptor_handle::CPU_HANDLE_TAG)?;
        let heap = self.heaps.get(&heap_id)?;
        (index < heap.desc.capacity).then_some((heap, index))
    }
}
