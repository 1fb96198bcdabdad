//! 模拟 GPU 上的对象

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use crate::{
    backend::{
        descriptor_handle::{self, CPU_HANDLE_TAG, GPU_HANDLE_TAG},
        types::{
            AllocatorId, CpuDescriptorHandle, DescriptorHeapDesc, FenceId, Format, GpuDescriptorHandle, GpuVirtualAddress,
            HeapType, NativeResourceId, ResourceFlags, ResourceState, ShaderIdentifier, ViewDesc,
        },
    },
    pipelines::{root_signature::RootSignatureDesc, state_object::StateObjectDesc},
};

/// buffer 的 GPU 地址从这里开始分配，保证不会出现 0 地址
pub(super) const GPU_ADDRESS_BASE: GpuVirtualAddress = 0x1_0000_0000;
/// 满足加速结构 256 字节对齐以及 shader table 64 字节对齐
pub(super) const GPU_ADDRESS_ALIGNMENT: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum SimResourceKind {
    Buffer,
    Texture { width: u32, height: u32, format: Format },
}

/// 加速结构构建的记录，用于检查 TLAS 引用的 BLAS 是否已经构建并且经过了 UAV barrier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct AsBuildRecord {
    pub top_level: bool,
    pub uav_pending: bool,
}

#[derive(Debug)]
pub(super) struct SimResource {
    pub name: String,
    pub kind: SimResourceKind,
    pub heap: HeapType,
    pub flags: ResourceFlags,
    pub gpu_address: GpuVirtualAddress,
    pub data: Vec<u8>,
    /// 提交时刻跟踪的状态
    pub state: ResourceState,
    pub as_build: Option<AsBuildRecord>,
}

impl SimResource {
    #[inline]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn contains_address(&self, address: GpuVirtualAddress) -> bool {
        self.kind == SimResourceKind::Buffer
            && address >= self.gpu_address
            && address < self.gpu_address + self.size().max(1)
    }
}

#[derive(Debug)]
pub(super) struct SimAllocator {
    pub name: String,
    /// 已经提交但是还没有执行完的 command list 数量
    pub executing: usize,
}

#[derive(Debug)]
pub(super) struct SimFence {
    pub name: String,
    pub completed: u64,
}

#[derive(Debug)]
pub(super) struct SimDescriptorHeap {
    pub desc: DescriptorHeapDesc,
    pub slots: Vec<Option<ViewDesc>>,
}

#[derive(Debug)]
pub(super) struct SimStateObject {
    pub desc: StateObjectDesc,
    pub identifiers: HashMap<String, ShaderIdentifier>,
}

impl SimStateObject {
    /// 根据 identifier 反查 export
    pub fn export_of(&self, identifier: &[u8]) -> Option<&str> {
        self.identifiers.iter().find(|(_, id)| id.as_bytes() == identifier).map(|(name, _)| name.as_str())
    }
}

/// GPU 时间线上排队的操作
#[derive(Debug)]
pub(super) enum QueueOp {
    Execute { allocator: AllocatorId, effects: Vec<Effect> },
    Signal { fence: FenceId, value: u64 },
}

/// command list 在 GPU 上执行时对资源内容的影响
#[derive(Clone, Debug, PartialEq)]
pub(super) enum Effect {
    Copy {
        dst: NativeResourceId,
        dst_offset: u64,
        src: NativeResourceId,
        src_offset: u64,
        size: u64,
    },
    Fill { target: NativeResourceId, color: [f32; 4] },
    /// 在加速结构的结果 buffer 中写入一个头部：`b"BLAS" | b"TLAS"` + 输入数量
    WriteAsHeader {
        dest: NativeResourceId,
        offset: u64,
        top_level: bool,
        input_count: u32,
    },
    /// 光追输出：按像素坐标写入渐变色
    TraceGradient { output: NativeResourceId, width: u32, height: u32 },
}

#[derive(Default, Debug)]
pub(super) struct SimObjects {
    pub resources: HashMap<u64, SimResource>,
    pub allocators: HashMap<u64, SimAllocator>,
    pub fences: HashMap<u64, SimFence>,
    pub heaps: HashMap<u64, SimDescriptorHeap>,
    pub root_signatures: HashMap<u64, RootSignatureDesc>,
    pub state_objects: HashMap<u64, SimStateObject>,
}

impl SimObjects {
    pub fn resource_at(&self, address: GpuVirtualAddress) -> Option<(NativeResourceId, &SimResource)> {
        self.resources
            .iter()
            .find(|(_, res)| res.contains_address(address))
            .map(|(id, res)| (NativeResourceId(*id), res))
    }

    pub fn decode_gpu_handle(&self, handle: GpuDescriptorHandle) -> Option<(u64, u32)> {
        decode_handle(handle.0, GPU_HANDLE_TAG, |heap| self.heaps.get(&heap).filter(|h| h.desc.shader_visible))
    }

    pub fn decode_cpu_handle(&self, handle: CpuDescriptorHandle) -> Option<(u64, u32)> {
        decode_handle(handle.0, CPU_HANDLE_TAG, |heap| self.heaps.get(&heap))
    }

    pub fn view_at(&self, heap: u64, index: u32) -> Option<&ViewDesc> {
        self.heaps.get(&heap)?.slots.get(index as usize)?.as_ref()
    }
}

fn decode_handle<'a>(
    raw: u64,
    tag: u64,
    heap_of: impl Fn(u64) -> Option<&'a SimDescriptorHeap>,
) -> Option<(u64, u32)> {
    let (heap_id, index) = descriptor_handle::decode(raw, tag)?;
    let heap = heap_of(heap_id)?;
    (index < heap.desc.capacity).then_some((heap_id, index))
}

/// 确定性的 shader identifier：同一个 state object 中的同一个 export 总是得到相同的字节
pub(super) fn make_shader_identifier(state_object: u64, export: &str, size: u32) -> ShaderIdentifier {
    let bytes = (0..size.div_ceil(8) as u64)
        .flat_map(|chunk| {
            let mut hasher = DefaultHasher::new();
            (state_object, export, chunk).hash(&mut hasher);
            hasher.finish().to_le_bytes()
        })
        .take(size as usize)
        .collect();
    ShaderIdentifier::new(bytes)
}

/// 将 [0, 1] 的颜色分量转换为 8 bit unorm
#[inline]
pub(super) fn to_unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}
