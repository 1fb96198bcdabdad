//! 后端无关的设备词汇：资源描述、状态、描述符、加速结构输入与 DispatchRays 参数

use bitflags::bitflags;

macro_rules! native_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u64);

            impl $name {
                #[inline]
                pub fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

native_id! {
    /// 后端的 command allocator（Vulkan 中对应 command pool + command buffer）
    AllocatorId,
    /// 后端的 fence（Vulkan 中对应 timeline semaphore）
    FenceId,
    /// 后端的 committed resource（buffer 或 texture）
    NativeResourceId,
    /// 后端的 descriptor heap
    DescriptorHeapId,
    /// 后端的 root signature
    RootSignatureId,
    /// 后端的光追 state object
    StateObjectId,
}

/// GPU 虚拟地址
pub type GpuVirtualAddress = u64;

// region 资源

/// 资源所在的 heap 类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// 仅 GPU 可见，初始数据需要通过 staging buffer 拷贝
    Default,
    /// CPU 可写、GPU 可读
    Upload,
    /// GPU 可写、CPU 可读
    Readback,
}

impl HeapType {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        matches!(self, HeapType::Upload | HeapType::Readback)
    }
}

/// 资源状态
///
/// 状态转换必须通过显式的 barrier 完成，不依赖隐式的状态提升。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    CopySource,
    CopyDest,
    /// upload heap 资源的固定状态
    GenericRead,
    UnorderedAccess,
    NonPixelShaderResource,
    AccelerationStructure,
}

impl ResourceState {
    /// 该状态下资源可以作为拷贝源
    #[inline]
    pub fn allows_copy_source(self) -> bool {
        matches!(self, ResourceState::CopySource | ResourceState::GenericRead)
    }

    /// 该状态下资源可以被 shader 或者加速结构构建读取
    #[inline]
    pub fn allows_shader_read(self) -> bool {
        matches!(self, ResourceState::NonPixelShaderResource | ResourceState::GenericRead)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u32 {
        const ALLOW_UNORDERED_ACCESS = 1 << 0;
        const ALLOW_RENDER_TARGET = 1 << 1;
        const ALLOW_DEPTH_STENCIL = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgb32Float,
    R32Uint,
    R16Uint,
}

impl Format {
    pub fn bytes_per_element(self) -> u32 {
        match self {
            Format::Unknown => 1,
            Format::Rgba8Unorm | Format::Bgra8Unorm | Format::R32Uint => 4,
            Format::Rgb32Float => 12,
            Format::R16Uint => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub heap: HeapType,
    pub flags: ResourceFlags,
    pub initial_state: ResourceState,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub flags: ResourceFlags,
    pub initial_state: ResourceState,
    pub name: String,
}

impl TextureDesc {
    #[inline]
    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_element() as u64
    }
}

/// 后端创建资源后返回的信息
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeResource {
    pub id: NativeResourceId,
    /// texture 的地址为 0
    pub gpu_address: GpuVirtualAddress,
    pub size: u64,
}

// endregion

// region 描述符

/// descriptor heap 的类型，每种类型在引擎生命周期内只有一个 heap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorHeapType {
    CbvSrvUav,
    Rtv,
    Dsv,
    Sampler,
}

impl DescriptorHeapType {
    pub const ALL: [DescriptorHeapType; 4] =
        [DescriptorHeapType::CbvSrvUav, DescriptorHeapType::Rtv, DescriptorHeapType::Dsv, DescriptorHeapType::Sampler];

    /// 只有 CBV/SRV/UAV 和 Sampler 可以对 shader 可见
    #[inline]
    pub fn can_be_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapType::CbvSrvUav | DescriptorHeapType::Sampler)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl GpuDescriptorHandle {
    pub const NULL: GpuDescriptorHandle = GpuDescriptorHandle(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub ty: DescriptorHeapType,
    pub capacity: u32,
    pub shader_visible: bool,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub id: DescriptorHeapId,
    pub cpu_start: CpuDescriptorHandle,
    /// 不是 shader visible 的 heap 没有 GPU handle
    pub gpu_start: Option<GpuDescriptorHandle>,
    pub increment: u32,
}

/// 写入 descriptor slot 的 view
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewDesc {
    /// structured buffer 的 SRV
    StructuredBuffer {
        resource: NativeResourceId,
        first_element: u64,
        num_elements: u32,
        stride: u32,
    },
    /// 加速结构的 SRV，通过 GPU 地址定位
    AccelerationStructure { location: GpuVirtualAddress },
    /// 2D texture 的 UAV
    Texture2dUav { resource: NativeResourceId, format: Format },
    /// render target view
    RenderTarget { resource: NativeResourceId, format: Format },
}

// endregion

// region 加速结构

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct AsBuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY = 1 << 4;
        const PERFORM_UPDATE = 1 << 5;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct GeometryFlags: u32 {
        const OPAQUE = 1 << 0;
        const NO_DUPLICATE_ANYHIT_INVOCATION = 1 << 1;
    }
}

/// 三角形几何体，顶点格式固定为 float3 位置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrianglesGeometry {
    pub vertex_buffer: GpuVirtualAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: Format,
    pub index_buffer: GpuVirtualAddress,
    pub index_count: u32,
    pub index_format: Format,
    pub flags: GeometryFlags,
}

impl TrianglesGeometry {
    #[inline]
    pub fn triangle_count(&self) -> u32 {
        if self.index_count > 0 { self.index_count / 3 } else { self.vertex_count / 3 }
    }
}

/// 加速结构构建的输入
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsInputs {
    BottomLevel {
        geometries: Vec<TrianglesGeometry>,
        flags: AsBuildFlags,
    },
    TopLevel {
        /// instance desc 数组的起始地址
        instance_descs: GpuVirtualAddress,
        instance_count: u32,
        flags: AsBuildFlags,
    },
}

impl AsInputs {
    #[inline]
    pub fn flags(&self) -> AsBuildFlags {
        match self {
            AsInputs::BottomLevel { flags, .. } | AsInputs::TopLevel { flags, .. } => *flags,
        }
    }

    #[inline]
    pub fn is_top_level(&self) -> bool {
        matches!(self, AsInputs::TopLevel { .. })
    }

    /// bottom level 为几何体数量，top level 为 instance 数量
    pub fn input_count(&self) -> u32 {
        match self {
            AsInputs::BottomLevel { geometries, .. } => geometries.len() as u32,
            AsInputs::TopLevel { instance_count, .. } => *instance_count,
        }
    }
}

/// 设备给出的加速结构内存需求
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct AsPrebuildInfo {
    pub result_data_max_size: u64,
    pub scratch_data_size: u64,
    pub update_scratch_data_size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AsBuildDesc {
    pub inputs: AsInputs,
    pub dest: GpuVirtualAddress,
    pub scratch: GpuVirtualAddress,
    /// 增量更新时的源加速结构
    pub source: Option<GpuVirtualAddress>,
}

// endregion

// region 光追 dispatch

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GpuAddressRange {
    pub start: GpuVirtualAddress,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GpuAddressRangeAndStride {
    pub start: GpuVirtualAddress,
    pub size: u64,
    pub stride: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DispatchRaysDesc {
    pub ray_generation: GpuAddressRange,
    pub miss: GpuAddressRangeAndStride,
    pub hit_group: GpuAddressRangeAndStride,
    pub callable: GpuAddressRangeAndStride,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// state object 中某个 export 的 shader identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(Vec<u8>);

impl ShaderIdentifier {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// 设备的光追相关常量
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RayTracingCaps {
    pub shader_identifier_size: u32,
    pub shader_record_alignment: u32,
    pub shader_table_alignment: u32,
    pub max_recursion_depth: u32,
}

impl RayTracingCaps {
    /// D3D12 规定的常量
    pub const D3D12: RayTracingCaps = RayTracingCaps {
        shader_identifier_size: 32,
        shader_record_alignment: 32,
        shader_table_alignment: 64,
        max_recursion_depth: 31,
    };
}

// endregion

/// 等待 fence 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWait {
    Reached,
    TimedOut,
}
