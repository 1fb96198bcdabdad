//! 后端无关的词汇到 Vulkan 类型的转换

use ash::vk;

use crate::backend::types::{
    AsBuildFlags, AsInputs, Format, GeometryFlags, HeapType, ResourceFlags, ResourceState, TrianglesGeometry,
};

/// 资源状态在 Vulkan 中对应的 layout 以及同步范围
#[derive(Clone, Copy, Debug)]
pub(super) struct StateScope {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// 光追相关的 shader 阶段以及加速结构构建
const RT_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR.as_raw()
        | vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR.as_raw(),
);

pub(super) fn state_scope(state: ResourceState) -> StateScope {
    let (layout, stage, access) = match state {
        ResourceState::Common => (
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
        // 离屏的 swapchain 不需要 PRESENT_SRC_KHR
        ResourceState::Present => {
            (vk::ImageLayout::GENERAL, vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ)
        }
        // clear 通过 vkCmdClearColorImage 实现
        ResourceState::RenderTarget => {
            (vk::ImageLayout::GENERAL, vk::PipelineStageFlags2::CLEAR, vk::AccessFlags2::TRANSFER_WRITE)
        }
        ResourceState::CopySource => {
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_READ)
        }
        ResourceState::CopyDest => {
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE)
        }
        ResourceState::GenericRead => {
            (vk::ImageLayout::GENERAL, vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ)
        }
        ResourceState::UnorderedAccess => (
            vk::ImageLayout::GENERAL,
            RT_STAGES,
            vk::AccessFlags2::SHADER_STORAGE_READ
                | vk::AccessFlags2::SHADER_STORAGE_WRITE
                | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
        // 加速结构构建读取顶点/索引时也使用 SHADER_READ
        ResourceState::NonPixelShaderResource => (vk::ImageLayout::GENERAL, RT_STAGES, vk::AccessFlags2::SHADER_READ),
        ResourceState::AccelerationStructure => (
            vk::ImageLayout::GENERAL,
            RT_STAGES,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
    };
    StateScope { layout, stage, access }
}

/// UAV barrier 的同步范围：之前的加速结构构建/storage 写入，到之后的构建与 trace
pub(super) fn uav_scope() -> (StateScope, StateScope) {
    let src = StateScope {
        layout: vk::ImageLayout::GENERAL,
        stage: RT_STAGES,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR | vk::AccessFlags2::SHADER_STORAGE_WRITE,
    };
    let dst = StateScope {
        layout: vk::ImageLayout::GENERAL,
        stage: RT_STAGES,
        access: vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
            | vk::AccessFlags2::SHADER_STORAGE_READ
            | vk::AccessFlags2::SHADER_READ,
    };
    (src, dst)
}

pub(super) fn format(format: Format) -> vk::Format {
    match format {
        Format::Unknown => vk::Format::UNDEFINED,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R16Uint => vk::Format::R16_UINT,
    }
}

pub(super) fn index_type(format: Format) -> vk::IndexType {
    match format {
        Format::R16Uint => vk::IndexType::UINT16,
        Format::R32Uint => vk::IndexType::UINT32,
        _ => vk::IndexType::NONE_KHR,
    }
}

/// buffer 需要覆盖所有可能的用途：拷贝、storage、加速结构以及 shader table
pub(super) fn buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
}

pub(super) fn image_usage(flags: ResourceFlags) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        usage |= vk::ImageUsageFlags::STORAGE;
    }
    if flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
        usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    usage
}

/// upload/readback heap 需要 host 访问，映射之后一直保持映射
pub(super) fn allocation_info(heap: HeapType) -> vk_mem::AllocationCreateInfo {
    let (usage, flags) = match heap {
        HeapType::Default => (vk_mem::MemoryUsage::AutoPreferDevice, vk_mem::AllocationCreateFlags::empty()),
        HeapType::Upload => {
            (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE)
        }
        HeapType::Readback => (vk_mem::MemoryUsage::AutoPreferHost, vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM),
    };
    vk_mem::AllocationCreateInfo {
        usage,
        flags,
        ..Default::default()
    }
}

pub(super) fn build_flags(flags: AsBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let table = [
        (AsBuildFlags::ALLOW_UPDATE, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
        (AsBuildFlags::ALLOW_COMPACTION, vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION),
        (AsBuildFlags::PREFER_FAST_TRACE, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE),
        (AsBuildFlags::PREFER_FAST_BUILD, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD),
        (AsBuildFlags::MINIMIZE_MEMORY, vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY),
    ];
    table
        .into_iter()
        .filter(|(ours, _)| flags.contains(*ours))
        .fold(vk::BuildAccelerationStructureFlagsKHR::empty(), |acc, (_, theirs)| acc | theirs)
}

fn geometry_flags(flags: GeometryFlags) -> vk::GeometryFlagsKHR {
    let mut out = vk::GeometryFlagsKHR::empty();
    if flags.contains(GeometryFlags::OPAQUE) {
        out |= vk::GeometryFlagsKHR::OPAQUE;
    }
    if flags.contains(GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION) {
        out |= vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION;
    }
    out
}

fn triangles(geometry: &TrianglesGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(format(geometry.vertex_format))
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.vertex_buffer,
        })
        .vertex_stride(geometry.vertex_stride)
        .max_vertex(geometry.vertex_count.saturating_sub(1))
        .index_type(index_type(geometry.index_format));
    if geometry.index_count > 0 {
        triangles = triangles.index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: geometry.index_buffer,
        });
    }

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(geometry_flags(geometry.flags))
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
}

/// 加速结构输入转换后的 geometry 以及每个 geometry 的 primitive 数量
pub(super) struct BuildGeometries {
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    pub primitive_counts: Vec<u32>,
}

impl BuildGeometries {
    pub fn new(inputs: &AsInputs) -> Self {
        match inputs {
            AsInputs::BottomLevel { geometries, flags } => Self {
                ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                flags: build_flags(*flags),
                geometries: geometries.iter().map(triangles).collect(),
                primitive_counts: geometries.iter().map(TrianglesGeometry::triangle_count).collect(),
            },
            AsInputs::TopLevel {
                instance_descs,
                instance_count,
                flags,
            } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    // instance desc 是连续的数组，而不是指针数组
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: *instance_descs,
                    });
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances });
                Self {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    flags: build_flags(*flags),
                    geometries: vec![geometry],
                    primitive_counts: vec![*instance_count],
                }
            }
        }
    }

    /// 部分填充的 build info：dst、src 与 scratch 由调用者补全
    pub fn geometry_info(&self) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.ty)
            .flags(self.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
    }

    pub fn range_infos(&self) -> Vec<vk::AccelerationStructureBuildRangeInfoKHR> {
        self.primitive_counts
            .iter()
            .map(|count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(*count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_flags() {
        let flags = build_flags(AsBuildFlags::ALLOW_UPDATE | AsBuildFlags::PREFER_FAST_TRACE);
        assert_eq!(
            flags,
            vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        );
        // PERFORM_UPDATE 对应 build mode，而不是 flag
        assert!(build_flags(AsBuildFlags::PERFORM_UPDATE).is_empty());
    }

    #[test]
    fn test_copy_states_use_transfer_layouts() {
        assert_eq!(state_scope(ResourceState::CopyDest).layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(state_scope(ResourceState::CopySource).layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(state_scope(ResourceState::UnorderedAccess).layout, vk::ImageLayout::GENERAL);
    }
}
