use prism_gfx::{
    GfxResult,
    backend::types::{AsBuildFlags, Format, GeometryFlags, HeapType, ResourceFlags, TrianglesGeometry},
    descriptors::descriptor_pool::DescriptorSlot,
    raytracing::acceleration::{AccelerationStructureBuilder, BottomLevelAs},
    render_context::RenderingContext,
    resources::handles::BufferHandle,
};

use crate::scene::shape::{Shape, Vertex};

/// 上传到 GPU 的三角形网格，以及它的 BLAS 与 hit group 所需的 SRV
///
/// hit group 的 shader record 按照 (IB, VB) 的顺序携带两个 SRV。
pub struct PolygonMesh {
    name: String,
    vertex_buffer: BufferHandle,
    index_buffer: BufferHandle,
    vertex_srv: DescriptorSlot,
    index_srv: DescriptorSlot,
    vertex_count: u32,
    index_count: u32,
    vertex_stride: u32,
    blas: BottomLevelAs,
    hit_group: String,
}

impl PolygonMesh {
    /// 记录几何数据的上传与 BLAS 的构建，需要在 upload 范围内调用
    pub fn create(ctx: &mut RenderingContext, shape: &Shape, hit_group: &str, name: &str) -> GfxResult<Self> {
        let (vertex_buffer, index_buffer) = {
            let mut factory = ctx.factory();
            let vb = factory.create_buffer(
                shape.vertex_bytes().len() as u64,
                Some(shape.vertex_bytes()),
                HeapType::Default,
                ResourceFlags::empty(),
                &format!("{name}-vb"),
            )?;
            let ib = factory.create_buffer(
                shape.index_bytes().len() as u64,
                Some(shape.index_bytes()),
                HeapType::Default,
                ResourceFlags::empty(),
                &format!("{name}-ib"),
            )?;
            (vb, ib)
        };

        let (vertex_srv, index_srv) = {
            let (resources, descriptors) = ctx.resources_and_descriptors();
            let vertex_srv = descriptors.create_structured_srv(resources, vertex_buffer, Vertex::STRIDE)?;
            let index_srv = descriptors.create_structured_srv(resources, index_buffer, Shape::INDEX_STRIDE)?;
            (vertex_srv, index_srv)
        };

        let geometry = TrianglesGeometry {
            vertex_buffer: ctx.resources().buffer(vertex_buffer)?.gpu_address,
            vertex_stride: Vertex::STRIDE as u64,
            vertex_count: shape.vertices.len() as u32,
            vertex_format: Format::Rgb32Float,
            index_buffer: ctx.resources().buffer(index_buffer)?.gpu_address,
            index_count: shape.indices.len() as u32,
            index_format: Format::R32Uint,
            flags: GeometryFlags::OPAQUE,
        };
        let blas = AccelerationStructureBuilder::build_bottom_level(
            &mut ctx.factory(),
            &[geometry],
            AsBuildFlags::empty(),
            &format!("{name}-blas"),
        )?;

        log::info!(
            "mesh `{}`: {} vertices, {} indices, hit group `{}`",
            name,
            shape.vertices.len(),
            shape.indices.len(),
            hit_group
        );
        Ok(Self {
            name: name.to_string(),
            vertex_buffer,
            index_buffer,
            vertex_srv,
            index_srv,
            vertex_count: shape.vertices.len() as u32,
            index_count: shape.indices.len() as u32,
            vertex_stride: Vertex::STRIDE,
            blas,
            hit_group: hit_group.to_string(),
        })
    }
}

// getters
impl PolygonMesh {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    #[inline]
    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    #[inline]
    pub fn vertex_srv(&self) -> DescriptorSlot {
        self.vertex_srv
    }

    #[inline]
    pub fn index_srv(&self) -> DescriptorSlot {
        self.index_srv
    }

    #[inline]
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    #[inline]
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    #[inline]
    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    #[inline]
    pub fn blas(&self) -> &BottomLevelAs {
        &self.blas
    }

    #[inline]
    pub fn hit_group(&self) -> &str {
        &self.hit_group
    }
}
