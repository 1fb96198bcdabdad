//! 场景：plane 与 cube 两个网格，地板与立方体两个 instance

pub mod deployment;
pub mod mesh;
pub mod shape;

use prism_gfx::{
    GfxResult,
    backend::types::AsBuildFlags,
    descriptors::descriptor_pool::DescriptorSlot,
    raytracing::acceleration::{AccelerationStructureBuilder, TlasInstance, TopLevelAs},
    render_context::RenderingContext,
};

use crate::scene::{deployment::Deployment, mesh::PolygonMesh, shape::Shape};

pub struct Scene {
    /// 顺序与 hit group record 的顺序一致
    meshes: Vec<PolygonMesh>,
    tlas: TopLevelAs,
    tlas_srv: DescriptorSlot,
}

impl Scene {
    /// 记录几何上传、BLAS 与 TLAS 的构建，需要在 upload 范围内调用
    ///
    /// TLAS 的 SRV 在 upload 结束之后才能使用。
    pub fn build(ctx: &mut RenderingContext, hit_group: &str) -> GfxResult<Self> {
        let plane = PolygonMesh::create(ctx, &Shape::plane(), hit_group, "plane")?;
        let cube = PolygonMesh::create(ctx, &Shape::cube(), hit_group, "cube")?;

        let placements = [(&plane, Deployment::FLOOR), (&cube, Deployment::CUBE)];
        let instances = placements.map(|(mesh, deployment)| {
            TlasInstance::new(
                mesh.blas(),
                deployment.transform(),
                deployment.instance_id,
                deployment.hit_group_contribution,
            )
        });
        let tlas = AccelerationStructureBuilder::build_top_level(
            &mut ctx.factory(),
            &instances,
            AsBuildFlags::empty(),
            "scene-tlas",
        )?;

        let tlas_address = tlas.address(ctx.resources())?;
        let tlas_srv = ctx.descriptors_mut().create_acceleration_structure_srv(tlas_address)?;

        Ok(Self {
            meshes: vec![plane, cube],
            tlas,
            tlas_srv,
        })
    }

    #[inline]
    pub fn meshes(&self) -> &[PolygonMesh] {
        &self.meshes
    }

    #[inline]
    pub fn tlas(&self) -> &TopLevelAs {
        &self.tlas
    }

    #[inline]
    pub fn tlas_srv(&self) -> DescriptorSlot {
        self.tlas_srv
    }
}
