use std::rc::Rc;

use prism_gfx::{
    GfxResult,
    backend::GfxBackend,
    pipelines::{
        root_signature::{DescriptorRange, RootSignature, RootSignatureDesc},
        state_object::{HitGroupDesc, LocalRootAssociation, ShaderExport, ShaderStage, StateObjectDesc},
    },
};

use crate::settings::ShaderSettings;

/// 光追管线使用的 root signature
///
/// - global：`t0` 为 TLAS
/// - ray gen local：`u0` 为输出纹理
/// - hit group local：`t0 space1` 为 index buffer，`t1 space1` 为 vertex buffer
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct RayTracingSignatures {
    pub global: RootSignature,
    pub ray_gen: RootSignature,
    pub hit_group: RootSignature,
}

impl RayTracingSignatures {
    pub fn new(backend: Rc<dyn GfxBackend>) -> GfxResult<Self> {
        let global = RootSignature::new(
            backend.clone(),
            RootSignatureDesc::global("global").descriptor_table(&[DescriptorRange::srv(0, 0)]),
        )?;
        let ray_gen = RootSignature::new(
            backend.clone(),
            RootSignatureDesc::local("ray-gen").descriptor_table(&[DescriptorRange::uav(0, 0)]),
        )?;
        let hit_group = RootSignature::new(
            backend,
            RootSignatureDesc::local("hit-group")
                .descriptor_table(&[DescriptorRange::srv(0, 1)])
                .descriptor_table(&[DescriptorRange::srv(1, 1)]),
        )?;
        Ok(Self {
            global,
            ray_gen,
            hit_group,
        })
    }

    /// library export、hit group、shader config、pipeline config 以及 local root signature 的关联
    pub fn state_object_desc(&self, shader: &ShaderSettings) -> StateObjectDesc {
        StateObjectDesc {
            name: "raytracing".to_string(),
            library_exports: vec![
                ShaderExport::new(&shader.ray_gen, ShaderStage::RayGeneration),
                ShaderExport::new(&shader.closest_hit, ShaderStage::ClosestHit),
                ShaderExport::new(&shader.miss, ShaderStage::Miss),
            ],
            hit_groups: vec![HitGroupDesc::triangles(&shader.hit_group, &shader.closest_hit)],
            payload_size: shader.payload_size,
            attribute_size: shader.attribute_size,
            max_recursion_depth: shader.max_recursion_depth,
            global_root_signature: self.global.id(),
            local_root_signatures: vec![
                LocalRootAssociation::new(&self.ray_gen, &[shader.ray_gen.as_str()]),
                LocalRootAssociation::new(&self.hit_group, &[shader.hit_group.as_str()]),
            ],
        }
    }

    pub fn destroy(self) {
        self.global.destroy();
        self.ray_gen.destroy();
        self.hit_group.destroy();
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::backend::headless::HeadlessBackend;

    use super::*;

    #[test]
    fn test_state_object_desc() {
        let headless = Rc::new(HeadlessBackend::new());
        let signatures = RayTracingSignatures::new(headless.clone()).unwrap();
        let desc = signatures.state_object_desc(&ShaderSettings::default());

        assert!(desc.validate(&headless.ray_tracing_caps()).is_ok());
        assert_eq!(desc.local_argument_size("mainRayGen"), 8);
        assert_eq!(desc.local_argument_size("hitGroup"), 16);
        assert_eq!(desc.local_argument_size("mainMS"), 0);
        assert_eq!(desc.identifiable_exports().collect::<Vec<_>>(), vec!["mainRayGen", "mainMS", "hitGroup"]);
        assert_eq!((desc.payload_size, desc.attribute_size, desc.max_recursion_depth), (16, 8, 16));

        signatures.destroy();
    }
}
