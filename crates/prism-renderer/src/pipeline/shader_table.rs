use prism_gfx::{
    GfxResult,
    backend::types::RayTracingCaps,
    descriptors::descriptor_pool::DescriptorSlot,
    pipelines::state_object::StateObject,
    raytracing::shader_table::{ShaderTable, ShaderTableBuilder},
    resources::resource_factory::ResourceFactory,
};

use crate::{scene::mesh::PolygonMesh, settings::ShaderSettings};

/// 场景的 shader table
///
/// - ray gen：identifier + 输出纹理的 UAV
/// - miss：identifier
/// - hit group：每个网格一条 record，identifier + IB 的 SRV + VB 的 SRV
pub fn build_shader_table(
    factory: &mut ResourceFactory,
    state_object: &StateObject,
    caps: RayTracingCaps,
    shader: &ShaderSettings,
    meshes: &[PolygonMesh],
    output: DescriptorSlot,
    width: u32,
    height: u32,
) -> GfxResult<ShaderTable> {
    let builder = ShaderTableBuilder::new(state_object, caps)
        .ray_generation(&shader.ray_gen, &[output.gpu])?
        .miss(&shader.miss, &[])?;
    let builder = meshes.iter().try_fold(builder, |builder, mesh| {
        builder.hit_group(mesh.hit_group(), &[mesh.index_srv().gpu, mesh.vertex_srv().gpu])
    })?;
    builder.build(factory, width, height, "shader-table")
}
