use std::rc::Rc;

use prism_crate_tools::resource::PrismPath;
use prism_gfx::{
    GfxResult, GraphicsError,
    backend::{
        GfxBackend,
        types::{Format, ResourceFlags, ResourceState},
    },
    descriptors::descriptor_pool::DescriptorSlot,
    pipelines::{
        shader::{ShaderCompileRequest, ShaderCompiler, create_shader_blob},
        state_object::StateObject,
    },
    raytracing::shader_table::ShaderTable,
    render_context::{FrameParts, RenderingContext},
    resources::handles::TextureHandle,
    swapchain::{OffscreenSwapChain, SwapChain},
};

use crate::{
    pipeline::{shader_table::build_shader_table, signatures::RayTracingSignatures},
    scene::Scene,
    settings::RendererSettings,
};

/// back buffer 与输出纹理的格式
pub const OUTPUT_FORMAT: Format = Format::Rgba8Unorm;

#[derive(Clone, Copy, Debug)]
struct FrameState {
    back_buffer_index: u32,
    dispatched: bool,
}

/// 光追渲染的组合根：持有 rendering context、swap chain、场景以及光追管线的所有对象
///
/// 每一帧：
/// 1. `begin_frame`：back buffer 转换为 `RenderTarget`，使用 clear color 清屏
/// 2. `dispatch_rays`：trace 到输出纹理，然后拷贝到 back buffer
/// 3. `end_frame`：提交、present，并等待本帧完成
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct RayTracingPipeline {
    ctx: RenderingContext,
    swap_chain: OffscreenSwapChain,
    scene: Scene,
    signatures: RayTracingSignatures,
    state_object: StateObject,

    /// ray gen 写入的纹理，帧之间处于 `CopySource` 状态
    output: TextureHandle,
    output_uav: DescriptorSlot,
    shader_table: ShaderTable,

    clear_color: [f32; 4],
    frame: Option<FrameState>,
    frame_count: u64,
}

// 创建与销毁
impl RayTracingPipeline {
    pub fn init(
        backend: Rc<dyn GfxBackend>,
        compiler: &dyn ShaderCompiler,
        settings: &RendererSettings,
    ) -> GfxResult<Self> {
        let (width, height) = (settings.width, settings.height);
        let mut ctx = RenderingContext::new(backend, &settings.rendering_context_config())?;

        let swap_chain = {
            let (resources, descriptors) = ctx.resources_and_descriptors();
            OffscreenSwapChain::new(resources, descriptors, settings.back_buffer_count, width, height, OUTPUT_FORMAT)?
        };

        ctx.begin_upload("scene")?;
        let scene = Scene::build(&mut ctx, &settings.shader.hit_group)?;
        ctx.end_upload()?;

        let signatures = RayTracingSignatures::new(ctx.backend().clone())?;
        let request = ShaderCompileRequest::new(
            PrismPath::resolve(&settings.shader.path),
            &settings.shader.shader_model,
            &settings.shader.exports(),
        );
        let library = create_shader_blob(compiler, &request)?;
        let state_object =
            StateObject::new(ctx.backend().clone(), signatures.state_object_desc(&settings.shader), &library)?;

        let output = ctx.factory().create_texture_2d(
            width,
            height,
            OUTPUT_FORMAT,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            ResourceState::CopySource,
            "raytracing-output",
        )?;
        let output_uav = {
            let (resources, descriptors) = ctx.resources_and_descriptors();
            descriptors.create_texture_uav(resources, output)?
        };

        let caps = ctx.ray_tracing_caps();
        let shader_table = build_shader_table(
            &mut ctx.factory(),
            &state_object,
            caps,
            &settings.shader,
            scene.meshes(),
            output_uav,
            width,
            height,
        )?;

        log::info!("ray tracing pipeline ready: {}x{}, {} meshes", width, height, scene.meshes().len());
        Ok(Self {
            ctx,
            swap_chain,
            scene,
            signatures,
            state_object,
            output,
            output_uav,
            shader_table,
            clear_color: settings.clear_color,
            frame: None,
            frame_count: 0,
        })
    }

    /// 等待 GPU 空闲之后释放所有对象
    pub fn destroy(self) -> GfxResult<()> {
        let Self {
            mut ctx,
            swap_chain,
            signatures,
            state_object,
            ..
        } = self;
        if let Err(err) = ctx.backend().wait_idle() {
            log::error!("wait idle failed before destroying the pipeline: {err}");
        }

        state_object.destroy();
        signatures.destroy();
        let (resources, descriptors) = ctx.resources_and_descriptors();
        if let Err(err) = swap_chain.destroy(resources, descriptors) {
            log::error!("failed to destroy swap chain: {err}");
        }
        ctx.destroy()
    }
}

// 帧
impl RayTracingPipeline {
    pub fn begin_frame(&mut self) -> GfxResult<()> {
        if self.frame.is_some() {
            return Err(GraphicsError::invalid_state(
                "no open frame",
                format!("frame {} has not ended", self.frame_count),
            ));
        }

        let index = self.swap_chain.current_back_buffer_index();
        let back_buffer = self.swap_chain.back_buffer(index)?;
        let rtv = self.swap_chain.rtv(index)?;

        let FrameParts { cmd, resources, .. } = self.ctx.frame_parts()?;
        cmd.begin_label(format!("frame-{}", self.frame_count));
        resources.transition_texture(cmd, back_buffer, ResourceState::RenderTarget)?;
        cmd.clear_render_target_view(rtv.cpu, resources.texture(back_buffer)?.native, self.clear_color);

        self.frame = Some(FrameState {
            back_buffer_index: index,
            dispatched: false,
        });
        Ok(())
    }

    /// trace 到输出纹理，再拷贝到当前的 back buffer，结束时 back buffer 处于 `Present`
    pub fn dispatch_rays(&mut self) -> GfxResult<()> {
        let frame = match &mut self.frame {
            Some(frame) if !frame.dispatched => frame,
            Some(_) => return Err(GraphicsError::invalid_state("one dispatch per frame", "rays already dispatched")),
            None => return Err(GraphicsError::invalid_state("an open frame", "no frame")),
        };
        let back_buffer = self.swap_chain.back_buffer(frame.back_buffer_index)?;

        let FrameParts {
            cmd,
            resources,
            descriptors,
        } = self.ctx.frame_parts()?;
        cmd.begin_label("dispatch-rays");
        cmd.set_descriptor_heaps(&descriptors.shader_visible_heaps());
        cmd.set_compute_root_signature(self.signatures.global.id());
        cmd.set_compute_root_descriptor_table(0, self.scene.tlas_srv().gpu);

        resources.transition_texture(cmd, self.output, ResourceState::UnorderedAccess)?;
        cmd.set_pipeline_state(self.state_object.id());
        cmd.dispatch_rays(self.shader_table.dispatch_desc());

        resources.transition_texture(cmd, self.output, ResourceState::CopySource)?;
        resources.transition_texture(cmd, back_buffer, ResourceState::CopyDest)?;
        cmd.copy_resource(resources.texture(back_buffer)?.native, resources.texture(self.output)?.native);
        resources.transition_texture(cmd, back_buffer, ResourceState::Present)?;
        cmd.end_label();

        frame.dispatched = true;
        Ok(())
    }

    /// 提交、present，并等待本帧完成，返回本帧的 fence 值
    pub fn end_frame(&mut self) -> GfxResult<u64> {
        let frame = self.frame.take().ok_or_else(|| GraphicsError::invalid_state("an open frame", "no frame"))?;
        let back_buffer = self.swap_chain.back_buffer(frame.back_buffer_index)?;

        {
            let FrameParts { cmd, resources, .. } = self.ctx.frame_parts()?;
            // dispatch 之后已经是 Present，barrier 会被忽略
            resources.transition_texture(cmd, back_buffer, ResourceState::Present)?;
            cmd.end_label();
        }
        self.ctx.close()?;
        self.swap_chain.present(self.ctx.resources())?;
        let fence_value = self.ctx.end_frame_sync()?;

        log::debug!(
            "frame {} done: back buffer #{}, dispatched: {}, fence value {}",
            self.frame_count,
            frame.back_buffer_index,
            frame.dispatched,
            fence_value
        );
        self.frame_count += 1;
        Ok(fence_value)
    }

    pub fn render_frame(&mut self) -> GfxResult<u64> {
        self.begin_frame()?;
        self.dispatch_rays()?;
        self.end_frame()
    }
}

// getters
impl RayTracingPipeline {
    #[inline]
    pub fn context(&self) -> &RenderingContext {
        &self.ctx
    }

    #[inline]
    pub fn swap_chain(&self) -> &OffscreenSwapChain {
        &self.swap_chain
    }

    #[inline]
    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    #[inline]
    pub fn state_object(&self) -> &StateObject {
        &self.state_object
    }

    #[inline]
    pub fn output(&self) -> TextureHandle {
        self.output
    }

    #[inline]
    pub fn output_uav(&self) -> DescriptorSlot {
        self.output_uav
    }

    #[inline]
    pub fn shader_table(&self) -> &ShaderTable {
        &self.shader_table
    }

    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    #[inline]
    pub fn is_frame_open(&self) -> bool {
        self.frame.is_some()
    }
}

#[cfg(test)]
mod tests {
    use prism_gfx::{backend::headless::HeadlessBackend, pipelines::shader::SourceLibraryCompiler};

    use super::*;

    const WIDTH: u32 = 8;
    const HEIGHT: u32 = 4;

    fn headless_pipeline() -> (Rc<HeadlessBackend>, RayTracingPipeline) {
        let headless = Rc::new(HeadlessBackend::new());
        let settings = RendererSettings {
            width: WIDTH,
            height: HEIGHT,
            ..Default::default()
        };
        let pipeline = RayTracingPipeline::init(headless.clone(), &SourceLibraryCompiler, &settings).unwrap();
        (headless, pipeline)
    }

    fn texture_data(headless: &HeadlessBackend, pipeline: &RayTracingPipeline, texture: TextureHandle) -> Vec<u8> {
        let native = pipeline.context().resources().texture(texture).unwrap().native;
        headless.resource_data(native).unwrap()
    }

    fn texture_state(headless: &HeadlessBackend, pipeline: &RayTracingPipeline, texture: TextureHandle) -> ResourceState {
        let native = pipeline.context().resources().texture(texture).unwrap().native;
        headless.resource_state(native).unwrap()
    }

    fn texel(data: &[u8], x: u32, y: u32) -> &[u8] {
        let offset = ((y * WIDTH + x) * 4) as usize;
        &data[offset..offset + 4]
    }

    #[test]
    fn test_init_uploads_scene_once() {
        let (headless, pipeline) = headless_pipeline();
        assert_eq!(headless.submit_count(), 1);
        assert_eq!(pipeline.context().fence().completed_value().unwrap(), 1);
        assert_eq!(pipeline.scene().meshes().len(), 2);
        assert_eq!(texture_state(&headless, &pipeline, pipeline.output()), ResourceState::CopySource);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_shader_table_records() {
        let (headless, pipeline) = headless_pipeline();
        let table = pipeline.shader_table();
        let layout = table.layout();
        assert_eq!(layout.ray_generation.count, 1);
        assert_eq!(layout.miss.count, 1);
        assert_eq!(layout.hit_group.count, 2);

        let dispatch = table.dispatch_desc();
        assert_eq!((dispatch.width, dispatch.height, dispatch.depth), (WIDTH, HEIGHT, 1));

        let native = pipeline.context().resources().buffer(table.buffer()).unwrap().native;
        let bytes = headless.resource_data(native).unwrap();
        let id_size = 32;

        let ray_gen = layout.ray_generation.offset as usize + id_size;
        assert_eq!(bytes[ray_gen..ray_gen + 8], pipeline.output_uav().gpu.0.to_le_bytes());

        // hit group record：IB 在前，VB 在后
        for (i, mesh) in pipeline.scene().meshes().iter().enumerate() {
            let record = (layout.hit_group.offset + i as u64 * layout.hit_group.stride) as usize + id_size;
            assert_eq!(bytes[record..record + 8], mesh.index_srv().gpu.0.to_le_bytes());
            assert_eq!(bytes[record + 8..record + 16], mesh.vertex_srv().gpu.0.to_le_bytes());
        }
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_render_frame_copies_output_to_back_buffer() {
        let (headless, mut pipeline) = headless_pipeline();
        let back_buffer = pipeline.swap_chain().back_buffer(0).unwrap();

        assert_eq!(pipeline.render_frame().unwrap(), 2);

        let output = texture_data(&headless, &pipeline, pipeline.output());
        assert_eq!(texture_data(&headless, &pipeline, back_buffer), output);
        assert_eq!(texel(&output, 0, 0), [0, 0, 0, 255]);
        assert_eq!(texel(&output, WIDTH - 1, HEIGHT - 1), [255, 255, 0, 255]);

        assert_eq!(texture_state(&headless, &pipeline, back_buffer), ResourceState::Present);
        assert_eq!(texture_state(&headless, &pipeline, pipeline.output()), ResourceState::CopySource);
        assert_eq!(pipeline.swap_chain().present_count(), 1);
        assert_eq!(pipeline.swap_chain().current_back_buffer_index(), 1);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_fence_value_per_frame() {
        let (_headless, mut pipeline) = headless_pipeline();
        for frame in 1..=3u64 {
            assert_eq!(pipeline.render_frame().unwrap(), frame + 1);
        }
        assert_eq!(pipeline.frame_count(), 3);
        assert_eq!(pipeline.context().fence().completed_value().unwrap(), 4);
        assert_eq!(pipeline.swap_chain().current_back_buffer_index(), 1);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_frame_without_dispatch_keeps_clear_color() {
        let (headless, mut pipeline) = headless_pipeline();
        let back_buffer = pipeline.swap_chain().back_buffer(0).unwrap();

        pipeline.begin_frame().unwrap();
        pipeline.end_frame().unwrap();

        let data = texture_data(&headless, &pipeline, back_buffer);
        assert!(data.chunks_exact(4).all(|texel| texel == [153, 204, 102, 255]));
        assert_eq!(texture_state(&headless, &pipeline, back_buffer), ResourceState::Present);
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_frame_order_is_enforced() {
        let (_headless, mut pipeline) = headless_pipeline();
        assert!(matches!(pipeline.dispatch_rays(), Err(GraphicsError::InvalidState { .. })));
        assert!(matches!(pipeline.end_frame(), Err(GraphicsError::InvalidState { .. })));

        pipeline.begin_frame().unwrap();
        assert!(matches!(pipeline.begin_frame(), Err(GraphicsError::InvalidState { .. })));
        pipeline.dispatch_rays().unwrap();
        assert!(matches!(pipeline.dispatch_rays(), Err(GraphicsError::InvalidState { .. })));
        pipeline.end_frame().unwrap();
        assert!(!pipeline.is_frame_open());
        pipeline.destroy().unwrap();
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (headless, mut pipeline) = headless_pipeline();
        pipeline.render_frame().unwrap();
        pipeline.destroy().unwrap();
        assert_eq!(headless.live_resource_count(), 0);
    }
}
