use std::{path::PathBuf, process::ExitCode, rc::Rc};

use anyhow::Context;
use prism_crate_tools::{init_log::init_log, resource::PrismPath};
use prism_gfx::{
    backend::{GfxBackend, headless::HeadlessBackend},
    pipelines::shader::{DxcCompiler, ShaderCompiler, SourceLibraryCompiler},
};
use prism_renderer::{
    RayTracingPipeline, RendererSettings,
    settings::{BackendKind, ShaderSettings},
};

/// 第一个命令行参数为配置文件路径，缺省时使用 `config/prism.toml`
fn load_settings() -> anyhow::Result<RendererSettings> {
    match std::env::args().nth(1) {
        Some(path) => RendererSettings::from_file(PathBuf::from(path)),
        None => {
            let path = PrismPath::config_path("prism.toml");
            if path.exists() {
                RendererSettings::from_file(path)
            } else {
                log::warn!("{path:?} not found, using default settings");
                Ok(RendererSettings::default())
            }
        }
    }
}

#[cfg(feature = "vulkan")]
fn create_vulkan_backend() -> anyhow::Result<Rc<dyn GfxBackend>> {
    use prism_gfx::backend::vulkan::{VulkanBackend, VulkanDeviceConfig};

    let backend = VulkanBackend::new(&VulkanDeviceConfig::default()).context("创建 Vulkan 设备失败")?;
    Ok(Rc::new(backend))
}

#[cfg(not(feature = "vulkan"))]
fn create_vulkan_backend() -> anyhow::Result<Rc<dyn GfxBackend>> {
    anyhow::bail!("Vulkan 后端未启用，需要使用 `--features vulkan` 重新编译")
}

/// headless 后端只检查入口函数，Vulkan 后端通过 dxc 编译为 SPIR-V
fn create_backend(
    kind: BackendKind,
    shader: &ShaderSettings,
) -> anyhow::Result<(Rc<dyn GfxBackend>, Box<dyn ShaderCompiler>)> {
    match kind {
        BackendKind::Headless => Ok((Rc::new(HeadlessBackend::new()), Box::new(SourceLibraryCompiler))),
        BackendKind::Vulkan => {
            let compiler = DxcCompiler::new(&shader.dxc, PrismPath::resolve(&shader.output_dir), true);
            Ok((create_vulkan_backend()?, Box::new(compiler)))
        }
    }
}

fn run() -> anyhow::Result<()> {
    let settings = load_settings()?;
    log::info!(
        "settings: {}x{}, backend {:?}, {} frames",
        settings.width,
        settings.height,
        settings.backend,
        settings.frames
    );

    let (backend, compiler) = create_backend(settings.backend, &settings.shader)?;
    let mut pipeline =
        RayTracingPipeline::init(backend, compiler.as_ref(), &settings).context("初始化光追管线失败")?;

    let rendered = (0..settings.frames).try_for_each(|frame| {
        pipeline.render_frame().with_context(|| format!("渲染第 {frame} 帧失败"))?;
        Ok::<_, anyhow::Error>(())
    });
    // 渲染失败时也需要释放设备对象
    let destroyed = pipeline.destroy().context("销毁光追管线失败");
    rendered?;
    destroyed?;

    log::info!("rendered {} frames", settings.frames);
    Ok(())
}

fn main() -> ExitCode {
    init_log();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
