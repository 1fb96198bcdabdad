use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use prism_gfx::{descriptors::descriptor_pool::DescriptorHeapCapacities, render_context::RenderingContextConfig};
use serde::{Deserialize, Serialize};

/// 使用的设备后端
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 模拟的 GPU 时间线，不需要驱动
    #[default]
    Headless,
    /// 需要开启 `vulkan` feature
    Vulkan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorHeapSettings {
    pub cbv_srv_uav: u32,
    pub rtv: u32,
    pub dsv: u32,
    pub sampler: u32,
}

impl Default for DescriptorHeapSettings {
    fn default() -> Self {
        let capacities = DescriptorHeapCapacities::default();
        Self {
            cbv_srv_uav: capacities.cbv_srv_uav,
            rtv: capacities.rtv,
            dsv: capacities.dsv,
            sampler: capacities.sampler,
        }
    }
}

impl From<DescriptorHeapSettings> for DescriptorHeapCapacities {
    fn from(settings: DescriptorHeapSettings) -> Self {
        Self {
            cbv_srv_uav: settings.cbv_srv_uav,
            rtv: settings.rtv,
            dsv: settings.dsv,
            sampler: settings.sampler,
        }
    }
}

/// shader library 以及 state object 的配置
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderSettings {
    /// 相对路径基于工作区根目录
    pub path: PathBuf,
    pub shader_model: String,
    pub ray_gen: String,
    pub closest_hit: String,
    pub miss: String,
    pub hit_group: String,
    /// float3 color + uint depth
    pub payload_size: u32,
    /// 三角形的重心坐标 float2
    pub attribute_size: u32,
    pub max_recursion_depth: u32,
    /// Vulkan 后端使用的 dxc 可执行文件
    pub dxc: PathBuf,
    /// dxc 输出的 SPIR-V 所在目录，相对路径基于工作区根目录
    pub output_dir: PathBuf,
}

impl Default for ShaderSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("shader/dxr/raytracing.hlsl"),
            shader_model: "lib_6_3".to_string(),
            ray_gen: "mainRayGen".to_string(),
            closest_hit: "mainCHS".to_string(),
            miss: "mainMS".to_string(),
            hit_group: "hitGroup".to_string(),
            payload_size: 16,
            attribute_size: 8,
            max_recursion_depth: 16,
            dxc: PathBuf::from("dxc"),
            output_dir: PathBuf::from("target/shader"),
        }
    }
}

impl ShaderSettings {
    /// library 中需要导出的入口函数
    pub fn exports(&self) -> [&str; 3] {
        [self.ray_gen.as_str(), self.closest_hit.as_str(), self.miss.as_str()]
    }
}

/// 渲染器的配置，所有字段都有默认值，TOML 中只需要写出需要覆盖的部分
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererSettings {
    pub width: u32,
    pub height: u32,
    pub backend: BackendKind,
    pub back_buffer_count: u32,
    pub allocator_count: usize,
    pub fence_timeout_ms: u64,
    pub clear_color: [f32; 4],
    pub descriptor_heaps: DescriptorHeapSettings,
    pub shader: ShaderSettings,
    /// 只有 app 使用：渲染的帧数
    pub frames: u64,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            backend: BackendKind::Headless,
            back_buffer_count: 2,
            allocator_count: 2,
            fence_timeout_ms: 10_000,
            clear_color: [0.6, 0.8, 0.4, 1.0],
            descriptor_heaps: DescriptorHeapSettings::default(),
            shader: ShaderSettings::default(),
            frames: 3,
        }
    }
}

impl RendererSettings {
    /// 从 TOML 文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).with_context(|| format!("读取配置文件失败: {path:?}"))?;
        Self::from_toml_str(&content).with_context(|| format!("解析 TOML 配置失败: {path:?}"))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.width > 0 && self.height > 0, "invalid extent {}x{}", self.width, self.height);
        anyhow::ensure!(self.back_buffer_count > 0, "back_buffer_count must be at least 1");
        anyhow::ensure!(self.allocator_count > 0, "allocator_count must be at least 1");
        anyhow::ensure!(self.fence_timeout_ms > 0, "fence_timeout_ms must be positive");
        Ok(())
    }

    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn rendering_context_config(&self) -> RenderingContextConfig {
        RenderingContextConfig {
            name: "prism".to_string(),
            allocator_count: self.allocator_count,
            fence_timeout: self.fence_timeout(),
            descriptor_capacities: self.descriptor_heaps.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RendererSettings::default();
        assert_eq!((settings.width, settings.height), (1280, 720));
        assert_eq!(settings.backend, BackendKind::Headless);
        assert_eq!(settings.clear_color, [0.6, 0.8, 0.4, 1.0]);
        assert_eq!(settings.shader.exports(), ["mainRayGen", "mainCHS", "mainMS"]);
        assert_eq!(settings.shader.hit_group, "hitGroup");
        assert_eq!(settings.shader.max_recursion_depth, 16);

        let config = settings.rendering_context_config();
        assert_eq!(config.allocator_count, 2);
        assert_eq!(config.fence_timeout, Duration::from_secs(10));
        assert_eq!(config.descriptor_capacities, DescriptorHeapCapacities::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = RendererSettings::from_toml_str(
            r#"
            width = 64
            backend = "vulkan"

            [descriptor_heaps]
            cbv_srv_uav = 32

            [shader]
            max_recursion_depth = 4
            "#,
        )
        .unwrap();
        assert_eq!((settings.width, settings.height), (64, 720));
        assert_eq!(settings.backend, BackendKind::Vulkan);
        assert_eq!(settings.descriptor_heaps.cbv_srv_uav, 32);
        assert_eq!(settings.descriptor_heaps.rtv, 8);
        assert_eq!(settings.shader.max_recursion_depth, 4);
        assert_eq!(settings.shader.ray_gen, "mainRayGen");
    }

    #[test]
    fn test_invalid_settings() {
        assert!(RendererSettings::from_toml_str("backend = \"d3d12\"").is_err());
        assert!(RendererSettings::from_toml_str("width = 0").is_err());
        assert!(RendererSettings::from_toml_str("back_buffer_count = 0").is_err());
        assert!(RendererSettings::from_file("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_workspace_config_matches_defaults() {
        let path = prism_crate_tools::resource::PrismPath::config_path("prism.toml");
        assert_eq!(RendererSettings::from_file(path).unwrap(), RendererSettings::default());
    }
}
