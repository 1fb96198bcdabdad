//! Prism 光追渲染器
//!
//! 在 [`prism_gfx`] 之上搭建一个最小的 DXR 风格场景：
//! - [`scene`]：plane 与 cube 两个网格，各自的 BLAS，以及包含两个 instance 的 TLAS
//! - [`pipeline`]：root signature、state object、shader table，以及每帧的 trace → copy → present
//! - [`settings`]：从 TOML 加载的渲染配置

pub mod pipeline;
pub mod scene;
pub mod settings;

pub use pipeline::rt_pipeline::RayTracingPipeline;
pub use settings::RendererSettings;
