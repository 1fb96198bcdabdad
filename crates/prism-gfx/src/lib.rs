//! Prism GFX 层
//!
//! 对显式图形 API 的命令/资源生命周期做统一封装：
//! - 命令分配器的双缓冲循环（[`commands::command_cycler::CommandCycler`]）与围栏同步（[`commands::fence_sync::FenceSync`]）
//! - 描述符池（[`descriptors::descriptor_pool::DescriptorPool`]）
//! - 资源工厂与资源 arena（[`resources`]）
//! - BLAS/TLAS 构建与 Shader Table 布局（[`raytracing`]）
//!
//! 所有设备调用都经过 [`backend::GfxBackend`]，不存在全局单例；
//! 上层通过 [`render_context::RenderingContext`] 显式持有这些服务。

pub mod backend;
pub mod basic;
pub mod commands;
pub mod descriptors;
pub mod error;
pub mod pipelines;
pub mod raytracing;
pub mod render_context;
pub mod resources;
pub mod swapchain;

pub use error::{GfxResult, GraphicsError};
