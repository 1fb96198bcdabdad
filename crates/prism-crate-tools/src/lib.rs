//! Prism 工具集
//!
//! 提供日志初始化、工作区路径管理等通用工具。

pub mod init_log;
pub mod resource;
