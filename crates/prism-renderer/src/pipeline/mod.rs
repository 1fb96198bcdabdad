//! 光追管线：root signature、state object、shader table 以及每帧的命令录制

pub mod rt_pipeline;
pub mod shader_table;
pub mod signatures;
