//! 光追相关：加速结构的构建与 shader table 的布局

pub mod acceleration;
pub mod instance;
pub mod shader_table;
