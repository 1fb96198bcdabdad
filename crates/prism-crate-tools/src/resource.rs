use std::path::{Path, PathBuf};

/// 统一路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导），
/// 避免依赖进程的当前工作目录。
///
/// # 使用示例
/// ```ignore
/// let shader = PrismPath::shader_path("dxr/raytracing.hlsl"); // shader/dxr/raytracing.hlsl
/// let config = PrismPath::config_path("prism.toml");          // config/prism.toml
/// ```
pub struct PrismPath;
impl PrismPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        // crates/prism-crate-tools -> crates -> workspace root
        manifest_dir.ancestors().nth(2).map(Path::to_path_buf).unwrap_or_else(|| manifest_dir.to_path_buf())
    }

    /// 获取 `shader/` 目录下的文件路径
    pub fn shader_path(filename: impl AsRef<Path>) -> PathBuf {
        Self::workspace_path().join("shader").join(filename)
    }

    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: impl AsRef<Path>) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    /// 相对路径基于工作区根目录解析，绝对路径保持不变
    pub fn resolve(path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() { path.to_path_buf() } else { Self::workspace_path().join(path) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_path_contains_crates_dir() {
        assert!(PrismPath::workspace_path().join("crates").join("prism-crate-tools").exists());
    }

    #[test]
    fn resolve_keeps_absolute_path() {
        let abs = std::env::temp_dir();
        assert_eq!(PrismPath::resolve(&abs), abs);
        assert_eq!(PrismPath::resolve("shader"), PrismPath::workspace_path().join("shader"));
    }
}
