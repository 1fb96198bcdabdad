//! shader 编译的调用边界
//!
//! 编译器本身是外部协作者，这里只负责：组织编译请求、调用编译器、
//! 记录诊断信息并把失败转换为 [`GraphicsError::ShaderCompileFailed`]。

use std::path::{Path, PathBuf};

use crate::error::{GfxResult, GraphicsError};

/// 一次 shader library 编译请求
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderCompileRequest {
    pub path: PathBuf,
    /// 例如 `lib_6_3`
    pub shader_model: String,
    pub exports: Vec<String>,
}

impl ShaderCompileRequest {
    pub fn new(path: impl Into<PathBuf>, shader_model: impl Into<String>, exports: &[&str]) -> Self {
        Self {
            path: path.into(),
            shader_model: shader_model.into(),
            exports: exports.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// 编译结果：字节码以及其中包含的 export
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBlob {
    bytecode: Vec<u8>,
    exports: Vec<String>,
    /// 编译成功时也可能带有 warning
    diagnostics: Option<String>,
}

impl ShaderBlob {
    pub fn new(bytecode: Vec<u8>, exports: Vec<String>, diagnostics: Option<String>) -> Self {
        Self {
            bytecode,
            exports,
            diagnostics,
        }
    }

    #[inline]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[inline]
    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    #[inline]
    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.iter().any(|e| e == name)
    }
}

/// 着色器编译器 Trait
pub trait ShaderCompiler {
    fn name(&self) -> &str;

    /// 编译着色器
    fn compile(&self, request: &ShaderCompileRequest) -> GfxResult<ShaderBlob>;
}

/// 调用编译器生成 shader blob
///
/// 失败时的诊断信息会输出到日志，并以 [`GraphicsError::ShaderCompileFailed`] 返回。
pub fn create_shader_blob(compiler: &dyn ShaderCompiler, request: &ShaderCompileRequest) -> GfxResult<ShaderBlob> {
    log::info!(
        "compiling shader library {:?} ({}) with {}, exports: {:?}",
        request.path,
        request.shader_model,
        compiler.name(),
        request.exports
    );
    match compiler.compile(request) {
        Ok(blob) => {
            if let Some(diagnostics) = blob.diagnostics() {
                log::warn!("shader {:?}: {}", request.path, diagnostics);
            }
            Ok(blob)
        }
        Err(err) => {
            log::error!("{err}");
            Err(err)
        }
    }
}

fn compile_failed(path: &Path, diagnostic: impl Into<String>) -> GraphicsError {
    GraphicsError::ShaderCompileFailed {
        path: path.display().to_string(),
        diagnostic: diagnostic.into(),
    }
}

/// 通过外部进程调用 dxc 编译 HLSL library
///
/// `spirv = true` 时输出 SPIR-V（Vulkan 后端），否则输出 DXIL。
#[derive(Clone, Debug)]
pub struct DxcCompiler {
    executable: PathBuf,
    output_dir: PathBuf,
    spirv: bool,
}

impl DxcCompiler {
    pub fn new(executable: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, spirv: bool) -> Self {
        Self {
            executable: executable.into(),
            output_dir: output_dir.into(),
            spirv,
        }
    }

    fn output_path(&self, request: &ShaderCompileRequest) -> PathBuf {
        let stem = request.path.file_stem().and_then(|s| s.to_str()).unwrap_or("shader");
        let ext = if self.spirv { "spv" } else { "dxil" };
        self.output_dir.join(format!("{stem}.{ext}"))
    }
}

impl ShaderCompiler for DxcCompiler {
    fn name(&self) -> &str {
        "dxc"
    }

    fn compile(&self, request: &ShaderCompileRequest) -> GfxResult<ShaderBlob> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| compile_failed(&request.path, e.to_string()))?;
        let output_path = self.output_path(request);

        let mut cmd = std::process::Command::new(&self.executable);
        cmd.arg("-T").arg(&request.shader_model);
        if self.spirv {
            cmd.args(["-spirv", "-fspv-target-env=vulkan1.2"]);
        }
        if !request.exports.is_empty() {
            cmd.arg("-exports").arg(request.exports.join(";"));
        }
        cmd.arg("-Fo").arg(&output_path).arg(&request.path);

        let output = cmd
            .output()
            .map_err(|e| compile_failed(&request.path, format!("failed to execute {:?}: {e}", self.executable)))?;

        if !output.stdout.is_empty() {
            log::info!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let diagnostic = if stderr.is_empty() { format!("dxc exited with {}", output.status) } else { stderr };
            return Err(compile_failed(&request.path, diagnostic));
        }

        let bytecode = std::fs::read(&output_path).map_err(|e| compile_failed(&request.path, e.to_string()))?;
        Ok(ShaderBlob::new(bytecode, request.exports.clone(), (!stderr.is_empty()).then_some(stderr)))
    }
}

/// 不做真正的编译，只读取源码并检查每个 export 的入口函数是否存在
///
/// 用于 headless 后端：源码本身作为 "字节码"。
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceLibraryCompiler;

impl SourceLibraryCompiler {
    /// 是否存在形如 `name(` 的函数定义
    fn has_entry_point(source: &str, name: &str) -> bool {
        source.match_indices(name).any(|(pos, _)| {
            let before_ok = source[..pos].chars().next_back().is_none_or(|c| !(c.is_alphanumeric() || c == '_'));
            let after = source[pos + name.len()..].trim_start();
            before_ok && after.starts_with('(')
        })
    }
}

impl ShaderCompiler for SourceLibraryCompiler {
    fn name(&self) -> &str {
        "source-library"
    }

    fn compile(&self, request: &ShaderCompileRequest) -> GfxResult<ShaderBlob> {
        let source = std::fs::read_to_string(&request.path)
            .map_err(|e| compile_failed(&request.path, format!("failed to read source: {e}")))?;

        let missing: Vec<&str> = request
            .exports
            .iter()
            .map(String::as_str)
            .filter(|export| !Self::has_entry_point(&source, export))
            .collect();
        if !missing.is_empty() {
            return Err(compile_failed(&request.path, format!("entry points not found: {}", missing.join(", "))));
        }

        Ok(ShaderBlob::new(source.into_bytes(), request.exports.clone(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp_shader(name: &str, source: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("prism-gfx-shader-tests");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, source).unwrap();
        path
    }

    #[test]
    fn test_source_library_finds_entry_points() {
        let path = write_temp_shader(
            "ok.hlsl",
            "[shader(\"raygeneration\")]\nvoid mainRayGen() {}\n[shader(\"miss\")] void mainMS (inout Payload p) {}",
        );
        let request = ShaderCompileRequest::new(&path, "lib_6_3", &["mainRayGen", "mainMS"]);
        let blob = create_shader_blob(&SourceLibraryCompiler, &request).unwrap();
        assert!(blob.has_export("mainRayGen"));
        assert!(blob.has_export("mainMS"));
        assert!(!blob.bytecode().is_empty());
    }

    #[test]
    fn test_source_library_reports_missing_entry_point() {
        // `notmainCHS(` 不能算作 `mainCHS` 的定义
        let path = write_temp_shader("missing.hlsl", "void mainRayGen() {}\nvoid notmainCHS() {}");
        let request = ShaderCompileRequest::new(&path, "lib_6_3", &["mainRayGen", "mainCHS"]);
        let err = create_shader_blob(&SourceLibraryCompiler, &request).unwrap_err();
        match err {
            GraphicsError::ShaderCompileFailed { diagnostic, .. } => assert!(diagnostic.contains("mainCHS")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_compile_failure() {
        let request = ShaderCompileRequest::new("/definitely/not/here.hlsl", "lib_6_3", &["mainRayGen"]);
        assert!(matches!(
            SourceLibraryCompiler.compile(&request),
            Err(GraphicsError::ShaderCompileFailed { .. })
        ));
    }
}
