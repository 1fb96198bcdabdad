use std::{collections::HashSet, rc::Rc};

use itertools::Itertools;

use crate::{
    backend::{
        GfxBackend,
        types::{RayTracingCaps, RootSignatureId, ShaderIdentifier, StateObjectId},
    },
    error::{GfxResult, GraphicsError},
    pipelines::{root_signature::RootSignature, shader::ShaderBlob},
};

/// shader library 中 export 的执行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderExport {
    pub name: String,
    pub stage: ShaderStage,
}

impl ShaderExport {
    pub fn new(name: impl Into<String>, stage: ShaderStage) -> Self {
        Self {
            name: name.into(),
            stage,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HitGroupType {
    Triangles,
    ProceduralPrimitive,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HitGroupDesc {
    pub export: String,
    pub ty: HitGroupType,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
}

impl HitGroupDesc {
    pub fn triangles(export: impl Into<String>, closest_hit: impl Into<String>) -> Self {
        Self {
            export: export.into(),
            ty: HitGroupType::Triangles,
            closest_hit: Some(closest_hit.into()),
            any_hit: None,
            intersection: None,
        }
    }

    fn imports(&self) -> impl Iterator<Item = &String> {
        self.closest_hit.iter().chain(self.any_hit.iter()).chain(self.intersection.iter())
    }
}

/// local root signature 与 export 的关联
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalRootAssociation {
    pub root_signature: RootSignatureId,
    /// shader record 中 root 参数的字节数
    pub local_argument_size: u32,
    pub exports: Vec<String>,
}

impl LocalRootAssociation {
    pub fn new(root_signature: &RootSignature, exports: &[&str]) -> Self {
        Self {
            root_signature: root_signature.id(),
            local_argument_size: root_signature.desc().local_argument_size(),
            exports: exports.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// 光追 state object 的描述
///
/// 对应 DXIL library、hit group、shader config、pipeline config、
/// global root signature 以及 local root signature 关联等子对象。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateObjectDesc {
    pub name: String,
    pub library_exports: Vec<ShaderExport>,
    pub hit_groups: Vec<HitGroupDesc>,
    /// ray payload 的最大字节数
    pub payload_size: u32,
    /// 相交属性的最大字节数（三角形为重心坐标 float2）
    pub attribute_size: u32,
    /// 只用于分配栈内存，超过递归深度的 TraceRay 行为未定义
    pub max_recursion_depth: u32,
    pub global_root_signature: RootSignatureId,
    pub local_root_signatures: Vec<LocalRootAssociation>,
}

impl StateObjectDesc {
    /// 相交属性的上限（D3D12_RAYTRACING_MAX_ATTRIBUTE_SIZE_IN_BYTES）
    pub const MAX_ATTRIBUTE_SIZE: u32 = 32;

    /// 可以查询 shader identifier 的 export：非 hit 阶段的 library export 以及 hit group
    pub fn identifiable_exports(&self) -> impl Iterator<Item = &str> {
        self.library_exports
            .iter()
            .filter(|e| matches!(e.stage, ShaderStage::RayGeneration | ShaderStage::Miss | ShaderStage::Callable))
            .map(|e| e.name.as_str())
            .chain(self.hit_groups.iter().map(|h| h.export.as_str()))
    }

    /// 某个 export 关联的 local root 参数字节数，没有关联时为 0
    pub fn local_argument_size(&self, export: &str) -> u32 {
        self.local_root_signatures
            .iter()
            .find(|a| a.exports.iter().any(|e| e == export))
            .map_or(0, |a| a.local_argument_size)
    }

    /// 创建 state object 之前的静态检查
    pub fn validate(&self, caps: &RayTracingCaps) -> GfxResult<()> {
        if self.max_recursion_depth == 0 || self.max_recursion_depth > caps.max_recursion_depth {
            return Err(GraphicsError::device_call(
                "CreateStateObject",
                format!("max recursion depth {} out of range 1..={}", self.max_recursion_depth, caps.max_recursion_depth),
            ));
        }
        if self.payload_size == 0 || self.attribute_size > Self::MAX_ATTRIBUTE_SIZE {
            return Err(GraphicsError::device_call(
                "CreateStateObject",
                format!("invalid shader config: payload {} / attributes {}", self.payload_size, self.attribute_size),
            ));
        }

        let duplicates = self.library_exports.iter().map(|e| &e.name).duplicates().collect_vec();
        if !duplicates.is_empty() {
            return Err(GraphicsError::device_call(
                "CreateStateObject",
                format!("duplicated library exports: {duplicates:?}"),
            ));
        }

        let library: HashSet<&str> = self.library_exports.iter().map(|e| e.name.as_str()).collect();
        for hit_group in &self.hit_groups {
            if let Some(missing) = hit_group.imports().find(|i| !library.contains(i.as_str())) {
                return Err(GraphicsError::ExportNotFound(missing.clone()));
            }
        }

        let all_exports: HashSet<&str> =
            library.iter().copied().chain(self.hit_groups.iter().map(|h| h.export.as_str())).collect();
        for association in &self.local_root_signatures {
            if let Some(missing) = association.exports.iter().find(|e| !all_exports.contains(e.as_str())) {
                return Err(GraphicsError::ExportNotFound(missing.clone()));
            }
        }

        Ok(())
    }
}

/// 光追 pipeline
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct StateObject {
    id: StateObjectId,
    desc: StateObjectDesc,
    backend: Rc<dyn GfxBackend>,
}

impl StateObject {
    pub fn new(backend: Rc<dyn GfxBackend>, desc: StateObjectDesc, library: &ShaderBlob) -> GfxResult<Self> {
        desc.validate(&backend.ray_tracing_caps())?;

        // library 中必须真的包含所有声明的 export
        if let Some(missing) = desc.library_exports.iter().find(|e| !library.has_export(&e.name)) {
            return Err(GraphicsError::ExportNotFound(missing.name.clone()));
        }

        let id = backend.create_state_object(&desc, library)?;
        log::info!(
            "state object `{}` created: exports [{}], hit groups [{}], max recursion {}",
            desc.name,
            desc.library_exports.iter().map(|e| e.name.as_str()).join(", "),
            desc.hit_groups.iter().map(|h| h.export.as_str()).join(", "),
            desc.max_recursion_depth
        );
        Ok(Self { id, desc, backend })
    }

    #[inline]
    pub fn id(&self) -> StateObjectId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &StateObjectDesc {
        &self.desc
    }

    /// 查询 export 的 shader identifier，找不到时返回 [`GraphicsError::ExportNotFound`]
    pub fn shader_identifier(&self, export: &str) -> GfxResult<ShaderIdentifier> {
        self.backend.shader_identifier(self.id, export).ok_or_else(|| GraphicsError::ExportNotFound(export.to_string()))
    }

    pub fn destroy(self) {
        self.backend.destroy_state_object(self.id);
    }
}
