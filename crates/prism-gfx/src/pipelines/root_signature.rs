use std::rc::Rc;

use crate::{
    backend::{GfxBackend, types::RootSignatureId},
    error::GfxResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

/// descriptor table 中的一段连续寄存器
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub range_type: DescriptorRangeType,
    pub base_register: u32,
    pub count: u32,
    pub space: u32,
}

impl DescriptorRange {
    #[inline]
    pub fn srv(base_register: u32, space: u32) -> Self {
        Self {
            range_type: DescriptorRangeType::Srv,
            base_register,
            count: 1,
            space,
        }
    }

    #[inline]
    pub fn uav(base_register: u32, space: u32) -> Self {
        Self {
            range_type: DescriptorRangeType::Uav,
            base_register,
            count: 1,
            space,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RootParameter {
    DescriptorTable(Vec<DescriptorRange>),
}

impl RootParameter {
    /// 该参数在 shader record 中占用的字节数：一个 GPU descriptor handle
    pub const DESCRIPTOR_TABLE_SIZE: u32 = size_of::<u64>() as u32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RootSignatureKind {
    /// 整个 DispatchRays 共享，通过 `SetComputeRoot*` 绑定
    Global,
    /// 每个 shader record 各自携带参数
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootSignatureDesc {
    pub name: String,
    pub kind: RootSignatureKind,
    pub parameters: Vec<RootParameter>,
}

impl RootSignatureDesc {
    pub fn global(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RootSignatureKind::Global,
            parameters: Vec::new(),
        }
    }

    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: RootSignatureKind::Local,
            parameters: Vec::new(),
        }
    }

    /// 追加一个 descriptor table 参数，参数的顺序就是 shader record 中 handle 的顺序
    pub fn descriptor_table(mut self, ranges: &[DescriptorRange]) -> Self {
        self.parameters.push(RootParameter::DescriptorTable(ranges.to_vec()));
        self
    }

    /// local root signature 的参数在 shader record 中占用的字节数
    pub fn local_argument_size(&self) -> u32 {
        self.parameters
            .iter()
            .map(|p| match p {
                RootParameter::DescriptorTable(_) => RootParameter::DESCRIPTOR_TABLE_SIZE,
            })
            .sum()
    }
}

/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct RootSignature {
    id: RootSignatureId,
    desc: RootSignatureDesc,
    backend: Rc<dyn GfxBackend>,
}

impl RootSignature {
    pub fn new(backend: Rc<dyn GfxBackend>, desc: RootSignatureDesc) -> GfxResult<Self> {
        let id = backend.create_root_signature(&desc)?;
        log::debug!("root signature `{}` created with {} parameters", desc.name, desc.parameters.len());
        Ok(Self { id, desc, backend })
    }

    #[inline]
    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &RootSignatureDesc {
        &self.desc
    }

    pub fn destroy(self) {
        self.backend.destroy_root_signature(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_argument_size() {
        let ray_gen = RootSignatureDesc::local("ray-gen").descriptor_table(&[DescriptorRange::uav(0, 0)]);
        assert_eq!(ray_gen.local_argument_size(), 8);

        let hit = RootSignatureDesc::local("hit")
            .descriptor_table(&[DescriptorRange::srv(0, 1)])
            .descriptor_table(&[DescriptorRange::srv(1, 1)]);
        assert_eq!(hit.local_argument_size(), 16);
        assert_eq!(hit.parameters[0], RootParameter::DescriptorTable(vec![DescriptorRange::srv(0, 1)]));
    }
}
