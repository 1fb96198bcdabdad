use crate::backend::types::{NativeResourceId, ResourceState};

/// 资源 barrier
///
/// 所有的状态转换都必须在依赖新状态的命令之前显式记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceBarrier {
    /// 状态转换：`before` 必须与资源当前的状态一致
    Transition {
        resource: NativeResourceId,
        before: ResourceState,
        after: ResourceState,
    },
    /// UAV barrier：等待之前对该资源的所有 UAV 写入完成，常用于加速结构构建之后
    Uav { resource: NativeResourceId },
}

impl ResourceBarrier {
    #[inline]
    pub fn transition(resource: NativeResourceId, before: ResourceState, after: ResourceState) -> Self {
        Self::Transition { resource, before, after }
    }

    #[inline]
    pub fn uav(resource: NativeResourceId) -> Self {
        Self::Uav { resource }
    }

    #[inline]
    pub fn resource(&self) -> NativeResourceId {
        match self {
            ResourceBarrier::Transition { resource, .. } | ResourceBarrier::Uav { resource } => *resource,
        }
    }

    /// before 和 after 相同的状态转换没有意义，可以直接跳过
    #[inline]
    pub fn is_noop(&self) -> bool {
        matches!(self, ResourceBarrier::Transition { before, after, .. } if before == after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_noop() {
        let res = NativeResourceId(7);
        assert!(ResourceBarrier::transition(res, ResourceState::CopySource, ResourceState::CopySource).is_noop());
        assert!(!ResourceBarrier::transition(res, ResourceState::CopySource, ResourceState::UnorderedAccess).is_noop());
        assert!(!ResourceBarrier::uav(res).is_noop());
        assert_eq!(ResourceBarrier::uav(res).resource(), res);
    }
}
