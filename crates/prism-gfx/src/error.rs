use thiserror::Error;

use crate::backend::types::DescriptorHeapType;

/// GFX 层的错误类型
///
/// 内部 API 只返回错误，不会主动 abort；是否终止程序由最外层的帧循环决定。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// 底层图形 API 调用失败
    #[error("device call `{call}` failed: {reason}")]
    DeviceCallFailed { call: &'static str, reason: String },

    /// 设备丢失，或者等待 GPU 超时
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// shader 编译失败，`diagnostic` 为编译器输出的诊断信息
    #[error("failed to compile shader `{path}`: {diagnostic}")]
    ShaderCompileFailed { path: String, diagnostic: String },

    /// state object 中找不到指定 export 的 shader identifier
    #[error("shader export `{0}` not found in state object")]
    ExportNotFound(String),

    /// 固定容量的资源（descriptor heap、structured buffer 等）已用尽或越界
    #[error("{what} capacity exceeded: requested {requested}, capacity {capacity}")]
    CapacityExceeded { what: String, requested: u64, capacity: u64 },

    /// 对齐值不是 2 的幂
    #[error("alignment {align} is not a power of two")]
    AlignmentViolation { align: u64 },

    /// handle 无效：已经释放、重复释放，或者不属于该容器
    #[error("invalid {kind} handle: {detail}")]
    InvalidHandle { kind: &'static str, detail: String },

    /// 在错误的状态下调用了某个操作，例如对已经 close 的 command list 再次 close
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// 试图 reset 一个仍然在 GPU 上执行的 command allocator
    #[error("command allocator #{index} is still in flight (waiting for fence value {fence_value})")]
    AllocatorInFlight { index: usize, fence_value: u64 },

    /// shader record 中的参数与 local root signature 不匹配
    #[error("shader record for `{export}` carries {actual} bytes of root arguments, local root signature expects {expected}")]
    ShaderRecordMismatch { export: String, expected: u32, actual: u32 },
}

pub type GfxResult<T> = Result<T, GraphicsError>;

impl GraphicsError {
    #[inline]
    pub fn device_call(call: &'static str, reason: impl ToString) -> Self {
        Self::DeviceCallFailed {
            call,
            reason: reason.to_string(),
        }
    }

    #[inline]
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn descriptor_heap_full(heap_type: DescriptorHeapType, capacity: u32) -> Self {
        Self::CapacityExceeded {
            what: format!("descriptor heap {heap_type:?}"),
            requested: capacity as u64 + 1,
            capacity: capacity as u64,
        }
    }
}
