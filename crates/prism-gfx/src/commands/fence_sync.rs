use std::{rc::Rc, time::Duration};

use crate::{
    backend::{
        GfxBackend,
        types::{FenceId, FenceWait},
    },
    error::{GfxResult, GraphicsError},
};

/// 默认的等待超时
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// CPU/GPU 同步用的 fence
///
/// `fence_value` 是下一次 signal 的目标值，每个帧边界只递增一次。
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct FenceSync {
    fence: FenceId,
    fence_value: u64,
    timeout: Duration,
    name: String,

    backend: Rc<dyn GfxBackend>,
}

// 创建与销毁
impl FenceSync {
    pub fn new(backend: Rc<dyn GfxBackend>, timeout: Duration, name: impl Into<String>) -> GfxResult<Self> {
        let name = name.into();
        let fence = backend.create_fence(0, &name)?;
        log::info!("fence `{}` created, timeout {:?}", name, timeout);
        Ok(Self {
            fence,
            fence_value: 0,
            timeout,
            name,
            backend,
        })
    }

    pub fn destroy(self) {
        self.backend.destroy_fence(self.fence);
        log::debug!("fence `{}` destroyed at value {}", self.name, self.fence_value);
    }
}

// getters
impl FenceSync {
    #[inline]
    pub fn id(&self) -> FenceId {
        self.fence
    }

    /// 当前的目标值
    #[inline]
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

// tools
impl FenceSync {
    /// 递增目标值，返回新的目标值
    #[inline]
    pub fn add_fence_value(&mut self) -> u64 {
        self.fence_value += 1;
        self.fence_value
    }

    /// GPU 已经完成的值
    #[inline]
    pub fn completed_value(&self) -> GfxResult<u64> {
        self.backend.fence_completed_value(self.fence)
    }

    #[inline]
    pub fn is_completed(&self, value: u64) -> GfxResult<bool> {
        Ok(self.completed_value()? >= value)
    }

    /// 阻塞直到 GPU 完成当前的目标值
    pub fn wait_gpu(&self) -> GfxResult<()> {
        self.wait_value(self.fence_value)
    }

    /// 阻塞直到 GPU 完成指定的值，超时视为设备丢失
    pub fn wait_value(&self, value: u64) -> GfxResult<()> {
        if self.completed_value()? >= value {
            return Ok(());
        }
        match self.backend.wait_fence(self.fence, value, self.timeout)? {
            FenceWait::Reached => Ok(()),
            FenceWait::TimedOut => {
                let completed = self.completed_value()?;
                log::error!(
                    "fence `{}` timed out after {:?}: waiting for {}, completed {}",
                    self.name,
                    self.timeout,
                    value,
                    completed
                );
                Err(GraphicsError::DeviceLost(format!(
                    "fence `{}` did not reach {value} within {:?} (completed {completed})",
                    self.name, self.timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;

    #[test]
    fn test_fence_reaches_value_after_n_rounds() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut fence = FenceSync::new(headless.clone(), DEFAULT_FENCE_TIMEOUT, "frame").unwrap();

        for round in 1..=5u64 {
            let value = fence.add_fence_value();
            assert_eq!(value, round);
            headless.signal_fence(fence.id(), value).unwrap();
            fence.wait_gpu().unwrap();
            assert_eq!(fence.completed_value().unwrap(), round);
        }
        assert_eq!(fence.fence_value(), 5);
        fence.destroy();
    }

    #[test]
    fn test_completed_never_exceeds_target() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut fence = FenceSync::new(headless.clone(), DEFAULT_FENCE_TIMEOUT, "frame").unwrap();
        let value = fence.add_fence_value();
        headless.signal_fence(fence.id(), value).unwrap();
        assert!(fence.completed_value().unwrap() <= fence.fence_value());
        assert!(!fence.is_completed(value).unwrap());
        headless.flush().unwrap();
        assert!(fence.is_completed(value).unwrap());
    }

    #[test]
    fn test_timeout_is_device_lost() {
        let headless = Rc::new(HeadlessBackend::new());
        let mut fence = FenceSync::new(headless.clone(), Duration::from_millis(5), "frame").unwrap();
        let value = fence.add_fence_value();
        headless.signal_fence(fence.id(), value).unwrap();
        headless.set_gpu_stalled(true);

        assert!(matches!(fence.wait_gpu(), Err(GraphicsError::DeviceLost(_))));
        // 没有 signal 的值同样会超时
        headless.set_gpu_stalled(false);
        assert!(matches!(fence.wait_value(value + 1), Err(GraphicsError::DeviceLost(_))));
    }
}
