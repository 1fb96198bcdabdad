use std::rc::Rc;

use itertools::Itertools;

use crate::{
    backend::{
        GfxBackend,
        types::{AllocatorId, FenceId},
    },
    commands::{command_list::GfxCommandList, fence_sync::FenceSync},
    error::{GfxResult, GraphicsError},
};

/// 默认的 command allocator 数量（双缓冲）
pub const DEFAULT_ALLOCATOR_COUNT: usize = 2;

/// command list 的生命周期
///
/// `Recording -> Closed -> Signaled -> (reset) -> Recording`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandListState {
    Recording,
    /// 已经提交到 queue，还没有 signal
    Closed,
    Signaled,
}

struct AllocatorSlot {
    id: AllocatorId,
    /// 最后一次提交之后 signal 的 fence 与值
    last_signal: Option<(FenceId, u64)>,
}

/// 一个 queue、N 个 command allocator、一个 command list
///
/// allocator 组成一个环，每次 `reset` 前进到下一个 allocator，
/// 只有当该 allocator 上一次 signal 的值已经完成时才会真的 reset。
///
/// # Destroy
///
/// 需要手动调用 `destroy` 方法来释放资源。
pub struct CommandCycler {
    allocators: Vec<AllocatorSlot>,
    back_index: usize,
    command_list: GfxCommandList,
    state: CommandListState,

    backend: Rc<dyn GfxBackend>,
}

// 创建与销毁
impl CommandCycler {
    /// 创建之后 command list 已经处于 recording 状态，对应第 0 个 allocator
    pub fn new(backend: Rc<dyn GfxBackend>, allocator_count: usize, name: &str) -> GfxResult<Self> {
        if allocator_count == 0 {
            return Err(GraphicsError::invalid_state("at least one command allocator", "0 allocators"));
        }
        let allocators = (0..allocator_count)
            .map(|i| {
                backend.create_command_allocator(&format!("{name}-allocator-{i}")).map(|id| AllocatorSlot {
                    id,
                    last_signal: None,
                })
            })
            .collect::<GfxResult<Vec<_>>>()?;

        log::info!("command cycler `{}` created with {} allocators", name, allocator_count);
        Ok(Self {
            allocators,
            back_index: 0,
            command_list: GfxCommandList::new(format!("{name}-list")),
            state: CommandListState::Recording,
            backend,
        })
    }

    pub fn destroy(self) {
        for slot in &self.allocators {
            self.backend.destroy_command_allocator(slot.id);
        }
        log::debug!("command cycler `{}` destroyed", self.command_list.name());
    }
}

// getters
impl CommandCycler {
    #[inline]
    pub fn state(&self) -> CommandListState {
        self.state
    }

    #[inline]
    pub fn back_allocator_index(&self) -> usize {
        self.back_index
    }

    #[inline]
    pub fn allocator_count(&self) -> usize {
        self.allocators.len()
    }

    #[inline]
    pub fn last_signal(&self, index: usize) -> Option<(FenceId, u64)> {
        self.allocators.get(index).and_then(|slot| slot.last_signal)
    }

    /// 只有 recording 状态下才能记录命令
    pub fn command_list(&mut self) -> GfxResult<&mut GfxCommandList> {
        self.expect_state(CommandListState::Recording)?;
        Ok(&mut self.command_list)
    }

    /// allocator 上一次 signal 的值如果还没有完成，返回该值
    pub fn pending_fence_value(&self, index: usize) -> GfxResult<Option<u64>> {
        let Some(slot) = self.allocators.get(index) else {
            return Err(GraphicsError::InvalidHandle {
                kind: "command allocator",
                detail: format!("index {index} out of {}", self.allocators.len()),
            });
        };
        match slot.last_signal {
            Some((fence, value)) if self.backend.fence_completed_value(fence)? < value => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// 下一次 `reset` 将要使用的 allocator
    #[inline]
    pub fn next_allocator_index(&self) -> usize {
        (self.back_index + 1) % self.allocators.len()
    }
}

// 生命周期
impl CommandCycler {
    /// 结束录制并提交到 queue，每个录制周期只能调用一次
    pub fn close(&mut self) -> GfxResult<()> {
        self.expect_state(CommandListState::Recording)?;
        let slot = &self.allocators[self.back_index];
        self.backend.execute_command_list(slot.id, self.command_list.commands())?;
        log::trace!(
            "command list `{}` submitted on allocator #{} ({} commands)",
            self.command_list.name(),
            self.back_index,
            self.command_list.len()
        );
        self.state = CommandListState::Closed;
        Ok(())
    }

    /// 在 queue 上 signal fence 当前的目标值，必须在 `close` 之后调用
    pub fn signal(&mut self, fence: &FenceSync) -> GfxResult<()> {
        self.expect_state(CommandListState::Closed)?;
        let value = fence.fence_value();
        self.backend.signal_fence(fence.id(), value)?;
        self.allocators[self.back_index].last_signal = Some((fence.id(), value));
        self.state = CommandListState::Signaled;
        Ok(())
    }

    /// 前进到下一个 allocator 并开始新的录制
    ///
    /// 下一个 allocator 仍在执行时返回 [`GraphicsError::AllocatorInFlight`]，此时不会有任何改变。
    pub fn reset(&mut self) -> GfxResult<()> {
        self.expect_resettable()?;
        let next = self.next_allocator_index();
        self.reset_allocator(next)?;
        self.back_index = next;
        self.restart_recording();
        Ok(())
    }

    /// 只 reset 当前的 back allocator
    pub fn reset_back_allocator(&mut self) -> GfxResult<()> {
        self.expect_resettable()?;
        self.reset_allocator(self.back_index)?;
        self.restart_recording();
        Ok(())
    }

    /// reset 所有的 allocator，只在启动与销毁阶段使用
    pub fn reset_all(&mut self) -> GfxResult<()> {
        self.expect_resettable()?;
        for index in 0..self.allocators.len() {
            if let Some(fence_value) = self.pending_fence_value(index)? {
                return Err(GraphicsError::AllocatorInFlight { index, fence_value });
            }
        }
        for index in 0..self.allocators.len() {
            self.reset_allocator(index)?;
        }
        self.back_index = 0;
        self.restart_recording();
        Ok(())
    }
}

// 内部工具
impl CommandCycler {
    fn expect_state(&self, expected: CommandListState) -> GfxResult<()> {
        if self.state != expected {
            return Err(GraphicsError::invalid_state(format!("{expected:?}"), format!("{:?}", self.state)));
        }
        Ok(())
    }

    /// 已经提交但没有 signal 的 list 无法追踪完成时间
    fn expect_resettable(&self) -> GfxResult<()> {
        if self.state == CommandListState::Closed {
            return Err(GraphicsError::invalid_state("Recording or Signaled", "Closed (signal after close)"));
        }
        Ok(())
    }

    fn reset_allocator(&mut self, index: usize) -> GfxResult<()> {
        if let Some(fence_value) = self.pending_fence_value(index)? {
            return Err(GraphicsError::AllocatorInFlight { index, fence_value });
        }
        self.backend.reset_command_allocator(self.allocators[index].id)?;
        self.allocators[index].last_signal = None;
        Ok(())
    }

    fn restart_recording(&mut self) {
        if self.state == CommandListState::Recording && !self.command_list.is_empty() {
            log::warn!(
                "command list `{}` discarded {} unsubmitted commands",
                self.command_list.name(),
                self.command_list.len()
            );
        }
        self.command_list.clear();
        self.state = CommandListState::Recording;
    }
}

impl std::fmt::Debug for CommandCycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCycler")
            .field("back_index", &self.back_index)
            .field("state", &self.state)
            .field("last_signals", &self.allocators.iter().map(|a| a.last_signal).collect_vec())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::headless::HeadlessBackend, commands::fence_sync::DEFAULT_FENCE_TIMEOUT};

    fn setup() -> (Rc<HeadlessBackend>, CommandCycler, FenceSync) {
        let headless = Rc::new(HeadlessBackend::new());
        let cycler = CommandCycler::new(headless.clone(), DEFAULT_ALLOCATOR_COUNT, "test").unwrap();
        let fence = FenceSync::new(headless.clone(), DEFAULT_FENCE_TIMEOUT, "test").unwrap();
        (headless, cycler, fence)
    }

    #[test]
    fn test_initial_state_is_recording() {
        let (_headless, mut cycler, _fence) = setup();
        assert_eq!(cycler.state(), CommandListState::Recording);
        assert_eq!(cycler.back_allocator_index(), 0);
        assert!(cycler.command_list().is_ok());
    }

    #[test]
    fn test_frame_cycle_advances_ring() {
        let (_headless, mut cycler, mut fence) = setup();
        for frame in 0..4usize {
            assert_eq!(cycler.back_allocator_index(), frame % 2);
            cycler.command_list().unwrap().begin_label("frame");
            cycler.command_list().unwrap().end_label();
            cycler.close().unwrap();
            fence.add_fence_value();
            cycler.signal(&fence).unwrap();
            fence.wait_gpu().unwrap();
            cycler.reset().unwrap();
        }
        assert_eq!(fence.completed_value().unwrap(), 4);
    }

    #[test]
    fn test_reset_refuses_allocator_in_flight() {
        let (_headless, mut cycler, mut fence) = setup();

        // 第一帧：allocator 0，不等待
        cycler.close().unwrap();
        fence.add_fence_value();
        cycler.signal(&fence).unwrap();
        cycler.reset().unwrap();
        assert_eq!(cycler.back_allocator_index(), 1);

        // 第二帧：allocator 1，下一个是仍在执行的 allocator 0
        cycler.close().unwrap();
        fence.add_fence_value();
        cycler.signal(&fence).unwrap();
        assert_eq!(cycler.reset(), Err(GraphicsError::AllocatorInFlight { index: 0, fence_value: 1 }));
        assert_eq!(cycler.back_allocator_index(), 1);
        assert_eq!(cycler.state(), CommandListState::Signaled);

        fence.wait_value(1).unwrap();
        cycler.reset().unwrap();
        assert_eq!(cycler.back_allocator_index(), 0);
        assert_eq!(cycler.last_signal(1), Some((fence.id(), 2)));
    }

    #[test]
    fn test_state_machine_misuse() {
        let (_headless, mut cycler, mut fence) = setup();
        fence.add_fence_value();
        assert!(matches!(cycler.signal(&fence), Err(GraphicsError::InvalidState { .. })));

        cycler.close().unwrap();
        assert!(matches!(cycler.close(), Err(GraphicsError::InvalidState { .. })));
        assert!(matches!(cycler.command_list(), Err(GraphicsError::InvalidState { .. })));
        assert!(matches!(cycler.reset(), Err(GraphicsError::InvalidState { .. })));

        cycler.signal(&fence).unwrap();
        assert!(matches!(cycler.signal(&fence), Err(GraphicsError::InvalidState { .. })));
    }

    #[test]
    fn test_reset_all_requires_idle() {
        let (headless, mut cycler, mut fence) = setup();
        cycler.close().unwrap();
        fence.add_fence_value();
        cycler.signal(&fence).unwrap();
        assert!(matches!(cycler.reset_all(), Err(GraphicsError::AllocatorInFlight { index: 0, .. })));

        headless.flush().unwrap();
        cycler.reset_all().unwrap();
        assert_eq!(cycler.back_allocator_index(), 0);
        assert_eq!(cycler.state(), CommandListState::Recording);
        assert_eq!(cycler.last_signal(0), None);
    }

    #[test]
    fn test_reset_back_allocator_keeps_index() {
        let (_headless, mut cycler, mut fence) = setup();
        cycler.close().unwrap();
        fence.add_fence_value();
        cycler.signal(&fence).unwrap();
        assert!(matches!(cycler.reset_back_allocator(), Err(GraphicsError::AllocatorInFlight { index: 0, .. })));

        fence.wait_gpu().unwrap();
        cycler.reset_back_allocator().unwrap();
        assert_eq!(cycler.back_allocator_index(), 0);
    }
}
