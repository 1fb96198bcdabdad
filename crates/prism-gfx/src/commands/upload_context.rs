use crate::{
    commands::{command_cycler::CommandCycler, fence_sync::FenceSync},
    error::{GfxResult, GraphicsError},
    resources::manager::GpuResourceManager,
};

/// 一次 upload 的统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub copies: usize,
    pub staged_bytes: u64,
    /// 本次 upload 完成时 fence 的值
    pub fence_value: u64,
    /// 随着本次 upload 一起释放的资源数量（staging buffer 等）
    pub retired: usize,
}

/// 初始化阶段的批量上传
///
/// `begin` 与 `end` 之间记录的所有拷贝、AS 构建等命令合并为一次提交，
/// `end` 时只等待一次 GPU。
#[derive(Debug, Default)]
pub struct UploadContext {
    label: Option<String>,
    copies: usize,
    staged_bytes: u64,
}

impl UploadContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.label.is_some()
    }

    pub fn begin(&mut self, cycler: &mut CommandCycler, label: &str) -> GfxResult<()> {
        if let Some(active) = &self.label {
            return Err(GraphicsError::invalid_state("no active upload", format!("upload `{active}` in progress")));
        }
        cycler.command_list()?.begin_label(format!("upload: {label}"));
        self.label = Some(label.to_string());
        self.copies = 0;
        self.staged_bytes = 0;
        Ok(())
    }

    /// 记录一次经过 staging buffer 的拷贝
    #[inline]
    pub fn record_staged_copy(&mut self, bytes: u64) {
        self.copies += 1;
        self.staged_bytes += bytes;
    }

    /// close → add fence value → signal → wait → 回收资源 → reset
    pub fn end(
        &mut self,
        cycler: &mut CommandCycler,
        fence: &mut FenceSync,
        resources: &mut GpuResourceManager,
    ) -> GfxResult<UploadStats> {
        let Some(label) = self.label.take() else {
            return Err(GraphicsError::invalid_state("active upload", "no upload in progress"));
        };

        cycler.command_list()?.end_label();
        cycler.close()?;
        fence.add_fence_value();
        cycler.signal(fence)?;
        fence.wait_gpu()?;
        let retired = resources.cleanup_retired(fence.completed_value()?);
        cycler.reset()?;

        let stats = UploadStats {
            copies: self.copies,
            staged_bytes: self.staged_bytes,
            fence_value: fence.fence_value(),
            retired,
        };
        log::info!(
            "upload `{}` finished: {} staged copies, {} bytes, {} resources retired",
            label,
            stats.copies,
            stats.staged_bytes,
            stats.retired
        );
        Ok(stats)
    }
}
