//! 进度监控
//!
//! 每个运行中的传输对应一个监控循环，按固定间隔采样探针：
//! 1. 读取已接收/预期字节数
//! 2. 计算瞬时速度
//! 3. 通过下载管理器更新任务并持久化
//! 4. 传输结束时交给管理器处理完成/失败，然后退出
//!
//! 监控只持有管理器的弱引用，管理器销毁后循环自动结束。

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::{DownloadManager, ManagerInner};
use super::progress::SpeedCalculator;
use super::transfer::{TransferOutcome, TransferProbe};

pub(crate) struct ProgressMonitor {
    pub(crate) manager: Weak<ManagerInner>,
    pub(crate) task_id: String,
    /// 启动序号，用于识别过期的回调
    pub(crate) attempt: u64,
    pub(crate) probe: Arc<TransferProbe>,
    pub(crate) cancel: CancellationToken,
    pub(crate) interval: Duration,
}

impl ProgressMonitor {
    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次 tick 立即返回
        ticker.tick().await;

        let mut speed = SpeedCalculator::new(Instant::now());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("进度监控退出（任务已取消）: task_id={}", self.task_id);
                    return;
                }
                _ = ticker.tick() => {}
            }

            let snapshot = self.probe.snapshot();
            let current_speed = speed.sample(snapshot.received, Instant::now());

            let Some(inner) = self.manager.upgrade() else {
                debug!("下载管理器已销毁，进度监控退出: task_id={}", self.task_id);
                return;
            };
            let manager = DownloadManager::from_inner(inner);

            match snapshot.outcome.clone() {
                None => {
                    let still_current = manager
                        .apply_progress(&self.task_id, self.attempt, &snapshot, current_speed)
                        .await;
                    if !still_current {
                        debug!("进度监控退出（传输已被替换）: task_id={}", self.task_id);
                        return;
                    }
                }
                Some(TransferOutcome::Cancelled) if self.cancel.is_cancelled() => {
                    // 暂停/取消方已经设置好状态
                    return;
                }
                Some(outcome) => {
                    manager
                        .finish_transfer(&self.task_id, self.attempt, &snapshot, outcome)
                        .await;
                    return;
                }
            }
        }
    }
}
