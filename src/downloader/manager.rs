use crate::config::DownloadConfig;
use crate::downloader::{
    error::DownloadResult,
    monitor::ProgressMonitor,
    transfer::{
        remove_partial, spawn_transfer, HttpTransfer, TransferBackend, TransferOutcome,
        TransferProbe, TransferRequest, TransferSnapshot,
    },
    DownloadError, DownloadTask, FileCategory, TaskPriority, TaskStatus,
};
use crate::persistence::HistoryStore;
use crate::server::events::{DownloadEvent, EventPublisher};
use anyhow::{Context, Result};
use parking_lot::Mutex as StateMutex;
use reqwest::Url;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行中的传输
#[derive(Debug)]
struct ActiveTransfer {
    /// 启动序号
    attempt: u64,
    /// 取消令牌（传输任务与进度监控共用）
    cancel: CancellationToken,
    /// 临时文件路径
    partial_path: PathBuf,
    transfer: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl ActiveTransfer {
    fn stop(&self) {
        self.cancel.cancel();
        self.monitor.abort();
    }
}

/// 下载管理器内部状态
///
/// `tasks` 是唯一的数据来源；`active` 以任务ID为键，
/// 当且仅当任务状态为 Downloading 时存在条目
#[derive(Debug, Default)]
struct ManagerState {
    tasks: Vec<DownloadTask>,
    active: HashMap<String, ActiveTransfer>,
}

impl ManagerState {
    fn task(&self, id: &str) -> Option<&DownloadTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut DownloadTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// 按优先级挑选下一个排队任务（同优先级按创建时间，再按加入顺序）
    fn next_queued(&self) -> Option<String> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Queued)
            .min_by(|(ia, a), (ib, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(ia.cmp(ib))
            })
            .map(|(_, t)| t.id.clone())
    }
}

pub(crate) struct ManagerInner {
    /// 串行化所有变更操作（读-改-持久化整体原子）
    op_lock: Mutex<()>,
    /// 内存状态，只在不跨 await 的短临界区内持有
    state: StateMutex<ManagerState>,
    store: HistoryStore,
    backend: Arc<dyn TransferBackend>,
    events: EventPublisher,
    download_dir: PathBuf,
    partial_dir: PathBuf,
    max_concurrent: usize,
    progress_interval: Duration,
    next_attempt: AtomicU64,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for transfer in state.active.values() {
            transfer.stop();
        }
        if !state.active.is_empty() {
            info!("下载管理器已销毁，取消 {} 个运行中的传输", state.active.len());
        }
    }
}

/// 下载统计
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DownloadStats {
    pub total: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 所有任务已下载字节数之和
    pub total_bytes_downloaded: u64,
    /// 当前总速度 (bytes/s)
    pub current_speed: u64,
    pub by_category: BTreeMap<FileCategory, usize>,
}

/// 下载管理器
///
/// 可以廉价克隆，所有克隆共享同一份状态
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("download_dir", &self.inner.download_dir)
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// 使用 HTTP 传输创建下载管理器
    pub fn open_http(config: &DownloadConfig) -> Result<Self> {
        let backend = HttpTransfer::new(config).context("创建 HTTP 客户端失败")?;
        Self::open(config, Arc::new(backend))
    }

    /// 创建下载管理器并加载下载历史
    ///
    /// 上次运行中断时处于下载中的任务会重置为排队状态
    pub fn open(config: &DownloadConfig, backend: Arc<dyn TransferBackend>) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.download_dir).context("创建下载目录失败")?;
        std::fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        // 上次运行遗留的临时文件无法续传，直接清理
        let partial_dir = config.partial_dir();
        if partial_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&partial_dir) {
                warn!("清理临时文件目录失败: {:?}, 错误: {}", partial_dir, e);
            }
        }
        std::fs::create_dir_all(&partial_dir).context("创建临时文件目录失败")?;

        let store = HistoryStore::new(&config.data_dir);
        let mut tasks = store.load().context("加载下载历史失败")?;

        let mut recovered = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Downloading {
                task.mark_queued();
                recovered += 1;
            }
            task.speed_bytes_per_second = 0;
        }

        info!(
            "创建下载管理器: 下载目录={:?}, 数据目录={:?}, 最大同时下载数={}, 历史任务={}",
            config.download_dir,
            config.data_dir,
            config.max_concurrent_tasks,
            tasks.len()
        );

        let manager = Self {
            inner: Arc::new(ManagerInner {
                op_lock: Mutex::new(()),
                state: StateMutex::new(ManagerState {
                    tasks,
                    active: HashMap::new(),
                }),
                store,
                backend,
                events: EventPublisher::default(),
                download_dir: config.download_dir.clone(),
                partial_dir,
                max_concurrent: config.max_concurrent_tasks,
                progress_interval: Duration::from_millis(config.progress_interval_ms),
                next_attempt: AtomicU64::new(1),
            }),
        };

        if recovered > 0 {
            info!("{} 个中断的任务已重置为排队状态", recovered);
        }

        let mut launched = 0;
        if config.resume_on_launch {
            while launched < manager.inner.max_concurrent {
                let next = manager.inner.state.lock().next_queued();
                let Some(next) = next else {
                    break;
                };
                match manager.claim_slot(&next) {
                    Ok(_) => {
                        info!("⚡ 启动时自动开始排队任务: {}", next);
                        launched += 1;
                    }
                    Err(e) => {
                        error!("启动时自动开始排队任务失败: {}, 错误: {}", next, e);
                        break;
                    }
                }
            }
        }

        if recovered > 0 || launched > 0 {
            manager.persist_blocking();
        }

        Ok(manager)
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    /// 订阅下载事件
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    // ========================================================================
    // 变更操作
    // ========================================================================

    /// 添加下载任务（状态为排队，不会自动开始）
    pub async fn add_download(
        &self,
        url: &str,
        file_name: Option<&str>,
        priority: TaskPriority,
    ) -> DownloadResult<DownloadTask> {
        let parsed = parse_download_url(url)?;
        let file_name = file_name
            .map(sanitize_file_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| derive_file_name(&parsed));

        let _guard = self.inner.op_lock.lock().await;

        let task = {
            let mut state = self.inner.state.lock();
            let normalized = parsed.as_str();
            if state
                .tasks
                .iter()
                .any(|t| t.is_unfinished() && t.url == normalized)
            {
                return Err(DownloadError::AlreadyExists(normalized.to_string()));
            }

            let task = DownloadTask::new(normalized.to_string(), file_name, priority);
            state.tasks.push(task.clone());
            task
        };

        info!(
            "添加下载任务: id={}, file={}, category={}, priority={:?}",
            task.id, task.file_name, task.category, task.priority
        );

        self.persist().await;
        self.inner
            .events
            .publish(DownloadEvent::Created { task: task.clone() });

        Ok(task)
    }

    /// 开始下载
    ///
    /// 已在下载中时直接返回成功
    pub async fn start_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;
        self.start_locked(id).await
    }

    /// 暂停下载（不在下载中时不做任何事）
    pub async fn pause_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        let detached = {
            let mut state = self.inner.state.lock();
            let status = state
                .task(id)
                .map(|t| t.status)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            if status != TaskStatus::Downloading {
                debug!("任务 {} 未在下载中 ({}), 忽略暂停", id, status);
                return Ok(());
            }

            let detached = detach(&mut state, id);
            if let Some(task) = state.task_mut(id) {
                task.mark_paused();
            }
            detached
        };

        info!("暂停下载任务: {}", id);
        self.after_detach(id, TaskStatus::Paused, detached).await;
        Ok(())
    }

    /// 恢复暂停的任务
    ///
    /// 不支持断点续传，恢复后从 0 字节重新开始
    pub async fn resume_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        let status = self
            .inner
            .state
            .lock()
            .task(id)
            .map(|t| t.status)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        if status != TaskStatus::Paused {
            debug!("任务 {} 未暂停 ({}), 忽略恢复", id, status);
            return Ok(());
        }

        info!("恢复下载任务: {}", id);
        self.launch(id).await
    }

    /// 取消下载（任意状态都会标记为已取消）
    pub async fn cancel_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        let (old_status, detached) = {
            let mut state = self.inner.state.lock();
            let old_status = state
                .task(id)
                .map(|t| t.status)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            let detached = detach(&mut state, id);
            if let Some(task) = state.task_mut(id) {
                task.mark_cancelled();
            }
            (old_status, detached)
        };

        info!("取消下载任务: {} (原状态: {})", id, old_status);

        if detached.is_some() {
            self.after_detach(id, TaskStatus::Cancelled, detached).await;
        } else {
            self.persist().await;
            self.publish_status(id, old_status, TaskStatus::Cancelled);
        }
        Ok(())
    }

    /// 重试任务：重置计数器后重新走启动流程
    ///
    /// 没有空闲槽位时任务保持排队并返回 `MaxConcurrentReached`；
    /// 已完成的任务和开始下载一样被拒绝
    pub async fn retry_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        let old_status = {
            let mut state = self.inner.state.lock();
            let task = state
                .task_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            match task.status {
                TaskStatus::Downloading => {
                    debug!("任务 {} 正在下载，忽略重试", id);
                    return Ok(());
                }
                TaskStatus::Completed => {
                    return Err(DownloadError::DownloadFailed(format!(
                        "任务已完成: {}",
                        id
                    )));
                }
                _ => {}
            }
            let old_status = task.status;
            task.mark_queued();
            old_status
        };

        info!("重试下载任务: {} (原状态: {})", id, old_status);
        self.persist().await;
        self.publish_status(id, old_status, TaskStatus::Queued);

        self.launch(id).await
    }

    /// 删除任务（幂等）
    ///
    /// 会取消运行中的传输，并删除已下载的文件
    pub async fn remove_download(&self, id: &str) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        let (removed, detached) = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.tasks.iter().position(|t| t.id == id) else {
                debug!("删除任务时未找到记录（可能已删除）: {}", id);
                return Ok(());
            };
            let detached = detach(&mut state, id);
            (state.tasks.remove(pos), detached)
        };

        if let Some(transfer) = &detached {
            remove_partial(&transfer.partial_path).await;
        }

        if let Some(path) = &removed.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("已删除本地文件: {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("删除本地文件失败: {:?}, 错误: {}", path, e),
            }
        }

        info!("删除下载任务: {} ({})", id, removed.file_name);
        self.persist().await;
        self.inner.events.publish(DownloadEvent::Removed {
            task_id: id.to_string(),
        });

        if detached.is_some() {
            self.promote_next().await;
        }
        Ok(())
    }

    /// 修改优先级（只影响之后挑选排队任务的顺序）
    pub async fn set_priority(&self, id: &str, priority: TaskPriority) -> DownloadResult<()> {
        let _guard = self.inner.op_lock.lock().await;

        {
            let mut state = self.inner.state.lock();
            let task = state
                .task_mut(id)
                .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
            if task.priority == priority {
                return Ok(());
            }
            task.priority = priority;
        }

        info!("修改任务优先级: {} -> {:?}", id, priority);
        self.persist().await;
        Ok(())
    }

    /// 清除已结束的任务记录（不删除磁盘文件）
    ///
    /// 返回清除的任务数
    pub async fn clear_history(&self, keep_completed: bool) -> usize {
        let _guard = self.inner.op_lock.lock().await;

        let removed: Vec<String> = {
            let mut state = self.inner.state.lock();
            let (cleared, keep): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.tasks).into_iter().partition(|t| {
                    t.is_terminal() && !(keep_completed && t.status == TaskStatus::Completed)
                });
            state.tasks = keep;
            cleared.into_iter().map(|t| t.id).collect()
        };

        if !removed.is_empty() {
            self.persist().await;
            for id in &removed {
                self.inner.events.publish(DownloadEvent::Removed {
                    task_id: id.clone(),
                });
            }
        }

        info!(
            "清除了 {} 条下载记录 (保留已完成: {})",
            removed.len(),
            keep_completed
        );
        removed.len()
    }

    /// 停止所有传输，运行中的任务重置为排队，下次启动时重新下载
    pub async fn shutdown(&self) {
        let _guard = self.inner.op_lock.lock().await;

        let stopped: Vec<ActiveTransfer> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state.active.keys().cloned().collect();
            let mut stopped = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(transfer) = detach(&mut state, &id) {
                    stopped.push(transfer);
                }
                if let Some(task) = state.task_mut(&id) {
                    task.mark_queued();
                }
            }
            stopped
        };

        for transfer in &stopped {
            remove_partial(&transfer.partial_path).await;
        }

        self.persist().await;
        info!("下载管理器已停止，{} 个传输已中断", stopped.len());
    }

    // ========================================================================
    // 查询（只读内存，不做 I/O）
    // ========================================================================

    pub fn get_download(&self, id: &str) -> Option<DownloadTask> {
        self.inner.state.lock().task(id).cloned()
    }

    /// 所有任务（按加入顺序）
    pub fn get_downloads(&self) -> Vec<DownloadTask> {
        self.inner.state.lock().tasks.clone()
    }

    /// 正在下载的任务
    pub fn get_active_downloads(&self) -> Vec<DownloadTask> {
        self.get_by_status(TaskStatus::Downloading)
    }

    pub fn get_by_status(&self, status: TaskStatus) -> Vec<DownloadTask> {
        self.filter(|t| t.status == status)
    }

    pub fn get_by_category(&self, category: FileCategory) -> Vec<DownloadTask> {
        self.filter(|t| t.category == category)
    }

    /// 按文件名或地址搜索（不区分大小写）
    pub fn search(&self, text: &str) -> Vec<DownloadTask> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return self.get_downloads();
        }
        self.filter(|t| {
            t.file_name.to_lowercase().contains(&needle) || t.url.to_lowercase().contains(&needle)
        })
    }

    pub fn get_stats(&self) -> DownloadStats {
        let state = self.inner.state.lock();
        let mut stats = DownloadStats {
            total: state.tasks.len(),
            ..Default::default()
        };
        for task in &state.tasks {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Downloading => stats.downloading += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_bytes_downloaded += task.bytes_downloaded;
            stats.current_speed += task.speed_bytes_per_second;
            *stats.by_category.entry(task.category).or_insert(0) += 1;
        }
        stats
    }

    /// 占用中的槽位数
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// 任务是否占用传输槽位
    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner.state.lock().active.contains_key(id)
    }

    fn filter(&self, predicate: impl Fn(&DownloadTask) -> bool) -> Vec<DownloadTask> {
        self.inner
            .state
            .lock()
            .tasks
            .iter()
            .filter(|t| predicate(t))
            .cloned()
            .collect()
    }

    // ========================================================================
    // 进度监控回调
    // ========================================================================

    /// 更新字节计数和速度
    ///
    /// 返回 false 表示该次传输已不再有效（被暂停/取消/替换），监控应退出
    pub(crate) async fn apply_progress(
        &self,
        id: &str,
        attempt: u64,
        snapshot: &TransferSnapshot,
        speed: u64,
    ) -> bool {
        let _guard = self.inner.op_lock.lock().await;

        let event = {
            let mut state = self.inner.state.lock();
            if !is_current(&state, id, attempt) {
                return false;
            }
            let Some(task) = state.task_mut(id) else {
                return false;
            };
            update_counters(task, snapshot);
            task.speed_bytes_per_second = speed;
            DownloadEvent::progress_of(task)
        };

        self.persist().await;
        self.inner.events.publish(event);
        true
    }

    /// 传输结束：成功时移动文件并标记完成，失败时记录错误，然后补位
    pub(crate) async fn finish_transfer(
        &self,
        id: &str,
        attempt: u64,
        snapshot: &TransferSnapshot,
        outcome: TransferOutcome,
    ) {
        let _guard = self.inner.op_lock.lock().await;

        let (partial_path, file_name) = {
            let mut state = self.inner.state.lock();
            if !is_current(&state, id, attempt) {
                debug!("忽略过期的传输结果: task_id={}, attempt={}", id, attempt);
                return;
            }
            let partial_path = state
                .active
                .get(id)
                .map(|t| t.partial_path.clone())
                .unwrap_or_default();
            let Some(task) = state.task_mut(id) else {
                return;
            };
            update_counters(task, snapshot);
            (partial_path, task.file_name.clone())
        };

        // 文件移动期间仍占用槽位，保证 Downloading 与槽位一一对应
        let result = match outcome {
            TransferOutcome::Succeeded => {
                match move_into_place(&partial_path, &self.inner.download_dir, &file_name).await {
                    Ok(dest) => Ok(dest),
                    Err(e) => {
                        remove_partial(&partial_path).await;
                        Err(format!("保存文件失败: {}", e))
                    }
                }
            }
            TransferOutcome::Failed(message) => Err(message),
            TransferOutcome::Cancelled => Err("传输被意外中断".to_string()),
        };

        let final_event = {
            let mut state = self.inner.state.lock();
            state.active.remove(id);
            let Some(task) = state.task_mut(id) else {
                return;
            };
            match result {
                Ok(dest) => {
                    task.mark_completed(dest.clone());
                    info!("下载完成: {} -> {:?}", id, dest);
                    DownloadEvent::Completed {
                        task_id: id.to_string(),
                        local_path: dest.display().to_string(),
                        completed_at: task.completed_at.unwrap_or_else(chrono::Utc::now),
                    }
                }
                Err(message) => {
                    warn!("下载失败: {}, 错误: {}", id, message);
                    task.mark_failed(message.clone());
                    DownloadEvent::Failed {
                        task_id: id.to_string(),
                        error: message,
                    }
                }
            }
        };

        self.persist().await;
        if let DownloadEvent::Completed { .. } = &final_event {
            self.publish_status(id, TaskStatus::Downloading, TaskStatus::Completed);
        } else {
            self.publish_status(id, TaskStatus::Downloading, TaskStatus::Failed);
        }
        self.inner.events.publish(final_event);

        self.promote_next().await;
    }

    // ========================================================================
    // 内部方法（调用方必须持有 op_lock）
    // ========================================================================

    async fn start_locked(&self, id: &str) -> DownloadResult<()> {
        let status = self
            .inner
            .state
            .lock()
            .task(id)
            .map(|t| t.status)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;

        match status {
            TaskStatus::Downloading => {
                debug!("任务已在下载中: {}", id);
                Ok(())
            }
            TaskStatus::Completed => Err(DownloadError::DownloadFailed(format!(
                "任务已完成: {}",
                id
            ))),
            _ => self.launch(id).await,
        }
    }

    /// 占用槽位并启动传输，然后持久化并发送状态事件
    async fn launch(&self, id: &str) -> DownloadResult<()> {
        let old_status = self.claim_slot(id)?;
        self.persist().await;
        self.publish_status(id, old_status, TaskStatus::Downloading);
        Ok(())
    }

    /// 占用槽位并启动传输和进度监控（只改内存状态），返回原状态
    fn claim_slot(&self, id: &str) -> DownloadResult<TaskStatus> {
        let max = self.inner.max_concurrent;

        let mut state = self.inner.state.lock();
        if state.active.len() >= max {
            debug!(
                "无可用槽位: task_id={}, 已用 {}/{}",
                id,
                state.active.len(),
                max
            );
            return Err(DownloadError::MaxConcurrentReached { max });
        }

        let task = state
            .task_mut(id)
            .ok_or_else(|| DownloadError::NotFound(id.to_string()))?;
        let url = Url::parse(&task.url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", task.url, e)))?;
        let old_status = task.status;
        task.mark_downloading();

        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        let partial_path = self
            .inner
            .partial_dir
            .join(format!("{}-{}.part", id, attempt));
        let cancel = CancellationToken::new();
        let probe = TransferProbe::new();

        let transfer = spawn_transfer(
            self.inner.backend.clone(),
            TransferRequest {
                task_id: id.to_string(),
                url,
                destination: partial_path.clone(),
            },
            probe.clone(),
            cancel.clone(),
        );
        let monitor = tokio::spawn(
            ProgressMonitor {
                manager: Arc::downgrade(&self.inner),
                task_id: id.to_string(),
                attempt,
                probe,
                cancel: cancel.clone(),
                interval: self.inner.progress_interval,
            }
            .run(),
        );

        state.active.insert(
            id.to_string(),
            ActiveTransfer {
                attempt,
                cancel,
                partial_path,
                transfer,
                monitor,
            },
        );

        info!(
            "启动下载任务: {} (槽位 {}/{})",
            id,
            state.active.len(),
            max
        );
        Ok(old_status)
    }

    /// 用最高优先级的排队任务填补一个空出的槽位
    ///
    /// 每空出一个槽位调用一次；返回被启动的任务ID
    async fn promote_next(&self) -> Option<String> {
        let next = self.inner.state.lock().next_queued()?;
        match self.launch(&next).await {
            Ok(()) => {
                info!("⚡ 自动启动排队任务: {}", next);
                Some(next)
            }
            Err(e) => {
                error!("自动启动排队任务失败: {}, 错误: {}", next, e);
                None
            }
        }
    }

    /// 暂停/取消后的收尾：删除临时文件、持久化、发送事件、补位
    async fn after_detach(
        &self,
        id: &str,
        new_status: TaskStatus,
        detached: Option<ActiveTransfer>,
    ) {
        if let Some(transfer) = &detached {
            remove_partial(&transfer.partial_path).await;
        }
        self.persist().await;
        self.publish_status(id, TaskStatus::Downloading, new_status);
        if detached.is_some() {
            self.promote_next().await;
        }
    }

    /// 整体重写下载历史，失败只记录日志
    ///
    /// 文件写入和 fsync 在阻塞线程池中执行；调用方持有 op_lock，写入顺序与变更顺序一致
    async fn persist(&self) {
        let snapshot = self.inner.state.lock().tasks.clone();
        let store = self.inner.store.clone();
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("保存下载历史失败: {:?}, 错误: {}", self.inner.store.path(), e);
            }
            Err(e) => warn!("保存下载历史的任务异常退出: {}", e),
        }
    }

    /// 同步写入下载历史，只在创建管理器时使用
    fn persist_blocking(&self) {
        let snapshot = self.inner.state.lock().tasks.clone();
        if let Err(e) = self.inner.store.save(&snapshot) {
            warn!("保存下载历史失败: {:?}, 错误: {}", self.inner.store.path(), e);
        }
    }

    fn publish_status(&self, id: &str, old_status: TaskStatus, new_status: TaskStatus) {
        if old_status == new_status {
            return;
        }
        self.inner.events.publish(DownloadEvent::StatusChanged {
            task_id: id.to_string(),
            old_status,
            new_status,
        });
    }
}

/// 从运行表移除并立即取消传输
fn detach(state: &mut ManagerState, id: &str) -> Option<ActiveTransfer> {
    let transfer = state.active.remove(id)?;
    transfer.stop();
    debug!(
        "已释放槽位: task_id={}, attempt={}, transfer_finished={}",
        id,
        transfer.attempt,
        transfer.transfer.is_finished()
    );
    Some(transfer)
}

fn is_current(state: &ManagerState, id: &str, attempt: u64) -> bool {
    state
        .active
        .get(id)
        .map(|t| t.attempt == attempt)
        .unwrap_or(false)
}

/// 用探针数据更新计数器：下载中单调不减，且不超过已知总大小
fn update_counters(task: &mut DownloadTask, snapshot: &TransferSnapshot) {
    if snapshot.expected >= 0 {
        task.total_bytes = snapshot.expected;
    }
    let mut received = snapshot.received.max(task.bytes_downloaded);
    if task.total_bytes >= 0 {
        received = received.min(task.total_bytes as u64);
    }
    task.bytes_downloaded = received;
}

fn parse_download_url(url: &str) -> DownloadResult<Url> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::InvalidUrl(format!(
            "{}: 不支持的协议 {}",
            url, other
        ))),
    }
}

/// 从 URL 推导文件名：最后一个路径段 → 主机名 → "download"
pub fn derive_file_name(url: &Url) -> String {
    let from_path = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty());

    from_path
        .or_else(|| {
            url.host_str()
                .map(sanitize_file_name)
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "download".to_string())
}

/// 清理文件名：路径分隔符和 NUL 替换为 `_`，全部是点的名字视为空
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        String::new()
    } else {
        cleaned
    }
}

/// 把临时文件移动到下载目录，同名文件已存在时追加序号
async fn move_into_place(
    partial_path: &Path,
    download_dir: &Path,
    file_name: &str,
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(download_dir).await?;
    let dest = unique_destination(download_dir, file_name);

    if let Err(e) = tokio::fs::rename(partial_path, &dest).await {
        // 跨文件系统时 rename 会失败，退回到复制后删除
        debug!("重命名失败，改为复制: {:?} -> {:?}, 错误: {}", partial_path, dest, e);
        tokio::fs::copy(partial_path, &dest).await?;
        tokio::fs::remove_file(partial_path).await?;
    }

    Ok(dest)
}

fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| match &ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_derive_file_name() {
        let url = Url::parse("https://x.test/files/report%20final.pdf?x=1").unwrap();
        assert_eq!(derive_file_name(&url), "report final.pdf");

        let url = Url::parse("https://x.test/dir/").unwrap();
        assert_eq!(derive_file_name(&url), "dir");

        let url = Url::parse("https://x.test/").unwrap();
        assert_eq!(derive_file_name(&url), "x.test");

        let url = Url::parse("https://x.test/a%2Fb.txt").unwrap();
        assert_eq!(derive_file_name(&url), "a_b.txt");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name(" a/b\\c.txt "), "a_b_c.txt");
        assert_eq!(sanitize_file_name(".."), "");
        assert_eq!(sanitize_file_name(".bashrc"), ".bashrc");
    }

    #[test]
    fn test_parse_download_url() {
        assert!(parse_download_url("https://x.test/a.zip").is_ok());
        assert!(matches!(
            parse_download_url("not a url"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            parse_download_url("ftp://x.test/a.zip"),
            Err(DownloadError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_next_queued_prefers_priority_then_age() {
        let mut state = ManagerState::default();
        let mut a = DownloadTask::new("https://x.test/a".into(), "a".into(), TaskPriority::Normal);
        let mut b = DownloadTask::new("https://x.test/b".into(), "b".into(), TaskPriority::High);
        let c = DownloadTask::new("https://x.test/c".into(), "c".into(), TaskPriority::High);
        // 同优先级按创建时间
        b.created_at = c.created_at - chrono::Duration::seconds(1);
        state.tasks = vec![a.clone(), c.clone(), b.clone()];
        assert_eq!(state.next_queued(), Some(b.id.clone()));

        state.tasks.retain(|t| t.id != b.id);
        assert_eq!(state.next_queued(), Some(c.id.clone()));

        state.tasks.retain(|t| t.id != c.id);
        a.status = TaskStatus::Paused;
        state.tasks = vec![a];
        assert_eq!(state.next_queued(), None);
    }

    #[test]
    fn test_update_counters_is_monotonic_and_clamped() {
        let mut task = DownloadTask::new("https://x.test/a".into(), "a".into(), TaskPriority::Normal);
        task.bytes_downloaded = 100;

        update_counters(
            &mut task,
            &TransferSnapshot {
                received: 50,
                expected: -1,
                outcome: None,
            },
        );
        assert_eq!(task.bytes_downloaded, 100);
        assert_eq!(task.total_bytes, -1);

        update_counters(
            &mut task,
            &TransferSnapshot {
                received: 500,
                expected: 300,
                outcome: None,
            },
        );
        assert_eq!(task.total_bytes, 300);
        assert_eq!(task.bytes_downloaded, 300);
    }

    #[test]
    fn test_restarted_transfer_without_length_is_not_clamped() {
        let mut task = DownloadTask::new("https://x.test/a".into(), "a".into(), TaskPriority::Normal);
        task.mark_downloading();
        task.total_bytes = 300;
        task.mark_paused();

        task.mark_downloading();
        update_counters(
            &mut task,
            &TransferSnapshot {
                received: 1500,
                expected: -1,
                outcome: None,
            },
        );
        assert_eq!(task.bytes_downloaded, 1500);

        task.mark_completed(PathBuf::from("/tmp/a"));
        assert_eq!(task.total_bytes, 1500);
    }

    #[test]
    fn test_unique_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a.txt"));
        std::fs::write(dir.join("a.txt"), b"1").unwrap();
        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a (1).txt"));
        std::fs::write(dir.join("a (1).txt"), b"2").unwrap();
        assert_eq!(unique_destination(dir, "a.txt"), dir.join("a (2).txt"));

        std::fs::write(dir.join("README"), b"3").unwrap();
        assert_eq!(unique_destination(dir, "README"), dir.join("README (1)"));
    }

    #[tokio::test]
    async fn test_move_into_place() {
        let temp_dir = TempDir::new().unwrap();
        let partial = temp_dir.path().join("x.part");
        std::fs::write(&partial, b"payload").unwrap();

        let dest = move_into_place(&partial, &temp_dir.path().join("out"), "x.bin")
            .await
            .unwrap();
        assert_eq!(dest, temp_dir.path().join("out/x.bin"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(!partial.exists());
    }
}
