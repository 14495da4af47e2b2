//! 底层传输
//!
//! 传输任务把 URL 的内容写入临时文件，同时通过 [`TransferProbe`] 暴露
//! 已接收/预期字节数和最终结果，供进度监控轮询。
//! 默认实现为 [`HttpTransfer`]（reqwest 流式 GET），测试中可以替换为脚本化实现。

use crate::config::DownloadConfig;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::UNKNOWN_TOTAL;

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("网络错误: {0}")]
    Network(#[from] reqwest::Error),

    #[error("服务器返回状态码 {0}")]
    HttpStatus(u16),

    #[error("写入文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("数据不完整: 已接收 {received} 字节，预期 {expected} 字节")]
    Incomplete { received: u64, expected: u64 },

    #[error("传输已取消")]
    Cancelled,
}

/// 传输最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// 某一时刻的传输状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub received: u64,
    /// 预期总字节数，未知时为 -1
    pub expected: i64,
    pub outcome: Option<TransferOutcome>,
}

/// 传输探针
///
/// 传输任务写入，进度监控读取
#[derive(Debug)]
pub struct TransferProbe {
    received: AtomicU64,
    expected: AtomicI64,
    outcome: Mutex<Option<TransferOutcome>>,
}

impl Default for TransferProbe {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            expected: AtomicI64::new(UNKNOWN_TOTAL),
            outcome: Mutex::new(None),
        }
    }
}

impl TransferProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn set_received(&self, bytes: u64) {
        self.received.store(bytes, Ordering::SeqCst);
    }

    pub fn set_expected(&self, expected: Option<u64>) {
        let value = expected
            .and_then(|v| i64::try_from(v).ok())
            .unwrap_or(UNKNOWN_TOTAL);
        self.expected.store(value, Ordering::SeqCst);
    }

    /// 记录最终结果，只有第一次调用生效
    pub fn finish(&self, outcome: TransferOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            received: self.received.load(Ordering::SeqCst),
            expected: self.expected.load(Ordering::SeqCst),
            outcome: self.outcome.lock().clone(),
        }
    }
}

/// 一次传输请求
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: String,
    pub url: Url,
    /// 临时文件路径，成功后由管理器移动到下载目录
    pub destination: PathBuf,
}

/// 传输后端
#[async_trait]
pub trait TransferBackend: Send + Sync + 'static {
    /// 执行传输直到完成、失败或被取消
    ///
    /// 实现需要持续更新 `probe` 中的字节计数，并在 `cancel` 触发后尽快返回
    /// [`TransferError::Cancelled`]
    async fn fetch(
        &self,
        request: TransferRequest,
        probe: Arc<TransferProbe>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError>;
}

/// 在后台运行一次传输，结果写入探针
pub fn spawn_transfer(
    backend: Arc<dyn TransferBackend>,
    request: TransferRequest,
    probe: Arc<TransferProbe>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = request.task_id.clone();
        let outcome = match backend.fetch(request, probe.clone(), cancel).await {
            Ok(()) => TransferOutcome::Succeeded,
            Err(TransferError::Cancelled) => TransferOutcome::Cancelled,
            Err(e) => {
                warn!("传输失败: task_id={}, 错误: {}", task_id, e);
                TransferOutcome::Failed(e.to_string())
            }
        };
        probe.finish(outcome);
    })
}

/// 基于 reqwest 的 HTTP(S) 传输
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
}

impl HttpTransfer {
    pub fn new(config: &DownloadConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(10));

        // 0 表示不限制整体超时（大文件下载可能持续很久）
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    async fn stream_to_file(
        &self,
        request: &TransferRequest,
        probe: &TransferProbe,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.client.get(request.url.clone()).send() => r?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus(status.as_u16()));
        }

        let content_length = response.content_length();
        probe.set_expected(content_length);
        debug!(
            "开始接收数据: task_id={}, content_length={:?}",
            request.task_id, content_length
        );

        let file = tokio::fs::File::create(&request.destination).await?;
        let mut writer = tokio::io::BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut received = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    writer.write_all(&bytes).await?;
                    received += bytes.len() as u64;
                    probe.add_received(bytes.len() as u64);
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        writer.flush().await?;

        if let Some(expected) = content_length {
            if received != expected {
                return Err(TransferError::Incomplete { received, expected });
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TransferBackend for HttpTransfer {
    async fn fetch(
        &self,
        request: TransferRequest,
        probe: Arc<TransferProbe>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = self.stream_to_file(&request, &probe, &cancel).await;
        if result.is_err() {
            remove_partial(&request.destination).await;
        }
        result
    }
}

/// 删除未完成的临时文件（不存在时忽略）
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("已删除临时文件: {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除临时文件失败: {:?}, 错误: {}", path, e),
    }
}
