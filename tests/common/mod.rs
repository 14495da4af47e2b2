//! 集成测试公共工具：脚本化传输后端与等待辅助函数

#![allow(dead_code)]

use assistant_download_manager::config::DownloadConfig;
use assistant_download_manager::downloader::{
    TransferBackend, TransferError, TransferProbe, TransferRequest,
};
use assistant_download_manager::DownloadManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 挂起中的传输先报告的字节数
pub const HELD_RECEIVED: u64 = 100;
/// 挂起中的传输报告的总大小
pub const HELD_EXPECTED: u64 = 1000;

/// 传输结局
#[derive(Debug, Clone)]
pub enum Step {
    /// 写入内容并成功
    Succeed(Vec<u8>),
    /// 服务器返回错误状态码
    Fail(u16),
}

/// 脚本化传输后端
///
/// 默认每个传输报告部分进度后挂起，直到测试调用 [`ScriptedBackend::finish`]
/// 或传输被取消；通过 [`ScriptedBackend::script`] 预设的地址会立即结束
#[derive(Default)]
pub struct ScriptedBackend {
    scripted: Mutex<HashMap<String, Step>>,
    held: Mutex<HashMap<String, oneshot::Sender<Step>>>,
    started: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 预设某个地址的结局（传输开始后立即生效）
    pub fn script(&self, url: &str, step: Step) {
        self.scripted.lock().insert(url.to_string(), step);
    }

    /// 结束一个挂起中的传输，返回是否找到该传输
    pub fn finish(&self, url: &str, step: Step) -> bool {
        match self.held.lock().remove(url) {
            Some(tx) => tx.send(step).is_ok(),
            None => false,
        }
    }

    pub fn is_held(&self, url: &str) -> bool {
        self.held.lock().contains_key(url)
    }

    /// 按开始顺序记录的地址
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    async fn apply(
        request: &TransferRequest,
        probe: &TransferProbe,
        step: Step,
    ) -> Result<(), TransferError> {
        match step {
            Step::Succeed(body) => {
                tokio::fs::write(&request.destination, &body).await?;
                probe.set_expected(Some(body.len() as u64));
                probe.set_received(body.len() as u64);
                Ok(())
            }
            Step::Fail(status) => Err(TransferError::HttpStatus(status)),
        }
    }
}

#[async_trait]
impl TransferBackend for ScriptedBackend {
    async fn fetch(
        &self,
        request: TransferRequest,
        probe: Arc<TransferProbe>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let url = request.url.to_string();
        self.started.lock().push(url.clone());

        let scripted = self.scripted.lock().get(&url).cloned();
        if let Some(step) = scripted {
            return Self::apply(&request, &probe, step).await;
        }

        let (tx, rx) = oneshot::channel();
        self.held.lock().insert(url.clone(), tx);
        probe.set_expected(Some(HELD_EXPECTED));
        probe.set_received(HELD_RECEIVED);

        tokio::select! {
            _ = cancel.cancelled() => {
                self.held.lock().remove(&url);
                Err(TransferError::Cancelled)
            }
            step = rx => match step {
                Ok(step) => Self::apply(&request, &probe, step).await,
                Err(_) => Err(TransferError::Cancelled),
            }
        }
    }
}

/// 测试环境：临时目录 + 配置
pub struct TestEnv {
    pub dir: TempDir,
    pub config: DownloadConfig,
}

impl TestEnv {
    pub fn new(max_concurrent_tasks: usize) -> Self {
        let dir = TempDir::new().expect("创建临时目录失败");
        let config = DownloadConfig {
            download_dir: dir.path().join("downloads"),
            data_dir: dir.path().join("data"),
            max_concurrent_tasks,
            progress_interval_ms: 20,
            ..Default::default()
        };
        Self { dir, config }
    }

    pub fn open(&self, backend: Arc<ScriptedBackend>) -> DownloadManager {
        DownloadManager::open(&self.config, backend).expect("创建下载管理器失败")
    }
}

pub fn url(name: &str) -> String {
    format!("https://x.test/files/{}", name)
}

/// 轮询直到条件成立，超时则 panic
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
