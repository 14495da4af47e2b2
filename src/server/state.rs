// 应用状态

use crate::config::AppConfig;
use crate::downloader::DownloadManager;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载管理器
    pub download_manager: DownloadManager,
    /// 应用配置（启动后只读）
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 根据配置创建应用状态（使用 HTTP 传输）
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let download_manager = DownloadManager::open_http(&config.download)?;
        Ok(Self::with_manager(config, download_manager))
    }

    pub fn with_manager(config: AppConfig, download_manager: DownloadManager) -> Self {
        Self {
            download_manager,
            config: Arc::new(config),
        }
    }

    /// 优雅关闭：中断运行中的传输并保存状态
    pub async fn shutdown(&self) {
        self.download_manager.shutdown().await;
    }
}
