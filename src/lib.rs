// Assistant Download Manager Library
// 并发受限的下载管理核心库

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 日志模块
pub mod logging;

// 下载历史持久化模块
pub mod persistence;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    categorize, format_bytes, DownloadError, DownloadManager, DownloadResult, DownloadStats,
    DownloadTask, FileCategory, TaskPriority, TaskStatus,
};
pub use server::events::DownloadEvent;
pub use server::AppState;
