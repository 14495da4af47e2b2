use thiserror::Error;

/// 下载管理器对调用方返回的错误
///
/// 均为可恢复错误，由调用方决定如何提示
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("无效的下载地址: {0}")]
    InvalidUrl(String),

    #[error("下载失败: {0}")]
    DownloadFailed(String),

    #[error("已达到最大同时下载数 ({max})")]
    MaxConcurrentReached { max: usize },

    #[error("相同地址的下载任务已存在: {0}")]
    AlreadyExists(String),

    #[error("任务不存在: {0}")]
    NotFound(String),
}

pub type DownloadResult<T> = Result<T, DownloadError>;
