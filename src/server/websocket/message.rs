//! WebSocket 消息类型定义

use crate::downloader::DownloadView;
use crate::server::events::DownloadEvent;
use serde::{Deserialize, Serialize};

/// 客户端 -> 服务端
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳
    Ping { timestamp: i64 },
    /// 请求全部任务快照（断线重连后同步状态）
    RequestSnapshot,
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Connected { connection_id: String },
    Pong { timestamp: Option<i64> },
    Snapshot { tasks: Vec<DownloadView> },
    /// 下载事件（字段平铺，`event_type` 区分事件种类）
    Event {
        #[serde(flatten)]
        event: DownloadEvent,
    },
    /// 客户端处理过慢，丢失了部分事件
    Lagged { skipped: u64 },
    Error { code: String, message: String },
}

impl WsServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        WsServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
