//! 事件模块
//!
//! 定义下载任务事件类型，由下载管理器广播，WebSocket 连接订阅转发

mod types;

pub use types::*;
