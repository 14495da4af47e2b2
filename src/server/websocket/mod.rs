//! WebSocket 模块
//!
//! 提供下载事件的实时推送

mod handler;
mod message;

pub use handler::handle_websocket;
pub use message::{WsClientMessage, WsServerMessage};
