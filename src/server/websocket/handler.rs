//! WebSocket 路由处理器

use crate::downloader::DownloadView;
use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket 路由处理器
///
/// 升级 HTTP 连接为 WebSocket，推送下载事件
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &WsServerMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("序列化消息失败: {}", e);
            true
        }
    }
}

fn snapshot(state: &AppState) -> WsServerMessage {
    WsServerMessage::Snapshot {
        tasks: state
            .download_manager
            .get_downloads()
            .into_iter()
            .map(DownloadView::from)
            .collect(),
    }
}

/// 处理 WebSocket 连接
///
/// 事件推送与客户端消息在同一个循环里处理，连接关闭或发送失败时退出
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!("新的 WebSocket 连接: {}", connection_id);

    let mut events = state.download_manager.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let connected = WsServerMessage::Connected {
        connection_id: connection_id.clone(),
    };
    if !send_message(&mut sender, &connected).await {
        warn!("发送连接成功消息失败: {}", connection_id);
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let message = match event {
                    Ok(event) => WsServerMessage::Event { event },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket 客户端过慢，丢失 {} 条事件: {}", skipped, connection_id);
                        WsServerMessage::Lagged { skipped }
                    }
                    Err(RecvError::Closed) => break,
                };
                if !send_message(&mut sender, &message).await {
                    break;
                }
            }
            incoming = receiver.next() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("收到关闭消息: {}", connection_id);
                        break;
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        debug!("WebSocket 接收错误: {} - {}", connection_id, e);
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if !send_message(&mut sender, &reply).await {
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}

/// 处理客户端消息，返回需要回复的消息
fn handle_client_message(state: &AppState, text: &str) -> Option<WsServerMessage> {
    match serde_json::from_str::<WsClientMessage>(text) {
        Ok(WsClientMessage::Ping { timestamp }) => Some(WsServerMessage::Pong {
            timestamp: Some(timestamp),
        }),
        Ok(WsClientMessage::RequestSnapshot) => Some(snapshot(state)),
        Err(e) => Some(WsServerMessage::error(
            "PARSE_ERROR",
            format!("消息解析失败: {}", e),
        )),
    }
}
