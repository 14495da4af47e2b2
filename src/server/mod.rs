// Web服务器模块

pub mod error;
pub mod events;
pub mod handlers;
pub mod state;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 健康检查响应结构
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
    })
}

/// 构建完整路由（API 挂载在 /api/v1 下）
pub fn build_router(app_state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let api_routes = Router::new()
        // 下载API
        .route("/downloads", post(handlers::create_download))
        .route("/downloads", get(handlers::list_downloads))
        .route("/downloads/active", get(handlers::get_active_downloads))
        .route("/downloads/stats", get(handlers::get_download_stats))
        .route("/downloads/history", delete(handlers::clear_history))
        .route("/downloads/:id", get(handlers::get_download))
        .route("/downloads/:id", delete(handlers::delete_download))
        .route("/downloads/:id/start", post(handlers::start_download))
        .route("/downloads/:id/pause", post(handlers::pause_download))
        .route("/downloads/:id/resume", post(handlers::resume_download))
        .route("/downloads/:id/cancel", post(handlers::cancel_download))
        .route("/downloads/:id/retry", post(handlers::retry_download))
        .route("/downloads/:id/priority", put(handlers::set_download_priority))
        // WebSocket 路由
        .route("/ws", get(websocket::handle_websocket))
        .with_state(app_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(middleware)
}
