use crate::downloader::{
    DownloadError, DownloadStats, DownloadTask, DownloadView, FileCategory, TaskPriority,
    TaskStatus,
};
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ApiResponse;

/// 创建下载任务请求
#[derive(Debug, Deserialize)]
pub struct CreateDownloadRequest {
    pub url: String,
    /// 不填时从 URL 推导
    pub file_name: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// 是否立即开始，不填时使用配置 download.auto_start
    pub start: Option<bool>,
}

/// 任务列表查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ListDownloadsQuery {
    pub status: Option<String>,
    pub category: Option<String>,
    /// 按文件名或地址搜索
    pub q: Option<String>,
}

/// 修改优先级请求
#[derive(Debug, Deserialize)]
pub struct SetPriorityRequest {
    pub priority: TaskPriority,
}

/// 清除历史查询参数
#[derive(Debug, Default, Deserialize)]
pub struct ClearHistoryQuery {
    #[serde(default)]
    pub keep_completed: bool,
}

/// 清除历史响应
#[derive(Debug, Serialize)]
pub struct ClearHistoryResponse {
    pub removed: usize,
}

fn view_of(app_state: &AppState, id: &str) -> ApiResult<DownloadView> {
    app_state
        .download_manager
        .get_download(id)
        .map(DownloadView::from)
        .ok_or_else(|| DownloadError::NotFound(id.to_string()).into())
}

fn views(tasks: Vec<DownloadTask>) -> Vec<DownloadView> {
    tasks.into_iter().map(DownloadView::from).collect()
}

/// POST /api/v1/downloads
/// 创建下载任务
pub async fn create_download(
    State(app_state): State<AppState>,
    Json(req): Json<CreateDownloadRequest>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    let manager = &app_state.download_manager;

    let task = manager
        .add_download(&req.url, req.file_name.as_deref(), req.priority)
        .await?;
    info!("创建下载任务成功: {} ({})", task.id, task.file_name);

    let auto_start = req.start.unwrap_or(app_state.config.download.auto_start);
    if auto_start {
        match manager.start_download(&task.id).await {
            Ok(()) => {}
            Err(DownloadError::MaxConcurrentReached { max }) => {
                info!("槽位已满 ({}), 任务保持排队: {}", max, task.id);
            }
            Err(e) => warn!("启动下载任务失败: {}, 错误: {}", task.id, e),
        }
    }

    Ok(Json(ApiResponse::success(view_of(&app_state, &task.id)?)))
}

/// GET /api/v1/downloads
/// 获取下载任务（可按状态、类别、关键字过滤）
pub async fn list_downloads(
    State(app_state): State<AppState>,
    Query(query): Query<ListDownloadsQuery>,
) -> ApiResult<Json<ApiResponse<Vec<DownloadView>>>> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let category = query
        .category
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<FileCategory>)
        .transpose()
        .map_err(|e: String| ApiError::bad_request(e))?;

    let manager = &app_state.download_manager;
    let tasks = match query.q.as_deref() {
        Some(text) => manager.search(text),
        None => manager.get_downloads(),
    };

    let tasks = tasks
        .into_iter()
        .filter(|t| status.map_or(true, |s| t.status == s))
        .filter(|t| category.map_or(true, |c| t.category == c))
        .collect();

    Ok(Json(ApiResponse::success(views(tasks))))
}

/// GET /api/v1/downloads/active
/// 获取正在下载的任务
pub async fn get_active_downloads(
    State(app_state): State<AppState>,
) -> ApiResult<Json<ApiResponse<Vec<DownloadView>>>> {
    let tasks = app_state.download_manager.get_active_downloads();
    Ok(Json(ApiResponse::success(views(tasks))))
}

/// GET /api/v1/downloads/stats
/// 获取下载统计
pub async fn get_download_stats(
    State(app_state): State<AppState>,
) -> ApiResult<Json<ApiResponse<DownloadStats>>> {
    Ok(Json(ApiResponse::success(
        app_state.download_manager.get_stats(),
    )))
}

/// GET /api/v1/downloads/:id
/// 获取单个下载任务
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// POST /api/v1/downloads/:id/start
pub async fn start_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state.download_manager.start_download(&task_id).await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// POST /api/v1/downloads/:id/pause
pub async fn pause_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state.download_manager.pause_download(&task_id).await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// POST /api/v1/downloads/:id/resume
pub async fn resume_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state.download_manager.resume_download(&task_id).await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// POST /api/v1/downloads/:id/cancel
pub async fn cancel_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state.download_manager.cancel_download(&task_id).await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// POST /api/v1/downloads/:id/retry
pub async fn retry_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state.download_manager.retry_download(&task_id).await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// PUT /api/v1/downloads/:id/priority
pub async fn set_download_priority(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<SetPriorityRequest>,
) -> ApiResult<Json<ApiResponse<DownloadView>>> {
    app_state
        .download_manager
        .set_priority(&task_id, req.priority)
        .await?;
    Ok(Json(ApiResponse::success(view_of(&app_state, &task_id)?)))
}

/// DELETE /api/v1/downloads/:id
/// 删除下载任务（同时删除已下载的文件）
pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<ApiResponse<String>>> {
    app_state.download_manager.remove_download(&task_id).await?;
    Ok(Json(ApiResponse::success("任务已删除".to_string())))
}

/// DELETE /api/v1/downloads/history
/// 清除已结束的任务记录
pub async fn clear_history(
    State(app_state): State<AppState>,
    Query(query): Query<ClearHistoryQuery>,
) -> ApiResult<Json<ApiResponse<ClearHistoryResponse>>> {
    let removed = app_state
        .download_manager
        .clear_history(query.keep_completed)
        .await;
    Ok(Json(ApiResponse::success(ClearHistoryResponse { removed })))
}
