use super::category::{categorize, FileCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// 总大小未知时的占位值
pub const UNKNOWN_TOTAL: i64 = -1;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中
    Queued,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 终态：不会再发生自动状态迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "downloading" => Ok(TaskStatus::Downloading),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("未知的任务状态: {}", other)),
        }
    }
}

/// 任务优先级（仅用于挑选下一个排队任务，不会抢占运行中的任务）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            other => Err(format!("未知的优先级: {}", other)),
        }
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 源地址
    pub url: String,
    /// 文件名（保存到下载目录时使用）
    pub file_name: String,
    /// 文件类别（创建时根据文件名确定）
    pub category: FileCategory,
    /// 任务状态
    pub status: TaskStatus,
    /// 优先级
    #[serde(default)]
    pub priority: TaskPriority,
    /// 已下载大小
    pub bytes_downloaded: u64,
    /// 文件总大小，未知时为 -1
    pub total_bytes: i64,
    /// 下载速度 (bytes/s)
    pub speed_bytes_per_second: u64,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 完成时间
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// 完成后文件所在路径
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// 错误信息
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DownloadTask {
    pub fn new(url: String, file_name: String, priority: TaskPriority) -> Self {
        let category = categorize(&file_name);
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            file_name,
            category,
            status: TaskStatus::Queued,
            priority,
            bytes_downloaded: 0,
            total_bytes: UNKNOWN_TOTAL,
            speed_bytes_per_second: 0,
            created_at: Utc::now(),
            completed_at: None,
            local_path: None,
            error_message: None,
        }
    }

    /// 下载进度，范围 [0, 1]
    pub fn progress(&self) -> f64 {
        if self.total_bytes <= 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    /// 估算剩余时间 (秒)
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bytes_per_second == 0 || self.total_bytes < 0 {
            return None;
        }
        let remaining = (self.total_bytes as u64).saturating_sub(self.bytes_downloaded);
        Some(remaining / self.speed_bytes_per_second)
    }

    pub fn formatted_size(&self) -> String {
        if self.total_bytes >= 0 {
            format!(
                "{} / {}",
                format_bytes(self.bytes_downloaded),
                format_bytes(self.total_bytes as u64)
            )
        } else {
            format_bytes(self.bytes_downloaded)
        }
    }

    pub fn formatted_speed(&self) -> String {
        if self.status != TaskStatus::Downloading || self.speed_bytes_per_second == 0 {
            return String::new();
        }
        format!("{}/s", format_bytes(self.speed_bytes_per_second))
    }

    pub fn formatted_eta(&self) -> String {
        self.eta_seconds().map(format_duration).unwrap_or_default()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 排队、下载中或暂停（尚未结束）
    pub fn is_unfinished(&self) -> bool {
        !self.status.is_terminal()
    }

    /// 重置计数器，准备从 0 开始重新传输
    pub fn reset_progress(&mut self) {
        self.bytes_downloaded = 0;
        self.speed_bytes_per_second = 0;
        self.error_message = None;
        self.completed_at = None;
    }

    /// 标记为下载中
    ///
    /// 每次都从 0 字节重新下载，总大小以本次响应为准
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.reset_progress();
        self.total_bytes = UNKNOWN_TOTAL;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, local_path: PathBuf) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.local_path = Some(local_path);
        self.speed_bytes_per_second = 0;
        if self.total_bytes < 0 {
            self.total_bytes = self.bytes_downloaded as i64;
        } else {
            self.bytes_downloaded = self.total_bytes as u64;
        }
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(error);
        self.speed_bytes_per_second = 0;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.speed_bytes_per_second = 0;
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.speed_bytes_per_second = 0;
    }

    /// 标记为排队（重试或启动恢复时使用）
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.reset_progress();
    }
}

/// 带展示字段的任务视图（API 返回使用）
#[derive(Debug, Clone, Serialize)]
pub struct DownloadView {
    #[serde(flatten)]
    pub task: DownloadTask,
    pub progress: f64,
    pub formatted_size: String,
    pub formatted_speed: String,
    pub formatted_eta: String,
}

impl From<DownloadTask> for DownloadView {
    fn from(task: DownloadTask) -> Self {
        Self {
            progress: task.progress(),
            formatted_size: task.formatted_size(),
            formatted_speed: task.formatted_speed(),
            formatted_eta: task.formatted_eta(),
            task,
        }
    }
}

/// 格式化字节数
///
/// 按 1024 进位，B 显示整数，其余单位保留一位小数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// 格式化剩余时间
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
