//! 下载事件类型定义

use crate::downloader::{DownloadTask, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// 事件广播通道容量
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 下载任务事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务创建
    Created { task: DownloadTask },
    /// 进度更新
    Progress {
        task_id: String,
        bytes_downloaded: u64,
        total_bytes: i64,
        speed_bytes_per_second: u64,
        progress: f64,
    },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// 任务完成
    Completed {
        task_id: String,
        local_path: String,
        completed_at: DateTime<Utc>,
    },
    /// 任务失败
    Failed { task_id: String, error: String },
    /// 任务删除
    Removed { task_id: String },
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { task } => &task.id,
            DownloadEvent::Progress { task_id, .. }
            | DownloadEvent::StatusChanged { task_id, .. }
            | DownloadEvent::Completed { task_id, .. }
            | DownloadEvent::Failed { task_id, .. }
            | DownloadEvent::Removed { task_id } => task_id,
        }
    }

    pub fn progress_of(task: &DownloadTask) -> Self {
        DownloadEvent::Progress {
            task_id: task.id.clone(),
            bytes_downloaded: task.bytes_downloaded,
            total_bytes: task.total_bytes,
            speed_bytes_per_second: task.speed_bytes_per_second,
            progress: task.progress(),
        }
    }
}

/// 事件发布器
///
/// 没有订阅者时事件直接丢弃
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DownloadEvent>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventPublisher {
    pub fn publish(&self, event: DownloadEvent) {
        if self.tx.send(event).is_err() {
            trace!("没有事件订阅者，事件已丢弃");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::TaskPriority;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = DownloadEvent::StatusChanged {
            task_id: "t1".to_string(),
            old_status: TaskStatus::Downloading,
            new_status: TaskStatus::Paused,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "status_changed");
        assert_eq!(json["new_status"], "paused");
        assert_eq!(event.task_id(), "t1");
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let publisher = EventPublisher::default();
        // 无订阅者时不报错
        publisher.publish(DownloadEvent::Removed {
            task_id: "gone".to_string(),
        });

        let mut rx = publisher.subscribe();
        let task = DownloadTask::new(
            "https://x.test/a.mp3".to_string(),
            "a.mp3".to_string(),
            TaskPriority::Low,
        );
        publisher.publish(DownloadEvent::progress_of(&task));

        match rx.recv().await.unwrap() {
            DownloadEvent::Progress { task_id, progress, .. } => {
                assert_eq!(task_id, task.id);
                assert_eq!(progress, 0.0);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
