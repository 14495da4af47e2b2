//! 下载历史持久化
//!
//! 全部任务保存在一个 JSON 文件中，每次变更整体重写（临时文件 + 重命名）

pub mod history;

pub use history::{HistoryStore, HISTORY_FILE_NAME};
