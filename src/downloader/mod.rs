pub mod category;
pub mod error;
pub mod manager;
mod monitor;
pub mod progress;
pub mod task;
pub mod transfer;

pub use category::{categorize, FileCategory};
pub use error::{DownloadError, DownloadResult};
pub use manager::{derive_file_name, sanitize_file_name, DownloadManager, DownloadStats};
pub use progress::SpeedCalculator;
pub use task::{
    format_bytes, format_duration, DownloadTask, DownloadView, TaskPriority, TaskStatus,
    UNKNOWN_TOTAL,
};
pub use transfer::{
    HttpTransfer, TransferBackend, TransferError, TransferOutcome, TransferProbe,
    TransferRequest, TransferSnapshot,
};
