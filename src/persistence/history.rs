//! 下载历史文件
//!
//! 所有下载任务整体序列化为一个 JSON 文件，启动时加载一次，
//! 之后每次变更都整体重写。
//!
//! ## 文件格式
//!
//! ```json
//! {
//!   "version": 1,
//!   "items": [ { "id": "xxx", "url": "https://...", ... } ]
//! }
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::downloader::DownloadTask;

/// 历史文件名
pub const HISTORY_FILE_NAME: &str = "downloads.json";

/// 当前文件格式版本
const HISTORY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    items: Vec<DownloadTask>,
}

#[derive(Serialize)]
struct HistoryFileRef<'a> {
    version: u32,
    items: &'a [DownloadTask],
}

/// 下载历史存储
///
/// 克隆共享同一把写锁，同一时刻只有一个保存在写临时文件
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    /// 在数据目录下创建存储（不会立即创建文件）
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(HISTORY_FILE_NAME),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载历史记录
    ///
    /// 文件不存在时返回空列表；文件损坏时记录警告，把损坏文件改名保留后返回空列表
    pub fn load(&self) -> io::Result<Vec<DownloadTask>> {
        if !self.path.exists() {
            debug!("历史文件不存在，从空列表开始: {:?}", self.path);
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        match serde_json::from_reader::<_, HistoryFile>(BufReader::new(file)) {
            Ok(history) => {
                if history.version != HISTORY_VERSION {
                    warn!(
                        "历史文件版本不匹配: {} (当前 {}), 尝试按当前格式读取",
                        history.version, HISTORY_VERSION
                    );
                }
                debug!("已加载 {} 条下载记录: {:?}", history.items.len(), self.path);
                Ok(history.items)
            }
            Err(e) => {
                let backup = self.path.with_extension("json.corrupt");
                warn!(
                    "历史文件解析失败: {:?}, 错误: {}, 已另存为 {:?}",
                    self.path, e, backup
                );
                fs::rename(&self.path, &backup)?;
                Ok(Vec::new())
            }
        }
    }

    /// 保存全部任务
    ///
    /// 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
    pub fn save(&self, items: &[DownloadTask]) -> io::Result<()> {
        let _write = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("json.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        let history = HistoryFileRef {
            version: HISTORY_VERSION,
            items,
        };
        serde_json::to_writer_pretty(&mut writer, &history).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize download history: {}", e),
            )
        })?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)?;

        debug!("已保存 {} 条下载记录: {:?}", items.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{TaskPriority, TaskStatus};
    use tempfile::TempDir;

    fn sample_task(url: &str, name: &str) -> DownloadTask {
        DownloadTask::new(url.to_string(), name.to_string(), TaskPriority::High)
    }

    #[test]
    fn test_load_missing_file_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = HistoryStore::new(temp_dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = HistoryStore::new(&temp_dir.path().join("nested"));

        let mut done = sample_task("https://x.test/a.zip", "a.zip");
        done.bytes_downloaded = 42;
        done.mark_completed(PathBuf::from("/downloads/a.zip"));
        let items = vec![done, sample_task("https://x.test/b.pdf", "b.pdf")];

        store.save(&items).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, items);
        assert_eq!(loaded[0].status, TaskStatus::Completed);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = HistoryStore::new(temp_dir.path());

        store
            .save(&[sample_task("https://x.test/1", "1"), sample_task("https://x.test/2", "2")])
            .unwrap();
        store.save(&[sample_task("https://x.test/3", "3")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].url, "https://x.test/3");
    }

    #[test]
    fn test_concurrent_saves_from_clones_leave_valid_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = HistoryStore::new(temp_dir.path());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let items: Vec<_> = (0..=i)
                        .map(|j| sample_task(&format!("https://x.test/{}", j), "f"))
                        .collect();
                    store.save(&items).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded = store.load().unwrap();
        assert!((1..=8).contains(&loaded.len()));
        assert!(!store.path().with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let store = HistoryStore::new(temp_dir.path());
        fs::write(store.path(), b"{ not json").unwrap();

        assert!(store.load().unwrap().is_empty());
        assert!(!store.path().exists());
        assert!(store.path().with_extension("json.corrupt").exists());
    }
}
