//! 文件分类
//!
//! 根据文件扩展名把下载项归入语义类别，纯函数，无副作用

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// 文件类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Document,
    Image,
    Video,
    Audio,
    Archive,
    Application,
    Code,
    Other,
}

const DOCUMENT_EXTS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "txt", "md",
    "csv", "epub", "pages", "numbers", "key",
];
const IMAGE_EXTS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "heic", "heif", "tiff", "tif", "ico",
    "raw",
];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "flv", "wmv", "m4v", "mpeg", "mpg"];
const AUDIO_EXTS: &[&str] = &["mp3", "wav", "aac", "flac", "ogg", "m4a", "wma", "aiff", "opus"];
const ARCHIVE_EXTS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz", "tgz", "zst"];
const APPLICATION_EXTS: &[&str] = &["dmg", "pkg", "app", "exe", "msi", "deb", "rpm", "apk", "ipa", "appimage"];
const CODE_EXTS: &[&str] = &[
    "swift", "py", "js", "ts", "jsx", "tsx", "rs", "go", "java", "kt", "c", "cpp", "h", "hpp",
    "cs", "rb", "php", "html", "css", "json", "xml", "yaml", "yml", "toml", "sh", "sql",
];

impl FileCategory {
    /// 全部类别（固定顺序，用于统计输出）
    pub const ALL: [FileCategory; 8] = [
        FileCategory::Document,
        FileCategory::Image,
        FileCategory::Video,
        FileCategory::Audio,
        FileCategory::Archive,
        FileCategory::Application,
        FileCategory::Code,
        FileCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Document => "document",
            FileCategory::Image => "image",
            FileCategory::Video => "video",
            FileCategory::Audio => "audio",
            FileCategory::Archive => "archive",
            FileCategory::Application => "application",
            FileCategory::Code => "code",
            FileCategory::Other => "other",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("未知的文件类别: {}", s))
    }
}

/// 根据文件名判断类别
///
/// 扩展名不区分大小写；没有扩展名或无法识别时归为 `Other`
pub fn categorize(file_name: &str) -> FileCategory {
    let ext = match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return FileCategory::Other,
    };

    let table: [(&[&str], FileCategory); 7] = [
        (DOCUMENT_EXTS, FileCategory::Document),
        (IMAGE_EXTS, FileCategory::Image),
        (VIDEO_EXTS, FileCategory::Video),
        (AUDIO_EXTS, FileCategory::Audio),
        (ARCHIVE_EXTS, FileCategory::Archive),
        (APPLICATION_EXTS, FileCategory::Application),
        (CODE_EXTS, FileCategory::Code),
    ];

    table
        .iter()
        .find(|(exts, _)| exts.contains(&ext.as_str()))
        .map(|(_, category)| *category)
        .unwrap_or(FileCategory::Other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_known_extensions() {
        assert_eq!(categorize("report.pdf"), FileCategory::Document);
        assert_eq!(categorize("photo.JPG"), FileCategory::Image);
        assert_eq!(categorize("movie.mkv"), FileCategory::Video);
        assert_eq!(categorize("song.flac"), FileCategory::Audio);
        assert_eq!(categorize("backup.tar.gz"), FileCategory::Archive);
        assert_eq!(categorize("Installer.dmg"), FileCategory::Application);
        assert_eq!(categorize("main.rs"), FileCategory::Code);
    }

    #[test]
    fn test_categorize_unknown_or_missing_extension() {
        assert_eq!(categorize("README"), FileCategory::Other);
        assert_eq!(categorize("data.xyz"), FileCategory::Other);
        assert_eq!(categorize(""), FileCategory::Other);
        assert_eq!(categorize(".hidden"), FileCategory::Other);
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("Video".parse::<FileCategory>().unwrap(), FileCategory::Video);
        assert!("nope".parse::<FileCategory>().is_err());
    }
}
