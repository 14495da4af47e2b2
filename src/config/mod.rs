// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（按天滚动，保留最近 N 个文件）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 下载完成的文件存放目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 应用数据目录（下载历史、临时文件）
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 最大同时下载数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 进度采样间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 单个请求整体超时（秒），0 表示不限制
    #[serde(default)]
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 请求 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 通过 API 创建的任务是否立即开始（无空闲槽位时保持排队）
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// 启动时是否自动开始排队中的任务
    #[serde(default)]
    pub resume_on_launch: bool,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("assistant-download-manager/{}", env!("CARGO_PKG_VERSION"))
}

fn default_auto_start() -> bool {
    true
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            data_dir: default_data_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            progress_interval_ms: default_progress_interval_ms(),
            request_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            auto_start: default_auto_start(),
            resume_on_launch: false,
        }
    }
}

impl DownloadConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("max_concurrent_tasks 必须大于 0");
        }
        if self.progress_interval_ms < 10 {
            anyhow::bail!(
                "progress_interval_ms 过小: {} (至少 10ms)",
                self.progress_interval_ms
            );
        }
        if self.download_dir.as_os_str().is_empty() {
            anyhow::bail!("download_dir 不能为空");
        }
        Ok(())
    }

    /// 临时文件目录
    pub fn partial_dir(&self) -> PathBuf {
        self.data_dir.join("partial")
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 只有文件不存在时才写入默认配置，避免覆盖用户写错的配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 18890);
        assert_eq!(config.download.max_concurrent_tasks, 5);
        assert_eq!(config.download.progress_interval_ms, 500);
        assert!(config.download.auto_start);
        assert!(!config.download.resume_on_launch);
        assert!(config.download.validate().is_ok());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config/app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.max_concurrent_tasks = 3;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.download.max_concurrent_tasks, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_concurrent_tasks = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.download.max_concurrent_tasks, 2);
        assert_eq!(config.download.progress_interval_ms, 500);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DownloadConfig::default();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());

        let mut config = DownloadConfig::default();
        config.progress_interval_ms = 1;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.download.max_concurrent_tasks, 5);
        assert!(std::path::Path::new(path).exists());
    }
}
