// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
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
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
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

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
///
/// 分片策略、并发限制、超时与重试参数都在这里
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 临时分片文件根目录（每个任务在其下创建 {task_id} 子目录）
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// 最小分片大小（字节），文件不会被切得比这更小
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 单文件最大分片数（硬上限）
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    /// 默认分片数
    #[serde(default = "default_chunks")]
    pub default_chunks: usize,
    /// 最大同时下载任务数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 分片请求超时（秒），同时作为读空闲超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 每个分片的最大尝试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试退避基数（毫秒），第 n 次失败后等待 n * base
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 单次写入缓冲大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 等待队列轮询间隔（毫秒）
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    /// 元数据探测超时（秒）
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// 小文件阈值：低于此大小最多 4 个分片
    #[serde(default = "default_small_file_threshold")]
    pub small_file_threshold: u64,
    /// 中等文件阈值：低于此大小最多 8 个分片
    #[serde(default = "default_medium_file_threshold")]
    pub medium_file_threshold: u64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("downloads/.chunks")
}
fn default_min_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}
fn default_max_chunks() -> usize {
    16
}
fn default_chunks() -> usize {
    8
}
fn default_max_concurrent_tasks() -> usize {
    3
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_buffer_size() -> usize {
    64 * 1024 // 64KB
}
fn default_scheduler_interval_ms() -> u64 {
    500
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_small_file_threshold() -> u64 {
    10 * 1024 * 1024 // 10MB
}
fn default_medium_file_threshold() -> u64 {
    100 * 1024 * 1024 // 100MB
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            min_chunk_size: default_min_chunk_size(),
            max_chunks: default_max_chunks(),
            default_chunks: default_chunks(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            buffer_size: default_buffer_size(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            small_file_threshold: default_small_file_threshold(),
            medium_file_threshold: default_medium_file_threshold(),
        }
    }
}

impl DownloadConfig {
    /// 校验配置（拒绝会导致除零或永不调度的取值）
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 {
            anyhow::bail!("min_chunk_size 必须大于 0");
        }
        if self.max_chunks == 0 {
            anyhow::bail!("max_chunks 必须大于 0");
        }
        if self.default_chunks == 0 {
            anyhow::bail!("default_chunks 必须大于 0");
        }
        if self.max_concurrent_tasks == 0 {
            anyhow::bail!("max_concurrent_tasks 必须大于 0");
        }
        if self.max_retries == 0 {
            anyhow::bail!("max_retries 必须大于 0");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size 必须大于 0");
        }
        if self.scheduler_interval_ms == 0 {
            anyhow::bail!("scheduler_interval_ms 必须大于 0");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 是否启用任务持久化
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    /// SQLite 数据库路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// 进度驱动的记录写入最小间隔（毫秒），状态变更总是立即写入
    #[serde(default = "default_progress_persist_interval_ms")]
    pub progress_persist_interval_ms: u64,
}

fn default_persistence_enabled() -> bool {
    true
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/downloads.db")
}
fn default_progress_persist_interval_ms() -> u64 {
    2000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            db_path: default_db_path(),
            progress_persist_interval_ms: default_progress_persist_interval_ms(),
        }
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
            .context("配置文件中的下载参数无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
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
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                // 尝试保存默认配置（只在文件不存在时写入，避免覆盖用户的错误配置）
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
