// Chunked Downloader
// 分片并行 HTTP 下载库

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 日志模块
pub mod logging;

// 任务持久化模块
pub mod persistence;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig};
pub use downloader::{DownloadEngine, DownloadEvent, DownloadTask, QueueScheduler, TaskStatus};
pub use persistence::{MemoryTaskStore, SqliteTaskStore, TaskStore};
