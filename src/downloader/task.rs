use crate::downloader::chunk_set::{ChunkSet, ChunkSetState};
use crate::downloader::metadata::RemoteFileInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 排队中
    Queued,
    /// 获取文件信息中
    FetchingInfo,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 合并分片中
    Merging,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::FetchingInfo => "fetching_info",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Merging => "merging",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 是否占用一个活跃名额
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::FetchingInfo | TaskStatus::Downloading | TaskStatus::Merging
        )
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Queued, FetchingInfo)
                | (Queued, Downloading)
                | (FetchingInfo, Downloading)
                | (FetchingInfo, Failed)
                | (Downloading, Paused)
                | (Downloading, Merging)
                | (Downloading, Failed)
                | (Paused, Downloading)
                | (Merging, Completed)
                | (Merging, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => TaskStatus::Queued,
            "fetching_info" => TaskStatus::FetchingInfo,
            "downloading" => TaskStatus::Downloading,
            "paused" => TaskStatus::Paused,
            "merging" => TaskStatus::Merging,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            other => anyhow::bail!("未知的任务状态: {}", other),
        })
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 下载地址（探测后替换为重定向后的最终地址）
    pub url: String,
    /// 本地保存路径
    ///
    /// `filename` 为空时这里是目标目录，文件名在探测阶段确定
    pub save_path: PathBuf,
    /// 显示文件名
    pub filename: String,
    /// 文件大小，0 表示尚未获取或服务器未告知
    pub file_size: u64,
    /// 已下载大小
    pub downloaded_bytes: u64,
    /// 任务状态
    pub status: TaskStatus,
    /// 下载速度 (bytes/s)
    pub speed: u64,
    /// 剩余时间 (秒)，0 表示未知
    pub eta_secs: u64,
    /// 错误信息
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 服务器是否支持 Range
    pub resumable: bool,
    /// 分片数，None 表示按文件大小自动决定
    pub num_chunks: Option<usize>,

    /// 分片集合，首次启动时创建，暂停/恢复期间复用
    #[serde(skip)]
    pub chunk_set: Option<Arc<ChunkSet>>,

    /// 从持久化恢复的分片状态，首次启动时用于重建分片集合
    #[serde(skip)]
    pub restored_chunks: Option<ChunkSetState>,

    /// 运行代数，每次进入 DOWNLOADING 加一；测速据此在恢复后重建基线
    #[serde(skip)]
    pub run_epoch: u64,
}

impl DownloadTask {
    pub fn new(url: String, save_path: PathBuf, filename: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            save_path,
            filename,
            file_size: 0,
            downloaded_bytes: 0,
            status: TaskStatus::Queued,
            speed: 0,
            eta_secs: 0,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            resumable: false,
            num_chunks: None,
            chunk_set: None,
            restored_chunks: None,
            run_epoch: 0,
        }
    }

    pub fn with_chunks(mut self, num_chunks: Option<usize>) -> Self {
        self.num_chunks = num_chunks;
        self
    }

    /// 状态迁移，非法迁移返回错误且不修改状态
    pub fn transition(&mut self, next: TaskStatus) -> anyhow::Result<TaskStatus> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "任务 {} 不允许从 {} 迁移到 {}",
                self.id,
                self.status,
                next
            );
        }
        let old = self.status;
        self.status = next;

        match next {
            TaskStatus::Completed => {
                self.completed_at = Some(chrono::Utc::now().timestamp());
                self.downloaded_bytes = self.file_size;
                self.speed = 0;
                self.eta_secs = 0;
                self.error = None;
            }
            TaskStatus::Paused
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::Merging => {
                self.speed = 0;
                self.eta_secs = 0;
            }
            _ => {}
        }

        Ok(old)
    }

    /// 应用探测到的远程文件信息
    pub fn apply_remote_info(&mut self, info: &RemoteFileInfo) {
        self.url = info.url.clone();
        self.file_size = info.file_size;
        self.resumable = info.resumable;
        if self.filename.is_empty() {
            self.filename = info.filename.clone();
            self.save_path =
                crate::downloader::metadata::unique_path(&self.save_path.join(&info.filename));
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return if self.status == TaskStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.downloaded_bytes as f64 / self.file_size as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.eta_secs == 0 {
            None
        } else {
            Some(self.eta_secs)
        }
    }

    /// 不带运行时句柄的副本，用于事件和持久化
    pub fn snapshot(&self) -> DownloadTask {
        DownloadTask {
            chunk_set: None,
            restored_chunks: None,
            ..self.clone()
        }
    }
}
