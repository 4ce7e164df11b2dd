//! 持久化记录类型

use crate::downloader::chunk::{Chunk, ChunkState};
use crate::downloader::task::{DownloadTask, TaskStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 任务记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub url: String,
    pub save_path: String,
    pub filename: String,
    pub file_size: u64,
    pub downloaded_bytes: u64,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub resumable: bool,
    /// None 表示自动分片
    pub num_chunks: Option<usize>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl From<&DownloadTask> for TaskRecord {
    fn from(task: &DownloadTask) -> Self {
        Self {
            id: task.id.clone(),
            url: task.url.clone(),
            save_path: task.save_path.to_string_lossy().into_owned(),
            filename: task.filename.clone(),
            file_size: task.file_size,
            downloaded_bytes: task.downloaded_bytes,
            status: task.status,
            error: task.error.clone(),
            resumable: task.resumable,
            num_chunks: task.num_chunks,
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

impl TaskRecord {
    /// 还原为任务（不含运行时状态）
    pub fn into_task(self) -> DownloadTask {
        let mut task = DownloadTask::new(self.url, PathBuf::from(self.save_path), self.filename);
        task.id = self.id;
        task.file_size = self.file_size;
        task.downloaded_bytes = self.downloaded_bytes;
        task.status = self.status;
        task.error = self.error;
        task.resumable = self.resumable;
        task.num_chunks = self.num_chunks;
        task.created_at = self.created_at;
        task.completed_at = self.completed_at;
        task
    }
}

/// 分片记录
///
/// `range_end` 为开区间端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub task_id: String,
    pub chunk_index: usize,
    pub range_start: u64,
    pub range_end: u64,
    pub downloaded: u64,
    pub state: ChunkState,
    pub temp_file: String,
}

impl ChunkRecord {
    pub fn from_chunk(task_id: &str, chunk: &Chunk) -> Self {
        Self {
            task_id: task_id.to_string(),
            chunk_index: chunk.index,
            range_start: chunk.range.start,
            range_end: chunk.range.end,
            downloaded: chunk.downloaded,
            state: chunk.state,
            temp_file: chunk.temp_file.to_string_lossy().into_owned(),
        }
    }

    pub fn into_chunk(self) -> Chunk {
        Chunk {
            index: self.chunk_index,
            range: self.range_start..self.range_end,
            downloaded: self.downloaded,
            state: self.state,
            temp_file: PathBuf::from(self.temp_file),
            error: None,
        }
    }
}
