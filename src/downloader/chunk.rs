// 分片数据结构

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// 分片传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// 等待下载
    Pending,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败（临时文件保留，可从 downloaded 处续传）
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Downloading => "downloading",
            ChunkState::Paused => "paused",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkState::Pending),
            "downloading" => Ok(ChunkState::Downloading),
            "paused" => Ok(ChunkState::Paused),
            "completed" => Ok(ChunkState::Completed),
            "failed" => Ok(ChunkState::Failed),
            other => anyhow::bail!("未知的分片状态: {}", other),
        }
    }
}

/// 分片传输错误
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("HTTP 状态码异常: {0}")]
    BadStatus(u16),

    #[error("{0}超时")]
    Timeout(&'static str),

    #[error("网络错误: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("临时文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("服务器忽略了 Range 请求，无法从断点续传")]
    RangeIgnored,

    #[error("响应提前结束: 期望 {expected} 字节, 实际 {received} 字节")]
    Incomplete { expected: u64, received: u64 },
}

/// 分片进度，由分片传输循环发往任务引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: usize,
    /// 该分片累计已下载字节
    pub downloaded: u64,
    /// 该分片总字节（大小未知时为 0）
    pub total: u64,
}

/// 文件分片
///
/// `range` 为半开区间 `[start, end)`。`0..0` 表示大小未知的整文件分片，
/// 传输时不带 Range 头，下载量不受区间长度约束
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 分片索引
    pub index: usize,
    /// 字节范围
    pub range: Range<u64>,
    /// 已下载字节数
    pub downloaded: u64,
    /// 传输状态
    pub state: ChunkState,
    /// 临时文件路径
    pub temp_file: PathBuf,
    /// 最近一次错误
    pub error: Option<String>,
}

impl Chunk {
    pub fn new(index: usize, range: Range<u64>, temp_dir: &Path) -> Self {
        Self {
            index,
            range,
            downloaded: 0,
            state: ChunkState::Pending,
            temp_file: temp_dir.join(format!("chunk_{:04}.part", index)),
            error: None,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// 大小未知的整文件分片
    pub fn is_open_ended(&self) -> bool {
        self.range.is_empty()
    }

    pub fn remaining(&self) -> u64 {
        self.size().saturating_sub(self.downloaded)
    }

    /// 续传起点
    pub fn resume_offset(&self) -> u64 {
        self.range.start + self.downloaded
    }

    /// 续传请求的 Range 头，`None` 表示请求整个资源
    pub fn range_header(&self) -> Option<String> {
        if self.is_open_ended() {
            None
        } else {
            Some(format!(
                "bytes={}-{}",
                self.resume_offset(),
                self.range.end - 1
            ))
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Completed
    }

    /// 记录一次写入，返回新的累计下载量
    pub fn record_written(&mut self, bytes: u64) -> u64 {
        self.downloaded += bytes;
        if !self.is_open_ended() {
            self.downloaded = self.downloaded.min(self.size());
        }
        self.downloaded
    }

    pub fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            chunk_index: self.index,
            downloaded: self.downloaded,
            total: self.size(),
        }
    }

    pub fn mark_completed(&mut self) {
        self.state = ChunkState::Completed;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = ChunkState::Failed;
        self.error = Some(error);
    }

    /// 重置为未下载，用于续传失效或临时文件丢失的分片
    pub fn reset(&mut self) {
        self.downloaded = 0;
        self.state = ChunkState::Pending;
        self.error = None;
    }
}
