//! 启动恢复
//!
//! 把存储中的记录还原为任务：
//! - DOWNLOADING / MERGING 中断的任务恢复为 PAUSED，等待显式恢复
//! - FETCHING_INFO 恢复为 QUEUED，重新探测
//! - DOWNLOADING / PAUSED / MERGING 任务附带分片状态，续传时不重复下载

use crate::downloader::chunk::{Chunk, ChunkState};
use crate::downloader::chunk_set::ChunkSetState;
use crate::downloader::task::{DownloadTask, TaskStatus};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::types::{ChunkRecord, TaskRecord};
use super::TaskStore;

/// 恢复出的任务
#[derive(Debug)]
pub struct RecoveredTask {
    pub task: DownloadTask,
    pub chunks: Option<ChunkSetState>,
}

/// 从存储加载并还原所有任务，保持创建顺序
pub fn recover_tasks(store: &dyn TaskStore) -> Result<Vec<RecoveredTask>> {
    let records = store.load_tasks().context("加载任务记录失败")?;
    let mut recovered = Vec::with_capacity(records.len());

    for record in records {
        let chunks = if carries_chunks(record.status) {
            match store.load_chunks(&record.id) {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("加载任务 {} 的分片状态失败，将重新下载: {:#}", record.id, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        recovered.push(recover_task(record, chunks));
    }

    let unfinished = recovered
        .iter()
        .filter(|r| !r.task.status.is_terminal())
        .count();
    info!(
        "从存储恢复 {} 个任务（未完成 {} 个）",
        recovered.len(),
        unfinished
    );
    Ok(recovered)
}

fn carries_chunks(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Downloading | TaskStatus::Paused | TaskStatus::Merging
    )
}

/// 还原单个任务
pub fn recover_task(record: TaskRecord, chunk_records: Vec<ChunkRecord>) -> RecoveredTask {
    let persisted = record.status;
    let mut task = record.into_task();

    task.status = match persisted {
        TaskStatus::Downloading | TaskStatus::Merging => TaskStatus::Paused,
        TaskStatus::FetchingInfo => TaskStatus::Queued,
        other => other,
    };
    task.speed = 0;
    task.eta_secs = 0;

    let chunks = if carries_chunks(persisted) && !chunk_records.is_empty() {
        let chunks: Vec<Chunk> = chunk_records
            .into_iter()
            .map(|record| restore_chunk(record.into_chunk()))
            .collect();
        task.downloaded_bytes = chunks.iter().map(|c| c.downloaded).sum();
        Some(ChunkSetState {
            url: task.url.clone(),
            file_size: task.file_size,
            chunk_count: chunks.len(),
            chunks,
        })
    } else {
        None
    };

    if persisted != task.status {
        debug!("任务 {} 恢复: {} -> {}", task.id, persisted, task.status);
    }
    RecoveredTask { task, chunks }
}

/// 中断的分片改为等待；已完成但临时文件丢失或变短的分片按实际长度重置
fn restore_chunk(mut chunk: Chunk) -> Chunk {
    match chunk.state {
        ChunkState::Downloading | ChunkState::Paused => chunk.state = ChunkState::Pending,
        ChunkState::Completed => {
            let on_disk = std::fs::metadata(&chunk.temp_file).map(|m| m.len()).ok();
            match on_disk {
                None => {
                    warn!(
                        "分片 #{} 临时文件丢失，重新下载: {:?}",
                        chunk.index, chunk.temp_file
                    );
                    chunk.reset();
                }
                Some(len) if len < chunk.downloaded => {
                    warn!(
                        "分片 #{} 临时文件不完整: 记录 {}, 实际 {}",
                        chunk.index, chunk.downloaded, len
                    );
                    chunk.downloaded = len;
                    chunk.state = ChunkState::Pending;
                }
                // 更长的文件在下次传输前截断
                Some(len) if len > chunk.downloaded => chunk.state = ChunkState::Pending,
                Some(_) => {}
            }
        }
        ChunkState::Pending | ChunkState::Failed => {}
    }
    chunk
}
