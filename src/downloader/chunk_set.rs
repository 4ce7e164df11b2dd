// 分片集合：规划、并发传输、重试、合并

use crate::config::DownloadConfig;
use crate::downloader::chunk::{Chunk, ChunkError, ChunkProgress, ChunkState};
use anyhow::{Context, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 小文件分片上限
const SMALL_FILE_CHUNKS: usize = 4;
/// 中等文件分片上限
const MEDIUM_FILE_CHUNKS: usize = 8;

/// 可序列化的分片集合状态，用于进程重启后重建
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSetState {
    pub url: String,
    pub file_size: u64,
    pub chunk_count: usize,
    pub chunks: Vec<Chunk>,
}

/// 一轮全量传输的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed(String),
}

/// 单次流式写入的结束方式
enum StreamEnd {
    Finished,
    Paused,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct TransferParams {
    max_retries: u32,
    retry_backoff: Duration,
    request_timeout: Duration,
    buffer_size: usize,
}

impl TransferParams {
    fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
            request_timeout: config.request_timeout(),
            buffer_size: config.buffer_size.max(1),
        }
    }
}

/// 按文件大小自动选择分片数
pub fn auto_chunk_count(file_size: u64, config: &DownloadConfig) -> usize {
    if file_size < config.small_file_threshold {
        SMALL_FILE_CHUNKS
    } else if file_size < config.medium_file_threshold {
        MEDIUM_FILE_CHUNKS
    } else {
        config.default_chunks
    }
}

/// 实际分片数 = min(请求值或自动值, 文件大小/最小分片, 硬上限)，至少为 1
pub fn effective_chunk_count(
    file_size: u64,
    requested: Option<usize>,
    config: &DownloadConfig,
) -> usize {
    if file_size == 0 {
        return 1;
    }
    let by_size = usize::try_from(file_size / config.min_chunk_size.max(1))
        .unwrap_or(usize::MAX)
        .max(1);
    requested
        .unwrap_or_else(|| auto_chunk_count(file_size, config))
        .min(by_size)
        .min(config.max_chunks)
        .max(1)
}

/// 计算分片字节范围
///
/// 等分向下取整，最后一片吸收余数；大小为 0 时返回单个 `0..0`
pub fn plan_chunks(
    file_size: u64,
    requested: Option<usize>,
    config: &DownloadConfig,
) -> Vec<Range<u64>> {
    if file_size == 0 {
        return vec![0..0];
    }

    let count = effective_chunk_count(file_size, requested, config) as u64;
    let span = file_size / count;

    (0..count)
        .map(|i| {
            let start = i * span;
            let end = if i == count - 1 {
                file_size
            } else {
                start + span
            };
            start..end
        })
        .collect()
}

/// 等待暂停标志变为 true
async fn wait_for_pause(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// 单个文件的分片集合
///
/// 每个分片只由自己的传输循环修改；暂停用 watch 标志，取消用 CancellationToken，
/// 两者都在每个缓冲写入边界检查
#[derive(Debug)]
pub struct ChunkSet {
    url: String,
    file_size: u64,
    temp_dir: PathBuf,
    chunks: Vec<Mutex<Chunk>>,
    params: TransferParams,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    progress_tx: mpsc::UnboundedSender<ChunkProgress>,
}

impl ChunkSet {
    /// 按文件大小规划分片，创建新的分片集合
    pub fn new(
        url: impl Into<String>,
        file_size: u64,
        requested_chunks: Option<usize>,
        temp_dir: PathBuf,
        config: &DownloadConfig,
        progress_tx: mpsc::UnboundedSender<ChunkProgress>,
    ) -> Self {
        let chunks = plan_chunks(file_size, requested_chunks, config)
            .into_iter()
            .enumerate()
            .map(|(index, range)| Mutex::new(Chunk::new(index, range, &temp_dir)))
            .collect::<Vec<_>>();

        debug!(
            "规划分片: 大小={}, 分片数={}, 临时目录={:?}",
            file_size,
            chunks.len(),
            temp_dir
        );

        Self::from_parts(url.into(), file_size, temp_dir, chunks, config, progress_tx)
    }

    /// 从导出的状态重建分片集合，接上新的进度通道
    ///
    /// 中断时处于下载中/暂停的分片改为等待，已完成的分片保持完成
    pub fn rehydrate(
        state: ChunkSetState,
        temp_dir: PathBuf,
        config: &DownloadConfig,
        progress_tx: mpsc::UnboundedSender<ChunkProgress>,
    ) -> Result<Self> {
        validate_layout(&state).context("分片状态无效")?;

        let chunks = state
            .chunks
            .into_iter()
            .map(|mut chunk| {
                if matches!(chunk.state, ChunkState::Downloading | ChunkState::Paused) {
                    chunk.state = ChunkState::Pending;
                }
                Mutex::new(chunk)
            })
            .collect::<Vec<_>>();

        Ok(Self::from_parts(
            state.url,
            state.file_size,
            temp_dir,
            chunks,
            config,
            progress_tx,
        ))
    }

    fn from_parts(
        url: String,
        file_size: u64,
        temp_dir: PathBuf,
        chunks: Vec<Mutex<Chunk>>,
        config: &DownloadConfig,
        progress_tx: mpsc::UnboundedSender<ChunkProgress>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            url,
            file_size,
            temp_dir,
            chunks,
            params: TransferParams::from_config(config),
            cancel: CancellationToken::new(),
            paused,
            progress_tx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// 各分片当前状态的副本
    pub fn chunks(&self) -> Vec<Chunk> {
        self.chunks.iter().map(|c| c.lock().clone()).collect()
    }

    pub fn total_downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.lock().downloaded).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.lock().is_complete())
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 暂停：传输循环在下一个缓冲边界停下
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// 清除暂停标志，重新发起传输由调用方负责
    pub fn resume(&self) {
        self.paused.send_replace(false);
        for slot in &self.chunks {
            let mut chunk = slot.lock();
            if chunk.state == ChunkState::Paused {
                chunk.state = ChunkState::Pending;
            }
        }
    }

    /// 取消：不可恢复，观察到之后不再写入任何字节
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn export_state(&self) -> ChunkSetState {
        ChunkSetState {
            url: self.url.clone(),
            file_size: self.file_size,
            chunk_count: self.chunks.len(),
            chunks: self.chunks(),
        }
    }

    fn set_state(&self, index: usize, state: ChunkState) {
        if let Some(slot) = self.chunks.get(index) {
            slot.lock().state = state;
        }
    }

    fn report(&self, progress: ChunkProgress) {
        // 引擎已退出时丢弃
        let _ = self.progress_tx.send(progress);
    }

    /// 传输一个分片（可重复调用以续传）
    ///
    /// 暂停和取消都返回 Ok；失败时分片标记为 failed，临时文件保留
    pub async fn transfer_chunk(&self, client: &Client, index: usize) -> Result<(), ChunkError> {
        let Some(slot) = self.chunks.get(index) else {
            return Err(ChunkError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("分片索引越界: {}", index),
            )));
        };

        match self.try_transfer(client, slot).await {
            Ok(()) => Ok(()),
            Err(e) => {
                slot.lock().mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn try_transfer(&self, client: &Client, slot: &Mutex<Chunk>) -> Result<(), ChunkError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.is_paused() {
            slot.lock().state = ChunkState::Paused;
            return Ok(());
        }

        let temp_file = slot.lock().temp_file.clone();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&temp_file)
            .await?;
        let on_disk = file.metadata().await?.len();

        // 磁盘与计数对账：以两者较小值为准，多出的字节截掉
        let (index, size, open_ended, mut downloaded) = {
            let mut chunk = slot.lock();
            if chunk.is_open_ended() {
                chunk.downloaded = 0;
            } else if on_disk < chunk.downloaded {
                debug!(
                    "分片 #{} 临时文件短于记录: 记录={}, 实际={}",
                    chunk.index, chunk.downloaded, on_disk
                );
                chunk.downloaded = on_disk;
            }
            (
                chunk.index,
                chunk.size(),
                chunk.is_open_ended(),
                chunk.downloaded,
            )
        };
        file.set_len(downloaded).await?;
        file.seek(SeekFrom::Start(downloaded)).await?;

        if !open_ended && downloaded == size {
            let progress = {
                let mut chunk = slot.lock();
                chunk.mark_completed();
                chunk.progress()
            };
            self.report(progress);
            return Ok(());
        }

        let (range_header, chunk_start, progress) = {
            let mut chunk = slot.lock();
            chunk.state = ChunkState::Downloading;
            chunk.error = None;
            (chunk.range_header(), chunk.range.start, chunk.progress())
        };
        self.report(progress);

        let mut request = client.get(&self.url);
        if let Some(range) = &range_header {
            request = request.header(RANGE, range.as_str());
        }
        debug!("分片 #{} 开始请求: {:?}", index, range_header);

        let mut pause_rx = self.paused.subscribe();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                slot.lock().state = ChunkState::Pending;
                return Ok(());
            }
            _ = wait_for_pause(&mut pause_rx) => {
                slot.lock().state = ChunkState::Paused;
                return Ok(());
            }
            resp = tokio::time::timeout(self.params.request_timeout, request.send()) => {
                resp.map_err(|_| ChunkError::Timeout("等待响应"))??
            }
        };

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if range_header.is_none() || chunk_start + downloaded == 0 => {}
            // 服务器忽略 Range 返回整个文件：首个分片可以从头来过，其余分片无法使用
            StatusCode::OK if chunk_start == 0 => {
                debug!("分片 #{} 续传被忽略，从头下载", index);
                downloaded = 0;
                file.set_len(0).await?;
                file.seek(SeekFrom::Start(0)).await?;
                let progress = {
                    let mut chunk = slot.lock();
                    chunk.downloaded = 0;
                    chunk.progress()
                };
                self.report(progress);
            }
            StatusCode::OK => return Err(ChunkError::RangeIgnored),
            other => return Err(ChunkError::BadStatus(other.as_u16())),
        }

        let limit = (!open_ended).then_some(size);
        let streamed = self.stream_body(slot, response, &mut file, limit).await;
        let flushed = file.flush().await;
        let end = streamed?;
        flushed?;

        let mut chunk = slot.lock();
        match end {
            StreamEnd::Finished => {
                chunk.mark_completed();
                debug!(
                    "分片 #{} 下载完成: {} bytes (本次 {} 起)",
                    chunk.index, chunk.downloaded, downloaded
                );
            }
            StreamEnd::Paused => chunk.state = ChunkState::Paused,
            StreamEnd::Cancelled => chunk.state = ChunkState::Pending,
        }
        Ok(())
    }

    async fn stream_body(
        &self,
        slot: &Mutex<Chunk>,
        response: Response,
        file: &mut File,
        limit: Option<u64>,
    ) -> Result<StreamEnd, ChunkError> {
        let mut stream = response.bytes_stream();
        let mut pause_rx = self.paused.subscribe();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                _ = wait_for_pause(&mut pause_rx) => return Ok(StreamEnd::Paused),
                next = tokio::time::timeout(self.params.request_timeout, stream.next()) => {
                    next.map_err(|_| ChunkError::Timeout("读取数据"))?
                }
            };

            let Some(bytes) = next else {
                break;
            };
            let bytes = bytes?;

            for piece in bytes.chunks(self.params.buffer_size) {
                if self.cancel.is_cancelled() {
                    return Ok(StreamEnd::Cancelled);
                }
                if self.is_paused() {
                    return Ok(StreamEnd::Paused);
                }

                // 不写超过分片范围的字节（服务器返回整个文件时）
                let piece = match limit {
                    Some(limit) => {
                        let remaining = limit.saturating_sub(slot.lock().downloaded);
                        if remaining == 0 {
                            return Ok(StreamEnd::Finished);
                        }
                        &piece[..piece.len().min(remaining as usize)]
                    }
                    None => piece,
                };

                file.write_all(piece).await?;
                let progress = {
                    let mut chunk = slot.lock();
                    chunk.record_written(piece.len() as u64);
                    chunk.progress()
                };
                self.report(progress);
            }

            if let Some(limit) = limit {
                if slot.lock().downloaded >= limit {
                    return Ok(StreamEnd::Finished);
                }
            }
        }

        if let Some(limit) = limit {
            let received = slot.lock().downloaded;
            if received < limit {
                return Err(ChunkError::Incomplete {
                    expected: limit,
                    received,
                });
            }
        }
        Ok(StreamEnd::Finished)
    }

    /// 带重试的分片传输
    ///
    /// 第 n 次失败后等待 n * backoff；等待期间暂停或取消会立即返回
    pub async fn transfer_with_retry(&self, client: &Client, index: usize) -> Result<(), ChunkError> {
        let max_retries = self.params.max_retries;
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.is_paused() {
                self.set_state(index, ChunkState::Paused);
                return Ok(());
            }

            match self.transfer_chunk(client, index).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= max_retries => {
                    warn!("分片 #{} 重试 {} 次后仍失败: {}", index, max_retries, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.params.retry_backoff * attempt;
                    warn!(
                        "分片 #{} 第 {}/{} 次下载失败: {}，{}ms 后重试",
                        index,
                        attempt,
                        max_retries,
                        e,
                        delay.as_millis()
                    );

                    let mut pause_rx = self.paused.subscribe();
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Ok(()),
                        _ = wait_for_pause(&mut pause_rx) => {
                            self.set_state(index, ChunkState::Paused);
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// 并发传输所有未完成的分片
    ///
    /// 每个分片一个并发请求；只要有一个分片耗尽重试，整体即失败，
    /// 其余分片照常跑完，临时文件保留
    pub async fn download_all(self: &Arc<Self>, client: &Client) -> TransferOutcome {
        if let Err(e) = fs::create_dir_all(&self.temp_dir).await {
            return TransferOutcome::Failed(format!("创建临时目录失败: {}", e));
        }

        let pending: Vec<usize> = self
            .chunks
            .iter()
            .filter_map(|slot| {
                let chunk = slot.lock();
                (!chunk.is_complete()).then_some(chunk.index)
            })
            .collect();

        info!(
            "开始传输分片: 共 {} 个, 待传输 {} 个, 已下载 {} bytes",
            self.chunks.len(),
            pending.len(),
            self.total_downloaded()
        );

        let mut running = JoinSet::new();
        for index in pending {
            let this = Arc::clone(self);
            let client = client.clone();
            running.spawn(async move {
                let result = this.transfer_with_retry(&client, index).await;
                (index, result)
            });
        }

        let mut failure: Option<String> = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((index, Err(e))) => {
                    failure.get_or_insert_with(|| format!("分片 #{} 下载失败: {}", index, e));
                }
                Err(e) => {
                    failure.get_or_insert_with(|| format!("分片任务异常退出: {}", e));
                }
            }
        }

        if self.is_cancelled() {
            TransferOutcome::Cancelled
        } else if self.is_paused() {
            TransferOutcome::Paused
        } else if let Some(reason) = failure {
            TransferOutcome::Failed(reason)
        } else if self.is_complete() {
            TransferOutcome::Completed
        } else {
            TransferOutcome::Failed("部分分片未完成".to_string())
        }
    }

    /// 按分片顺序合并到目标文件
    ///
    /// 先校验所有临时文件存在且长度与记录一致，写入 `<dest>.merging` 后再改名，
    /// 失败时不留下残缺文件。成功后清理临时文件
    pub async fn merge(&self, dest: &Path) -> Result<u64> {
        let chunks = self.chunks();

        for chunk in &chunks {
            if !chunk.is_complete() {
                anyhow::bail!("分片 #{} 尚未完成，无法合并", chunk.index);
            }
            let len = fs::metadata(&chunk.temp_file)
                .await
                .map(|m| m.len())
                .with_context(|| {
                    format!("分片 #{} 临时文件不存在: {:?}", chunk.index, chunk.temp_file)
                })?;
            if len != chunk.downloaded {
                anyhow::bail!(
                    "分片 #{} 临时文件大小不符: 期望 {}, 实际 {}",
                    chunk.index,
                    chunk.downloaded,
                    len
                );
            }
        }

        let partial = merging_path(dest);
        let expected = (self.file_size > 0).then_some(self.file_size);

        match write_merged(&chunks, &partial, dest, expected).await {
            Ok(total) => {
                info!("分片合并完成: {:?} ({} bytes)", dest, total);
                self.cleanup().await;
                Ok(total)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    /// 删除临时文件；目录为空时一并删除。错误全部忽略
    pub async fn cleanup(&self) {
        for slot in &self.chunks {
            let path = slot.lock().temp_file.clone();
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("删除临时文件失败: {:?}, 错误: {}", path, e);
                }
            }
        }
        let _ = fs::remove_dir(&self.temp_dir).await;
    }
}

fn merging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".merging");
    PathBuf::from(name)
}

async fn write_merged(
    chunks: &[Chunk],
    partial: &Path,
    dest: &Path,
    expected: Option<u64>,
) -> Result<u64> {
    let mut out = File::create(partial)
        .await
        .with_context(|| format!("创建合并文件失败: {:?}", partial))?;

    let mut total = 0u64;
    for chunk in chunks {
        let mut input = File::open(&chunk.temp_file)
            .await
            .with_context(|| format!("打开分片 #{} 失败", chunk.index))?;
        total += tokio::io::copy(&mut input, &mut out)
            .await
            .with_context(|| format!("写入分片 #{} 失败", chunk.index))?;
    }
    out.flush().await.context("刷新合并文件失败")?;
    out.sync_all().await.context("同步合并文件失败")?;
    drop(out);

    if let Some(expected) = expected {
        if total != expected {
            anyhow::bail!("合并后大小不符: 期望 {}, 实际 {}", expected, total);
        }
    }

    fs::rename(partial, dest)
        .await
        .with_context(|| format!("重命名合并文件失败: {:?} -> {:?}", partial, dest))?;
    Ok(total)
}

/// 校验分片布局：索引连续、范围首尾相接且恰好覆盖整个文件
fn validate_layout(state: &ChunkSetState) -> Result<()> {
    if state.chunks.is_empty() || state.chunks.len() != state.chunk_count {
        anyhow::bail!(
            "分片数量不一致: 声明 {}, 实际 {}",
            state.chunk_count,
            state.chunks.len()
        );
    }

    if state.file_size == 0 {
        if state.chunks.len() != 1 || !state.chunks[0].range.is_empty() {
            anyhow::bail!("大小未知的文件只能有一个 0..0 分片");
        }
        return Ok(());
    }

    let mut expected_start = 0;
    for (position, chunk) in state.chunks.iter().enumerate() {
        if chunk.index != position {
            anyhow::bail!("分片索引不连续: 位置 {} 的索引为 {}", position, chunk.index);
        }
        if chunk.range.start != expected_start || chunk.range.is_empty() {
            anyhow::bail!("分片 #{} 范围不连续: {:?}", chunk.index, chunk.range);
        }
        if chunk.downloaded > chunk.size() {
            anyhow::bail!(
                "分片 #{} 已下载 {} 超过分片大小 {}",
                chunk.index,
                chunk.downloaded,
                chunk.size()
            );
        }
        expected_start = chunk.range.end;
    }

    if expected_start != state.file_size {
        anyhow::bail!(
            "分片未覆盖整个文件: 覆盖到 {}, 文件大小 {}",
            expected_start,
            state.file_size
        );
    }
    Ok(())
}
