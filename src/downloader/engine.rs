use crate::config::DownloadConfig;
use crate::downloader::chunk::ChunkProgress;
use crate::downloader::chunk_set::{ChunkSet, TransferOutcome};
use crate::downloader::events::DownloadEvent;
use crate::downloader::metadata::{self, RemoteFileInfo};
use crate::downloader::progress::{format_size, SpeedCalculator};
use crate::downloader::task::{DownloadTask, TaskStatus};
use anyhow::{Context, Result};
use dashmap::DashMap;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 共享任务句柄
pub type SharedTask = Arc<Mutex<DownloadTask>>;

/// 正在运行的任务
struct ActiveRun {
    run_id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 下载引擎
///
/// 负责单个任务从启动到终止的全过程：探测、分片、传输、合并，以及状态机迁移
pub struct DownloadEngine {
    client: Client,
    config: DownloadConfig,
    active: DashMap<String, ActiveRun>,
    next_run_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl DownloadEngine {
    pub fn new(config: DownloadConfig, events_tx: mpsc::UnboundedSender<DownloadEvent>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("chunked-downloader/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            config,
            active: DashMap::new(),
            next_run_id: AtomicU64::new(1),
            events_tx,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// 任务是否有正在运行的后台协程
    pub fn is_active(&self, task_id: &str) -> bool {
        self.active
            .get(task_id)
            .map(|run| !run.handle.is_finished())
            .unwrap_or(false)
    }

    /// 获取远程文件信息
    pub async fn fetch_info(&self, url: &str) -> Result<RemoteFileInfo> {
        metadata::fetch_remote_info(&self.client, url, self.config.probe_timeout()).await
    }

    fn emit(&self, event: DownloadEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("事件接收端已关闭");
        }
    }

    /// 状态迁移并发出通知；进入终止状态时额外发出一次 Finished
    fn transition(&self, task: &mut DownloadTask, next: TaskStatus) -> Result<()> {
        let old_status = task.transition(next)?;
        info!("任务 {} 状态: {} -> {}", task.id, old_status, next);

        self.emit(DownloadEvent::StatusChanged {
            task: task.snapshot(),
            old_status,
        });
        if next.is_terminal() {
            self.emit(DownloadEvent::Finished {
                task: task.snapshot(),
            });
        }
        Ok(())
    }

    /// 启动任务（非阻塞）
    ///
    /// 接受 QUEUED 和 PAUSED 两种状态。大小未知或文件名未定时先进入 FETCHING_INFO 探测，
    /// 否则直接进入 DOWNLOADING。实际传输在后台协程中进行
    pub async fn start(self: &Arc<Self>, task: SharedTask) -> Result<()> {
        // 持有任务锁直到登记完成，后台协程的第一步会等这把锁
        let mut guard = task.lock().await;
        let task_id = guard.id.clone();

        if self.is_active(&task_id) {
            anyhow::bail!("任务 {} 已在运行", task_id);
        }

        let needs_probe = guard.filename.is_empty()
            || (guard.file_size == 0
                && guard.chunk_set.is_none()
                && guard.restored_chunks.is_none());

        let next = match guard.status {
            TaskStatus::Queued if needs_probe => TaskStatus::FetchingInfo,
            TaskStatus::Queued => TaskStatus::Downloading,
            TaskStatus::Paused => {
                if let Some(chunk_set) = &guard.chunk_set {
                    chunk_set.resume();
                }
                TaskStatus::Downloading
            }
            other => anyhow::bail!("任务 {} 当前状态 {} 不能启动", task_id, other),
        };
        self.transition(&mut guard, next)?;
        if next == TaskStatus::Downloading {
            guard.run_epoch += 1;
        }

        let token = CancellationToken::new();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let handle = {
            let engine = Arc::clone(self);
            let task = Arc::clone(&task);
            let token = token.clone();
            tokio::spawn(async move { engine.run(task, token, run_id).await })
        };

        self.active.insert(
            task_id,
            ActiveRun {
                run_id,
                token,
                handle,
            },
        );
        Ok(())
    }

    /// 后台运行：无论结果如何最后都从活跃表中注销
    async fn run(self: Arc<Self>, task: SharedTask, token: CancellationToken, run_id: u64) {
        let task_id = task.lock().await.id.clone();

        if let Err(e) = self.drive(&task, &token).await {
            error!("任务 {} 失败: {:#}", task_id, e);
            self.fail(&task, format!("{:#}", e)).await;
        }

        self.active.remove_if(&task_id, |_, run| run.run_id == run_id);
        debug!("任务 {} 运行结束", task_id);
    }

    async fn drive(self: &Arc<Self>, task: &SharedTask, token: &CancellationToken) -> Result<()> {
        // 1. 探测文件信息
        let probe_url = {
            let t = task.lock().await;
            (t.status == TaskStatus::FetchingInfo).then(|| t.url.clone())
        };
        if let Some(url) = probe_url {
            let info = tokio::select! {
                _ = token.cancelled() => {
                    debug!("探测被中断: {}", url);
                    return Ok(());
                }
                info = self.fetch_info(&url) => info.context("获取文件信息失败")?,
            };

            let mut t = task.lock().await;
            if t.status != TaskStatus::FetchingInfo {
                return Ok(());
            }
            t.apply_remote_info(&info);
            self.transition(&mut t, TaskStatus::Downloading)?;
        }

        // 2. 准备目录和分片集合
        let (dest, temp_dir) = {
            let t = task.lock().await;
            if t.status != TaskStatus::Downloading {
                return Ok(());
            }
            (t.save_path.clone(), self.config.temp_dir.join(&t.id))
        };

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建下载目录失败: {:?}", parent))?;
        }
        fs::create_dir_all(&temp_dir)
            .await
            .with_context(|| format!("创建临时目录失败: {:?}", temp_dir))?;

        let Some(chunk_set) = self.attach_chunk_set(task, temp_dir).await? else {
            return Ok(());
        };

        // 3. 传输；中断信号转为暂停，让分片写完当前缓冲后停下
        let interrupt = {
            let token = token.clone();
            let chunk_set = Arc::clone(&chunk_set);
            tokio::spawn(async move {
                token.cancelled().await;
                chunk_set.pause();
            })
        };
        let outcome = chunk_set.download_all(&self.client).await;
        interrupt.abort();

        match outcome {
            TransferOutcome::Completed => self.finish(task, &chunk_set, &dest).await,
            TransferOutcome::Paused | TransferOutcome::Cancelled => {
                debug!("任务传输停止: {:?}", outcome);
                Ok(())
            }
            TransferOutcome::Failed(reason) => {
                let status = task.lock().await.status;
                if status == TaskStatus::Downloading {
                    Err(anyhow::anyhow!(reason))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// 创建、重建或复用任务的分片集合
    ///
    /// 返回 None 表示准备期间任务已被暂停或取消
    async fn attach_chunk_set(
        &self,
        task: &SharedTask,
        temp_dir: PathBuf,
    ) -> Result<Option<Arc<ChunkSet>>> {
        let mut t = task.lock().await;

        let chunk_set = match t.chunk_set.clone() {
            Some(existing) => existing,
            None => {
                let (progress_tx, progress_rx) = mpsc::unbounded_channel();

                let restored = t.restored_chunks.take().and_then(|state| {
                    // 不支持 Range 的服务器无法续传多分片
                    if !t.resumable && state.chunk_count > 1 {
                        warn!("任务 {} 服务器不支持续传，丢弃已保存的分片状态", t.id);
                        return None;
                    }
                    match ChunkSet::rehydrate(
                        state,
                        temp_dir.clone(),
                        &self.config,
                        progress_tx.clone(),
                    ) {
                        Ok(chunk_set) => {
                            info!(
                                "任务 {} 从已保存的分片状态恢复: 已下载 {}",
                                t.id,
                                format_size(chunk_set.total_downloaded())
                            );
                            Some(chunk_set)
                        }
                        Err(e) => {
                            warn!("任务 {} 恢复分片状态失败，重新规划: {:#}", t.id, e);
                            None
                        }
                    }
                });

                let chunk_set = match restored {
                    Some(chunk_set) => chunk_set,
                    None => {
                        // 不支持 Range 时只能单连接下载
                        let requested = if t.resumable { t.num_chunks } else { Some(1) };
                        ChunkSet::new(
                            t.url.clone(),
                            t.file_size,
                            requested,
                            temp_dir,
                            &self.config,
                            progress_tx,
                        )
                    }
                };

                let chunk_set = Arc::new(chunk_set);
                self.spawn_progress_pump(task, &chunk_set, progress_rx);
                t.downloaded_bytes = chunk_set.total_downloaded();
                t.chunk_set = Some(Arc::clone(&chunk_set));
                info!(
                    "任务 {} 分片数: {}, 文件大小: {}",
                    t.id,
                    chunk_set.chunk_count(),
                    format_size(t.file_size)
                );
                chunk_set
            }
        };

        match t.status {
            TaskStatus::Downloading => Ok(Some(chunk_set)),
            TaskStatus::Paused => {
                chunk_set.pause();
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// 分片进度汇总：重算总下载量和速度，转发进度事件
    ///
    /// 只持有任务的弱引用；分片集合释放后通道关闭，协程自然退出
    fn spawn_progress_pump(
        &self,
        task: &SharedTask,
        chunk_set: &ChunkSet,
        mut progress_rx: mpsc::UnboundedReceiver<ChunkProgress>,
    ) {
        let weak_task = Arc::downgrade(task);
        let events_tx = self.events_tx.clone();
        let mut per_chunk: Vec<u64> = chunk_set.chunks().iter().map(|c| c.downloaded).collect();

        tokio::spawn(async move {
            let mut speed = SpeedCalculator::new();
            let mut epoch = None;

            while let Some(first) = progress_rx.recv().await {
                let mut apply = |p: ChunkProgress| {
                    if let Some(slot) = per_chunk.get_mut(p.chunk_index) {
                        *slot = p.downloaded;
                    }
                };
                apply(first);
                // 合并已积压的消息
                while let Ok(more) = progress_rx.try_recv() {
                    apply(more);
                }

                let Some(task) = weak_task.upgrade() else {
                    break;
                };
                let total: u64 = per_chunk.iter().sum();

                let mut t = task.lock().await;
                if t.status != TaskStatus::Downloading {
                    continue;
                }
                t.downloaded_bytes = total;
                // 暂停期间的时间不计入速度
                if epoch != Some(t.run_epoch) {
                    speed.reset();
                    epoch = Some(t.run_epoch);
                }
                if speed.record(total) {
                    t.speed = speed.speed();
                    t.eta_secs = speed.eta(t.file_size, total);
                }
                let _ = events_tx.send(DownloadEvent::Progress {
                    task: t.snapshot(),
                });
            }
        });
    }

    async fn finish(&self, task: &SharedTask, chunk_set: &ChunkSet, dest: &Path) -> Result<()> {
        {
            let mut t = task.lock().await;
            if t.status != TaskStatus::Downloading {
                return Ok(());
            }
            self.transition(&mut t, TaskStatus::Merging)?;
        }

        let merged = chunk_set.merge(dest).await.context("合并分片失败")?;

        let mut t = task.lock().await;
        if t.status != TaskStatus::Merging {
            // 合并期间被取消
            return Ok(());
        }
        if t.file_size == 0 {
            t.file_size = merged;
        }
        self.transition(&mut t, TaskStatus::Completed)?;
        info!("✓ 下载完成: {} ({})", t.filename, format_size(merged));
        Ok(())
    }

    async fn fail(&self, task: &SharedTask, reason: String) {
        let mut t = task.lock().await;
        if t.status.is_terminal() || t.status == TaskStatus::Paused {
            return;
        }
        t.error = Some(reason);
        if let Err(e) = self.transition(&mut t, TaskStatus::Failed) {
            warn!("标记任务失败时出错: {:#}", e);
        }
    }

    /// 暂停任务，等后台协程里的分片写完当前缓冲并退出后返回
    pub async fn pause(&self, task: &SharedTask) -> Result<()> {
        let task_id = {
            let mut t = task.lock().await;
            if t.status != TaskStatus::Downloading {
                anyhow::bail!("任务 {} 当前状态 {} 不能暂停", t.id, t.status);
            }
            if let Some(chunk_set) = &t.chunk_set {
                chunk_set.pause();
            }
            self.transition(&mut t, TaskStatus::Paused)?;
            t.id.clone()
        };

        self.wait_run(&task_id).await;
        Ok(())
    }

    /// 恢复暂停的任务，复用已有的分片集合
    pub async fn resume(self: &Arc<Self>, task: &SharedTask) -> Result<()> {
        {
            let t = task.lock().await;
            if t.status != TaskStatus::Paused {
                anyhow::bail!("任务 {} 当前状态 {} 不能恢复", t.id, t.status);
            }
        }
        self.start(Arc::clone(task)).await
    }

    /// 取消任务，任何非终止状态都可以取消
    pub async fn cancel(&self, task: &SharedTask) -> Result<()> {
        let task_id = {
            let mut t = task.lock().await;
            if t.status.is_terminal() {
                anyhow::bail!("任务 {} 已结束 ({})", t.id, t.status);
            }
            if let Some(chunk_set) = &t.chunk_set {
                chunk_set.cancel();
            }
            self.transition(&mut t, TaskStatus::Cancelled)?;
            t.id.clone()
        };

        if let Some(run) = self.active.get(&task_id) {
            run.token.cancel();
        }
        self.wait_run(&task_id).await;
        Ok(())
    }

    async fn wait_run(&self, task_id: &str) {
        if let Some((_, run)) = self.active.remove(task_id) {
            if let Err(e) = run.handle.await {
                warn!("任务 {} 后台协程异常退出: {}", task_id, e);
            }
        }
    }

    /// 中断所有后台运行并等待退出
    ///
    /// 传输中的分片会在当前缓冲边界停下，任务状态保持不变
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.active.iter().map(|run| run.key().clone()).collect();
        info!("停止下载引擎: {} 个运行中的任务", ids.len());

        for id in &ids {
            if let Some(run) = self.active.get(id) {
                run.token.cancel();
            }
        }
        for id in &ids {
            self.wait_run(id).await;
        }
    }
}

impl Drop for DownloadEngine {
    fn drop(&mut self) {
        for run in self.active.iter() {
            run.token.cancel();
        }
    }
}
