// 队列调度器：跨任务的准入控制

use crate::config::DownloadConfig;
use crate::downloader::chunk::Chunk;
use crate::downloader::engine::{DownloadEngine, SharedTask};
use crate::downloader::events::DownloadEvent;
use crate::downloader::metadata::unique_path;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::persistence::{recover_tasks, ChunkRecord, RecoveredTask, TaskRecord, TaskStore};
use anyhow::{Context, Result};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 进度驱动的持久化默认间隔
const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(2);

/// 队列调度器
///
/// 持有全部任务、FIFO 等待队列和活跃任务集合。活跃集合的大小就是活跃任务数，
/// 与等待队列一起只在短临界区内修改（先锁活跃集合再锁队列）
pub struct QueueScheduler {
    config: DownloadConfig,
    engine: Arc<DownloadEngine>,
    tasks: RwLock<HashMap<String, SharedTask>>,
    waiting_queue: SyncMutex<VecDeque<String>>,
    active: SyncMutex<HashSet<String>>,
    store: Option<Arc<dyn TaskStore>>,
    events_rx: SyncMutex<Option<mpsc::UnboundedReceiver<DownloadEvent>>>,
    observer: SyncMutex<Option<mpsc::UnboundedSender<DownloadEvent>>>,
    persist_interval: Duration,
    shutdown: CancellationToken,
    loops: SyncMutex<Vec<JoinHandle<()>>>,
}

impl QueueScheduler {
    pub fn new(config: DownloadConfig, store: Option<Arc<dyn TaskStore>>) -> Result<Self> {
        config.validate().context("下载配置无效")?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(DownloadEngine::new(config.clone(), events_tx));

        Ok(Self {
            config,
            engine,
            tasks: RwLock::new(HashMap::new()),
            waiting_queue: SyncMutex::new(VecDeque::new()),
            active: SyncMutex::new(HashSet::new()),
            store,
            events_rx: SyncMutex::new(Some(events_rx)),
            observer: SyncMutex::new(None),
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            shutdown: CancellationToken::new(),
            loops: SyncMutex::new(Vec::new()),
        })
    }

    /// 进度驱动的记录写入最小间隔，状态变更总是立即写入
    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    /// 安装外部观察者，接收经过持久化之后的事件
    pub fn set_event_sender(&self, tx: mpsc::UnboundedSender<DownloadEvent>) {
        *self.observer.lock() = Some(tx);
    }

    pub fn engine(&self) -> &Arc<DownloadEngine> {
        &self.engine
    }

    /// 启动调度器：恢复持久化的任务，启动准入循环和事件循环
    ///
    /// 返回恢复的任务数
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        let events_rx = self
            .events_rx
            .lock()
            .take()
            .context("调度器已经启动过")?;

        let recovered = self.recover().await;

        let admission = tokio::spawn(Self::admission_loop(
            Arc::downgrade(self),
            self.config.scheduler_interval(),
            self.shutdown.clone(),
        ));
        let events = tokio::spawn(Self::event_loop(
            Arc::downgrade(self),
            events_rx,
            self.shutdown.clone(),
        ));
        self.loops.lock().extend([admission, events]);

        info!(
            "调度器已启动: 最大并发任务 {}, 轮询间隔 {}ms, 恢复任务 {} 个",
            self.config.max_concurrent_tasks, self.config.scheduler_interval_ms, recovered
        );
        Ok(recovered)
    }

    async fn recover(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let recovered = match recover_tasks(store.as_ref()) {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!("恢复任务失败: {:#}", e);
                return 0;
            }
        };

        let count = recovered.len();
        let mut tasks = self.tasks.write().await;
        for RecoveredTask { mut task, chunks } in recovered {
            // 状态映射写回存储
            self.save_record(&TaskRecord::from(&task));

            task.restored_chunks = chunks;
            let id = task.id.clone();
            if task.status == TaskStatus::Queued {
                self.waiting_queue.lock().push_back(id.clone());
            }
            tasks.insert(id, Arc::new(Mutex::new(task)));
        }
        count
    }

    async fn admission_loop(weak: Weak<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(scheduler) = weak.upgrade() else {
                break;
            };
            scheduler.admit_waiting().await;
        }
        debug!("准入循环退出");
    }

    async fn event_loop(
        weak: Weak<Self>,
        mut events_rx: mpsc::UnboundedReceiver<DownloadEvent>,
        shutdown: CancellationToken,
    ) {
        let mut last_persist: HashMap<String, Instant> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(scheduler) = weak.upgrade() else {
                break;
            };
            scheduler.handle_event(event, &mut last_persist).await;
        }
        debug!("事件循环退出");
    }

    async fn handle_event(&self, event: DownloadEvent, last_persist: &mut HashMap<String, Instant>) {
        let task_id = event.task_id().to_string();

        let persist = match &event {
            DownloadEvent::Progress { .. } => last_persist
                .get(&task_id)
                .map(|at| at.elapsed() >= self.persist_interval)
                .unwrap_or(true),
            DownloadEvent::StatusChanged { .. } => true,
            DownloadEvent::Finished { task } => {
                self.release(&task_id);
                debug!("任务 {} 结束: {}", task_id, task.status);
                true
            }
        };

        if persist {
            if let Some(task) = self.shared(&task_id).await {
                self.persist_shared(&task).await;
            }
            if matches!(event, DownloadEvent::Finished { .. }) {
                last_persist.remove(&task_id);
            } else {
                last_persist.insert(task_id, Instant::now());
            }
        }

        let mut observer = self.observer.lock();
        if let Some(tx) = observer.as_ref() {
            if tx.send(event).is_err() {
                *observer = None;
            }
        }
    }

    /// 一轮准入：活跃数未满且队列非空时，按 FIFO 顺序启动任务
    ///
    /// 返回本轮启动的任务数
    pub async fn admit_waiting(&self) -> usize {
        let mut admitted = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // 先占位再启动，避免与控制操作并发时超过上限
            let task_id = {
                let mut active = self.active.lock();
                if active.len() >= self.config.max_concurrent_tasks {
                    break;
                }
                let mut queue = self.waiting_queue.lock();
                let Some(id) = queue.pop_front() else {
                    break;
                };
                active.insert(id.clone());
                id
            };

            let Some(task) = self.shared(&task_id).await else {
                self.release(&task_id);
                continue;
            };

            let status = task.lock().await.status;
            let result = match status {
                TaskStatus::Queued => self.engine.start(Arc::clone(&task)).await,
                // 因名额不足而推迟的恢复
                TaskStatus::Paused => self.engine.resume(&task).await,
                other => {
                    debug!("跳过状态为 {} 的排队任务 {}", other, task_id);
                    self.release(&task_id);
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    admitted += 1;
                    info!(
                        "▶ 启动任务 {} (活跃 {}/{})",
                        task_id,
                        self.active_count(),
                        self.config.max_concurrent_tasks
                    );
                }
                Err(e) => {
                    warn!("启动任务 {} 失败: {:#}", task_id, e);
                    self.release(&task_id);
                }
            }
        }

        admitted
    }

    fn release(&self, task_id: &str) {
        self.active.lock().remove(task_id);
    }

    async fn shared(&self, task_id: &str) -> Option<SharedTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    async fn require(&self, task_id: &str) -> Result<SharedTask> {
        self.shared(task_id)
            .await
            .with_context(|| format!("任务不存在: {}", task_id))
    }

    fn save_record(&self, record: &TaskRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_task(record) {
                warn!("保存任务 {} 失败: {:#}", record.id, e);
            }
        }
    }

    /// 写入任务记录和分片状态，错误只记日志
    async fn persist_shared(&self, task: &SharedTask) {
        let Some(store) = &self.store else {
            return;
        };

        let (record, chunks): (TaskRecord, Option<Vec<Chunk>>) = {
            let t = task.lock().await;
            let chunks = match t.status {
                // 合并成功后临时文件已删除
                TaskStatus::Completed => Some(Vec::new()),
                _ => t.chunk_set.as_ref().map(|cs| cs.chunks()),
            };
            (TaskRecord::from(&*t), chunks)
        };

        if let Err(e) = store.save_task(&record) {
            warn!("保存任务 {} 失败: {:#}", record.id, e);
            return;
        }
        if let Some(chunks) = chunks {
            let records: Vec<ChunkRecord> = chunks
                .iter()
                .map(|c| ChunkRecord::from_chunk(&record.id, c))
                .collect();
            if let Err(e) = store.save_chunks(&record.id, &records) {
                warn!("保存任务 {} 的分片状态失败: {:#}", record.id, e);
            }
        }
    }

    /// 添加新任务到等待队列
    pub async fn enqueue(&self, task: DownloadTask) -> Result<String> {
        if task.status != TaskStatus::Queued {
            anyhow::bail!("只能添加排队状态的任务，当前状态: {}", task.status);
        }

        let id = task.id.clone();
        let record = TaskRecord::from(&task);
        let name = if task.filename.is_empty() {
            task.url.clone()
        } else {
            task.filename.clone()
        };

        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&id) {
                anyhow::bail!("任务已存在: {}", id);
            }
            tasks.insert(id.clone(), Arc::new(Mutex::new(task)));
        }
        self.save_record(&record);
        self.waiting_queue.lock().push_back(id.clone());

        info!("任务已加入队列: {} ({})", name, id);
        Ok(id)
    }

    /// 按 URL 添加任务
    ///
    /// 未指定文件名时在探测阶段由响应头或 URL 决定；目标已存在时自动改名
    pub async fn enqueue_url(
        &self,
        url: &str,
        save_dir: Option<PathBuf>,
        filename: Option<String>,
        num_chunks: Option<usize>,
    ) -> Result<String> {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("无效的下载地址: {}", url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("不支持的协议: {}", parsed.scheme());
        }

        let dir = save_dir.unwrap_or_else(|| self.config.download_dir.clone());
        let (save_path, filename) = match filename.filter(|f| !f.trim().is_empty()) {
            Some(name) => (unique_path(&dir.join(&name)), name),
            None => (dir, String::new()),
        };

        let task = DownloadTask::new(parsed.to_string(), save_path, filename).with_chunks(num_chunks);
        self.enqueue(task).await
    }

    /// 暂停下载中的任务，释放活跃名额
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let task = self.require(task_id).await?;
        self.engine.pause(&task).await?;
        self.release(task_id);
        self.persist_shared(&task).await;
        info!("⏸ 任务已暂停: {}", task_id);
        Ok(())
    }

    /// 恢复暂停的任务
    ///
    /// 有空闲名额时立即恢复并返回 true；否则放回等待队列，返回 false
    pub async fn resume(&self, task_id: &str) -> Result<bool> {
        let task = self.require(task_id).await?;
        let status = task.lock().await.status;
        if status != TaskStatus::Paused {
            anyhow::bail!("任务 {} 当前状态 {} 不能恢复", task_id, status);
        }

        let reserved = {
            let mut active = self.active.lock();
            let mut queue = self.waiting_queue.lock();
            if queue.iter().any(|id| id == task_id) {
                return Ok(false);
            }
            if active.len() < self.config.max_concurrent_tasks {
                active.insert(task_id.to_string());
                true
            } else {
                queue.push_back(task_id.to_string());
                false
            }
        };

        if !reserved {
            info!("活跃任务已满，任务 {} 排队等待恢复", task_id);
            return Ok(false);
        }

        if let Err(e) = self.engine.resume(&task).await {
            self.release(task_id);
            return Err(e);
        }
        info!("▶ 任务已恢复: {}", task_id);
        Ok(true)
    }

    /// 恢复所有暂停的任务，返回处理的数量（含排队等待的）
    pub async fn resume_all(&self) -> usize {
        let paused: Vec<String> = self
            .all_tasks()
            .await
            .into_iter()
            .filter(|t| t.status == TaskStatus::Paused)
            .map(|t| t.id)
            .collect();

        let mut count = 0;
        for id in paused {
            match self.resume(&id).await {
                Ok(_) => count += 1,
                Err(e) => warn!("恢复任务 {} 失败: {:#}", id, e),
            }
        }
        count
    }

    /// 取消任务
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let task = self.require(task_id).await?;
        self.waiting_queue.lock().retain(|id| id != task_id);
        self.engine.cancel(&task).await?;
        self.release(task_id);
        self.persist_shared(&task).await;
        info!("✗ 任务已取消: {}", task_id);
        Ok(())
    }

    /// 删除任务
    ///
    /// 未结束的任务先取消；清理临时分片，`delete_file` 为 true 时同时删除目标文件
    pub async fn remove(&self, task_id: &str, delete_file: bool) -> Result<()> {
        let task = self.require(task_id).await?;

        let status = task.lock().await.status;
        if !status.is_terminal() {
            if let Err(e) = self.cancel(task_id).await {
                debug!("删除前取消任务 {} 失败: {:#}", task_id, e);
            }
        }

        self.waiting_queue.lock().retain(|id| id != task_id);
        self.release(task_id);
        self.tasks.write().await.remove(task_id);

        let (chunk_set, save_path, has_filename) = {
            let t = task.lock().await;
            (t.chunk_set.clone(), t.save_path.clone(), !t.filename.is_empty())
        };

        if let Some(chunk_set) = chunk_set {
            chunk_set.cleanup().await;
        }
        match fs::remove_dir_all(self.config.temp_dir.join(task_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => debug!("清理任务 {} 临时目录失败: {}", task_id, e),
        }

        if delete_file && has_filename && save_path.is_file() {
            match fs::remove_file(&save_path).await {
                Ok(()) => info!("已删除文件: {:?}", save_path),
                Err(e) => warn!("删除文件失败: {:?}, 错误: {}", save_path, e),
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.delete_task(task_id) {
                warn!("删除任务 {} 的存储记录失败: {:#}", task_id, e);
            }
        }

        info!("任务已删除: {}", task_id);
        Ok(())
    }

    /// 重新开始失败或已取消的任务：以相同地址和路径创建新任务并删除旧任务
    pub async fn restart(&self, task_id: &str) -> Result<String> {
        let task = self.require(task_id).await?;
        let fresh = {
            let t = task.lock().await;
            if !matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                anyhow::bail!("任务 {} 当前状态 {} 不能重新开始", task_id, t.status);
            }
            DownloadTask::new(t.url.clone(), t.save_path.clone(), t.filename.clone())
                .with_chunks(t.num_chunks)
        };

        self.remove(task_id, false).await?;
        self.enqueue(fresh).await
    }

    /// 清除所有已完成的任务（保留文件），返回清除数量
    pub async fn clear_completed(&self) -> usize {
        let ids: Vec<String> = self
            .completed_tasks()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();

        let mut tasks = self.tasks.write().await;
        for id in &ids {
            tasks.remove(id);
            if let Some(store) = &self.store {
                if let Err(e) = store.delete_task(id) {
                    warn!("删除任务 {} 的存储记录失败: {:#}", id, e);
                }
            }
        }
        ids.len()
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        let task = self.shared(task_id).await?;
        let snapshot = task.lock().await.snapshot();
        Some(snapshot)
    }

    /// 所有任务，按创建时间排序
    pub async fn all_tasks(&self) -> Vec<DownloadTask> {
        let shared: Vec<SharedTask> = self.tasks.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(shared.len());
        for task in shared {
            snapshots.push(task.lock().await.snapshot());
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> Vec<DownloadTask> {
        self.all_tasks()
            .await
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    /// 获取中、下载中、合并中的任务
    pub async fn active_tasks(&self) -> Vec<DownloadTask> {
        self.all_tasks()
            .await
            .into_iter()
            .filter(|t| t.status.is_active())
            .collect()
    }

    pub async fn completed_tasks(&self) -> Vec<DownloadTask> {
        self.tasks_with_status(TaskStatus::Completed).await
    }

    /// 占用名额的任务数
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// 等待队列中的任务 ID
    pub fn queued_ids(&self) -> Vec<String> {
        self.waiting_queue.lock().iter().cloned().collect()
    }

    /// 是否还有待完成的任务
    ///
    /// 排队、进行中，或暂停但在等待队列里（延后恢复）的任务都算；
    /// 单纯暂停的不算
    pub async fn has_pending_work(&self) -> bool {
        let scheduled: HashSet<String> = {
            let active = self.active.lock();
            let queue = self.waiting_queue.lock();
            active.iter().chain(queue.iter()).cloned().collect()
        };
        self.all_tasks().await.iter().any(|t| {
            !t.status.is_terminal()
                && (t.status != TaskStatus::Paused || scheduled.contains(&t.id))
        })
    }

    /// 停止调度器
    ///
    /// 停止两个循环，暂停下载中的任务并等待所有后台运行退出，最后写入一次完整状态
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }

        let tasks: Vec<SharedTask> = self.tasks.read().await.values().cloned().collect();
        for task in &tasks {
            let status = task.lock().await.status;
            if status == TaskStatus::Downloading {
                if let Err(e) = self.engine.pause(task).await {
                    debug!("停止时暂停任务失败: {:#}", e);
                }
            }
        }
        self.engine.shutdown().await;
        self.active.lock().clear();

        for task in &tasks {
            self.persist_shared(task).await;
        }
        info!("调度器已停止");
    }
}

impl Drop for QueueScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
