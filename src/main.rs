use chunked_downloader::{
    config::AppConfig,
    downloader::{format_eta, format_size, format_speed, DownloadEvent, QueueScheduler, TaskStatus},
    logging,
    persistence::{SqliteTaskStore, TaskStore},
};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 进度日志的最小间隔（每个任务）
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// 分片并行 HTTP 下载器
#[derive(Debug, Parser)]
#[command(name = "chunked-dl", version, about)]
struct Cli {
    /// 要下载的地址
    urls: Vec<String>,

    /// 配置文件路径
    #[arg(short, long, default_value = "config/app.toml")]
    config: String,

    /// 保存目录（默认使用配置中的 download_dir）
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// 保存的文件名，只对单个地址生效
    #[arg(short, long)]
    output: Option<String>,

    /// 分片数（默认按文件大小自动选择）
    #[arg(short = 'n', long)]
    chunks: Option<usize>,

    /// 不恢复上次暂停或中断的任务
    #[arg(long)]
    no_resume: bool,
}

fn open_store(config: &AppConfig) -> Option<Arc<dyn TaskStore>> {
    if !config.persistence.enabled {
        return None;
    }
    match SqliteTaskStore::open(&config.persistence.db_path) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("打开任务数据库失败，本次运行不持久化: {:#}", e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(&cli.config).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Chunked Downloader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let store = open_store(&config);
    let scheduler = Arc::new(
        QueueScheduler::new(config.download.clone(), store)?.with_persist_interval(
            Duration::from_millis(config.persistence.progress_persist_interval_ms),
        ),
    );

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    scheduler.set_event_sender(events_tx);

    let recovered = scheduler.start().await?;
    if recovered > 0 && !cli.no_resume {
        let resumed = scheduler.resume_all().await;
        info!("恢复上次未完成的任务: {} 个", resumed);
    }

    let single = cli.urls.len() == 1;
    for url in &cli.urls {
        let filename = if single { cli.output.clone() } else { None };
        match scheduler
            .enqueue_url(url, cli.dir.clone(), filename, cli.chunks)
            .await
        {
            Ok(id) => info!("已添加: {} -> {}", url, id),
            Err(e) => warn!("添加任务失败: {}: {:#}", url, e),
        }
    }

    let mut last_logged: HashMap<String, Instant> = HashMap::new();
    if !scheduler.has_pending_work().await {
        info!("没有需要下载的任务");
        scheduler.stop().await;
        return Ok(());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let event = tokio::select! {
            _ = &mut ctrl_c => {
                info!("收到 Ctrl+C，暂停下载并保存进度...");
                break;
            }
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match &event {
            DownloadEvent::Progress { task } => {
                let due = last_logged
                    .get(&task.id)
                    .map(|at| at.elapsed() >= PROGRESS_LOG_INTERVAL)
                    .unwrap_or(true);
                if due {
                    last_logged.insert(task.id.clone(), Instant::now());
                    info!(
                        "{} {:.1}% {} / {} {} 剩余 {}",
                        task.filename,
                        task.progress(),
                        format_size(task.downloaded_bytes),
                        format_size(task.file_size),
                        format_speed(task.speed),
                        task.eta().map(format_eta).unwrap_or_else(|| "--".to_string()),
                    );
                }
            }
            DownloadEvent::StatusChanged { .. } => {}
            DownloadEvent::Finished { task } => {
                last_logged.remove(&task.id);
                match task.status {
                    TaskStatus::Completed => info!("✓ {} -> {:?}", task.url, task.save_path),
                    TaskStatus::Failed => warn!(
                        "✗ {} 失败: {}",
                        task.url,
                        task.error.as_deref().unwrap_or("未知错误")
                    ),
                    _ => info!("任务 {} 结束: {}", task.id, task.status),
                }

                if !scheduler.has_pending_work().await {
                    info!("所有任务已结束");
                    break;
                }
            }
        }
    }

    scheduler.stop().await;
    info!("下载器已安全退出");
    Ok(())
}
