mod common;

use chunked_downloader::config::DownloadConfig;
use chunked_downloader::downloader::{
    DownloadEngine, DownloadEvent, DownloadTask, SharedTask, TaskStatus,
};
use common::{test_config, test_data, wait_for_task, ServerOptions, TestServer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

const SIZE: usize = 96 * 1024;
const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    engine: Arc<DownloadEngine>,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
}

fn harness(config: DownloadConfig) -> Harness {
    let (tx, events) = mpsc::unbounded_channel();
    Harness {
        engine: Arc::new(DownloadEngine::new(config, tx)),
        events,
    }
}

fn new_task(url: String, dir: &Path) -> SharedTask {
    Arc::new(Mutex::new(DownloadTask::new(url, dir.to_path_buf(), String::new())))
}

/// 收集事件直到任务结束
async fn collect_until_finished(events: &mut mpsc::UnboundedReceiver<DownloadEvent>) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    let finished = tokio::time::timeout(TIMEOUT, async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, DownloadEvent::Finished { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "任务未在时限内结束");
    seen
}

fn transitions(events: &[DownloadEvent]) -> Vec<(TaskStatus, TaskStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::StatusChanged { task, old_status } => Some((*old_status, task.status)),
            _ => None,
        })
        .collect()
}

async fn status_of(task: &SharedTask) -> TaskStatus {
    task.lock().await.status
}

#[tokio::test]
async fn test_full_lifecycle() {
    let data = test_data(SIZE);
    let server = TestServer::start(data.clone(), ServerOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    let events = collect_until_finished(&mut h.events).await;

    assert_eq!(
        transitions(&events),
        vec![
            (TaskStatus::Queued, TaskStatus::FetchingInfo),
            (TaskStatus::FetchingInfo, TaskStatus::Downloading),
            (TaskStatus::Downloading, TaskStatus::Merging),
            (TaskStatus::Merging, TaskStatus::Completed),
        ]
    );

    let progress: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::Progress { task } => Some(task.downloaded_bytes),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.filename, "file.bin");
    assert_eq!(t.file_size, SIZE as u64);
    assert_eq!(t.downloaded_bytes, SIZE as u64);
    assert!(t.resumable);
    assert!(t.completed_at.is_some());
    assert_eq!(t.save_path, config.download_dir.join("file.bin"));
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);
    assert!(!config.temp_dir.join(&t.id).exists());
    let id = t.id.clone();
    drop(t);

    for _ in 0..100 {
        if !h.engine.is_active(&id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.engine.is_active(&id));
}

#[tokio::test]
async fn test_filename_from_disposition_and_unique_path() {
    let data = test_data(4096);
    let options = ServerOptions {
        disposition: Some("attachment; filename=\"report.pdf\"".to_string()),
        ..Default::default()
    };
    let server = TestServer::start(data.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    std::fs::create_dir_all(&config.download_dir).unwrap();
    std::fs::write(config.download_dir.join("report.pdf"), b"old").unwrap();
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    collect_until_finished(&mut h.events).await;

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(t.save_path, config.download_dir.join("report (1).pdf"));
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);
    assert_eq!(
        std::fs::read(config.download_dir.join("report.pdf")).unwrap(),
        b"old"
    );
}

#[tokio::test]
async fn test_probe_falls_back_to_range_request() {
    let data = test_data(SIZE);
    let options = ServerOptions {
        head_not_allowed: true,
        ..Default::default()
    };
    let server = TestServer::start(data.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    collect_until_finished(&mut h.events).await;

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert!(t.resumable);
    assert_eq!(t.file_size, SIZE as u64);
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);

    let ranges = server.recorded_ranges();
    assert_eq!(ranges.first().cloned().flatten().as_deref(), Some("bytes=0-0"));
    assert!(ranges.len() > 2, "应当多分片下载: {:?}", ranges);
}

#[tokio::test]
async fn test_unknown_size_without_range_support() {
    let data = test_data(SIZE + 7);
    let options = ServerOptions {
        ignore_range: true,
        hide_length: true,
        ..Default::default()
    };
    let server = TestServer::start(data.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    collect_until_finished(&mut h.events).await;

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert!(!t.resumable);
    assert_eq!(t.file_size, data.len() as u64);
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let data = test_data(SIZE);
    let options = ServerOptions {
        throttle: Some((2048, Duration::from_millis(20))),
        ..Default::default()
    };
    let server = TestServer::start(data.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    assert!(wait_for_task(&task, TIMEOUT, |t| t.downloaded_bytes > 0).await);

    h.engine.pause(&task).await.unwrap();
    let (id, paused_at) = {
        let t = task.lock().await;
        assert_eq!(t.status, TaskStatus::Paused);
        assert_eq!(t.speed, 0);
        (t.id.clone(), t.downloaded_bytes)
    };
    assert!(!h.engine.is_active(&id));
    assert!(paused_at < SIZE as u64);

    // 暂停期间不再有字节落盘
    tokio::time::sleep(Duration::from_millis(100)).await;
    let on_disk: u64 = task
        .lock()
        .await
        .chunk_set
        .as_ref()
        .unwrap()
        .chunks()
        .iter()
        .map(|c| std::fs::metadata(&c.temp_file).map(|m| m.len()).unwrap_or(0))
        .sum();
    assert!(on_disk >= paused_at);
    assert!(on_disk < SIZE as u64);

    h.engine.resume(&task).await.unwrap();
    assert_eq!(status_of(&task).await, TaskStatus::Downloading);
    assert_eq!(task.lock().await.run_epoch, 2);
    let events = collect_until_finished(&mut h.events).await;
    assert!(transitions(&events).contains(&(TaskStatus::Paused, TaskStatus::Downloading)));

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);
}

#[tokio::test]
async fn test_speed_reported_on_slow_link() {
    // 每 2.5 秒只到一小块
    let data = test_data(3000);
    let options = ServerOptions {
        throttle: Some((1000, Duration::from_millis(2500))),
        ..Default::default()
    };
    let server = TestServer::start(data.clone(), options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = Arc::new(Mutex::new(
        DownloadTask::new(server.url(), config.download_dir.clone(), String::new())
            .with_chunks(Some(1)),
    ));
    h.engine.start(Arc::clone(&task)).await.unwrap();

    let mut max_speed = 0;
    let mut saw_eta = false;
    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = h.events.recv().await {
            match event {
                DownloadEvent::Progress { task } => {
                    max_speed = max_speed.max(task.speed);
                    saw_eta |= task.eta().is_some();
                }
                DownloadEvent::Finished { .. } => break,
                DownloadEvent::StatusChanged { .. } => {}
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "任务未在时限内结束");

    assert!(max_speed > 0);
    assert!(max_speed < 1000, "{}", max_speed);
    assert!(saw_eta);
    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Completed);
    assert_eq!(std::fs::read(&t.save_path).unwrap(), data);
}

#[tokio::test]
async fn test_cancel_running_task() {
    let data = test_data(SIZE);
    let options = ServerOptions {
        throttle: Some((1024, Duration::from_millis(20))),
        ..Default::default()
    };
    let server = TestServer::start(data, options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    assert!(wait_for_task(&task, TIMEOUT, |t| t.downloaded_bytes > 0).await);

    h.engine.cancel(&task).await.unwrap();
    let events = collect_until_finished(&mut h.events).await;
    assert!(transitions(&events).contains(&(TaskStatus::Downloading, TaskStatus::Cancelled)));

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Cancelled);
    assert!(!h.engine.is_active(&t.id));
    assert!(!t.save_path.exists());

    // 终止状态不能再次取消或恢复
    drop(t);
    assert!(h.engine.cancel(&task).await.is_err());
    assert!(h.engine.resume(&task).await.is_err());
}

#[tokio::test]
async fn test_chunk_failure_fails_task() {
    let data = test_data(SIZE);
    let server = TestServer::start(data, ServerOptions::default()).await;
    server.fail_range_start(0, usize::MAX);
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    let events = collect_until_finished(&mut h.events).await;
    assert!(transitions(&events).contains(&(TaskStatus::Downloading, TaskStatus::Failed)));

    let t = task.lock().await;
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.error.as_deref().unwrap_or_default().contains("503"));
    assert!(!t.save_path.exists());
}

#[tokio::test]
async fn test_missing_resource_fails_during_probe() {
    let server = TestServer::start(test_data(16), ServerOptions::default()).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let mut h = harness(config.clone());

    let task = new_task(server.url_for("/missing.bin"), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    let events = collect_until_finished(&mut h.events).await;

    assert_eq!(
        transitions(&events),
        vec![
            (TaskStatus::Queued, TaskStatus::FetchingInfo),
            (TaskStatus::FetchingInfo, TaskStatus::Failed),
        ]
    );
    assert!(task.lock().await.error.is_some());
}

#[tokio::test]
async fn test_start_rejects_running_task() {
    let data = test_data(SIZE);
    let options = ServerOptions {
        throttle: Some((1024, Duration::from_millis(20))),
        ..Default::default()
    };
    let server = TestServer::start(data, options).await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let h = harness(config.clone());

    let task = new_task(server.url(), &config.download_dir);
    h.engine.start(Arc::clone(&task)).await.unwrap();
    assert!(h.engine.start(Arc::clone(&task)).await.is_err());

    h.engine.shutdown().await;
    assert!(!h.engine.is_active(&task.lock().await.id));
}
