//! 集成测试共用：支持 Range 的本地 HTTP 服务器和配置

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chunked_downloader::config::DownloadConfig;
use chunked_downloader::downloader::{DownloadTask, SharedTask};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const FILE_PATH: &str = "/file.bin";

/// 服务器行为开关
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// 忽略 Range，总是返回 200 和完整内容
    pub ignore_range: bool,
    /// HEAD 返回 405
    pub head_not_allowed: bool,
    /// 不返回 Content-Length（分块传输）
    pub hide_length: bool,
    pub disposition: Option<String>,
    /// 响应体按 (块大小, 间隔) 慢速写出
    pub throttle: Option<(usize, Duration)>,
}

pub struct ServerState {
    data: Vec<u8>,
    options: ServerOptions,
    /// Range 起点 -> 剩余的 503 次数
    failures: Mutex<HashMap<u64, usize>>,
    /// Range 起点 -> 响应头发出后、第一个字节之前的停顿
    stalls: Mutex<HashMap<u64, Duration>>,
    /// 每个 GET 请求的 Range 头
    ranges: Mutex<Vec<Option<String>>>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(data: Vec<u8>, options: ServerOptions) -> Self {
        let state = Arc::new(ServerState {
            data,
            options,
            failures: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            ranges: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route(FILE_PATH, get(serve_get).head(serve_head))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        self.url_for(FILE_PATH)
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 以 `start` 为起点的 Range 请求接下来返回 `times` 次 503
    pub fn fail_range_start(&self, start: u64, times: usize) {
        self.state.failures.lock().insert(start, times);
    }

    /// 以 `start` 为起点的请求先停顿 `delay` 再写出数据
    pub fn stall_range_start(&self, start: u64, delay: Duration) {
        self.state.stalls.lock().insert(start, delay);
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().clear();
    }

    pub fn recorded_ranges(&self) -> Vec<Option<String>> {
        self.state.ranges.lock().clone()
    }

    pub fn clear_recorded(&self) {
        self.state.ranges.lock().clear();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_head(State(state): State<Arc<ServerState>>) -> Response {
    if state.options.head_not_allowed {
        return status_only(StatusCode::METHOD_NOT_ALLOWED);
    }

    let mut builder = Response::builder().status(StatusCode::OK);
    if !state.options.hide_length {
        builder = builder.header(header::CONTENT_LENGTH, state.data.len());
    }
    if !state.options.ignore_range {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if let Some(disposition) = &state.options.disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition.as_str());
    }
    builder.body(Body::empty()).unwrap()
}

async fn serve_get(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().push(range.clone());

    let total = state.data.len() as u64;
    let requested = if state.options.ignore_range {
        None
    } else {
        range.as_deref().map(|r| parse_range(r, total))
    };

    let start = match requested {
        Some(Some((start, _))) => start,
        Some(None) => return status_only(StatusCode::RANGE_NOT_SATISFIABLE),
        None => 0,
    };

    {
        let mut failures = state.failures.lock();
        if let Some(left) = failures.get_mut(&start) {
            if *left > 0 {
                *left -= 1;
                return status_only(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }

    let stall = state.stalls.lock().get(&start).copied();

    let mut builder = Response::builder();
    if let Some(disposition) = &state.options.disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition.as_str());
    }

    match requested {
        Some(Some((start, end))) => {
            let slice = state.data[start as usize..=end as usize].to_vec();
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total),
                )
                .body(body_for(&state.options, slice, stall))
                .unwrap()
        }
        _ => {
            if !state.options.ignore_range {
                builder = builder.header(header::ACCEPT_RANGES, "bytes");
            }
            builder
                .status(StatusCode::OK)
                .body(body_for(&state.options, state.data.clone(), stall))
                .unwrap()
        }
    }
}

fn status_only(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

/// 解析 `bytes=a-b` 或 `bytes=a-`，返回闭区间
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = match end.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(total.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

fn body_for(options: &ServerOptions, bytes: Vec<u8>, stall: Option<Duration>) -> Body {
    let (piece, delay) = match options.throttle {
        Some(throttle) => throttle,
        None if options.hide_length || stall.is_some() => (16 * 1024, Duration::ZERO),
        None => return Body::from(bytes),
    };

    let pieces: Vec<(usize, Bytes)> = bytes
        .chunks(piece.max(1))
        .map(Bytes::copy_from_slice)
        .enumerate()
        .collect();
    let stream = futures::stream::iter(pieces).then(move |(i, piece)| async move {
        if let Some(stall) = stall.filter(|_| i == 0) {
            tokio::time::sleep(stall).await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, std::io::Error>(piece)
    });
    Body::from_stream(stream)
}

/// 可辨认的测试数据，错位拼接会被比较出来
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// 测试用下载配置：小分片、短退避、快速轮询
pub fn test_config(root: &Path) -> DownloadConfig {
    DownloadConfig {
        download_dir: root.join("downloads"),
        temp_dir: root.join("tmp"),
        min_chunk_size: 1024,
        max_chunks: 16,
        default_chunks: 8,
        max_concurrent_tasks: 3,
        request_timeout_secs: 5,
        connect_timeout_secs: 5,
        max_retries: 3,
        retry_backoff_ms: 10,
        buffer_size: 4096,
        scheduler_interval_ms: 20,
        probe_timeout_secs: 5,
        ..DownloadConfig::default()
    }
}

/// 轮询任务直到条件成立或超时
pub async fn wait_for_task<F>(task: &SharedTask, timeout: Duration, condition: F) -> bool
where
    F: Fn(&DownloadTask) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition(&*task.lock().await) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
