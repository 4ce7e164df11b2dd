//! 日志系统
//!
//! 控制台 + 文件双输出。文件按启动时间命名，超过大小上限时滚动到 `_N` 后缀的新文件，
//! 启动时清理超过保留天数的旧日志

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_PREFIX: &str = "chunked-dl.";
const LOG_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
struct RotatingFile {
    dir: PathBuf,
    /// 启动时间戳（YYYY-MM-DD-HHMMSS），同一进程的所有滚动文件共享
    stamp: String,
    seq: u32,
    limit: u64,
    written: u64,
    file: File,
}

impl RotatingFile {
    fn open(dir: PathBuf, limit: u64) -> io::Result<Self> {
        let stamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = Self::open_seq(&dir, &stamp, 0)?;
        Ok(Self {
            dir,
            stamp,
            seq: 0,
            limit,
            written: 0,
            file,
        })
    }

    fn file_name(stamp: &str, seq: u32) -> String {
        match seq {
            0 => format!("{}{}{}", LOG_PREFIX, stamp, LOG_SUFFIX),
            n => format!("{}{}_{}{}", LOG_PREFIX, stamp, n, LOG_SUFFIX),
        }
    }

    fn open_seq(dir: &Path, stamp: &str, seq: u32) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::file_name(stamp, seq)))
    }

    fn write_all_rotating(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，单条超长日志也要能写进去
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.file.flush()?;
            self.seq += 1;
            self.file = Self::open_seq(&self.dir, &self.stamp, self.seq)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 可跨线程共享的日志写入器
#[derive(Clone)]
struct SharedRotatingFile(Arc<Mutex<RotatingFile>>);

impl Write for SharedRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write_all_rotating(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().file.flush()
    }
}

/// 日志守卫
/// 必须持有到进程退出，否则后台写线程提前结束会丢日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 环境变量优先于配置中的级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if !config.enabled {
        registry.init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    }

    let writer = fs::create_dir_all(&config.log_dir)
        .and_then(|_| RotatingFile::open(config.log_dir.clone(), config.max_file_size));

    let rotating = match writer {
        Ok(rotating) => rotating,
        Err(e) => {
            // 日志还没初始化，只能走 stderr
            eprintln!(
                "创建日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                config.log_dir, e
            );
            registry.init();
            return LogGuard { _file_guard: None };
        }
    };

    let (non_blocking, file_guard) =
        tracing_appender::non_blocking(SharedRotatingFile(Arc::new(Mutex::new(rotating))));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    registry.with(file_layer).init();

    info!(
        "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件上限={:.1}MB",
        config.log_dir,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

/// 删除超过保留天数的日志，返回删除数量
///
/// 优先按文件名中的日期判断，解析不出日期时退回到修改时间
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let keep = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_PREFIX) || !name.ends_with(LOG_SUFFIX) {
            continue;
        }

        let expired = match log_file_date(name) {
            Some(date) => today.signed_duration_since(date) > keep,
            None => modified_before(&entry, keep),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}

/// 从 `chunked-dl.YYYY-MM-DD-HHMMSS[_N].log` 中解析日期
fn log_file_date(file_name: &str) -> Option<NaiveDate> {
    let body = file_name
        .strip_prefix(LOG_PREFIX)?
        .strip_suffix(LOG_SUFFIX)?;
    let date = body.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_before(entry: &fs::DirEntry, keep: chrono::Duration) -> bool {
    let modified = entry.metadata().and_then(|m| m.modified());
    match modified {
        Ok(time) => {
            let time: chrono::DateTime<chrono::Utc> = time.into();
            chrono::Utc::now().signed_duration_since(time) > keep
        }
        Err(_) => false,
    }
}
