// 速度与剩余时间估算

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 采样最小间隔
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// 平滑窗口大小
pub const SAMPLE_WINDOW: usize = 5;

/// 速度计算器
///
/// 每 500ms 最多采样一次，速度取最近 5 个采样的算术平均
#[derive(Debug, Clone, Default)]
pub struct SpeedCalculator {
    last: Option<(Instant, u64)>,
    samples: VecDeque<f64>,
}

impl SpeedCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录当前累计字节数
    pub fn record(&mut self, total_bytes: u64) -> bool {
        self.record_at(total_bytes, Instant::now())
    }

    /// 以指定时间点记录累计字节数，返回是否产生了新采样
    ///
    /// 第一次调用只建立基线
    pub fn record_at(&mut self, total_bytes: u64, now: Instant) -> bool {
        let Some((last_at, last_bytes)) = self.last else {
            self.last = Some((now, total_bytes));
            return false;
        };

        let elapsed = now.saturating_duration_since(last_at);
        if elapsed < SAMPLE_INTERVAL {
            return false;
        }

        // 续传前的对账可能让累计值回退，按 0 计
        let delta = total_bytes.saturating_sub(last_bytes);
        self.samples.push_back(delta as f64 / elapsed.as_secs_f64());
        if self.samples.len() > SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.last = Some((now, total_bytes));
        true
    }

    /// 平滑后的速度（字节/秒）
    pub fn speed(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: f64 = self.samples.iter().sum();
        (sum / self.samples.len() as f64) as u64
    }

    /// 剩余秒数，速度为 0 或大小未知时返回 0
    pub fn eta(&self, file_size: u64, transferred: u64) -> u64 {
        let speed = self.speed();
        if speed == 0 || file_size == 0 {
            return 0;
        }
        file_size.saturating_sub(transferred) / speed
    }

    /// 丢弃历史，下一次记录重新建立基线（暂停恢复后调用）
    pub fn reset(&mut self) {
        self.last = None;
        self.samples.clear();
    }
}

/// 格式化字节数
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", format_size(bytes_per_sec))
}

/// 格式化剩余时间，0 显示为 `--`
pub fn format_eta(secs: u64) -> String {
    if secs == 0 {
        return "--".to_string();
    }
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
