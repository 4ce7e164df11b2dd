//! 下载引擎
//!
//! - `metadata`: 探测远程文件（大小、文件名、是否支持 Range）
//! - `chunk` / `chunk_set`: 分片规划、并发传输、续传与合并
//! - `engine`: 单个任务的生命周期
//! - `scheduler`: 跨任务的排队与并发上限

pub mod chunk;
pub mod chunk_set;
pub mod engine;
pub mod events;
pub mod metadata;
pub mod progress;
pub mod scheduler;
pub mod task;

pub use chunk::{Chunk, ChunkError, ChunkProgress, ChunkState};
pub use chunk_set::{plan_chunks, ChunkSet, ChunkSetState, TransferOutcome};
pub use engine::{DownloadEngine, SharedTask};
pub use events::DownloadEvent;
pub use metadata::{fetch_remote_info, RemoteFileInfo};
pub use progress::{format_eta, format_size, format_speed, SpeedCalculator};
pub use scheduler::QueueScheduler;
pub use task::{DownloadTask, TaskStatus};
