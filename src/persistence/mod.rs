//! 任务持久化
//!
//! 任务记录和分片状态经由 [`TaskStore`] 保存，进程重启后据此恢复未完成的下载：
//! - `sqlite`: 基于 rusqlite 的正式实现（downloads / chunks 两张表）
//! - `memory`: 进程内实现，用于测试和不需要落盘的嵌入场景
//! - `recovery`: 启动时把记录还原为可继续的任务
//!
//! 存储层的错误由调用方记录日志后吞掉，不影响正在进行的传输

pub mod memory;
pub mod recovery;
pub mod sqlite;
pub mod types;

pub use memory::MemoryTaskStore;
pub use recovery::{recover_tasks, RecoveredTask};
pub use sqlite::SqliteTaskStore;
pub use types::{ChunkRecord, TaskRecord};

use anyhow::Result;

/// 任务存储
pub trait TaskStore: Send + Sync {
    /// 新增或更新任务记录
    fn save_task(&self, record: &TaskRecord) -> Result<()>;

    /// 整体替换任务的分片列表
    fn save_chunks(&self, task_id: &str, chunks: &[ChunkRecord]) -> Result<()>;

    /// 按创建顺序加载所有任务
    fn load_tasks(&self) -> Result<Vec<TaskRecord>>;

    /// 按分片索引加载任务的分片列表
    fn load_chunks(&self, task_id: &str) -> Result<Vec<ChunkRecord>>;

    /// 删除任务及其分片（同时成功或同时失败）
    fn delete_task(&self, task_id: &str) -> Result<()>;
}
