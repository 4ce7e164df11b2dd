// 下载事件

use crate::downloader::task::{DownloadTask, TaskStatus};
use serde::Serialize;

/// 下载事件
///
/// 引擎发往调度器，调度器持久化后转发给外部观察者
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 已下载字节或速度变化
    Progress { task: DownloadTask },
    /// 状态迁移
    StatusChanged {
        task: DownloadTask,
        old_status: TaskStatus,
    },
    /// 进入终止状态，每个任务只发送一次
    Finished { task: DownloadTask },
}

impl DownloadEvent {
    pub fn task(&self) -> &DownloadTask {
        match self {
            DownloadEvent::Progress { task }
            | DownloadEvent::StatusChanged { task, .. }
            | DownloadEvent::Finished { task } => task,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task().id
    }
}
