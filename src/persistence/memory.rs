//! 进程内任务存储

use std::collections::HashMap;

use anyhow::Result;
use parking_lot::Mutex;

use super::types::{ChunkRecord, TaskRecord};
use super::TaskStore;

#[derive(Default)]
struct Inner {
    /// 按首次写入顺序保存
    tasks: Vec<TaskRecord>,
    chunks: HashMap<String, Vec<ChunkRecord>>,
}

/// 内存任务存储
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn get_task(&self, task_id: &str) -> Option<TaskRecord> {
        self.inner
            .lock()
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }
}

impl TaskStore for MemoryTaskStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.tasks.iter_mut().find(|t| t.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => inner.tasks.push(record.clone()),
        }
        Ok(())
    }

    fn save_chunks(&self, task_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        self.inner
            .lock()
            .chunks
            .insert(task_id.to_string(), chunks.to_vec());
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks = self.inner.lock().tasks.clone();
        // 稳定排序，同一时间戳保持写入顺序
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    fn load_chunks(&self, task_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut chunks = self
            .inner
            .lock()
            .chunks
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.tasks.retain(|t| t.id != task_id);
        inner.chunks.remove(task_id);
        Ok(())
    }
}
