//! SQLite 任务存储
//!
//! - downloads: 任务记录
//! - chunks: 分片状态，(task_id, chunk_index) 为主键

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, Row};
use tracing::{debug, info};

use super::types::{ChunkRecord, TaskRecord};
use super::TaskStore;

/// SQLite 任务存储
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("打开数据库失败: {:?}", db_path))?;
        let store = Self::with_connection(conn)?;
        info!("任务数据库已打开: {:?}", db_path);
        Ok(store)
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                save_path TEXT NOT NULL,
                filename TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error TEXT,
                resumable INTEGER NOT NULL DEFAULT 0,
                num_chunks INTEGER,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS chunks (
                task_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                temp_file TEXT NOT NULL,
                PRIMARY KEY (task_id, chunk_index),
                FOREIGN KEY (task_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
            "#,
        )?;

        debug!("数据库表初始化完成");
        Ok(())
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<(TaskRecord, String)> {
        let status: String = row.get("status")?;
        let record = TaskRecord {
            id: row.get("id")?,
            url: row.get("url")?,
            save_path: row.get("save_path")?,
            filename: row.get("filename")?,
            file_size: row.get::<_, i64>("file_size")? as u64,
            downloaded_bytes: row.get::<_, i64>("downloaded_bytes")? as u64,
            // 状态字符串在外层解析
            status: crate::downloader::TaskStatus::Queued,
            error: row.get("error")?,
            resumable: row.get::<_, i64>("resumable")? != 0,
            num_chunks: row
                .get::<_, Option<i64>>("num_chunks")?
                .map(|n| n as usize),
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
        };
        Ok((record, status))
    }
}

impl TaskStore for SqliteTaskStore {
    fn save_task(&self, record: &TaskRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        // ON CONFLICT 更新而不是 REPLACE，避免级联删除分片
        conn.execute(
            r#"
            INSERT INTO downloads (
                id, url, save_path, filename, file_size, downloaded_bytes,
                status, error, resumable, num_chunks, created_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                save_path = excluded.save_path,
                filename = excluded.filename,
                file_size = excluded.file_size,
                downloaded_bytes = excluded.downloaded_bytes,
                status = excluded.status,
                error = excluded.error,
                resumable = excluded.resumable,
                num_chunks = excluded.num_chunks,
                completed_at = excluded.completed_at
            "#,
            params![
                record.id,
                record.url,
                record.save_path,
                record.filename,
                record.file_size as i64,
                record.downloaded_bytes as i64,
                record.status.as_str(),
                record.error,
                record.resumable as i64,
                record.num_chunks.map(|n| n as i64),
                record.created_at,
                record.completed_at,
            ],
        )?;
        Ok(())
    }

    fn save_chunks(&self, task_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE task_id = ?1", params![task_id])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO chunks (
                    task_id, chunk_index, range_start, range_end, downloaded, state, temp_file
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    task_id,
                    chunk.chunk_index as i64,
                    chunk.range_start as i64,
                    chunk.range_end as i64,
                    chunk.downloaded as i64,
                    chunk.state.as_str(),
                    chunk.temp_file,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<TaskRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let mut stmt = conn.prepare("SELECT * FROM downloads ORDER BY created_at ASC, rowid ASC")?;
        let rows = stmt.query_map([], Self::row_to_task)?;

        let mut records = Vec::new();
        for row in rows {
            let (mut record, status) = row?;
            record.status = status
                .parse()
                .with_context(|| format!("任务 {} 状态无效", record.id))?;
            records.push(record);
        }
        Ok(records)
    }

    fn load_chunks(&self, task_id: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT chunk_index, range_start, range_end, downloaded, state, temp_file
            FROM chunks WHERE task_id = ?1 ORDER BY chunk_index ASC
            "#,
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (index, start, end, downloaded, state, temp_file) = row?;
            chunks.push(ChunkRecord {
                task_id: task_id.to_string(),
                chunk_index: index as usize,
                range_start: start as u64,
                range_end: end as u64,
                downloaded: downloaded as u64,
                state: state.parse()?,
                temp_file,
            });
        }
        Ok(chunks)
    }

    fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE task_id = ?1", params![task_id])?;
        tx.execute("DELETE FROM downloads WHERE id = ?1", params![task_id])?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{ChunkState, TaskStatus};
    use tempfile::TempDir;

    fn record(id: &str, created_at: i64, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            url: format!("http://example.com/{}", id),
            save_path: format!("/downloads/{}", id),
            filename: id.to_string(),
            file_size: 1000,
            downloaded_bytes: 0,
            status,
            error: None,
            resumable: true,
            num_chunks: None,
            created_at,
            completed_at: None,
        }
    }

    fn chunk(task_id: &str, index: usize, range: (u64, u64), downloaded: u64) -> ChunkRecord {
        ChunkRecord {
            task_id: task_id.to_string(),
            chunk_index: index,
            range_start: range.0,
            range_end: range.1,
            downloaded,
            state: ChunkState::Pending,
            temp_file: format!("/tmp/{}/chunk_{}", task_id, index),
        }
    }

    #[test]
    fn test_save_and_load_tasks_in_creation_order() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.save_task(&record("b", 20, TaskStatus::Queued)).unwrap();
        store.save_task(&record("a", 10, TaskStatus::Paused)).unwrap();
        store.save_task(&record("c", 20, TaskStatus::Downloading)).unwrap();

        let ids: Vec<String> = store.load_tasks().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_update_keeps_chunks() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let mut rec = record("t", 1, TaskStatus::Downloading);
        store.save_task(&rec).unwrap();
        store
            .save_chunks("t", &[chunk("t", 0, (0, 500), 100), chunk("t", 1, (500, 1000), 0)])
            .unwrap();

        rec.downloaded_bytes = 100;
        rec.status = TaskStatus::Paused;
        rec.error = Some("x".to_string());
        store.save_task(&rec).unwrap();

        let loaded = store.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], rec);
        assert_eq!(store.load_chunks("t").unwrap().len(), 2);
    }

    #[test]
    fn test_save_chunks_replaces_list() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.save_task(&record("t", 1, TaskStatus::Downloading)).unwrap();
        store
            .save_chunks("t", &[chunk("t", 0, (0, 500), 0), chunk("t", 1, (500, 1000), 0)])
            .unwrap();
        store.save_chunks("t", &[chunk("t", 0, (0, 1000), 700)]).unwrap();

        let chunks = store.load_chunks("t").unwrap();
        assert_eq!(chunks, vec![chunk("t", 0, (0, 1000), 700)]);
    }

    #[test]
    fn test_delete_removes_task_and_chunks() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.save_task(&record("t", 1, TaskStatus::Paused)).unwrap();
        store.save_chunks("t", &[chunk("t", 0, (0, 1000), 10)]).unwrap();

        store.delete_task("t").unwrap();
        assert!(store.load_tasks().unwrap().is_empty());
        assert!(store.load_chunks("t").unwrap().is_empty());
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data/downloads.db");
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.save_task(&record("t", 1, TaskStatus::Queued)).unwrap();
        }
        let store = SqliteTaskStore::open(&path).unwrap();
        assert_eq!(store.load_tasks().unwrap()[0].id, "t");
    }
}
