//! 任务存储
//!
//! TaskStore 只要求条件写入语义：`transition(id, from, update)` 仅当当前状态属于 `from` 时生效，
//! 因此终态行不会被覆盖。提供内存实现与 SQLite 实现（单连接 + spawn_blocking）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;
use tracing::info;

use super::task::{Task, TaskId, TaskStatus, TaskUpdate};
use crate::core::OrchestratorError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), OrchestratorError>;

    async fn get(&self, id: &str) -> Result<Option<Task>, OrchestratorError>;

    /// 条件迁移；返回是否实际写入
    async fn transition(
        &self,
        id: &str,
        from: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, OrchestratorError>;

    /// 按创建时间升序
    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, OrchestratorError>;

    /// 删除 completed_at 早于 cutoff 的终态任务，返回删除数
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OrchestratorError>;
}

/// 内存存储（进程退出即丢失）
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), OrchestratorError> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, OrchestratorError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        from: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if from.contains(&task.status) => {
                task.apply(&update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, OrchestratorError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.is_finished() && t.completed_at.is_some_and(|c| c < cutoff)));
        Ok(before - tasks.len())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    request TEXT NOT NULL,
    result TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_completed_at ON tasks(completed_at);
";

const SELECT_COLUMNS: &str =
    "id, status, request, result, error, created_at, started_at, completed_at, updated_at";

/// SQLite 存储：时间戳以毫秒存储，请求与结果以 JSON 文本存储
#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Task store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, OrchestratorError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, OrchestratorError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Connection) -> Result<T, OrchestratorError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| OrchestratorError::Storage("task store connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("task store worker failed: {}", e)))?
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn conversion_error(idx: usize, err: Box<dyn std::error::Error + Send + Sync>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(1)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| conversion_error(1, e.into()))?;
    let request: String = row.get(2)?;
    let request = serde_json::from_str(&request).map_err(|e| conversion_error(2, Box::new(e)))?;
    let result: Option<String> = row.get(3)?;
    let result = result
        .map(|r| serde_json::from_str(&r))
        .transpose()
        .map_err(|e| conversion_error(3, Box::new(e)))?;

    Ok(Task {
        id: row.get(0)?,
        status,
        request,
        result,
        error: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        updated_at: from_millis(row.get(8)?),
    })
}

/// 状态枚举值拼成 IN 列表；取值固定，不含外部输入
fn status_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), OrchestratorError> {
        let request = serde_json::to_string(&task.request)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, request, result, error, created_at, started_at, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id,
                    task.status.as_str(),
                    request,
                    result,
                    task.error,
                    millis(task.created_at),
                    task.started_at.map(millis),
                    task.completed_at.map(millis),
                    millis(task.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, OrchestratorError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM tasks WHERE id = ?1", SELECT_COLUMNS);
            Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
        })
        .await
    }

    async fn transition(
        &self,
        id: &str,
        from: &[TaskStatus],
        update: TaskUpdate,
    ) -> Result<bool, OrchestratorError> {
        if from.is_empty() {
            return Ok(false);
        }
        let id = id.to_string();
        let from = status_list(from);
        let result = update.result.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE tasks SET
                    status = ?1,
                    result = COALESCE(?2, result),
                    error = COALESCE(?3, error),
                    started_at = CASE WHEN ?1 = 'Processing' THEN ?4 ELSE started_at END,
                    completed_at = CASE WHEN ?1 IN ({terminal}) THEN ?4 ELSE completed_at END,
                    updated_at = ?4
                 WHERE id = ?5 AND status IN ({from})",
                terminal = status_list(&TaskStatus::TERMINAL),
                from = from,
            );
            let changed = conn.execute(
                &sql,
                params![
                    update.status.as_str(),
                    result,
                    update.error,
                    millis(update.at),
                    id,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, OrchestratorError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let statuses = status_list(statuses);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM tasks WHERE status IN ({}) ORDER BY created_at ASC",
                SELECT_COLUMNS, statuses
            );
            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        let cutoff = millis(cutoff);
        self.with_conn(move |conn| {
            let sql = format!(
                "DELETE FROM tasks WHERE status IN ({}) AND completed_at < ?1",
                status_list(&TaskStatus::TERMINAL)
            );
            Ok(conn.execute(&sql, params![cutoff])?)
        })
        .await
    }
}
