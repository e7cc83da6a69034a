//! 异步任务管理：submit / get_status / wait / cancel
//!
//! submit 立即落一条 Pending 记录并派生后台 worker，worker 受 Semaphore 限流。
//! 所有状态迁移都走 TaskStore 的条件写入，终态记录不会被后来的 worker 覆盖。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
use super::task::{Task, TaskId, TaskStatus, TaskUpdate};
use crate::config::TasksSection;
use crate::core::{OrchestratorError, Request, RequestExecutor};
use crate::llm::RawResponse;
use crate::validation::chain::panic_message;

const INTERRUPTED_ERROR: &str = "interrupted: process stopped before the task finished";

/// 后台任务管理器
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn RequestExecutor>,
    settings: TasksSection,
    permits: Arc<Semaphore>,
    /// 运行中 / 排队中任务的取消令牌
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn RequestExecutor>,
        settings: TasksSection,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            store,
            executor,
            settings,
            permits,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// 按 [tasks] 段选择存储（db_path 非空为 SQLite，否则内存），并把上次遗留的活跃任务标记为失败
    pub async fn from_config(
        settings: &TasksSection,
        executor: Arc<dyn RequestExecutor>,
    ) -> Result<Self, OrchestratorError> {
        let store: Arc<dyn TaskStore> = match settings.store_path() {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        OrchestratorError::Storage(format!(
                            "failed to create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                Arc::new(SqliteTaskStore::open(path)?)
            }
            None => Arc::new(InMemoryTaskStore::new()),
        };
        let manager = Self::new(store, executor, settings.clone());
        let interrupted = manager.recover().await?;
        if !interrupted.is_empty() {
            warn!(count = interrupted.len(), "Marked interrupted tasks as failed");
        }
        Ok(manager)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// 持久化 Pending 记录并派生 worker；不等待调用本身
    pub async fn submit(&self, request: Request) -> Result<TaskId, OrchestratorError> {
        let task = Task::new(request);
        self.store.insert(&task).await?;

        let task_id = task.id.clone();
        let token = self.shutdown.child_token();
        self.lock_tokens().insert(task_id.clone(), token.clone());

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let permits = Arc::clone(&self.permits);
        let tokens = Arc::clone(&self.tokens);
        let id = task_id.clone();
        tokio::spawn(async move {
            run_task(store, executor, permits, &id, task.request, token).await;
            tokens
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        });

        info!(task_id = %task_id, "Task submitted");
        Ok(task_id)
    }

    /// 终态任务重复查询返回相同结果
    pub async fn get_status(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    /// 轮询直到终态；超时只放弃等待，任务继续执行
    pub async fn wait(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<RawResponse, OrchestratorError> {
        // 超出 Instant 表示范围时视为无限等待
        let deadline = Instant::now().checked_add(timeout);
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        loop {
            let task = self.get_status(task_id).await?;
            match task.status {
                TaskStatus::Completed => {
                    return task.result.ok_or_else(|| {
                        OrchestratorError::Storage(format!(
                            "task {} completed without a result",
                            task_id
                        ))
                    })
                }
                TaskStatus::Failed => {
                    return Err(OrchestratorError::TaskFailed {
                        task_id: task.id,
                        error: task.error.unwrap_or_else(|| "unknown error".to_string()),
                    })
                }
                TaskStatus::Cancelled => return Err(OrchestratorError::TaskCancelled(task.id)),
                TaskStatus::Pending | TaskStatus::Processing => {}
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(OrchestratorError::TaskTimeout {
                            task_id: task_id.to_string(),
                            timeout,
                        });
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// 协作式取消；终态任务返回 false
    pub async fn cancel(&self, task_id: &str) -> Result<bool, OrchestratorError> {
        let task = self.get_status(task_id).await?;
        if task.is_finished() {
            debug!(task_id = %task_id, status = %task.status, "Cancel ignored for finished task");
            return Ok(false);
        }
        let cancelled = self
            .store
            .transition(
                task_id,
                &TaskStatus::ACTIVE,
                TaskUpdate::status(TaskStatus::Cancelled),
            )
            .await?;
        if cancelled {
            if let Some(token) = self.lock_tokens().remove(task_id) {
                token.cancel();
            }
            info!(task_id = %task_id, "Task cancelled");
        }
        Ok(cancelled)
    }

    /// 删除完成时间早于 now - retention 的终态任务
    pub async fn cleanup_expired(&self) -> Result<usize, OrchestratorError> {
        let hours = i64::try_from(self.settings.retention_hours).unwrap_or(i64::MAX);
        let retention = chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.delete_terminal_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "Expired tasks cleaned up");
        }
        Ok(removed)
    }

    /// 周期清理，直到 shutdown
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let every = Duration::from_secs(self.settings.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup_expired().await {
                            warn!(error = %e, "Task cleanup failed");
                        }
                    }
                }
            }
            debug!("Task sweeper stopped");
        })
    }

    /// 把存储中的 Pending / Processing 任务标记为失败（上次进程未完成）
    pub async fn recover(&self) -> Result<Vec<TaskId>, OrchestratorError> {
        let active = self.store.list_by_status(&TaskStatus::ACTIVE).await?;
        let mut interrupted = Vec::with_capacity(active.len());
        for task in active {
            let marked = self
                .store
                .transition(
                    &task.id,
                    &TaskStatus::ACTIVE,
                    TaskUpdate::failed(INTERRUPTED_ERROR),
                )
                .await?;
            if marked {
                warn!(task_id = %task.id, status = %task.status, "Task interrupted");
                interrupted.push(task.id);
            }
        }
        Ok(interrupted)
    }

    /// 用已存储的请求创建新任务
    pub async fn resubmit(&self, task_id: &str) -> Result<TaskId, OrchestratorError> {
        let task = self.get_status(task_id).await?;
        let new_id = self.submit(task.request).await?;
        info!(task_id = %task_id, new_task_id = %new_id, "Task resubmitted");
        Ok(new_id)
    }

    /// 停止清理任务并通知所有 worker 取消
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock_tokens().clear();
        info!("Task manager shut down");
    }

    /// shutdown 并等待清理任务退出；清理任务异常结束时返回 false
    pub async fn shutdown_and_join(&self, sweeper: JoinHandle<()>) -> bool {
        self.shutdown();
        match sweeper.await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Task sweeper ended abnormally");
                false
            }
        }
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_task(
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn RequestExecutor>,
    permits: Arc<Semaphore>,
    task_id: &str,
    request: Request,
    token: CancellationToken,
) {
    let _permit = tokio::select! {
        _ = token.cancelled() => {
            debug!(task_id = %task_id, "Task cancelled before start");
            return;
        }
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task_id = %task_id, "Task permits closed");
                return;
            }
        },
    };

    match store
        .transition(
            task_id,
            &[TaskStatus::Pending],
            TaskUpdate::status(TaskStatus::Processing),
        )
        .await
    {
        Ok(true) => {}
        // 排队期间已被取消
        Ok(false) => return,
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Failed to start task");
            return;
        }
    }
    info!(task_id = %task_id, "Task started");

    // worker panic 同样落为 Failed
    let outcome = AssertUnwindSafe(executor.execute_request(request, 0, token))
        .catch_unwind()
        .await;
    let update = match outcome {
        Ok(Ok(response)) => TaskUpdate::completed(response),
        Ok(Err(e)) => {
            warn!(task_id = %task_id, error = %e, "Task failed");
            TaskUpdate::failed(e.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(task_id = %task_id, panic = %message, "Task worker panicked");
            TaskUpdate::failed(format!("worker panicked: {}", message))
        }
    };
    let status = update.status;
    match store
        .transition(task_id, &[TaskStatus::Processing], update)
        .await
    {
        Ok(true) => info!(task_id = %task_id, status = %status, "Task finished"),
        Ok(false) => debug!(task_id = %task_id, "Task result discarded, status already final"),
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record task result"),
    }
}
