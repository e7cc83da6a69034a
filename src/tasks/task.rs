//! 异步任务模型

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Request;
use crate::llm::RawResponse;

/// 任务 ID（`task_<uuid>`）
pub type TaskId = String;

/// 任务状态；终态（Completed / Failed / Cancelled）不会再回到非终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Processing];
    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Processing => "Processing",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(TaskStatus::Pending),
            "Processing" => Ok(TaskStatus::Processing),
            "Completed" => Ok(TaskStatus::Completed),
            "Failed" => Ok(TaskStatus::Failed),
            "Cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// 后台任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub request: Request,
    pub result: Option<RawResponse>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(request: Request) -> Self {
        let now = Utc::now();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            status: TaskStatus::Pending,
            request,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 应用一次状态迁移（调用方负责检查 from 状态）
    pub fn apply(&mut self, update: &TaskUpdate) {
        self.status = update.status;
        if update.status == TaskStatus::Processing {
            self.started_at = Some(update.at);
        }
        if update.status.is_terminal() {
            self.completed_at = Some(update.at);
        }
        if let Some(result) = &update.result {
            self.result = Some(result.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        self.updated_at = update.at;
    }
}

/// 条件写入的目标状态及附带数据
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result: Option<RawResponse>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn completed(result: RawResponse) -> Self {
        Self {
            result: Some(result),
            ..Self::status(TaskStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(TaskStatus::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_is_pending() {
        let task = Task::new(Request::new("openai/gpt-4"));
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_finished());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_status_round_trip_and_terminal() {
        for status in TaskStatus::ACTIVE.iter().chain(TaskStatus::TERMINAL.iter()) {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), *status);
        }
        assert!("Running".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_apply_sets_timestamps() {
        let mut task = Task::new(Request::new("openai/gpt-4"));
        task.apply(&TaskUpdate::status(TaskStatus::Processing));
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        task.apply(&TaskUpdate::completed(RawResponse::text("done")));
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_ref().unwrap().content, "done");
    }
}
