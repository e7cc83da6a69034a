//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：每次失败的尝试之后，根据 RetryPolicy 与 RetryContext
//! 决定 EscalateToHuman / Abort / Retry。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::{RetryContext, Stage};

/// Provider 错误类别（决定是否可重试、是否计入熔断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// 连接失败、DNS、连接被重置
    Network,
    /// 429 / 限流
    RateLimited,
    /// 单次调用超时
    Timeout,
    /// 5xx / 服务过载
    Server,
    /// 401 / 403，重试无意义
    Authentication,
    /// 请求本身不合法（参数、模型名等）
    InvalidRequest,
    Other,
}

impl ProviderErrorKind {
    /// 该类别默认是否可重试
    pub fn default_retryable(self) -> bool {
        !matches!(self, Self::Authentication | Self::InvalidRequest)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Server => "server",
            Self::Authentication => "authentication",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// 单次 Provider 调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Server, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Authentication, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    /// 覆盖默认的可重试判定（如某些 Provider 明确标注 500 不可重试）
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// 编排过程中对调用方可见的错误
///
/// 终止性错误都带上尝试次数与所处阶段，调用方不会只拿到一个 "failed"。
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 请求字段缺失、未知校验器、路由无法解析；不重试
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 不可重试的 Provider 错误（鉴权等），立即上抛
    #[error("Provider error on attempt {attempts} (stage {stage}): {source}")]
    Provider {
        #[source]
        source: ProviderError,
        attempts: u32,
        stage: Stage,
    },

    #[error("Circuit open for '{target}', retry after {retry_after:?} (attempt {attempts}, stage {stage})")]
    CircuitOpen {
        target: String,
        retry_after: Duration,
        attempts: u32,
        stage: Stage,
    },

    /// 需要人工介入：携带完整的 RetryContext（错误历史、最后响应、阶段历史）
    #[error(
        "Human review needed after {} attempts: {}",
        .0.attempt_count,
        .0.last_error().unwrap_or("unknown error")
    )]
    HumanReviewNeeded(Box<RetryContext>),

    #[error("Retries exhausted after {attempts} attempts (stage {stage}): {last_error}")]
    Exhausted {
        attempts: u32,
        stage: Stage,
        last_error: String,
        context: Box<RetryContext>,
    },

    /// AI 辅助校验器嵌套调用层数超限
    #[error("Recursion limit exceeded: depth {depth} > max {max}")]
    RecursionLimit { depth: u32, max: u32 },

    #[error("Request cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// 等待超时；底层任务不会被取消
    #[error("Timed out after {timeout:?} waiting for task {task_id}")]
    TaskTimeout { task_id: String, timeout: Duration },

    #[error("Task {task_id} failed: {error}")]
    TaskFailed { task_id: String, error: String },

    #[error("Task {0} was cancelled")]
    TaskCancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    /// 终止结果分类（仅对 Exhausted / HumanReviewNeeded 有意义）
    pub fn outcome(&self) -> Option<crate::core::state::Outcome> {
        use crate::core::state::Outcome;
        match self {
            Self::Exhausted { .. } => Some(Outcome::Exhausted),
            Self::HumanReviewNeeded(_) => Some(Outcome::Escalated),
            _ => None,
        }
    }

    /// 重试链路中的上下文（若有）
    pub fn retry_context(&self) -> Option<&RetryContext> {
        match self {
            Self::HumanReviewNeeded(ctx) => Some(ctx),
            Self::Exhausted { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization failed: {err}"))
    }
}

/// 恢复引擎对一次失败尝试给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 转人工：停止自动重试
    EscalateToHuman,
    /// 次数用尽，带最后一个错误终止
    Abort,
    /// 等待 delay 后重试；enable_tool 表示下一次尝试进入 TOOL_ASSISTED 阶段
    Retry { delay: Duration, enable_tool: bool },
}
