//! 单个请求的重试状态
//!
//! 每个请求独占一个 RetryContext；attempt_count 只增不减，阶段只向前推进。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::RawResponse;

/// 重试阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Initial,
    ToolAssisted,
    HumanReview,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Initial => "INITIAL",
            Stage::ToolAssisted => "TOOL_ASSISTED",
            Stage::HumanReview => "HUMAN_REVIEW",
        };
        f.write_str(s)
    }
}

/// 请求的终止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Exhausted,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: Stage,
    /// 进入该阶段时的尝试序号
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// 重试上下文：错误历史、阶段历史、最后一次响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryContext {
    pub target: String,
    /// 嵌套调用深度（顶层请求为 0）
    pub depth: u32,
    pub attempt_count: u32,
    pub stage: Stage,
    pub error_history: Vec<ErrorRecord>,
    pub stage_history: Vec<StageTransition>,
    pub last_response: Option<RawResponse>,
    pub started_at: DateTime<Utc>,
}

impl RetryContext {
    pub fn new(target: impl Into<String>, depth: u32) -> Self {
        let now = Utc::now();
        Self {
            target: target.into(),
            depth,
            attempt_count: 0,
            stage: Stage::Initial,
            error_history: Vec::new(),
            stage_history: vec![StageTransition {
                stage: Stage::Initial,
                attempt: 0,
                timestamp: now,
            }],
            last_response: None,
            started_at: now,
        }
    }

    /// 开始新一次尝试，返回尝试序号（从 1 开始）
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt_count += 1;
        self.attempt_count
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.error_history.push(ErrorRecord {
            attempt: self.attempt_count,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    /// 推进阶段；只允许向前，否则返回 false 且不做修改
    pub fn advance_stage(&mut self, stage: Stage) -> bool {
        if stage <= self.stage {
            return false;
        }
        self.stage = stage;
        self.stage_history.push(StageTransition {
            stage,
            attempt: self.attempt_count,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error_history.last().map(|r| r.error.as_str())
    }
}
