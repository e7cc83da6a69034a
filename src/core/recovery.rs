//! 错误恢复引擎
//!
//! 每次尝试失败后，按重试策略与上下文决定下一步：转人工 / 终止 / 退避重试（可能进入 TOOL_ASSISTED）。
//! 规则依次为：人工阈值 > 工具阈值 > 次数上限 > 退避。工具阈值不是终态，命中后仍受 max_attempts 约束。

use crate::core::request::RetryPolicy;
use crate::core::state::{RetryContext, Stage};
use crate::core::RecoveryAction;
use crate::validation::ValidationResult;

/// 失败尝试 → RecoveryAction
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(&self, policy: &RetryPolicy, ctx: &RetryContext) -> RecoveryAction {
        let attempt = ctx.attempt_count;

        if let Some(threshold) = policy.max_attempts_before_human {
            if attempt >= threshold {
                return RecoveryAction::EscalateToHuman;
            }
        }

        let enable_tool = ctx.stage == Stage::Initial
            && policy.debug_tool.is_some()
            && policy
                .max_attempts_before_tool_use
                .is_some_and(|threshold| attempt >= threshold);

        if attempt >= policy.max_attempts {
            return RecoveryAction::Abort;
        }

        RecoveryAction::Retry {
            delay: policy.delay_for(attempt),
            enable_tool,
        }
    }

    /// 校验失败后追加给模型的纠正提示
    pub fn correction_prompt(&self, result: &ValidationResult) -> String {
        let mut prompt = format!(
            "Your previous response failed validation: {}.",
            result.error.as_deref().unwrap_or("unknown reason")
        );
        if !result.suggestions.is_empty() {
            prompt.push_str("\nSuggestions:");
            for s in &result.suggestions {
                prompt.push_str("\n- ");
                prompt.push_str(s);
            }
        }
        prompt.push_str("\nPlease answer again and fix these problems.");
        prompt
    }

    /// 进入 TOOL_ASSISTED 阶段时告知模型可用的调试工具
    pub fn tool_hint(&self, tool_name: &str) -> String {
        format!(
            "Previous attempts failed. The debugging tool '{}' is now available; use it to investigate before answering.",
            tool_name
        )
    }
}
