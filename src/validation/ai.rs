//! AI 辅助校验器
//!
//! 通过 NestedCaller 以 depth + 1 重新进入编排器，让另一个模型评判响应。
//! 深度超过上限时在任何 Provider 调用之前失败（RecursionLimit）。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{ValidationContext, ValidationResult, Validator, ValidatorError};
use crate::core::{Message, OrchestratorError, Request, RequestExecutor, RetryPolicy};
use crate::llm::RawResponse;

/// 嵌套调用能力：编排器入口 + 当前深度
#[derive(Clone)]
pub struct NestedCaller {
    executor: Arc<dyn RequestExecutor>,
    depth: u32,
    max_depth: u32,
}

impl NestedCaller {
    pub fn new(executor: Arc<dyn RequestExecutor>, depth: u32, max_depth: u32) -> Self {
        Self {
            executor,
            depth,
            max_depth,
        }
    }

    /// 调用方所处深度
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub async fn call(&self, request: Request) -> Result<RawResponse, OrchestratorError> {
        let next = self.depth + 1;
        if next > self.max_depth {
            return Err(OrchestratorError::RecursionLimit {
                depth: next,
                max: self.max_depth,
            });
        }
        self.executor
            .execute_request(request, next, CancellationToken::new())
            .await
    }
}

const JUDGE_PROMPT: &str = "You are a strict reviewer. Decide whether the response below satisfies the criteria.

Criteria:
{criteria}

Response:
{response}

Reply with exactly `VALID`, or `INVALID: <short reason>`.";

const CONTRADICTION_PROMPT: &str = "Check the response below for statements that contradict each other.

Response:
{response}

If there are none, reply with exactly `NONE`. Otherwise list each contradiction on its own line.";

fn nested_request(model: &str, prompt: String) -> Request {
    Request::new(model)
        .with_message(Message::user(prompt))
        .with_policy(RetryPolicy::immediate(2))
}

/// 让模型按给定标准评判：VALID / INVALID: reason
pub struct AiJudge {
    caller: NestedCaller,
    criteria: String,
    model: Option<String>,
}

impl AiJudge {
    pub const NAME: &'static str = "ai_judge";

    pub fn from_params(
        params: &Map<String, Value>,
        caller: NestedCaller,
    ) -> Result<Self, OrchestratorError> {
        let criteria = params
            .get("criteria")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                OrchestratorError::Configuration(
                    "validator 'ai_judge': 'criteria' is required".to_string(),
                )
            })?
            .to_string();
        let model = params
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            caller,
            criteria,
            model,
        })
    }
}

/// 解析评判结果
fn parse_verdict(text: &str) -> ValidationResult {
    let trimmed = text.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("INVALID") {
        let reason = trimmed
            .split_once(':')
            .map(|(_, r)| r.trim())
            .filter(|r| !r.is_empty())
            .unwrap_or("judge rejected the response");
        ValidationResult::fail(reason.to_string()).with_suggestion(reason.to_string())
    } else if upper.starts_with("VALID") {
        ValidationResult::ok()
    } else {
        ValidationResult::fail(format!("unparseable judge verdict: {}", trimmed))
    }
}

#[async_trait]
impl Validator for AiJudge {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(
        &self,
        response: &RawResponse,
        ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        let model = self.model.as_deref().unwrap_or(ctx.target);
        let prompt = JUDGE_PROMPT
            .replace("{criteria}", &self.criteria)
            .replace("{response}", &response.content);
        let verdict = self.caller.call(nested_request(model, prompt)).await?;
        debug!(model = %model, depth = self.caller.depth() + 1, verdict = %verdict.content, "ai_judge verdict");
        Ok(parse_verdict(&verdict.content).with_debug("judge_model", model))
    }
}

/// 检查响应内部是否自相矛盾
pub struct AiContradictionCheck {
    caller: NestedCaller,
    model: Option<String>,
}

impl AiContradictionCheck {
    pub const NAME: &'static str = "ai_contradiction_check";

    pub fn from_params(params: &Map<String, Value>, caller: NestedCaller) -> Self {
        Self {
            caller,
            model: params
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl Validator for AiContradictionCheck {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(
        &self,
        response: &RawResponse,
        ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        let model = self.model.as_deref().unwrap_or(ctx.target);
        let prompt = CONTRADICTION_PROMPT.replace("{response}", &response.content);
        let report = self.caller.call(nested_request(model, prompt)).await?;

        let text = report.content.trim();
        if text.is_empty() || text.to_uppercase().starts_with("NONE") {
            return Ok(ValidationResult::ok());
        }
        let found: Vec<String> = text
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*']).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let mut result =
            ValidationResult::fail(format!("found {} contradiction(s)", found.len()))
                .with_debug("contradictions", found.clone());
        for item in found {
            result = result.with_suggestion(format!("Resolve: {}", item));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 记录深度并返回固定内容的执行器
    struct FixedExecutor {
        reply: String,
        seen_depth: AtomicU32,
    }

    #[async_trait]
    impl RequestExecutor for FixedExecutor {
        async fn execute_request(
            &self,
            _request: Request,
            depth: u32,
            _cancel: CancellationToken,
        ) -> Result<RawResponse, OrchestratorError> {
            self.seen_depth.store(depth, Ordering::SeqCst);
            Ok(RawResponse::text(self.reply.clone()))
        }
    }

    fn executor(reply: &str) -> Arc<FixedExecutor> {
        Arc::new(FixedExecutor {
            reply: reply.to_string(),
            seen_depth: AtomicU32::new(0),
        })
    }

    fn ctx() -> ValidationContext<'static> {
        ValidationContext {
            target: "openai/gpt-4",
            attempt: 1,
            depth: 0,
        }
    }

    fn judge(caller: NestedCaller) -> AiJudge {
        let mut params = Map::new();
        params.insert("criteria".into(), "must be polite".into());
        AiJudge::from_params(&params, caller).unwrap()
    }

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("VALID").valid);
        assert!(parse_verdict("  valid.\n").valid);
        let r = parse_verdict("INVALID: rude tone");
        assert!(!r.valid);
        assert_eq!(r.error.as_deref(), Some("rude tone"));
        assert!(!parse_verdict("maybe").valid);
    }

    #[tokio::test]
    async fn test_judge_calls_at_next_depth() {
        let exec = executor("VALID");
        let v = judge(NestedCaller::new(exec.clone(), 1, 3));
        let r = v.validate(&RawResponse::text("thanks!"), &ctx()).await.unwrap();
        assert!(r.valid);
        assert_eq!(exec.seen_depth.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_recursion_limit_before_call() {
        let exec = executor("VALID");
        let v = judge(NestedCaller::new(exec.clone(), 3, 3));
        let err = v
            .validate(&RawResponse::text("x"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidatorError::Nested(OrchestratorError::RecursionLimit { depth: 4, max: 3 })
        ));
        assert_eq!(exec.seen_depth.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_contradiction_check() {
        let clean = AiContradictionCheck::from_params(&Map::new(), NestedCaller::new(executor("NONE"), 0, 3));
        assert!(clean.validate(&RawResponse::text("x"), &ctx()).await.unwrap().valid);

        let dirty = AiContradictionCheck::from_params(
            &Map::new(),
            NestedCaller::new(executor("- says A\n- says not A"), 0, 3),
        );
        let r = dirty.validate(&RawResponse::text("x"), &ctx()).await.unwrap();
        assert!(!r.valid);
        assert_eq!(r.suggestions.len(), 2);
    }
}
