//! 重试 / 升级编排器
//!
//! 每次尝试：路由 → 熔断准入 → 带硬超时的 Provider 调用 → 校验链。
//! 失败交给 RecoveryEngine 决定转人工、终止或退避重试；同一请求内的尝试严格串行。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::builder::OrchestratorBuilder;
use crate::core::circuit_breaker::CircuitBreaker;
use crate::core::error::{OrchestratorError, ProviderError, RecoveryAction};
use crate::core::recovery::RecoveryEngine;
use crate::core::request::{Message, Request, RetryPolicy};
use crate::core::state::{RetryContext, Stage};
use crate::llm::{ProviderRegistry, RawResponse, Router};
use crate::tools::{ToolConfigLease, ToolConfigProvider};
use crate::validation::{run_chain, NestedCaller, ValidationContext, Validator, ValidatorDeps, ValidatorRegistry};

/// 编排入口：顶层调用、异步任务与 AI 校验器的嵌套调用共用
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute_request(
        &self,
        request: Request,
        depth: u32,
        cancel: CancellationToken,
    ) -> Result<RawResponse, OrchestratorError>;
}

/// 成功结果及其重试上下文
#[derive(Debug, Clone)]
pub struct Completion {
    pub response: RawResponse,
    pub context: RetryContext,
}

pub(crate) struct OrchestratorInner {
    pub(crate) router: Router,
    pub(crate) providers: ProviderRegistry,
    pub(crate) validators: Arc<ValidatorRegistry>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) tools: Arc<dyn ToolConfigProvider>,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) max_depth: u32,
}

/// 编排器：内部共享，clone 代价很低
#[derive(Clone)]
pub struct RetryOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl RetryOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub(crate) fn from_inner(inner: OrchestratorInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn validators(&self) -> &Arc<ValidatorRegistry> {
        &self.inner.validators
    }

    pub fn max_depth(&self) -> u32 {
        self.inner.max_depth
    }

    pub async fn execute(&self, request: Request) -> Result<RawResponse, OrchestratorError> {
        self.execute_cancellable(request, CancellationToken::new())
            .await
    }

    /// 取消在每次尝试前与退避等待中生效；在途的 Provider 调用不会被中断
    pub async fn execute_cancellable(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> Result<RawResponse, OrchestratorError> {
        self.run(request, 0, cancel).await.map(|c| c.response)
    }

    /// 完整执行并返回重试上下文
    pub async fn run(
        &self,
        request: Request,
        depth: u32,
        cancel: CancellationToken,
    ) -> Result<Completion, OrchestratorError> {
        let inner = &self.inner;
        if depth > inner.max_depth {
            return Err(OrchestratorError::RecursionLimit {
                depth,
                max: inner.max_depth,
            });
        }
        request.retry_policy.validate()?;
        // 配置错误在进入重试循环前暴露
        inner.router.resolve(&request)?;
        let target = request
            .target
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();

        let caller = NestedCaller::new(Arc::new(self.clone()), depth, inner.max_depth);
        let validators = inner
            .validators
            .resolve_chain(&request.validation, &ValidatorDeps::with_caller(caller))?;

        let mut ctx = RetryContext::new(target, depth);
        let mut lease = None;
        let outcome = self
            .attempt_loop(&request, &validators, &mut ctx, &mut lease, &cancel)
            .await;

        if let Some(lease) = lease {
            inner.tools.release(lease.handle).await;
        }

        let response = outcome?;
        info!(
            route = %ctx.target,
            attempts = ctx.attempt_count,
            stage = %ctx.stage,
            depth,
            "Request succeeded"
        );
        Ok(Completion {
            response,
            context: ctx,
        })
    }

    async fn attempt_loop(
        &self,
        request: &Request,
        validators: &[Arc<dyn Validator>],
        ctx: &mut RetryContext,
        lease: &mut Option<ToolConfigLease>,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, OrchestratorError> {
        let inner = &self.inner;
        let policy = &request.retry_policy;
        let target = ctx.target.clone();
        let mut conversation = request.messages.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled {
                    attempts: ctx.attempt_count,
                });
            }
            let (family, mut params) = inner.router.resolve(request)?;
            params.messages = conversation.clone();
            if let Some(lease) = lease.as_ref() {
                params.tool_config = Some(lease.config.clone());
            }
            let provider = inner.providers.get(family)?;

            // 被熔断拒绝的调用不计入尝试次数
            if let Err(rejected) = inner.breaker.try_acquire(&target) {
                warn!(route = %target, attempts = ctx.attempt_count, circuit_state = %rejected.state, "Circuit rejected call");
                return Err(OrchestratorError::CircuitOpen {
                    target: target.clone(),
                    retry_after: rejected.retry_after,
                    attempts: ctx.attempt_count,
                    stage: ctx.stage,
                });
            }
            let slot = BreakerSlot::new(&inner.breaker, &target);
            let attempt = ctx.begin_attempt();

            debug!(
                route = %target,
                attempt,
                stage = %ctx.stage,
                provider = provider.name(),
                tool_assisted = params.tool_config.is_some(),
                "Calling provider"
            );
            let result = tokio::time::timeout(params.timeout, provider.complete(&params))
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::timeout(format!(
                        "provider call exceeded {:?}",
                        params.timeout
                    )))
                });

            slot.settle();

            let failure = match result {
                Ok(response) => {
                    inner.breaker.record_success(&target);
                    ctx.last_response = Some(response.clone());

                    let vctx = ValidationContext {
                        target: &target,
                        attempt,
                        depth: ctx.depth,
                    };
                    let verdict = run_chain(validators, &response, &vctx).await?;
                    if verdict.valid {
                        return Ok(response);
                    }

                    let error = verdict
                        .error
                        .clone()
                        .unwrap_or_else(|| "validation failed".to_string());
                    warn!(route = %target, attempt, stage = %ctx.stage, error = %error, "Response failed validation");
                    if policy.feedback_on_retry {
                        conversation.push(Message::assistant(response.content.clone()));
                        conversation.push(Message::user(inner.recovery.correction_prompt(&verdict)));
                    }
                    format!("validation failed: {}", error)
                }
                Err(err) => {
                    if inner.breaker.is_excluded(err.kind) {
                        inner.breaker.release(&target);
                    } else {
                        inner.breaker.record_failure(&target);
                    }
                    if !err.retryable {
                        warn!(route = %target, attempt, error = %err, "Non-retryable provider error");
                        return Err(OrchestratorError::Provider {
                            source: err,
                            attempts: attempt,
                            stage: ctx.stage,
                        });
                    }
                    warn!(route = %target, attempt, stage = %ctx.stage, error = %err, "Provider call failed");
                    err.to_string()
                }
            };

            ctx.record_error(failure.clone());
            match inner.recovery.decide(policy, ctx) {
                RecoveryAction::EscalateToHuman => {
                    ctx.advance_stage(Stage::HumanReview);
                    info!(route = %target, attempts = attempt, "Escalating to human review");
                    return Err(OrchestratorError::HumanReviewNeeded(Box::new(ctx.clone())));
                }
                RecoveryAction::Abort => {
                    warn!(route = %target, attempts = attempt, stage = %ctx.stage, "Retries exhausted");
                    return Err(OrchestratorError::Exhausted {
                        attempts: attempt,
                        stage: ctx.stage,
                        last_error: failure,
                        context: Box::new(ctx.clone()),
                    });
                }
                RecoveryAction::Retry { delay, enable_tool } => {
                    if enable_tool {
                        self.enter_tool_stage(policy, ctx, &mut conversation, lease)
                            .await?;
                    }
                    debug!(route = %target, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(OrchestratorError::Cancelled { attempts: attempt });
                        }
                    }
                }
            }
        }
    }

    async fn enter_tool_stage(
        &self,
        policy: &RetryPolicy,
        ctx: &mut RetryContext,
        conversation: &mut Vec<Message>,
        lease: &mut Option<ToolConfigLease>,
    ) -> Result<(), OrchestratorError> {
        let Some(tool) = policy.debug_tool.as_ref() else {
            return Ok(());
        };
        if !ctx.advance_stage(Stage::ToolAssisted) {
            return Ok(());
        }
        let acquired = self.inner.tools.acquire(&ctx.target, tool).await?;
        *lease = Some(acquired);
        if policy.feedback_on_retry {
            conversation.push(Message::user(self.inner.recovery.tool_hint(&tool.name)));
        }
        info!(
            route = %ctx.target,
            attempt = ctx.attempt_count,
            tool = %tool.name,
            "Entering TOOL_ASSISTED stage"
        );
        Ok(())
    }
}

/// 准入后、记录结果前的熔断名额；调用被放弃（panic 或 future 被丢弃）时归还
struct BreakerSlot<'a> {
    breaker: &'a CircuitBreaker,
    target: &'a str,
    settled: bool,
}

impl<'a> BreakerSlot<'a> {
    fn new(breaker: &'a CircuitBreaker, target: &'a str) -> Self {
        Self {
            breaker,
            target,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for BreakerSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(circuit = %self.target, "Provider call abandoned, releasing breaker slot");
            self.breaker.release(self.target);
        }
    }
}

#[async_trait]
impl RequestExecutor for RetryOrchestrator {
    async fn execute_request(
        &self,
        request: Request,
        depth: u32,
        cancel: CancellationToken,
    ) -> Result<RawResponse, OrchestratorError> {
        self.run(request, depth, cancel).await.map(|c| c.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::core::request::{DebugTool, ValidatorSpec};
    use crate::core::ProviderErrorKind;
    use crate::llm::{CallParameters, Provider, ProviderFamily, ScriptedProvider};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn orchestrator(provider: Arc<ScriptedProvider>) -> RetryOrchestrator {
        RetryOrchestrator::builder()
            .with_provider(ProviderFamily::Generic, provider.clone())
            .with_provider(ProviderFamily::AgentProxy, provider)
            .build()
    }

    fn request() -> Request {
        Request::new("openai/gpt-4")
            .with_message(Message::user("give me json"))
            .with_validator(ValidatorSpec::new("json_string"))
    }

    #[tokio::test]
    async fn test_succeeds_first_attempt() {
        let provider = Arc::new(ScriptedProvider::always_ok(r#"{"ok": true}"#));
        let orch = orchestrator(provider.clone());
        let done = orch
            .run(request().with_policy(RetryPolicy::immediate(3)), 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(done.context.attempt_count, 1);
        assert_eq!(done.context.stage, Stage::Initial);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_feedback_messages_appended_after_validation_failure() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Ok(RawResponse::text("not json")),
            Ok(RawResponse::text("{}")),
        ]));
        let orch = orchestrator(provider.clone());
        orch.execute(request().with_policy(RetryPolicy::immediate(3)))
            .await
            .unwrap();

        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].messages.len(), 1);
        assert_eq!(calls[1].messages.len(), 3);
        assert_eq!(calls[1].messages[1], Message::assistant("not json"));
        assert!(calls[1].messages[2].content.contains("failed validation"));
    }

    #[tokio::test]
    async fn test_feedback_disabled_keeps_messages() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Ok(RawResponse::text("not json")),
            Ok(RawResponse::text("{}")),
        ]));
        let orch = orchestrator(provider.clone());
        let policy = RetryPolicy {
            feedback_on_retry: false,
            ..RetryPolicy::immediate(3)
        };
        orch.execute(request().with_policy(policy)).await.unwrap();
        assert_eq!(provider.calls()[1].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let provider = Arc::new(ScriptedProvider::always_err(ProviderError::authentication(
            "bad key",
        )));
        let orch = orchestrator(provider.clone());
        let err = orch
            .execute(request().with_policy(RetryPolicy::immediate(5)))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Provider { source, attempts, .. } => {
                assert_eq!(source.kind, ProviderErrorKind::Authentication);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.call_count(), 1);
        let snapshot = orch.breaker().snapshot("openai/gpt-4").unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_provider_timeout_is_retryable() {
        let provider = Arc::new(ScriptedProvider::always_ok("{}").with_delay(Duration::from_millis(200)));
        let orch = orchestrator(provider.clone());
        let req = request()
            .with_param("timeout", 0.02)
            .with_policy(RetryPolicy::immediate(2));
        let err = orch.execute(req).await.unwrap_err();
        match err {
            OrchestratorError::Exhausted { attempts, last_error, .. } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timeout"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_policy_and_unknown_validator_fail_before_calls() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone());

        let bad_policy = request().with_policy(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        });
        assert!(matches!(
            orch.execute(bad_policy).await,
            Err(OrchestratorError::Configuration(_))
        ));

        let unknown = request().with_validator(ValidatorSpec::new("nope"));
        assert!(matches!(
            orch.execute(unknown).await,
            Err(OrchestratorError::Configuration(_))
        ));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let provider = Arc::new(ScriptedProvider::always_ok("not json"));
        let orch = orchestrator(provider.clone());
        let policy = RetryPolicy {
            initial_delay: 10.0,
            max_delay: 10.0,
            ..RetryPolicy::default()
        };
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let err = orch
            .execute_cancellable(request().with_policy(policy), token)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled { attempts: 1 }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_tool_lease_released_on_terminal_outcome() {
        let provider = Arc::new(ScriptedProvider::always_ok("not json"));
        let tools = Arc::new(crate::tools::PolicyToolConfigProvider::new());
        let orch = RetryOrchestrator::builder()
            .with_provider(ProviderFamily::Generic, provider.clone())
            .with_tool_provider(tools.clone())
            .build();
        let policy = RetryPolicy::immediate(3).with_tool_threshold(
            1,
            DebugTool {
                name: "debugger".into(),
                mcp_config: json!({"servers": {}}),
            },
        );
        let err = orch.execute(request().with_policy(policy)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Exhausted { .. }));
        assert_eq!(tools.outstanding(), 0);

        let calls = provider.calls();
        assert!(calls[0].tool_config.is_none());
        assert!(calls[1].tool_config.is_some());
    }

    #[tokio::test]
    async fn test_depth_above_max_is_rejected() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = orchestrator(provider.clone());
        let err = orch
            .run(request(), 4, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RecursionLimit { depth: 4, max: 3 }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_backoff_is_configuration_error() {
        let provider = Arc::new(ScriptedProvider::always_err(ProviderError::server("down")));
        let orch = orchestrator(provider.clone());
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay: 1e20,
            max_delay: 1e20,
            ..RetryPolicy::default()
        };
        let err = orch.execute(request().with_policy(policy)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_circuit_rejection_is_not_counted_as_attempt() {
        let provider = Arc::new(ScriptedProvider::always_err(ProviderError::server("down")));
        let orch = RetryOrchestrator::builder()
            .with_provider(ProviderFamily::Generic, provider.clone())
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            })
            .build();

        // 第 1 次尝试失败后熔断打开，第 2 次在准入阶段被拒
        let err = orch
            .execute(request().with_policy(RetryPolicy::immediate(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { attempts: 1, .. }));
        assert_eq!(provider.call_count(), 1);

        let err = orch
            .execute(request().with_policy(RetryPolicy::immediate(3)))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CircuitOpen { attempts: 0, .. }));
        assert_eq!(provider.call_count(), 1);
    }

    struct PanicOnTrial {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Provider for PanicOnTrial {
        fn name(&self) -> &str {
            "panic-on-trial"
        }

        async fn complete(&self, _params: &CallParameters) -> Result<RawResponse, ProviderError> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ProviderError::server("down")),
                1 => panic!("provider bug"),
                _ => Ok(RawResponse::text(r#"{"ok": true}"#)),
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_trial_releases_half_open_slot() {
        let provider = Arc::new(PanicOnTrial {
            calls: AtomicUsize::new(0),
        });
        let orch = RetryOrchestrator::builder()
            .with_provider(ProviderFamily::Generic, provider.clone())
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(30),
                ..CircuitBreakerConfig::default()
            })
            .build();
        let policy = RetryPolicy::immediate(1);

        assert!(orch
            .execute(request().with_policy(policy.clone()))
            .await
            .is_err());
        assert_eq!(orch.breaker().state("openai/gpt-4"), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let trial = orch.clone();
        let req = request().with_policy(policy.clone());
        let joined = tokio::spawn(async move { trial.execute(req).await }).await;
        assert!(joined.unwrap_err().is_panic());

        let response = orch.execute(request().with_policy(policy)).await.unwrap();
        assert_eq!(response.content, r#"{"ok": true}"#);
        assert_eq!(orch.breaker().state("openai/gpt-4"), CircuitState::Closed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
