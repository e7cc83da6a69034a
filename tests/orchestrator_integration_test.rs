//! 编排器端到端测试：重试次数、阶段升级、熔断、校验器与异步任务

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use llm_relay::config::{RouterSection, TasksSection};
    use llm_relay::core::{
        CircuitBreakerConfig, CircuitState, DebugTool, Message, OrchestratorBuilder,
        OrchestratorError, ProviderError, ProviderErrorKind, Request, RetryOrchestrator,
        RetryPolicy, Stage, ValidatorSpec,
    };
    use llm_relay::llm::{ProviderFamily, Router, ScriptedProvider};
    use llm_relay::tasks::{TaskManager, TaskStatus};
    use llm_relay::tools::PolicyToolConfigProvider;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    const TARGET: &str = "openai/gpt-4";

    fn builder(provider: &Arc<ScriptedProvider>) -> OrchestratorBuilder {
        OrchestratorBuilder::new()
            .with_router(Router::with_env(
                RouterSection::default(),
                Duration::from_secs(5),
                HashMap::new(),
            ))
            .with_provider(ProviderFamily::Generic, provider.clone())
    }

    fn request(policy: RetryPolicy) -> Request {
        Request::new(TARGET)
            .with_message(Message::user("Summarise the report"))
            .with_policy(policy)
    }

    fn server_error() -> ProviderError {
        ProviderError::server("503 service unavailable")
    }

    #[tokio::test]
    async fn test_exactly_max_attempts_then_exhausted() {
        for n in 1..=4 {
            let provider = Arc::new(ScriptedProvider::always_err(server_error()));
            let orch = builder(&provider).build();
            match orch.execute(request(RetryPolicy::immediate(n))).await {
                Err(OrchestratorError::Exhausted {
                    attempts,
                    stage,
                    context,
                    ..
                }) => {
                    assert_eq!(attempts, n);
                    assert_eq!(stage, Stage::Initial);
                    assert_eq!(context.error_history.len(), n as usize);
                }
                other => panic!("expected Exhausted, got {:?}", other),
            }
            assert_eq!(provider.call_count(), n as usize);
        }
    }

    #[tokio::test]
    async fn test_tool_config_injected_from_attempt_three() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Err(server_error()),
            Err(server_error()),
            Ok(llm_relay::llm::RawResponse::text("fixed")),
        ]));
        let tools = Arc::new(PolicyToolConfigProvider::new());
        let orch = builder(&provider)
            .with_tool_provider(tools.clone())
            .build();
        let tool = DebugTool {
            name: "debugger".to_string(),
            mcp_config: json!({"servers": ["dbg"]}),
        };
        let policy = RetryPolicy::immediate(4).with_tool_threshold(2, tool);

        let completion = orch
            .run(request(policy), 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.response.content, "fixed");
        assert_eq!(completion.context.attempt_count, 3);
        assert_eq!(completion.context.stage, Stage::ToolAssisted);

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].tool_config.is_none());
        assert!(calls[1].tool_config.is_none());
        assert_eq!(calls[2].tool_config, Some(json!({"servers": ["dbg"]})));
        assert_eq!(tools.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_human_review_on_attempt_three() {
        let provider = Arc::new(ScriptedProvider::always_err(server_error()));
        let orch = builder(&provider).build();
        let policy = RetryPolicy::immediate(5).with_human_threshold(3);

        match orch.execute(request(policy)).await {
            Err(OrchestratorError::HumanReviewNeeded(ctx)) => {
                assert_eq!(ctx.attempt_count, 3);
                assert_eq!(ctx.error_history.len(), 3);
                assert_eq!(
                    ctx.stage_history.last().map(|t| t.stage),
                    Some(Stage::HumanReview)
                );
            }
            other => panic!("expected HumanReviewNeeded, got {:?}", other),
        }
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_circuit_opens_and_allows_single_trial() {
        let provider = Arc::new(
            ScriptedProvider::with_script(vec![
                Err(server_error()),
                Err(server_error()),
                Err(server_error()),
            ])
            .with_delay(Duration::from_millis(50)),
        );
        let orch = builder(&provider)
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_millis(200),
                excluded_kinds: vec![ProviderErrorKind::Authentication],
            })
            .build();

        assert!(matches!(
            orch.execute(request(RetryPolicy::immediate(3))).await,
            Err(OrchestratorError::Exhausted { .. })
        ));
        assert_eq!(orch.breaker().state(TARGET), CircuitState::Open);

        // 第 4 次调用直接失败，不触达 Provider，也不占用尝试次数
        assert!(matches!(
            orch.execute(request(RetryPolicy::immediate(3))).await,
            Err(OrchestratorError::CircuitOpen { attempts: 0, .. })
        ));
        assert_eq!(provider.call_count(), 3);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // HalfOpen：并发的两个请求只有一个能成为试探调用
        let (a, b) = tokio::join!(
            orch.execute(request(RetryPolicy::immediate(1))),
            orch.execute(request(RetryPolicy::immediate(1))),
        );
        let opened = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(OrchestratorError::CircuitOpen { .. })))
            .count();
        assert_eq!(opened, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(provider.call_count(), 4);

        let snapshot = orch.breaker().snapshot(TARGET).unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_breaker_is_keyed_by_target() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![Err(server_error())]));
        let orch = builder(&provider)
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            })
            .build();

        assert!(orch.execute(request(RetryPolicy::immediate(1))).await.is_err());
        assert_eq!(orch.breaker().state(TARGET), CircuitState::Open);

        let other = Request::new("openai/gpt-4o-mini")
            .with_message(Message::user("ping"))
            .with_policy(RetryPolicy::immediate(1));
        let response = orch.execute(other).await.unwrap();
        assert_eq!(response.content, "ping");
    }

    #[tokio::test]
    async fn test_authentication_error_does_not_trip_breaker() {
        let provider = Arc::new(ScriptedProvider::always_err(ProviderError::authentication(
            "invalid api key",
        )));
        let orch = builder(&provider)
            .with_breaker_config(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            })
            .build();

        for _ in 0..3 {
            assert!(matches!(
                orch.execute(request(RetryPolicy::immediate(3))).await,
                Err(OrchestratorError::Provider { attempts: 1, .. })
            ));
        }
        assert_eq!(orch.breaker().state(TARGET), CircuitState::Closed);
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_validator_lists_registered_names() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orch = builder(&provider).build();
        let req = request(RetryPolicy::immediate(3)).with_validator(ValidatorSpec::new("sentiment"));

        match orch.execute(req).await {
            Err(OrchestratorError::Configuration(msg)) => {
                assert!(msg.contains("sentiment"));
                assert!(msg.contains("json_string"));
                assert!(msg.contains("ai_judge"));
            }
            other => panic!("expected Configuration, got {:?}", other),
        }
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_retries_until_valid_json() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Ok(llm_relay::llm::RawResponse::text("Sure! Here it is: {broken")),
            Ok(llm_relay::llm::RawResponse::text("```json\n{\"title\": \"ok\"}\n```")),
        ]));
        let orch = builder(&provider).build();
        let req = request(RetryPolicy::immediate(3))
            .with_validator(ValidatorSpec::new("json_string"))
            .with_validator(ValidatorSpec::new("field_present").with_param("fields", json!(["title"])));

        let completion = orch
            .run(req, 0, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.context.attempt_count, 2);
        assert_eq!(completion.context.error_history.len(), 1);
        // 第二次调用带上了上一轮响应与纠正提示
        assert_eq!(provider.calls()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_ai_judge_runs_nested_request() {
        let provider = Arc::new(ScriptedProvider::with_script(vec![
            Ok(llm_relay::llm::RawResponse::text("you are wrong")),
            Ok(llm_relay::llm::RawResponse::text("INVALID: not polite")),
            Ok(llm_relay::llm::RawResponse::text("thank you for asking")),
            Ok(llm_relay::llm::RawResponse::text("VALID")),
        ]));
        let orch = builder(&provider).build();
        let req = request(RetryPolicy::immediate(2))
            .with_validator(ValidatorSpec::new("ai_judge").with_param("criteria", "must be polite"));

        let response = orch.execute(req).await.unwrap();
        assert_eq!(response.content, "thank you for asking");

        let calls = provider.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[1].messages[0].content.contains("must be polite"));
        assert!(calls[2]
            .messages
            .iter()
            .any(|m| m.content.contains("not polite")));
    }

    #[tokio::test]
    async fn test_ai_judge_respects_recursion_limit() {
        let provider = Arc::new(ScriptedProvider::always_ok("answer"));
        let orch: RetryOrchestrator = builder(&provider).with_max_depth(0).build();
        let req = request(RetryPolicy::immediate(3))
            .with_validator(ValidatorSpec::new("ai_judge").with_param("criteria", "be correct"));

        match orch.execute(req).await {
            Err(OrchestratorError::RecursionLimit { depth, max }) => {
                assert_eq!(depth, 1);
                assert_eq!(max, 0);
            }
            other => panic!("expected RecursionLimit, got {:?}", other),
        }
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_task_lifecycle_with_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(
            ScriptedProvider::always_ok("background result").with_delay(Duration::from_millis(50)),
        );
        let orch = builder(&provider).build();
        let settings = TasksSection {
            db_path: Some(dir.path().join("tasks.db")),
            poll_interval_ms: 10,
            ..TasksSection::default()
        };
        let manager = TaskManager::from_config(&settings, Arc::new(orch))
            .await
            .unwrap();

        let id = manager.submit(request(RetryPolicy::immediate(1))).await.unwrap();
        let status = manager.get_status(&id).await.unwrap().status;
        assert!(matches!(status, TaskStatus::Pending | TaskStatus::Processing));

        let response = manager.wait(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.content, "background result");

        let first = manager.get_status(&id).await.unwrap();
        let second = manager.get_status(&id).await.unwrap();
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(first, second);
        assert!(!manager.cancel(&id).await.unwrap());
        assert_eq!(
            manager.get_status(&id).await.unwrap().status,
            TaskStatus::Completed
        );
        manager.shutdown();
    }
}
