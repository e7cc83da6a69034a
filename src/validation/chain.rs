//! 校验链：按声明顺序执行，首个失败即短路
//!
//! 校验器返回 Err 或 panic 都被转为失败结果（debug_info 标明是哪个校验器），
//! 唯一例外是嵌套调用的 RecursionLimit，它作为硬错误上抛。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::traits::{ValidationContext, ValidationResult, Validator, ValidatorError};
use crate::core::OrchestratorError;
use crate::llm::RawResponse;

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub async fn run_chain(
    validators: &[Arc<dyn Validator>],
    response: &RawResponse,
    ctx: &ValidationContext<'_>,
) -> Result<ValidationResult, OrchestratorError> {
    for validator in validators {
        let name = validator.name().to_string();
        let outcome = AssertUnwindSafe(validator.validate(response, ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(ValidatorError::Nested(err @ OrchestratorError::RecursionLimit { .. }))) => {
                return Err(err);
            }
            Ok(Err(err)) => {
                warn!(validator = %name, error = %err, "Validator raised an error");
                ValidationResult::fail(format!("validator '{}' raised: {}", name, err))
                    .with_debug("exception", err.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(validator = %name, panic = %message, "Validator panicked");
                ValidationResult::fail(format!("validator '{}' panicked: {}", name, message))
                    .with_debug("exception", message)
            }
        };

        debug!(
            validator = %name,
            valid = result.valid,
            attempt = ctx.attempt,
            "Validator finished"
        );
        if !result.valid {
            return Ok(result.with_debug("validator", Value::String(name)));
        }
    }
    Ok(ValidationResult::ok().with_debug("validators_run", validators.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::builtin::{JsonString, ResponseNotEmpty};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Validator for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn validate(
            &self,
            _response: &RawResponse,
            _ctx: &ValidationContext<'_>,
        ) -> Result<ValidationResult, ValidatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ValidationResult::ok())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Validator for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn validate(
            &self,
            _response: &RawResponse,
            _ctx: &ValidationContext<'_>,
        ) -> Result<ValidationResult, ValidatorError> {
            panic!("validator bug");
        }
    }

    struct Erroring(fn() -> ValidatorError);

    #[async_trait]
    impl Validator for Erroring {
        fn name(&self) -> &str {
            "erroring"
        }

        async fn validate(
            &self,
            _response: &RawResponse,
            _ctx: &ValidationContext<'_>,
        ) -> Result<ValidationResult, ValidatorError> {
            Err((self.0)())
        }
    }

    fn ctx() -> ValidationContext<'static> {
        ValidationContext {
            target: "openai/gpt-4",
            attempt: 1,
            depth: 0,
        }
    }

    #[tokio::test]
    async fn test_short_circuits_on_first_failure() {
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let chain: Vec<Arc<dyn Validator>> =
            vec![Arc::new(JsonString), counting.clone()];
        let result = run_chain(&chain, &RawResponse::text("not json"), &ctx())
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.debug_info["validator"], "json_string");
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_pass() {
        let chain: Vec<Arc<dyn Validator>> = vec![Arc::new(ResponseNotEmpty), Arc::new(JsonString)];
        let result = run_chain(&chain, &RawResponse::text("{}"), &ctx())
            .await
            .unwrap();
        assert!(result.valid);
        assert_eq!(result.debug_info["validators_run"], 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_failing_result() {
        let chain: Vec<Arc<dyn Validator>> = vec![Arc::new(Panicking)];
        let result = run_chain(&chain, &RawResponse::text("x"), &ctx())
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.debug_info["validator"], "panicking");
        assert!(result.error.unwrap().contains("validator bug"));
    }

    #[tokio::test]
    async fn test_error_becomes_failing_result() {
        let chain: Vec<Arc<dyn Validator>> =
            vec![Arc::new(Erroring(|| ValidatorError::Failed("broken".into())))];
        let result = run_chain(&chain, &RawResponse::text("x"), &ctx())
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.debug_info["validator"], "erroring");
    }

    #[tokio::test]
    async fn test_recursion_limit_propagates() {
        let chain: Vec<Arc<dyn Validator>> = vec![Arc::new(Erroring(|| {
            ValidatorError::Nested(OrchestratorError::RecursionLimit { depth: 4, max: 3 })
        }))];
        let err = run_chain(&chain, &RawResponse::text("x"), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RecursionLimit { .. }));
    }
}
