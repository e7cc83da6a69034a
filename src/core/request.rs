//! 声明式请求：目标模型、消息、校验要求、重试策略
//!
//! Request 提交后不再修改；可序列化，以便随异步任务一起持久化。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::OrchestratorError;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 校验器声明：按名称从注册表解析
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ValidatorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// TOOL_ASSISTED 阶段注入的调试工具
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DebugTool {
    pub name: String,
    #[serde(default)]
    pub mcp_config: Value,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_initial_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_feedback_on_retry() -> bool {
    true
}

/// 重试策略（延迟单位：秒）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default)]
    pub max_attempts_before_tool_use: Option<u32>,
    #[serde(default)]
    pub max_attempts_before_human: Option<u32>,
    #[serde(default)]
    pub debug_tool: Option<DebugTool>,
    /// 校验失败后把失败响应和纠正提示追加到下一次尝试的消息里
    #[serde(default = "default_feedback_on_retry")]
    pub feedback_on_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_factor: default_backoff_factor(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            max_attempts_before_tool_use: None,
            max_attempts_before_human: None,
            debug_tool: None,
            feedback_on_retry: default_feedback_on_retry(),
        }
    }
}

impl RetryPolicy {
    /// 无等待的策略，测试与嵌套校验调用常用
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: 0.0,
            max_delay: 0.0,
            ..Self::default()
        }
    }

    pub fn with_tool_threshold(mut self, threshold: u32, tool: DebugTool) -> Self {
        self.max_attempts_before_tool_use = Some(threshold);
        self.debug_tool = Some(tool);
        self
    }

    pub fn with_human_threshold(mut self, threshold: u32) -> Self {
        self.max_attempts_before_human = Some(threshold);
        self
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_attempts == 0 {
            return Err(OrchestratorError::Configuration(
                "retry_policy.max_attempts must be >= 1".to_string(),
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(OrchestratorError::Configuration(format!(
                "retry_policy.backoff_factor must be >= 1, got {}",
                self.backoff_factor
            )));
        }
        for (name, secs) in [
            ("initial_delay", self.initial_delay),
            ("max_delay", self.max_delay),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(OrchestratorError::Configuration(format!(
                    "retry_policy.{} must be a non-negative, representable number of seconds, got {}",
                    name, secs
                )));
            }
        }
        if self.max_attempts_before_tool_use.is_some() && self.debug_tool.is_none() {
            return Err(OrchestratorError::Configuration(
                "retry_policy.max_attempts_before_tool_use requires debug_tool".to_string(),
            ));
        }
        if let Some(tool) = &self.debug_tool {
            if tool.mcp_config.is_null() {
                return Err(OrchestratorError::Configuration(format!(
                    "retry_policy.debug_tool '{}' has no mcp_config",
                    tool.name
                )));
            }
        }
        Ok(())
    }

    /// 第 attempt 次失败后的等待时间：min(max_delay, initial_delay * factor^(attempt-1))
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay * self.backoff_factor.powi(exp);
        let secs = if raw.is_finite() {
            raw.min(self.max_delay)
        } else {
            self.max_delay
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// 一次编排请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// 形如 `provider/model`；缺失时在路由阶段报配置错误
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub validation: Vec<ValidatorSpec>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub extra_params: Map<String, Value>,
    #[serde(default)]
    pub response_format: Option<Value>,
}

impl Request {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            messages: Vec::new(),
            validation: Vec::new(),
            retry_policy: RetryPolicy::default(),
            extra_params: Map::new(),
            response_format: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_validator(mut self, spec: ValidatorSpec) -> Self {
        self.validation.push(spec);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }

    pub fn with_response_format(mut self, format: Value) -> Self {
        self.response_format = Some(format);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_factor: 2.0,
            initial_delay: 1.0,
            max_delay: 10.0,
            ..RetryPolicy::default()
        };
        let delays: Vec<Duration> = (1..=10).map(|a| policy.delay_for(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert_eq!(delays[9], Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert!(RetryPolicy::default().validate().is_ok());

        let zero = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());

        let shrinking = RetryPolicy {
            backoff_factor: 0.5,
            ..RetryPolicy::default()
        };
        assert!(shrinking.validate().is_err());

        let negative = RetryPolicy {
            initial_delay: -1.0,
            ..RetryPolicy::default()
        };
        assert!(negative.validate().is_err());

        let no_tool = RetryPolicy {
            max_attempts_before_tool_use: Some(2),
            ..RetryPolicy::default()
        };
        assert!(no_tool.validate().is_err());

        let null_tool = RetryPolicy::default().with_tool_threshold(
            2,
            DebugTool {
                name: "debugger".to_string(),
                mcp_config: Value::Null,
            },
        );
        assert!(null_tool.validate().is_err());

        let huge = RetryPolicy {
            initial_delay: 1e20,
            max_delay: 1e20,
            ..RetryPolicy::default()
        };
        assert!(huge.validate().is_err());

        let infinite = RetryPolicy {
            max_delay: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert!(infinite.validate().is_err());
    }

    #[test]
    fn test_backoff_saturates_instead_of_panicking() {
        let policy = RetryPolicy {
            initial_delay: 1e20,
            max_delay: 1e20,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(2), Duration::MAX);

        let growing = RetryPolicy {
            initial_delay: 1.0,
            max_delay: f64::MAX,
            ..RetryPolicy::default()
        };
        assert_eq!(growing.delay_for(200), Duration::MAX);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{
            "target": "openai/gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "validation": [{"name": "response_not_empty"}]
        }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.target.as_deref(), Some("openai/gpt-4"));
        assert_eq!(req.messages[0].role, Role::User);
        assert_eq!(req.validation[0].name, "response_not_empty");
        assert!(req.validation[0].params.is_empty());
        assert_eq!(req.retry_policy, RetryPolicy::default());
        assert!(req.retry_policy.feedback_on_retry);
    }

    #[test]
    fn test_request_without_target_parses() {
        let req: Request = serde_json::from_str(r#"{"messages": []}"#).unwrap();
        assert!(req.target.is_none());
    }
}
