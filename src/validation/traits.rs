//! 校验器抽象
//!
//! 所有校验策略实现 Validator（name / validate）。validate 是异步的：AI 辅助校验器会挂起在嵌套调用上。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::OrchestratorError;
use crate::llm::RawResponse;

/// 单次校验结果；返回后不再修改
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub debug_info: Map<String, Value>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_debug(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.debug_info.insert(key.into(), value.into());
        self
    }
}

/// 校验器执行失败（区别于「校验不通过」）
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("{0}")]
    Failed(String),

    /// 嵌套调用失败；RecursionLimit 会被链路原样上抛
    #[error("nested call failed: {0}")]
    Nested(#[from] OrchestratorError),
}

/// 校验时的请求上下文
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub target: &'a str,
    pub attempt: u32,
    pub depth: u32,
}

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(
        &self,
        response: &RawResponse,
        ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError>;
}
