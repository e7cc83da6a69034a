//! Provider 抽象
//!
//! 所有后端（OpenAI 兼容 / agent proxy / Scripted）实现 Provider：接收路由产出的 CallParameters，
//! 返回 RawResponse 或带类别的 ProviderError。单次调用的超时由编排器在外层施加。

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{Message, ProviderError};

/// Provider 家族：路由的粗粒度结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// `max/*`：本地 agent proxy
    AgentProxy,
    /// 其余目标：通用多厂商客户端
    Generic,
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderFamily::AgentProxy => f.write_str("agent_proxy"),
            ProviderFamily::Generic => f.write_str("generic"),
        }
    }
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Provider 原始响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    pub content: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// 后端返回的原始结构（调试用）
    #[serde(default)]
    pub raw: Value,
}

impl RawResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: String::new(),
            usage: None,
            raw: Value::Null,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// 路由产出的调用参数
#[derive(Debug, Clone, PartialEq)]
pub struct CallParameters {
    /// 下游模型名（如 `openai/llama-3`、`gpt-4`）
    pub model: String,
    pub messages: Vec<Message>,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub response_format: Option<Value>,
    /// TOOL_ASSISTED 阶段注入的 MCP 配置
    pub tool_config: Option<Value>,
    pub timeout: Duration,
    /// 透传给 Provider 的其余参数（temperature、vertex_project 等）
    pub extra: Map<String, Value>,
}

impl CallParameters {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            api_base: None,
            api_key: None,
            response_format: None,
            tool_config: None,
            timeout,
            extra: Map::new(),
        }
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(Value::as_f64)
    }

    pub fn extra_u64(&self, key: &str) -> Option<u64> {
        self.extra.get(key).and_then(Value::as_u64)
    }
}

/// LLM 后端 trait：一次非流式完成
#[async_trait]
pub trait Provider: Send + Sync {
    /// 日志中使用的名称
    fn name(&self) -> &str;

    async fn complete(&self, params: &CallParameters) -> Result<RawResponse, ProviderError>;
}
