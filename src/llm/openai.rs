//! OpenAI 兼容 Provider
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点；api_base / api_key 来自路由结果，
//! 因此同一个实例可同时服务 agent proxy、pod 与官方 API。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::core::{Message, ProviderError, ProviderErrorKind, Role};
use crate::llm::{CallParameters, Provider, RawResponse, TokenUsage};

/// OpenAI 兼容 Provider：每次调用按参数构造 Client
#[derive(Debug, Clone, Default)]
pub struct OpenAiProvider {
    /// 路由未给出凭证时使用（通常来自 OPENAI_API_KEY）
    default_api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            default_api_key: std::env::var("OPENAI_API_KEY").ok(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.default_api_key = Some(api_key.into());
        self
    }

    fn client_for(&self, params: &CallParameters) -> Client<OpenAIConfig> {
        let api_key = params
            .api_key
            .clone()
            .or_else(|| self.default_api_key.clone())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match &params.api_base {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Client::with_config(config)
    }
}

/// OpenAI 兼容端点不认 `openai/` 前缀
fn downstream_model(model: &str) -> &str {
    model.strip_prefix("openai/").unwrap_or(model)
}

fn to_openai_messages(
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, ProviderError> {
    let invalid = |e: async_openai::error::OpenAIError| ProviderError::invalid_request(e.to_string());
    messages
        .iter()
        .map(|m| {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                // 工具输出以 user 消息回传，避免依赖 tool_call_id
                Role::User | Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(invalid)?,
                ),
            };
            Ok(msg)
        })
        .collect()
}

/// 按 API 错误对象的 code / type 归类；都不认识时返回 None
fn classify_api_error(code: Option<&str>, kind: Option<&str>) -> Option<ProviderErrorKind> {
    let by_code = match code {
        Some("invalid_api_key") => Some(ProviderErrorKind::Authentication),
        Some("rate_limit_exceeded" | "insufficient_quota") => Some(ProviderErrorKind::RateLimited),
        Some("model_not_found" | "context_length_exceeded") => {
            Some(ProviderErrorKind::InvalidRequest)
        }
        _ => None,
    };
    by_code.or(match kind {
        Some("authentication_error" | "permission_error") => Some(ProviderErrorKind::Authentication),
        Some("invalid_request_error") => Some(ProviderErrorKind::InvalidRequest),
        Some("rate_limit_error") => Some(ProviderErrorKind::RateLimited),
        Some("server_error" | "api_error" | "overloaded_error") => Some(ProviderErrorKind::Server),
        _ => None,
    })
}

/// 按错误文本归类（无结构化错误对象时的兜底）
///
/// 只匹配短语，不匹配裸状态码：URL 里的端口或路径数字不应被误判。
pub fn classify_error(message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["unauthorized", "forbidden", "invalid api key", "incorrect api key", "authentication", "permission denied"]) {
        ProviderErrorKind::Authentication
    } else if has(&["rate limit", "rate_limit", "too many requests", "quota"]) {
        ProviderErrorKind::RateLimited
    } else if has(&["timed out", "timeout", "deadline"]) {
        ProviderErrorKind::Timeout
    } else if has(&["connection", "connect", "dns", "error sending request", "broken pipe", "reset by peer"]) {
        ProviderErrorKind::Network
    } else if has(&["internal server error", "overloaded", "bad gateway", "unavailable", "gateway timeout"]) {
        ProviderErrorKind::Server
    } else if has(&["invalid_request", "bad request", "model_not_found", "does not exist", "context length"]) {
        ProviderErrorKind::InvalidRequest
    } else {
        ProviderErrorKind::Other
    }
}

fn to_provider_error(err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::ApiError(api) => {
            let kind = classify_api_error(api.code.as_deref(), api.r#type.as_deref())
                .unwrap_or_else(|| classify_error(&api.message));
            ProviderError::new(kind, api.to_string())
        }
        other => {
            let message = other.to_string();
            ProviderError::new(classify_error(&message), message)
        }
    }
}

/// CallParameters → chat completion 请求体
fn build_request(params: &CallParameters) -> Result<CreateChatCompletionRequest, ProviderError> {
    let mut builder = CreateChatCompletionRequestArgs::default();
    builder
        .model(downstream_model(&params.model))
        .messages(to_openai_messages(&params.messages)?);
    if let Some(temperature) = params.extra_f64("temperature") {
        builder.temperature(temperature as f32);
    }
    if let Some(top_p) = params.extra_f64("top_p") {
        builder.top_p(top_p as f32);
    }
    if let Some(max_tokens) = params.extra_u64("max_tokens") {
        let max_tokens = u32::try_from(max_tokens).map_err(|_| {
            ProviderError::invalid_request(format!("max_tokens {} is out of range", max_tokens))
        })?;
        builder.max_completion_tokens(max_tokens);
    }
    if let Some(format) = &params.response_format {
        let format: ResponseFormat = serde_json::from_value(format.clone())
            .map_err(|e| ProviderError::invalid_request(format!("invalid response_format: {}", e)))?;
        builder.response_format(format);
    }
    if params.tool_config.is_some() {
        debug!(
            model = %params.model,
            "tool_config is not forwarded by the OpenAI-compatible provider"
        );
    }
    builder
        .build()
        .map_err(|e| ProviderError::invalid_request(e.to_string()))
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, params: &CallParameters) -> Result<RawResponse, ProviderError> {
        let request = build_request(params)?;
        let response = self
            .client_for(params)
            .chat()
            .create(request)
            .await
            .map_err(to_provider_error)?;

        let usage = response.usage.as_ref().map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens as u64,
            completion_tokens: u.completion_tokens as u64,
            total_tokens: u.total_tokens as u64,
        });

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(RawResponse {
            content,
            model: response.model.clone(),
            usage,
            raw: serde_json::to_value(&response).unwrap_or(Value::Null),
        })
    }
}
