//! 内置校验器
//!
//! 纯本地校验，不做 I/O：非空、JSON、字段存在、长度、正则、包含子串。

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use super::traits::{ValidationContext, ValidationResult, Validator, ValidatorError};
use crate::core::OrchestratorError;
use crate::llm::RawResponse;

fn config_error(validator: &str, message: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Configuration(format!("validator '{}': {}", validator, message))
}

fn param_str<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn param_usize(
    validator: &str,
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<usize>, OrchestratorError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| config_error(validator, format!("'{}' must be a non-negative integer", key))),
    }
}

/// 从响应中取出 JSON 文本：接受 ```json 围栏块
pub fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let body = rest.strip_prefix("json").unwrap_or(rest);
        let body = body.strip_suffix("```").unwrap_or(body);
        return body.trim();
    }
    trimmed
}

fn parse_json(content: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(extract_json(content))
}

/// 响应去除空白后非空
#[derive(Debug, Default)]
pub struct ResponseNotEmpty;

#[async_trait]
impl Validator for ResponseNotEmpty {
    fn name(&self) -> &str {
        "response_not_empty"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        if response.content.trim().is_empty() {
            Ok(ValidationResult::fail("response is empty")
                .with_suggestion("Provide a non-empty answer."))
        } else {
            Ok(ValidationResult::ok())
        }
    }
}

/// 响应可解析为 JSON
#[derive(Debug, Default)]
pub struct JsonString;

#[async_trait]
impl Validator for JsonString {
    fn name(&self) -> &str {
        "json_string"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        match parse_json(&response.content) {
            Ok(_) => Ok(ValidationResult::ok()),
            Err(e) => Ok(ValidationResult::fail(format!("response is not valid JSON: {}", e))
                .with_suggestion("Return only a JSON document, without prose around it.")
                .with_debug("line", e.line())
                .with_debug("column", e.column())),
        }
    }
}

/// JSON 对象包含全部字段（支持 a.b.c 点路径）
#[derive(Debug)]
pub struct FieldPresent {
    fields: Vec<String>,
}

impl FieldPresent {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn from_params(params: &Map<String, Value>) -> Result<Self, OrchestratorError> {
        let fields = params
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| config_error("field_present", "'fields' must be an array of strings"))?
            .iter()
            .map(|f| {
                f.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| config_error("field_present", "'fields' entries must be strings"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if fields.is_empty() {
            return Err(config_error("field_present", "'fields' must not be empty"));
        }
        Ok(Self::new(fields))
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

#[async_trait]
impl Validator for FieldPresent {
    fn name(&self) -> &str {
        "field_present"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        let value = match parse_json(&response.content) {
            Ok(v) if v.is_object() => v,
            Ok(_) => return Ok(ValidationResult::fail("response is not a JSON object")),
            Err(e) => {
                return Ok(ValidationResult::fail(format!(
                    "response is not valid JSON: {}",
                    e
                )))
            }
        };

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| lookup(&value, f).is_none())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(ValidationResult::ok());
        }
        Ok(
            ValidationResult::fail(format!("missing fields: {}", missing.join(", ")))
                .with_suggestion(format!(
                    "Include the fields {} in the JSON object.",
                    missing.join(", ")
                ))
                .with_debug("missing", missing.clone()),
        )
    }
}

/// 字符数在 [min, max] 内
#[derive(Debug)]
pub struct Length {
    min: Option<usize>,
    max: Option<usize>,
}

impl Length {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, OrchestratorError> {
        let min = param_usize("length", params, "min")?;
        let max = param_usize("length", params, "max")?;
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(config_error("length", format!("min {} > max {}", lo, hi)));
            }
        }
        Ok(Self { min, max })
    }
}

#[async_trait]
impl Validator for Length {
    fn name(&self) -> &str {
        "length"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        let len = response.content.chars().count();
        if let Some(min) = self.min {
            if len < min {
                return Ok(ValidationResult::fail(format!(
                    "response too short: {} chars, minimum {}",
                    len, min
                ))
                .with_suggestion(format!("Expand the answer to at least {} characters.", min))
                .with_debug("length", len));
            }
        }
        if let Some(max) = self.max {
            if len > max {
                return Ok(ValidationResult::fail(format!(
                    "response too long: {} chars, maximum {}",
                    len, max
                ))
                .with_suggestion(format!("Shorten the answer to at most {} characters.", max))
                .with_debug("length", len));
            }
        }
        Ok(ValidationResult::ok())
    }
}

/// 正则匹配；非法正则在构造时即报配置错误
#[derive(Debug)]
pub struct RegexMatch {
    pattern: Regex,
}

impl RegexMatch {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, OrchestratorError> {
        let pattern = param_str(params, "pattern")
            .ok_or_else(|| config_error("regex", "'pattern' is required"))?;
        let pattern = Regex::new(pattern).map_err(|e| config_error("regex", e))?;
        Ok(Self { pattern })
    }
}

#[async_trait]
impl Validator for RegexMatch {
    fn name(&self) -> &str {
        "regex"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        if self.pattern.is_match(&response.content) {
            Ok(ValidationResult::ok())
        } else {
            Ok(ValidationResult::fail(format!(
                "response does not match pattern '{}'",
                self.pattern.as_str()
            )))
        }
    }
}

/// 包含子串
#[derive(Debug)]
pub struct Contains {
    text: String,
    case_sensitive: bool,
}

impl Contains {
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, OrchestratorError> {
        let text = param_str(params, "text")
            .ok_or_else(|| config_error("contains", "'text' is required"))?
            .to_string();
        let case_sensitive = params
            .get("case_sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Ok(Self {
            text,
            case_sensitive,
        })
    }
}

#[async_trait]
impl Validator for Contains {
    fn name(&self) -> &str {
        "contains"
    }

    async fn validate(
        &self,
        response: &RawResponse,
        _ctx: &ValidationContext<'_>,
    ) -> Result<ValidationResult, ValidatorError> {
        let found = if self.case_sensitive {
            response.content.contains(&self.text)
        } else {
            response
                .content
                .to_lowercase()
                .contains(&self.text.to_lowercase())
        };
        if found {
            Ok(ValidationResult::ok())
        } else {
            Ok(
                ValidationResult::fail(format!("response does not contain '{}'", self.text))
                    .with_suggestion(format!("Mention '{}' in the answer.", self.text)),
            )
        }
    }
}
