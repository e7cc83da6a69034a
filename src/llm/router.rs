//! 请求路由
//!
//! 把 `provider/model` 形式的目标解析为 (ProviderFamily, CallParameters)：
//! - `max/*`：本地 agent proxy
//! - `runpod/*`：托管 pod，按 pod_id 拼接 URL，占位凭证 "EMPTY"
//! - `vertex_ai/*`：从环境快照补充 project / location
//! - 其余目标原样透传给通用客户端
//!
//! 解析是纯函数：环境变量在构造时做一次快照，之后不再读取进程环境。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::traits::{CallParameters, Provider, ProviderFamily};
use crate::config::RouterSection;
use crate::core::{OrchestratorError, Request};

const AGENT_PROXY_PREFIX: &str = "max/";
const RUNPOD_PREFIX: &str = "runpod/";
const VERTEX_PREFIX: &str = "vertex_ai/";

/// pod 目标不需要真实凭证
const PLACEHOLDER_API_KEY: &str = "EMPTY";

const ENV_VERTEX_PROJECT: &str = "VERTEXAI_PROJECT";
const ENV_VERTEX_LOCATION: &str = "VERTEXAI_LOCATION";

/// 路由时消费、不再透传的 extra_params 键
const RESERVED_PARAMS: [&str; 4] = ["api_base", "api_key", "pod_id", "timeout"];

/// 路由器：目标字符串 → Provider 家族 + 调用参数
#[derive(Debug, Clone)]
pub struct Router {
    settings: RouterSection,
    default_timeout: Duration,
    env: HashMap<String, String>,
}

impl Router {
    /// 以当前进程环境为快照构造
    pub fn from_env(settings: RouterSection, default_timeout: Duration) -> Self {
        let env = [ENV_VERTEX_PROJECT, ENV_VERTEX_LOCATION]
            .iter()
            .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
            .collect();
        Self::with_env(settings, default_timeout, env)
    }

    /// 以给定的环境快照构造（表驱动测试使用）
    pub fn with_env(
        settings: RouterSection,
        default_timeout: Duration,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            settings,
            default_timeout,
            env,
        }
    }

    pub fn resolve(
        &self,
        request: &Request,
    ) -> Result<(ProviderFamily, CallParameters), OrchestratorError> {
        let target = request
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                OrchestratorError::Configuration("request has no target model".to_string())
            })?;

        let timeout = match request.extra_params.get("timeout").and_then(Value::as_f64) {
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).map_err(|_| {
                OrchestratorError::Configuration(format!(
                    "extra_params.timeout {} is out of range",
                    secs
                ))
            })?,
            _ => self.default_timeout,
        };

        let mut params = CallParameters::new(target, timeout);
        params.messages = request.messages.clone();
        params.response_format = request.response_format.clone();
        for (key, value) in &request.extra_params {
            if !RESERVED_PARAMS.contains(&key.as_str()) {
                params.extra.insert(key.clone(), value.clone());
            }
        }

        let family = if target.starts_with(AGENT_PROXY_PREFIX) {
            params.api_base = Some(self.settings.agent_proxy_base_url.clone());
            params.api_key = self.settings.agent_proxy_api_key.clone();
            ProviderFamily::AgentProxy
        } else if let Some(model) = target.strip_prefix(RUNPOD_PREFIX) {
            self.resolve_pod(model, request, &mut params)?;
            ProviderFamily::Generic
        } else if target.starts_with(VERTEX_PREFIX) {
            let project = self.env_var(ENV_VERTEX_PROJECT, target)?;
            let location = self.env_var(ENV_VERTEX_LOCATION, target)?;
            params
                .extra
                .insert("vertex_project".to_string(), Value::String(project));
            params
                .extra
                .insert("vertex_location".to_string(), Value::String(location));
            ProviderFamily::Generic
        } else {
            ProviderFamily::Generic
        };

        // 显式参数总是覆盖合成值
        if let Some(base) = string_param(request, "api_base") {
            params.api_base = Some(base);
        }
        if let Some(key) = string_param(request, "api_key") {
            params.api_key = Some(key);
        }

        debug!(
            route = %target,
            family = %family,
            model = %params.model,
            api_base = ?params.api_base,
            "Request routed"
        );
        Ok((family, params))
    }

    fn resolve_pod(
        &self,
        model: &str,
        request: &Request,
        params: &mut CallParameters,
    ) -> Result<(), OrchestratorError> {
        params.model = format!("openai/{}", model);
        if let Some(pod_id) = string_param(request, "pod_id") {
            params.api_base = Some(self.settings.pod_url_template.replace("{pod_id}", &pod_id));
            params.api_key = Some(PLACEHOLDER_API_KEY.to_string());
            return Ok(());
        }
        if string_param(request, "api_base").is_some() {
            params.api_key = Some(PLACEHOLDER_API_KEY.to_string());
            return Ok(());
        }
        Err(OrchestratorError::Configuration(format!(
            "target '{}{}' requires extra_params.pod_id or extra_params.api_base",
            RUNPOD_PREFIX, model
        )))
    }

    fn env_var(&self, name: &str, target: &str) -> Result<String, OrchestratorError> {
        self.env
            .get(name)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "target '{}' requires environment variable {}",
                    target, name
                ))
            })
    }
}

fn string_param(request: &Request, key: &str) -> Option<String> {
    request
        .extra_params
        .get(key)
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.trim().is_empty())
}

/// 家族 → Provider 实现
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderFamily, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: ProviderFamily, provider: Arc<dyn Provider>) {
        self.providers.insert(family, provider);
    }

    pub fn with(mut self, family: ProviderFamily, provider: Arc<dyn Provider>) -> Self {
        self.register(family, provider);
        self
    }

    pub fn contains(&self, family: ProviderFamily) -> bool {
        self.providers.contains_key(&family)
    }

    pub fn get(&self, family: ProviderFamily) -> Result<Arc<dyn Provider>, OrchestratorError> {
        self.providers.get(&family).cloned().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "no provider registered for family '{}'",
                family
            ))
        })
    }
}
