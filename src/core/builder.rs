//! 编排器构建器：从 AppConfig 统一组装路由、Provider、校验器注册表、熔断器与工具配置

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, RouterSection};
use crate::core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::core::orchestrator::{OrchestratorInner, RetryOrchestrator};
use crate::core::recovery::RecoveryEngine;
use crate::llm::{OpenAiProvider, Provider, ProviderFamily, ProviderRegistry, Router};
use crate::tools::{PolicyToolConfigProvider, ToolConfigProvider};
use crate::validation::ValidatorRegistry;

/// 编排器构建器：未显式设置的组件按配置默认值创建
pub struct OrchestratorBuilder {
    router_section: RouterSection,
    provider_timeout: Duration,
    router: Option<Router>,
    providers: ProviderRegistry,
    validators: Option<Arc<ValidatorRegistry>>,
    breaker_config: CircuitBreakerConfig,
    breaker: Option<Arc<CircuitBreaker>>,
    tools: Option<Arc<dyn ToolConfigProvider>>,
    max_depth: u32,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::from_config(&AppConfig::default())
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            router_section: config.router.clone(),
            provider_timeout: config.orchestrator.provider_timeout(),
            router: None,
            providers: ProviderRegistry::new(),
            validators: None,
            breaker_config: CircuitBreakerConfig::from(&config.breaker),
            breaker: None,
            tools: None,
            max_depth: config.orchestrator.max_recursion_depth,
        }
    }

    /// 使用自定义路由器（如注入环境快照）
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_provider(mut self, family: ProviderFamily, provider: Arc<dyn Provider>) -> Self {
        self.providers.register(family, provider);
        self
    }

    /// 为尚未注册的家族挂上 OpenAI 兼容 Provider
    pub fn with_default_providers(mut self) -> Self {
        let openai: Arc<dyn Provider> = Arc::new(OpenAiProvider::new());
        for family in [ProviderFamily::AgentProxy, ProviderFamily::Generic] {
            if !self.providers.contains(family) {
                self.providers.register(family, openai.clone());
            }
        }
        self
    }

    pub fn with_validators(mut self, registry: ValidatorRegistry) -> Self {
        self.validators = Some(Arc::new(registry));
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// 共享已有熔断器（多个编排器共用同一张熔断表）
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_tool_provider(mut self, tools: Arc<dyn ToolConfigProvider>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn build(self) -> RetryOrchestrator {
        let router = self
            .router
            .unwrap_or_else(|| Router::from_env(self.router_section, self.provider_timeout));
        let breaker_config = self.breaker_config;
        RetryOrchestrator::from_inner(OrchestratorInner {
            router,
            providers: self.providers,
            validators: self
                .validators
                .unwrap_or_else(|| Arc::new(ValidatorRegistry::with_builtins())),
            breaker: self
                .breaker
                .unwrap_or_else(|| Arc::new(CircuitBreaker::new(breaker_config))),
            tools: self
                .tools
                .unwrap_or_else(|| Arc::new(PolicyToolConfigProvider::new())),
            recovery: RecoveryEngine::new(),
            max_depth: self.max_depth,
        })
    }
}
