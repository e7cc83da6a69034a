//! 校验器注册表
//!
//! 启动时显式填充（with_builtins + register），之后以只读 Arc 共享。
//! 每个请求按 ValidatorSpec 通过工厂构造一次校验器链。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::ai::{AiContradictionCheck, AiJudge, NestedCaller};
use super::builtin;
use super::traits::Validator;
use crate::core::{OrchestratorError, ValidatorSpec};

/// 构造校验器所需的外部能力
#[derive(Clone, Default)]
pub struct ValidatorDeps {
    /// AI 辅助校验器使用的嵌套调用入口
    pub caller: Option<NestedCaller>,
}

impl ValidatorDeps {
    pub fn with_caller(caller: NestedCaller) -> Self {
        Self {
            caller: Some(caller),
        }
    }
}

pub type ValidatorFactory = Arc<
    dyn Fn(&Map<String, Value>, &ValidatorDeps) -> Result<Arc<dyn Validator>, OrchestratorError>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    factories: HashMap<String, ValidatorFactory>,
}

impl ValidatorRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置校验器全集
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("response_not_empty", |_, _| {
            Ok(Arc::new(builtin::ResponseNotEmpty) as Arc<dyn Validator>)
        });
        registry.register("json_string", |_, _| {
            Ok(Arc::new(builtin::JsonString) as Arc<dyn Validator>)
        });
        registry.register("field_present", |params, _| {
            Ok(Arc::new(builtin::FieldPresent::from_params(params)?) as Arc<dyn Validator>)
        });
        registry.register("length", |params, _| {
            Ok(Arc::new(builtin::Length::from_params(params)?) as Arc<dyn Validator>)
        });
        registry.register("regex", |params, _| {
            Ok(Arc::new(builtin::RegexMatch::from_params(params)?) as Arc<dyn Validator>)
        });
        registry.register("contains", |params, _| {
            Ok(Arc::new(builtin::Contains::from_params(params)?) as Arc<dyn Validator>)
        });
        registry.register(AiJudge::NAME, |params, deps| {
            let caller = require_caller(AiJudge::NAME, deps)?;
            Ok(Arc::new(AiJudge::from_params(params, caller)?) as Arc<dyn Validator>)
        });
        registry.register(AiContradictionCheck::NAME, |params, deps| {
            let caller = require_caller(AiContradictionCheck::NAME, deps)?;
            Ok(Arc::new(AiContradictionCheck::from_params(params, caller)) as Arc<dyn Validator>)
        });
        registry
    }

    /// 注册（同名覆盖）
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Map<String, Value>, &ValidatorDeps) -> Result<Arc<dyn Validator>, OrchestratorError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// 已注册名称（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(
        &self,
        name: &str,
        params: &Map<String, Value>,
        deps: &ValidatorDeps,
    ) -> Result<Arc<dyn Validator>, OrchestratorError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "Unknown validator '{}'. Registered validators: {}",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(params, deps)
    }

    /// 按声明顺序构造整条链；任一失败即返回配置错误
    pub fn resolve_chain(
        &self,
        specs: &[ValidatorSpec],
        deps: &ValidatorDeps,
    ) -> Result<Vec<Arc<dyn Validator>>, OrchestratorError> {
        specs
            .iter()
            .map(|spec| self.get(&spec.name, &spec.params, deps))
            .collect()
    }
}

fn require_caller(name: &str, deps: &ValidatorDeps) -> Result<NestedCaller, OrchestratorError> {
    deps.caller.clone().ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "validator '{}' needs a nested caller but none was provided",
            name
        ))
    })
}
