//! Scripted Provider（用于测试与 dry run，无需 API）
//!
//! 按顺序弹出预置的结果；脚本耗尽后使用回退行为（回显最后一条 User 消息，或固定结果）。
//! 每次调用的 CallParameters 都会被记录，便于断言路由与工具注入。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ProviderError, Role};
use crate::llm::{CallParameters, Provider, RawResponse};

type Scripted = Result<RawResponse, ProviderError>;

#[derive(Debug, Clone)]
enum Fallback {
    Echo,
    Always(Scripted),
}

/// 脚本化 Provider
#[derive(Debug)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Fallback,
    delay: Option<Duration>,
    calls: Mutex<Vec<CallParameters>>,
}

impl ScriptedProvider {
    /// 回显最后一条 User 消息
    pub fn echo() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Fallback::Echo,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok(content: impl Into<String>) -> Self {
        Self {
            fallback: Fallback::Always(Ok(RawResponse::text(content))),
            ..Self::echo()
        }
    }

    pub fn always_err(err: ProviderError) -> Self {
        Self {
            fallback: Fallback::Always(Err(err)),
            ..Self::echo()
        }
    }

    /// 依次返回给定结果，之后回显
    pub fn with_script(results: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            ..Self::echo()
        }
    }

    /// 每次调用前等待，用于超时与任务生命周期测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_ok(&self, content: impl Into<String>) {
        self.lock_script().push_back(Ok(RawResponse::text(content)));
    }

    pub fn push_err(&self, err: ProviderError) {
        self.lock_script().push_back(Err(err));
    }

    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// 已记录的全部调用参数（按调用顺序）
    pub fn calls(&self) -> Vec<CallParameters> {
        self.lock_calls().clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<CallParameters>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, params: &CallParameters) -> Result<RawResponse, ProviderError> {
        self.lock_calls().push(params.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.lock_script().pop_front();
        let result = match next {
            Some(result) => result,
            None => match &self.fallback {
                Fallback::Always(result) => result.clone(),
                Fallback::Echo => {
                    let last_user = params
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::User)
                        .map(|m| m.content.as_str())
                        .unwrap_or("(no input)");
                    Ok(RawResponse::text(last_user))
                }
            },
        };
        result.map(|r| {
            if r.model.is_empty() {
                r.with_model(params.model.clone())
            } else {
                r
            }
        })
    }
}
