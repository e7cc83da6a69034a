//! 调试工具配置（MCP）的获取与释放
//!
//! 进入 TOOL_ASSISTED 阶段时，编排器通过 ToolConfigProvider 取得要注入的配置，
//! 请求结束（任何终态）时归还租约。

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::core::{DebugTool, OrchestratorError};

/// 租约句柄（对调用方不透明）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle(String);

impl LeaseHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ToolConfigLease {
    /// 注入 CallParameters.tool_config 的配置
    pub config: Value,
    pub handle: LeaseHandle,
}

#[async_trait]
pub trait ToolConfigProvider: Send + Sync {
    async fn acquire(
        &self,
        target: &str,
        tool: &DebugTool,
    ) -> Result<ToolConfigLease, OrchestratorError>;

    async fn release(&self, handle: LeaseHandle);
}

/// 默认实现：直接使用策略里的 mcp_config，记录未归还的租约
#[derive(Debug, Default)]
pub struct PolicyToolConfigProvider {
    outstanding: Mutex<HashSet<LeaseHandle>>,
}

impl PolicyToolConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尚未归还的租约数
    pub fn outstanding(&self) -> usize {
        self.outstanding
            .lock()
            .map(|set| set.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }
}

#[async_trait]
impl ToolConfigProvider for PolicyToolConfigProvider {
    async fn acquire(
        &self,
        target: &str,
        tool: &DebugTool,
    ) -> Result<ToolConfigLease, OrchestratorError> {
        if tool.mcp_config.is_null() {
            return Err(OrchestratorError::Configuration(format!(
                "debug tool '{}' has no mcp_config",
                tool.name
            )));
        }
        let handle = LeaseHandle::new();
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone());
        debug!(route = %target, tool = %tool.name, lease = %handle.as_str(), "Tool config acquired");
        Ok(ToolConfigLease {
            config: tool.mcp_config.clone(),
            handle,
        })
    }

    async fn release(&self, handle: LeaseHandle) {
        let removed = self
            .outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
        debug!(lease = %handle.as_str(), removed, "Tool config released");
    }
}
