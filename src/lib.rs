//! llm-relay - LLM 调用编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 请求模型、错误与恢复、重试状态、熔断器、编排器
//! - **llm**: 路由、Provider 抽象与实现（OpenAI 兼容 / Scripted）
//! - **observability**: tracing 订阅器初始化
//! - **tasks**: 异步任务模型、存储（内存 / SQLite）与管理器
//! - **tools**: 调试工具（MCP）配置的获取与释放
//! - **validation**: 校验器 trait、注册表、内置与 AI 辅助校验器

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod tasks;
pub mod tools;
pub mod validation;

pub use crate::core::{OrchestratorBuilder, OrchestratorError, Request, RetryOrchestrator};
pub use crate::tasks::TaskManager;
