//! 核心编排层：请求模型、错误与恢复、重试状态、熔断、编排器与构建器

pub mod builder;
pub mod circuit_breaker;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod request;
pub mod state;

pub use builder::OrchestratorBuilder;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitRejected, CircuitSnapshot, CircuitState,
};
pub use error::{OrchestratorError, ProviderError, ProviderErrorKind, RecoveryAction};
pub use orchestrator::{Completion, RequestExecutor, RetryOrchestrator};
pub use recovery::RecoveryEngine;
pub use request::{DebugTool, Message, Request, RetryPolicy, Role, ValidatorSpec};
pub use state::{ErrorRecord, Outcome, RetryContext, Stage, StageTransition};
