//! LLM 层：Provider 抽象、路由与实现（OpenAI 兼容 / Scripted）

pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use mock::ScriptedProvider;
pub use openai::OpenAiProvider;
pub use router::{ProviderRegistry, Router};
pub use traits::{CallParameters, Provider, ProviderFamily, RawResponse, TokenUsage};
