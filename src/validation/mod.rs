//! 校验引擎：校验器 trait、注册表、内置与 AI 辅助校验器、校验链

pub mod ai;
pub mod builtin;
pub mod chain;
pub mod registry;
pub mod traits;

pub use ai::{AiContradictionCheck, AiJudge, NestedCaller};
pub use chain::run_chain;
pub use registry::{ValidatorDeps, ValidatorFactory, ValidatorRegistry};
pub use traits::{ValidationContext, ValidationResult, Validator, ValidatorError};
