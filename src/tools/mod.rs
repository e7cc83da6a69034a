//! 调试工具配置：进入 TOOL_ASSISTED 阶段时注入请求的 MCP 配置

pub mod mcp;

pub use mcp::{LeaseHandle, PolicyToolConfigProvider, ToolConfigLease, ToolConfigProvider};
