//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，如 `RELAY__BREAKER__FAILURE_THRESHOLD=3`）。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub breaker: BreakerSection,
    pub router: RouterSection,
    pub tasks: TasksSection,
    pub logging: LoggingSection,
}

/// [orchestrator] 段：Provider 超时、嵌套深度、默认重试策略
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单次 Provider 调用的硬超时（秒）
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// AI 校验器嵌套调用的最大深度
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
    /// 请求未携带 retry_policy 时使用
    #[serde(default)]
    pub default_retry_policy: RetryPolicy,
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_max_recursion_depth() -> u32 {
    3
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout_secs(),
            max_recursion_depth: default_max_recursion_depth(),
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSection {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// [breaker] 段：熔断阈值与恢复时间
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

/// [router] 段：agent proxy 地址、pod URL 模板
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// `max/*` 目标使用的本地 agent proxy（OpenAI 兼容）
    #[serde(default = "default_agent_proxy_base_url")]
    pub agent_proxy_base_url: String,
    pub agent_proxy_api_key: Option<String>,
    /// `runpod/*` 目标的 URL 模板，`{pod_id}` 为占位符
    #[serde(default = "default_pod_url_template")]
    pub pod_url_template: String,
}

fn default_agent_proxy_base_url() -> String {
    "http://localhost:8001/v1".to_string()
}

fn default_pod_url_template() -> String {
    "https://{pod_id}-8000.proxy.runpod.net/v1".to_string()
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            agent_proxy_base_url: default_agent_proxy_base_url(),
            agent_proxy_api_key: None,
            pod_url_template: default_pod_url_template(),
        }
    }
}

/// [tasks] 段：任务持久化、轮询、保留期
#[derive(Debug, Clone, Deserialize)]
pub struct TasksSection {
    /// SQLite 文件路径；显式置空时使用内存存储（重启即丢失）
    #[serde(default = "default_db_path")]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 终态任务保留时长（小时）
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 同时执行的后台任务上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 二进制入口 wait 的默认超时（秒）
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_db_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/tasks.db"))
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_max_concurrent() -> usize {
    8
}

fn default_wait_timeout_secs() -> u64 {
    600
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_ms: default_poll_interval_ms(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_concurrent: default_max_concurrent(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl TasksSection {
    /// 实际使用的 SQLite 路径；未设置或为空字符串时返回 None
    pub fn store_path(&self) -> Option<&Path> {
        self.db_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    /// EnvFilter 默认指令，RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 输出 JSON 格式日志
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
