//! llm-relay 命令行入口
//!
//! 用法：`llm-relay <request.json> [--async] [--config <path>]`
//! 读取请求 JSON，经编排器执行（或作为后台任务提交并等待），把响应内容打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use llm_relay::config::load_config;
use llm_relay::core::{OrchestratorBuilder, Request};
use llm_relay::observability;
use llm_relay::tasks::TaskManager;
use tracing::{info, warn};

struct Args {
    request_path: PathBuf,
    run_async: bool,
    config_path: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut request_path = None;
    let mut run_async = false;
    let mut config_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--async" => run_async = true,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other if request_path.is_none() => request_path = Some(PathBuf::from(other)),
            other => bail!("unexpected argument '{}'", other),
        }
    }

    let request_path = request_path
        .context("usage: llm-relay <request.json> [--async] [--config <path>]")?;
    Ok(Args {
        request_path,
        run_async,
        config_path,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let (cfg, config_err) = match load_config(args.config_path.clone()) {
        Ok(cfg) => (cfg, None),
        Err(e) => (Default::default(), Some(e)),
    };
    observability::init(&cfg.logging);
    if let Some(e) = config_err {
        warn!(error = %e, "Failed to load config, using defaults");
    }

    let raw = std::fs::read_to_string(&args.request_path)
        .with_context(|| format!("Failed to read {}", args.request_path.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).context("Request file is not valid JSON")?;
    // 请求未指定 retry_policy 时使用配置中的默认策略
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("retry_policy") {
            obj.insert(
                "retry_policy".to_string(),
                serde_json::to_value(&cfg.orchestrator.default_retry_policy)?,
            );
        }
    }
    let request: Request = serde_json::from_value(value).context("Invalid request")?;

    let orchestrator = OrchestratorBuilder::from_config(&cfg)
        .with_default_providers()
        .build();

    let response = if args.run_async {
        let manager = Arc::new(
            TaskManager::from_config(&cfg.tasks, Arc::new(orchestrator))
                .await
                .context("Failed to start task manager")?,
        );
        let sweeper = manager.spawn_sweeper();
        let task_id = manager.submit(request).await?;
        info!(task_id = %task_id, "Waiting for task");
        let result = manager
            .wait(&task_id, Duration::from_secs(cfg.tasks.wait_timeout_secs))
            .await;
        manager.shutdown_and_join(sweeper).await;
        result?
    } else {
        orchestrator.execute(request).await?
    };

    println!("{}", response.content);
    Ok(())
}
