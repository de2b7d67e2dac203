//! Hive - 多智能体编排引擎
//!
//! 入口：`hive <plan.json|planner-output.txt> [config.toml]`。初始化日志、加载配置、恢复未结束的运行，
//! 然后用内置 echo Agent 执行给定计划，输出运行报告 JSON。Ctrl-C 取消所有运行。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::core::Orchestrator;
use hive::tools::{AgentRegistry, EchoAgent};
use hive::workflow::{parse_plan_output, Plan};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut args = std::env::args().skip(1);
    let plan_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: hive <plan.json|planner-output.txt> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let text = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("Failed to read {}", plan_path.display()))?;
    let plan = load_plan(&text)?;

    let mut registry = AgentRegistry::new();
    registry.register(EchoAgent);
    let orchestrator = Arc::new(
        Orchestrator::from_config(&cfg, registry).context("Failed to create orchestrator")?,
    );

    let resumed = orchestrator
        .resume_pending()
        .await
        .context("Failed to resume unfinished runs")?;
    for report in &resumed {
        tracing::info!(run_id = %report.run_id, status = ?report.status, "Resumed run finished");
    }

    let on_signal = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.shutdown("interrupted by user").await;
        }
    });

    let report = orchestrator.run(plan).await.context("Run failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// 计划 JSON，或带 <PLANNING_TAG> 的规划器输出
fn load_plan(text: &str) -> anyhow::Result<Plan> {
    if text.contains("<PLANNING_TAG>") {
        let output = parse_plan_output(text, "").context("Invalid planner output")?;
        if let Some(answer) = &output.final_answer {
            tracing::info!(answer = %answer, "Planner final answer");
        }
        return output
            .plan
            .context("Planner output contains no plan; nothing to execute");
    }
    serde_json::from_str(text).context("Invalid plan JSON")
}
