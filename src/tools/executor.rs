//! 调用网关
//!
//! 持有 AgentRegistry、默认超时与全局并发许可，invoke 在超时内调用目标 Agent 并把返回值归一化为 InvocationOutcome；
//! 超时、未知 Agent、输入类型不支持都转为带原因码的失败。每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::tools::envelope::{normalize, AgentRequest, InputKind, InvocationOutcome, RawFailure};
use crate::tools::AgentRegistry;

/// 一次调用所需的全部输入
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub step_id: String,
    pub agent_id: String,
    pub attempt: u32,
    pub prompt: String,
    pub input_kind: InputKind,
    pub input: Value,
}

/// 调用网关：对每次调用施加硬超时与全局并发上限
pub struct ToolGateway {
    registry: AgentRegistry,
    default_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolGateway {
    pub fn new(registry: AgentRegistry, timeout_secs: u64, max_concurrent: usize) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_secs(timeout_secs),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// 调用指定 Agent；`timeout_override` 为空时使用默认超时
    pub async fn invoke(
        &self,
        request: InvocationRequest,
        timeout_override: Option<Duration>,
    ) -> InvocationOutcome {
        let start = Instant::now();
        let limit = timeout_override.unwrap_or(self.default_timeout);
        let prompt_preview = preview(&request.prompt);
        let agent_id = request.agent_id.clone();

        let (outcome, label) = self.dispatch(request, limit).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "agent_audit",
            "agent": agent_id,
            "ok": outcome.is_success(),
            "outcome": label,
            "duration_ms": duration_ms,
            "prompt_preview": prompt_preview,
        });
        tracing::info!(audit = %audit.to_string(), "agent");

        outcome
    }

    async fn dispatch(
        &self,
        request: InvocationRequest,
        limit: Duration,
    ) -> (InvocationOutcome, &'static str) {
        let fail = |code: &str, detail: String| {
            InvocationOutcome::Failure(RawFailure {
                step_id: request.step_id.clone(),
                agent_id: request.agent_id.clone(),
                attempt: request.attempt,
                reason_code: code.to_string(),
                detail,
            })
        };

        let Some(agent) = self.registry.get(&request.agent_id) else {
            return (
                fail(
                    "capability_unsupported",
                    format!("no agent registered with id '{}'", request.agent_id),
                ),
                "unknown_agent",
            );
        };

        if agent.input_kind() != request.input_kind {
            return (
                fail(
                    "unsupported_input_kind",
                    format!(
                        "agent '{}' accepts {} input, step provided {}",
                        request.agent_id,
                        agent.input_kind().as_str(),
                        request.input_kind.as_str()
                    ),
                ),
                "error",
            );
        }

        let agent_request = AgentRequest {
            step_id: request.step_id.clone(),
            attempt: request.attempt,
            prompt: request.prompt.clone(),
            input_kind: request.input_kind,
            input: request.input.clone(),
        };

        // 等待许可也计入超时
        let permits = self.permits.clone();
        let invocation = async move {
            let _permit = permits.acquire_owned().await.ok()?;
            Some(agent.invoke(agent_request).await)
        };

        match timeout(limit, invocation).await {
            Ok(Some(raw)) => {
                let outcome = normalize(&request.step_id, &request.agent_id, request.attempt, raw);
                let label = if outcome.is_success() { "ok" } else { "error" };
                (outcome, label)
            }
            Ok(None) => (fail("unavailable", "gateway is shut down".into()), "error"),
            Err(_) => (
                fail(
                    "timeout",
                    format!("agent '{}' did not respond within {:?}", request.agent_id, limit),
                ),
                "timeout",
            ),
        }
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}
