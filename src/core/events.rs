//! 编排事件（观察用）
//!
//! Orchestrator 在调度、重试、失败、启用备用步骤、取消与结束时发送事件，调用方可订阅进度。
//! 事件只用于观察，不参与状态恢复；持久化的业务事件见 `core::state::Event`。

use serde::Serialize;

use crate::core::error::ErrorRecord;
use crate::core::state::{RunId, RunStatus};
use crate::workflow::StepId;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    StepDispatched {
        run_id: RunId,
        step_id: StepId,
        agent_id: String,
        attempt: u32,
    },
    StepSucceeded {
        run_id: RunId,
        step_id: StepId,
    },
    StepRetrying {
        run_id: RunId,
        step_id: StepId,
        error: ErrorRecord,
        delay_ms: u64,
    },
    StepFailed {
        run_id: RunId,
        step_id: StepId,
        error: ErrorRecord,
    },
    FallbackActivated {
        run_id: RunId,
        step_id: StepId,
        fallback_id: StepId,
    },
    RunCancelled {
        run_id: RunId,
        reason: String,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}

impl OrchestratorEvent {
    pub fn run_id(&self) -> &str {
        match self {
            OrchestratorEvent::StepDispatched { run_id, .. }
            | OrchestratorEvent::StepSucceeded { run_id, .. }
            | OrchestratorEvent::StepRetrying { run_id, .. }
            | OrchestratorEvent::StepFailed { run_id, .. }
            | OrchestratorEvent::FallbackActivated { run_id, .. }
            | OrchestratorEvent::RunCancelled { run_id, .. }
            | OrchestratorEvent::RunFinished { run_id, .. } => run_id,
        }
    }
}
