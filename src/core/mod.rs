//! 核心编排层：错误与恢复、运行状态、运行监管、编排事件、主控循环

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;

pub use error::{ErrorKind, ErrorRecord, HiveError, Remediation, Result};
pub use events::OrchestratorEvent;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunReport};
pub use recovery::{ErrorClassifier, RetryDecision, RetryPolicy};
pub use session_supervisor::RunSupervisor;
pub use state::{
    Event, EventKind, ExecutionState, RunFailure, RunId, RunSnapshot, RunStatus, StepStatus,
    Transition,
};
