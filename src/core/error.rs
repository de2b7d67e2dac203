//! 引擎错误类型与失败分类
//!
//! - `HiveError`：库 API 返回的错误（计划校验、模板、状态机、持久化等）
//! - `ErrorKind` / `ErrorRecord`：Agent 调用失败的分类结果，写入业务事件，重试时回灌到提示词

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 库 API 错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Plan validation failed: {0}")]
    PlanValidation(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Render error: template '{template}' is missing variable '{variable}'")]
    Render { template: String, variable: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// target 为步骤 ID，或运行级转换时的运行 ID
    #[error("Invalid transition for '{target}': {reason}")]
    InvalidTransition { target: String, reason: String },

    #[error("Retry limit exceeded for step '{step}' (max {max})")]
    RetryLimitExceeded { step: String, max: u32 },

    #[error("Run stalled: {0}")]
    Stalled(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for HiveError {
    fn from(e: rusqlite::Error) -> Self {
        HiveError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        HiveError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// 输入/输出不符合约定，带修正提示重试
    Validation,
    /// 超时、连接重置、限流，指数退避重试
    TransientNetwork,
    /// 目标 Agent 不支持该操作，不重试，交给规划器
    CapabilityUnsupported,
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Validation | ErrorKind::TransientNetwork)
    }

    pub fn uses_backoff(&self) -> bool {
        matches!(self, ErrorKind::TransientNetwork)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientNetwork => "transient-network",
            ErrorKind::CapabilityUnsupported => "capability-unsupported",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 结构化修复提示：下一次调用的输入中会原样出现
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub what_failed: String,
    pub what_to_change: String,
}

/// 一次失败调用的分类记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub step_id: String,
    pub agent_id: String,
    /// 归一化后的机器可读原因码（如 `timeout`、`rate_limited`）
    pub reason_code: String,
    /// 原始错误信息
    pub message: String,
    pub remediation: Remediation,
    pub attempt: u32,
    /// 被升级为 fatal 前的原始分类
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_from: Option<ErrorKind>,
}

impl ErrorRecord {
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// 重试次数耗尽或运行已取消时，将记录升级为 fatal，保留原始分类
    pub fn escalate(mut self, reason: &str) -> Self {
        if self.kind != ErrorKind::Fatal {
            self.escalated_from = Some(self.kind);
            self.kind = ErrorKind::Fatal;
        }
        self.remediation.what_to_change = format!(
            "{} The step will not be retried: {}.",
            self.remediation.what_to_change, reason
        );
        self
    }
}
