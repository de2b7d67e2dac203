//! 失败分类与重试策略
//!
//! `ErrorClassifier` 把网关上报的 `RawFailure` 映射为 `ErrorRecord`（分类 + 修复提示），
//! `RetryPolicy` 决定是否重试以及退避时长。分类只认声明过的原因码，未知原因码一律视为 fatal，避免无限重试。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{ErrorKind, ErrorRecord, Remediation};
use crate::tools::RawFailure;

/// 原因码归一化：小写，`-` 与空白替换为 `_`
pub fn normalize_reason_code(code: &str) -> String {
    code.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// 将原因码映射到分类
pub fn kind_for_code(code: &str) -> ErrorKind {
    match code {
        "validation" | "invalid_input" | "invalid_output" | "schema_mismatch"
        | "malformed_output" | "parse_error" => ErrorKind::Validation,
        "timeout" | "connection_reset" | "connection_refused" | "network" | "rate_limited"
        | "http_429" | "http_502" | "http_503" | "http_504" | "unavailable" => {
            ErrorKind::TransientNetwork
        }
        "capability_unsupported" | "unsupported" | "unsupported_input_kind" | "unknown_agent" => {
            ErrorKind::CapabilityUnsupported
        }
        _ => ErrorKind::Fatal,
    }
}

/// 错误分类器：无状态、纯函数
#[derive(Debug, Default, Clone)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, raw: &RawFailure) -> ErrorRecord {
        let code = normalize_reason_code(&raw.reason_code);
        let kind = kind_for_code(&code);
        let remediation = remediation_for(kind, &code, raw);
        ErrorRecord {
            kind,
            step_id: raw.step_id.clone(),
            agent_id: raw.agent_id.clone(),
            reason_code: code,
            message: raw.detail.clone(),
            remediation,
            attempt: raw.attempt,
            escalated_from: None,
        }
    }
}

fn remediation_for(kind: ErrorKind, code: &str, raw: &RawFailure) -> Remediation {
    let what_failed = format!(
        "Agent '{}' failed on attempt {} ({}): {}",
        raw.agent_id, raw.attempt, code, raw.detail
    );
    let what_to_change = match kind {
        ErrorKind::Validation => {
            "The previous input or output did not match the expected contract. \
             Correct the format described above and return only well-formed output."
                .to_string()
        }
        ErrorKind::TransientNetwork => {
            "The failure was transient. Repeat the same request; keep the output unchanged."
                .to_string()
        }
        ErrorKind::CapabilityUnsupported => format!(
            "Agent '{}' does not offer this operation. Choose a different agent or re-plan the step.",
            raw.agent_id
        ),
        ErrorKind::Fatal => {
            "The failure is not recoverable by retrying. Report it to the caller.".to_string()
        }
    };
    Remediation {
        what_failed,
        what_to_change,
    }
}

/// 重试策略（指数退避 + 确定性抖动）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    /// `retries_used` 为该步骤已安排过的重试次数，`max` 为该步骤的上限
    pub fn decide(&self, kind: ErrorKind, retries_used: u32, max: u32) -> RetryDecision {
        if !kind.is_retryable() || retries_used >= max {
            return RetryDecision::GiveUp;
        }
        let delay = if kind.uses_backoff() {
            self.compute_delay(retries_used)
        } else {
            0
        };
        RetryDecision::Retry {
            delay: Duration::from_millis(delay),
        }
    }

    /// 第 n 次重试（从 0 开始）的退避毫秒数
    pub fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter_factor(attempt)) as u64;
        let delay = (base.min(u64::MAX as f64) as u64).saturating_add(jitter);
        delay.min(self.max_delay_ms)
    }
}

/// 由重试序号得到的伪随机因子 [0, 1)，同一序号恒定
fn jitter_factor(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761);
    (x % 100) as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(code: &str) -> RawFailure {
        RawFailure {
            step_id: "b".into(),
            agent_id: "search".into(),
            attempt: 1,
            reason_code: code.into(),
            detail: "boom".into(),
        }
    }

    #[test]
    fn test_classify_taxonomy() {
        let c = ErrorClassifier::new();
        assert_eq!(c.classify(&raw("schema_mismatch")).kind, ErrorKind::Validation);
        assert_eq!(c.classify(&raw("timeout")).kind, ErrorKind::TransientNetwork);
        assert_eq!(c.classify(&raw("Rate-Limited")).kind, ErrorKind::TransientNetwork);
        assert_eq!(
            c.classify(&raw("capability_unsupported")).kind,
            ErrorKind::CapabilityUnsupported
        );
        assert_eq!(c.classify(&raw("missing_resource")).kind, ErrorKind::Fatal);
    }

    #[test]
    fn test_unknown_code_defaults_to_fatal() {
        let rec = ErrorClassifier::new().classify(&raw("something odd"));
        assert_eq!(rec.kind, ErrorKind::Fatal);
        assert_eq!(rec.reason_code, "something_odd");
    }

    #[test]
    fn test_timeout_keeps_reason_code() {
        let rec = ErrorClassifier::new().classify(&raw("timeout"));
        assert_eq!(rec.reason_code, "timeout");
        assert!(rec.remediation.what_failed.contains("search"));
        assert!(rec.remediation.what_failed.contains("boom"));
    }

    #[test]
    fn test_validation_retries_without_delay() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.decide(ErrorKind::Validation, 0, 3),
            RetryDecision::Retry {
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_decide_respects_ceiling() {
        let p = RetryPolicy::default();
        assert!(matches!(
            p.decide(ErrorKind::TransientNetwork, 2, 3),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(p.decide(ErrorKind::TransientNetwork, 3, 3), RetryDecision::GiveUp);
        assert_eq!(p.decide(ErrorKind::Fatal, 0, 3), RetryDecision::GiveUp);
        assert_eq!(
            p.decide(ErrorKind::CapabilityUnsupported, 0, 3),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy::default();
        let d0 = p.compute_delay(0);
        let d1 = p.compute_delay(1);
        let d2 = p.compute_delay(2);
        assert!((500..=550).contains(&d0));
        assert!(d1 > d0 && d2 > d1);
        assert_eq!(p.compute_delay(20), 30_000);
        // 确定性：同一序号得到同一延迟
        assert_eq!(p.compute_delay(1), d1);
    }
}
