//! 运行状态：执行状态（游标、重试、等待）与业务状态（只追加事件日志）
//!
//! `RunSnapshot::apply` 是唯一的变更入口：校验转换是否合法，更新执行状态，追加事件，版本号加一。
//! 执行状态可整体由 (计划, 事件日志) 之外的字段恢复；业务事件只追加，更正以新事件引用旧事件的方式记录。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{ErrorRecord, HiveError, Result};
use crate::tools::{ArtifactRef, InvocationResult};
use crate::workflow::{Plan, PlanId, StepId};

pub type RunId = String;

/// 未在步骤或配置中指定时的重试上限
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 运行状态：pending → running → {waiting, succeeded, failed}，waiting 可回到 running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Waiting,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足或等待调度
    Pending,
    /// 备用步骤，主步骤未失败前不调度
    Standby,
    Running,
    /// 等待重试截止时间
    Waiting,
    Succeeded,
    Failed,
    Cancelled,
    /// 运行结束时未被执行（失败后的剩余步骤、未启用的备用步骤）
    Skipped,
}

/// 失败运行的摘要：失败步骤、最终错误记录、取消原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step_id: Option<StepId>,
    pub reason: String,
    pub error: Option<ErrorRecord>,
    pub cancelled: bool,
}

/// 执行状态（仅 Orchestrator 通过 apply 变更）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: RunId,
    pub status: RunStatus,
    /// 每次 apply 加一
    pub version: u64,
    /// 最近一次开始执行的步骤
    pub current_step: Option<StepId>,
    pub steps: BTreeMap<StepId, StepStatus>,
    /// 已满足的步骤：成功，或失败但备用步骤已满足
    pub completed: BTreeSet<StepId>,
    /// 依赖已满足、可立即调度的 pending 步骤（按计划顺序）
    pub next_eligible: Vec<StepId>,
    pub retry_counts: BTreeMap<StepId, u32>,
    pub retry_limits: BTreeMap<StepId, u32>,
    /// 等待中的步骤的重试截止时间（毫秒时间戳）
    pub retry_deadlines: BTreeMap<StepId, i64>,
    /// 每个步骤已开始的调用次数
    pub attempts: BTreeMap<StepId, u32>,
    pub terminal: bool,
    pub failure: Option<RunFailure>,
}

impl ExecutionState {
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).copied()
    }

    pub fn retry_count(&self, step_id: &str) -> u32 {
        self.retry_counts.get(step_id).copied().unwrap_or(0)
    }

    pub fn retry_limit(&self, step_id: &str) -> u32 {
        self.retry_limits
            .get(step_id)
            .copied()
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn attempt(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    /// 在 `now_ms` 时刻可调度的步骤：pending 且依赖满足，或等待中且截止时间已到
    pub fn ready_at(&self, now_ms: i64) -> Vec<StepId> {
        if self.terminal {
            return Vec::new();
        }
        let mut ready = self.next_eligible.clone();
        let mut due: Vec<(i64, &StepId)> = self
            .retry_deadlines
            .iter()
            .filter(|(id, at)| {
                **at <= now_ms && self.step_status(id) == Some(StepStatus::Waiting)
            })
            .map(|(id, at)| (*at, id))
            .collect();
        due.sort();
        ready.extend(due.into_iter().map(|(_, id)| id.clone()));
        ready
    }

    /// 最近的重试截止时间
    pub fn next_deadline(&self) -> Option<i64> {
        self.retry_deadlines
            .iter()
            .filter(|(id, _)| self.step_status(id) == Some(StepStatus::Waiting))
            .map(|(_, at)| *at)
            .min()
    }

    pub fn running_steps(&self) -> Vec<StepId> {
        self.steps_with(StepStatus::Running)
    }

    pub fn steps_with(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// 状态转换：apply 的唯一输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    RunStarted,
    StepStarted {
        step_id: StepId,
        prompt: String,
    },
    StepSucceeded {
        step_id: StepId,
        result: InvocationResult,
    },
    StepFailed {
        step_id: StepId,
        error: ErrorRecord,
    },
    StepRetryScheduled {
        step_id: StepId,
        error: ErrorRecord,
        deadline_ms: i64,
    },
    /// 崩溃恢复：将崩溃时仍在执行的步骤放回 pending
    StepInterrupted {
        step_id: StepId,
    },
    RunCancelled {
        reason: String,
    },
    /// 追加一条更正事件，引用被更正事件的序号
    EventCorrected {
        corrects: u64,
        note: String,
        payload: Value,
    },
}

/// 业务事件（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// 步骤的调用序号；运行级事件为 0
    pub attempt: u32,
    pub at_ms: i64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunAccepted {
        plan_id: PlanId,
        plan_version: u32,
    },
    RunStarted,
    Invocation {
        agent_id: String,
        input: Value,
        prompt: String,
    },
    Result {
        payload: Value,
        artifacts: Vec<ArtifactRef>,
    },
    Failure {
        error: ErrorRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_at_ms: Option<i64>,
    },
    Interrupted,
    Cancelled {
        reason: String,
    },
    Correction {
        corrects: u64,
        note: String,
        payload: Value,
    },
}

/// 一个运行的完整可持久化记录：`{run_id, plan_version, execution_state, business_state[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub plan_version: u32,
    pub plan: Plan,
    pub execution_state: ExecutionState,
    pub business_state: Vec<Event>,
    /// 重新规划时被替代的旧运行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<RunId>,
    pub created_at: i64,
}

impl RunSnapshot {
    /// 为已校验的计划创建运行：备用步骤待命，其余 pending；记录 RunAccepted 事件
    pub fn new(run_id: RunId, plan: Plan, replaces: Option<RunId>, now_ms: i64) -> Self {
        let mut steps = BTreeMap::new();
        let mut retry_limits = BTreeMap::new();
        for step in &plan.steps {
            let status = if plan.is_fallback(&step.id) {
                StepStatus::Standby
            } else {
                StepStatus::Pending
            };
            steps.insert(step.id.clone(), status);
            retry_limits.insert(
                step.id.clone(),
                step.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            );
        }

        let execution_state = ExecutionState {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
            version: 0,
            current_step: None,
            steps,
            completed: BTreeSet::new(),
            next_eligible: Vec::new(),
            retry_counts: BTreeMap::new(),
            retry_limits,
            retry_deadlines: BTreeMap::new(),
            attempts: BTreeMap::new(),
            terminal: false,
            failure: None,
        };

        let mut snapshot = Self {
            run_id,
            plan_version: plan.version,
            business_state: Vec::new(),
            execution_state,
            replaces,
            created_at: now_ms,
            plan,
        };
        let kind = EventKind::RunAccepted {
            plan_id: snapshot.plan.id.clone(),
            plan_version: snapshot.plan.version,
        };
        snapshot.push_event(None, 0, now_ms, kind);
        snapshot.recompute();
        snapshot
    }

    pub fn status(&self) -> RunStatus {
        self.execution_state.status
    }

    /// 某步骤的全部事件（按调用顺序）
    pub fn events_for(&self, step_id: &str) -> impl DoubleEndedIterator<Item = &Event> + '_ {
        let step_id = step_id.to_string();
        self.business_state
            .iter()
            .filter(move |e| e.step_id.as_deref() == Some(step_id.as_str()))
    }

    /// 某步骤最近一次成功结果
    pub fn latest_result(&self, step_id: &str) -> Option<(&Value, &[ArtifactRef])> {
        self.events_for(step_id).rev().find_map(|e| match &e.kind {
            EventKind::Result { payload, artifacts } => Some((payload, artifacts.as_slice())),
            _ => None,
        })
    }

    /// 应用一次转换，返回新追加的事件
    pub fn apply(&mut self, transition: Transition, now_ms: i64) -> Result<Vec<Event>> {
        let first_new = self.business_state.len();
        match transition {
            Transition::RunStarted => self.run_started(now_ms)?,
            Transition::StepStarted { step_id, prompt } => {
                self.step_started(&step_id, prompt, now_ms)?
            }
            Transition::StepSucceeded { step_id, result } => {
                self.step_succeeded(&step_id, result, now_ms)?
            }
            Transition::StepFailed { step_id, error } => self.step_failed(&step_id, error, now_ms)?,
            Transition::StepRetryScheduled {
                step_id,
                error,
                deadline_ms,
            } => self.retry_scheduled(&step_id, error, deadline_ms, now_ms)?,
            Transition::StepInterrupted { step_id } => self.step_interrupted(&step_id, now_ms)?,
            Transition::RunCancelled { reason } => self.run_cancelled(reason, now_ms)?,
            Transition::EventCorrected {
                corrects,
                note,
                payload,
            } => self.event_corrected(corrects, note, payload, now_ms)?,
        }
        self.execution_state.version += 1;
        self.recompute();
        Ok(self.business_state[first_new..].to_vec())
    }

    fn run_started(&mut self, now_ms: i64) -> Result<()> {
        if self.execution_state.status != RunStatus::Pending {
            return Err(self.run_error("run has already started"));
        }
        self.execution_state.status = RunStatus::Running;
        self.push_event(None, 0, now_ms, EventKind::RunStarted);
        Ok(())
    }

    fn step_started(&mut self, step_id: &str, prompt: String, now_ms: i64) -> Result<()> {
        if self.execution_state.terminal {
            return Err(invalid(step_id, "run is terminal"));
        }
        let status = self.require_step(step_id)?;
        match status {
            StepStatus::Pending => {}
            StepStatus::Waiting => {
                let deadline = self
                    .execution_state
                    .retry_deadlines
                    .get(step_id)
                    .copied()
                    .unwrap_or(i64::MIN);
                if now_ms < deadline {
                    return Err(invalid(step_id, "retry deadline has not elapsed"));
                }
            }
            other => return Err(invalid(step_id, &format!("cannot start a {other:?} step"))),
        }
        let step = self
            .plan
            .step(step_id)
            .ok_or_else(|| HiveError::StepNotFound(step_id.to_string()))?;
        if let Some(dep) = step
            .depends_on
            .iter()
            .find(|d| !self.execution_state.completed.contains(*d))
        {
            return Err(invalid(step_id, &format!("dependency '{dep}' is not complete")));
        }
        let agent_id = step.agent_id.clone();
        let input = step.input.clone();

        let es = &mut self.execution_state;
        es.steps.insert(step_id.to_string(), StepStatus::Running);
        es.retry_deadlines.remove(step_id);
        es.current_step = Some(step_id.to_string());
        let attempt = es.attempts.entry(step_id.to_string()).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        if es.status == RunStatus::Pending {
            es.status = RunStatus::Running;
        }

        self.push_event(
            Some(step_id),
            attempt,
            now_ms,
            EventKind::Invocation {
                agent_id,
                input,
                prompt,
            },
        );
        Ok(())
    }

    fn step_succeeded(&mut self, step_id: &str, result: InvocationResult, now_ms: i64) -> Result<()> {
        self.require_running(step_id)?;
        self.execution_state
            .steps
            .insert(step_id.to_string(), StepStatus::Succeeded);
        let attempt = self.execution_state.attempt(step_id);
        self.push_event(
            Some(step_id),
            attempt,
            now_ms,
            EventKind::Result {
                payload: result.payload,
                artifacts: result.artifacts,
            },
        );
        Ok(())
    }

    fn step_failed(&mut self, step_id: &str, error: ErrorRecord, now_ms: i64) -> Result<()> {
        self.require_running(step_id)?;
        self.execution_state
            .steps
            .insert(step_id.to_string(), StepStatus::Failed);
        let attempt = self.execution_state.attempt(step_id);
        self.push_event(
            Some(step_id),
            attempt,
            now_ms,
            EventKind::Failure {
                error: error.clone(),
                retry_at_ms: None,
            },
        );

        if self.execution_state.terminal {
            return Ok(());
        }

        let fallback = self
            .plan
            .step(step_id)
            .and_then(|s| s.fallback.clone())
            .filter(|fb| self.execution_state.step_status(fb) == Some(StepStatus::Standby));
        match fallback {
            Some(fb) => {
                self.execution_state.steps.insert(fb, StepStatus::Pending);
            }
            None => {
                let reason = format!("step '{}' failed: {}", step_id, error.message);
                self.finish_failed(RunFailure {
                    step_id: Some(step_id.to_string()),
                    reason,
                    error: Some(error),
                    cancelled: false,
                });
            }
        }
        Ok(())
    }

    fn retry_scheduled(
        &mut self,
        step_id: &str,
        error: ErrorRecord,
        deadline_ms: i64,
        now_ms: i64,
    ) -> Result<()> {
        self.require_running(step_id)?;
        if self.execution_state.terminal {
            return Err(invalid(step_id, "run is terminal; retries are not scheduled"));
        }
        if !error.is_retryable() {
            return Err(invalid(
                step_id,
                &format!("{} failures are not retryable", error.kind),
            ));
        }
        let max = self.execution_state.retry_limit(step_id);
        let used = self.execution_state.retry_count(step_id);
        if used >= max {
            return Err(HiveError::RetryLimitExceeded {
                step: step_id.to_string(),
                max,
            });
        }

        let es = &mut self.execution_state;
        es.retry_counts.insert(step_id.to_string(), used + 1);
        es.retry_deadlines.insert(step_id.to_string(), deadline_ms);
        es.steps.insert(step_id.to_string(), StepStatus::Waiting);
        let attempt = es.attempt(step_id);
        self.push_event(
            Some(step_id),
            attempt,
            now_ms,
            EventKind::Failure {
                error,
                retry_at_ms: Some(deadline_ms),
            },
        );
        Ok(())
    }

    fn step_interrupted(&mut self, step_id: &str, now_ms: i64) -> Result<()> {
        self.require_running(step_id)?;
        let next = if self.execution_state.terminal {
            StepStatus::Cancelled
        } else {
            StepStatus::Pending
        };
        self.execution_state.steps.insert(step_id.to_string(), next);
        let attempt = self.execution_state.attempt(step_id);
        self.push_event(Some(step_id), attempt, now_ms, EventKind::Interrupted);
        Ok(())
    }

    fn run_cancelled(&mut self, reason: String, now_ms: i64) -> Result<()> {
        if self.execution_state.terminal {
            return Err(self.run_error("run is already terminal"));
        }
        for status in self.execution_state.steps.values_mut() {
            if matches!(
                status,
                StepStatus::Pending | StepStatus::Waiting | StepStatus::Standby
            ) {
                *status = StepStatus::Cancelled;
            }
        }
        self.execution_state.retry_deadlines.clear();
        self.execution_state.status = RunStatus::Failed;
        self.execution_state.terminal = true;
        self.execution_state.failure = Some(RunFailure {
            step_id: None,
            reason: reason.clone(),
            error: None,
            cancelled: true,
        });
        self.push_event(None, 0, now_ms, EventKind::Cancelled { reason });
        Ok(())
    }

    fn event_corrected(
        &mut self,
        corrects: u64,
        note: String,
        payload: Value,
        now_ms: i64,
    ) -> Result<()> {
        let Some(original) = self.business_state.get(corrects as usize) else {
            return Err(self.run_error(&format!("event {corrects} does not exist")));
        };
        let step_id = original.step_id.clone();
        let attempt = original.attempt;
        self.push_event(
            step_id.as_deref(),
            attempt,
            now_ms,
            EventKind::Correction {
                corrects,
                note,
                payload,
            },
        );
        Ok(())
    }

    fn finish_failed(&mut self, failure: RunFailure) {
        let es = &mut self.execution_state;
        for status in es.steps.values_mut() {
            if matches!(
                status,
                StepStatus::Pending | StepStatus::Waiting | StepStatus::Standby
            ) {
                *status = StepStatus::Skipped;
            }
        }
        es.retry_deadlines.clear();
        es.status = RunStatus::Failed;
        es.terminal = true;
        es.failure = Some(failure);
    }

    /// 重算满足集合、可调度集合与运行状态
    fn recompute(&mut self) {
        let mut completed = BTreeSet::new();
        for step in &self.plan.steps {
            if self.is_satisfied(&step.id) {
                completed.insert(step.id.clone());
            }
        }
        self.execution_state.completed = completed;

        let es = &self.execution_state;
        let eligible: Vec<StepId> = if es.terminal {
            Vec::new()
        } else {
            self.plan
                .steps
                .iter()
                .filter(|s| es.step_status(&s.id) == Some(StepStatus::Pending))
                .filter(|s| s.depends_on.iter().all(|d| es.completed.contains(d)))
                .map(|s| s.id.clone())
                .collect()
        };
        self.execution_state.next_eligible = eligible;

        if self.execution_state.terminal {
            return;
        }

        let all_primaries_done = self
            .plan
            .steps
            .iter()
            .filter(|s| !self.plan.is_fallback(&s.id))
            .all(|s| self.execution_state.completed.contains(&s.id));
        let es = &mut self.execution_state;
        if all_primaries_done {
            for status in es.steps.values_mut() {
                if *status == StepStatus::Standby {
                    *status = StepStatus::Skipped;
                }
            }
            es.status = RunStatus::Succeeded;
            es.terminal = true;
            return;
        }

        let running = es.steps.values().any(|v| *v == StepStatus::Running);
        let waiting = es.steps.values().any(|v| *v == StepStatus::Waiting);
        es.status = if running {
            RunStatus::Running
        } else if waiting {
            RunStatus::Waiting
        } else if es.status == RunStatus::Pending {
            RunStatus::Pending
        } else {
            RunStatus::Running
        };
    }

    /// 成功，或失败但其备用步骤已满足
    fn is_satisfied(&self, step_id: &str) -> bool {
        let mut cur = step_id;
        let mut hops = 0;
        loop {
            match self.execution_state.step_status(cur) {
                Some(StepStatus::Succeeded) => return true,
                Some(StepStatus::Failed) => {
                    let fb = self.plan.step(cur).and_then(|s| s.fallback.as_deref());
                    match fb {
                        Some(next) if hops < self.plan.steps.len() => {
                            cur = next;
                            hops += 1;
                        }
                        _ => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    fn require_step(&self, step_id: &str) -> Result<StepStatus> {
        self.execution_state
            .step_status(step_id)
            .ok_or_else(|| HiveError::StepNotFound(step_id.to_string()))
    }

    fn require_running(&self, step_id: &str) -> Result<()> {
        match self.require_step(step_id)? {
            StepStatus::Running => Ok(()),
            other => Err(invalid(step_id, &format!("step is {other:?}, not running"))),
        }
    }

    fn run_error(&self, reason: &str) -> HiveError {
        invalid(&self.run_id, reason)
    }

    fn push_event(&mut self, step_id: Option<&str>, attempt: u32, at_ms: i64, kind: EventKind) {
        let seq = self.business_state.len() as u64;
        self.business_state.push(Event {
            seq,
            step_id: step_id.map(str::to_string),
            attempt,
            at_ms,
            kind,
        });
    }
}

fn invalid(target: &str, reason: &str) -> HiveError {
    HiveError::InvalidTransition {
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, Remediation};
    use crate::workflow::PlanBuilder;
    use serde_json::json;

    fn abc() -> Plan {
        PlanBuilder::new("g")
            .step("a", "echo", json!("a"))
            .step("b", "echo", json!("b"))
            .step("c", "echo", json!("c"))
            .sequential("a", "b")
            .depends_on("c", &["a", "b"])
            .max_retries("b", 2)
            .build()
            .unwrap()
    }

    fn err(step: &str, kind: ErrorKind) -> ErrorRecord {
        ErrorRecord {
            kind,
            step_id: step.into(),
            agent_id: "echo".into(),
            reason_code: "timeout".into(),
            message: "boom".into(),
            remediation: Remediation {
                what_failed: "x".into(),
                what_to_change: "y".into(),
            },
            attempt: 1,
            escalated_from: None,
        }
    }

    fn ok() -> InvocationResult {
        InvocationResult {
            payload: json!("ok"),
            artifacts: vec![],
        }
    }

    fn start(s: &mut RunSnapshot, id: &str, now: i64) {
        s.apply(
            Transition::StepStarted {
                step_id: id.into(),
                prompt: format!("prompt {id}"),
            },
            now,
        )
        .unwrap();
    }

    fn succeed(s: &mut RunSnapshot, id: &str) {
        s.apply(
            Transition::StepSucceeded {
                step_id: id.into(),
                result: ok(),
            },
            0,
        )
        .unwrap();
    }

    #[test]
    fn test_new_run_is_pending_with_roots_eligible() {
        let snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        assert_eq!(snap.status(), RunStatus::Pending);
        assert_eq!(snap.execution_state.next_eligible, vec!["a".to_string()]);
        assert_eq!(snap.business_state.len(), 1);
        assert_eq!(snap.execution_state.retry_limit("b"), 2);
        assert_eq!(snap.execution_state.retry_limit("a"), DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_happy_path_succeeds_and_versions_increase() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        snap.apply(Transition::RunStarted, 0).unwrap();
        start(&mut snap, "a", 1);
        assert!(snap.execution_state.next_eligible.is_empty());
        succeed(&mut snap, "a");
        assert_eq!(snap.execution_state.next_eligible, vec!["b".to_string()]);
        start(&mut snap, "b", 2);
        succeed(&mut snap, "b");
        start(&mut snap, "c", 3);
        succeed(&mut snap, "c");
        assert_eq!(snap.status(), RunStatus::Succeeded);
        assert!(snap.execution_state.terminal);
        assert_eq!(snap.execution_state.version, 7);
    }

    #[test]
    fn test_cannot_start_before_dependencies() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        let err = snap
            .apply(
                Transition::StepStarted {
                    step_id: "c".into(),
                    prompt: String::new(),
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition { .. }));
        assert_eq!(snap.business_state.len(), 1);
    }

    #[test]
    fn test_retry_then_ceiling() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        succeed(&mut snap, "a");
        for i in 0..2 {
            start(&mut snap, "b", 100 * i);
            snap.apply(
                Transition::StepRetryScheduled {
                    step_id: "b".into(),
                    error: err("b", ErrorKind::TransientNetwork),
                    deadline_ms: 100 * i + 50,
                },
                100 * i,
            )
            .unwrap();
            assert_eq!(snap.status(), RunStatus::Waiting);
            assert_eq!(snap.execution_state.next_deadline(), Some(100 * i + 50));
            assert!(snap.execution_state.ready_at(100 * i).is_empty());
            assert_eq!(snap.execution_state.ready_at(100 * i + 50), vec!["b".to_string()]);
        }
        start(&mut snap, "b", 300);
        let e = snap
            .apply(
                Transition::StepRetryScheduled {
                    step_id: "b".into(),
                    error: err("b", ErrorKind::TransientNetwork),
                    deadline_ms: 400,
                },
                300,
            )
            .unwrap_err();
        assert!(matches!(e, HiveError::RetryLimitExceeded { max: 2, .. }));
        assert_eq!(snap.execution_state.retry_count("b"), 2);
    }

    #[test]
    fn test_waiting_step_cannot_start_early() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        snap.apply(
            Transition::StepRetryScheduled {
                step_id: "a".into(),
                error: err("a", ErrorKind::Validation),
                deadline_ms: 500,
            },
            0,
        )
        .unwrap();
        let r = snap.apply(
            Transition::StepStarted {
                step_id: "a".into(),
                prompt: String::new(),
            },
            100,
        );
        assert!(r.is_err());
        start(&mut snap, "a", 500);
        assert_eq!(snap.execution_state.attempt("a"), 2);
    }

    #[test]
    fn test_fatal_kind_cannot_be_retried() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        let r = snap.apply(
            Transition::StepRetryScheduled {
                step_id: "a".into(),
                error: err("a", ErrorKind::CapabilityUnsupported),
                deadline_ms: 10,
            },
            0,
        );
        assert!(matches!(r, Err(HiveError::InvalidTransition { .. })));
    }

    #[test]
    fn test_fatal_failure_fails_run_and_skips_rest() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        snap.apply(
            Transition::StepFailed {
                step_id: "a".into(),
                error: err("a", ErrorKind::Fatal),
            },
            1,
        )
        .unwrap();
        assert_eq!(snap.status(), RunStatus::Failed);
        let failure = snap.execution_state.failure.clone().unwrap();
        assert_eq!(failure.step_id.as_deref(), Some("a"));
        assert!(!failure.cancelled);
        assert_eq!(snap.execution_state.step_status("b"), Some(StepStatus::Skipped));
    }

    #[test]
    fn test_fallback_activation_satisfies_dependents() {
        let plan = PlanBuilder::new("g")
            .step("open", "browser", json!("u"))
            .step("open_alt", "search", json!("u"))
            .step("sum", "echo", json!("s"))
            .with_fallback("open", "open_alt")
            .sequential("open", "sum")
            .build()
            .unwrap();
        let mut snap = RunSnapshot::new("run_1".into(), plan, None, 0);
        assert_eq!(
            snap.execution_state.step_status("open_alt"),
            Some(StepStatus::Standby)
        );
        start(&mut snap, "open", 0);
        snap.apply(
            Transition::StepFailed {
                step_id: "open".into(),
                error: err("open", ErrorKind::CapabilityUnsupported),
            },
            1,
        )
        .unwrap();
        assert_eq!(snap.status(), RunStatus::Running);
        assert_eq!(snap.execution_state.next_eligible, vec!["open_alt".to_string()]);
        start(&mut snap, "open_alt", 2);
        succeed(&mut snap, "open_alt");
        assert!(snap.execution_state.completed.contains("open"));
        assert_eq!(snap.execution_state.next_eligible, vec!["sum".to_string()]);
        start(&mut snap, "sum", 3);
        succeed(&mut snap, "sum");
        assert_eq!(snap.status(), RunStatus::Succeeded);
    }

    #[test]
    fn test_unused_fallback_is_skipped() {
        let plan = PlanBuilder::new("g")
            .step("a", "echo", json!("a"))
            .step("a_alt", "echo", json!("a"))
            .with_fallback("a", "a_alt")
            .build()
            .unwrap();
        let mut snap = RunSnapshot::new("run_1".into(), plan, None, 0);
        start(&mut snap, "a", 0);
        succeed(&mut snap, "a");
        assert_eq!(snap.status(), RunStatus::Succeeded);
        assert_eq!(snap.execution_state.step_status("a_alt"), Some(StepStatus::Skipped));
    }

    #[test]
    fn test_cancel_marks_unstarted_and_keeps_running() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        snap.apply(
            Transition::RunCancelled {
                reason: "user abort".into(),
            },
            1,
        )
        .unwrap();
        assert_eq!(snap.status(), RunStatus::Failed);
        assert_eq!(snap.execution_state.step_status("a"), Some(StepStatus::Running));
        assert_eq!(snap.execution_state.step_status("b"), Some(StepStatus::Cancelled));
        assert!(snap.execution_state.ready_at(i64::MAX).is_empty());

        // 在途步骤的结果仍被记录，运行保持 failed
        succeed(&mut snap, "a");
        assert_eq!(snap.status(), RunStatus::Failed);
        assert_eq!(
            snap.execution_state.failure.as_ref().map(|f| f.cancelled),
            Some(true)
        );
        assert!(snap
            .apply(Transition::RunCancelled { reason: "again".into() }, 2)
            .is_err());
    }

    #[test]
    fn test_interrupted_step_returns_to_pending() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        let events = snap
            .apply(Transition::StepInterrupted { step_id: "a".into() }, 5)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Interrupted);
        assert_eq!(snap.execution_state.next_eligible, vec!["a".to_string()]);
    }

    #[test]
    fn test_correction_appends_without_touching_execution() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        succeed(&mut snap, "a");
        let before = snap.execution_state.steps.clone();
        let events = snap
            .apply(
                Transition::EventCorrected {
                    corrects: 2,
                    note: "payload was truncated".into(),
                    payload: json!("full"),
                },
                9,
            )
            .unwrap();
        assert_eq!(events[0].seq, 3);
        assert_eq!(events[0].step_id.as_deref(), Some("a"));
        assert_eq!(snap.execution_state.steps, before);
        assert!(snap
            .apply(
                Transition::EventCorrected {
                    corrects: 99,
                    note: String::new(),
                    payload: Value::Null
                },
                9
            )
            .is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), Some("run_0".into()), 0);
        start(&mut snap, "a", 0);
        succeed(&mut snap, "a");
        let json = serde_json::to_string(&snap).unwrap();
        let restored: RunSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snap);
    }

    #[test]
    fn test_latest_result_and_reverse_step_events() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        snap.apply(
            Transition::StepSucceeded {
                step_id: "a".into(),
                result: InvocationResult {
                    payload: json!({"n": 1}),
                    artifacts: vec![ArtifactRef::new("file:///tmp/a.txt")],
                },
            },
            1,
        )
        .unwrap();
        let id = String::from("a");
        let (payload, artifacts) = snap.latest_result(&id).unwrap();
        assert_eq!(payload, &json!({"n": 1}));
        assert_eq!(artifacts.len(), 1);

        let last = snap.events_for("a").rev().next().unwrap();
        assert!(matches!(last.kind, EventKind::Result { .. }));
        assert!(snap.latest_result("b").is_none());
    }

    #[test]
    fn test_interrupted_step_after_cancel_is_cancelled() {
        let mut snap = RunSnapshot::new("run_1".into(), abc(), None, 0);
        start(&mut snap, "a", 0);
        snap.apply(
            Transition::RunCancelled {
                reason: "user abort".into(),
            },
            1,
        )
        .unwrap();
        snap.apply(Transition::StepInterrupted { step_id: "a".into() }, 2)
            .unwrap();
        assert_eq!(snap.execution_state.step_status("a"), Some(StepStatus::Cancelled));
        assert!(snap.execution_state.running_steps().is_empty());
        assert_eq!(snap.status(), RunStatus::Failed);
    }
}
