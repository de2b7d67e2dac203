//! Orchestrator：驱动计划执行的主控循环
//!
//! 每轮从执行状态取出可调度步骤（依赖已满足、或重试截止时间已到），在每运行并发上限内逐个：
//! 选择记忆 → 编译提示词 → 记录 StepStarted → 交给网关调用。调用在 FuturesUnordered 中并发等待，
//! 任一步骤完成即处理其结果：成功则记录并重算；失败则分类，可重试且未达上限时安排带退避的重试，
//! 否则标记失败（有备用步骤时启用备用步骤）。
//!
//! 取消是协作式的：取消令牌在每次派发前检查；已在执行的调用完成或超时后才记录结果，不再派发新步骤。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{ErrorRecord, HiveError, Result};
use crate::core::events::OrchestratorEvent;
use crate::core::recovery::{ErrorClassifier, RetryDecision, RetryPolicy};
use crate::core::session_supervisor::RunSupervisor;
use crate::core::state::{
    Event, EventKind, ExecutionState, RunId, RunSnapshot, RunStatus, StepStatus, Transition,
    DEFAULT_MAX_RETRIES,
};
use crate::memory::{
    create_memory_store, ContextBudget, MemoryManager, OutcomeLabel, RunContext, SelectionConfig,
};
use crate::prompt::{BusinessStateView, CompiledPrompt, PromptCompiler, TemplateRegistry};
use crate::store::{create_state_store, StateStore};
use crate::tools::{AgentRegistry, InvocationOutcome, InvocationRequest, RawFailure, ToolGateway};
use crate::workflow::{Plan, Step, StepId};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 每个运行同时执行的步骤上限
    pub concurrency_limit: usize,
    pub retry_policy: RetryPolicy,
    /// 步骤未指定 max_retries 时使用
    pub default_max_retries: u32,
    pub default_template: String,
    pub memory_budget: ContextBudget,
    /// 步骤结束后写入情景记忆
    pub record_outcomes: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            retry_policy: RetryPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_template: "agent_step".to_string(),
            memory_budget: ContextBudget::chars(4000),
            record_outcomes: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            concurrency_limit: cfg.orchestrator.concurrency_limit.max(1),
            retry_policy: cfg.orchestrator.retry_policy(),
            default_max_retries: cfg.orchestrator.max_retries,
            default_template: cfg.orchestrator.default_template.clone(),
            memory_budget: cfg.memory.budget(),
            record_outcomes: cfg.orchestrator.record_outcomes,
        }
    }
}

/// 运行结束后返回给调用方的报告：失败步骤、最终错误记录与完整业务事件
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub failed_step: Option<StepId>,
    pub error: Option<ErrorRecord>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub execution_state: ExecutionState,
    pub business_state: Vec<Event>,
}

impl RunReport {
    pub fn from_snapshot(snapshot: RunSnapshot) -> Self {
        let failure = snapshot.execution_state.failure.clone();
        let cancellation_reason = failure
            .as_ref()
            .filter(|f| f.cancelled)
            .map(|f| f.reason.clone());
        Self {
            run_id: snapshot.run_id,
            status: snapshot.execution_state.status,
            failed_step: failure.as_ref().and_then(|f| f.step_id.clone()),
            error: failure.as_ref().and_then(|f| f.error.clone()),
            failure_reason: failure.map(|f| f.reason),
            cancellation_reason,
            execution_state: snapshot.execution_state,
            business_state: snapshot.business_state,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// 某步骤的事件（调用顺序）
    pub fn events_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.business_state
            .iter()
            .filter(move |e| e.step_id.as_deref() == Some(step_id))
    }
}

/// 派发一个步骤的结果
enum Dispatch {
    Invoke(Box<Step>, InvocationRequest),
    /// 编译失败，已直接记录为失败
    Failed,
    /// 状态已变化，本轮跳过
    Skipped,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    memory: MemoryManager,
    compiler: PromptCompiler,
    gateway: ToolGateway,
    classifier: ErrorClassifier,
    supervisor: Arc<RunSupervisor>,
    settings: OrchestratorSettings,
    events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        memory: MemoryManager,
        compiler: PromptCompiler,
        gateway: ToolGateway,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            memory,
            compiler,
            gateway,
            classifier: ErrorClassifier::new(),
            supervisor: Arc::new(RunSupervisor::new()),
            settings,
            events: None,
        }
    }

    /// 按配置组装：状态存储、记忆存储、模板（内置 + 模板目录）、网关
    pub fn from_config(cfg: &AppConfig, registry: AgentRegistry) -> Result<Self> {
        let store = create_state_store(cfg)?;
        let memory = MemoryManager::new(
            create_memory_store(cfg)?,
            SelectionConfig {
                procedural_reserve: cfg.memory.procedural_reserve,
                recency_half_life_ms: cfg.memory.half_life_ms(),
            },
        );
        let mut templates = TemplateRegistry::with_builtins();
        if let Some(dir) = &cfg.prompts.template_dir {
            let n = templates.load_dir(dir)?;
            tracing::info!(dir = %dir.display(), count = n, "Prompt templates loaded");
        }
        let gateway = ToolGateway::new(
            registry,
            cfg.gateway.timeout_secs,
            cfg.gateway.max_concurrent_invocations,
        );
        Ok(Self::new(
            store,
            memory,
            PromptCompiler::new(templates),
            gateway,
            OrchestratorSettings::from_config(cfg),
        ))
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn supervisor(&self) -> &Arc<RunSupervisor> {
        &self.supervisor
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// 接受计划：补全默认重试上限，校验 DAG，创建运行
    pub async fn accept_plan(&self, mut plan: Plan) -> Result<RunId> {
        self.fill_defaults(&mut plan);
        let run_id = self.store.create_run(plan).await?;
        tracing::info!(run_id = %run_id, "Plan accepted");
        Ok(run_id)
    }

    /// 接受并执行到终态
    pub async fn run(&self, plan: Plan) -> Result<RunReport> {
        let run_id = self.accept_plan(plan).await?;
        self.execute(&run_id).await
    }

    /// 驱动一个已创建的运行直到终态；同一运行同时只能有一个驱动者
    pub async fn execute(&self, run_id: &str) -> Result<RunReport> {
        let Some(token) = self.supervisor.begin(run_id).await else {
            return Err(already_executing(run_id));
        };
        let result = self.drive_to_end(run_id, &token).await;
        self.supervisor.release(run_id).await;
        result
    }

    /// 从持久化状态恢复：崩溃时仍在执行的步骤放回 pending（运行已结束则标记 cancelled），
    /// 已成功的步骤不会重新派发
    pub async fn resume(&self, run_id: &str) -> Result<RunReport> {
        let Some(token) = self.supervisor.begin(run_id).await else {
            return Err(already_executing(run_id));
        };
        let result = match self.interrupt_running(run_id).await {
            Ok(()) => self.drive_to_end(run_id, &token).await,
            Err(e) => Err(e),
        };
        self.supervisor.release(run_id).await;
        result
    }

    async fn interrupt_running(&self, run_id: &str) -> Result<()> {
        let snapshot = self.store.snapshot(run_id).await?;
        for step_id in snapshot.execution_state.running_steps() {
            tracing::warn!(run_id = %run_id, step_id = %step_id, "Step was interrupted");
            self.store
                .apply(run_id, Transition::StepInterrupted { step_id })
                .await?;
        }
        Ok(())
    }

    async fn drive_to_end(&self, run_id: &str, token: &CancellationToken) -> Result<RunReport> {
        let (state, _) = self.store.get_state(run_id).await?;
        if state.terminal {
            return self.report(run_id).await;
        }
        self.drive(run_id, token).await?;

        let report = self.report(run_id).await?;
        tracing::info!(run_id = %run_id, status = ?report.status, "Run finished");
        self.emit(OrchestratorEvent::RunFinished {
            run_id: run_id.to_string(),
            status: report.status,
        });
        Ok(report)
    }

    /// 恢复存储中所有未结束的运行
    pub async fn resume_pending(&self) -> Result<Vec<RunReport>> {
        let mut pending = Vec::new();
        for run_id in self.store.run_ids().await {
            let (state, _) = self.store.get_state(&run_id).await?;
            if !state.terminal || !state.running_steps().is_empty() {
                pending.push(run_id);
            }
        }
        tracing::info!(count = pending.len(), "Resuming unfinished runs");
        let results =
            futures_util::future::join_all(pending.iter().map(|id| self.resume(id))).await;
        results.into_iter().collect()
    }

    /// 取消运行；运行已结束时返回 false
    ///
    /// 正在驱动的运行由其主循环在下一个挂起点记录取消；未在驱动的运行直接记录。
    pub async fn cancel(&self, run_id: &str, reason: &str) -> Result<bool> {
        if self.supervisor.cancel(run_id, reason).await {
            tracing::warn!(run_id = %run_id, reason, "Run cancellation requested");
            return Ok(true);
        }
        let (state, _) = self.store.get_state(run_id).await?;
        if state.terminal {
            return Ok(false);
        }
        self.store
            .apply(
                run_id,
                Transition::RunCancelled {
                    reason: reason.to_string(),
                },
            )
            .await?;
        tracing::warn!(run_id = %run_id, reason, "Run cancelled");
        self.emit(OrchestratorEvent::RunCancelled {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// 关闭：取消所有正在驱动的运行
    pub async fn shutdown(&self, reason: &str) {
        tracing::info!(reason, "Orchestrator shutting down");
        self.supervisor.shutdown(reason).await;
    }

    /// 重新规划：新计划须沿用旧计划 ID 且版本更高；旧运行未结束时先取消
    pub async fn replan(&self, previous_run: &str, mut plan: Plan) -> Result<RunId> {
        let previous = self.store.snapshot(previous_run).await?;
        if plan.id != previous.plan.id {
            return Err(HiveError::PlanValidation(format!(
                "replanned plan id '{}' does not match '{}'",
                plan.id, previous.plan.id
            )));
        }
        if plan.version <= previous.plan_version {
            return Err(HiveError::PlanValidation(format!(
                "plan version {} must be greater than {}",
                plan.version, previous.plan_version
            )));
        }
        if !previous.execution_state.terminal {
            let reason = format!("superseded by plan version {}", plan.version);
            self.cancel(previous_run, &reason).await?;
        }
        self.fill_defaults(&mut plan);
        let run_id = self
            .store
            .create_linked_run(plan, Some(previous_run.to_string()))
            .await?;
        tracing::info!(run_id = %run_id, replaces = %previous_run, "Replanned run accepted");
        Ok(run_id)
    }

    pub async fn report(&self, run_id: &str) -> Result<RunReport> {
        Ok(RunReport::from_snapshot(self.store.snapshot(run_id).await?))
    }

    /// 规划提示词：当前日期、可用 Agent 目录与任务
    pub fn planning_prompt(&self, task: &str, current_date: &str) -> Result<CompiledPrompt> {
        let view = BusinessStateView::default()
            .with_var("current_date", current_date)
            .with_var("tool_list", self.gateway.registry().catalogue())
            .with_var("task", task);
        self.compiler.compile("planning", &view, &[], None)
    }

    fn fill_defaults(&self, plan: &mut Plan) {
        for step in &mut plan.steps {
            if step.max_retries.is_none() {
                step.max_retries = Some(self.settings.default_max_retries);
            }
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 主循环
    async fn drive(&self, run_id: &str, token: &CancellationToken) -> Result<()> {
        let limit = self.settings.concurrency_limit.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut cancel_seen = false;

        let (state, _) = self.store.get_state(run_id).await?;
        if state.status == RunStatus::Pending {
            self.store.apply(run_id, Transition::RunStarted).await?;
            tracing::info!(run_id = %run_id, "Run started");
        }

        loop {
            if token.is_cancelled() && !cancel_seen {
                cancel_seen = true;
                self.record_cancellation(run_id).await?;
            }

            let snapshot = self.store.snapshot(run_id).await?;
            if snapshot.execution_state.terminal && in_flight.is_empty() {
                return Ok(());
            }

            if !cancel_seen && !snapshot.execution_state.terminal {
                let now = chrono::Utc::now().timestamp_millis();
                for step_id in snapshot.execution_state.ready_at(now) {
                    if in_flight.len() >= limit || token.is_cancelled() {
                        break;
                    }
                    match self.dispatch(&snapshot, &step_id).await? {
                        Dispatch::Invoke(step, request) => {
                            in_flight.push(self.call_agent(*step, request));
                        }
                        Dispatch::Failed => break,
                        Dispatch::Skipped => {}
                    }
                }
            }

            let (state, _) = self.store.get_state(run_id).await?;
            if in_flight.is_empty() {
                if state.terminal || cancel_seen || token.is_cancelled() {
                    continue;
                }
                let now = chrono::Utc::now().timestamp_millis();
                if !state.ready_at(now).is_empty() {
                    continue;
                }
                let Some(deadline) = state.next_deadline() else {
                    return Err(HiveError::Stalled(run_id.to_string()));
                };
                tracing::debug!(run_id = %run_id, deadline, "Waiting for retry deadline");
                tokio::select! {
                    _ = tokio::time::sleep(until(deadline)) => {}
                    _ = token.cancelled() => {}
                }
                continue;
            }

            let wake = state.next_deadline().filter(|_| in_flight.len() < limit);
            tokio::select! {
                Some((step, outcome)) = in_flight.next() => {
                    self.handle_outcome(run_id, &step, outcome).await?;
                }
                _ = token.cancelled(), if !cancel_seen => {}
                _ = tokio::time::sleep(wake.map(until).unwrap_or(Duration::ZERO)), if wake.is_some() => {}
            }
        }
    }

    /// 为步骤选择记忆、编译提示词并记录 StepStarted
    async fn dispatch(&self, snapshot: &RunSnapshot, step_id: &str) -> Result<Dispatch> {
        let run_id = snapshot.run_id.as_str();
        let step = snapshot
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| HiveError::StepNotFound(step_id.to_string()))?;

        let ctx = RunContext {
            run_id: run_id.to_string(),
            task_id: Some(snapshot.plan.id.clone()),
            goal: snapshot.plan.goal.clone(),
            now_ms: snapshot.created_at,
        };
        let memories = self
            .memory
            .select(&ctx, &step, &self.settings.memory_budget);
        let feedback = last_retry_error(snapshot, step_id);
        let view = BusinessStateView::for_step(snapshot, &step);
        let template_id = step
            .template
            .clone()
            .unwrap_or_else(|| self.settings.default_template.clone());

        let compiled = self
            .compiler
            .compile(&template_id, &view, &memories, feedback.as_ref());

        let prompt = match &compiled {
            Ok(c) => c.text.clone(),
            Err(_) => String::new(),
        };
        let started = self
            .store
            .apply(
                run_id,
                Transition::StepStarted {
                    step_id: step.id.clone(),
                    prompt: prompt.clone(),
                },
            )
            .await;
        let state = match started {
            Ok(state) => state,
            Err(HiveError::InvalidTransition { reason, .. }) => {
                tracing::debug!(run_id = %run_id, step_id = %step.id, reason = %reason, "Step not startable yet");
                return Ok(Dispatch::Skipped);
            }
            Err(e) => return Err(e),
        };
        let attempt = state.attempt(&step.id);

        let compiled = match compiled {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(run_id = %run_id, step_id = %step.id, error = %e, "Prompt compilation failed");
                let record = self.classifier.classify(&RawFailure {
                    step_id: step.id.clone(),
                    agent_id: step.agent_id.clone(),
                    attempt,
                    reason_code: "prompt_compile_failed".to_string(),
                    detail: e.to_string(),
                });
                self.fail_step(run_id, &step, record).await?;
                return Ok(Dispatch::Failed);
            }
        };

        tracing::info!(
            run_id = %run_id,
            step_id = %step.id,
            agent = %step.agent_id,
            attempt,
            memories = compiled.memory_ids.len(),
            remediation = compiled.has_remediation,
            "Step dispatched"
        );
        self.emit(OrchestratorEvent::StepDispatched {
            run_id: run_id.to_string(),
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            attempt,
        });

        let request = InvocationRequest {
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            attempt,
            prompt,
            input_kind: step.input_kind,
            input: step.input.clone(),
        };
        Ok(Dispatch::Invoke(Box::new(step), request))
    }

    async fn call_agent(&self, step: Step, request: InvocationRequest) -> (Step, InvocationOutcome) {
        let timeout = step.timeout_secs.map(Duration::from_secs);
        let outcome = self.gateway.invoke(request, timeout).await;
        (step, outcome)
    }

    async fn handle_outcome(&self, run_id: &str, step: &Step, outcome: InvocationOutcome) -> Result<()> {
        match outcome {
            InvocationOutcome::Success(result) => {
                let payload = result.payload.clone();
                self.store
                    .apply(
                        run_id,
                        Transition::StepSucceeded {
                            step_id: step.id.clone(),
                            result,
                        },
                    )
                    .await?;
                tracing::info!(run_id = %run_id, step_id = %step.id, "Step succeeded");
                self.emit(OrchestratorEvent::StepSucceeded {
                    run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                });
                self.record_outcome(step, &payload, OutcomeLabel::Success);
            }
            InvocationOutcome::Failure(raw) => {
                let record = self.classifier.classify(&raw);
                let (state, _) = self.store.get_state(run_id).await?;
                let limit = state.retry_limit(&step.id);
                let decision = if state.terminal {
                    RetryDecision::GiveUp
                } else {
                    self.settings
                        .retry_policy
                        .decide(record.kind, state.retry_count(&step.id), limit)
                };

                match decision {
                    RetryDecision::Retry { delay } => {
                        let deadline_ms =
                            chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
                        self.store
                            .apply(
                                run_id,
                                Transition::StepRetryScheduled {
                                    step_id: step.id.clone(),
                                    error: record.clone(),
                                    deadline_ms,
                                },
                            )
                            .await?;
                        tracing::warn!(
                            run_id = %run_id,
                            step_id = %step.id,
                            kind = %record.kind,
                            reason_code = %record.reason_code,
                            retry = state.retry_count(&step.id) + 1,
                            max = limit,
                            delay_ms = delay.as_millis() as u64,
                            "Step failed; retry scheduled"
                        );
                        self.emit(OrchestratorEvent::StepRetrying {
                            run_id: run_id.to_string(),
                            step_id: step.id.clone(),
                            error: record,
                            delay_ms: delay.as_millis() as u64,
                        });
                    }
                    RetryDecision::GiveUp => {
                        let record = if record.is_retryable() {
                            let reason = match &state.failure {
                                Some(f) if f.cancelled => format!("run was cancelled ({})", f.reason),
                                Some(_) => "run has already failed".to_string(),
                                None => format!("retry limit {limit} reached"),
                            };
                            record.escalate(&reason)
                        } else {
                            record
                        };
                        self.fail_step(run_id, step, record).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// 记录步骤失败；主步骤有待命的备用步骤时启用它
    async fn fail_step(&self, run_id: &str, step: &Step, record: ErrorRecord) -> Result<()> {
        let state = self
            .store
            .apply(
                run_id,
                Transition::StepFailed {
                    step_id: step.id.clone(),
                    error: record.clone(),
                },
            )
            .await?;

        let activated = step
            .fallback
            .clone()
            .filter(|fb| state.step_status(fb) == Some(StepStatus::Pending));
        match activated {
            Some(fallback_id) => {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    fallback = %fallback_id,
                    kind = %record.kind,
                    "Step failed; fallback activated"
                );
                self.emit(OrchestratorEvent::FallbackActivated {
                    run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                    fallback_id,
                });
            }
            None => {
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step.id,
                    kind = %record.kind,
                    reason_code = %record.reason_code,
                    "Step failed"
                );
                self.emit(OrchestratorEvent::StepFailed {
                    run_id: run_id.to_string(),
                    step_id: step.id.clone(),
                    error: record.clone(),
                });
            }
        }

        let summary = serde_json::json!({
            "error": record.message,
            "reason_code": record.reason_code,
        });
        self.record_outcome(step, &summary, OutcomeLabel::Failure);
        Ok(())
    }

    fn record_outcome(&self, step: &Step, payload: &serde_json::Value, label: OutcomeLabel) {
        if !self.settings.record_outcomes {
            return;
        }
        if let Err(e) = self.memory.record_outcome(step, payload, label) {
            tracing::warn!(step_id = %step.id, error = %e, "Failed to record episodic memory");
        }
    }

    async fn record_cancellation(&self, run_id: &str) -> Result<()> {
        let reason = self
            .supervisor
            .reason(run_id)
            .await
            .unwrap_or_else(|| "cancelled".to_string());
        let (state, _) = self.store.get_state(run_id).await?;
        if state.terminal {
            return Ok(());
        }
        self.store
            .apply(
                run_id,
                Transition::RunCancelled {
                    reason: reason.clone(),
                },
            )
            .await?;
        tracing::warn!(run_id = %run_id, reason = %reason, "Run cancelled");
        self.emit(OrchestratorEvent::RunCancelled {
            run_id: run_id.to_string(),
            reason,
        });
        Ok(())
    }
}

/// 步骤最近一次有效事件若是安排了重试的失败，返回其错误记录（作为下一次编译的修复反馈）
///
/// 更正事件不计；被中断的调用连同其 Invocation 一起跳过。
fn last_retry_error(snapshot: &RunSnapshot, step_id: &str) -> Option<ErrorRecord> {
    let mut interrupted = false;
    for event in snapshot.events_for(step_id).rev() {
        match &event.kind {
            EventKind::Correction { .. } => {}
            EventKind::Interrupted => interrupted = true,
            EventKind::Invocation { .. } if interrupted => interrupted = false,
            EventKind::Failure {
                error,
                retry_at_ms: Some(_),
            } => return Some(error.clone()),
            _ => return None,
        }
    }
    None
}

fn already_executing(run_id: &str) -> HiveError {
    HiveError::InvalidTransition {
        target: run_id.to_string(),
        reason: "run is already being executed".to_string(),
    }
}

fn until(deadline_ms: i64) -> Duration {
    let now = chrono::Utc::now().timestamp_millis();
    Duration::from_millis((deadline_ms - now).max(0) as u64)
}
