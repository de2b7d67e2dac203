//! Prompt Compiler
//!
//! `compile(template_id, view, memories, error_feedback)` 只依赖输入，不读时钟、不做 IO：
//! 相同输入总是得到相同输出。有上次失败的错误记录时，在模板正文之后追加 `## Remediation` 段，
//! 下一次调用的输入中直接包含"哪里失败、要改什么"。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{ErrorRecord, HiveError, Result};
use crate::core::state::{RunSnapshot, StepStatus};
use crate::memory::MemoryItem;
use crate::prompt::template::TemplateRegistry;
use crate::tools::ArtifactRef;
use crate::workflow::{Step, StepId};

/// 历史输出在提示词中的最大字符数
const HISTORY_MAX_CHARS: usize = 2000;

/// 依赖步骤的输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: StepId,
    pub agent_id: String,
    pub output: Value,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
}

/// 编译时看到的业务状态
///
/// `step_id`/`agent_id`/`input` 为 None 时不进入变量表，需要它们的模板渲染失败。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessStateView {
    pub goal: String,
    pub step_id: Option<StepId>,
    pub agent_id: Option<String>,
    pub input: Option<String>,
    pub history: Vec<HistoryEntry>,
    /// 额外变量；与内置变量同名时被内置变量覆盖
    pub vars: BTreeMap<String, String>,
}

impl BusinessStateView {
    /// 从运行快照构造某步骤的视图：依赖步骤的最近结果（主步骤失败时取其备用步骤的结果）
    pub fn for_step(snapshot: &RunSnapshot, step: &Step) -> Self {
        let history = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                let provider = satisfied_provider(snapshot, dep)?;
                let (output, artifacts) = snapshot.latest_result(&provider)?;
                let agent_id = snapshot
                    .plan
                    .step(&provider)
                    .map(|s| s.agent_id.clone())
                    .unwrap_or_default();
                Some(HistoryEntry {
                    step_id: provider,
                    agent_id,
                    output: output.clone(),
                    artifacts: artifacts.to_vec(),
                })
            })
            .collect();

        let mut vars = BTreeMap::new();
        vars.insert("run_id".to_string(), snapshot.run_id.clone());
        vars.insert("plan_id".to_string(), snapshot.plan.id.clone());

        Self {
            goal: snapshot.plan.goal.clone(),
            step_id: Some(step.id.clone()),
            agent_id: Some(step.agent_id.clone()),
            input: Some(step.input_text()),
            history,
            vars,
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

/// 沿备用链找到成功的步骤
fn satisfied_provider(snapshot: &RunSnapshot, step_id: &str) -> Option<StepId> {
    let mut current = step_id.to_string();
    for _ in 0..=snapshot.plan.steps.len() {
        match snapshot.execution_state.step_status(&current)? {
            StepStatus::Succeeded => return Some(current),
            StepStatus::Failed => current = snapshot.plan.step(&current)?.fallback.clone()?,
            _ => return None,
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPrompt {
    pub template_id: String,
    pub text: String,
    /// 注入的记忆 ID（按注入顺序）
    pub memory_ids: Vec<String>,
    pub has_remediation: bool,
}

pub struct PromptCompiler {
    templates: TemplateRegistry,
}

impl PromptCompiler {
    pub fn new(templates: TemplateRegistry) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn compile(
        &self,
        template_id: &str,
        view: &BusinessStateView,
        memories: &[MemoryItem],
        error_feedback: Option<&ErrorRecord>,
    ) -> Result<CompiledPrompt> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| HiveError::TemplateNotFound(template_id.to_string()))?;

        let mut vars = view.vars.clone();
        vars.insert("goal".to_string(), view.goal.clone());
        if let Some(step_id) = &view.step_id {
            vars.insert("step_id".to_string(), step_id.clone());
        }
        if let Some(agent_id) = &view.agent_id {
            vars.insert("agent_id".to_string(), agent_id.clone());
        }
        if let Some(input) = &view.input {
            vars.insert("input".to_string(), input.clone());
        }
        vars.insert("history".to_string(), render_history(&view.history));
        vars.insert("memories".to_string(), render_memories(memories));

        let mut text = template.render(&vars)?;
        if let Some(error) = error_feedback {
            text.push_str("\n\n");
            text.push_str(&render_remediation(error));
        }

        tracing::debug!(
            template = template_id,
            memories = memories.len(),
            remediation = error_feedback.is_some(),
            chars = text.chars().count(),
            "Prompt compiled"
        );

        Ok(CompiledPrompt {
            template_id: template_id.to_string(),
            text,
            memory_ids: memories.iter().map(|m| m.id.clone()).collect(),
            has_remediation: error_feedback.is_some(),
        })
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_history(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return "(none)".to_string();
    }
    let mut out = String::new();
    for (i, h) in history.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let output: String = value_text(&h.output).chars().take(HISTORY_MAX_CHARS).collect();
        out.push_str(&format!("### {} ({})\n{}\n", h.step_id, h.agent_id, output));
        for a in &h.artifacts {
            match &a.description {
                Some(d) => out.push_str(&format!("- artifact: {} ({})\n", a.uri, d)),
                None => out.push_str(&format!("- artifact: {}\n", a.uri)),
            }
        }
    }
    out.trim_end().to_string()
}

fn render_memories(memories: &[MemoryItem]) -> String {
    if memories.is_empty() {
        return "(none)".to_string();
    }
    memories
        .iter()
        .map(|m| {
            let kind = serde_json::to_value(m.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("- [{}] {}", kind, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_remediation(error: &ErrorRecord) -> String {
    let mut out = String::from("## Remediation\n");
    out.push_str(&format!(
        "The previous attempt (attempt {}) failed: {} ({}).\n",
        error.attempt, error.kind, error.reason_code
    ));
    if !error.message.is_empty() {
        out.push_str(&format!("Error: {}\n", error.message));
    }
    out.push_str(&format!("What failed: {}\n", error.remediation.what_failed));
    out.push_str(&format!("What to change: {}", error.remediation.what_to_change));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recovery::ErrorClassifier;
    use crate::core::state::Transition;
    use crate::memory::MemoryScope;
    use crate::prompt::PromptTemplate;
    use crate::tools::{InvocationResult, RawFailure};
    use crate::workflow::PlanBuilder;
    use serde_json::json;

    fn compiler() -> PromptCompiler {
        PromptCompiler::new(TemplateRegistry::with_builtins())
    }

    fn view() -> BusinessStateView {
        BusinessStateView {
            goal: "Summarise the release notes".into(),
            step_id: Some("b".into()),
            agent_id: Some("writer".into()),
            input: Some("Write a summary".into()),
            history: vec![HistoryEntry {
                step_id: "a".into(),
                agent_id: "fetch".into(),
                output: json!("v1.2 adds retries"),
                artifacts: vec![ArtifactRef::new("file:///tmp/notes.md")],
            }],
            vars: BTreeMap::new(),
        }
    }

    #[test]
    fn test_compile_is_pure() {
        let mem = vec![MemoryItem::procedural(MemoryScope::Global, "Be brief.", 0).with_id("m1")];
        let c = compiler();
        let first = c.compile("agent_step", &view(), &mem, None).unwrap();
        let second = c.compile("agent_step", &view(), &mem, None).unwrap();
        assert_eq!(first, second);
        assert!(first.text.contains("### a (fetch)\nv1.2 adds retries"));
        assert!(first.text.contains("- artifact: file:///tmp/notes.md"));
        assert!(first.text.contains("- [procedural] Be brief."));
        assert_eq!(first.memory_ids, vec!["m1"]);
        assert!(!first.has_remediation);
    }

    #[test]
    fn test_unknown_template() {
        let err = compiler().compile("nope", &view(), &[], None).unwrap_err();
        assert!(matches!(err, HiveError::TemplateNotFound(id) if id == "nope"));
    }

    #[test]
    fn test_missing_required_variable() {
        let mut v = view();
        v.input = None;
        let err = compiler().compile("agent_step", &v, &[], None).unwrap_err();
        assert!(matches!(err, HiveError::Render { variable, .. } if variable == "input"));
    }

    #[test]
    fn test_remediation_appended_after_body() {
        let error = ErrorClassifier::new().classify(&RawFailure {
            step_id: "b".into(),
            agent_id: "writer".into(),
            attempt: 1,
            reason_code: "invalid_input".into(),
            detail: "field 'lang' missing".into(),
        });
        let out = compiler()
            .compile("agent_step", &view(), &[], Some(&error))
            .unwrap();
        let body_end = out.text.find("## Relevant Memory").unwrap();
        let rem = out.text.find("## Remediation").unwrap();
        assert!(rem > body_end);
        assert!(out.text.contains("field 'lang' missing"));
        assert!(out.has_remediation);
    }

    #[test]
    fn test_planning_template_with_vars() {
        let v = BusinessStateView::default()
            .with_var("current_date", "2026-10-19")
            .with_var("tool_list", "- echo (text): echoes input")
            .with_var("task", "say hi");
        let mut reg = TemplateRegistry::with_builtins();
        reg.register(PromptTemplate::new("tiny", "{{task}}!", &["task"]));
        let c = PromptCompiler::new(reg);
        let out = c.compile("planning", &v, &[], None).unwrap();
        assert!(out.text.contains("The current date is 2026-10-19."));
        assert!(out.text.contains("- echo (text): echoes input"));
        assert_eq!(c.compile("tiny", &v, &[], None).unwrap().text, "say hi!");
    }

    #[test]
    fn test_view_follows_fallback_result() {
        let plan = PlanBuilder::new("goal")
            .id("p")
            .step("a", "primary", json!("x"))
            .step("a_alt", "backup", json!("x"))
            .with_fallback("a", "a_alt")
            .step("b", "writer", json!("y"))
            .depends_on("b", &["a"])
            .build()
            .unwrap();
        let mut snap = RunSnapshot::new("run_1".into(), plan, None, 0);
        let error = ErrorClassifier::new().classify(&RawFailure {
            step_id: "a".into(),
            agent_id: "primary".into(),
            attempt: 1,
            reason_code: "not_found".into(),
            detail: "gone".into(),
        });
        snap.apply(Transition::StepStarted { step_id: "a".into(), prompt: String::new() }, 1)
            .unwrap();
        snap.apply(Transition::StepFailed { step_id: "a".into(), error }, 2)
            .unwrap();
        snap.apply(Transition::StepStarted { step_id: "a_alt".into(), prompt: String::new() }, 3)
            .unwrap();
        snap.apply(
            Transition::StepSucceeded {
                step_id: "a_alt".into(),
                result: InvocationResult {
                    payload: json!("from backup"),
                    artifacts: vec![],
                },
            },
            4,
        )
        .unwrap();

        let step = snap.plan.step("b").unwrap().clone();
        let v = BusinessStateView::for_step(&snap, &step);
        assert_eq!(v.history.len(), 1);
        assert_eq!(v.history[0].step_id, "a_alt");
        assert_eq!(v.history[0].output, json!("from backup"));
        assert_eq!(v.vars.get("plan_id").map(String::as_str), Some("p"));
    }
}
