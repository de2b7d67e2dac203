//! 规划器输出解析
//!
//! 规划 Agent 的输出由两段组成：`<PLANNING_TAG>` 内是 JSON（`steps` + `dag`），`<FINAL_ANSWER_TAG>` 内是文本。
//! `dag` 的每一项是步骤 ID 或并行组（嵌套数组），每一项依赖上一项中的全部步骤。

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::core::error::{HiveError, Result};
use crate::workflow::graph::PlanGraph;
use crate::workflow::types::{Plan, Step};

/// 解析结果：计划可能为空（规划器认为无需继续），最终答案可能缺省
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Option<Plan>,
    pub final_answer: Option<String>,
}

#[derive(Deserialize)]
struct RawPlan {
    steps: HashMap<String, RawStep>,
    dag: Vec<DagEntry>,
}

#[derive(Deserialize)]
struct RawStep {
    input: Value,
    /// 目标 Agent / 工具 ID
    id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DagEntry {
    Single(String),
    Parallel(Vec<String>),
}

impl DagEntry {
    fn ids(&self) -> Vec<String> {
        match self {
            DagEntry::Single(id) => vec![id.clone()],
            DagEntry::Parallel(ids) => ids.clone(),
        }
    }
}

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("valid tag regex")
}

fn planning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| tag_regex("PLANNING_TAG"))
}

fn final_answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| tag_regex("FINAL_ANSWER_TAG"))
}

/// 解析规划器输出为计划
pub fn parse_plan_output(text: &str, goal: &str) -> Result<PlannerOutput> {
    let planning = planning_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    let final_answer = final_answer_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    if planning.is_none() && final_answer.is_none() {
        return Err(HiveError::PlanValidation(
            "planner output contains neither PLANNING_TAG nor FINAL_ANSWER_TAG".into(),
        ));
    }

    let plan = match planning.as_deref() {
        None | Some("") | Some("{}") => None,
        Some(json) => Some(build_plan(json, goal)?),
    };

    Ok(PlannerOutput { plan, final_answer })
}

fn build_plan(json: &str, goal: &str) -> Result<Plan> {
    let raw: RawPlan = serde_json::from_str(json)
        .map_err(|e| HiveError::PlanValidation(format!("invalid planning JSON: {e}")))?;

    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(raw.steps.len());
    let mut previous: Vec<String> = Vec::new();

    for entry in &raw.dag {
        let ids = entry.ids();
        for id in &ids {
            let Some(rs) = raw.steps.get(id) else {
                return Err(HiveError::PlanValidation(format!(
                    "dag references unknown step '{id}'"
                )));
            };
            if !seen.insert(id.clone()) {
                return Err(HiveError::PlanValidation(format!(
                    "step '{id}' appears more than once in dag"
                )));
            }
            let mut step = Step::new(id.clone(), rs.id.clone(), rs.input.clone());
            step.depends_on = previous.clone();
            steps.push(step);
        }
        if !ids.is_empty() {
            previous = ids;
        }
    }

    let mut missing: Vec<&String> = raw.steps.keys().filter(|k| !seen.contains(*k)).collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(HiveError::PlanValidation(format!(
            "steps missing from dag: {}",
            missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }

    let plan = Plan::new(goal, steps);
    PlanGraph::validate(&plan)?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = r#"
<PLANNING_TAG>
{
  "steps": {
    "agent_step_1": {"input": "Search NEV policy updates", "id": "search_tool"},
    "agent_step_2": {"input": "Search NEV challenges", "id": "search_tool"},
    "agent_step_3": {"input": "Synthesize findings", "id": "analysis_tool"}
  },
  "dag": [["agent_step_1", "agent_step_2"], "agent_step_3"]
}
</PLANNING_TAG>

<FINAL_ANSWER_TAG>
We will summarize trends and challenges.
</FINAL_ANSWER_TAG>
"#;

    #[test]
    fn test_parse_parallel_group() {
        let out = parse_plan_output(OUTPUT, "NEV market 2024").unwrap();
        let plan = out.plan.unwrap();
        assert_eq!(plan.goal, "NEV market 2024");
        assert_eq!(plan.steps.len(), 3);
        assert!(plan.step("agent_step_1").unwrap().depends_on.is_empty());
        assert!(plan.step("agent_step_2").unwrap().depends_on.is_empty());
        assert_eq!(
            plan.step("agent_step_3").unwrap().depends_on,
            vec!["agent_step_1".to_string(), "agent_step_2".to_string()]
        );
        assert_eq!(plan.step("agent_step_3").unwrap().agent_id, "analysis_tool");
        assert_eq!(
            out.final_answer.as_deref(),
            Some("We will summarize trends and challenges.")
        );
    }

    #[test]
    fn test_parse_sequential_dag() {
        let text = r#"<PLANNING_TAG>{"steps": {"s1": {"input": "a", "id": "x"}, "s2": {"input": "b", "id": "y"}}, "dag": ["s1", "s2"]}</PLANNING_TAG>"#;
        let plan = parse_plan_output(text, "g").unwrap().plan.unwrap();
        assert_eq!(plan.step("s2").unwrap().depends_on, vec!["s1".to_string()]);
    }

    #[test]
    fn test_empty_planning_section_yields_only_answer() {
        let text = "<PLANNING_TAG>\n</PLANNING_TAG>\n<FINAL_ANSWER_TAG>done</FINAL_ANSWER_TAG>";
        let out = parse_plan_output(text, "g").unwrap();
        assert!(out.plan.is_none());
        assert_eq!(out.final_answer.as_deref(), Some("done"));
    }

    #[test]
    fn test_rejects_bad_output() {
        assert!(parse_plan_output("no tags here", "g").is_err());

        let invalid_json = "<PLANNING_TAG>{not json}</PLANNING_TAG>";
        assert!(parse_plan_output(invalid_json, "g").is_err());

        let unknown = r#"<PLANNING_TAG>{"steps": {"s1": {"input": "a", "id": "x"}}, "dag": ["s1", "s9"]}</PLANNING_TAG>"#;
        assert!(parse_plan_output(unknown, "g").is_err());

        let missing = r#"<PLANNING_TAG>{"steps": {"s1": {"input": "a", "id": "x"}, "s2": {"input": "b", "id": "x"}}, "dag": ["s1"]}</PLANNING_TAG>"#;
        let err = parse_plan_output(missing, "g").unwrap_err();
        assert!(matches!(err, HiveError::PlanValidation(msg) if msg.contains("s2")));
    }
}
