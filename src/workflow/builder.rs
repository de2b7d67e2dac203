//! 计划构建器
//!
//! 提供流畅的API来构建计划

use serde_json::Value;

use crate::core::error::Result;
use crate::tools::InputKind;
use crate::workflow::graph::PlanGraph;
use crate::workflow::types::*;

/// 计划构建器；`build` 时做 DAG 校验
pub struct PlanBuilder {
    id: PlanId,
    version: u32,
    goal: String,
    steps: Vec<Step>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            version: 1,
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    /// 指定计划 ID（重新规划时沿用旧 ID）
    pub fn id(mut self, id: impl Into<PlanId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// 添加步骤
    pub fn step(mut self, id: impl Into<StepId>, agent_id: impl Into<String>, input: Value) -> Self {
        self.steps.push(Step::new(id, agent_id, input));
        self
    }

    fn with_step(mut self, id: &str, f: impl FnOnce(&mut Step)) -> Self {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            f(step);
        }
        self
    }

    /// 设置顺序依赖：`to` 在 `from` 完成后执行
    pub fn sequential(self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        let from = from.into();
        let to = to.into();
        self.with_step(&to, |s| {
            if !s.depends_on.contains(&from) {
                s.depends_on.push(from);
            }
        })
    }

    /// 设置依赖（所有前置步骤）
    pub fn depends_on(self, step_id: impl Into<StepId>, deps: &[&str]) -> Self {
        let id = step_id.into();
        self.with_step(&id, |s| {
            for dep in deps {
                if !s.depends_on.iter().any(|d| d == dep) {
                    s.depends_on.push(dep.to_string());
                }
            }
        })
    }

    /// 设置失败备用步骤
    pub fn with_fallback(self, step_id: impl Into<StepId>, fallback_id: impl Into<StepId>) -> Self {
        let id = step_id.into();
        let fb = fallback_id.into();
        self.with_step(&id, |s| s.fallback = Some(fb))
    }

    pub fn max_retries(self, step_id: impl Into<StepId>, max: u32) -> Self {
        let id = step_id.into();
        self.with_step(&id, |s| s.max_retries = Some(max))
    }

    pub fn template(self, step_id: impl Into<StepId>, template_id: impl Into<String>) -> Self {
        let id = step_id.into();
        let template = template_id.into();
        self.with_step(&id, |s| s.template = Some(template))
    }

    pub fn timeout_secs(self, step_id: impl Into<StepId>, secs: u64) -> Self {
        let id = step_id.into();
        self.with_step(&id, |s| s.timeout_secs = Some(secs))
    }

    pub fn input_kind(self, step_id: impl Into<StepId>, kind: InputKind) -> Self {
        let id = step_id.into();
        self.with_step(&id, |s| s.input_kind = kind)
    }

    pub fn tags(self, step_id: impl Into<StepId>, tags: &[&str]) -> Self {
        let id = step_id.into();
        self.with_step(&id, |s| s.tags = tags.iter().map(|t| t.to_string()).collect())
    }

    /// 构建计划
    pub fn build(self) -> Result<Plan> {
        let plan = Plan {
            id: self.id,
            version: self.version,
            goal: self.goal,
            steps: self.steps,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        PlanGraph::validate(&plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::HiveError;
    use serde_json::json;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("research")
            .step("a", "search", json!("rust"))
            .step("b", "reasoning", json!("analyze"))
            .step("c", "reasoning", json!("write"))
            .sequential("a", "b")
            .depends_on("c", &["a", "b"])
            .max_retries("b", 5)
            .build()
            .expect("Failed to build plan");

        assert_eq!(plan.goal, "research");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.step("b").unwrap().depends_on, vec!["a".to_string()]);
        assert_eq!(plan.step("c").unwrap().depends_on.len(), 2);
        assert_eq!(plan.step("b").unwrap().max_retries, Some(5));
    }

    #[test]
    fn test_build_cyclic_plan_fails() {
        let result = PlanBuilder::new("loop")
            .step("a", "echo", json!("a"))
            .step("b", "echo", json!("b"))
            .sequential("a", "b")
            .sequential("b", "a")
            .build();

        assert!(matches!(result, Err(HiveError::PlanValidation(_))));
    }

    #[test]
    fn test_build_with_fallback() {
        let plan = PlanBuilder::new("browse")
            .id("plan_fixed")
            .version(2)
            .step("open", "browser", json!("https://example.com"))
            .step("open_alt", "search", json!("example.com"))
            .with_fallback("open", "open_alt")
            .build()
            .unwrap();
        assert_eq!(plan.id, "plan_fixed");
        assert_eq!(plan.version, 2);
        assert!(plan.is_fallback("open_alt"));
    }
}
