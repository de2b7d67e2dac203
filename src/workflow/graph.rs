//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 校验（Kahn 拓扑排序）

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::core::error::{HiveError, Result};
use crate::workflow::types::*;

/// 计划依赖图
#[derive(Debug)]
pub struct PlanGraph {
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: BTreeMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 依赖数
    pub in_degree: BTreeMap<StepId, usize>,
}

impl PlanGraph {
    /// 构建依赖图；未知依赖在 `validate` 中报错，这里忽略
    pub fn new(plan: &Plan) -> Self {
        let mut adjacency: BTreeMap<StepId, Vec<StepId>> = BTreeMap::new();
        let mut in_degree: BTreeMap<StepId, usize> = BTreeMap::new();

        for step in &plan.steps {
            in_degree.insert(step.id.clone(), 0);
            adjacency.insert(step.id.clone(), Vec::new());
        }

        for step in &plan.steps {
            for dep in &step.depends_on {
                if !in_degree.contains_key(dep) {
                    continue;
                }
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            adjacency,
            in_degree,
        }
    }

    /// 校验计划：ID 唯一、依赖存在、无自依赖、无环、备用步骤合法
    pub fn validate(plan: &Plan) -> Result<()> {
        if plan.steps.is_empty() {
            return Err(HiveError::PlanValidation("plan has no steps".into()));
        }

        let mut ids = HashSet::new();
        for step in &plan.steps {
            if step.id.trim().is_empty() {
                return Err(HiveError::PlanValidation("step id must not be empty".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(HiveError::PlanValidation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &plan.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(HiveError::PlanValidation(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(HiveError::PlanValidation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        Self::validate_fallbacks(plan, &ids)?;

        let order = Self::new(plan).topological_order();
        if order.len() != plan.steps.len() {
            let in_cycle: Vec<&str> = plan
                .steps
                .iter()
                .map(|s| s.id.as_str())
                .filter(|id| !order.iter().any(|o| o == id))
                .collect();
            return Err(HiveError::PlanValidation(format!(
                "cyclic dependency among steps: {}",
                in_cycle.join(", ")
            )));
        }
        Ok(())
    }

    fn validate_fallbacks(plan: &Plan, ids: &HashSet<&str>) -> Result<()> {
        let mut used: HashMap<&str, &str> = HashMap::new();
        let depended_on: HashSet<&str> = plan
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();

        for step in &plan.steps {
            let Some(fb) = step.fallback.as_deref() else {
                continue;
            };
            if fb == step.id {
                return Err(HiveError::PlanValidation(format!(
                    "step '{}' is its own fallback",
                    step.id
                )));
            }
            if !ids.contains(fb) {
                return Err(HiveError::PlanValidation(format!(
                    "step '{}' names unknown fallback '{}'",
                    step.id, fb
                )));
            }
            if let Some(other) = used.insert(fb, step.id.as_str()) {
                return Err(HiveError::PlanValidation(format!(
                    "fallback '{}' is shared by '{}' and '{}'",
                    fb, other, step.id
                )));
            }
            if Self::depends_transitively(plan, fb, &step.id) {
                return Err(HiveError::PlanValidation(format!(
                    "fallback '{}' must not depend on its primary '{}'",
                    fb, step.id
                )));
            }
            if depended_on.contains(fb) {
                return Err(HiveError::PlanValidation(format!(
                    "fallback '{}' must not appear in depends_on; depend on '{}' instead",
                    fb, step.id
                )));
            }
        }

        // 备用链不能回到自身
        for step in &plan.steps {
            let mut seen = HashSet::new();
            let mut cur = step.id.as_str();
            while let Some(next) = plan.step(cur).and_then(|s| s.fallback.as_deref()) {
                if !seen.insert(cur) || next == step.id {
                    return Err(HiveError::PlanValidation(format!(
                        "fallback chain starting at '{}' is cyclic",
                        step.id
                    )));
                }
                cur = next;
            }
        }
        Ok(())
    }

    /// `from` 是否经由 depends_on（直接或间接）依赖 `target`
    fn depends_transitively(plan: &Plan, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(step) = plan.step(id) else { continue };
            for dep in &step.depends_on {
                if dep == target {
                    return true;
                }
                stack.push(dep.as_str());
            }
        }
        false
    }

    /// Kahn 拓扑排序；同层按 ID 排序，结果确定。存在环时返回的序列短于步骤数
    pub fn topological_order(&self) -> Vec<StepId> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                let mut released = BTreeSet::new();
                for dep in dependents {
                    if let Some(d) = in_degree.get_mut(dep) {
                        *d -= 1;
                        if *d == 0 {
                            released.insert(dep.clone());
                        }
                    }
                }
                queue.extend(released);
            }
            order.push(id);
        }
        order
    }
}
