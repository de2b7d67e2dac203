//! 计划类型定义
//!
//! Plan 是步骤的有向无环图；每个 Step 指定目标 Agent、输入载荷与前置步骤。计划一经接受即不可变，
//! 重新规划产生同一 plan id 的新版本。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::InputKind;

pub type PlanId = String;
pub type StepId = String;

fn default_plan_id() -> PlanId {
    format!("plan_{}", uuid::Uuid::new_v4())
}

fn default_version() -> u32 {
    1
}

/// 计划：一组带依赖关系的步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "default_plan_id")]
    pub id: PlanId,
    #[serde(default = "default_version")]
    pub version: u32,
    /// 本次运行的总目标，参与记忆检索与提示词渲染
    #[serde(default)]
    pub goal: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub created_at: i64,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: default_plan_id(),
            version: 1,
            goal: goal.into(),
            steps,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// 是否为某个步骤的备用步骤（待命，不主动调度）
    pub fn is_fallback(&self, id: &str) -> bool {
        self.steps.iter().any(|s| s.fallback.as_deref() == Some(id))
    }

    /// 以 `id` 为备用步骤的主步骤
    pub fn primary_of(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.fallback.as_deref() == Some(id))
    }

    /// 基于新步骤生成同一计划的下一版本
    pub fn next_version(&self, steps: Vec<Step>) -> Plan {
        Plan {
            id: self.id.clone(),
            version: self.version + 1,
            goal: self.goal.clone(),
            steps,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// 目标 Agent ID
    pub agent_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// 本步骤 fatal 失败时启用的备用步骤
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<StepId>,
    /// 覆盖默认提示词模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// 覆盖默认重试上限
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// 覆盖网关默认超时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub input_kind: InputKind,
    /// 记忆检索用的相关标签
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            input,
            depends_on: Vec::new(),
            fallback: None,
            template: None,
            max_retries: None,
            timeout_secs: None,
            input_kind: InputKind::Text,
            tags: Vec::new(),
        }
    }

    /// 输入的文本形式：字符串原样返回，其它 JSON 序列化
    pub fn input_text(&self) -> String {
        match &self.input {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}
