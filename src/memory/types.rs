//! 记忆条目
//!
//! 三类记忆：情景（过往输入/输出样例 + 结果标签）、程序（常驻指令/约束）、语义（事实或检索到的文档）。
//! 存储格式 `{kind, scope, content, tags[], created_at, staleness_score}`，外部整理工具可直接写入程序记忆。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Episodic,
    Procedural,
    Semantic,
}

/// 作用域：全局、某个 Agent、某个任务
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "snake_case")]
pub enum MemoryScope {
    Global,
    Agent(String),
    Task(String),
}

impl MemoryScope {
    /// 排序层级：任务 0 < Agent 1 < 全局 2
    pub fn tier(&self) -> u8 {
        match self {
            MemoryScope::Task(_) => 0,
            MemoryScope::Agent(_) => 1,
            MemoryScope::Global => 2,
        }
    }
}

/// 情景记忆的结果标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeLabel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    #[serde(default = "new_memory_id")]
    pub id: String,
    pub kind: MemoryKind,
    pub scope: MemoryScope,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 毫秒时间戳
    pub created_at: i64,
    /// 0.0（新鲜）~ 1.0（完全过时）
    #[serde(default)]
    pub staleness_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeLabel>,
}

fn new_memory_id() -> String {
    format!("mem_{}", uuid::Uuid::new_v4())
}

impl MemoryItem {
    pub fn new(kind: MemoryKind, scope: MemoryScope, content: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: new_memory_id(),
            kind,
            scope,
            content: content.into(),
            tags: Vec::new(),
            created_at,
            staleness_score: 0.0,
            outcome: None,
        }
    }

    pub fn procedural(scope: MemoryScope, content: impl Into<String>, created_at: i64) -> Self {
        Self::new(MemoryKind::Procedural, scope, content, created_at)
    }

    pub fn semantic(scope: MemoryScope, content: impl Into<String>, created_at: i64) -> Self {
        Self::new(MemoryKind::Semantic, scope, content, created_at)
    }

    pub fn episodic(
        scope: MemoryScope,
        content: impl Into<String>,
        outcome: OutcomeLabel,
        created_at: i64,
    ) -> Self {
        let mut item = Self::new(MemoryKind::Episodic, scope, content, created_at);
        item.outcome = Some(outcome);
        item
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_staleness(mut self, staleness: f64) -> Self {
        self.staleness_score = staleness.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_serialization() {
        let v = serde_json::to_value(MemoryScope::Agent("search".into())).unwrap();
        assert_eq!(v, serde_json::json!({"level": "agent", "id": "search"}));
        let g: MemoryScope = serde_json::from_value(serde_json::json!({"level": "global"})).unwrap();
        assert_eq!(g, MemoryScope::Global);
    }

    #[test]
    fn test_curated_item_without_id_gets_one() {
        let item: MemoryItem = serde_json::from_value(serde_json::json!({
            "kind": "procedural",
            "scope": {"level": "agent", "id": "browser"},
            "content": "Always cite the URL.",
            "created_at": 0
        }))
        .unwrap();
        assert!(item.id.starts_with("mem_"));
        assert_eq!(item.staleness_score, 0.0);
        assert_eq!(item.scope.tier(), 1);
    }
}
