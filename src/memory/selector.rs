//! 记忆选择（Memory Manager）
//!
//! 每个步骤按作用域层级（任务 > Agent > 全局）排序，同层按相关度 × 时间衰减 × 新鲜度排序，
//! 分数相同取较新者，再按 ID 定序。先为匹配的程序记忆保留名额，剩余预算由其它记忆贪心填充。
//! 当前时间取自 `RunContext.now_ms`，不读时钟，同一运行的重试得到相同结果。

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use crate::core::error::Result;
use crate::memory::long_term::MemoryStore;
use crate::memory::token_budget::ContextBudget;
use crate::memory::tokenizer::{jaccard_similarity, tokenize_to_set};
use crate::memory::types::{MemoryItem, MemoryKind, MemoryScope, OutcomeLabel};
use crate::workflow::Step;

/// 每个标签命中的相关度加分
const TAG_BONUS: f64 = 0.25;
/// 情景记忆内容的最大字符数
const EPISODE_MAX_CHARS: usize = 1000;

/// 选择时的运行上下文
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    /// 任务作用域记忆按此匹配（取计划 ID，重新规划后不变）
    pub task_id: Option<String>,
    pub goal: String,
    /// 选择的参考时间；晚于此刻创建的记忆不可见
    pub now_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// 程序记忆的保底条数
    pub procedural_reserve: usize,
    pub recency_half_life_ms: i64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            procedural_reserve: 2,
            recency_half_life_ms: 72 * 3_600_000,
        }
    }
}

struct Candidate {
    item: MemoryItem,
    tier: u8,
    score: f64,
    size: usize,
}

pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    config: SelectionConfig,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, config: SelectionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// 为步骤选择记忆，总量不超过预算；只选完整条目，不截断
    pub fn select(&self, ctx: &RunContext, step: &Step, budget: &ContextBudget) -> Vec<MemoryItem> {
        let query = format!("{} {} {}", ctx.goal, step.input_text(), step.tags.join(" "));
        let query_tokens = tokenize_to_set(&query);
        let step_tags: BTreeSet<String> = step.tags.iter().map(|t| t.to_lowercase()).collect();

        let mut candidates: Vec<Candidate> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|m| m.created_at <= ctx.now_ms)
            .filter(|m| scope_matches(&m.scope, ctx, step))
            .filter_map(|item| {
                let relevance = relevance(&item, &query_tokens, &step_tags);
                if item.kind != MemoryKind::Procedural && relevance <= 0.0 {
                    return None;
                }
                let base = if item.kind == MemoryKind::Procedural {
                    1.0 + relevance
                } else {
                    relevance
                };
                let score = base
                    * self.decay(ctx.now_ms - item.created_at)
                    * (1.0 - item.staleness_score.clamp(0.0, 1.0));
                Some(Candidate {
                    tier: item.scope.tier(),
                    size: budget.measure(&item.content),
                    score,
                    item,
                })
            })
            .collect();

        candidates.sort_by(rank);

        let mut chosen = vec![false; candidates.len()];
        let mut used = 0usize;
        let mut reserved = 0usize;

        for (i, c) in candidates.iter().enumerate() {
            if reserved >= self.config.procedural_reserve {
                break;
            }
            if c.item.kind == MemoryKind::Procedural && used + c.size <= budget.limit {
                chosen[i] = true;
                used += c.size;
                reserved += 1;
            }
        }

        for (i, c) in candidates.iter().enumerate() {
            if !chosen[i] && used + c.size <= budget.limit {
                chosen[i] = true;
                used += c.size;
            }
        }

        tracing::debug!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            candidates = candidates.len(),
            selected = chosen.iter().filter(|c| **c).count(),
            used,
            limit = budget.limit,
            "Memory selected"
        );

        candidates
            .into_iter()
            .zip(chosen)
            .filter(|(_, keep)| *keep)
            .map(|(c, _)| c.item)
            .collect()
    }

    /// 将步骤结果写为 Agent 作用域的情景记忆；失败不影响当前运行
    pub fn record_outcome(
        &self,
        step: &Step,
        result: &Value,
        label: OutcomeLabel,
    ) -> Result<MemoryItem> {
        let output = match result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let content: String = format!("Input: {}\nOutput: {}", step.input_text(), output)
            .chars()
            .take(EPISODE_MAX_CHARS)
            .collect();
        let mut item = MemoryItem::episodic(
            MemoryScope::Agent(step.agent_id.clone()),
            content,
            label,
            chrono::Utc::now().timestamp_millis(),
        );
        item.tags = step.tags.clone();
        self.store.insert(item.clone())?;
        Ok(item)
    }

    fn decay(&self, age_ms: i64) -> f64 {
        if self.config.recency_half_life_ms <= 0 {
            return 1.0;
        }
        let age = age_ms.max(0) as f64;
        0.5f64.powf(age / self.config.recency_half_life_ms as f64)
    }
}

fn scope_matches(scope: &MemoryScope, ctx: &RunContext, step: &Step) -> bool {
    match scope {
        MemoryScope::Global => true,
        MemoryScope::Agent(id) => *id == step.agent_id,
        MemoryScope::Task(id) => ctx.task_id.as_deref() == Some(id.as_str()),
    }
}

fn relevance(item: &MemoryItem, query: &BTreeSet<String>, step_tags: &BTreeSet<String>) -> f64 {
    let text = format!("{} {}", item.content, item.tags.join(" "));
    let similarity = jaccard_similarity(query, &tokenize_to_set(&text));
    let tag_hits = item
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .filter(|t| step_tags.contains(t) || query.contains(t))
        .count();
    similarity + TAG_BONUS * tag_hits as f64
}

/// 层级升序、分数降序、创建时间降序、ID 升序
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.tier
        .cmp(&b.tier)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| b.item.created_at.cmp(&a.item.created_at))
        .then_with(|| a.item.id.cmp(&b.item.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::long_term::InMemoryStore;
    use serde_json::json;

    const NOW: i64 = 1_000_000_000;

    fn ctx() -> RunContext {
        RunContext {
            run_id: "run_1".into(),
            task_id: Some("plan_1".into()),
            goal: "rust async runtime".into(),
            now_ms: NOW,
        }
    }

    fn step() -> Step {
        let mut s = Step::new("b", "search", json!("tokio scheduler internals"));
        s.tags = vec!["rust".into()];
        s
    }

    fn manager(items: Vec<MemoryItem>, reserve: usize) -> MemoryManager {
        MemoryManager::new(
            Arc::new(InMemoryStore::with_items(items, 100)),
            SelectionConfig {
                procedural_reserve: reserve,
                recency_half_life_ms: 3_600_000,
            },
        )
    }

    fn ids(items: &[MemoryItem]) -> Vec<&str> {
        items.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_scope_tiers_and_exclusion() {
        let items = vec![
            MemoryItem::semantic(MemoryScope::Global, "rust runtime facts", NOW).with_id("g"),
            MemoryItem::semantic(MemoryScope::Agent("search".into()), "tokio scheduler notes", NOW)
                .with_id("agent"),
            MemoryItem::semantic(MemoryScope::Task("plan_1".into()), "async runtime summary", NOW)
                .with_id("task"),
            MemoryItem::semantic(MemoryScope::Agent("browser".into()), "rust runtime", NOW)
                .with_id("other_agent"),
            MemoryItem::semantic(MemoryScope::Task("plan_9".into()), "rust runtime", NOW)
                .with_id("other_task"),
        ];
        let selected = manager(items, 0).select(&ctx(), &step(), &ContextBudget::chars(1000));
        assert_eq!(ids(&selected), vec!["task", "agent", "g"]);
    }

    #[test]
    fn test_irrelevant_episodic_excluded_but_procedural_kept() {
        let items = vec![
            MemoryItem::semantic(MemoryScope::Global, "banana bread recipe", NOW).with_id("noise"),
            MemoryItem::procedural(MemoryScope::Agent("search".into()), "Always cite sources.", NOW)
                .with_id("rule"),
        ];
        let selected = manager(items, 1).select(&ctx(), &step(), &ContextBudget::chars(1000));
        assert_eq!(ids(&selected), vec!["rule"]);
    }

    #[test]
    fn test_budget_never_exceeded() {
        let items: Vec<MemoryItem> = (0..20)
            .map(|i| {
                MemoryItem::semantic(MemoryScope::Global, format!("rust runtime note {i:02}"), NOW - i)
                    .with_id(format!("m{i:02}"))
            })
            .collect();
        let budget = ContextBudget::chars(60);
        let selected = manager(items, 0).select(&ctx(), &step(), &budget);
        let total: usize = selected.iter().map(|m| budget.measure(&m.content)).sum();
        assert!(total <= 60);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_procedural_reserve_beats_higher_tier_semantic() {
        let big = "rust async runtime ".repeat(5);
        let items = vec![
            MemoryItem::semantic(MemoryScope::Task("plan_1".into()), big.clone(), NOW).with_id("task"),
            MemoryItem::procedural(MemoryScope::Global, "Prefer primary sources.", NOW).with_id("rule"),
        ];
        let budget = ContextBudget::chars(big.chars().count());
        let selected = manager(items, 1).select(&ctx(), &step(), &budget);
        assert_eq!(ids(&selected), vec!["rule"]);
    }

    #[test]
    fn test_recency_and_staleness_ordering() {
        let items = vec![
            MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW - 7_200_000).with_id("old"),
            MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW).with_id("fresh"),
            MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW)
                .with_id("stale")
                .with_staleness(0.9),
        ];
        let selected = manager(items, 0).select(&ctx(), &step(), &ContextBudget::chars(1000));
        assert_eq!(ids(&selected), vec!["fresh", "old", "stale"]);
    }

    #[test]
    fn test_tie_broken_by_most_recent_then_id() {
        let mut c = ctx();
        let items = vec![
            MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW).with_id("b"),
            MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW).with_id("a"),
        ];
        let m = MemoryManager::new(
            Arc::new(InMemoryStore::with_items(items, 100)),
            SelectionConfig {
                procedural_reserve: 0,
                recency_half_life_ms: 0,
            },
        );
        c.now_ms = NOW + 10;
        assert_eq!(ids(&m.select(&c, &step(), &ContextBudget::chars(100))), vec!["a", "b"]);
    }

    #[test]
    fn test_selection_is_deterministic_and_ignores_future_items() {
        let m = manager(
            vec![
                MemoryItem::semantic(MemoryScope::Global, "rust runtime", NOW).with_id("x"),
                MemoryItem::semantic(MemoryScope::Global, "rust runtime later", NOW + 1).with_id("y"),
            ],
            0,
        );
        let first = m.select(&ctx(), &step(), &ContextBudget::chars(100));
        let second = m.select(&ctx(), &step(), &ContextBudget::chars(100));
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["x"]);
    }

    #[test]
    fn test_record_outcome_creates_agent_episode() {
        let m = manager(vec![], 0);
        let item = m
            .record_outcome(&step(), &json!({"answer": 42}), OutcomeLabel::Success)
            .unwrap();
        assert_eq!(item.kind, MemoryKind::Episodic);
        assert_eq!(item.scope, MemoryScope::Agent("search".into()));
        assert!(item.content.contains("tokio scheduler internals"));
        assert_eq!(m.store().len(), 1);
    }
}
