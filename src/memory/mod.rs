//! 记忆层：记忆条目、存储（内存 / JSONL）、分词、预算、按步骤选择

pub mod long_term;
pub mod selector;
pub mod token_budget;
pub mod tokenizer;
pub mod types;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::error::Result;

pub use long_term::{InMemoryStore, JsonlMemoryStore, MemoryStore};
pub use selector::{MemoryManager, RunContext, SelectionConfig};
pub use token_budget::{BudgetUnit, ContextBudget, TokenEstimator};
pub use types::{MemoryItem, MemoryKind, MemoryScope, OutcomeLabel};

/// 根据配置创建记忆存储：设置了 `memory.store_path` 时使用 JSONL 文件，否则仅内存
pub fn create_memory_store(cfg: &AppConfig) -> Result<Arc<dyn MemoryStore>> {
    match &cfg.memory.store_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Using JSONL memory store");
            Ok(Arc::new(JsonlMemoryStore::open(path, cfg.memory.max_entries)?))
        }
        None => {
            tracing::info!("Using in-memory memory store");
            Ok(Arc::new(InMemoryStore::new(cfg.memory.max_entries)))
        }
    }
}
