//! 运行状态存储
//!
//! `StateStore` 是执行状态与业务事件的唯一变更入口；`RunStore` 为进程内实现，可挂接 SQLite 持久化以支持崩溃恢复。

pub mod run_store;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::core::error::{HiveError, Result};
use crate::core::state::{Event, ExecutionState, RunId, RunSnapshot, Transition};
use crate::workflow::Plan;

pub use run_store::{RunPersistence, RunStore};
pub use sqlite::SqlitePersistence;

/// 状态存储接口
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 接受计划并创建运行（校验 DAG）
    async fn create_run(&self, plan: Plan) -> Result<RunId> {
        self.create_linked_run(plan, None).await
    }

    /// 创建运行并记录它替代的旧运行（重新规划）
    async fn create_linked_run(&self, plan: Plan, replaces: Option<RunId>) -> Result<RunId>;

    /// 执行状态与业务事件快照
    async fn get_state(&self, run_id: &str) -> Result<(ExecutionState, Vec<Event>)>;

    /// 完整运行记录（含计划）
    async fn snapshot(&self, run_id: &str) -> Result<RunSnapshot>;

    /// 唯一的变更操作；同一运行串行执行
    async fn apply(&self, run_id: &str, transition: Transition) -> Result<ExecutionState>;

    async fn run_ids(&self) -> Vec<RunId>;
}

/// 根据配置创建状态存储
///
/// - `memory`：仅内存
/// - `sqlite`：`store.sqlite_path`，缺省为 `<data_dir>/hive.db`
pub fn create_state_store(cfg: &AppConfig) -> Result<Arc<dyn StateStore>> {
    match cfg.store.backend.as_str() {
        "memory" => {
            tracing::info!("Using in-memory state store");
            Ok(Arc::new(RunStore::in_memory()))
        }
        "sqlite" => {
            let path = cfg
                .store
                .sqlite_path
                .clone()
                .unwrap_or_else(|| cfg.app.data_dir.join("hive.db"));
            tracing::info!(path = %path.display(), "Using SQLite state store");
            let persistence = SqlitePersistence::open(&path)?;
            Ok(Arc::new(RunStore::open(Arc::new(persistence))?))
        }
        other => Err(HiveError::Config(format!(
            "unknown store backend '{other}' (expected memory or sqlite)"
        ))),
    }
}
