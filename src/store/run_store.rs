//! 进程内运行存储
//!
//! 每个运行一把 `RwLock<RunSnapshot>`：apply 持写锁（同一运行单写者串行），读取持读锁（多读者），
//! 不同运行之间互不阻塞。apply 在副本上执行转换，持久化成功后才提交，失败时内存状态保持不变。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::error::{HiveError, Result};
use crate::core::state::{Event, ExecutionState, RunId, RunSnapshot, Transition};
use crate::store::StateStore;
use crate::workflow::{Plan, PlanGraph};

/// 持久化后端：保存新运行、每次转换后的执行状态与新增事件，启动时全部加载
pub trait RunPersistence: Send + Sync {
    fn load_all(&self) -> Result<Vec<RunSnapshot>>;

    fn save_run(&self, snapshot: &RunSnapshot) -> Result<()>;

    /// `new_events` 为本次转换追加的事件
    fn save_transition(&self, snapshot: &RunSnapshot, new_events: &[Event]) -> Result<()>;
}

/// 运行存储：内存索引 + 可选持久化
pub struct RunStore {
    runs: RwLock<HashMap<RunId, Arc<RwLock<RunSnapshot>>>>,
    persistence: Option<Arc<dyn RunPersistence>>,
}

impl RunStore {
    /// 仅内存，进程退出即丢失
    pub fn in_memory() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    /// 带持久化；加载已有运行以便恢复
    pub fn open(persistence: Arc<dyn RunPersistence>) -> Result<Self> {
        let mut runs = HashMap::new();
        for snapshot in persistence.load_all()? {
            runs.insert(snapshot.run_id.clone(), Arc::new(RwLock::new(snapshot)));
        }
        tracing::info!(runs = runs.len(), "Loaded persisted runs");
        Ok(Self {
            runs: RwLock::new(runs),
            persistence: Some(persistence),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    async fn cell(&self, run_id: &str) -> Result<Arc<RwLock<RunSnapshot>>> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| HiveError::RunNotFound(run_id.to_string()))
    }
}

#[async_trait]
impl StateStore for RunStore {
    async fn create_linked_run(&self, plan: Plan, replaces: Option<RunId>) -> Result<RunId> {
        PlanGraph::validate(&plan)?;
        if let Some(prev) = &replaces {
            self.cell(prev).await?;
        }
        let run_id = format!("run_{}", uuid::Uuid::new_v4());
        let now = chrono::Utc::now().timestamp_millis();
        let snapshot = RunSnapshot::new(run_id.clone(), plan, replaces, now);
        if let Some(p) = &self.persistence {
            p.save_run(&snapshot)?;
        }
        self.runs
            .write()
            .await
            .insert(run_id.clone(), Arc::new(RwLock::new(snapshot)));
        tracing::debug!(run_id = %run_id, "Run created");
        Ok(run_id)
    }

    async fn get_state(&self, run_id: &str) -> Result<(ExecutionState, Vec<Event>)> {
        let cell = self.cell(run_id).await?;
        let snap = cell.read().await;
        Ok((snap.execution_state.clone(), snap.business_state.clone()))
    }

    async fn snapshot(&self, run_id: &str) -> Result<RunSnapshot> {
        let cell = self.cell(run_id).await?;
        let snap = cell.read().await;
        Ok(snap.clone())
    }

    async fn apply(&self, run_id: &str, transition: Transition) -> Result<ExecutionState> {
        let cell = self.cell(run_id).await?;
        let mut guard = cell.write().await;
        let mut next = guard.clone();
        let now = chrono::Utc::now().timestamp_millis();
        let events = next.apply(transition, now)?;
        if let Some(p) = &self.persistence {
            p.save_transition(&next, &events)?;
        }
        *guard = next;
        Ok(guard.execution_state.clone())
    }

    async fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
