//! 运行监管：取消令牌与生命周期
//!
//! 持有根 CancellationToken（进程关闭时触发），每个活跃运行派生一个子 token；
//! 取消某个运行只影响它自己，关闭进程会级联取消所有运行。

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::state::RunId;

#[derive(Debug)]
struct ActiveRun {
    token: CancellationToken,
    reason: Option<String>,
}

/// 运行级生命周期管理
#[derive(Debug)]
pub struct RunSupervisor {
    root: CancellationToken,
    shutdown_reason: RwLock<Option<String>>,
    runs: RwLock<HashMap<RunId, ActiveRun>>,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            shutdown_reason: RwLock::new(None),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一个开始驱动的运行，返回其子 token；运行已在驱动中时返回 None
    pub async fn begin(&self, run_id: &str) -> Option<CancellationToken> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(run_id) {
            return None;
        }
        let token = self.root.child_token();
        runs.insert(
            run_id.to_string(),
            ActiveRun {
                token: token.clone(),
                reason: None,
            },
        );
        Some(token)
    }

    /// 取消一个活跃运行；运行未在驱动中时返回 false
    pub async fn cancel(&self, run_id: &str, reason: &str) -> bool {
        let mut runs = self.runs.write().await;
        match runs.get_mut(run_id) {
            Some(run) => {
                if run.reason.is_none() {
                    run.reason = Some(reason.to_string());
                }
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消原因：运行自身的原因优先，其次是进程关闭原因
    pub async fn reason(&self, run_id: &str) -> Option<String> {
        if let Some(reason) = self
            .runs
            .read()
            .await
            .get(run_id)
            .and_then(|r| r.reason.clone())
        {
            return Some(reason);
        }
        self.shutdown_reason.read().await.clone()
    }

    pub async fn is_active(&self, run_id: &str) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    pub async fn active_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// 运行驱动结束后注销
    pub async fn release(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }

    /// 进程关闭：取消所有运行
    pub async fn shutdown(&self, reason: &str) {
        {
            let mut r = self.shutdown_reason.write().await;
            if r.is_none() {
                *r = Some(reason.to_string());
            }
        }
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
