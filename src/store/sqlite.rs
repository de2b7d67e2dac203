//! SQLite 持久化
//!
//! `runs` 表保存计划与最新执行状态（JSON），`events` 表按 (run_id, seq) 只追加业务事件。
//! 每次转换在一个事务里更新执行状态并追加事件，崩溃后两者保持一致。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::core::error::Result;
use crate::core::state::{Event, RunSnapshot};
use crate::store::RunPersistence;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id          TEXT PRIMARY KEY,
    plan_id         TEXT NOT NULL,
    plan_version    INTEGER NOT NULL,
    plan_json       TEXT NOT NULL,
    execution_json  TEXT NOT NULL,
    replaces        TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    run_id      TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    event_json  TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
";

/// SQLite 后端；连接由互斥锁保护
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn insert_events(tx: &rusqlite::Transaction<'_>, run_id: &str, events: &[Event]) -> Result<()> {
    let mut stmt =
        tx.prepare("INSERT INTO events (run_id, seq, event_json) VALUES (?1, ?2, ?3)")?;
    for event in events {
        stmt.execute(params![run_id, event.seq as i64, serde_json::to_string(event)?])?;
    }
    Ok(())
}

impl RunPersistence for SqlitePersistence {
    fn load_all(&self) -> Result<Vec<RunSnapshot>> {
        let conn = self.conn();
        let mut runs_stmt = conn.prepare(
            "SELECT run_id, plan_version, plan_json, execution_json, replaces, created_at
             FROM runs ORDER BY created_at, run_id",
        )?;
        let rows = runs_stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut events_stmt =
            conn.prepare("SELECT event_json FROM events WHERE run_id = ?1 ORDER BY seq")?;
        let mut snapshots = Vec::new();
        for row in rows {
            let (run_id, plan_version, plan_json, execution_json, replaces, created_at) = row?;
            let business_state = events_stmt
                .query_map(params![run_id], |r| r.get::<_, String>(0))?
                .map(|json| -> Result<Event> { Ok(serde_json::from_str(&json?)?) })
                .collect::<Result<Vec<Event>>>()?;
            snapshots.push(RunSnapshot {
                run_id,
                plan_version: plan_version as u32,
                plan: serde_json::from_str(&plan_json)?,
                execution_state: serde_json::from_str(&execution_json)?,
                business_state,
                replaces,
                created_at,
            });
        }
        Ok(snapshots)
    }

    fn save_run(&self, snapshot: &RunSnapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO runs
             (run_id, plan_id, plan_version, plan_json, execution_json, replaces, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                snapshot.run_id,
                snapshot.plan.id,
                snapshot.plan_version as i64,
                serde_json::to_string(&snapshot.plan)?,
                serde_json::to_string(&snapshot.execution_state)?,
                snapshot.replaces,
                snapshot.created_at,
            ],
        )?;
        tx.execute("DELETE FROM events WHERE run_id = ?1", params![snapshot.run_id])?;
        insert_events(&tx, &snapshot.run_id, &snapshot.business_state)?;
        tx.commit()?;
        Ok(())
    }

    fn save_transition(&self, snapshot: &RunSnapshot, new_events: &[Event]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE runs SET execution_json = ?2, updated_at = ?3 WHERE run_id = ?1",
            params![
                snapshot.run_id,
                serde_json::to_string(&snapshot.execution_state)?,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        insert_events(&tx, &snapshot.run_id, new_events)?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Transition;
    use crate::workflow::PlanBuilder;
    use serde_json::json;

    fn snapshot() -> RunSnapshot {
        let plan = PlanBuilder::new("g")
            .step("a", "echo", json!("a"))
            .step("b", "echo", json!({"q": "b"}))
            .sequential("a", "b")
            .build()
            .unwrap();
        RunSnapshot::new("run_1".into(), plan, None, 1_000)
    }

    #[test]
    fn test_round_trip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs").join("hive.db");
        let mut snap = snapshot();
        {
            let db = SqlitePersistence::open(&path).unwrap();
            db.save_run(&snap).unwrap();
            let events = snap
                .apply(
                    Transition::StepStarted {
                        step_id: "a".into(),
                        prompt: "p".into(),
                    },
                    2_000,
                )
                .unwrap();
            db.save_transition(&snap, &events).unwrap();
        }

        let db = SqlitePersistence::open(&path).unwrap();
        let loaded = db.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], snap);
    }

    #[test]
    fn test_duplicate_event_seq_is_rejected() {
        let db = SqlitePersistence::open_in_memory().unwrap();
        let snap = snapshot();
        db.save_run(&snap).unwrap();
        let dup = snap.business_state.clone();
        assert!(db.save_transition(&snap, &dup).is_err());
        // 事务回滚：事件未重复
        assert_eq!(db.load_all().unwrap()[0].business_state.len(), 1);
    }
}
