//! LibSQL job tracking store
//!
//! Item transitions are guarded `UPDATE ... WHERE status = <expected>`
//! statements; writes are additionally serialized through one async mutex
//! so the single SQLite writer is never contended by this process.

use super::libsql::StorePool;
use crate::error::{EvalError, Result};
use crate::orchestration::job_tracking::{
    derive_run_status, transition_error, ItemCompletion, ItemLog, ItemStatus, JobItem, JobRun,
    JobStatusStore, LogLevel, RunStatus, ShardSpec,
};
use crate::types::{format_timestamp, parse_timestamp, EvaluationWindow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct LibsqlJobStore {
    pool: Arc<StorePool>,
    write_lock: Mutex<()>,
}

fn opt_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.is_empty())
        .map(|s| parse_timestamp(&s))
        .transpose()
}

impl LibsqlJobStore {
    pub fn new(pool: Arc<StorePool>) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    async fn current_status(conn: &Connection, run_id: &str, item_id: &str) -> Result<Option<ItemStatus>> {
        let mut rows = conn
            .query(
                "SELECT status FROM batch_items WHERE run_id = ?1 AND item_id = ?2",
                params![run_id, item_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?.parse()?)),
            None => Ok(None),
        }
    }

    /// Turn a guarded update that touched no row into the matching error
    async fn explain_miss(
        conn: &Connection,
        run_id: &str,
        item_id: &str,
        to: ItemStatus,
    ) -> EvalError {
        match Self::current_status(conn, run_id, item_id).await {
            Ok(Some(from)) => transition_error(run_id, item_id, from, to),
            Ok(None) => EvalError::NotFound(format!("item {}/{}", run_id, item_id)),
            Err(e) => e,
        }
    }

    async fn load_items(conn: &Connection, run_id: &str) -> Result<Vec<JobItem>> {
        let mut logs = Self::load_logs(conn, run_id, None).await?;

        let mut rows = conn
            .query(
                "SELECT item_id, status, started_at, ended_at, policy_runs, breach_count,
                        next_batch_run_utc, error, traceback
                 FROM batch_items WHERE run_id = ?1 ORDER BY position ASC",
                params![run_id],
            )
            .await?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            let item_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            items.push(JobItem {
                logs: logs.remove(&item_id).unwrap_or_default(),
                item_id,
                status: status.parse()?,
                started_at: opt_timestamp(row.get(2)?)?,
                ended_at: opt_timestamp(row.get(3)?)?,
                policy_runs: row.get::<i64>(4)?.max(0) as u64,
                breach_count: row.get::<i64>(5)?.max(0) as u64,
                next_batch_run_utc: opt_timestamp(row.get(6)?)?,
                error: row.get(7)?,
                traceback: row.get(8)?,
            });
        }
        Ok(items)
    }

    /// Logs of one run keyed by item, optionally restricted to one item
    async fn load_logs(
        conn: &Connection,
        run_id: &str,
        item_id: Option<&str>,
    ) -> Result<HashMap<String, Vec<ItemLog>>> {
        let mut rows = match item_id {
            Some(item_id) => {
                conn.query(
                    "SELECT item_id, timestamp, level, message FROM batch_item_logs
                     WHERE run_id = ?1 AND item_id = ?2 ORDER BY id ASC",
                    params![run_id, item_id],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT item_id, timestamp, level, message FROM batch_item_logs
                     WHERE run_id = ?1 ORDER BY id ASC",
                    params![run_id],
                )
                .await?
            }
        };
        let mut logs: HashMap<String, Vec<ItemLog>> = HashMap::new();
        while let Some(row) = rows.next().await? {
            let item_id: String = row.get(0)?;
            let timestamp: String = row.get(1)?;
            let level: String = row.get(2)?;
            logs.entry(item_id).or_default().push(ItemLog {
                timestamp: parse_timestamp(&timestamp)?,
                level: level.parse()?,
                message: row.get(3)?,
            });
        }
        Ok(logs)
    }

    async fn load_run(conn: &Connection, row: &libsql::Row) -> Result<JobRun> {
        let run_id: String = row.get(0)?;
        let status: String = row.get(1)?;
        let started_at: String = row.get(2)?;
        let window_start: String = row.get(4)?;
        let window_end: String = row.get(5)?;
        let group_size: Option<i64> = row.get(6)?;
        let group_index: Option<i64> = row.get(7)?;
        let shard = match (group_size, group_index) {
            (Some(size), Some(index)) => Some(ShardSpec {
                group_size: size.max(0) as usize,
                group_index: index.max(0) as usize,
            }),
            _ => None,
        };
        let items = Self::load_items(conn, &run_id).await?;
        Ok(JobRun {
            status: status.parse()?,
            started_at: parse_timestamp(&started_at)?,
            ended_at: opt_timestamp(row.get(3)?)?,
            window_start: parse_timestamp(&window_start)?,
            window_end: parse_timestamp(&window_end)?,
            shard,
            items,
            run_id,
        })
    }
}

const RUN_COLUMNS: &str =
    "run_id, status, started_at, ended_at, window_start, window_end, group_size, group_index";

#[async_trait]
impl JobStatusStore for LibsqlJobStore {
    async fn start_run(
        &self,
        run_id: &str,
        item_ids: &[String],
        window: &EvaluationWindow,
        shard: Option<ShardSpec>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "INSERT INTO batch_runs
                (run_id, status, started_at, ended_at, window_start, window_end, group_size, group_index)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                RunStatus::Running.as_str(),
                format_timestamp(&Utc::now()),
                window.start_str(),
                window.end_str(),
                shard.map(|s| s.group_size as i64),
                shard.map(|s| s.group_index as i64)
            ],
        )
        .await?;
        for (position, item_id) in item_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO batch_items (run_id, item_id, position, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id,
                    item_id.as_str(),
                    position as i64,
                    ItemStatus::Pending.as_str()
                ],
            )
            .await?;
        }
        tx.commit().await?;
        debug!("Started run {} with {} items", run_id, item_ids.len());
        Ok(())
    }

    async fn mark_item_running(&self, run_id: &str, item_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;
        let changed = conn
            .execute(
                "UPDATE batch_items SET status = ?1, started_at = ?2
                 WHERE run_id = ?3 AND item_id = ?4 AND status = ?5",
                params![
                    ItemStatus::Running.as_str(),
                    format_timestamp(&Utc::now()),
                    run_id,
                    item_id,
                    ItemStatus::Pending.as_str()
                ],
            )
            .await?;
        if changed == 0 {
            return Err(Self::explain_miss(&conn, run_id, item_id, ItemStatus::Running).await);
        }
        Ok(())
    }

    async fn mark_item_completed(
        &self,
        run_id: &str,
        item_id: &str,
        completion: ItemCompletion,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;
        let changed = conn
            .execute(
                "UPDATE batch_items
                 SET status = ?1, ended_at = ?2, policy_runs = ?3, breach_count = ?4, next_batch_run_utc = ?5
                 WHERE run_id = ?6 AND item_id = ?7 AND status = ?8",
                params![
                    ItemStatus::Completed.as_str(),
                    format_timestamp(&Utc::now()),
                    completion.policy_runs as i64,
                    completion.breach_count as i64,
                    completion.next_batch_run_utc.as_ref().map(format_timestamp),
                    run_id,
                    item_id,
                    ItemStatus::Running.as_str()
                ],
            )
            .await?;
        if changed == 0 {
            return Err(Self::explain_miss(&conn, run_id, item_id, ItemStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_item_failed(
        &self,
        run_id: &str,
        item_id: &str,
        error: &str,
        traceback: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;
        let changed = conn
            .execute(
                "UPDATE batch_items SET status = ?1, ended_at = ?2, error = ?3, traceback = ?4
                 WHERE run_id = ?5 AND item_id = ?6 AND status = ?7",
                params![
                    ItemStatus::Failed.as_str(),
                    format_timestamp(&Utc::now()),
                    error,
                    traceback,
                    run_id,
                    item_id,
                    ItemStatus::Running.as_str()
                ],
            )
            .await?;
        if changed == 0 {
            return Err(Self::explain_miss(&conn, run_id, item_id, ItemStatus::Failed).await);
        }
        Ok(())
    }

    async fn append_item_log(
        &self,
        run_id: &str,
        item_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;
        if Self::current_status(&conn, run_id, item_id).await?.is_none() {
            return Err(EvalError::NotFound(format!("item {}/{}", run_id, item_id)));
        }
        conn.execute(
            "INSERT INTO batch_item_logs (run_id, item_id, timestamp, level, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                item_id,
                format_timestamp(&Utc::now()),
                level.as_str(),
                message
            ],
        )
        .await?;
        Ok(())
    }

    async fn finalize_run(&self, run_id: &str) -> Result<RunStatus> {
        let _guard = self.write_lock.lock().await;
        let conn = self.pool.connect().await?;

        let mut rows = conn
            .query("SELECT 1 FROM batch_runs WHERE run_id = ?1", params![run_id])
            .await?;
        if rows.next().await?.is_none() {
            return Err(EvalError::NotFound(format!("run {}", run_id)));
        }

        let mut rows = conn
            .query(
                "SELECT status FROM batch_items WHERE run_id = ?1",
                params![run_id],
            )
            .await?;
        let mut statuses = Vec::new();
        while let Some(row) = rows.next().await? {
            statuses.push(row.get::<String>(0)?.parse::<ItemStatus>()?);
        }

        let status = derive_run_status(&statuses);
        let ended_at = (status != RunStatus::Running).then(|| format_timestamp(&Utc::now()));
        conn.execute(
            "UPDATE batch_runs SET status = ?1, ended_at = ?2 WHERE run_id = ?3",
            params![status.as_str(), ended_at, run_id],
        )
        .await?;
        debug!("Finalized run {} as {}", run_id, status);
        Ok(status)
    }

    async fn load_runs(&self) -> Result<Vec<JobRun>> {
        let conn = self.pool.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM batch_runs ORDER BY started_at DESC, run_id DESC",
                    RUN_COLUMNS
                ),
                params![],
            )
            .await?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(Self::load_run(&conn, &row).await?);
        }
        Ok(runs)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<JobRun>> {
        let conn = self.pool.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM batch_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::load_run(&conn, &row).await?)),
            None => Ok(None),
        }
    }

    async fn item_logs(&self, run_id: &str, item_id: &str) -> Result<Vec<ItemLog>> {
        let conn = self.pool.connect().await?;
        if Self::current_status(&conn, run_id, item_id).await?.is_none() {
            return Err(EvalError::NotFound(format!("item {}/{}", run_id, item_id)));
        }
        let mut logs = Self::load_logs(&conn, run_id, Some(item_id)).await?;
        Ok(logs.remove(item_id).unwrap_or_default())
    }
}
