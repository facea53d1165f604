//! LibSQL result store
//!
//! Results are keyed by their deterministic id, so writes are upserts and a
//! retried write cannot create duplicates. Existence checks run as chunked
//! `IN` queries; writes run as one transaction per partition batch and fall
//! back to per-row writes when a batch fails.

use super::libsql::StorePool;
use super::{group_by_partition, ResultStore};
use crate::config::StoreConfig;
use crate::error::{EvalError, Result};
use crate::retry::RetryPolicy;
use crate::types::{format_timestamp, parse_timestamp, EvaluationResult};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{params, Connection, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO evaluation_results
    (id, partition_key, app_id, timestamp, policy_name, metrics, breaches, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

pub struct LibsqlResultStore {
    pool: Arc<StorePool>,
    retry: RetryPolicy,
    exists_batch_size: usize,
    write_batch_size: usize,
}

impl LibsqlResultStore {
    pub fn new(pool: Arc<StorePool>, config: &StoreConfig) -> Self {
        Self {
            pool,
            retry: RetryPolicy::from(&config.retry),
            exists_batch_size: config.exists_batch_size.max(1),
            write_batch_size: config.write_batch_size.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn existing_in(&self, ids: &[&String]) -> Result<Vec<String>> {
        let conn = self.pool.connect().await?;
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id FROM evaluation_results WHERE id IN ({})",
            placeholders
        );
        let values: Vec<Value> = ids.iter().map(|id| Value::Text((*id).clone())).collect();
        let mut rows = conn.query(&sql, libsql::params_from_iter(values)).await?;
        let mut found = Vec::new();
        while let Some(row) = rows.next().await? {
            found.push(row.get::<String>(0)?);
        }
        Ok(found)
    }

    async fn write_one(conn: &Connection, result: &EvaluationResult) -> Result<()> {
        let metrics = serde_json::to_string(&result.metrics)?;
        let breaches = serde_json::to_string(&result.breaches)?;
        conn.execute(
            UPSERT_SQL,
            params![
                result.id.clone(),
                result.partition_key(),
                result.app_id.clone(),
                format_timestamp(&result.timestamp),
                result.policy_name.clone(),
                metrics,
                breaches,
                format_timestamp(&Utc::now())
            ],
        )
        .await?;
        Ok(())
    }

    /// All-or-nothing write of one partition batch
    async fn write_batch(&self, batch: &[&EvaluationResult]) -> Result<()> {
        let conn = self.pool.connect().await?;
        let tx = conn.transaction().await?;
        for result in batch {
            if let Err(e) = Self::write_one(&tx, result).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Failed to roll back result batch: {}", rollback);
                }
                return Err(e);
            }
        }
        tx.commit()
            .await
            .map_err(|e| EvalError::Database(format!("Failed to commit result batch: {}", e)))
    }

    async fn write_single(&self, result: &EvaluationResult) -> Result<()> {
        let conn = self.pool.connect().await?;
        Self::write_one(&conn, result).await
    }

    fn row_to_result(row: &libsql::Row) -> Result<EvaluationResult> {
        let timestamp: String = row.get(2)?;
        let metrics: String = row.get(4)?;
        let breaches: String = row.get(5)?;
        Ok(EvaluationResult {
            id: row.get(0)?,
            app_id: row.get(1)?,
            timestamp: parse_timestamp(&timestamp)?,
            policy_name: row.get(3)?,
            metrics: serde_json::from_str(&metrics)?,
            breaches: serde_json::from_str(&breaches)?,
        })
    }
}

#[async_trait]
impl ResultStore for LibsqlResultStore {
    async fn results_exist(&self, ids: &HashSet<String>) -> Result<HashSet<String>> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();

        let mut existing = HashSet::new();
        for chunk in sorted.chunks(self.exists_batch_size) {
            let found = self
                .retry
                .run("results_exist", || self.existing_in(chunk))
                .await?;
            existing.extend(found);
        }
        debug!("{} of {} result ids already stored", existing.len(), ids.len());
        Ok(existing)
    }

    async fn result_exists(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let ids = [&id];
        let found = self
            .retry
            .run("result_exists", || self.existing_in(&ids))
            .await?;
        Ok(!found.is_empty())
    }

    async fn save_results(&self, results: &[EvaluationResult]) -> Result<()> {
        let mut failed_ids = Vec::new();

        for (partition, group) in group_by_partition(results) {
            for batch in group.chunks(self.write_batch_size) {
                let outcome = self
                    .retry
                    .run("save_results", || self.write_batch(batch))
                    .await;
                let Err(e) = outcome else {
                    continue;
                };
                warn!(
                    "Batch write failed for partition {} ({} results), falling back to per-item writes: {}",
                    partition,
                    batch.len(),
                    e
                );
                for result in batch {
                    if let Err(e) = self
                        .retry
                        .run("save_result", || self.write_single(result))
                        .await
                    {
                        warn!("Failed to persist result {}: {}", result.id, e);
                        failed_ids.push(result.id.clone());
                    }
                }
            }
        }

        if failed_ids.is_empty() {
            Ok(())
        } else {
            Err(EvalError::PartialSave { failed_ids })
        }
    }

    async fn latest_results(&self, app_id: &str, limit: usize) -> Result<Vec<EvaluationResult>> {
        let conn = self.pool.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, app_id, timestamp, policy_name, metrics, breaches
                 FROM evaluation_results
                 WHERE app_id = ?1
                 ORDER BY timestamp DESC, id ASC
                 LIMIT ?2",
                params![app_id, limit as i64],
            )
            .await?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(Self::row_to_result(&row)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricKind, MetricValueVersioned};
    use chrono::TimeZone;
    use tempfile::TempDir;

    async fn store(dir: &TempDir, exists_batch_size: usize) -> LibsqlResultStore {
        let path = dir.path().join("results.db").to_string_lossy().to_string();
        let pool = Arc::new(StorePool::open_local(path).await.unwrap());
        let config = StoreConfig {
            exists_batch_size,
            write_batch_size: 2,
            ..StoreConfig::default()
        };
        LibsqlResultStore::new(pool, &config).with_retry(RetryPolicy::none())
    }

    fn result(id: &str, day: u32) -> EvaluationResult {
        EvaluationResult {
            id: id.to_string(),
            app_id: "A".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, day, 12, 0, 0).unwrap(),
            policy_name: "precision".to_string(),
            metrics: vec![MetricValueVersioned::new(
                MetricKind::PerformancePrecisionCoherence,
                0.75,
            )],
            breaches: vec![],
        }
    }

    #[tokio::test]
    async fn test_save_and_bulk_exists_across_chunks() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2).await;

        let results: Vec<EvaluationResult> =
            (0..5).map(|i| result(&format!("r{}", i), 24 + (i % 2))).collect();
        store.save_results(&results).await.unwrap();

        let mut ids: HashSet<String> = (0..5).map(|i| format!("r{}", i)).collect();
        ids.insert("missing".to_string());
        let existing = store.results_exist(&ids).await.unwrap();
        assert_eq!(existing.len(), 5);
        assert!(!existing.contains("missing"));

        assert!(store.result_exists("r3").await.unwrap());
        assert!(!store.result_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_is_idempotent_upsert() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100).await;

        store.save_results(&[result("r1", 24)]).await.unwrap();
        let mut updated = result("r1", 24);
        updated.metrics[0].value = 0.25;
        store.save_results(&[updated]).await.unwrap();

        let latest = store.latest_results("A", 10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].metrics[0].value, 0.25);
    }

    #[tokio::test]
    async fn test_failed_batch_falls_back_to_single_writes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100).await;
        let conn = store.pool.connect().await.unwrap();
        conn.execute(
            "CREATE TRIGGER reject_bad_result BEFORE INSERT ON evaluation_results
             WHEN NEW.id = 'bad'
             BEGIN SELECT RAISE(ABORT, 'rejected result'); END",
            params![],
        )
        .await
        .unwrap();

        // Partition A:2026-02-24 holds batches [good1, bad] and [good2];
        // A:2026-02-25 is a separate partition
        let err = store
            .save_results(&[
                result("good1", 24),
                result("bad", 24),
                result("good2", 24),
                result("other-day", 25),
            ])
            .await
            .unwrap_err();
        match err {
            EvalError::PartialSave { failed_ids } => assert_eq!(failed_ids, vec!["bad"]),
            other => panic!("unexpected error: {}", other),
        }

        let ids: HashSet<String> = ["good1", "bad", "good2", "other-day"]
            .iter()
            .map(|id| id.to_string())
            .collect();
        let existing = store.results_exist(&ids).await.unwrap();
        let expected: HashSet<String> = ["good1", "good2", "other-day"]
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(existing, expected);
    }

    #[tokio::test]
    async fn test_latest_results_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 100).await;
        store
            .save_results(&[result("old", 20), result("new", 26), result("mid", 23)])
            .await
            .unwrap();

        let latest = store.latest_results("A", 2).await.unwrap();
        let ids: Vec<&str> = latest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        assert!(store.latest_results("B", 10).await.unwrap().is_empty());
    }
}
