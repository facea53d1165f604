//! LibSQL telemetry store
//!
//! Serves telemetry windows with keyset pagination on `(timestamp, id)` so a
//! page never skips or repeats a row, and accepts ingested records as
//! id-keyed upserts.

use super::libsql::StorePool;
use crate::error::{EvalError, Result};
use crate::retry::RetryPolicy;
use crate::telemetry::{ChunkStream, TelemetrySink, TelemetrySource};
use crate::types::{format_timestamp, parse_timestamp, EvaluationWindow, TelemetryRecord};
use async_trait::async_trait;
use libsql::{params, Connection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const PAGE_SQL: &str = "SELECT id, app_id, timestamp, model_id, model_version, input_text,
        output_text, expected_output, user_id, latency_ms, metadata
    FROM telemetry
    WHERE app_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
      AND (timestamp > ?4 OR (timestamp = ?4 AND id > ?5))
    ORDER BY timestamp ASC, id ASC
    LIMIT ?6";

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO telemetry
    (id, app_id, timestamp, partition_key, model_id, model_version, input_text,
     output_text, expected_output, user_id, latency_ms, metadata)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

#[derive(Clone)]
pub struct LibsqlTelemetryStore {
    pool: Arc<StorePool>,
    retry: RetryPolicy,
    page_size: usize,
}

/// Position after the last row of the previous page
struct Cursor {
    timestamp: String,
    id: String,
}

impl LibsqlTelemetryStore {
    pub fn new(pool: Arc<StorePool>, retry: RetryPolicy, page_size: usize) -> Self {
        Self {
            pool,
            retry,
            page_size: page_size.max(1),
        }
    }

    async fn fetch_page(
        &self,
        app_id: &str,
        window: &EvaluationWindow,
        cursor: &Cursor,
    ) -> Result<Vec<TelemetryRecord>> {
        let conn = self.pool.connect().await?;
        let mut rows = conn
            .query(
                PAGE_SQL,
                params![
                    app_id,
                    window.start_str(),
                    window.end_str(),
                    cursor.timestamp.clone(),
                    cursor.id.clone(),
                    self.page_size as i64
                ],
            )
            .await?;
        let mut page = Vec::new();
        while let Some(row) = rows.next().await? {
            page.push(row_to_record(&row)?);
        }
        Ok(page)
    }

    async fn produce(self, app_id: String, window: EvaluationWindow, tx: mpsc::Sender<Result<Vec<TelemetryRecord>>>) {
        // Empty strings sort before any stored value
        let mut cursor = Cursor {
            timestamp: String::new(),
            id: String::new(),
        };
        let mut pages = 0usize;
        loop {
            let page = self
                .retry
                .run("fetch_telemetry_page", || self.fetch_page(&app_id, &window, &cursor))
                .await;
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!("Telemetry fetch failed for app_id={}: {}", app_id, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Cursor {
                timestamp: format_timestamp(&last.timestamp),
                id: last.id.clone(),
            };
            let full = page.len() == self.page_size;
            pages += 1;
            if tx.send(Ok(page)).await.is_err() {
                debug!("Telemetry consumer for app_id={} dropped the stream", app_id);
                return;
            }
            if !full {
                break;
            }
        }
        debug!("Served {} telemetry pages for app_id={}", pages, app_id);
    }

    async fn write_record(conn: &Connection, record: &TelemetryRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        conn.execute(
            UPSERT_SQL,
            params![
                record.id.clone(),
                record.app_id.clone(),
                format_timestamp(&record.timestamp),
                record.partition_key(),
                record.model_id.clone(),
                record.model_version.clone(),
                record.input_text.clone(),
                record.output_text.clone(),
                record.expected_output.clone(),
                record.user_id.clone(),
                record.latency_ms,
                metadata
            ],
        )
        .await?;
        Ok(())
    }

    async fn write_all(&self, records: &[TelemetryRecord]) -> Result<usize> {
        let conn = self.pool.connect().await?;
        let tx = conn.transaction().await?;
        for record in records {
            if let Err(e) = Self::write_record(&tx, record).await {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }
        tx.commit()
            .await
            .map_err(|e| EvalError::Database(format!("Failed to commit telemetry batch: {}", e)))?;
        Ok(records.len())
    }
}

fn row_to_record(row: &libsql::Row) -> Result<TelemetryRecord> {
    let timestamp: String = row.get(2)?;
    let metadata: Option<String> = row.get(10)?;
    let metadata: HashMap<String, serde_json::Value> = match metadata.as_deref() {
        Some(text) if !text.is_empty() => serde_json::from_str(text)?,
        _ => HashMap::new(),
    };
    Ok(TelemetryRecord {
        id: row.get(0)?,
        app_id: row.get(1)?,
        timestamp: parse_timestamp(&timestamp)?,
        model_id: row.get(3)?,
        model_version: row.get(4)?,
        input_text: row.get(5)?,
        output_text: row.get(6)?,
        expected_output: row.get(7)?,
        user_id: row.get(8)?,
        latency_ms: row.get(9)?,
        metadata,
    })
}

impl TelemetrySource for LibsqlTelemetryStore {
    fn fetch(&self, app_id: &str, window: &EvaluationWindow) -> ChunkStream {
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(self.clone().produce(app_id.to_string(), *window, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl TelemetrySink for LibsqlTelemetryStore {
    async fn upsert_telemetry(&self, records: &[TelemetryRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.retry
            .run("upsert_telemetry", || self.write_all(records))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    fn record(id: &str, app: &str, minute: u32) -> TelemetryRecord {
        let mut metadata = HashMap::new();
        metadata.insert("trace_id".to_string(), json!(format!("T-{}", id)));
        TelemetryRecord {
            id: id.to_string(),
            app_id: app.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 24, 10, minute, 0).unwrap(),
            model_id: "m".to_string(),
            model_version: "1".to_string(),
            input_text: "in".to_string(),
            output_text: "out".to_string(),
            expected_output: None,
            user_id: Some("u1".to_string()),
            latency_ms: Some(42.0),
            metadata,
        }
    }

    async fn store(dir: &TempDir, page_size: usize) -> LibsqlTelemetryStore {
        let path = dir.path().join("telemetry.db").to_string_lossy().to_string();
        let pool = Arc::new(StorePool::open_local(path).await.unwrap());
        LibsqlTelemetryStore::new(pool, RetryPolicy::none(), page_size)
    }

    fn window() -> EvaluationWindow {
        let start = Utc.with_ymd_and_hms(2026, 2, 24, 10, 0, 0).unwrap();
        EvaluationWindow::new(start, start + Duration::minutes(30)).unwrap()
    }

    #[tokio::test]
    async fn test_keyset_paging_covers_window_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2).await;
        // Two rows share a timestamp to exercise the id tie-break
        let written = store
            .upsert_telemetry(&[
                record("b", "A", 1),
                record("a", "A", 1),
                record("c", "A", 5),
                record("d", "A", 7),
                record("e", "A", 9),
                record("late", "A", 40),
                record("other", "B", 2),
            ])
            .await
            .unwrap();
        assert_eq!(written, 7);

        let pages: Vec<Vec<TelemetryRecord>> =
            store.fetch("A", &window()).map(|p| p.unwrap()).collect().await;
        assert_eq!(pages.len(), 3);
        let ids: Vec<&str> = pages.iter().flatten().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(pages[0][0].trace_id().as_deref(), Some("T-a"));
        assert_eq!(pages[0][0].latency_ms, Some(42.0));
    }

    #[tokio::test]
    async fn test_empty_window_yields_no_pages() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10).await;
        let mut stream = store.fetch("A", &window());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 10).await;
        store.upsert_telemetry(&[record("a", "A", 1)]).await.unwrap();
        let mut changed = record("a", "A", 1);
        changed.output_text = "changed".to_string();
        store.upsert_telemetry(&[changed]).await.unwrap();

        let pages: Vec<Vec<TelemetryRecord>> =
            store.fetch("A", &window()).map(|p| p.unwrap()).collect().await;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].len(), 1);
        assert_eq!(pages[0][0].output_text, "changed");
    }
}
