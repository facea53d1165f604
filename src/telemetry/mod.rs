//! Telemetry supply for batch evaluation.
//!
//! A [`TelemetrySource`] yields the records of one application and window as
//! a lazy stream of chunks. Chunks arrive in order, are never duplicated
//! within one fetch, and a fetch may produce no chunk at all. Every call to
//! `fetch` starts a fresh stream.
//!
//! A [`TelemetrySink`] accepts validated records from the ingestion queue.

pub mod ingest;
pub mod otlp;

pub use ingest::{IngestQueue, IngestStats, RawTelemetryEvent};
pub use otlp::OtlpFileSource;

use crate::error::Result;
use crate::types::{EvaluationWindow, TelemetryRecord};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio_stream::Stream;

/// Ordered stream of record chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<TelemetryRecord>>> + Send>>;

/// Supplier of telemetry for (application, window) pairs
pub trait TelemetrySource: Send + Sync {
    fn fetch(&self, app_id: &str, window: &EvaluationWindow) -> ChunkStream;
}

/// Destination for ingested telemetry
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Insert or replace records by id; returns the number written
    async fn upsert_telemetry(&self, records: &[TelemetryRecord]) -> Result<usize>;
}

/// Sort and chunk records the way every source hands them out
pub(crate) fn into_chunks(
    mut records: Vec<TelemetryRecord>,
    chunk_size: usize,
) -> Vec<Vec<TelemetryRecord>> {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(chunk_size).collect());
    }
    chunks
}

/// Process-local telemetry store for tests and dry runs
pub struct InMemoryTelemetryStore {
    records: RwLock<Vec<TelemetryRecord>>,
    chunk_size: usize,
    fetch_calls: AtomicUsize,
}

impl InMemoryTelemetryStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            chunk_size: chunk_size.max(1),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_records(chunk_size: usize, records: Vec<TelemetryRecord>) -> Self {
        let store = Self::new(chunk_size);
        store.insert(records);
        store
    }

    /// Insert or replace records by id
    pub fn insert(&self, records: Vec<TelemetryRecord>) -> usize {
        let mut guard = match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = records.len();
        for record in records {
            match guard.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record,
                None => guard.push(record),
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `fetch` calls served
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl TelemetrySource for InMemoryTelemetryStore {
    fn fetch(&self, app_id: &str, window: &EvaluationWindow) -> ChunkStream {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let selected: Vec<TelemetryRecord> = match self.records.read() {
            Ok(guard) => guard
                .iter()
                .filter(|r| r.app_id == app_id && window.contains(&r.timestamp))
                .cloned()
                .collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .filter(|r| r.app_id == app_id && window.contains(&r.timestamp))
                .cloned()
                .collect(),
        };
        let chunks = into_chunks(selected, self.chunk_size);
        Box::pin(tokio_stream::iter(chunks.into_iter().map(Ok)))
    }
}

#[async_trait]
impl TelemetrySink for InMemoryTelemetryStore {
    async fn upsert_telemetry(&self, records: &[TelemetryRecord]) -> Result<usize> {
        Ok(self.insert(records.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashMap;
    use tokio_stream::StreamExt;

    fn record(id: &str, app: &str, minute: u32) -> TelemetryRecord {
        TelemetryRecord {
            id: id.to_string(),
            app_id: app.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 2, 24, 10, minute, 0).unwrap(),
            model_id: "m".to_string(),
            model_version: "1".to_string(),
            input_text: "in".to_string(),
            output_text: "out".to_string(),
            expected_output: None,
            user_id: None,
            latency_ms: None,
            metadata: HashMap::new(),
        }
    }

    fn window() -> EvaluationWindow {
        let start = Utc.with_ymd_and_hms(2026, 2, 24, 10, 0, 0).unwrap();
        EvaluationWindow::new(start, start + Duration::minutes(30)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_filters_orders_and_chunks() {
        let store = InMemoryTelemetryStore::with_records(
            2,
            vec![
                record("c", "A", 3),
                record("a", "A", 1),
                record("b", "A", 2),
                record("x", "B", 1),
                record("late", "A", 45),
            ],
        );

        let chunks: Vec<Vec<TelemetryRecord>> = store
            .fetch("A", &window())
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 2);
        let ids: Vec<&str> = chunks.iter().flatten().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_data_yields_no_chunks() {
        let store = InMemoryTelemetryStore::new(10);
        let mut stream = store.fetch("A", &window());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = InMemoryTelemetryStore::new(10);
        store.upsert_telemetry(&[record("a", "A", 1)]).await.unwrap();
        let mut updated = record("a", "A", 1);
        updated.output_text = "changed".to_string();
        store.upsert_telemetry(&[updated]).await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
