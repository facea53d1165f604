//! Telemetry ingestion with backpressure
//!
//! Raw events are validated, enriched and pushed onto a bounded queue. A
//! background worker drains the queue in batches into a [`TelemetrySink`].
//!
//! # Backpressure
//!
//! `enqueue` waits at most `enqueue_timeout` for queue space. When the queue
//! stays full the event is rejected with [`EvalError::Backpressure`] instead
//! of growing memory without bound.

use super::TelemetrySink;
use crate::config::IngestSettings;
use crate::error::{EvalError, Result};
use crate::retry::RetryPolicy;
use crate::types::{format_timestamp, parse_timestamp, TelemetryRecord, TRACE_ID_KEY};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ingestion source label stored in record metadata
pub const DEFAULT_INGEST_SOURCE: &str = "evalguard_ingest";

/// Telemetry event as received from producers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetryEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub input_text: Option<String>,
    #[serde(default)]
    pub output_text: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
}

impl RawTelemetryEvent {
    /// Trace id from the top level, falling back to metadata
    pub fn trace_id(&self) -> Option<String> {
        if present(&self.trace_id) {
            return self.trace_id.clone();
        }
        match self.metadata.get(TRACE_ID_KEY)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Null | Value::String(_) => None,
            other => Some(other.to_string()),
        }
    }

    /// Check that every required field is present and non-empty
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("app_id", &self.app_id),
            ("timestamp", &self.timestamp),
            ("model_id", &self.model_id),
            ("model_version", &self.model_version),
            ("input_text", &self.input_text),
            ("output_text", &self.output_text),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, v)| !present(v))
            .map(|(k, _)| *k)
            .collect();
        if !missing.is_empty() {
            return Err(EvalError::InvalidArgument(format!(
                "Telemetry event missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.trace_id().is_none() {
            return Err(EvalError::InvalidArgument(
                "Telemetry event missing required field: trace_id".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate, enrich and convert into a record
    pub fn into_record(self, source: &str) -> Result<TelemetryRecord> {
        self.validate()?;
        let trace_id = self.trace_id();
        let app_id = self.app_id.unwrap_or_default();
        let timestamp = parse_timestamp(self.timestamp.as_deref().unwrap_or_default())?;

        let mut metadata = self.metadata;
        if let Some(trace_id) = trace_id {
            metadata.insert(TRACE_ID_KEY.to_string(), Value::String(trace_id));
        }
        metadata.insert("ingest_source".to_string(), Value::String(source.to_string()));
        metadata.insert(
            "processed_at_utc".to_string(),
            Value::String(format_timestamp(&Utc::now())),
        );

        let id = match self.id {
            Some(id) if !id.is_empty() => id,
            _ => format!("{}:{}", app_id, Uuid::new_v4().simple()),
        };

        Ok(TelemetryRecord {
            id,
            app_id,
            timestamp,
            model_id: self.model_id.unwrap_or_default(),
            model_version: self.model_version.unwrap_or_default(),
            input_text: self.input_text.unwrap_or_default(),
            output_text: self.output_text.unwrap_or_default(),
            expected_output: self.expected_output,
            user_id: self.user_id,
            latency_ms: self.latency_ms,
            metadata,
        })
    }
}

/// Counters reported by the ingestion worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub accepted: u64,
    pub written: u64,
    pub failed: u64,
    pub batches: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            accepted: self.accepted.load(Ordering::SeqCst),
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            batches: self.batches.load(Ordering::SeqCst),
        }
    }
}

/// Bounded ingestion queue with a batching writer task
pub struct IngestQueue {
    tx: mpsc::Sender<TelemetryRecord>,
    capacity: usize,
    enqueue_timeout: Duration,
    source: String,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl IngestQueue {
    /// Create the queue and spawn its writer task
    pub fn spawn(sink: Arc<dyn TelemetrySink>, settings: &IngestSettings, retry: RetryPolicy) -> Self {
        let capacity = settings.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());

        let worker = tokio::spawn(run_writer(
            rx,
            sink,
            settings.batch_size.max(1),
            Duration::from_millis(settings.flush_interval_ms.max(1)),
            retry,
            counters.clone(),
        ));

        info!(
            "Ingest queue started (capacity={}, batch_size={})",
            capacity, settings.batch_size
        );

        Self {
            tx,
            capacity,
            enqueue_timeout: Duration::from_millis(settings.enqueue_timeout_ms),
            source: DEFAULT_INGEST_SOURCE.to_string(),
            counters,
            worker,
        }
    }

    /// Label written to `metadata.ingest_source`
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Validate, enrich and enqueue one event; returns the record id
    pub async fn enqueue(&self, event: RawTelemetryEvent) -> Result<String> {
        let record = event.into_record(&self.source)?;
        let id = record.id.clone();
        self.enqueue_record(record).await?;
        Ok(id)
    }

    /// Enqueue an already validated record
    pub async fn enqueue_record(&self, record: TelemetryRecord) -> Result<()> {
        match self.tx.send_timeout(record, self.enqueue_timeout).await {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("Ingest queue saturated ({}/{})", self.len(), self.capacity);
                Err(EvalError::Backpressure {
                    len: self.len(),
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(EvalError::Other("ingest queue is closed".to_string()))
            }
        }
    }

    /// Records waiting to be written
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Stop accepting events, drain the queue and wait for the writer
    pub async fn shutdown(self) -> Result<IngestStats> {
        let IngestQueue {
            tx,
            counters,
            worker,
            ..
        } = self;
        drop(tx);
        worker
            .await
            .map_err(|e| EvalError::Other(format!("Failed to stop ingest worker: {}", e)))?;
        let stats = counters.snapshot();
        info!(
            "Ingest queue drained: accepted={} written={} failed={}",
            stats.accepted, stats.written, stats.failed
        );
        Ok(stats)
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<TelemetryRecord>,
    sink: Arc<dyn TelemetrySink>,
    batch_size: usize,
    flush_interval: Duration,
    retry: RetryPolicy,
    counters: Arc<Counters>,
) {
    loop {
        let first = match tokio::time::timeout(flush_interval, rx.recv()).await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(_) => continue,
        };

        let mut batch = Vec::with_capacity(batch_size);
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        let size = batch.len() as u64;
        counters.batches.fetch_add(1, Ordering::SeqCst);
        match retry
            .run("upsert_telemetry", || sink.upsert_telemetry(&batch))
            .await
        {
            Ok(_) => {
                counters.written.fetch_add(size, Ordering::SeqCst);
                debug!("Wrote telemetry batch of {}", size);
            }
            Err(e) => {
                counters.failed.fetch_add(size, Ordering::SeqCst);
                error!("Dropping telemetry batch of {}: {}", size, e.chain());
            }
        }
    }
    debug!("Ingest writer stopped");
}
