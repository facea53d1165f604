//! Storage layer for evaluation results and telemetry
//!
//! Provides the result store abstraction used by the batch runner and its
//! libSQL and in-memory implementations, plus the libSQL telemetry and job
//! tracking stores.

pub mod jobs;
pub mod libsql;
pub mod results;
pub mod telemetry;

pub use self::libsql::{ConnectionMode, StorePool};
pub use jobs::LibsqlJobStore;
pub use results::LibsqlResultStore;
pub use telemetry::LibsqlTelemetryStore;

use crate::error::Result;
use crate::types::EvaluationResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Result store trait
///
/// Bulk calls are the normal path. `result_exists` exists for ad-hoc checks
/// and must not be used inside a chunk loop.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Subset of `ids` already persisted
    async fn results_exist(&self, ids: &HashSet<String>) -> Result<HashSet<String>>;

    /// Whether a single id is persisted
    async fn result_exists(&self, id: &str) -> Result<bool>;

    /// Persist results grouped by partition key
    async fn save_results(&self, results: &[EvaluationResult]) -> Result<()>;

    /// Most recent results of an application, newest first
    async fn latest_results(&self, app_id: &str, limit: usize) -> Result<Vec<EvaluationResult>>;
}

/// Group results by partition key, keeping input order inside each group
pub fn group_by_partition(results: &[EvaluationResult]) -> BTreeMap<String, Vec<&EvaluationResult>> {
    let mut groups: BTreeMap<String, Vec<&EvaluationResult>> = BTreeMap::new();
    for result in results {
        groups.entry(result.partition_key()).or_default().push(result);
    }
    groups
}

/// Process-local result store with call counters
#[derive(Default)]
pub struct InMemoryResultStore {
    results: RwLock<BTreeMap<String, EvaluationResult>>,
    exists_calls: AtomicUsize,
    single_calls: AtomicUsize,
    save_calls: AtomicUsize,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<EvaluationResult> {
        self.results.read().ok()?.get(id).cloned()
    }

    pub fn all(&self) -> Vec<EvaluationResult> {
        self.results
            .read()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn results_exist(&self, ids: &HashSet<String>) -> Result<HashSet<String>> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let guard = match self.results.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(ids.iter().filter(|id| guard.contains_key(*id)).cloned().collect())
    }

    async fn result_exists(&self, id: &str) -> Result<bool> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .results
            .read()
            .map(|r| r.contains_key(id))
            .unwrap_or(false))
    }

    async fn save_results(&self, results: &[EvaluationResult]) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = match self.results.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for group in group_by_partition(results).into_values() {
            for result in group {
                guard.insert(result.id.clone(), result.clone());
            }
        }
        Ok(())
    }

    async fn latest_results(&self, app_id: &str, limit: usize) -> Result<Vec<EvaluationResult>> {
        let mut matching: Vec<EvaluationResult> = self
            .results
            .read()
            .map(|r| r.values().filter(|v| v.app_id == app_id).cloned().collect())
            .unwrap_or_default();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }
}
