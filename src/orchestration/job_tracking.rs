//! Job tracking for batch runs
//!
//! A run moves `running -> {completed, failed, partial_failed}`; each of its
//! items (one per application) moves `pending -> running -> {completed,
//! failed}`. Stores update one item at a time and reject any other
//! transition, so concurrent workers on different items never lose updates.

use crate::error::{EvalError, Result};
use crate::types::EvaluationWindow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    PartialFailed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::PartialFailed => "partial_failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "partial_failed" => Ok(RunStatus::PartialFailed),
            other => Err(EvalError::InvalidArgument(format!("Unknown run status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// Whether `self -> next` is a legal item transition
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        matches!(
            (self, next),
            (ItemStatus::Pending, ItemStatus::Running)
                | (ItemStatus::Running, ItemStatus::Completed)
                | (ItemStatus::Running, ItemStatus::Failed)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            other => Err(EvalError::InvalidArgument(format!("Unknown item status: {}", other))),
        }
    }
}

/// Severity of an item log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(EvalError::InvalidArgument(format!("Unknown log level: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub item_id: String,
    pub status: ItemStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub policy_runs: u64,
    pub breach_count: u64,
    pub next_batch_run_utc: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub logs: Vec<ItemLog>,
}

impl JobItem {
    pub fn pending(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            status: ItemStatus::Pending,
            started_at: None,
            ended_at: None,
            policy_runs: 0,
            breach_count: 0,
            next_batch_run_utc: None,
            error: None,
            traceback: None,
            logs: Vec::new(),
        }
    }
}

/// Shard parameters a run was started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub group_size: usize,
    pub group_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub shard: Option<ShardSpec>,
    /// Items in the order they were scheduled
    pub items: Vec<JobItem>,
}

impl JobRun {
    pub fn item(&self, item_id: &str) -> Option<&JobItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    /// Item counts per status
    pub fn item_stats(&self) -> ItemStats {
        let mut stats = ItemStats {
            total: self.items.len(),
            ..ItemStats::default()
        };
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => stats.pending += 1,
                ItemStatus::Running => stats.running += 1,
                ItemStatus::Completed => stats.completed += 1,
                ItemStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Values recorded when an item completes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemCompletion {
    pub policy_runs: u64,
    pub breach_count: u64,
    pub next_batch_run_utc: Option<DateTime<Utc>>,
}

/// Run status implied by an item-status snapshot.
///
/// Any non-terminal item keeps the run running. A run without items is
/// complete.
pub fn derive_run_status(statuses: &[ItemStatus]) -> RunStatus {
    if statuses.iter().any(|s| !s.is_terminal()) {
        return RunStatus::Running;
    }
    let failed = statuses.iter().filter(|s| **s == ItemStatus::Failed).count();
    match failed {
        0 => RunStatus::Completed,
        n if n == statuses.len() => RunStatus::Failed,
        _ => RunStatus::PartialFailed,
    }
}

pub(crate) fn transition_error(run_id: &str, item_id: &str, from: ItemStatus, to: ItemStatus) -> EvalError {
    EvalError::InvalidTransition {
        entity: format!("item {}/{}", run_id, item_id),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Persistent record of batch runs and their items
#[async_trait]
pub trait JobStatusStore: Send + Sync {
    /// Create a running run with every item pending
    async fn start_run(
        &self,
        run_id: &str,
        item_ids: &[String],
        window: &EvaluationWindow,
        shard: Option<ShardSpec>,
    ) -> Result<()>;

    async fn mark_item_running(&self, run_id: &str, item_id: &str) -> Result<()>;

    async fn mark_item_completed(
        &self,
        run_id: &str,
        item_id: &str,
        completion: ItemCompletion,
    ) -> Result<()>;

    async fn mark_item_failed(
        &self,
        run_id: &str,
        item_id: &str,
        error: &str,
        traceback: &str,
    ) -> Result<()>;

    async fn append_item_log(
        &self,
        run_id: &str,
        item_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<()>;

    /// Derive and store the run status from its items
    async fn finalize_run(&self, run_id: &str) -> Result<RunStatus>;

    /// All runs, newest first
    async fn load_runs(&self) -> Result<Vec<JobRun>>;

    async fn get_run(&self, run_id: &str) -> Result<Option<JobRun>>;

    async fn item_logs(&self, run_id: &str, item_id: &str) -> Result<Vec<ItemLog>>;
}

/// Process-local job store
#[derive(Default)]
pub struct InMemoryJobStore {
    runs: Mutex<Vec<JobRun>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_item<T>(
        &self,
        run_id: &str,
        item_id: &str,
        update: impl FnOnce(&mut JobItem) -> Result<T>,
    ) -> Result<T> {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| EvalError::NotFound(format!("run {}", run_id)))?;
        let item = run
            .items
            .iter_mut()
            .find(|i| i.item_id == item_id)
            .ok_or_else(|| EvalError::NotFound(format!("item {}/{}", run_id, item_id)))?;
        update(item)
    }

    fn transition(
        &self,
        run_id: &str,
        item_id: &str,
        to: ItemStatus,
        apply: impl FnOnce(&mut JobItem),
    ) -> Result<()> {
        self.with_item(run_id, item_id, |item| {
            if !item.status.can_transition_to(to) {
                return Err(transition_error(run_id, item_id, item.status, to));
            }
            item.status = to;
            apply(item);
            Ok(())
        })
    }
}

#[async_trait]
impl JobStatusStore for InMemoryJobStore {
    async fn start_run(
        &self,
        run_id: &str,
        item_ids: &[String],
        window: &EvaluationWindow,
        shard: Option<ShardSpec>,
    ) -> Result<()> {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runs.iter().any(|r| r.run_id == run_id) {
            return Err(EvalError::InvalidArgument(format!("run {} already exists", run_id)));
        }
        runs.push(JobRun {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            window_start: window.start,
            window_end: window.end,
            shard,
            items: item_ids.iter().map(JobItem::pending).collect(),
        });
        Ok(())
    }

    async fn mark_item_running(&self, run_id: &str, item_id: &str) -> Result<()> {
        self.transition(run_id, item_id, ItemStatus::Running, |item| {
            item.started_at = Some(Utc::now());
        })
    }

    async fn mark_item_completed(
        &self,
        run_id: &str,
        item_id: &str,
        completion: ItemCompletion,
    ) -> Result<()> {
        self.transition(run_id, item_id, ItemStatus::Completed, |item| {
            item.ended_at = Some(Utc::now());
            item.policy_runs = completion.policy_runs;
            item.breach_count = completion.breach_count;
            item.next_batch_run_utc = completion.next_batch_run_utc;
        })
    }

    async fn mark_item_failed(
        &self,
        run_id: &str,
        item_id: &str,
        error: &str,
        traceback: &str,
    ) -> Result<()> {
        self.transition(run_id, item_id, ItemStatus::Failed, |item| {
            item.ended_at = Some(Utc::now());
            item.error = Some(error.to_string());
            item.traceback = Some(traceback.to_string());
        })
    }

    async fn append_item_log(
        &self,
        run_id: &str,
        item_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        self.with_item(run_id, item_id, |item| {
            item.logs.push(ItemLog {
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
            });
            Ok(())
        })
    }

    async fn finalize_run(&self, run_id: &str) -> Result<RunStatus> {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| EvalError::NotFound(format!("run {}", run_id)))?;
        let statuses: Vec<ItemStatus> = run.items.iter().map(|i| i.status).collect();
        run.status = derive_run_status(&statuses);
        run.ended_at = (run.status != RunStatus::Running).then(Utc::now);
        Ok(run.status)
    }

    async fn load_runs(&self) -> Result<Vec<JobRun>> {
        let mut runs = match self.runs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.run_id.cmp(&a.run_id)));
        Ok(runs)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<JobRun>> {
        let runs = match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn item_logs(&self, run_id: &str, item_id: &str) -> Result<Vec<ItemLog>> {
        self.with_item(run_id, item_id, |item| Ok(item.logs.clone()))
    }
}
