//! Response bodies of the dashboard API

use crate::config::ThresholdMap;
use crate::evaluation::{evaluate_thresholds, status_for_breaches, HealthStatus};
use crate::orchestration::{ItemStats, ItemStatus, JobItem, JobRun, RunStatus, ShardSpec};
use crate::types::{EvaluationResult, MetricValueVersioned, ThresholdBreach};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Item row without logs or traceback
#[derive(Debug, Clone, Serialize)]
pub struct ItemSummary {
    pub item_id: String,
    pub status: ItemStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub policy_runs: u64,
    pub breach_count: u64,
    pub next_batch_run_utc: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&JobItem> for ItemSummary {
    fn from(item: &JobItem) -> Self {
        Self {
            item_id: item.item_id.clone(),
            status: item.status,
            started_at: item.started_at,
            ended_at: item.ended_at,
            policy_runs: item.policy_runs,
            breach_count: item.breach_count,
            next_batch_run_utc: item.next_batch_run_utc,
            error: item.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,
    pub stats: ItemStats,
    /// Present only for the current run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemSummary>>,
}

impl RunSummary {
    pub fn from_run(run: &JobRun, with_items: bool) -> Self {
        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            started_at: run.started_at,
            ended_at: run.ended_at,
            window_start: run.window_start,
            window_end: run.window_end,
            shard: run.shard,
            stats: run.item_stats(),
            items: with_items.then(|| run.items.iter().map(ItemSummary::from).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub runs: Vec<RunSummary>,
}

/// Stored result with breaches recomputed against current thresholds
#[derive(Debug, Clone, Serialize)]
pub struct ResultView {
    pub id: String,
    pub app_id: String,
    pub timestamp: DateTime<Utc>,
    pub policy_name: String,
    pub status: HealthStatus,
    pub metrics: Vec<MetricValueVersioned>,
    pub breaches: Vec<ThresholdBreach>,
}

impl ResultView {
    pub fn evaluate(result: EvaluationResult, thresholds: &ThresholdMap) -> Self {
        let breaches = evaluate_thresholds(&result.metrics, thresholds);
        Self {
            id: result.id,
            app_id: result.app_id,
            timestamp: result.timestamp,
            policy_name: result.policy_name,
            status: status_for_breaches(&breaches),
            metrics: result.metrics,
            breaches,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppLatest {
    pub app_id: String,
    /// Status of the newest result; healthy when there is none
    pub status: HealthStatus,
    pub results: Vec<ResultView>,
}

/// One breach attributed to the result it came from
#[derive(Debug, Clone, Serialize)]
pub struct AlertView {
    pub app_id: String,
    pub result_id: String,
    pub policy_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub breach: ThresholdBreach,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertList {
    pub total: usize,
    pub alerts: Vec<AlertView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdsView {
    pub global: ThresholdMap,
    /// Effective thresholds per configured application
    pub apps: BTreeMap<String, ThresholdMap>,
}
