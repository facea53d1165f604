//! Core data types for the evalguard evaluation system
//!
//! This module defines the fundamental data structures used throughout evalguard:
//! telemetry records, versioned metric values, evaluation results and the
//! evaluation window they are computed over.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Metadata key that correlates several records to one logical request
pub const TRACE_ID_KEY: &str = "trace_id";

/// Label stored in `value_object_type` for every normalized metric
pub const METRIC_VALUE_OBJECT_TYPE: &str = "metric_value_versioned";

/// Format a timestamp the way it is persisted and hashed.
///
/// Fixed microsecond precision with a `Z` suffix keeps lexical and
/// chronological order identical.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(raw: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::EvalError::InvalidArgument(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Partition key co-locating one application's data for one UTC day
pub fn partition_key_for(app_id: &str, timestamp: &DateTime<Utc>) -> String {
    format!("{}:{}", app_id, timestamp.format("%Y-%m-%d"))
}

/// One observed application interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: String,
    pub app_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub model_version: String,
    pub input_text: String,
    pub output_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TelemetryRecord {
    /// Non-empty `trace_id` from metadata, if any
    pub fn trace_id(&self) -> Option<String> {
        match self.metadata.get(TRACE_ID_KEY)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// String view of a metadata value
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Numeric view of a metadata value (numbers or numeric strings)
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        match self.metadata.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn partition_key(&self) -> String {
        partition_key_for(&self.app_id, &self.timestamp)
    }
}

/// Known metric kinds
///
/// Every built-in policy is named after the single metric kind it emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    SafetyToxicity,
    SafetyBiasFairness,
    SafetyRobustness,
    SafetyCompliance,
    PerformanceGroundednessFaithfulness,
    PerformanceRelevance,
    PerformancePrecisionCoherence,
    PerformanceReadabilityFluencyStyle,
    SystemReliabilityLatency,
    SystemReliabilityAvailabilityResourceHealth,
}

impl MetricKind {
    pub const ALL: [MetricKind; 10] = [
        MetricKind::SafetyToxicity,
        MetricKind::SafetyBiasFairness,
        MetricKind::SafetyRobustness,
        MetricKind::SafetyCompliance,
        MetricKind::PerformanceGroundednessFaithfulness,
        MetricKind::PerformanceRelevance,
        MetricKind::PerformancePrecisionCoherence,
        MetricKind::PerformanceReadabilityFluencyStyle,
        MetricKind::SystemReliabilityLatency,
        MetricKind::SystemReliabilityAvailabilityResourceHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::SafetyToxicity => "safety_toxicity",
            MetricKind::SafetyBiasFairness => "safety_bias_fairness",
            MetricKind::SafetyRobustness => "safety_robustness",
            MetricKind::SafetyCompliance => "safety_compliance",
            MetricKind::PerformanceGroundednessFaithfulness => {
                "performance_groundedness_faithfulness"
            }
            MetricKind::PerformanceRelevance => "performance_relevance",
            MetricKind::PerformancePrecisionCoherence => "performance_precision_coherence",
            MetricKind::PerformanceReadabilityFluencyStyle => {
                "performance_readability_fluency_style"
            }
            MetricKind::SystemReliabilityLatency => "system_reliability_latency",
            MetricKind::SystemReliabilityAvailabilityResourceHealth => {
                "system_reliability_availability_resource_health"
            }
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = crate::EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| crate::EvalError::UnknownPolicy(s.to_string()))
    }
}

/// Typed metadata attached to a metric value
///
/// The traceability fields are filled by the batch runner; `samples` and
/// `details` carry policy-specific statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_object_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, f64>,
}

/// One scored output of a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueVersioned {
    pub metric_name: MetricKind,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Type label; defaults to the metric name during normalization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(default)]
    pub metadata: MetricMetadata,
}

impl MetricValueVersioned {
    /// Bare metric as produced by a policy before normalization
    pub fn new(metric_name: MetricKind, value: f64) -> Self {
        Self {
            metric_name,
            value,
            version: None,
            timestamp: None,
            metric_type: None,
            metadata: MetricMetadata::default(),
        }
    }
}

/// Direction of a threshold comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    /// Breach when the value falls below the threshold
    #[default]
    Min,
    /// Breach when the value rises above the threshold
    Max,
}

impl std::fmt::Display for ThresholdDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdDirection::Min => write!(f, "min"),
            ThresholdDirection::Max => write!(f, "max"),
        }
    }
}

/// A metric value that crossed a configured threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub metric_name: MetricKind,
    pub level: String,
    pub threshold_value: f64,
    pub actual_value: f64,
    pub direction: ThresholdDirection,
}

/// The unit of persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Deterministic id, see [`crate::identity::stable_result_id`]
    pub id: String,
    pub app_id: String,
    pub timestamp: DateTime<Utc>,
    pub policy_name: String,
    pub metrics: Vec<MetricValueVersioned>,
    #[serde(default)]
    pub breaches: Vec<ThresholdBreach>,
}

impl EvaluationResult {
    pub fn partition_key(&self) -> String {
        partition_key_for(&self.app_id, &self.timestamp)
    }
}

/// Half-open time range `[start, end)` a batch evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl EvaluationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> crate::Result<Self> {
        if end < start {
            return Err(crate::EvalError::InvalidArgument(format!(
                "window end {} precedes start {}",
                format_timestamp(&end),
                format_timestamp(&start)
            )));
        }
        Ok(Self { start, end })
    }

    /// Lookback window ending at `now`
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> crate::Result<Self> {
        if hours <= 0 {
            return Err(crate::EvalError::InvalidArgument(
                "window hours must be >= 1".to_string(),
            ));
        }
        Self::new(now - Duration::hours(hours), now)
    }

    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }

    pub fn start_str(&self) -> String {
        format_timestamp(&self.start)
    }

    pub fn end_str(&self) -> String {
        format_timestamp(&self.end)
    }
}

impl std::fmt::Display for EvaluationWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start_str(), self.end_str())
    }
}
