//! Threshold breach detection

use crate::config::ThresholdMap;
use crate::types::{MetricValueVersioned, ThresholdBreach, ThresholdDirection};
use serde::{Deserialize, Serialize};

/// Compare every metric against the thresholds configured for its name.
///
/// `min` breaches when the value is strictly below the threshold, `max`
/// when strictly above.
pub fn evaluate_thresholds(
    metrics: &[MetricValueVersioned],
    thresholds: &ThresholdMap,
) -> Vec<ThresholdBreach> {
    let mut breaches = Vec::new();
    for metric in metrics {
        let Some(rules) = thresholds.get(metric.metric_name.as_str()) else {
            continue;
        };
        for rule in rules {
            let breached = match rule.direction {
                ThresholdDirection::Min => metric.value < rule.value,
                ThresholdDirection::Max => metric.value > rule.value,
            };
            if breached {
                breaches.push(ThresholdBreach {
                    metric_name: metric.metric_name,
                    level: rule.level.clone(),
                    threshold_value: rule.value,
                    actual_value: metric.value,
                    direction: rule.direction,
                });
            }
        }
    }
    breaches
}

/// Severity rank of an alert level; unknown levels rank as warning
pub fn level_rank(level: &str) -> u8 {
    match level.trim().to_lowercase().as_str() {
        "critical" => 2,
        _ => 1,
    }
}

/// Overall health derived from a set of breaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

pub fn status_for_breaches(breaches: &[ThresholdBreach]) -> HealthStatus {
    if breaches.iter().any(|b| b.level == "critical") {
        HealthStatus::Critical
    } else if breaches.is_empty() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Warning
    }
}
