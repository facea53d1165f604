//! Policy engine for scoring application telemetry.
//!
//! A policy is a stateless scoring function over a slice of telemetry
//! records. Policies are built from their [`PolicyConfig`] by the
//! [`PolicyRegistry`] and run concurrently over shared records.
//!
//! # Architecture
//!
//! - **EvaluationPolicy**: The scoring interface every policy implements
//! - **PolicyRegistry**: Startup-time map from policy name to constructor
//! - **Thresholds**: Breach detection against configured metric thresholds
//!
//! # Empty input
//!
//! Every policy returns at least one metric, also for zero records. Ratio
//! based safety scores default to `1.0`; averages default to `0.0`.

pub mod policies;
pub mod registry;
pub mod thresholds;

pub use registry::{policy_factory, PolicyFactory, PolicyRegistry};
pub use thresholds::{evaluate_thresholds, level_rank, status_for_breaches, HealthStatus};

use crate::config::PolicyConfig;
use crate::error::Result;
use crate::types::{MetricValueVersioned, TelemetryRecord};
use async_trait::async_trait;

/// Scoring interface shared by all policies
#[async_trait]
pub trait EvaluationPolicy: Send + Sync {
    /// Configured policy name
    fn name(&self) -> &str;

    /// Policy version; part of every result id
    fn version(&self) -> &str;

    /// Score `records` for `app_id`.
    ///
    /// Must return a non-empty list. Errors are isolated to this policy's
    /// work unit by the caller.
    async fn evaluate(
        &self,
        app_id: &str,
        records: &[TelemetryRecord],
    ) -> Result<Vec<MetricValueVersioned>>;
}

/// Name and version shared by the built-in policies
#[derive(Debug, Clone)]
pub(crate) struct PolicyIdentity {
    pub name: String,
    pub version: String,
}

impl From<&PolicyConfig> for PolicyIdentity {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version(),
        }
    }
}
