//! Evalguard - Scheduled Batch Evaluation of AI Application Telemetry
//!
//! Evalguard reads telemetry produced by AI applications, runs a configurable
//! set of evaluation policies over each application's recent activity and
//! persists one versioned result per (application, policy, trace, version):
//! - Deterministic result identities, so re-running a window is a no-op
//! - Bounded concurrency across applications and across policies
//! - Threshold breach detection with circuit-broken webhook alerts
//! - Durable run/item tracking with per-item logs
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Types**: Telemetry records, metric values, evaluation results
//! - **Telemetry**: Chunked telemetry sources (store, OTLP file) and ingestion
//! - **Evaluation**: Policy trait, built-in policies, registry, thresholds
//! - **Storage**: libSQL-backed result, telemetry and job stores
//! - **Orchestration**: Per-app runner, batch driver, scheduler, alerting
//! - **API**: Read-only dashboard endpoints
//!
//! # Example
//!
//! ```ignore
//! use evalguard_core::{BatchEvaluationRunner, EvaluationWindow, PolicyRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RootConfig::from_file("evalguard.yaml")?;
//!     let runner = BatchEvaluationRunner::new(
//!         Arc::new(PolicyRegistry::builtin()),
//!         source,
//!         store,
//!         config.batch_policy_concurrency,
//!     );
//!
//!     let app = resolve_app_config(&config, "support-bot");
//!     let window = EvaluationWindow::last_hours(24, Utc::now())?;
//!     let results = runner.run_for_application(&app, &window).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod identity;
pub mod orchestration;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use config::{resolve_app_config, ConfigLoader, ResolvedAppConfig, RootConfig};
pub use error::{EvalError, Result};
pub use evaluation::{EvaluationPolicy, PolicyRegistry};
pub use orchestration::{
    AlertNotifier, BatchDriver, BatchEvaluationRunner, BatchOptions, BatchSummary,
    InMemoryJobStore, JobStatusStore,
};
pub use retry::RetryPolicy;
pub use storage::{
    ConnectionMode, InMemoryResultStore, LibsqlJobStore, LibsqlResultStore,
    LibsqlTelemetryStore, ResultStore, StorePool,
};
pub use telemetry::{InMemoryTelemetryStore, TelemetrySink, TelemetrySource};
pub use types::{
    EvaluationResult, EvaluationWindow, MetricKind, MetricValueVersioned, TelemetryRecord,
    ThresholdBreach,
};
