//! Batch orchestration
//!
//! This module drives scheduled evaluation of all configured applications:
//! - **BatchEvaluationRunner**: Evaluates one application over one window
//! - **BatchDriver**: Selects applications, tracks the run, bounds concurrency
//! - **JobStatusStore**: Run and item state machine with per-item logs
//! - **CronScheduler**: Next-run computation and due detection
//! - **AlertNotifier**: Breach alerts behind per-channel circuit breakers
//!
//! # Concurrency
//!
//! Two nested bounded domains: the driver's application semaphore and the
//! runner's policy semaphore. Permits are owned by the task that holds them
//! and released on every exit path.

pub mod batch_runner;
pub mod driver;
pub mod job_tracking;
pub mod notifier;
pub mod partition;
pub mod scheduler;

pub use batch_runner::{normalize_metrics, BatchEvaluationRunner, TraceContext};
pub use driver::{new_run_id, AppOutcome, BatchDriver, BatchOptions, BatchSummary};
pub use job_tracking::{
    derive_run_status, InMemoryJobStore, ItemCompletion, ItemLog, ItemStats, ItemStatus, JobItem,
    JobRun, JobStatusStore, LogLevel, RunStatus, ShardSpec,
};
pub use notifier::{
    build_alert, filter_breaches_by_min_level, AlertChannel, AlertMessage, AlertNotifier,
    BreakerState, CircuitBreaker, TeamsWebhookChannel,
};
pub use partition::{select_group, total_groups};
pub use scheduler::{parse_cron, CronScheduler};
