//! Batch driver
//!
//! Selects the applications of one batch (single app, one shard, or all),
//! opens a tracked run and evaluates the applications under a bounded
//! application semaphore. A failing application is recorded against its run
//! item; the driver always finalizes the run and returns a summary.

use super::batch_runner::BatchEvaluationRunner;
use super::job_tracking::{ItemCompletion, ItemStatus, JobStatusStore, LogLevel, RunStatus, ShardSpec};
use super::notifier::AlertNotifier;
use super::partition::{select_group, total_groups};
use super::scheduler::CronScheduler;
use crate::config::{list_resolved_apps, resolve_app_config, ResolvedAppConfig, RootConfig};
use crate::error::{EvalError, Result};
use crate::evaluation::evaluate_thresholds;
use crate::types::{EvaluationWindow, ThresholdBreach};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Options of one batch invocation
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Evaluate only this application
    pub app_id: Option<String>,
    /// Lookback window ending at `as_of`
    pub window_hours: i64,
    /// Applications per shard; 0 disables sharding
    pub group_size: usize,
    /// Zero-based shard to run when `group_size > 0`
    pub group_index: usize,
    /// Overrides `batch_app_concurrency`
    pub app_concurrency: Option<usize>,
    /// Skip applications whose cron schedule is not due
    pub only_due: bool,
    /// End of the window; now when unset
    pub as_of: Option<DateTime<Utc>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            app_id: None,
            window_hours: 24,
            group_size: 0,
            group_index: 0,
            app_concurrency: None,
            only_due: false,
            as_of: None,
        }
    }
}

/// Result of one application inside a run
#[derive(Debug, Clone, Serialize)]
pub struct AppOutcome {
    pub app_id: String,
    pub status: ItemStatus,
    pub policy_runs: usize,
    pub breach_count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// None when no application was selected and no run was opened
    pub run_id: Option<String>,
    pub window: EvaluationWindow,
    pub status: Option<RunStatus>,
    pub outcomes: Vec<AppOutcome>,
}

impl BatchSummary {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == ItemStatus::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == ItemStatus::Failed)
            .count()
    }
}

/// Run id of the form `run-YYYYmmddHHMMSS-xxxxxxxx`
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8])
}

/// Everything a per-application task needs
struct AppWorker {
    runner: Arc<BatchEvaluationRunner>,
    jobs: Arc<dyn JobStatusStore>,
    notifier: Arc<AlertNotifier>,
    scheduler: Arc<CronScheduler>,
    run_id: String,
    window: EvaluationWindow,
    now: DateTime<Utc>,
}

impl AppWorker {
    async fn log(&self, app_id: &str, level: LogLevel, message: &str) {
        if let Err(e) = self.jobs.append_item_log(&self.run_id, app_id, level, message).await {
            warn!("Failed to append log for {}/{}: {}", self.run_id, app_id, e);
        }
    }

    async fn process(&self, app: &ResolvedAppConfig) -> AppOutcome {
        let app_id = app.app_id.as_str();
        if let Err(e) = self.jobs.mark_item_running(&self.run_id, app_id).await {
            warn!("Failed to mark {}/{} running: {}", self.run_id, app_id, e);
        }
        self.log(app_id, LogLevel::Info, "Evaluation started.").await;

        match self.evaluate(app).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Batch item failed for app_id={}: {}", app_id, e);
                self.log(app_id, LogLevel::Error, &format!("Evaluation failed: {}", e))
                    .await;
                if let Err(store_err) = self
                    .jobs
                    .mark_item_failed(&self.run_id, app_id, &e.to_string(), &e.chain())
                    .await
                {
                    warn!("Failed to mark {}/{} failed: {}", self.run_id, app_id, store_err);
                }
                AppOutcome {
                    app_id: app_id.to_string(),
                    status: ItemStatus::Failed,
                    policy_runs: 0,
                    breach_count: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn evaluate(&self, app: &ResolvedAppConfig) -> Result<AppOutcome> {
        let app_id = app.app_id.as_str();
        let results = self.runner.run_for_application(app, &self.window).await?;

        let breaches: Vec<ThresholdBreach> = results
            .iter()
            .flat_map(|r| evaluate_thresholds(&r.metrics, &app.thresholds))
            .collect();
        let next_run = CronScheduler::next_run_time(&app.batch_time, self.now)?;
        info!(
            "app_id={} policy_runs={} breaches={} window={}",
            app_id,
            results.len(),
            breaches.len(),
            self.window
        );
        self.log(
            app_id,
            LogLevel::Info,
            &format!(
                "Evaluation completed: policy_runs={} breaches={}",
                results.len(),
                breaches.len()
            ),
        )
        .await;

        if self.notifier.is_enabled() && !breaches.is_empty() {
            let delivered = self.notifier.notify(app_id, &self.window, &breaches).await;
            let (level, message) = if delivered > 0 {
                (LogLevel::Info, "Alert notification step completed.")
            } else {
                (LogLevel::Warning, "Alert notification was not delivered.")
            };
            self.log(app_id, level, message).await;
        }

        if let Some(next) = next_run {
            info!("app_id={} next_batch_run_utc={}", app_id, next.to_rfc3339());
        }
        self.jobs
            .mark_item_completed(
                &self.run_id,
                app_id,
                ItemCompletion {
                    policy_runs: results.len() as u64,
                    breach_count: breaches.len() as u64,
                    next_batch_run_utc: next_run,
                },
            )
            .await?;
        self.scheduler.mark_run(app_id, self.now);

        Ok(AppOutcome {
            app_id: app_id.to_string(),
            status: ItemStatus::Completed,
            policy_runs: results.len(),
            breach_count: breaches.len(),
            error: None,
        })
    }
}

pub struct BatchDriver {
    config: Arc<RootConfig>,
    runner: Arc<BatchEvaluationRunner>,
    jobs: Arc<dyn JobStatusStore>,
    notifier: Arc<AlertNotifier>,
    scheduler: Arc<CronScheduler>,
}

impl BatchDriver {
    pub fn new(
        config: Arc<RootConfig>,
        runner: Arc<BatchEvaluationRunner>,
        jobs: Arc<dyn JobStatusStore>,
        notifier: Arc<AlertNotifier>,
    ) -> Self {
        Self {
            config,
            runner,
            jobs,
            notifier,
            scheduler: Arc::new(CronScheduler::new()),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<CronScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn jobs(&self) -> &Arc<dyn JobStatusStore> {
        &self.jobs
    }

    /// Seed the scheduler with the last completed start of every application
    /// found in job history; returns how many applications were seeded
    pub async fn restore_schedule(&self) -> Result<usize> {
        let mut latest: std::collections::HashMap<String, DateTime<Utc>> =
            std::collections::HashMap::new();
        for run in self.jobs.load_runs().await? {
            for item in run.items.iter().filter(|i| i.status == ItemStatus::Completed) {
                let Some(started) = item.started_at else {
                    continue;
                };
                latest
                    .entry(item.item_id.clone())
                    .and_modify(|t| *t = (*t).max(started))
                    .or_insert(started);
            }
        }
        for (app_id, when) in &latest {
            self.scheduler.mark_run(app_id, *when);
        }
        info!("Restored schedule state for {} application(s)", latest.len());
        Ok(latest.len())
    }

    /// Applications of this batch, sorted by id
    pub fn select_apps(&self, options: &BatchOptions, now: DateTime<Utc>) -> Result<Vec<ResolvedAppConfig>> {
        let mut apps = match &options.app_id {
            Some(app_id) => {
                if options.group_size > 0 {
                    info!("group_size ignored when app_id is specified (single app mode)");
                }
                vec![resolve_app_config(&self.config, app_id)]
            }
            None => {
                let mut all = list_resolved_apps(&self.config);
                all.sort_by(|a, b| a.app_id.cmp(&b.app_id));
                if options.group_size > 0 {
                    let groups = total_groups(all.len(), options.group_size)?;
                    let selected = select_group(&all, options.group_size, options.group_index)?;
                    info!(
                        "Batch group selection: group_index={} total_groups={} group_size={} apps_in_group={}",
                        options.group_index,
                        groups,
                        options.group_size,
                        selected.len()
                    );
                    selected
                } else {
                    if options.group_index != 0 {
                        info!("group_index ignored because group_size is 0");
                    }
                    all
                }
            }
        };

        if options.only_due {
            let due = self.scheduler.due_apps(
                apps.iter().map(|a| (a.app_id.as_str(), a.batch_time.as_str())),
                now,
            )?;
            apps.retain(|a| due.contains(&a.app_id));
        }
        Ok(apps)
    }

    /// Run one batch end to end
    pub async fn run_batch(&self, options: BatchOptions) -> Result<BatchSummary> {
        let app_concurrency = options
            .app_concurrency
            .unwrap_or(self.config.batch_app_concurrency);
        if app_concurrency == 0 {
            return Err(EvalError::InvalidArgument(
                "app concurrency must be >= 1".to_string(),
            ));
        }
        let now = options.as_of.unwrap_or_else(Utc::now);
        let window = EvaluationWindow::last_hours(options.window_hours, now)?;

        let apps = self.select_apps(&options, now)?;
        if apps.is_empty() {
            match &options.app_id {
                Some(app_id) => warn!("No matching applications found for app_id={}", app_id),
                None => warn!("No applications selected for this batch group"),
            }
            return Ok(BatchSummary {
                run_id: None,
                window,
                status: None,
                outcomes: Vec::new(),
            });
        }

        let run_id = new_run_id(now);
        let shard = (options.group_size > 0 && options.app_id.is_none()).then_some(ShardSpec {
            group_size: options.group_size,
            group_index: options.group_index,
        });
        let app_ids: Vec<String> = apps.iter().map(|a| a.app_id.clone()).collect();
        self.jobs.start_run(&run_id, &app_ids, &window, shard).await?;
        info!(
            "Starting batch run {}: apps={} window={} app_concurrency={} policy_concurrency={}",
            run_id,
            apps.len(),
            window,
            app_concurrency,
            self.runner.policy_concurrency()
        );

        let worker = Arc::new(AppWorker {
            runner: self.runner.clone(),
            jobs: self.jobs.clone(),
            notifier: self.notifier.clone(),
            scheduler: self.scheduler.clone(),
            run_id: run_id.clone(),
            window,
            now,
        });
        let semaphore = Arc::new(Semaphore::new(app_concurrency));
        let mut tasks = JoinSet::new();
        for (position, app) in apps.into_iter().enumerate() {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => worker.process(&app).await,
                    Err(e) => AppOutcome {
                        app_id: app.app_id.clone(),
                        status: ItemStatus::Failed,
                        policy_runs: 0,
                        breach_count: 0,
                        error: Some(format!("application semaphore closed: {}", e)),
                    },
                };
                (position, outcome)
            });
        }

        let mut outcomes: Vec<(usize, AppOutcome)> = Vec::with_capacity(app_ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Application task aborted in run {}: {}", run_id, e),
            }
        }
        outcomes.sort_by_key(|(position, _)| *position);

        let status = self.jobs.finalize_run(&run_id).await?;
        let summary = BatchSummary {
            run_id: Some(run_id),
            window,
            status: Some(status),
            outcomes: outcomes.into_iter().map(|(_, o)| o).collect(),
        };
        info!(
            "Batch run {} finished with status {}: {} completed, {} failed",
            summary.run_id.as_deref().unwrap_or_default(),
            status,
            summary.completed(),
            summary.failed()
        );
        Ok(summary)
    }
}
