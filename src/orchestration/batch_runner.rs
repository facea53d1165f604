//! Batch evaluation of one application over one window
//!
//! The runner streams telemetry chunks, derives a trace identity per chunk,
//! and evaluates only the (policy, trace identity, version) units that have
//! no stored result yet. Each chunk costs exactly one bulk existence check;
//! all new results are written with one `save_results` call per run.

use crate::config::ResolvedAppConfig;
use crate::error::{EvalError, Result};
use crate::evaluation::{EvaluationPolicy, PolicyRegistry};
use crate::identity::{derive_trace_identity, stable_result_id};
use crate::storage::ResultStore;
use crate::telemetry::TelemetrySource;
use crate::types::{
    EvaluationResult, EvaluationWindow, MetricValueVersioned, TelemetryRecord,
    METRIC_VALUE_OBJECT_TYPE,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// A policy instantiated for one run
#[derive(Clone)]
struct PreparedPolicy {
    name: String,
    version: String,
    policy: Arc<dyn EvaluationPolicy>,
}

/// Traceability fields merged into every metric of a result
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub app_id: String,
    pub policy_name: String,
    pub policy_version: String,
    pub dedupe_trace_id: String,
    pub window: EvaluationWindow,
}

/// Fill missing version, timestamp and type, then overwrite the
/// traceability metadata. Applying it twice changes nothing.
pub fn normalize_metrics(metrics: &mut [MetricValueVersioned], ctx: &TraceContext) {
    for metric in metrics.iter_mut() {
        let kind = metric.metric_name;
        let version = metric
            .version
            .get_or_insert_with(|| ctx.policy_version.clone())
            .clone();
        metric.timestamp.get_or_insert_with(Utc::now);
        metric
            .metric_type
            .get_or_insert_with(|| kind.as_str().to_string());

        let meta = &mut metric.metadata;
        meta.app_id = Some(ctx.app_id.clone());
        meta.policy_name = Some(ctx.policy_name.clone());
        meta.policy_version = Some(ctx.policy_version.clone());
        meta.value_object_type = Some(METRIC_VALUE_OBJECT_TYPE.to_string());
        meta.value_object_version = Some(version);
        meta.dedupe_trace_id = Some(ctx.dedupe_trace_id.clone());
        meta.window_start = Some(ctx.window.start);
        meta.window_end = Some(ctx.window.end);
    }
}

/// Evaluate one (policy, trace identity) unit under a policy permit
async fn evaluate_unit(
    policy: Arc<dyn EvaluationPolicy>,
    records: Arc<Vec<TelemetryRecord>>,
    ctx: TraceContext,
    result_id: String,
    semaphore: Arc<Semaphore>,
) -> Result<EvaluationResult> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| EvalError::Other(format!("Policy semaphore closed: {}", e)))?;
    let mut metrics = policy.evaluate(&ctx.app_id, &records).await?;
    if metrics.is_empty() {
        return Err(EvalError::Other(format!(
            "policy {} returned no metrics",
            ctx.policy_name
        )));
    }
    normalize_metrics(&mut metrics, &ctx);
    Ok(EvaluationResult {
        id: result_id,
        app_id: ctx.app_id,
        timestamp: Utc::now(),
        policy_name: ctx.policy_name,
        metrics,
        breaches: Vec::new(),
    })
}

/// Outcome of one chunk
#[derive(Default)]
struct ChunkOutcome {
    results: Vec<EvaluationResult>,
    failures: Vec<String>,
    skipped: usize,
}

pub struct BatchEvaluationRunner {
    registry: Arc<PolicyRegistry>,
    source: Arc<dyn TelemetrySource>,
    store: Arc<dyn ResultStore>,
    policy_concurrency: usize,
}

impl BatchEvaluationRunner {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        source: Arc<dyn TelemetrySource>,
        store: Arc<dyn ResultStore>,
        policy_concurrency: usize,
    ) -> Self {
        let policy_concurrency = policy_concurrency.max(1);
        Self {
            registry,
            source,
            store,
            policy_concurrency,
        }
    }

    pub fn policy_concurrency(&self) -> usize {
        self.policy_concurrency
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Registered and configured policies of `app`, in configured order.
    ///
    /// Unregistered or unconfigured names are contract errors and fail the
    /// whole application before any telemetry is read.
    fn prepare_policies(&self, app: &ResolvedAppConfig) -> Result<Vec<PreparedPolicy>> {
        let mut prepared = Vec::with_capacity(app.policy_names.len());
        let mut seen = HashSet::new();
        for name in &app.policy_names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            if !self.registry.contains(name) {
                return Err(EvalError::UnknownPolicy(name.clone()));
            }
            let config = app
                .policies
                .get(name)
                .ok_or_else(|| EvalError::MissingPolicyConfig(name.clone()))?;
            let policy = self.registry.create(config)?;
            prepared.push(PreparedPolicy {
                name: name.clone(),
                version: config.version(),
                policy,
            });
        }
        Ok(prepared)
    }

    /// Evaluate `app` over `window` and persist the new results.
    ///
    /// At most `policy_concurrency` policies of this run evaluate at once,
    /// across all of its chunks. Concurrent runs each get their own bound.
    ///
    /// Returns only results produced by this call. If some policies fail,
    /// the successful results are still saved and the failures are returned
    /// as [`EvalError::PolicyFailures`].
    pub async fn run_for_application(
        &self,
        app: &ResolvedAppConfig,
        window: &EvaluationWindow,
    ) -> Result<Vec<EvaluationResult>> {
        let policies = self.prepare_policies(app)?;
        let semaphore = Arc::new(Semaphore::new(self.policy_concurrency));
        debug!(
            "Fetching telemetry for app_id={} window={}",
            app.app_id, window
        );

        let mut produced: HashSet<String> = HashSet::new();
        let mut results = Vec::new();
        let mut failures = Vec::new();
        let mut skipped = 0usize;
        let mut total_records = 0usize;
        let mut handled_chunks = false;

        let mut stream = self.source.fetch(&app.app_id, window);
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(
                        "Telemetry stream failed for app_id={} after {} records: {}",
                        app.app_id, total_records, e
                    );
                    self.persist(app, &results).await?;
                    return Err(e);
                }
            };
            if chunk.is_empty() {
                continue;
            }
            handled_chunks = true;
            total_records += chunk.len();

            let outcome = self
                .evaluate_chunk(app, &policies, chunk, window, &semaphore, &mut produced)
                .await?;
            skipped += outcome.skipped;
            results.extend(outcome.results);
            failures.extend(outcome.failures);
        }

        if !handled_chunks {
            debug!(
                "No telemetry for app_id={} in {}; running empty evaluation pass",
                app.app_id, window
            );
            let outcome = self
                .evaluate_chunk(app, &policies, Vec::new(), window, &semaphore, &mut produced)
                .await?;
            skipped += outcome.skipped;
            results.extend(outcome.results);
            failures.extend(outcome.failures);
        }

        debug!(
            "Processed {} telemetry records for app_id={} ({} units skipped)",
            total_records, app.app_id, skipped
        );
        self.persist(app, &results).await?;

        if failures.is_empty() {
            Ok(results)
        } else {
            Err(EvalError::PolicyFailures {
                app_id: app.app_id.clone(),
                failures,
            })
        }
    }

    async fn persist(&self, app: &ResolvedAppConfig, results: &[EvaluationResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        self.store.save_results(results).await?;
        info!(
            "Saved {} evaluation results for app_id={}",
            results.len(),
            app.app_id
        );
        Ok(())
    }

    async fn evaluate_chunk(
        &self,
        app: &ResolvedAppConfig,
        policies: &[PreparedPolicy],
        records: Vec<TelemetryRecord>,
        window: &EvaluationWindow,
        semaphore: &Arc<Semaphore>,
        produced: &mut HashSet<String>,
    ) -> Result<ChunkOutcome> {
        let mut outcome = ChunkOutcome::default();
        let trace_identity = derive_trace_identity(&records, window);

        let expected: Vec<(&PreparedPolicy, String)> = policies
            .iter()
            .map(|p| {
                let id = stable_result_id(&app.app_id, &p.name, &trace_identity, &p.version);
                (p, id)
            })
            .collect();
        if expected.is_empty() {
            return Ok(outcome);
        }

        let ids: HashSet<String> = expected.iter().map(|(_, id)| id.clone()).collect();
        let existing = self.store.results_exist(&ids).await?;
        if !existing.is_empty() {
            info!(
                "Skipping {}/{} previously evaluated policies for app_id={} trace={}",
                existing.len(),
                expected.len(),
                app.app_id,
                trace_identity
            );
        }

        let records = Arc::new(records);
        let mut tasks = JoinSet::new();
        for (prepared, result_id) in expected {
            if existing.contains(&result_id) || !produced.insert(result_id.clone()) {
                outcome.skipped += 1;
                continue;
            }
            let ctx = TraceContext {
                app_id: app.app_id.clone(),
                policy_name: prepared.name.clone(),
                policy_version: prepared.version.clone(),
                dedupe_trace_id: trace_identity.clone(),
                window: *window,
            };
            let policy = prepared.policy.clone();
            let records = records.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let name = ctx.policy_name.clone();
                let evaluated = evaluate_unit(policy, records, ctx, result_id, semaphore).await;
                (name, evaluated)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => outcome.results.push(result),
                Ok((name, Err(e))) => {
                    warn!(
                        "Policy {} failed for app_id={}: {}",
                        name, app.app_id, e
                    );
                    outcome.failures.push(format!("{}: {}", name, e));
                }
                Err(join_err) => {
                    warn!("Policy task failed for app_id={}: {}", app.app_id, join_err);
                    outcome
                        .failures
                        .push(format!("policy task aborted: {}", join_err));
                }
            }
        }

        // Completion order is arbitrary; keep results in configured order
        outcome.results.sort_by_key(|r| {
            policies
                .iter()
                .position(|p| p.name == r.policy_name)
                .unwrap_or(usize::MAX)
        });
        Ok(outcome)
    }
}
