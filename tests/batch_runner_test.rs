//! Batch runner integration tests
//!
//! Exercises idempotent re-runs, bulk existence checks and the policy
//! concurrency bound through the public API.

mod common;

use async_trait::async_trait;
use common::{app_with_policies, record, test_window};
use evalguard_core::{
    config::PolicyConfig,
    evaluation::policy_factory,
    BatchEvaluationRunner, EvalError, EvaluationPolicy, EvaluationResult, InMemoryResultStore,
    InMemoryTelemetryStore, MetricKind, MetricValueVersioned, PolicyRegistry, ResultStore,
    TelemetryRecord,
};
use mockall::mock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Store {}

    #[async_trait]
    impl ResultStore for Store {
        async fn results_exist(&self, ids: &HashSet<String>) -> evalguard_core::Result<HashSet<String>>;
        async fn result_exists(&self, id: &str) -> evalguard_core::Result<bool>;
        async fn save_results(&self, results: &[EvaluationResult]) -> evalguard_core::Result<()>;
        async fn latest_results(&self, app_id: &str, limit: usize) -> evalguard_core::Result<Vec<EvaluationResult>>;
    }
}

/// Tracks how many evaluations overlap
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

struct SlowPolicy {
    name: String,
    in_flight: Arc<InFlight>,
}

#[async_trait]
impl EvaluationPolicy for SlowPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        "1.0"
    }

    async fn evaluate(
        &self,
        _app_id: &str,
        _records: &[TelemetryRecord],
    ) -> evalguard_core::Result<Vec<MetricValueVersioned>> {
        let now = self.in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.in_flight.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.in_flight.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![MetricValueVersioned::new(MetricKind::SafetyToxicity, 1.0)])
    }
}

fn slow_registry(names: &[String], in_flight: &Arc<InFlight>) -> PolicyRegistry {
    let mut registry = PolicyRegistry::new();
    for name in names {
        let in_flight = in_flight.clone();
        registry.register(
            name.clone(),
            policy_factory(move |config: &PolicyConfig| SlowPolicy {
                name: config.name.clone(),
                in_flight: in_flight.clone(),
            }),
        );
    }
    registry
}

#[tokio::test]
async fn test_existence_checks_are_bulk_per_chunk() {
    // Three chunks of one record each, every record on its own trace
    let source = Arc::new(InMemoryTelemetryStore::with_records(
        1,
        vec![
            record("r1", "A", Some("T1"), 1),
            record("r2", "A", Some("T2"), 2),
            record("r3", "A", Some("T3"), 3),
        ],
    ));

    let mut store = MockStore::new();
    store
        .expect_results_exist()
        .times(3)
        .returning(|_| Ok(HashSet::new()));
    store.expect_result_exists().never();
    store
        .expect_save_results()
        .times(1)
        .withf(|results| results.len() == 6)
        .returning(|_| Ok(()));

    let runner = BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source,
        Arc::new(store),
        4,
    );
    let results = runner
        .run_for_application(
            &app_with_policies("A", &[("precision", "1.0"), ("latency", "1.0")]),
            &test_window(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 6);
}

#[tokio::test]
async fn test_rerun_is_idempotent_until_version_changes() {
    let source = Arc::new(InMemoryTelemetryStore::with_records(
        10,
        vec![
            record("r1", "A", Some("T1"), 1),
            record("r2", "A", Some("T1"), 2),
        ],
    ));
    let store = Arc::new(InMemoryResultStore::new());
    let runner = BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source,
        store.clone(),
        4,
    );
    let window = test_window();

    let v1 = app_with_policies("A", &[("precision", "1.0"), ("latency", "1.0")]);
    let first = runner.run_for_application(&v1, &window).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].policy_name, "precision");
    assert_eq!(first[1].policy_name, "latency");
    assert!(first.iter().all(|r| r.id.contains(":T1:")));
    assert_eq!(store.len(), 2);

    let second = runner.run_for_application(&v1, &window).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(store.len(), 2);

    let v2 = app_with_policies("A", &[("precision", "2.0"), ("latency", "1.0")]);
    let third = runner.run_for_application(&v2, &window).await.unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].policy_name, "precision");
    assert!(third[0].id.contains(":2.0:"));
    assert_eq!(third[0].metrics[0].version.as_deref(), Some("2.0"));
    assert_eq!(store.len(), 3);
    assert_eq!(store.single_calls(), 0);
}

#[tokio::test]
async fn test_empty_window_still_produces_results() {
    let source = Arc::new(InMemoryTelemetryStore::new(10));
    let store = Arc::new(InMemoryResultStore::new());
    let runner = BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source,
        store.clone(),
        2,
    );
    let app = app_with_policies("A", &[("toxicity", "1.0"), ("latency", "1.0")]);

    let results = runner.run_for_application(&app, &test_window()).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].metrics[0].value, 1.0);
    assert_eq!(results[1].metrics[0].value, 0.0);
    assert!(results.iter().all(|r| r.id.contains(":window:")));
    assert_eq!(store.exists_calls(), 1);

    // A second pass over the same empty window is a no-op
    let again = runner.run_for_application(&app, &test_window()).await.unwrap();
    assert!(again.is_empty());
}

fn slow_runner(
    names: &[String],
    in_flight: &Arc<InFlight>,
    records: Vec<TelemetryRecord>,
) -> Arc<BatchEvaluationRunner> {
    Arc::new(BatchEvaluationRunner::new(
        Arc::new(slow_registry(names, in_flight)),
        Arc::new(InMemoryTelemetryStore::with_records(10, records)),
        Arc::new(InMemoryResultStore::new()),
        2,
    ))
}

#[tokio::test]
async fn test_policy_concurrency_is_bounded_within_a_run() {
    let names: Vec<String> = (0..6).map(|i| format!("slow-{}", i)).collect();
    let in_flight = Arc::new(InFlight::default());
    let runner = slow_runner(&names, &in_flight, vec![record("a1", "A", Some("TA"), 1)]);

    let pairs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "1.0")).collect();
    let results = runner
        .run_for_application(&app_with_policies("A", &pairs), &test_window())
        .await
        .unwrap();
    assert_eq!(results.len(), 6);
    assert_eq!(in_flight.peak.load(Ordering::SeqCst), 2);
    assert_eq!(in_flight.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_runs_each_get_their_own_policy_bound() {
    let names: Vec<String> = (0..2).map(|i| format!("p{}", i)).collect();
    let in_flight = Arc::new(InFlight::default());
    let runner = slow_runner(
        &names,
        &in_flight,
        vec![
            record("a1", "A", Some("TA"), 1),
            record("b1", "B", Some("TB"), 1),
        ],
    );

    let pairs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "1.0")).collect();
    let app_a = app_with_policies("A", &pairs);
    let app_b = app_with_policies("B", &pairs);
    let window = test_window();

    let (a, b) = tokio::join!(
        runner.run_for_application(&app_a, &window),
        runner.run_for_application(&app_b, &window),
    );
    assert_eq!(a.unwrap().len(), 2);
    assert_eq!(b.unwrap().len(), 2);
    // Two runs with a bound of two each overlap all four evaluations
    assert_eq!(in_flight.peak.load(Ordering::SeqCst), 4);
    assert_eq!(in_flight.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unregistered_policy_fails_without_reading_telemetry() {
    let source = Arc::new(InMemoryTelemetryStore::with_records(
        10,
        vec![record("r1", "A", Some("T1"), 1)],
    ));
    let store = Arc::new(InMemoryResultStore::new());
    let runner = BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source.clone(),
        store.clone(),
        2,
    );

    let err = runner
        .run_for_application(
            &app_with_policies("A", &[("precision", "1.0"), ("sentiment", "1.0")]),
            &test_window(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::UnknownPolicy(name) if name == "sentiment"));
    assert_eq!(source.fetch_calls(), 0);
    assert!(store.is_empty());
}
