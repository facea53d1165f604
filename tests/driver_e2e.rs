//! End-to-end batch driver tests over in-memory stores

mod common;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::record;
use evalguard_core::{
    config::{AppConfig, PolicyConfig, ThresholdConfig},
    orchestration::{AlertChannel, AlertMessage, ItemStatus, LogLevel, RunStatus},
    types::ThresholdDirection,
    AlertNotifier, BatchDriver, BatchEvaluationRunner, BatchOptions, InMemoryJobStore,
    InMemoryResultStore, InMemoryTelemetryStore, JobStatusStore, PolicyRegistry, RootConfig,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingChannel {
    messages: Mutex<Vec<AlertMessage>>,
}

impl RecordingChannel {
    fn subjects(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl AlertChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &AlertMessage) -> evalguard_core::Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn config() -> RootConfig {
    let mut root = RootConfig::default();
    root.evaluation_policies
        .insert("precision".to_string(), PolicyConfig::new("precision"));
    root.evaluation_policies
        .insert("latency".to_string(), PolicyConfig::new("latency"));
    root.global_thresholds.insert(
        "system_reliability_latency".to_string(),
        vec![ThresholdConfig {
            level: "critical".to_string(),
            value: 100.0,
            direction: ThresholdDirection::Max,
        }],
    );
    root.app_config.insert("app-a".to_string(), AppConfig::default());
    root.app_config.insert(
        "app-b".to_string(),
        AppConfig {
            evaluation_policies: vec!["ghost".to_string()],
            ..AppConfig::default()
        },
    );
    root.app_config.insert("app-c".to_string(), AppConfig::default());
    root
}

struct Harness {
    driver: BatchDriver,
    jobs: Arc<InMemoryJobStore>,
    results: Arc<InMemoryResultStore>,
    alerts: Arc<RecordingChannel>,
}

fn harness(config: RootConfig) -> Harness {
    let source = Arc::new(InMemoryTelemetryStore::with_records(
        10,
        vec![
            record("a1", "app-a", Some("TA"), 3),
            record("a2", "app-a", Some("TA"), 4),
        ],
    ));
    let results = Arc::new(InMemoryResultStore::new());
    let jobs = Arc::new(InMemoryJobStore::new());
    let alerts = Arc::new(RecordingChannel::default());

    let runner = Arc::new(BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source,
        results.clone(),
        config.batch_policy_concurrency,
    ));
    let notifier = Arc::new(AlertNotifier::disabled().with_channel(alerts.clone()));
    let driver = BatchDriver::new(Arc::new(config), runner, jobs.clone(), notifier);

    Harness {
        driver,
        jobs,
        results,
        alerts,
    }
}

fn options() -> BatchOptions {
    BatchOptions {
        as_of: Some(Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).unwrap()),
        ..BatchOptions::default()
    }
}

#[tokio::test]
async fn test_failing_app_does_not_stop_the_batch() {
    let h = harness(config());

    let summary = h.driver.run_batch(options()).await.unwrap();
    let run_id = summary.run_id.clone().unwrap();
    assert_eq!(summary.status, Some(RunStatus::PartialFailed));

    let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.app_id.as_str()).collect();
    assert_eq!(ids, vec!["app-a", "app-b", "app-c"]);

    let a = &summary.outcomes[0];
    assert_eq!(a.status, ItemStatus::Completed);
    assert_eq!(a.policy_runs, 2);
    assert_eq!(a.breach_count, 1);

    let b = &summary.outcomes[1];
    assert_eq!(b.status, ItemStatus::Failed);
    assert!(b.error.as_deref().unwrap().contains("ghost"));

    // app-c has no telemetry; the empty pass scores latency at 0
    let c = &summary.outcomes[2];
    assert_eq!(c.status, ItemStatus::Completed);
    assert_eq!(c.policy_runs, 2);
    assert_eq!(c.breach_count, 0);

    assert_eq!(h.results.len(), 4);
    assert_eq!(h.alerts.subjects().len(), 1);
    assert!(h.alerts.subjects()[0].contains("app-a"));

    let run = h.jobs.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::PartialFailed);
    assert!(run.ended_at.is_some());

    let failed = run.item("app-b").unwrap();
    assert!(failed.traceback.is_some());
    assert!(failed.logs.iter().any(|l| l.level == LogLevel::Error));

    let done = run.item("app-a").unwrap();
    assert_eq!(done.policy_runs, 2);
    assert!(done.next_batch_run_utc.is_some());
    assert!(done.started_at.is_some() && done.ended_at.is_some());
}

#[tokio::test]
async fn test_rerun_writes_nothing_new() {
    let h = harness(config());
    h.driver.run_batch(options()).await.unwrap();

    let summary = h.driver.run_batch(options()).await.unwrap();
    assert_eq!(summary.outcomes[0].policy_runs, 0);
    assert_eq!(summary.outcomes[0].breach_count, 0);
    assert_eq!(h.results.len(), 4);
    assert_eq!(h.alerts.subjects().len(), 1);
    assert_eq!(h.jobs.load_runs().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_shard_selection_records_shard() {
    let h = harness(config());
    let summary = h
        .driver
        .run_batch(BatchOptions {
            group_size: 2,
            group_index: 1,
            ..options()
        })
        .await
        .unwrap();

    let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.app_id.as_str()).collect();
    assert_eq!(ids, vec!["app-c"]);
    assert_eq!(summary.status, Some(RunStatus::Completed));

    let run = h
        .jobs
        .get_run(summary.run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let shard = run.shard.unwrap();
    assert_eq!((shard.group_size, shard.group_index), (2, 1));
}

#[tokio::test]
async fn test_single_app_mode_ignores_sharding() {
    let h = harness(config());
    let summary = h
        .driver
        .run_batch(BatchOptions {
            app_id: Some("app-a".to_string()),
            group_size: 2,
            group_index: 1,
            ..options()
        })
        .await
        .unwrap();

    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.outcomes[0].app_id, "app-a");
    let run = h
        .jobs
        .get_run(summary.run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(run.shard.is_none());
}

#[tokio::test]
async fn test_no_selected_apps_opens_no_run() {
    let mut empty = config();
    empty.app_config.clear();
    let h = harness(empty);

    let summary = h.driver.run_batch(options()).await.unwrap();
    assert!(summary.run_id.is_none());
    assert!(summary.status.is_none());
    assert!(summary.outcomes.is_empty());
    assert!(h.jobs.load_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_only_due_skips_apps_that_already_ran() {
    let h = harness(config());
    h.driver.run_batch(options()).await.unwrap();

    // app-b failed, so it is the only application still due
    let summary = h
        .driver
        .run_batch(BatchOptions {
            only_due: true,
            ..options()
        })
        .await
        .unwrap();
    let ids: Vec<&str> = summary.outcomes.iter().map(|o| o.app_id.as_str()).collect();
    assert_eq!(ids, vec!["app-b"]);
}

#[tokio::test]
async fn test_restore_schedule_from_history() {
    let h = harness(config());
    h.driver.run_batch(options()).await.unwrap();

    let jobs: Arc<dyn JobStatusStore> = h.jobs.clone();
    let restored = BatchDriver::new(
        Arc::new(config()),
        Arc::new(BatchEvaluationRunner::new(
            Arc::new(PolicyRegistry::builtin()),
            Arc::new(InMemoryTelemetryStore::new(10)),
            h.results.clone(),
            2,
        )),
        jobs,
        Arc::new(AlertNotifier::disabled()),
    );
    assert_eq!(restored.restore_schedule().await.unwrap(), 2);
}
