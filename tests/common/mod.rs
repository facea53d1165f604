//! Common test utilities and helpers

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use evalguard_core::{
    config::{PolicyConfig, ResolvedAppConfig},
    EvaluationWindow, StorePool, TelemetryRecord,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tempfile::TempDir;

/// The window every fixture record falls into
pub fn test_window() -> EvaluationWindow {
    EvaluationWindow::new(
        Utc.with_ymd_and_hms(2026, 2, 24, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).unwrap(),
    )
    .expect("Valid test window")
}

/// A record inside [`test_window`] tagged with `trace_id`
pub fn record(id: &str, app_id: &str, trace_id: Option<&str>, hour: u32) -> TelemetryRecord {
    let mut metadata = HashMap::new();
    if let Some(trace) = trace_id {
        metadata.insert("trace_id".to_string(), serde_json::json!(trace));
    }
    TelemetryRecord {
        id: id.to_string(),
        app_id: app_id.to_string(),
        timestamp: Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).unwrap(),
        model_id: "gpt-test".to_string(),
        model_version: "1".to_string(),
        input_text: "How do I reset my password?".to_string(),
        output_text: "Open settings and choose reset password.".to_string(),
        expected_output: None,
        user_id: None,
        latency_ms: Some(120.0),
        metadata,
    }
}

/// Resolved application with the given (policy name, version) pairs
pub fn app_with_policies(app_id: &str, policies: &[(&str, &str)]) -> ResolvedAppConfig {
    ResolvedAppConfig {
        app_id: app_id.to_string(),
        batch_time: "0 * * * *".to_string(),
        policy_names: policies.iter().map(|(n, _)| n.to_string()).collect(),
        policies: policies
            .iter()
            .map(|(name, version)| {
                (
                    name.to_string(),
                    PolicyConfig::new(*name).with_param("version", serde_json::json!(version)),
                )
            })
            .collect(),
        thresholds: BTreeMap::new(),
        metadata: BTreeMap::new(),
    }
}

/// Local database in a temporary directory; keep the TempDir alive
pub async fn create_test_pool() -> (TempDir, Arc<StorePool>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("evalguard.db");
    let pool = StorePool::open_local(path.to_string_lossy().to_string())
        .await
        .expect("Failed to open test database");
    (dir, Arc::new(pool))
}
