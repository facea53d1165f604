//! Configuration file loading, environment overrides and caching

use evalguard_core::{
    config::{list_resolved_apps, resolve_app_config, TelemetrySourceKind, CACHE_TTL_ENV},
    ConfigLoader, EvalError, RootConfig,
};
use serial_test::serial;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const YAML: &str = r#"
batch_app_concurrency: 4
store:
  url: "${EVALGUARD_TEST_DB_DIR}/results.db"
evaluation_policies:
  precision:
    parameters:
      version: "1.0"
  latency: {}
global_thresholds:
  system_reliability_latency:
    - level: critical
      value: 2000
      direction: max
app_config:
  support-bot:
    batch_time: "*/30 * * * *"
  search:
    evaluation_policies: [latency]
"#;

fn write(dir: &TempDir, name: &str, text: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).unwrap();
    path
}

#[test]
#[serial]
fn test_file_values_and_env_expansion() {
    std::env::set_var("EVALGUARD_TEST_DB_DIR", "/var/lib/evalguard");
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "evalguard.yaml", YAML);

    let root = RootConfig::from_file(&path).unwrap();
    assert_eq!(root.batch_app_concurrency, 4);
    assert_eq!(root.store.url, "/var/lib/evalguard/results.db");
    assert_eq!(root.telemetry_source.kind, TelemetrySourceKind::Store);

    let support = resolve_app_config(&root, "support-bot");
    assert_eq!(support.batch_time, "*/30 * * * *");
    assert_eq!(support.policy_names, vec!["latency", "precision"]);
    assert_eq!(support.thresholds["system_reliability_latency"][0].value, 2000.0);

    let search = resolve_app_config(&root, "search");
    assert_eq!(search.policy_names, vec!["latency"]);

    let ids: Vec<String> = list_resolved_apps(&root).into_iter().map(|a| a.app_id).collect();
    assert_eq!(ids, vec!["search", "support-bot"]);
    std::env::remove_var("EVALGUARD_TEST_DB_DIR");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    std::env::set_var("EVALGUARD__BATCH_APP_CONCURRENCY", "7");
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "evalguard.yaml", YAML);

    let root = RootConfig::from_file(&path);
    std::env::remove_var("EVALGUARD__BATCH_APP_CONCURRENCY");
    assert_eq!(root.unwrap().batch_app_concurrency, 7);
}

#[test]
#[serial]
fn test_json_config_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "evalguard.json",
        r#"{"default_batch_time": "0 3 * * *", "app_config": {"a": {}}}"#,
    );
    let root = RootConfig::from_file(&path).unwrap();
    assert_eq!(resolve_app_config(&root, "a").batch_time, "0 3 * * *");
}

#[test]
#[serial]
fn test_invalid_cron_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "bad.yaml",
        "app_config:\n  a:\n    batch_time: \"every day\"\n",
    );
    let err = RootConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, EvalError::Config(msg) if msg.contains("app_config.a.batch_time")));
}

#[test]
#[serial]
fn test_missing_file_is_config_error() {
    let loader = ConfigLoader::with_ttl_seconds(60);
    let err = loader.load("/nonexistent/evalguard.yaml").unwrap_err();
    assert!(matches!(err, EvalError::Config(_)));
}

#[test]
#[serial]
fn test_loader_caches_until_file_changes() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "evalguard.yaml", "batch_app_concurrency: 2\n");
    let loader = ConfigLoader::with_ttl_seconds(300);

    let first = loader.load(&path).unwrap();
    let second = loader.load(&path).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Make sure the modification time moves on coarse filesystems
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(&path, "batch_app_concurrency: 3\n").unwrap();
    let third = loader.load(&path).unwrap();
    assert_eq!(third.batch_app_concurrency, 3);

    let forced = loader.reload(&path).unwrap();
    assert!(!Arc::ptr_eq(&third, &forced));
}

#[test]
#[serial]
fn test_loader_ttl_from_environment() {
    std::env::set_var(CACHE_TTL_ENV, "1");
    let loader = ConfigLoader::new();
    std::env::remove_var(CACHE_TTL_ENV);

    let dir = TempDir::new().unwrap();
    let path = write(&dir, "evalguard.yaml", "batch_app_concurrency: 2\n");
    let first = loader.load(&path).unwrap();
    std::thread::sleep(Duration::from_millis(1100));
    let second = loader.load(&path).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}
