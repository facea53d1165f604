//! Configuration loading and per-application resolution
//!
//! Configuration is read from a YAML, JSON or TOML file through the `config`
//! crate and layered with `EVALGUARD__*` environment overrides. `${VAR}` and
//! `$VAR` references in the file are expanded from the process environment
//! before parsing. [`ConfigLoader`] caches parsed files by canonical path and
//! reloads them when the file changes or the cache entry expires.

use crate::error::{EvalError, Result};
use crate::types::ThresholdDirection;
use config::{Config, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Prefix for environment overrides, e.g. `EVALGUARD__BATCH_APP_CONCURRENCY=4`
pub const ENV_PREFIX: &str = "EVALGUARD";

/// Environment variable controlling the loader cache TTL in seconds
pub const CACHE_TTL_ENV: &str = "CONFIG_CACHE_TTL_SECONDS";

const DEFAULT_CACHE_TTL_SECONDS: i64 = 60;

/// Policy version used when a policy sets none
pub const DEFAULT_POLICY_VERSION: &str = "1.0";

static ENV_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Valid env reference regex")
});

/// Expand `${VAR}` and `$VAR` from the environment; unknown names are kept
pub fn expand_env_vars(text: &str) -> String {
    ENV_REF
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            StringOrList::Many(list) => list.into_iter().map(|p| p.trim().to_string()).collect(),
        }
    }
}

/// Accept either `[a, b]` or `"a, b"`
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrList>::deserialize(deserializer)?
        .map(StringOrList::into_vec)
        .unwrap_or_default())
}

fn opt_string_or_list<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringOrList>::deserialize(deserializer)?.map(StringOrList::into_vec))
}

/// One threshold rule for a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub level: String,
    pub value: f64,
    #[serde(default)]
    pub direction: ThresholdDirection,
}

/// Threshold rules keyed by metric name
pub type ThresholdMap = BTreeMap<String, Vec<ThresholdConfig>>;

/// Named evaluation policy with free-form parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Filled from the map key at load time
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl PolicyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// `parameters.version`, defaulting to "1.0"
    pub fn version(&self) -> String {
        self.param_str("version")
            .unwrap_or_else(|| DEFAULT_POLICY_VERSION.to_string())
    }

    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            serde_json::Value::String(s) if s.trim().is_empty() => None,
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// String list parameter given as an array or a comma-separated string
    pub fn param_list(&self, key: &str) -> Option<Vec<String>> {
        match self.parameters.get(key)? {
            serde_json::Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            serde_json::Value::String(s) => Some(StringOrList::One(s.clone()).into_vec()),
            _ => None,
        }
    }
}

/// Per-application overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub batch_time: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub evaluation_policies: Vec<String>,
    pub thresholds: ThresholdMap,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Retry and timeout settings for store operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub operation_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 250,
            operation_timeout_ms: 30_000,
        }
    }
}

/// Telemetry and result database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Local file path or `libsql://` / `https://` URL
    pub url: String,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub retry: RetrySettings,
    /// Ids per existence query
    pub exists_batch_size: usize,
    /// Rows per partition transaction
    pub write_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "evalguard.db".to_string(),
            auth_token: None,
            retry: RetrySettings::default(),
            exists_batch_size: 100,
            write_batch_size: 100,
        }
    }
}

/// Job tracking database; shares the result database when no path is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySourceKind {
    #[default]
    Store,
    Otlp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySourceConfig {
    #[serde(rename = "type")]
    pub kind: TelemetrySourceKind,
    pub otlp_file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamsAlertConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub webhook_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub min_level: String,
    pub teams: TeamsAlertConfig,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_level: "warning".to_string(),
            teams: TeamsAlertConfig::default(),
        }
    }
}

/// Bounded ingestion queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub enqueue_timeout_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 2_000,
            enqueue_timeout_ms: 1_000,
        }
    }
}

/// Root configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub default_batch_time: String,
    pub batch_app_concurrency: usize,
    pub batch_policy_concurrency: usize,
    pub telemetry_page_size: usize,
    pub otlp_stream_chunk_size: usize,
    pub ingest: IngestSettings,
    pub evaluation_policies: BTreeMap<String, PolicyConfig>,
    #[serde(deserialize_with = "opt_string_or_list")]
    pub default_evaluation_policies: Option<Vec<String>>,
    pub global_thresholds: ThresholdMap,
    pub app_config: BTreeMap<String, AppConfig>,
    pub telemetry_source: TelemetrySourceConfig,
    pub store: StoreConfig,
    pub job_store: JobStoreConfig,
    pub alerting: AlertingConfig,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            default_batch_time: "0 * * * *".to_string(),
            batch_app_concurrency: 10,
            batch_policy_concurrency: 10,
            telemetry_page_size: 100,
            otlp_stream_chunk_size: 100,
            ingest: IngestSettings::default(),
            evaluation_policies: BTreeMap::new(),
            default_evaluation_policies: None,
            global_thresholds: ThresholdMap::new(),
            app_config: BTreeMap::new(),
            telemetry_source: TelemetrySourceConfig::default(),
            store: StoreConfig::default(),
            job_store: JobStoreConfig::default(),
            alerting: AlertingConfig::default(),
        }
    }
}

impl RootConfig {
    /// Parse configuration text in the given format, applying env overrides
    pub fn parse(text: &str, format: FileFormat) -> Result<Self> {
        let expanded = expand_env_vars(text);
        let settings = Config::builder()
            .add_source(File::from_str(&expanded, format))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut root: RootConfig = settings.try_deserialize()?;
        root.finish()?;
        Ok(root)
    }

    /// Read and parse a configuration file; the format follows the extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = format_for(path)?;
        let text = std::fs::read_to_string(path).map_err(|e| {
            EvalError::Config(format!(
                "Configuration file not found: {} ({})",
                path.display(),
                e
            ))
        })?;
        Self::parse(&text, format)
    }

    fn finish(&mut self) -> Result<()> {
        for (name, policy) in self.evaluation_policies.iter_mut() {
            policy.name = name.clone();
        }
        for thresholds in self
            .global_thresholds
            .values_mut()
            .chain(self.app_config.values_mut().flat_map(|a| a.thresholds.values_mut()))
        {
            for t in thresholds.iter_mut() {
                t.level = t.level.trim().to_lowercase();
            }
        }
        self.alerting.min_level = self.alerting.min_level.trim().to_lowercase();
        self.validate()
    }

    /// Reject values that would make a batch run meaningless
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_app_concurrency", self.batch_app_concurrency),
            ("batch_policy_concurrency", self.batch_policy_concurrency),
            ("telemetry_page_size", self.telemetry_page_size),
            ("otlp_stream_chunk_size", self.otlp_stream_chunk_size),
            ("ingest.queue_capacity", self.ingest.queue_capacity),
            ("ingest.batch_size", self.ingest.batch_size),
            ("store.exists_batch_size", self.store.exists_batch_size),
            ("store.write_batch_size", self.store.write_batch_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(EvalError::Config(format!("{} must be >= 1", key)));
            }
        }

        if self.telemetry_source.kind == TelemetrySourceKind::Otlp
            && self
                .telemetry_source
                .otlp_file_path
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(EvalError::Config(
                "telemetry_source.otlp_file_path is required when type is 'otlp'".to_string(),
            ));
        }

        crate::orchestration::scheduler::parse_cron(&self.default_batch_time)?;
        for (app_id, app) in &self.app_config {
            if let Some(expr) = &app.batch_time {
                crate::orchestration::scheduler::parse_cron(expr).map_err(|e| {
                    EvalError::Config(format!("app_config.{}.batch_time: {}", app_id, e))
                })?;
            }
        }
        Ok(())
    }

    /// Policy names used by apps that do not list their own
    pub fn default_policy_names(&self) -> Vec<String> {
        match &self.default_evaluation_policies {
            Some(names) => names.clone(),
            None => self.evaluation_policies.keys().cloned().collect(),
        }
    }
}

fn format_for(path: &Path) -> Result<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "json" => Ok(FileFormat::Json),
        "toml" => Ok(FileFormat::Toml),
        _ => Err(EvalError::Config(format!(
            "Unsupported config file format '{}'. Use YAML, JSON or TOML.",
            path.display()
        ))),
    }
}

/// Configuration resolved for one application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAppConfig {
    pub app_id: String,
    pub batch_time: String,
    /// Requested policy names, including ones with no configuration
    pub policy_names: Vec<String>,
    pub policies: BTreeMap<String, PolicyConfig>,
    pub thresholds: ThresholdMap,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Resolve the effective configuration of `app_id`.
///
/// Unconfigured applications get root defaults. Application thresholds
/// replace global ones per metric name.
pub fn resolve_app_config(root: &RootConfig, app_id: &str) -> ResolvedAppConfig {
    let app = match root.app_config.get(app_id) {
        Some(app) => app.clone(),
        None => {
            info!(
                "app_id={} is not configured under app_config; applying root defaults",
                app_id
            );
            AppConfig::default()
        }
    };

    let policy_names = if app.evaluation_policies.is_empty() {
        root.default_policy_names()
    } else {
        app.evaluation_policies.clone()
    };

    let unknown: Vec<&str> = policy_names
        .iter()
        .filter(|name| !root.evaluation_policies.contains_key(name.as_str()))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        warn!(
            "app_id={} references unknown evaluation policies (skipped from configs): {:?}",
            app_id, unknown
        );
    }

    let policies = policy_names
        .iter()
        .filter_map(|name| {
            root.evaluation_policies
                .get(name)
                .map(|p| (name.clone(), p.clone()))
        })
        .collect();

    let mut thresholds = root.global_thresholds.clone();
    thresholds.extend(app.thresholds.clone());

    ResolvedAppConfig {
        app_id: app_id.to_string(),
        batch_time: app
            .batch_time
            .clone()
            .unwrap_or_else(|| root.default_batch_time.clone()),
        policy_names,
        policies,
        thresholds,
        metadata: app.metadata,
    }
}

/// Resolve every application listed under `app_config`, sorted by id
pub fn list_resolved_apps(root: &RootConfig) -> Vec<ResolvedAppConfig> {
    root.app_config
        .keys()
        .map(|app_id| resolve_app_config(root, app_id))
        .collect()
}

struct CacheEntry {
    modified: Option<SystemTime>,
    loaded_at: Instant,
    config: Arc<RootConfig>,
}

/// Caching configuration loader.
///
/// Entries are keyed by canonical path and reused while the file's
/// modification time is unchanged and the TTL has not elapsed. A TTL of
/// zero or less disables expiry.
pub struct ConfigLoader {
    ttl: Option<Duration>,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader with TTL from `CONFIG_CACHE_TTL_SECONDS` (default 60)
    pub fn new() -> Self {
        let ttl = std::env::var(CACHE_TTL_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(DEFAULT_CACHE_TTL_SECONDS);
        Self::with_ttl_seconds(ttl)
    }

    pub fn with_ttl_seconds(ttl: i64) -> Self {
        Self {
            ttl: (ttl > 0).then(|| Duration::from_secs(ttl as u64)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<Arc<RootConfig>> {
        self.load_inner(path.as_ref(), false)
    }

    /// Bypass the cache and re-read the file
    pub fn reload(&self, path: impl AsRef<Path>) -> Result<Arc<RootConfig>> {
        self.load_inner(path.as_ref(), true)
    }

    fn load_inner(&self, path: &Path, force: bool) -> Result<Arc<RootConfig>> {
        let canonical = path.canonicalize().map_err(|e| {
            EvalError::Config(format!(
                "Configuration file not found: {} ({})",
                path.display(),
                e
            ))
        })?;
        let modified = std::fs::metadata(&canonical)?.modified().ok();

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| EvalError::Other("config cache lock poisoned".to_string()))?;

        if !force {
            if let Some(entry) = cache.get(&canonical) {
                let fresh = self
                    .ttl
                    .map(|ttl| entry.loaded_at.elapsed() <= ttl)
                    .unwrap_or(true);
                if entry.modified == modified && fresh {
                    debug!("Using cached config for {}", canonical.display());
                    return Ok(entry.config.clone());
                }
            }
        }

        let config = Arc::new(RootConfig::from_file(&canonical)?);
        cache.insert(
            canonical.clone(),
            CacheEntry {
                modified,
                loaded_at: Instant::now(),
                config: config.clone(),
            },
        );
        debug!("Loaded config from {}", canonical.display());
        Ok(config)
    }
}
