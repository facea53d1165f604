//! Evalguard - scheduled batch evaluation of AI application telemetry
//!
//! Command line entry point: runs batches, serves the dashboard API,
//! initializes stores and ingests telemetry files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use evalguard_core::{
    api::{ApiServer, ApiServerConfig, DashboardState},
    config::TelemetrySourceKind,
    evaluation::PolicyRegistry,
    telemetry::{IngestQueue, OtlpFileSource, RawTelemetryEvent},
    AlertNotifier, BatchDriver, BatchEvaluationRunner, BatchOptions, ConfigLoader, JobStatusStore,
    LibsqlJobStore, LibsqlResultStore, LibsqlTelemetryStore, ResultStore, RetryPolicy, RootConfig,
    StorePool, TelemetrySink, TelemetrySource,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "evalguard")]
#[command(about = "Scheduled batch evaluation of AI application telemetry", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML, JSON or TOML)
    #[arg(short, long, global = true, env = "EVALGUARD_CONFIG", default_value = "evalguard.yaml")]
    config: PathBuf,

    /// Set log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate configured applications over a lookback window
    Run {
        /// Evaluate only this application
        #[arg(long)]
        app_id: Option<String>,

        /// Lookback window in hours
        #[arg(long, default_value = "24")]
        window_hours: i64,

        /// Applications per shard (0 runs every application)
        #[arg(long, default_value = "0")]
        group_size: usize,

        /// Zero-based shard index
        #[arg(long, default_value = "0")]
        group_index: usize,

        /// Applications evaluated concurrently
        #[arg(long)]
        app_concurrency: Option<usize>,

        /// Policy evaluations in flight across all applications
        #[arg(long)]
        policy_concurrency: Option<usize>,

        /// Skip applications whose schedule is not due
        #[arg(long)]
        only_due: bool,

        /// Window end as RFC 3339 (defaults to now)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Serve the read-only dashboard API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /// Create the databases and apply migrations
    Init,

    /// Ingest telemetry events from a JSON array or JSON lines file
    Ingest {
        /// Event file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Parse and validate the configuration, then list resolved applications
    ValidateConfig {
        /// Dump the resolved application configs as YAML
        #[arg(long)]
        print: bool,
    },
}

/// Databases opened from configuration
struct Stores {
    results: Arc<StorePool>,
    jobs: Arc<dyn JobStatusStore>,
}

async fn open_stores(config: &RootConfig) -> Result<Stores> {
    let results = Arc::new(
        StorePool::from_config(&config.store)
            .await
            .context("Failed to open result store")?,
    );
    let jobs_pool = match &config.job_store.path {
        Some(path) => {
            debug!("Job tracking uses a separate database at {}", path);
            Arc::new(
                StorePool::open_local(path.clone())
                    .await
                    .context("Failed to open job store")?,
            )
        }
        None => results.clone(),
    };
    Ok(Stores {
        results,
        jobs: Arc::new(LibsqlJobStore::new(jobs_pool)),
    })
}

fn load_config(path: &Path) -> Result<Arc<RootConfig>> {
    ConfigLoader::new()
        .load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    config: Arc<RootConfig>,
    app_id: Option<String>,
    window_hours: i64,
    group_size: usize,
    group_index: usize,
    app_concurrency: Option<usize>,
    policy_concurrency: Option<usize>,
    only_due: bool,
    as_of: Option<String>,
) -> Result<()> {
    let as_of = as_of
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid --as-of timestamp '{}'", raw))
        })
        .transpose()?;

    let stores = open_stores(&config).await?;
    let retry = RetryPolicy::from(&config.store.retry);

    let source: Arc<dyn TelemetrySource> = match config.telemetry_source.kind {
        TelemetrySourceKind::Store => Arc::new(LibsqlTelemetryStore::new(
            stores.results.clone(),
            retry.clone(),
            config.telemetry_page_size,
        )),
        TelemetrySourceKind::Otlp => {
            let path = config
                .telemetry_source
                .otlp_file_path
                .clone()
                .unwrap_or_default();
            Arc::new(OtlpFileSource::new(path, config.otlp_stream_chunk_size)?)
        }
    };
    let store: Arc<dyn ResultStore> = Arc::new(
        LibsqlResultStore::new(stores.results.clone(), &config.store).with_retry(retry),
    );

    let runner = Arc::new(BatchEvaluationRunner::new(
        Arc::new(PolicyRegistry::builtin()),
        source,
        store,
        policy_concurrency.unwrap_or(config.batch_policy_concurrency),
    ));
    let notifier = Arc::new(AlertNotifier::from_config(&config.alerting)?);
    let driver = BatchDriver::new(config, runner, stores.jobs, notifier);
    if only_due {
        driver.restore_schedule().await?;
    }

    let summary = driver
        .run_batch(BatchOptions {
            app_id,
            window_hours,
            group_size,
            group_index,
            app_concurrency,
            only_due,
            as_of,
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.failed() > 0 {
        anyhow::bail!(
            "{} of {} application(s) failed in {}",
            summary.failed(),
            summary.outcomes.len(),
            summary.run_id.as_deref().unwrap_or("batch")
        );
    }
    Ok(())
}

async fn serve(config: Arc<RootConfig>, addr: String) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;

    let stores = open_stores(&config).await?;
    let results: Arc<dyn ResultStore> =
        Arc::new(LibsqlResultStore::new(stores.results.clone(), &config.store));
    let state = DashboardState::new(stores.jobs, results, config);

    ApiServer::new(ApiServerConfig { addr: socket_addr }, state)
        .serve()
        .await
}

async fn init(config: Arc<RootConfig>) -> Result<()> {
    let stores = open_stores(&config).await?;
    let applied = stores.results.applied_migrations().await?;
    println!("✓ Result store ready ({})", config.store.url);
    for name in &applied {
        println!("  migration {}", name);
    }
    if let Some(path) = &config.job_store.path {
        println!("✓ Job store ready ({})", path);
    }
    Ok(())
}

fn read_events(path: &Path) -> Result<Vec<RawTelemetryEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if text.trim_start().starts_with('[') {
        return Ok(serde_json::from_str(&text)?);
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", n + 1))
        })
        .collect()
}

async fn ingest(config: Arc<RootConfig>, file: PathBuf) -> Result<()> {
    let events = read_events(&file)?;
    info!("Ingesting {} event(s) from {}", events.len(), file.display());

    let stores = open_stores(&config).await?;
    let retry = RetryPolicy::from(&config.store.retry);
    let sink: Arc<dyn TelemetrySink> = Arc::new(LibsqlTelemetryStore::new(
        stores.results.clone(),
        retry.clone(),
        config.telemetry_page_size,
    ));
    let queue = IngestQueue::spawn(sink, &config.ingest, retry);

    let mut rejected = 0usize;
    for event in events {
        if let Err(e) = queue.enqueue(event).await {
            warn!("Rejected event: {}", e);
            rejected += 1;
        }
    }

    let stats = queue.shutdown().await?;
    println!(
        "accepted={} written={} failed={} rejected={}",
        stats.accepted, stats.written, stats.failed, rejected
    );
    if stats.failed > 0 {
        anyhow::bail!("{} record(s) could not be written", stats.failed);
    }
    Ok(())
}

fn validate_config(config: Arc<RootConfig>, print: bool) -> Result<()> {
    let registry = PolicyRegistry::builtin();
    let mut problems = Vec::new();

    for name in config.evaluation_policies.keys() {
        if !registry.contains(name) {
            problems.push(format!("policy '{}' has no registered implementation", name));
        }
    }

    println!("✓ Configuration parsed");
    for app in evalguard_core::config::list_resolved_apps(&config) {
        println!(
            "  {} batch_time='{}' policies=[{}] thresholds={}",
            app.app_id,
            app.batch_time,
            app.policy_names.join(", "),
            app.thresholds.len()
        );
        for name in &app.policy_names {
            if !app.policies.contains_key(name) {
                problems.push(format!("{}: policy '{}' is not configured", app.app_id, name));
            }
        }
    }

    if print {
        let apps = evalguard_core::config::list_resolved_apps(&config);
        print!("{}", serde_yaml::to_string(&apps)?);
    }

    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("✗ {}", problem);
        }
        anyhow::bail!("{} configuration problem(s)", problems.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Keep noisy dependencies at warn unless RUST_LOG says otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "evalguard={lvl},evalguard_core={lvl},libsql=warn,hyper=warn,reqwest=warn",
            lvl = level.as_str().to_lowercase()
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Evalguard v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            app_id,
            window_hours,
            group_size,
            group_index,
            app_concurrency,
            policy_concurrency,
            only_due,
            as_of,
        } => {
            run_batch(
                config,
                app_id,
                window_hours,
                group_size,
                group_index,
                app_concurrency,
                policy_concurrency,
                only_due,
                as_of,
            )
            .await
        }
        Commands::Serve { addr } => serve(config, addr).await,
        Commands::Init => init(config).await,
        Commands::Ingest { file } => ingest(config, file).await,
        Commands::ValidateConfig { print } => validate_config(config, print),
    }
}
