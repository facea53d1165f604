//! LibSQL connection pool and schema migrations
//!
//! [`StorePool`] owns the libSQL `Database` handle. It is created once in the
//! composition root and shared as `Arc<StorePool>` by the telemetry, result
//! and job stores, which each check out short-lived connections.

use crate::config::StoreConfig;
use crate::error::{EvalError, Result};
use chrono::Utc;
use libsql::{params, Builder, Connection, Database};
use tracing::{debug, info};

/// Milliseconds a local connection waits on a locked database
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Embedded migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/libsql/001_initial_schema.sql"),
)];

/// Parse SQL file into individual statements, handling multi-line constructs like triggers
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;

    for line in sql.lines() {
        let trimmed = line.trim();

        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let upper = trimmed.to_uppercase();
        if upper.starts_with("BEGIN") || upper.contains(" BEGIN") {
            depth += 1;
        }
        if upper.starts_with("END") {
            depth = depth.saturating_sub(1);
        }

        if trimmed.ends_with(';') && depth == 0 {
            statements.push(current.clone());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// Database connection mode
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionMode {
    /// Local file-based database
    Local(String),
    /// Remote database (Turso / sqld)
    Remote { url: String, token: String },
}

impl ConnectionMode {
    /// Interpret a configured store URL.
    ///
    /// `libsql://`, `http://` and `https://` URLs are remote and need a token
    /// from config or `LIBSQL_AUTH_TOKEN`; anything else is a local path.
    pub fn from_url(url: &str, token: Option<&str>) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(EvalError::Config("store.url must not be empty".to_string()));
        }
        let remote = ["libsql://", "http://", "https://"]
            .iter()
            .any(|scheme| url.starts_with(scheme));
        if !remote {
            return Ok(ConnectionMode::Local(url.to_string()));
        }
        let token = token
            .map(str::to_string)
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("LIBSQL_AUTH_TOKEN").ok())
            .ok_or_else(|| {
                EvalError::Config(format!(
                    "auth token required for remote store {} (store.auth_token or LIBSQL_AUTH_TOKEN)",
                    url
                ))
            })?;
        Ok(ConnectionMode::Remote {
            url: url.to_string(),
            token,
        })
    }

    fn is_local(&self) -> bool {
        matches!(self, ConnectionMode::Local(_))
    }
}

/// Shared libSQL database handle
pub struct StorePool {
    db: Database,
    mode: ConnectionMode,
}

impl StorePool {
    /// Open the database and apply pending migrations
    pub async fn open(mode: ConnectionMode) -> Result<Self> {
        let db = match &mode {
            ConnectionMode::Local(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            EvalError::Database(format!(
                                "Failed to create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                Builder::new_local(path).build().await.map_err(|e| {
                    EvalError::Database(format!("Failed to create local database: {}", e))
                })?
            }
            ConnectionMode::Remote { url, token } => Builder::new_remote(url.clone(), token.clone())
                .build()
                .await
                .map_err(|e| EvalError::Database(format!("Failed to create remote database: {}", e)))?,
        };

        info!("LibSQL database connection established");

        let pool = Self { db, mode };
        if pool.mode.is_local() {
            let conn = pool.db.connect()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;").await?;
        }
        pool.run_migrations().await?;
        Ok(pool)
    }

    /// Open the result database described by `config`
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let mode = ConnectionMode::from_url(&config.url, config.auth_token.as_deref())?;
        Self::open(mode).await
    }

    /// Open a local database file
    pub async fn open_local(path: impl Into<String>) -> Result<Self> {
        Self::open(ConnectionMode::Local(path.into())).await
    }

    pub fn mode(&self) -> &ConnectionMode {
        &self.mode
    }

    /// Check out a connection
    pub async fn connect(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| EvalError::Database(format!("Failed to get connection: {}", e)))?;
        if self.mode.is_local() {
            conn.execute_batch(&format!("PRAGMA busy_timeout = {};", BUSY_TIMEOUT_MS))
                .await?;
        }
        Ok(conn)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        debug!("Running database migrations");
        let conn = self.connect().await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
            params![],
        )
        .await
        .map_err(|e| EvalError::Database(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?1",
                    params![*name],
                )
                .await?;
            let applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0).unwrap_or(0),
                None => 0,
            };
            if applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            let statements = parse_sql_statements(sql);
            for (i, statement) in statements.iter().enumerate() {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                conn.execute(statement, params![]).await.map_err(|e| {
                    EvalError::Database(format!(
                        "Failed to execute statement #{} in {}: {}",
                        i + 1,
                        name,
                        e
                    ))
                })?;
            }

            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?1, ?2)",
                params![*name, Utc::now().timestamp()],
            )
            .await
            .map_err(|e| EvalError::Database(format!("Failed to record migration: {}", e)))?;

            info!("Executed migration: {}", name);
        }
        Ok(())
    }

    /// Names of applied migrations
    pub async fn applied_migrations(&self) -> Result<Vec<String>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT migration_name FROM _migrations_applied ORDER BY migration_name",
                params![],
            )
            .await?;
        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            names.push(row.get::<String>(0)?);
        }
        Ok(names)
    }

    /// Release the database handle
    pub fn close(self) {
        drop(self.db);
        debug!("LibSQL store pool closed");
    }
}
