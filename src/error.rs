//! Error types for the evalguard evaluation system
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation.

use thiserror::Error;

/// Main error type for evalguard operations
#[derive(Error, Debug)]
pub enum EvalError {
    /// Configuration is missing, malformed or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name is referenced that no implementation is registered for
    #[error("Policy not registered: {0}")]
    UnknownPolicy(String),

    /// A policy is referenced by an application but has no configuration
    #[error("Policy config missing for: {0}")]
    MissingPolicyConfig(String),

    /// Caller supplied an out-of-range argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Store or network condition that is expected to clear on retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A bounded operation did not finish in time
    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Bounded ingestion queue is saturated
    #[error("Backpressure: telemetry queue is full ({len}/{capacity})")]
    Backpressure { len: usize, capacity: usize },

    /// Job tracking state machine rejected a transition
    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// One or more policy evaluations failed for an application
    #[error("{} policy evaluation(s) failed for app_id={app_id}: {}", .failures.len(), .failures.join("; "))]
    PolicyFailures {
        app_id: String,
        failures: Vec<String>,
    },

    /// Some results could not be written even after per-item fallback
    #[error("Failed to persist {} result(s): {}", .failed_ids.len(), .failed_ids.join(", "))]
    PartialSave { failed_ids: Vec<String> },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML rendering error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid cron expression
    #[error("Invalid cron expression '{expression}': {reason}")]
    Cron { expression: String, reason: String },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for evalguard operations
pub type Result<T> = std::result::Result<T, EvalError>;

const TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

impl EvalError {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Only timeouts, rate limiting, 5xx-class responses and a busy/locked
    /// database count; everything else fails immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EvalError::Transient(_) | EvalError::Timeout { .. } => true,
            EvalError::Database(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
            }
            EvalError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map(|s| TRANSIENT_STATUS_CODES.contains(&s.as_u16()))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Render the error followed by its source chain, one cause per line.
    ///
    /// Stored as the traceback text of a failed job item.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n  caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

impl From<libsql::Error> for EvalError {
    fn from(err: libsql::Error) -> Self {
        EvalError::Database(err.to_string())
    }
}

impl From<config::ConfigError> for EvalError {
    fn from(err: config::ConfigError) -> Self {
        EvalError::Config(err.to_string())
    }
}

/// Convert anyhow::Error to EvalError
impl From<anyhow::Error> for EvalError {
    fn from(err: anyhow::Error) -> Self {
        EvalError::Other(err.to_string())
    }
}
