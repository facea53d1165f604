//! Cron scheduling of application batch runs
//!
//! Expressions use the five-field crontab layout (`min hour dom mon dow`);
//! six and seven field expressions with explicit seconds are passed through.

use crate::error::{EvalError, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::debug;

/// Parse a cron expression, accepting the five-field form
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        _ => {
            return Err(EvalError::Cron {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {}", fields),
            })
        }
    };
    Schedule::from_str(&normalized).map_err(|e| EvalError::Cron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Tracks the last run of each application against its cron schedule
#[derive(Default)]
pub struct CronScheduler {
    last_runs: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// First tick of `expression` strictly after `after`
    pub fn next_run_time(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(parse_cron(expression)?.after(&after).next())
    }

    pub fn last_run(&self, app_id: &str) -> Option<DateTime<Utc>> {
        self.last_runs.lock().ok()?.get(app_id).copied()
    }

    /// Applications due at `now`, in input order.
    ///
    /// An application that never ran is due. Otherwise it is due once a
    /// tick has passed since its last run. Invalid expressions are errors.
    pub fn due_apps<'a>(
        &self,
        apps: impl IntoIterator<Item = (&'a str, &'a str)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let last_runs = match self.last_runs.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut due = Vec::new();
        for (app_id, expression) in apps {
            let schedule = parse_cron(expression)?;
            let is_due = match last_runs.get(app_id) {
                None => true,
                Some(last) => schedule.after(last).next().is_some_and(|tick| tick <= now),
            };
            if is_due {
                due.push(app_id.to_string());
            } else {
                debug!("app_id={} not due (cron '{}')", app_id, expression);
            }
        }
        Ok(due)
    }

    pub fn mark_run(&self, app_id: &str, when: DateTime<Utc>) {
        let mut guard = match self.last_runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(app_id.to_string(), when);
    }
}
