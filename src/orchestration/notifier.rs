//! Threshold breach alerting
//!
//! Breaches are filtered by the configured minimum level and delivered
//! through every enabled channel. Each channel sits behind a circuit breaker
//! so a dead webhook stops being called for a while. Delivery failures are
//! logged and never surface to the batch.

use crate::config::AlertingConfig;
use crate::error::{EvalError, Result};
use crate::evaluation::level_rank;
use crate::types::{EvaluationWindow, ThresholdBreach};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// A rendered alert
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}

/// Delivery channel for alerts
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &AlertMessage) -> Result<()>;
}

#[derive(Serialize)]
struct TeamsPayload<'a> {
    text: &'a str,
}

/// Microsoft Teams incoming webhook
pub struct TeamsWebhookChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl TeamsWebhookChannel {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        let webhook_url = webhook_url.into();
        if webhook_url.trim().is_empty() {
            return Err(EvalError::Config(
                "alerting.teams.webhook_url is required when Teams alerts are enabled".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            webhook_url,
            client,
        })
    }
}

#[async_trait]
impl AlertChannel for TeamsWebhookChannel {
    fn name(&self) -> &str {
        "teams"
    }

    async fn send(&self, message: &AlertMessage) -> Result<()> {
        let text = format!("{}\n\n{}", message.subject, message.body);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&TeamsPayload { text: &text })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let reason = format!("Teams webhook returned HTTP {}", status.as_u16());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                EvalError::Transient(reason)
            } else {
                EvalError::Other(reason)
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    failures: u32,
    open_until: Option<Instant>,
    half_open: bool,
}

/// Closed until `failure_threshold` consecutive failures, then open for
/// `recovery_timeout`, then half-open for one trial call
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                failures: 0,
                open_until: None,
                half_open: false,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        let inner = self.inner.lock().await;
        match inner.open_until {
            Some(until) if Instant::now() < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None if inner.half_open => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }

    /// Whether a call may go through now
    async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(until) = inner.open_until {
            if Instant::now() < until {
                return false;
            }
            inner.open_until = None;
            inner.half_open = true;
        }
        true
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures = 0;
        inner.half_open = false;
        inner.open_until = None;
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.failures += 1;
        if inner.half_open || inner.failures >= self.failure_threshold {
            inner.open_until = Some(Instant::now() + self.recovery_timeout);
            inner.half_open = false;
        }
    }

    /// Run `call` unless the breaker is open
    pub async fn call<F, Fut>(&self, call: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if !self.try_acquire().await {
            return Err(EvalError::Transient("circuit breaker open".to_string()));
        }
        match call().await {
            Ok(()) => {
                self.record_success().await;
                Ok(())
            }
            Err(e) => {
                self.record_failure().await;
                Err(e)
            }
        }
    }
}

struct GuardedChannel {
    channel: Arc<dyn AlertChannel>,
    breaker: CircuitBreaker,
}

/// Keep breaches at or above `min_level` (warning < critical)
pub fn filter_breaches_by_min_level(breaches: &[ThresholdBreach], min_level: &str) -> Vec<ThresholdBreach> {
    let floor = level_rank(min_level);
    breaches
        .iter()
        .filter(|b| level_rank(&b.level) >= floor)
        .cloned()
        .collect()
}

pub fn build_alert(app_id: &str, window: &EvaluationWindow, breaches: &[ThresholdBreach]) -> AlertMessage {
    let subject = format!(
        "[AI Eval] {} threshold alert ({} breach(es))",
        app_id,
        breaches.len()
    );
    let mut lines = vec![
        format!("Application: {}", app_id),
        format!("Window: {} .. {}", window.start_str(), window.end_str()),
        format!("Breaches: {}", breaches.len()),
        String::new(),
    ];
    for b in breaches {
        lines.push(format!(
            "- metric={} level={} actual={} threshold={} direction={}",
            b.metric_name, b.level, b.actual_value, b.threshold_value, b.direction
        ));
    }
    AlertMessage {
        subject,
        body: lines.join("\n"),
    }
}

pub struct AlertNotifier {
    min_level: String,
    channels: Vec<GuardedChannel>,
}

impl AlertNotifier {
    /// Notifier that never sends
    pub fn disabled() -> Self {
        Self {
            min_level: "warning".to_string(),
            channels: Vec::new(),
        }
    }

    /// Build the channels enabled in `config`
    pub fn from_config(config: &AlertingConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let mut notifier = Self {
            min_level: config.min_level.clone(),
            channels: Vec::new(),
        };
        if config.teams.enabled {
            if config.teams.webhook_url.trim().is_empty() {
                warn!("Teams alert channel is enabled but webhook_url is missing");
            } else {
                notifier = notifier.with_channel(Arc::new(TeamsWebhookChannel::new(
                    config.teams.webhook_url.clone(),
                )?));
            }
        }
        if notifier.channels.is_empty() {
            info!("Alerting is enabled but no channel is configured");
        }
        Ok(notifier)
    }

    pub fn with_min_level(mut self, min_level: impl Into<String>) -> Self {
        self.min_level = min_level.into();
        self
    }

    pub fn with_channel(self, channel: Arc<dyn AlertChannel>) -> Self {
        self.with_guarded_channel(channel, CircuitBreaker::default())
    }

    pub fn with_guarded_channel(mut self, channel: Arc<dyn AlertChannel>, breaker: CircuitBreaker) -> Self {
        self.channels.push(GuardedChannel { channel, breaker });
        self
    }

    pub fn is_enabled(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Send an alert for the qualifying breaches of one application.
    ///
    /// Returns the number of channels that accepted the alert.
    pub async fn notify(&self, app_id: &str, window: &EvaluationWindow, breaches: &[ThresholdBreach]) -> usize {
        if self.channels.is_empty() {
            return 0;
        }
        let selected = filter_breaches_by_min_level(breaches, &self.min_level);
        if selected.is_empty() {
            debug!("No breaches at or above {} for app_id={}", self.min_level, app_id);
            return 0;
        }

        let message = build_alert(app_id, window, &selected);
        let mut delivered = 0;
        for guarded in &self.channels {
            let channel = guarded.channel.clone();
            match guarded.breaker.call(|| async { channel.send(&message).await }).await {
                Ok(()) => {
                    delivered += 1;
                    info!(
                        "Sent {} alert for app_id={} ({} breaches)",
                        guarded.channel.name(),
                        app_id,
                        selected.len()
                    );
                }
                Err(e) => warn!(
                    "Failed to send {} alert for app_id={}: {}",
                    guarded.channel.name(),
                    app_id,
                    e
                ),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetricKind, ThresholdDirection};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingChannel {
        fail: bool,
        calls: AtomicUsize,
        last: std::sync::Mutex<Option<AlertMessage>>,
    }

    impl RecordingChannel {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
                last: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &AlertMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(message.clone());
            if self.fail {
                Err(EvalError::Transient("503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn breach(level: &str) -> ThresholdBreach {
        ThresholdBreach {
            metric_name: MetricKind::SafetyToxicity,
            level: level.to_string(),
            threshold_value: 0.9,
            actual_value: 0.5,
            direction: ThresholdDirection::Min,
        }
    }

    fn window() -> EvaluationWindow {
        EvaluationWindow::new(
            Utc.with_ymd_and_hms(2026, 2, 24, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_filter_by_min_level() {
        let breaches = vec![breach("warning"), breach("critical"), breach("info")];
        assert_eq!(filter_breaches_by_min_level(&breaches, "warning").len(), 3);
        let critical = filter_breaches_by_min_level(&breaches, "critical");
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].level, "critical");
    }

    #[test]
    fn test_build_alert_subject() {
        let alert = build_alert("A", &window(), &[breach("critical"), breach("warning")]);
        assert_eq!(alert.subject, "[AI Eval] A threshold alert (2 breach(es))");
        assert!(alert.body.contains("metric=safety_toxicity level=critical"));
        assert!(alert.body.starts_with("Application: A\nWindow: 2026-02-24T00:00:00.000000Z"));
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = AlertNotifier::from_config(&AlertingConfig::default()).unwrap();
        assert!(!notifier.is_enabled());
        assert_eq!(notifier.notify("A", &window(), &[breach("critical")]).await, 0);
    }

    #[tokio::test]
    async fn test_notify_respects_min_level() {
        let channel = RecordingChannel::new(false);
        let notifier = AlertNotifier::disabled()
            .with_min_level("critical")
            .with_channel(channel.clone());

        assert_eq!(notifier.notify("A", &window(), &[breach("warning")]).await, 0);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 0);

        let sent = notifier
            .notify("A", &window(), &[breach("warning"), breach("critical")])
            .await;
        assert_eq!(sent, 1);
        let last = channel.last.lock().unwrap().clone().unwrap();
        assert!(last.subject.contains("(1 breach(es))"));
    }

    #[tokio::test]
    async fn test_breaker_opens_after_failures() {
        let channel = RecordingChannel::new(true);
        let notifier = AlertNotifier::disabled().with_guarded_channel(
            channel.clone(),
            CircuitBreaker::new(2, Duration::from_secs(60)),
        );

        for _ in 0..4 {
            assert_eq!(notifier.notify("A", &window(), &[breach("critical")]).await, 0);
        }
        assert_eq!(channel.calls.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.channels[0].breaker.state().await, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_breaker_half_open_recovers() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        let _ = breaker
            .call(|| async { Err(EvalError::Transient("down".into())) })
            .await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }
}
