//! Threshold-driven anomaly detection over the live metric stream.
//!
//! Each operation name gets a time-bounded sliding window of samples,
//! pruned and evaluated on every ingestion. A breach emits at most one
//! event per (operation, reason) per window, so a sustained failure burst
//! produces a single alert instead of a storm. Detection never blocks or
//! fails the request that triggered it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::model::{AnomalyEvent, AnomalyReason, MetricSample, Outcome, TimestampMs};

/// Breach thresholds for one operation class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    /// Maximum tolerated `failures / total` over the window.
    pub max_error_rate: f64,
    /// Maximum tolerated p95 latency over the window, in milliseconds.
    pub max_p95_latency_ms: u64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_p95_latency_ms: 500,
        }
    }
}

/// Detector configuration: window geometry plus global and per-operation
/// thresholds. Operations without an override use the defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Trailing window over which rates and percentiles are computed.
    pub window_ms: u64,
    /// Below this many samples in the window no rule fires, so low-traffic
    /// operations do not alert on a single bad request.
    pub min_samples: usize,
    pub defaults: AnomalyThresholds,
    pub operations: HashMap<String, AnomalyThresholds>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_ms: 5 * 60 * 1_000,
            min_samples: 20,
            defaults: AnomalyThresholds::default(),
            operations: HashMap::new(),
        }
    }
}

impl AnomalyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn thresholds(&self, operation: &str) -> &AnomalyThresholds {
        self.operations.get(operation).unwrap_or(&self.defaults)
    }
}

/// Receives detected anomalies. Delivery (paging, chat, email) is the
/// collaborator's concern; implementations must not block.
pub trait AnomalySink: Send + Sync {
    fn publish(&self, event: &AnomalyEvent);
}

/// Sink that logs each event.
#[derive(Debug, Default)]
pub struct LogSink;

impl AnomalySink for LogSink {
    fn publish(&self, event: &AnomalyEvent) {
        warn!(
            operation = %event.operation,
            reason = event.reason.as_str(),
            observed = event.observed,
            threshold = event.threshold,
            "anomaly detected"
        );
    }
}

/// Sink that forwards events into an unbounded channel. A dropped receiver
/// is ignored: losing an alert consumer must not affect request handling.
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<AnomalyEvent>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<AnomalyEvent>) -> Self {
        Self { sender }
    }
}

impl AnomalySink for ChannelSink {
    fn publish(&self, event: &AnomalyEvent) {
        let _ = self.sender.send(event.clone());
    }
}

#[derive(Debug)]
struct WindowSample {
    at: TimestampMs,
    failed: bool,
    latency: Duration,
}

#[derive(Debug, Default)]
struct OperationWindow {
    samples: VecDeque<WindowSample>,
    failures: usize,
    fired_error_rate_at: Option<TimestampMs>,
    fired_latency_at: Option<TimestampMs>,
}

impl OperationWindow {
    fn push(&mut self, sample: &MetricSample) {
        if sample.outcome == Outcome::Failure {
            self.failures += 1;
        }
        self.samples.push_back(WindowSample {
            at: sample.at,
            failed: sample.outcome == Outcome::Failure,
            latency: sample.latency,
        });
    }

    fn prune(&mut self, horizon: TimestampMs) {
        while let Some(front) = self.samples.front() {
            if front.at >= horizon {
                break;
            }
            if front.failed {
                self.failures -= 1;
            }
            self.samples.pop_front();
        }
    }

    /// Nearest-rank p95 of the window's latencies.
    fn p95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let rank = (latencies.len() * 95).div_ceil(100);
        latencies[rank.saturating_sub(1)]
    }
}

/// Statistical guard over the metric stream.
///
/// Constructed explicitly and shared via `Arc`; no process-global state, so
/// tests build a fresh detector per case.
pub struct AnomalyDetector {
    config: AnomalyConfig,
    windows: Mutex<HashMap<String, OperationWindow>>,
    sink: Arc<dyn AnomalySink>,
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, sink: Arc<dyn AnomalySink>) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Fold one sample into its operation's window and evaluate the rules.
    ///
    /// The sample's own timestamp is "now": the detector never reads the
    /// clock. Events are published outside the window lock.
    pub fn ingest(&self, sample: &MetricSample) {
        let events = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            let window = windows.entry(sample.operation.clone()).or_default();
            window.push(sample);
            let now = sample.at;
            window.prune(now.saturating_sub(self.config.window_ms));
            self.evaluate(&sample.operation, window, now)
        };
        for event in &events {
            self.sink.publish(event);
        }
    }

    /// Samples currently held in one operation's window.
    pub fn window_len(&self, operation: &str) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.get(operation).map_or(0, |w| w.samples.len())
    }

    fn evaluate(
        &self,
        operation: &str,
        window: &mut OperationWindow,
        now: TimestampMs,
    ) -> Vec<AnomalyEvent> {
        let total = window.samples.len();
        if total < self.config.min_samples {
            return Vec::new();
        }

        let thresholds = self.config.thresholds(operation);
        let mut events = Vec::new();

        let error_rate = window.failures as f64 / total as f64;
        if error_rate > thresholds.max_error_rate
            && self.may_fire(window.fired_error_rate_at, now)
        {
            window.fired_error_rate_at = Some(now);
            events.push(AnomalyEvent {
                operation: operation.to_string(),
                reason: AnomalyReason::ErrorRateExceeded,
                observed: error_rate,
                threshold: thresholds.max_error_rate,
                at: now,
                window: self.config.window(),
            });
        }

        let p95 = window.p95();
        let latency_threshold = Duration::from_millis(thresholds.max_p95_latency_ms);
        if p95 > latency_threshold && self.may_fire(window.fired_latency_at, now) {
            window.fired_latency_at = Some(now);
            events.push(AnomalyEvent {
                operation: operation.to_string(),
                reason: AnomalyReason::LatencyExceeded,
                observed: p95.as_secs_f64(),
                threshold: latency_threshold.as_secs_f64(),
                at: now,
                window: self.config.window(),
            });
        }

        events
    }

    /// A reason re-fires only after a full window has elapsed since it last
    /// fired.
    fn may_fire(&self, last: Option<TimestampMs>, now: TimestampMs) -> bool {
        last.is_none_or(|fired_at| now.saturating_sub(fired_at) >= self.config.window_ms)
    }
}
