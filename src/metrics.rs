//! Shared metric aggregation and Prometheus exposition.
//!
//! Hot-path recording is lock-free after first touch of a series: counters
//! and histogram buckets are relaxed atomics, and the per-operation map is
//! behind an `RwLock` taken for writing only when a new operation name shows
//! up. No global registry: construct one `MetricsRecorder` per process (or
//! per test) and share it via `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::model::{MetricSample, Outcome};

/// Histogram bucket upper bounds in seconds.
const LATENCY_BOUNDS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fixed-bucket latency histogram. Buckets store per-bucket counts;
/// cumulation happens at render time so the hot path is one `fetch_add`.
#[derive(Debug, Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS.len()],
    overflow: AtomicU64,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, latency: Duration) {
        let secs = latency.as_secs_f64();
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        match LATENCY_BOUNDS.iter().position(|bound| secs <= *bound) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Counters and latency distribution for one operation name.
#[derive(Debug, Default)]
struct OperationSeries {
    success: AtomicU64,
    failure: AtomicU64,
    rejected: AtomicU64,
    latency: LatencyHistogram,
}

/// Point-in-time view of one operation's counters, for tests and status
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCounts {
    pub success: u64,
    pub failure: u64,
    pub rejected: u64,
}

/// Thread-shared recorder for invocation counters, latency histograms, and
/// the active-holds gauge.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    series: RwLock<HashMap<String, Arc<OperationSeries>>>,
    active_holds: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn series(&self, operation: &str) -> Arc<OperationSeries> {
        {
            let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(series) = map.get(operation) {
                return Arc::clone(series);
            }
        }
        let mut map = self.series.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(operation.to_string())
                .or_insert_with(|| Arc::new(OperationSeries::default())),
        )
    }

    fn holds_gauge(&self, class: &str) -> Arc<AtomicI64> {
        {
            let map = self
                .active_holds
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(gauge) = map.get(class) {
                return Arc::clone(gauge);
            }
        }
        let mut map = self
            .active_holds
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            map.entry(class.to_string())
                .or_insert_with(|| Arc::new(AtomicI64::new(0))),
        )
    }

    /// Record the outcome and latency of one completed invocation.
    pub fn record(&self, sample: &MetricSample) {
        let series = self.series(&sample.operation);
        match sample.outcome {
            Outcome::Success => series.success.fetch_add(1, Ordering::Relaxed),
            Outcome::Failure => series.failure.fetch_add(1, Ordering::Relaxed),
        };
        series.latency.observe(sample.latency);
    }

    /// Record an invocation rejected before the operation ran.
    pub fn record_rejected(&self, operation: &str) {
        self.series(operation).rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hold_placed(&self, class: &str) {
        self.holds_gauge(class).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hold_settled(&self, class: &str) {
        self.holds_gauge(class).fetch_sub(1, Ordering::Relaxed);
    }

    /// Currently active holds for an account class.
    pub fn active_holds(&self, class: &str) -> i64 {
        self.holds_gauge(class).load(Ordering::Relaxed)
    }

    /// Counter snapshot for one operation, if it has been seen.
    pub fn operation_counts(&self, operation: &str) -> Option<OperationCounts> {
        let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
        map.get(operation).map(|s| OperationCounts {
            success: s.success.load(Ordering::Relaxed),
            failure: s.failure.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
        })
    }

    /// Render the scrape payload in Prometheus exposition text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let series: Vec<(String, Arc<OperationSeries>)> = {
            let map = self.series.read().unwrap_or_else(PoisonError::into_inner);
            let mut entries: Vec<_> = map
                .iter()
                .map(|(name, s)| (name.clone(), Arc::clone(s)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            entries
        };

        out.push_str(
            "# HELP credit_engine_invocations_total Guarded operation invocations by outcome.\n",
        );
        out.push_str("# TYPE credit_engine_invocations_total counter\n");
        for (name, s) in &series {
            let name = escape_label_value(name);
            out.push_str(&format!(
                "credit_engine_invocations_total{{operation=\"{name}\",outcome=\"success\"}} {}\n",
                s.success.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "credit_engine_invocations_total{{operation=\"{name}\",outcome=\"failure\"}} {}\n",
                s.failure.load(Ordering::Relaxed)
            ));
        }

        out.push_str(
            "# HELP credit_engine_rejections_total Invocations rejected before the operation ran.\n",
        );
        out.push_str("# TYPE credit_engine_rejections_total counter\n");
        for (name, s) in &series {
            out.push_str(&format!(
                "credit_engine_rejections_total{{operation=\"{}\"}} {}\n",
                escape_label_value(name),
                s.rejected.load(Ordering::Relaxed)
            ));
        }

        out.push_str(
            "# HELP credit_engine_operation_latency_seconds Guarded operation latency.\n",
        );
        out.push_str("# TYPE credit_engine_operation_latency_seconds histogram\n");
        for (name, s) in &series {
            let name = escape_label_value(name);
            let mut cumulative = 0u64;
            for (idx, bound) in LATENCY_BOUNDS.iter().enumerate() {
                cumulative += s.latency.buckets[idx].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "credit_engine_operation_latency_seconds_bucket{{operation=\"{name}\",le=\"{bound}\"}} {cumulative}\n",
                ));
            }
            let count = s.latency.count.load(Ordering::Relaxed);
            out.push_str(&format!(
                "credit_engine_operation_latency_seconds_bucket{{operation=\"{name}\",le=\"+Inf\"}} {count}\n",
            ));
            out.push_str(&format!(
                "credit_engine_operation_latency_seconds_sum{{operation=\"{name}\"}} {}\n",
                s.latency.sum_micros.load(Ordering::Relaxed) as f64 / 1e6
            ));
            out.push_str(&format!(
                "credit_engine_operation_latency_seconds_count{{operation=\"{name}\"}} {count}\n",
            ));
        }

        out.push_str("# HELP credit_engine_active_holds Currently active credit holds.\n");
        out.push_str("# TYPE credit_engine_active_holds gauge\n");
        let gauges: Vec<(String, i64)> = {
            let map = self
                .active_holds
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut entries: Vec<_> = map
                .iter()
                .map(|(class, g)| (class.clone(), g.load(Ordering::Relaxed)))
                .collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            entries
        };
        for (class, value) in gauges {
            out.push_str(&format!(
                "credit_engine_active_holds{{class=\"{}\"}} {value}\n",
                escape_label_value(&class)
            ));
        }

        out
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;

    fn sample(operation: &str, outcome: Outcome, latency_ms: u64) -> MetricSample {
        MetricSample {
            operation: operation.to_string(),
            outcome,
            latency: Duration::from_millis(latency_ms),
            at: 0,
        }
    }

    #[test]
    fn record_counts_by_outcome() {
        let metrics = MetricsRecorder::new();
        metrics.record(&sample("export", Outcome::Success, 10));
        metrics.record(&sample("export", Outcome::Success, 20));
        metrics.record(&sample("export", Outcome::Failure, 30));

        let counts = metrics.operation_counts("export").unwrap();
        assert_eq!(counts.success, 2);
        assert_eq!(counts.failure, 1);
        assert_eq!(counts.rejected, 0);
    }

    #[test]
    fn rejections_are_counted_separately() {
        let metrics = MetricsRecorder::new();
        metrics.record_rejected("export");
        metrics.record_rejected("export");

        let counts = metrics.operation_counts("export").unwrap();
        assert_eq!(counts.rejected, 2);
        assert_eq!(counts.success, 0);
    }

    #[test]
    fn unknown_operation_has_no_counts() {
        let metrics = MetricsRecorder::new();
        assert!(metrics.operation_counts("never-seen").is_none());
    }

    #[test]
    fn gauge_tracks_place_and_settle() {
        let metrics = MetricsRecorder::new();
        metrics.hold_placed("standard");
        metrics.hold_placed("standard");
        metrics.hold_placed("premium");
        metrics.hold_settled("standard");

        assert_eq!(metrics.active_holds("standard"), 1);
        assert_eq!(metrics.active_holds("premium"), 1);
        assert_eq!(metrics.active_holds("trial"), 0);
    }

    #[test]
    fn render_emits_counter_lines() {
        let metrics = MetricsRecorder::new();
        metrics.record(&sample("export", Outcome::Success, 10));
        metrics.record(&sample("export", Outcome::Failure, 10));
        metrics.record_rejected("import");

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE credit_engine_invocations_total counter"));
        assert!(text.contains(
            "credit_engine_invocations_total{operation=\"export\",outcome=\"success\"} 1"
        ));
        assert!(text.contains(
            "credit_engine_invocations_total{operation=\"export\",outcome=\"failure\"} 1"
        ));
        assert!(text.contains("credit_engine_rejections_total{operation=\"import\"} 1"));
    }

    #[test]
    fn render_histogram_buckets_are_cumulative() {
        let metrics = MetricsRecorder::new();
        // 3 ms, 40 ms, 2 s: land in the 0.005, 0.05, and 2.5 buckets
        metrics.record(&sample("export", Outcome::Success, 3));
        metrics.record(&sample("export", Outcome::Success, 40));
        metrics.record(&sample("export", Outcome::Success, 2_000));

        let text = metrics.render_prometheus();
        assert!(text.contains(
            "credit_engine_operation_latency_seconds_bucket{operation=\"export\",le=\"0.005\"} 1"
        ));
        assert!(text.contains(
            "credit_engine_operation_latency_seconds_bucket{operation=\"export\",le=\"0.05\"} 2"
        ));
        assert!(text.contains(
            "credit_engine_operation_latency_seconds_bucket{operation=\"export\",le=\"2.5\"} 3"
        ));
        assert!(text.contains(
            "credit_engine_operation_latency_seconds_bucket{operation=\"export\",le=\"+Inf\"} 3"
        ));
        assert!(text.contains(
            "credit_engine_operation_latency_seconds_count{operation=\"export\"} 3"
        ));
    }

    #[test]
    fn render_includes_gauge_by_class() {
        let metrics = MetricsRecorder::new();
        metrics.hold_placed("standard");

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE credit_engine_active_holds gauge"));
        assert!(text.contains("credit_engine_active_holds{class=\"standard\"} 1"));
    }

    #[test]
    fn escapes_label_values() {
        assert_eq!(escape_label_value("a"), "a");
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\\b"), "a\\\\b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }

    #[test]
    fn fresh_recorders_do_not_collide() {
        let a = MetricsRecorder::new();
        let b = MetricsRecorder::new();
        a.record(&sample("export", Outcome::Success, 1));
        assert!(b.operation_counts("export").is_none());
    }
}
