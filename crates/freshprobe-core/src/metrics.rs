//! Process-wide run metrics
//!
//! Every worker contributes to one [`RunMetrics`] for the whole run. All
//! accumulators live behind a single mutex so that [`RunMetrics::snapshot`]
//! never observes a half-folded iteration (a delay sample without its
//! timeout flag, or the reverse).

use crate::probe::ProbeOutcome;
use crate::stats::{Counter, Rate, Trend, TrendSnapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Well-known metric names, referenced by thresholds and reports.
pub mod names {
    pub const FRESHNESS_DELAY: &str = "freshness_delay";
    pub const FRESHNESS_TIMEOUT: &str = "freshness_timeout";
    pub const FRESHNESS_WRITE_FAILED: &str = "freshness_write_failed";
    pub const FRESHNESS_BASELINE_MISSING: &str = "freshness_baseline_missing";
    pub const ITERATIONS: &str = "iterations";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
}

#[derive(Debug, Default)]
struct MetricSet {
    freshness_delay: Trend,
    freshness_timeout: Rate,
    freshness_write_failed: Rate,
    freshness_baseline_missing: Rate,
    iterations: Counter,
    dropped_iterations: Counter,
    http_reqs: Counter,
    http_req_duration: Trend,
    http_req_failed: Rate,
}

/// Shared, append-only metric accumulators for one run.
#[derive(Debug)]
pub struct RunMetrics {
    started: Instant,
    inner: Mutex<MetricSet>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(MetricSet::default()),
        }
    }

    /// Fold one freshness iteration into the delay distribution and rates.
    ///
    /// Timed-out iterations contribute their sentinel delay as well, so the
    /// distribution count always equals the timeout rate's total.
    pub fn record_probe(&self, outcome: &ProbeOutcome) {
        let mut set = self.inner.lock();
        set.freshness_delay.record(outcome.delay());
        set.freshness_timeout.record(outcome.timed_out());
        set.freshness_write_failed.record(!outcome.write_ok);
        set.freshness_baseline_missing.record(outcome.baseline_missing);
    }

    /// Record one HTTP request issued by any scenario.
    pub fn record_http(&self, elapsed: Duration, failed: bool) {
        let mut set = self.inner.lock();
        set.http_reqs.add(1);
        set.http_req_duration.record(elapsed);
        set.http_req_failed.record(failed);
    }

    /// Record one completed iteration of any scenario.
    pub fn record_iteration(&self) {
        self.inner.lock().iterations.add(1);
    }

    /// Record arrivals the traffic engine could not start.
    pub fn record_dropped(&self, count: u64) {
        self.inner.lock().dropped_iterations.add(count);
    }

    /// Consistent, frozen view of every metric.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let set = self.inner.lock();
        let mut metrics = BTreeMap::new();

        metrics.insert(
            names::FRESHNESS_DELAY.to_string(),
            MetricValue::Trend(set.freshness_delay.snapshot()),
        );
        metrics.insert(
            names::FRESHNESS_TIMEOUT.to_string(),
            MetricValue::Rate(set.freshness_timeout),
        );
        metrics.insert(
            names::FRESHNESS_WRITE_FAILED.to_string(),
            MetricValue::Rate(set.freshness_write_failed),
        );
        metrics.insert(
            names::FRESHNESS_BASELINE_MISSING.to_string(),
            MetricValue::Rate(set.freshness_baseline_missing),
        );
        metrics.insert(names::ITERATIONS.to_string(), MetricValue::Counter(set.iterations));
        metrics.insert(
            names::DROPPED_ITERATIONS.to_string(),
            MetricValue::Counter(set.dropped_iterations),
        );
        metrics.insert(names::HTTP_REQS.to_string(), MetricValue::Counter(set.http_reqs));
        metrics.insert(
            names::HTTP_REQ_DURATION.to_string(),
            MetricValue::Trend(set.http_req_duration.snapshot()),
        );
        metrics.insert(
            names::HTTP_REQ_FAILED.to_string(),
            MetricValue::Rate(set.http_req_failed),
        );

        MetricsSnapshot {
            elapsed: self.started.elapsed(),
            metrics,
        }
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen value of one metric.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Trend(TrendSnapshot),
    Rate(Rate),
    Counter(Counter),
}

impl MetricValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Trend(_) => "trend",
            Self::Rate(_) => "rate",
            Self::Counter(_) => "counter",
        }
    }
}

/// Immutable view of all run metrics at one instant.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    metrics: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.metrics.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn trend(&self, name: &str) -> Option<&TrendSnapshot> {
        match self.metrics.get(name) {
            Some(MetricValue::Trend(trend)) => Some(trend),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<Rate> {
        match self.metrics.get(name) {
            Some(MetricValue::Rate(rate)) => Some(*rate),
            _ => None,
        }
    }

    pub fn counter(&self, name: &str) -> Option<Counter> {
        match self.metrics.get(name) {
            Some(MetricValue::Counter(counter)) => Some(*counter),
            _ => None,
        }
    }
}
