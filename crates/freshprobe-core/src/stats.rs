//! Statistical accumulators backing the run metrics.
//!
//! - [`Trend`]: distribution of durations (avg/min/max exact, percentiles
//!   from an HDR histogram at three significant figures)
//! - [`Rate`]: fraction of boolean contributions that were `true`
//! - [`Counter`]: monotonically increasing count
//!
//! These types are not synchronized; [`crate::metrics::RunMetrics`] guards
//! them behind a single lock.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

const SIGNIFICANT_FIGURES: u8 = 3;

/// Distribution accumulator over durations, stored in microseconds.
#[derive(Debug, Clone)]
pub struct Trend {
    histogram: Histogram<u64>,
    count: u64,
    sum_us: u128,
    min_us: u64,
    max_us: u64,
}

impl Trend {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(SIGNIFICANT_FIGURES)
                .expect("three significant figures is a valid histogram precision"),
            count: 0,
            sum_us: 0,
            min_us: u64::MAX,
            max_us: 0,
        }
    }

    /// Add one sample.
    pub fn record(&mut self, value: Duration) {
        let us = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(us);
        self.count += 1;
        self.sum_us += u128::from(us);
        self.min_us = self.min_us.min(us);
        self.max_us = self.max_us.max(us);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Frozen copy for read-only queries.
    pub fn snapshot(&self) -> TrendSnapshot {
        TrendSnapshot {
            trend: self.clone(),
        }
    }
}

impl Default for Trend {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable view of a [`Trend`]. All values are reported in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct TrendSnapshot {
    trend: Trend,
}

impl TrendSnapshot {
    pub fn count(&self) -> u64 {
        self.trend.count
    }

    pub fn avg_ms(&self) -> f64 {
        if self.trend.count == 0 {
            return 0.0;
        }
        (self.trend.sum_us as f64 / self.trend.count as f64) / 1000.0
    }

    pub fn min_ms(&self) -> f64 {
        if self.trend.count == 0 {
            return 0.0;
        }
        us_to_ms(self.trend.min_us)
    }

    pub fn max_ms(&self) -> f64 {
        us_to_ms(self.trend.max_us)
    }

    pub fn med_ms(&self) -> f64 {
        self.percentile_ms(50.0)
    }

    /// Percentile in `[0, 100]`, clamped to the exact observed min and max.
    pub fn percentile_ms(&self, percentile: f64) -> f64 {
        if self.trend.count == 0 {
            return 0.0;
        }
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        if quantile == 0.0 {
            return us_to_ms(self.trend.min_us);
        }
        let us = self
            .trend
            .histogram
            .value_at_quantile(quantile)
            .clamp(self.trend.min_us, self.trend.max_us);
        us_to_ms(us)
    }

    pub fn summary(&self) -> TrendSummary {
        TrendSummary {
            count: self.count(),
            avg_ms: self.avg_ms(),
            min_ms: self.min_ms(),
            med_ms: self.med_ms(),
            p90_ms: self.percentile_ms(90.0),
            p95_ms: self.percentile_ms(95.0),
            p99_ms: self.percentile_ms(99.0),
            max_ms: self.max_ms(),
        }
    }
}

/// Serializable headline numbers of a trend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendSummary {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub med_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Fraction of contributions that were `true`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rate {
    trues: u64,
    total: u64,
}

impl Rate {
    pub fn record(&mut self, flag: bool) {
        self.total += 1;
        if flag {
            self.trues += 1;
        }
    }

    pub fn trues(&self) -> u64 {
        self.trues
    }

    pub fn falses(&self) -> u64 {
        self.total - self.trues
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Value in `[0, 1]`; zero before any contribution.
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.trues as f64 / self.total as f64
    }
}

/// Monotonic event count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counter(u64);

impl Counter {
    pub fn add(&mut self, n: u64) {
        self.0 = self.0.saturating_add(n);
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Events per second over `elapsed`.
    pub fn per_second(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.0 as f64 / secs
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}
