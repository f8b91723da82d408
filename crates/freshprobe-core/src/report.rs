//! Run summary and its renderings

use crate::error::{ProbeError, ProbeResult};
use crate::load::RunStats;
use crate::metrics::{names, MetricsSnapshot};
use crate::stats::{TrendSnapshot, TrendSummary};
use crate::thresholds::ThresholdReport;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Markdown,
    Json,
    Prometheus,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Prometheus => "prometheus",
        })
    }
}

impl FromStr for ReportFormat {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "markdown" | "md" => Ok(Self::Markdown),
            "json" => Ok(Self::Json),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            other => Err(ProbeError::invalid_config(format!(
                "unknown report format '{}'",
                other
            ))),
        }
    }
}

/// Freshness section, present when the run recorded probe iterations.
#[derive(Debug, Clone, Serialize)]
pub struct FreshnessSummary {
    pub delay_ms: TrendSummary,
    pub timeout_rate: f64,
    pub timeouts: u64,
    pub write_failures: u64,
    pub baseline_missing: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpSummary {
    pub requests: u64,
    pub requests_per_sec: f64,
    pub failed_rate: f64,
    pub duration_ms: TrendSummary,
}

/// Everything an operator sees at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub scenario: String,
    pub shape: String,
    pub duration_secs: f64,
    pub iterations: u64,
    pub iterations_per_sec: f64,
    pub dropped_iterations: u64,
    pub freshness: Option<FreshnessSummary>,
    pub http: HttpSummary,
    pub thresholds: ThresholdReport,
    pub passed: bool,
}

impl SummaryReport {
    pub fn new(
        scenario: &str,
        shape: &str,
        stats: &RunStats,
        snapshot: &MetricsSnapshot,
        thresholds: ThresholdReport,
    ) -> Self {
        let trend = |name| {
            snapshot
                .trend(name)
                .map(TrendSnapshot::summary)
                .unwrap_or_else(|| TrendSnapshot::default().summary())
        };

        let delay = trend(names::FRESHNESS_DELAY);
        let freshness = (delay.count > 0).then(|| {
            let timeout = snapshot.rate(names::FRESHNESS_TIMEOUT).unwrap_or_default();
            FreshnessSummary {
                delay_ms: delay,
                timeout_rate: timeout.value(),
                timeouts: timeout.trues(),
                write_failures: snapshot
                    .rate(names::FRESHNESS_WRITE_FAILED)
                    .map(|r| r.trues())
                    .unwrap_or(0),
                baseline_missing: snapshot
                    .rate(names::FRESHNESS_BASELINE_MISSING)
                    .map(|r| r.trues())
                    .unwrap_or(0),
            }
        });

        let requests = snapshot.counter(names::HTTP_REQS).unwrap_or_default();
        let http = HttpSummary {
            requests: requests.value(),
            requests_per_sec: requests.per_second(stats.elapsed),
            failed_rate: snapshot
                .rate(names::HTTP_REQ_FAILED)
                .map(|r| r.value())
                .unwrap_or(0.0),
            duration_ms: trend(names::HTTP_REQ_DURATION),
        };

        let secs = stats.elapsed.as_secs_f64();
        let passed = thresholds.passed;
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            scenario: scenario.to_string(),
            shape: shape.to_string(),
            duration_secs: secs,
            iterations: stats.iterations,
            iterations_per_sec: if secs > 0.0 {
                stats.iterations as f64 / secs
            } else {
                0.0
            },
            dropped_iterations: stats.dropped,
            freshness,
            http,
            thresholds,
            passed,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.passed {
            "PASSED"
        } else {
            "FAILED"
        }
    }

    pub fn render(&self, format: ReportFormat) -> ProbeResult<String> {
        match format {
            ReportFormat::Text => Ok(self.generate_text()),
            ReportFormat::Markdown => Ok(self.generate_markdown()),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Prometheus => self.generate_prometheus(),
        }
    }

    /// Write report to file
    pub fn write_report(&self, path: impl AsRef<Path>, format: ReportFormat) -> ProbeResult<()> {
        let content = self.render(format)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;
        Ok(())
    }

    fn generate_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "run {} ({}, {})\n\n",
            self.run_id, self.scenario, self.shape
        ));

        let line = |out: &mut String, name: &str, value: String| {
            out.push_str(&format!("  {:.<28}: {}\n", format!("{} ", name), value));
        };

        line(
            &mut out,
            names::ITERATIONS,
            format!("{} ({:.1}/s)", self.iterations, self.iterations_per_sec),
        );
        line(
            &mut out,
            names::DROPPED_ITERATIONS,
            self.dropped_iterations.to_string(),
        );
        if let Some(freshness) = &self.freshness {
            line(&mut out, names::FRESHNESS_DELAY, trend_line(&freshness.delay_ms));
            line(
                &mut out,
                names::FRESHNESS_TIMEOUT,
                format!(
                    "{:.2}% ({} of {})",
                    freshness.timeout_rate * 100.0,
                    freshness.timeouts,
                    freshness.delay_ms.count
                ),
            );
            line(
                &mut out,
                names::FRESHNESS_WRITE_FAILED,
                freshness.write_failures.to_string(),
            );
            line(
                &mut out,
                names::FRESHNESS_BASELINE_MISSING,
                freshness.baseline_missing.to_string(),
            );
        }
        line(
            &mut out,
            names::HTTP_REQS,
            format!("{} ({:.1}/s)", self.http.requests, self.http.requests_per_sec),
        );
        line(&mut out, names::HTTP_REQ_DURATION, trend_line(&self.http.duration_ms));
        line(
            &mut out,
            names::HTTP_REQ_FAILED,
            format!("{:.2}%", self.http.failed_rate * 100.0),
        );

        if !self.thresholds.results.is_empty() {
            out.push_str("\nthresholds:\n");
            for result in &self.thresholds.results {
                out.push_str(&format!(
                    "  [{}] {} {} ({})\n",
                    if result.passed { "PASS" } else { "FAIL" },
                    result.metric,
                    result.expression,
                    result.message
                ));
            }
        }

        out.push_str(&format!("\nstatus: {}\n", self.status()));
        out
    }

    fn generate_markdown(&self) -> String {
        let mut thresholds = String::new();
        if self.thresholds.results.is_empty() {
            thresholds.push_str("No thresholds declared\n");
        } else {
            thresholds.push_str("| Metric | Threshold | Observed | Status |\n");
            thresholds.push_str("|--------|-----------|----------|--------|\n");
            for result in &self.thresholds.results {
                thresholds.push_str(&format!(
                    "| {} | `{}` | {} | {} |\n",
                    result.metric,
                    result.expression,
                    result
                        .observed
                        .map(|v| format!("{:.3}", v))
                        .unwrap_or_else(|| "-".to_string()),
                    if result.passed { "✅" } else { "❌" }
                ));
            }
        }

        let freshness = match &self.freshness {
            Some(f) => format!(
                r#"| Statistic | Value |
|-----------|-------|
| Samples | {} |
| Avg | {:.2}ms |
| P50 | {:.2}ms |
| P90 | {:.2}ms |
| P95 | {:.2}ms |
| P99 | {:.2}ms |
| Max | {:.2}ms |
| Timeout rate | {:.2}% |
| Failed writes | {} |
| Missing baselines | {} |
"#,
                f.delay_ms.count,
                f.delay_ms.avg_ms,
                f.delay_ms.med_ms,
                f.delay_ms.p90_ms,
                f.delay_ms.p95_ms,
                f.delay_ms.p99_ms,
                f.delay_ms.max_ms,
                f.timeout_rate * 100.0,
                f.write_failures,
                f.baseline_missing
            ),
            None => "No freshness samples recorded\n".to_string(),
        };

        format!(
            r#"# Load Test Report: {}

**Status**: {} {}

---

## Summary

- **Run**: {}
- **Shape**: {}
- **Duration**: {:.1} seconds
- **Iterations**: {} ({:.1}/s)
- **Dropped Iterations**: {}

---

## Freshness

{}
---

## HTTP

- **Requests**: {} ({:.1}/s)
- **Failed**: {:.4}%

| Percentile | Latency |
|------------|---------|
| P50 | {:.2}ms |
| P95 | {:.2}ms |
| P99 | {:.2}ms |
| Max | {:.2}ms |

---

## Thresholds

{}
---

**Report Generated**: {}
"#,
            self.scenario,
            if self.passed { "✅" } else { "❌" },
            self.status(),
            self.run_id,
            self.shape,
            self.duration_secs,
            self.iterations,
            self.iterations_per_sec,
            self.dropped_iterations,
            freshness,
            self.http.requests,
            self.http.requests_per_sec,
            self.http.failed_rate * 100.0,
            self.http.duration_ms.med_ms,
            self.http.duration_ms.p95_ms,
            self.http.duration_ms.p99_ms,
            self.http.duration_ms.max_ms,
            thresholds,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    fn generate_prometheus(&self) -> ProbeResult<String> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str, value: f64| -> ProbeResult<()> {
            let g = Gauge::with_opts(Opts::new(name, help))?;
            g.set(value);
            registry.register(Box::new(g))?;
            Ok(())
        };

        gauge(
            "freshprobe_iterations",
            "Completed iterations",
            self.iterations as f64,
        )?;
        gauge(
            "freshprobe_dropped_iterations",
            "Arrivals dropped for lack of a free VU",
            self.dropped_iterations as f64,
        )?;
        gauge(
            "freshprobe_duration_seconds",
            "Run duration",
            self.duration_secs,
        )?;
        gauge(
            "freshprobe_http_reqs",
            "HTTP requests issued",
            self.http.requests as f64,
        )?;
        gauge(
            "freshprobe_http_req_failed_rate",
            "Fraction of failed HTTP requests",
            self.http.failed_rate,
        )?;
        gauge(
            "freshprobe_run_passed",
            "1 when every threshold passed",
            if self.passed { 1.0 } else { 0.0 },
        )?;

        let quantiles = |name: &str, help: &str, summary: &TrendSummary| -> ProbeResult<()> {
            let vec = GaugeVec::new(Opts::new(name, help), &["quantile"])?;
            for (quantile, value) in [
                ("0.5", summary.med_ms),
                ("0.9", summary.p90_ms),
                ("0.95", summary.p95_ms),
                ("0.99", summary.p99_ms),
                ("1", summary.max_ms),
            ] {
                vec.with_label_values(&[quantile]).set(value);
            }
            registry.register(Box::new(vec))?;
            Ok(())
        };

        quantiles(
            "freshprobe_http_req_duration_ms",
            "HTTP request duration quantiles",
            &self.http.duration_ms,
        )?;

        if let Some(freshness) = &self.freshness {
            quantiles(
                "freshprobe_freshness_delay_ms",
                "Write-to-read freshness delay quantiles",
                &freshness.delay_ms,
            )?;
            gauge(
                "freshprobe_freshness_delay_avg_ms",
                "Average freshness delay",
                freshness.delay_ms.avg_ms,
            )?;
            gauge(
                "freshprobe_freshness_timeout_rate",
                "Fraction of iterations that did not converge before the deadline",
                freshness.timeout_rate,
            )?;
        }

        if !self.thresholds.results.is_empty() {
            let vec = GaugeVec::new(
                Opts::new("freshprobe_threshold_passed", "1 when the threshold passed"),
                &["metric", "expression"],
            )?;
            for result in &self.thresholds.results {
                vec.with_label_values(&[result.metric.as_str(), result.expression.as_str()])
                    .set(if result.passed { 1.0 } else { 0.0 });
            }
            registry.register(Box::new(vec))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ProbeError::Internal(e.to_string()))
    }
}

fn trend_line(summary: &TrendSummary) -> String {
    format!(
        "avg={:.2}ms min={:.2}ms med={:.2}ms max={:.2}ms p(90)={:.2}ms p(95)={:.2}ms p(99)={:.2}ms",
        summary.avg_ms,
        summary.min_ms,
        summary.med_ms,
        summary.max_ms,
        summary.p90_ms,
        summary.p95_ms,
        summary.p99_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RunMetrics;
    use crate::poller::{PollOutcome, PollState};
    use crate::probe::ProbeOutcome;
    use crate::thresholds::ThresholdSet;
    use std::time::Duration;

    fn run(delays_ms: &[u64], expression: &str) -> SummaryReport {
        let metrics = RunMetrics::new();
        for &delay_ms in delays_ms {
            let timed_out = delay_ms >= 5000;
            metrics.record_probe(&ProbeOutcome {
                product_id: 1,
                write_ok: true,
                baseline_missing: false,
                poll: PollOutcome {
                    state: if timed_out {
                        PollState::TimedOut
                    } else {
                        PollState::Converged
                    },
                    delay: Duration::from_millis(delay_ms),
                    passes: 1,
                },
            });
            metrics.record_iteration();
            metrics.record_http(Duration::from_millis(4), false);
        }

        let snapshot = metrics.snapshot();
        let mut set = ThresholdSet::new();
        set.add(names::FRESHNESS_TIMEOUT, expression).unwrap();

        let stats = RunStats {
            iterations: delays_ms.len() as u64,
            dropped: 0,
            elapsed: Duration::from_secs(10),
        };
        SummaryReport::new("freshness", "2 VUs for 10s", &stats, &snapshot, set.evaluate(&snapshot))
    }

    #[test]
    fn test_summary_contents() {
        let report = run(&[100, 200, 5000], "rate==0");

        assert_eq!(report.iterations, 3);
        assert!(!report.passed);
        assert_eq!(report.status(), "FAILED");

        let freshness = report.freshness.as_ref().unwrap();
        assert_eq!(freshness.delay_ms.count, 3);
        assert_eq!(freshness.timeouts, 1);
        assert!((freshness.timeout_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(freshness.delay_ms.max_ms, 5000.0);
        assert_eq!(report.http.requests, 3);
        assert!((report.iterations_per_sec - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_text_and_markdown_render() {
        let report = run(&[100, 200], "rate==0");

        let text = report.render(ReportFormat::Text).unwrap();
        assert!(text.contains("freshness_delay"));
        assert!(text.contains("[PASS] freshness_timeout rate==0"));
        assert!(text.ends_with("status: PASSED\n"));

        let markdown = report.render(ReportFormat::Markdown).unwrap();
        assert!(markdown.starts_with("# Load Test Report: freshness"));
        assert!(markdown.contains("| freshness_timeout | `rate==0` | 0.000 | ✅ |"));
    }

    #[test]
    fn test_json_render() {
        let report = run(&[100], "rate<0.5");
        let json: serde_json::Value =
            serde_json::from_str(&report.render(ReportFormat::Json).unwrap()).unwrap();

        assert_eq!(json["scenario"], "freshness");
        assert_eq!(json["passed"], true);
        assert_eq!(json["iterations"], 1);
        assert_eq!(json["freshness"]["timeouts"], 0);
        assert_eq!(json["thresholds"]["results"][0]["metric"], "freshness_timeout");
        assert_eq!(json["run_id"].as_str().unwrap(), report.run_id.to_string());
    }

    #[test]
    fn test_prometheus_render() {
        let report = run(&[100, 5000], "rate==0");
        let text = report.render(ReportFormat::Prometheus).unwrap();

        assert!(text.contains("freshprobe_iterations 2"));
        assert!(text.contains("freshprobe_freshness_timeout_rate 0.5"));
        assert!(text.contains("freshprobe_freshness_delay_ms{quantile=\"1\"} 5000"));
        assert!(text.contains("freshprobe_run_passed 0"));
        let threshold = text
            .lines()
            .find(|l| l.starts_with("freshprobe_threshold_passed{"))
            .unwrap();
        assert!(threshold.contains("expression=\"rate==0\""));
        assert!(threshold.ends_with(" 0"));
    }

    #[test]
    fn test_read_run_has_no_freshness_section() {
        let metrics = RunMetrics::new();
        metrics.record_http(Duration::from_millis(2), false);
        let snapshot = metrics.snapshot();
        let stats = RunStats {
            iterations: 1,
            dropped: 0,
            elapsed: Duration::from_secs(1),
        };
        let report = SummaryReport::new(
            "read",
            "1 VUs for 1s",
            &stats,
            &snapshot,
            ThresholdSet::new().evaluate(&snapshot),
        );

        assert!(report.freshness.is_none());
        assert!(report.passed);
        assert!(!report.render(ReportFormat::Text).unwrap().contains("freshness_delay"));
    }

    #[test]
    fn test_write_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        run(&[100], "rate==0").write_report(&path, ReportFormat::Json).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"scenario\": \"freshness\""));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("prometheus".parse::<ReportFormat>().unwrap(), ReportFormat::Prometheus);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
