//! SLA threshold expressions
//!
//! An expression is `<aggregate> <op> <bound>`, e.g. `p(95)<=3000` or
//! `rate==0`. Evaluation is a pure read of a [`MetricsSnapshot`].

use crate::error::{ProbeError, ProbeResult};
use crate::metrics::{MetricValue, MetricsSnapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Aggregated statistic a threshold reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Percentile(f64),
    Rate,
}

impl Aggregate {
    /// Resolve this aggregate against a metric value, or explain why it
    /// does not apply.
    fn observe(&self, value: &MetricValue, snapshot: &MetricsSnapshot) -> Result<f64, String> {
        match (self, value) {
            (Self::Avg, MetricValue::Trend(t)) => Ok(t.avg_ms()),
            (Self::Min, MetricValue::Trend(t)) => Ok(t.min_ms()),
            (Self::Max, MetricValue::Trend(t)) => Ok(t.max_ms()),
            (Self::Med, MetricValue::Trend(t)) => Ok(t.med_ms()),
            (Self::Percentile(p), MetricValue::Trend(t)) => Ok(t.percentile_ms(*p)),
            (Self::Count, MetricValue::Trend(t)) => Ok(t.count() as f64),
            (Self::Rate, MetricValue::Rate(r)) => Ok(r.value()),
            (Self::Count, MetricValue::Counter(c)) => Ok(c.value() as f64),
            (Self::Rate, MetricValue::Counter(c)) => Ok(c.per_second(snapshot.elapsed)),
            (aggregate, value) => Err(format!(
                "aggregate '{}' does not apply to a {} metric",
                aggregate,
                value.kind()
            )),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Count => f.write_str("count"),
            Self::Percentile(p) => write!(f, "p({})", p),
            Self::Rate => f.write_str("rate"),
        }
    }
}

impl FromStr for Aggregate {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let aggregate = match s {
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            "count" => Self::Count,
            "rate" => Self::Rate,
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| ProbeError::Threshold(format!("unknown aggregate '{}'", s)))?;
                let p: f64 = inner.trim().parse().map_err(|_| {
                    ProbeError::Threshold(format!("invalid percentile '{}'", inner))
                })?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(ProbeError::Threshold(format!(
                        "percentile {} outside [0, 100]",
                        p
                    )));
                }
                Self::Percentile(p)
            }
        };
        Ok(aggregate)
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Operator); 6] = [
        ("<=", Operator::Le),
        (">=", Operator::Ge),
        ("==", Operator::Eq),
        ("!=", Operator::Ne),
        ("<", Operator::Lt),
        (">", Operator::Gt),
    ];

    pub fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// One parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub aggregate: Aggregate,
    pub operator: Operator,
    pub bound: f64,
    source: String,
}

impl Threshold {
    pub fn parse(expression: &str) -> ProbeResult<Self> {
        let source = expression.trim().to_string();

        let (at, token, operator) = Operator::TOKENS
            .iter()
            .filter_map(|(token, op)| source.find(token).map(|at| (at, *token, *op)))
            .min_by_key(|(at, token, _)| (*at, std::cmp::Reverse(token.len())))
            .ok_or_else(|| {
                ProbeError::Threshold(format!("no comparison operator in '{}'", source))
            })?;

        let aggregate: Aggregate = source[..at].parse()?;
        let rest = source[at + token.len()..].trim();
        let bound: f64 = rest.parse().map_err(|_| {
            ProbeError::Threshold(format!("invalid bound '{}' in '{}'", rest, source))
        })?;
        if !bound.is_finite() {
            return Err(ProbeError::Threshold(format!(
                "bound must be finite in '{}'",
                source
            )));
        }

        Ok(Self {
            aggregate,
            operator,
            bound,
            source,
        })
    }

    pub fn expression(&self) -> &str {
        &self.source
    }
}

impl FromStr for Threshold {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Outcome of one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    /// `None` when the metric or aggregate was unavailable.
    pub observed: Option<f64>,
    pub passed: bool,
    pub message: String,
}

/// Outcome of a whole threshold set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdReport {
    pub results: Vec<ThresholdResult>,
    pub passed: bool,
}

impl ThresholdReport {
    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Thresholds keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    by_metric: BTreeMap<String, Vec<Threshold>>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: &BTreeMap<String, Vec<String>>) -> ProbeResult<Self> {
        let mut set = Self::new();
        for (metric, expressions) in map {
            for expression in expressions {
                set.add(metric, expression)?;
            }
        }
        Ok(set)
    }

    pub fn add(&mut self, metric: &str, expression: &str) -> ProbeResult<()> {
        let metric = metric.trim();
        if metric.is_empty() {
            return Err(ProbeError::Threshold(format!(
                "missing metric name for '{}'",
                expression
            )));
        }
        let threshold = Threshold::parse(expression)?;
        self.by_metric
            .entry(metric.to_string())
            .or_default()
            .push(threshold);
        Ok(())
    }

    /// Add a `metric:expression` pair as given on the command line.
    pub fn add_assignment(&mut self, assignment: &str) -> ProbeResult<()> {
        let (metric, expression) = assignment.split_once(':').ok_or_else(|| {
            ProbeError::Threshold(format!(
                "expected 'metric:expression', got '{}'",
                assignment
            ))
        })?;
        self.add(metric, expression)
    }

    /// Merge `other` in; its expressions are appended per metric.
    pub fn extend(&mut self, other: ThresholdSet) {
        for (metric, thresholds) in other.by_metric {
            self.by_metric.entry(metric).or_default().extend(thresholds);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_metric.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_metric.values().map(Vec::len).sum()
    }

    /// Evaluate every threshold; the set passes when all of them pass.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> ThresholdReport {
        let mut results = Vec::with_capacity(self.len());

        for (metric, thresholds) in &self.by_metric {
            for threshold in thresholds {
                results.push(evaluate_one(metric, threshold, snapshot));
            }
        }

        let passed = results.iter().all(|r| r.passed);
        ThresholdReport { results, passed }
    }
}

fn evaluate_one(metric: &str, threshold: &Threshold, snapshot: &MetricsSnapshot) -> ThresholdResult {
    let observed = match snapshot.get(metric) {
        Some(value) => threshold.aggregate.observe(value, snapshot),
        None => Err(format!("metric '{}' not recorded", metric)),
    };

    match observed {
        Ok(observed) => {
            let passed = threshold.operator.holds(observed, threshold.bound);
            let verdict = if passed { "ok" } else { "violated" };
            ThresholdResult {
                metric: metric.to_string(),
                expression: threshold.expression().to_string(),
                observed: Some(observed),
                passed,
                message: format!(
                    "{}={:.3} {} {} {}",
                    threshold.aggregate,
                    observed,
                    verdict,
                    threshold.operator.as_str(),
                    threshold.bound
                ),
            }
        }
        Err(message) => ThresholdResult {
            metric: metric.to_string(),
            expression: threshold.expression().to_string(),
            observed: None,
            passed: false,
            message,
        },
    }
}
