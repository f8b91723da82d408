//! Write-to-read freshness probing and read load generation for replicated
//! HTTP services.

pub mod bench;
pub mod config;
pub mod emitter;
pub mod error;
pub mod load;
pub mod metrics;
pub mod poller;
pub mod probe;
pub mod report;
pub mod stats;
pub mod subject;
pub mod targets;
pub mod thresholds;
pub mod transport;
pub mod wire;

pub use bench::{Preset, ReadBenchmark, Workload};
pub use config::{Executor, ProbeConfig, SubjectKind};
pub use emitter::{WriteEmitter, WriteOutcome};
pub use error::{ProbeError, ProbeResult};
pub use load::{IterationContext, LoadRunner, LoadShape, RunStats, Scenario};
pub use metrics::{MetricValue, MetricsSnapshot, RunMetrics};
pub use poller::{ConvergencePolicy, ConvergencePoller, PollOutcome, PollSettings, PollState};
pub use probe::{FreshnessProbe, ProbeOutcome};
pub use report::{ReportFormat, SummaryReport};
pub use subject::SubjectStrategy;
pub use targets::ReplicaTargets;
pub use thresholds::{Threshold, ThresholdReport, ThresholdResult, ThresholdSet};
pub use transport::{HttpResponse, HttpTransport, MeteredTransport, ReqwestTransport};
pub use wire::{Adjustment, AdjustmentBody, AdjustmentGenerator, AdjustmentMode, PriceView, Route};
