//! Freshness SLA probe: baseline read, write, poll, record.

use crate::emitter::WriteEmitter;
use crate::load::{IterationContext, Scenario};
use crate::metrics::RunMetrics;
use crate::poller::{ConvergencePoller, PollOutcome, PollSettings, PollState};
use crate::subject::SubjectStrategy;
use crate::targets::ReplicaTargets;
use crate::transport::HttpTransport;
use crate::wire::{AdjustmentGenerator, ProductId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Everything one freshness iteration produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub product_id: ProductId,
    pub write_ok: bool,
    pub baseline_missing: bool,
    pub poll: PollOutcome,
}

impl ProbeOutcome {
    /// The delay sample: convergence delay, or the deadline sentinel.
    pub fn delay(&self) -> Duration {
        self.poll.delay
    }

    pub fn timed_out(&self) -> bool {
        self.poll.state == PollState::TimedOut
    }

    pub fn converged(&self) -> bool {
        self.poll.state == PollState::Converged
    }
}

/// The freshness workload run by every worker.
pub struct FreshnessProbe<T> {
    targets: ReplicaTargets,
    subjects: SubjectStrategy,
    emitter: WriteEmitter<T>,
    poller: ConvergencePoller<T>,
    metrics: Arc<RunMetrics>,
}

impl<T: HttpTransport> FreshnessProbe<T> {
    pub fn new(
        targets: ReplicaTargets,
        transport: Arc<T>,
        generator: AdjustmentGenerator,
        subjects: SubjectStrategy,
        settings: PollSettings,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            emitter: WriteEmitter::new(targets.clone(), generator, Arc::clone(&transport)),
            poller: ConvergencePoller::new(targets.clone(), transport, settings),
            targets,
            subjects,
            metrics,
        }
    }

    /// Run one iteration without recording it.
    ///
    /// The baseline is read from the endpoint that will receive the write.
    /// The iteration clock starts after the baseline read, right before the
    /// write is issued.
    pub async fn probe(&self, ctx: IterationContext) -> ProbeOutcome {
        let product_id = self.subjects.pick(ctx.worker_id, ctx.iteration);
        let write_endpoint = self.targets.write_endpoint(ctx.worker_id, ctx.iteration);

        let baseline = self.poller.read_price(write_endpoint, product_id).await;
        if baseline.is_none() {
            warn!(
                product_id,
                endpoint = write_endpoint,
                "baseline read unavailable, iteration counted as timeout"
            );
        }

        let started = Instant::now();
        let write = self.emitter.emit(ctx.worker_id, ctx.iteration, product_id).await;
        let poll = self.poller.poll(product_id, baseline, started).await;

        ProbeOutcome {
            product_id,
            write_ok: write.ok(),
            baseline_missing: baseline.is_none(),
            poll,
        }
    }
}

#[async_trait]
impl<T: HttpTransport + 'static> Scenario for FreshnessProbe<T> {
    fn name(&self) -> &str {
        "freshness"
    }

    async fn run_iteration(&self, ctx: IterationContext) {
        let outcome = self.probe(ctx).await;
        self.metrics.record_probe(&outcome);
    }
}
