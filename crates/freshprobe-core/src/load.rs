//! Traffic engine: runs a [`Scenario`] under a [`LoadShape`].
//!
//! - **Constant VUs:** a fixed number of workers loop over iterations
//! - **Constant arrival rate:** iterations start on a fixed tick whether or
//!   not earlier ones finished, bounded by a pool of virtual users
//!
//! Scheduling stops when the run duration elapses. In-flight iterations are
//! awaited, never aborted; each enforces its own deadline.

use crate::metrics::RunMetrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Identity of one iteration within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationContext {
    /// Stable id of the worker (virtual user) running the iteration.
    pub worker_id: usize,
    /// Per-worker iteration counter, starting at zero.
    pub iteration: u64,
}

/// Workload executed once per iteration.
#[async_trait]
pub trait Scenario: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run one self-contained iteration. Must not fail the run.
    async fn run_iteration(&self, ctx: IterationContext);
}

/// Traffic shape of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadShape {
    /// Fixed concurrency, workers looping freely.
    ConstantVus {
        vus: usize,
        duration: Duration,
        think_time: Duration,
    },

    /// `rate` iteration starts per `time_unit`.
    ConstantArrivalRate {
        rate: u64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: usize,
        max_vus: usize,
    },
}

impl LoadShape {
    pub fn duration(&self) -> Duration {
        match self {
            Self::ConstantVus { duration, .. } | Self::ConstantArrivalRate { duration, .. } => {
                *duration
            }
        }
    }

    /// Upper bound of concurrently running iterations.
    pub fn max_concurrency(&self) -> usize {
        match self {
            Self::ConstantVus { vus, .. } => *vus,
            Self::ConstantArrivalRate { max_vus, .. } => *max_vus,
        }
    }

    /// Spacing between two arrivals, or `None` for free-looping workers.
    pub fn arrival_interval(&self) -> Option<Duration> {
        match self {
            Self::ConstantVus { .. } => None,
            Self::ConstantArrivalRate {
                rate, time_unit, ..
            } => {
                let nanos = time_unit.as_nanos() / u128::from((*rate).max(1));
                Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX).max(1)))
            }
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::ConstantVus { vus, duration, .. } => {
                format!("{} VUs for {:?}", vus, duration)
            }
            Self::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                max_vus,
                ..
            } => format!(
                "{} iterations per {:?} for {:?} (max {} VUs)",
                rate, time_unit, duration, max_vus
            ),
        }
    }
}

/// Totals of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub iterations: u64,
    pub dropped: u64,
    pub elapsed: Duration,
}

/// Virtual user slot handed to arrival-rate iterations.
#[derive(Debug)]
struct Vu {
    id: usize,
    iterations: u64,
}

#[derive(Debug)]
struct VuPool {
    free: Vec<Vu>,
    allocated: usize,
}

impl VuPool {
    fn new(pre_allocated: usize) -> Self {
        Self {
            free: (0..pre_allocated)
                .rev()
                .map(|id| Vu { id, iterations: 0 })
                .collect(),
            allocated: pre_allocated,
        }
    }

    fn checkout(&mut self) -> Vu {
        self.free.pop().unwrap_or_else(|| {
            let vu = Vu {
                id: self.allocated,
                iterations: 0,
            };
            self.allocated += 1;
            vu
        })
    }

    fn checkin(&mut self, vu: Vu) {
        self.free.push(vu);
    }
}

/// Drives scenarios and counts iterations into the shared metrics.
pub struct LoadRunner {
    metrics: Arc<RunMetrics>,
    progress_interval: Duration,
}

impl LoadRunner {
    pub fn new(metrics: Arc<RunMetrics>) -> Self {
        Self {
            metrics,
            progress_interval: Duration::from_secs(10),
        }
    }

    pub fn with_progress_interval(mut self, progress_interval: Duration) -> Self {
        self.progress_interval = progress_interval.max(Duration::from_millis(1));
        self
    }

    /// Run `scenario` until the shape's duration elapses and in-flight
    /// iterations have finished.
    pub async fn run<S: Scenario>(&self, shape: &LoadShape, scenario: Arc<S>) -> RunStats {
        info!(scenario = scenario.name(), shape = %shape.description(), "starting load run");

        let started = Instant::now();
        let completed = Arc::new(AtomicU64::new(0));
        let progress = self.spawn_progress(Arc::clone(&completed), started);

        let dropped = match *shape {
            LoadShape::ConstantVus {
                vus,
                duration,
                think_time,
            } => {
                self.run_constant_vus(scenario, vus, started + duration, think_time, &completed)
                    .await;
                0
            }
            LoadShape::ConstantArrivalRate {
                duration,
                pre_allocated_vus,
                max_vus,
                ..
            } => {
                let spacing = shape.arrival_interval().unwrap_or(Duration::from_millis(1));
                self.run_arrival_rate(
                    scenario,
                    spacing,
                    started + duration,
                    pre_allocated_vus.min(max_vus),
                    max_vus,
                    &completed,
                )
                .await
            }
        };

        progress.abort();

        let stats = RunStats {
            iterations: completed.load(Ordering::Relaxed),
            dropped,
            elapsed: started.elapsed(),
        };
        info!(
            iterations = stats.iterations,
            dropped = stats.dropped,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "load run complete"
        );
        stats
    }

    async fn run_constant_vus<S: Scenario>(
        &self,
        scenario: Arc<S>,
        vus: usize,
        end: Instant,
        think_time: Duration,
        completed: &Arc<AtomicU64>,
    ) {
        let mut handles = Vec::with_capacity(vus);

        for worker_id in 0..vus {
            let scenario = Arc::clone(&scenario);
            let metrics = Arc::clone(&self.metrics);
            let completed = Arc::clone(completed);

            handles.push(tokio::spawn(async move {
                let mut iteration = 0u64;
                while Instant::now() < end {
                    scenario
                        .run_iteration(IterationContext {
                            worker_id,
                            iteration,
                        })
                        .await;
                    metrics.record_iteration();
                    completed.fetch_add(1, Ordering::Relaxed);
                    iteration += 1;

                    if !think_time.is_zero() {
                        sleep(think_time).await;
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }
    }

    async fn run_arrival_rate<S: Scenario>(
        &self,
        scenario: Arc<S>,
        spacing: Duration,
        end: Instant,
        pre_allocated_vus: usize,
        max_vus: usize,
        completed: &Arc<AtomicU64>,
    ) -> u64 {
        let slots = Arc::new(Semaphore::new(max_vus));
        let pool = Arc::new(Mutex::new(VuPool::new(pre_allocated_vus)));
        let mut dropped = 0u64;

        let mut ticker = interval(spacing);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            let arrival = ticker.tick().await;
            if arrival >= end {
                break;
            }

            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                dropped += 1;
                self.metrics.record_dropped(1);
                continue;
            };

            let mut vu = pool.lock().checkout();
            let scenario = Arc::clone(&scenario);
            let metrics = Arc::clone(&self.metrics);
            let completed = Arc::clone(completed);
            let pool = Arc::clone(&pool);

            tokio::spawn(async move {
                scenario
                    .run_iteration(IterationContext {
                        worker_id: vu.id,
                        iteration: vu.iterations,
                    })
                    .await;
                metrics.record_iteration();
                completed.fetch_add(1, Ordering::Relaxed);
                vu.iterations += 1;
                pool.lock().checkin(vu);
                drop(permit);
            });
        }

        if dropped > 0 {
            warn!(dropped, "arrivals dropped, no free VU (raise max_vus)");
        }

        // Every permit back means every in-flight iteration has finished.
        let all = u32::try_from(max_vus).unwrap_or(u32::MAX);
        if slots.acquire_many(all).await.is_err() {
            warn!("VU slots closed before in-flight iterations drained");
        }

        dropped
    }

    fn spawn_progress(
        &self,
        completed: Arc<AtomicU64>,
        started: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.progress_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                info!(
                    elapsed_s = started.elapsed().as_secs(),
                    iterations = completed.load(Ordering::Relaxed),
                    "progress"
                );
            }
        })
    }
}
