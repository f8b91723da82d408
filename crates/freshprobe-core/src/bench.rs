//! Read-only benchmarks and the built-in run presets

use crate::error::{ProbeError, ProbeResult};
use crate::load::{IterationContext, LoadShape, Scenario};
use crate::metrics::names;
use crate::subject::SubjectStrategy;
use crate::targets::ReplicaTargets;
use crate::thresholds::ThresholdSet;
use crate::transport::HttpTransport;
use crate::wire::{ProductId, Route};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// One GET per iteration against `route`.
///
/// Latency and failures are recorded by the transport, so `T` is normally a
/// [`MeteredTransport`](crate::transport::MeteredTransport).
pub struct ReadBenchmark<T> {
    route: Route,
    subjects: SubjectStrategy,
    targets: ReplicaTargets,
    transport: Arc<T>,
    think_time: Duration,
}

impl<T: HttpTransport> ReadBenchmark<T> {
    pub fn new(
        route: Route,
        subjects: SubjectStrategy,
        targets: ReplicaTargets,
        transport: Arc<T>,
    ) -> Self {
        Self {
            route,
            subjects,
            targets,
            transport,
            think_time: Duration::ZERO,
        }
    }

    /// Pause after every request.
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }
}

#[async_trait]
impl<T: HttpTransport + 'static> Scenario for ReadBenchmark<T> {
    fn name(&self) -> &str {
        "read"
    }

    async fn run_iteration(&self, ctx: IterationContext) {
        let product_id = self.subjects.pick(ctx.worker_id, ctx.iteration);
        // Same rotation as writes so every replica takes read load.
        let endpoint = self.targets.write_endpoint(ctx.worker_id, ctx.iteration);
        let url = self.route.url(endpoint, product_id);

        match self.transport.get(&url).await {
            Ok(response) if !response.is_ok() => {
                debug!(url = %url, status = response.status, "read returned non-200");
            }
            Ok(_) => {}
            Err(e) => debug!(url = %url, error = %e, "read failed"),
        }

        if !self.think_time.is_zero() {
            sleep(self.think_time).await;
        }
    }
}

/// What a preset runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Freshness,
    Read {
        route: Route,
        subjects: SubjectStrategy,
        think_time: Duration,
    },
}

/// Built-in benchmark programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Write-to-read freshness under 20 VUs.
    FreshnessSla,
    /// Single hot product on the cached route.
    CacheHot,
    /// Random products on the uncached route.
    DbBaseline,
    /// 5000 arrivals per second on the cached route.
    HighRps,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::FreshnessSla,
        Preset::CacheHot,
        Preset::DbBaseline,
        Preset::HighRps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FreshnessSla => "freshness-sla",
            Self::CacheHot => "cache-hot",
            Self::DbBaseline => "db-baseline",
            Self::HighRps => "high-rps",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::FreshnessSla => "write-to-read freshness SLA, 20 VUs for 15s",
            Self::CacheHot => "hot product on /price, 100 VUs for 45s",
            Self::DbBaseline => "random products on /price-db, 50 VUs for 30s",
            Self::HighRps => "random products on /price, 5000 req/s for 60s",
        }
    }

    pub fn shape(&self) -> LoadShape {
        let constant_vus = |vus, secs| LoadShape::ConstantVus {
            vus,
            duration: Duration::from_secs(secs),
            think_time: Duration::ZERO,
        };

        match self {
            Self::FreshnessSla => constant_vus(20, 15),
            Self::CacheHot => constant_vus(100, 45),
            Self::DbBaseline => constant_vus(50, 30),
            Self::HighRps => LoadShape::ConstantArrivalRate {
                rate: 5000,
                time_unit: Duration::from_secs(1),
                duration: Duration::from_secs(60),
                pre_allocated_vus: 500,
                max_vus: 1000,
            },
        }
    }

    /// `hot_product_id` is the subject of [`Preset::CacheHot`].
    pub fn workload(&self, hot_product_id: ProductId) -> Workload {
        let random = SubjectStrategy::Random { min: 1, max: 100_000 };
        match self {
            Self::FreshnessSla => Workload::Freshness,
            Self::CacheHot => Workload::Read {
                route: Route::Price,
                subjects: SubjectStrategy::Fixed(hot_product_id),
                think_time: Duration::ZERO,
            },
            Self::DbBaseline => Workload::Read {
                route: Route::PriceDb,
                subjects: random,
                think_time: Duration::from_millis(1),
            },
            Self::HighRps => Workload::Read {
                route: Route::Price,
                subjects: random,
                think_time: Duration::ZERO,
            },
        }
    }

    pub fn thresholds(&self) -> ProbeResult<ThresholdSet> {
        let mut set = ThresholdSet::new();
        match self {
            Self::FreshnessSla => {
                set.add(names::FRESHNESS_DELAY, "avg<=1000")?;
                set.add(names::FRESHNESS_DELAY, "p(95)<=3000")?;
                set.add(names::FRESHNESS_TIMEOUT, "rate==0")?;
            }
            Self::CacheHot => {
                set.add(names::HTTP_REQ_DURATION, "p(95)<10")?;
                set.add(names::HTTP_REQ_DURATION, "p(99)<20")?;
            }
            Self::DbBaseline | Self::HighRps => {}
        }
        Ok(set)
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(Preset::as_str).collect();
                ProbeError::invalid_config(format!(
                    "unknown preset '{}' (expected one of {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::LoadRunner;
    use crate::metrics::RunMetrics;
    use crate::poller::testing::{flip, ReplicaScript, ScriptedReplicas};
    use crate::transport::MeteredTransport;

    #[tokio::test(start_paused = true)]
    async fn test_read_benchmark_issues_one_get_per_iteration() {
        let metrics = Arc::new(RunMetrics::new());
        let replicas = Arc::new(ScriptedReplicas::new(vec![
            ("http://a", flip(10.0, 10.0, 0)),
            ("http://b", ReplicaScript::Status(503)),
        ]));
        let transport = Arc::new(MeteredTransport::new(
            Arc::clone(&replicas),
            Arc::clone(&metrics),
        ));

        let bench = ReadBenchmark::new(
            Route::PriceDb,
            SubjectStrategy::Fixed(42),
            ReplicaTargets::resolve(Some("http://a,http://b")),
            transport,
        );
        for iteration in 0..4 {
            bench.run_iteration(IterationContext { worker_id: 0, iteration }).await;
        }

        let urls: Vec<String> = replicas.reads.lock().iter().map(|(url, _)| url.clone()).collect();
        assert_eq!(
            urls,
            vec!["http://a/price-db/42", "http://b/price-db/42", "http://a/price-db/42", "http://b/price-db/42"]
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(names::HTTP_REQS).unwrap().value(), 4);
        assert_eq!(snapshot.rate(names::HTTP_REQ_FAILED).unwrap().value(), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_think_time_paces_workers() {
        let metrics = Arc::new(RunMetrics::new());
        let replicas = Arc::new(ScriptedReplicas::new(vec![("http://a", flip(1.0, 1.0, 0))]));
        let bench = Arc::new(
            ReadBenchmark::new(
                Route::Price,
                SubjectStrategy::Fixed(1),
                ReplicaTargets::resolve(Some("http://a")),
                Arc::clone(&replicas),
            )
            .with_think_time(Duration::from_millis(100)),
        );

        let shape = LoadShape::ConstantVus {
            vus: 2,
            duration: Duration::from_secs(1),
            think_time: Duration::ZERO,
        };
        let stats = LoadRunner::new(metrics).run(&shape, bench).await;

        assert_eq!(stats.iterations, 20);
        assert_eq!(replicas.read_count(), 20);
    }

    #[test]
    fn test_presets() {
        for preset in Preset::ALL {
            assert_eq!(preset.as_str().parse::<Preset>().unwrap(), preset);
            preset.thresholds().unwrap();
        }
        assert!("spike".parse::<Preset>().is_err());

        assert_eq!(Preset::FreshnessSla.workload(12345), Workload::Freshness);
        assert_eq!(Preset::FreshnessSla.thresholds().unwrap().len(), 3);
        assert_eq!(Preset::CacheHot.thresholds().unwrap().len(), 2);
        assert!(Preset::HighRps.thresholds().unwrap().is_empty());

        assert_eq!(
            Preset::CacheHot.workload(777),
            Workload::Read {
                route: Route::Price,
                subjects: SubjectStrategy::Fixed(777),
                think_time: Duration::ZERO,
            }
        );
        assert_eq!(Preset::HighRps.shape().max_concurrency(), 1000);
        assert_eq!(Preset::DbBaseline.shape().duration(), Duration::from_secs(30));
    }
}
