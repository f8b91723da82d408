//! Convergence poller
//!
//! After an iteration's write returns, the poller re-reads the subject from
//! the replica set until the value differs from the baseline captured before
//! the write, or the iteration deadline passes.
//!
//! # States
//!
//! - **Polling:** entered right after the write, whatever its outcome
//! - **Converged:** the new value was observed per the [`ConvergencePolicy`]
//! - **TimedOut:** the deadline elapsed first, or no baseline was available
//!
//! Delays are measured from the iteration start (before the write is
//! issued). A converged delay is always strictly below the deadline; a
//! timed-out iteration reports exactly the deadline as its delay.

use crate::error::ProbeError;
use crate::targets::ReplicaTargets;
use crate::transport::HttpTransport;
use crate::wire::{PriceView, ProductId, Route};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace};

/// Which replicas must reflect the write before an iteration converges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergencePolicy {
    /// First replica showing the new value ends the iteration.
    #[default]
    Any,
    /// Every replica must have shown the new value. A replica is polled
    /// until it first does, and not re-polled after that.
    All,
}

impl fmt::Display for ConvergencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::All => f.write_str("all"),
        }
    }
}

impl FromStr for ConvergencePolicy {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            other => Err(ProbeError::invalid_config(format!(
                "invalid convergence policy '{}', must be 'any' or 'all'",
                other
            ))),
        }
    }
}

/// Poll loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Polling,
    Converged,
    TimedOut,
}

/// Terminal result of one poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// `Converged` or `TimedOut`, never `Polling`.
    pub state: PollState,
    /// Convergence delay, or the deadline when timed out.
    pub delay: Duration,
    /// Poll passes started before the loop ended.
    pub passes: u32,
}

impl PollOutcome {
    fn timed_out(deadline: Duration, passes: u32) -> Self {
        Self {
            state: PollState::TimedOut,
            delay: deadline,
            passes,
        }
    }
}

/// Poll loop timing and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub deadline: Duration,
    pub interval: Duration,
    pub policy: ConvergencePolicy,
    pub route: Route,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_millis(5000),
            interval: Duration::from_millis(50),
            policy: ConvergencePolicy::Any,
            route: Route::Price,
        }
    }
}

/// Polls every replica until the written value becomes visible.
pub struct ConvergencePoller<T> {
    targets: ReplicaTargets,
    transport: Arc<T>,
    settings: PollSettings,
}

impl<T: HttpTransport> ConvergencePoller<T> {
    pub fn new(targets: ReplicaTargets, transport: Arc<T>, settings: PollSettings) -> Self {
        Self {
            targets,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Read the current final price of `product_id` from one endpoint.
    ///
    /// Any transport failure, non-200 status or undecodable body reads as
    /// `None` ("unavailable").
    pub async fn read_price(&self, endpoint: &str, product_id: ProductId) -> Option<f64> {
        let url = self.settings.route.url(endpoint, product_id);
        let response = self
            .transport
            .get(&url)
            .await
            .and_then(|response| response.require_ok(&url));
        match response {
            Ok(response) => {
                let view = PriceView::parse(&response.body);
                if view.is_none() {
                    debug!(url = %url, "unparsable price response");
                }
                view.map(|view| view.final_price)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "price read unavailable");
                None
            }
        }
    }

    /// Run the poll loop for one iteration that started at `started`.
    ///
    /// A missing baseline ends the loop immediately as timed out with the
    /// deadline as delay, without issuing any read.
    pub async fn poll(
        &self,
        product_id: ProductId,
        baseline: Option<f64>,
        started: Instant,
    ) -> PollOutcome {
        let deadline = self.settings.deadline;
        let Some(baseline) = baseline else {
            return PollOutcome::timed_out(deadline, 0);
        };

        let mut pending: Vec<&str> = self.targets.iter().collect();
        let mut passes = 0u32;
        let mut state = PollState::Polling;

        while state == PollState::Polling {
            if started.elapsed() >= deadline {
                state = PollState::TimedOut;
                break;
            }

            passes += 1;
            let mut confirmed = Vec::new();

            for (index, endpoint) in pending.iter().enumerate() {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    break;
                }

                let observed = timeout(remaining, self.read_price(endpoint, product_id))
                    .await
                    .ok()
                    .flatten();
                trace!(endpoint, product_id, ?observed, baseline, pass = passes, "poll read");

                if observed.is_some_and(|value| value != baseline) {
                    confirmed.push(index);
                    if self.settings.policy == ConvergencePolicy::Any {
                        break;
                    }
                }
            }

            for index in confirmed.iter().rev() {
                pending.remove(*index);
            }

            let done = match self.settings.policy {
                ConvergencePolicy::Any => !confirmed.is_empty(),
                ConvergencePolicy::All => pending.is_empty(),
            };

            if done {
                let delay = started.elapsed();
                if delay < deadline {
                    debug!(product_id, delay_ms = delay.as_millis() as u64, passes, "converged");
                    return PollOutcome {
                        state: PollState::Converged,
                        delay,
                        passes,
                    };
                }
                state = PollState::TimedOut;
                break;
            }

            let remaining = deadline.saturating_sub(started.elapsed());
            sleep(self.settings.interval.min(remaining)).await;
        }

        debug!(product_id, ?state, passes, "poll deadline exceeded");
        PollOutcome::timed_out(deadline, passes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted replicas whose value flips at a fixed offset from creation.

    use crate::error::{ProbeError, ProbeResult};
    use crate::transport::{HttpResponse, HttpTransport};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    #[derive(Debug, Clone)]
    pub enum ReplicaScript {
        /// Serves `before` until `flip_at`, then `after`.
        Flip {
            before: f64,
            after: f64,
            flip_at: Duration,
        },
        /// Returns the given status with an empty body.
        Status(u16),
        /// Returns 200 with a non-JSON body.
        Garbage,
        /// Refuses connections.
        Down,
    }

    /// In-memory replica set keyed by base endpoint.
    pub struct ScriptedReplicas {
        origin: Instant,
        latency: Duration,
        write_status: u16,
        scripts: HashMap<String, ReplicaScript>,
        pub reads: Mutex<Vec<(String, Duration)>>,
        pub writes: Mutex<Vec<String>>,
    }

    impl ScriptedReplicas {
        pub fn new(scripts: Vec<(&str, ReplicaScript)>) -> Self {
            Self {
                origin: Instant::now(),
                latency: Duration::ZERO,
                write_status: 200,
                scripts: scripts
                    .into_iter()
                    .map(|(endpoint, script)| (endpoint.to_string(), script))
                    .collect(),
                reads: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
            }
        }

        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn with_write_status(mut self, status: u16) -> Self {
            self.write_status = status;
            self
        }

        pub fn read_count(&self) -> usize {
            self.reads.lock().len()
        }

        fn script_for(&self, url: &str) -> Option<&ReplicaScript> {
            self.scripts
                .iter()
                .find(|(endpoint, _)| url.starts_with(endpoint.as_str()))
                .map(|(_, script)| script)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedReplicas {
        async fn get(&self, url: &str) -> ProbeResult<HttpResponse> {
            sleep(self.latency).await;
            let elapsed = self.origin.elapsed();
            self.reads.lock().push((url.to_string(), elapsed));

            let body = match self.script_for(url) {
                Some(ReplicaScript::Flip { before, after, flip_at }) => {
                    let price = if elapsed >= *flip_at { after } else { before };
                    format!(r#"{{"productId":1,"basePrice":100,"finalPrice":{}}}"#, price)
                }
                Some(ReplicaScript::Status(status)) => {
                    return Ok(HttpResponse {
                        status: *status,
                        body: Bytes::new(),
                        elapsed: self.latency,
                    })
                }
                Some(ReplicaScript::Garbage) => "<html>oops</html>".to_string(),
                Some(ReplicaScript::Down) | None => {
                    return Err(ProbeError::transport(url, "connection refused"))
                }
            };

            Ok(HttpResponse {
                status: 200,
                body: Bytes::from(body),
                elapsed: self.latency,
            })
        }

        async fn post_json(&self, url: &str, _body: Vec<u8>) -> ProbeResult<HttpResponse> {
            sleep(self.latency).await;
            self.writes.lock().push(url.to_string());
            Ok(HttpResponse {
                status: self.write_status,
                body: Bytes::new(),
                elapsed: self.latency,
            })
        }
    }

    pub fn flip(before: f64, after: f64, flip_at_ms: u64) -> ReplicaScript {
        ReplicaScript::Flip {
            before,
            after,
            flip_at: Duration::from_millis(flip_at_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{flip, ReplicaScript, ScriptedReplicas};
    use super::*;

    fn poller(
        endpoints: &str,
        replicas: ScriptedReplicas,
        policy: ConvergencePolicy,
    ) -> (ConvergencePoller<ScriptedReplicas>, Arc<ScriptedReplicas>) {
        let transport = Arc::new(replicas);
        let settings = PollSettings {
            policy,
            ..Default::default()
        };
        let poller = ConvergencePoller::new(
            ReplicaTargets::resolve(Some(endpoints)),
            Arc::clone(&transport),
            settings,
        );
        (poller, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_second_pass() {
        let (poller, _) = poller(
            "http://a",
            ScriptedReplicas::new(vec![("http://a", flip(100.0, 150.0, 50))]),
            ConvergencePolicy::Any,
        );

        let baseline = poller.read_price("http://a", 1).await;
        assert_eq!(baseline, Some(100.0));

        let outcome = poller.poll(1, baseline, Instant::now()).await;
        assert_eq!(outcome.state, PollState::Converged);
        assert!(outcome.delay >= Duration::from_millis(50));
        assert!(outcome.delay <= Duration::from_millis(100));
        assert_eq!(outcome.passes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_deadline_sentinel() {
        let (poller, transport) = poller(
            "http://a",
            ScriptedReplicas::new(vec![("http://a", flip(100.0, 150.0, 60_000))]),
            ConvergencePolicy::Any,
        );

        let outcome = poller.poll(1, Some(100.0), Instant::now()).await;
        assert_eq!(outcome.state, PollState::TimedOut);
        assert_eq!(outcome.delay, Duration::from_millis(5000));
        // One pass per 50ms interval across the 5s deadline.
        assert_eq!(outcome.passes, 100);
        assert_eq!(transport.read_count(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_baseline_skips_poll_loop() {
        let (poller, transport) = poller(
            "http://a",
            ScriptedReplicas::new(vec![("http://a", flip(100.0, 150.0, 0))]),
            ConvergencePolicy::Any,
        );

        let started = Instant::now();
        let outcome = poller.poll(1, None, started).await;
        assert_eq!(outcome.state, PollState::TimedOut);
        assert_eq!(outcome.delay, Duration::from_millis(5000));
        assert_eq!(outcome.passes, 0);
        assert_eq!(transport.read_count(), 0);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_policy_takes_fastest_replica() {
        let (poller, _) = poller(
            "http://a,http://b",
            ScriptedReplicas::new(vec![
                ("http://a", flip(100.0, 150.0, 100)),
                ("http://b", flip(100.0, 150.0, 4000)),
            ]),
            ConvergencePolicy::Any,
        );

        let outcome = poller.poll(1, Some(100.0), Instant::now()).await;
        assert_eq!(outcome.state, PollState::Converged);
        assert!(outcome.delay >= Duration::from_millis(100));
        assert!(outcome.delay < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_policy_waits_for_slowest_replica() {
        let (poller, transport) = poller(
            "http://a,http://b",
            ScriptedReplicas::new(vec![
                ("http://a", flip(100.0, 150.0, 100)),
                ("http://b", flip(100.0, 150.0, 4000)),
            ]),
            ConvergencePolicy::All,
        );

        let outcome = poller.poll(1, Some(100.0), Instant::now()).await;
        assert_eq!(outcome.state, PollState::Converged);
        assert!(outcome.delay >= Duration::from_millis(4000));
        assert!(outcome.delay < Duration::from_millis(4050));

        // Replica a stops being polled once it has shown the new value.
        let reads_of_a = transport
            .reads
            .lock()
            .iter()
            .filter(|(url, _)| url.starts_with("http://a"))
            .count();
        assert_eq!(reads_of_a, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_policy_times_out_when_one_replica_lags() {
        let (poller, _) = poller(
            "http://a,http://b",
            ScriptedReplicas::new(vec![
                ("http://a", flip(100.0, 150.0, 0)),
                ("http://b", flip(100.0, 150.0, 9000)),
            ]),
            ConvergencePolicy::All,
        );

        let outcome = poller.poll(1, Some(100.0), Instant::now()).await;
        assert_eq!(outcome.state, PollState::TimedOut);
        assert_eq!(outcome.delay, Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_replicas_do_not_abort() {
        let (poller, _) = poller(
            "http://down,http://broken,http://garbage,http://a",
            ScriptedReplicas::new(vec![
                ("http://down", ReplicaScript::Down),
                ("http://broken", ReplicaScript::Status(503)),
                ("http://garbage", ReplicaScript::Garbage),
                ("http://a", flip(100.0, 150.0, 200)),
            ]),
            ConvergencePolicy::Any,
        );

        let outcome = poller.poll(1, Some(100.0), Instant::now()).await;
        assert_eq!(outcome.state, PollState::Converged);
        assert!(outcome.delay >= Duration::from_millis(200));

        assert_eq!(poller.read_price("http://down", 1).await, None);
        assert_eq!(poller.read_price("http://broken", 1).await, None);
        assert_eq!(poller.read_price("http://garbage", 1).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reads_are_cut_at_deadline() {
        let (poller, _) = poller(
            "http://a",
            ScriptedReplicas::new(vec![("http://a", flip(100.0, 150.0, 0))])
                .with_latency(Duration::from_secs(30)),
            ConvergencePolicy::Any,
        );

        let started = Instant::now();
        let outcome = poller.poll(1, Some(100.0), started).await;
        assert_eq!(outcome.state, PollState::TimedOut);
        assert_eq!(outcome.delay, Duration::from_millis(5000));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("ANY".parse::<ConvergencePolicy>().unwrap(), ConvergencePolicy::Any);
        assert_eq!(" all ".parse::<ConvergencePolicy>().unwrap(), ConvergencePolicy::All);
        assert!("most".parse::<ConvergencePolicy>().is_err());
        assert_eq!(ConvergencePolicy::default().to_string(), "any");
    }
}
