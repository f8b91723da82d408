//! HTTP transport seam
//!
//! The probe engine only needs GET and JSON POST. [`ReqwestTransport`] is
//! the production implementation; tests plug in scripted transports.
//! [`MeteredTransport`] wraps any transport and feeds request timings into
//! the run metrics.

use crate::error::{ProbeError, ProbeResult};
use crate::metrics::RunMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Status code and body of a completed request.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn anything but a 200 into [`ProbeError::Status`].
    pub fn require_ok(self, url: &str) -> ProbeResult<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(ProbeError::Status {
                url: url.to_string(),
                status: self.status,
            })
        }
    }
}

/// Minimal request surface used by probes and read benchmarks.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a GET request.
    async fn get(&self, url: &str) -> ProbeResult<HttpResponse>;

    /// Issue a POST request with a JSON body.
    async fn post_json(&self, url: &str, body: Vec<u8>) -> ProbeResult<HttpResponse>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn get(&self, url: &str) -> ProbeResult<HttpResponse> {
        (**self).get(url).await
    }

    async fn post_json(&self, url: &str, body: Vec<u8>) -> ProbeResult<HttpResponse> {
        (**self).post_json(url, body).await
    }
}

/// Pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with a per-request timeout and a connection pool sized
    /// for `max_idle_per_host` concurrent workers.
    pub fn new(request_timeout: Duration, max_idle_per_host: usize) -> ProbeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ProbeError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn finish(
        url: &str,
        started: Instant,
        result: reqwest::Result<reqwest::Response>,
    ) -> ProbeResult<HttpResponse> {
        let response = result.map_err(|e| ProbeError::transport(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ProbeError::transport(url, e))?;

        Ok(HttpResponse {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> ProbeResult<HttpResponse> {
        let started = Instant::now();
        let result = self.client.get(url).send().await;
        Self::finish(url, started, result).await
    }

    async fn post_json(&self, url: &str, body: Vec<u8>) -> ProbeResult<HttpResponse> {
        let started = Instant::now();
        let result = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        Self::finish(url, started, result).await
    }
}

/// Decorator that records every request into [`RunMetrics`].
///
/// A request counts as failed on transport error or a status of 400 and up.
/// A request whose future is dropped before it completes, such as a poll read
/// cut off at the deadline, counts as failed with the time spent so far.
pub struct MeteredTransport<T> {
    inner: T,
    metrics: Arc<RunMetrics>,
}

impl<T: HttpTransport> MeteredTransport<T> {
    pub fn new(inner: T, metrics: Arc<RunMetrics>) -> Self {
        Self { inner, metrics }
    }

    fn observe(&self, url: &str, started: Instant, result: &ProbeResult<HttpResponse>) {
        match result {
            Ok(response) => {
                debug!(
                    url,
                    status = response.status,
                    elapsed_ms = response.elapsed.as_millis() as u64,
                    "request complete"
                );
                self.metrics.record_http(response.elapsed, response.status >= 400);
            }
            Err(e) => {
                debug!(url, error = %e, "request failed");
                self.metrics.record_http(started.elapsed(), true);
            }
        }
    }
}

/// Records the request as failed if dropped while still armed.
struct InFlight<'a> {
    url: &'a str,
    started: Instant,
    metrics: &'a RunMetrics,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn start(url: &'a str, metrics: &'a RunMetrics) -> Self {
        Self {
            url,
            started: Instant::now(),
            metrics,
            armed: true,
        }
    }

    fn finish(mut self) -> Instant {
        self.armed = false;
        self.started
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(url = self.url, "request abandoned");
            self.metrics.record_http(self.started.elapsed(), true);
        }
    }
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for MeteredTransport<T> {
    async fn get(&self, url: &str) -> ProbeResult<HttpResponse> {
        let in_flight = InFlight::start(url, &self.metrics);
        let result = self.inner.get(url).await;
        self.observe(url, in_flight.finish(), &result);
        result
    }

    async fn post_json(&self, url: &str, body: Vec<u8>) -> ProbeResult<HttpResponse> {
        let in_flight = InFlight::start(url, &self.metrics);
        let result = self.inner.post_json(url, body).await;
        self.observe(url, in_flight.finish(), &result);
        result
    }
}
