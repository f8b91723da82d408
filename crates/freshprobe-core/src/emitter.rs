//! Write emitter: one randomized price adjustment per iteration.

use crate::targets::ReplicaTargets;
use crate::transport::HttpTransport;
use crate::wire::{AdjustmentGenerator, ProductId, Route};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of the single write issued by an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub endpoint: String,
    /// Response status, `None` when no response arrived.
    pub status: Option<u16>,
}

impl WriteOutcome {
    /// The write check passes only on status 200.
    pub fn ok(&self) -> bool {
        self.status == Some(200)
    }
}

/// Issues adjustment writes against round-robin chosen endpoints.
pub struct WriteEmitter<T> {
    targets: ReplicaTargets,
    generator: AdjustmentGenerator,
    transport: Arc<T>,
}

impl<T: HttpTransport> WriteEmitter<T> {
    pub fn new(targets: ReplicaTargets, generator: AdjustmentGenerator, transport: Arc<T>) -> Self {
        Self {
            targets,
            generator,
            transport,
        }
    }

    /// Send one write for `product_id`.
    ///
    /// Never fails: a transport error or unexpected status is reported in
    /// the outcome and the caller proceeds to poll regardless.
    pub async fn emit(
        &self,
        worker_id: usize,
        iteration: u64,
        product_id: ProductId,
    ) -> WriteOutcome {
        let endpoint = self.targets.write_endpoint(worker_id, iteration).to_string();
        let url = Route::Adjustments.url(&endpoint, product_id);

        let body = self.generator.body(&mut rand::thread_rng());
        let body = match body.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to encode adjustment body");
                return WriteOutcome {
                    endpoint,
                    status: None,
                };
            }
        };

        let status = match self.transport.post_json(&url, body).await {
            Ok(response) => Some(response.status),
            Err(e) => {
                warn!(url = %url, error = %e, "write failed");
                None
            }
        };

        let outcome = WriteOutcome { endpoint, status };
        if outcome.ok() {
            debug!(url = %url, "write accepted");
        } else if let Some(status) = outcome.status {
            warn!(url = %url, status, "write rejected");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProbeError, ProbeResult};
    use crate::transport::HttpResponse;
    use crate::wire::{AdjustmentBody, AdjustmentMode};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        status: Option<u16>,
        posts: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn get(&self, url: &str) -> ProbeResult<HttpResponse> {
            Err(ProbeError::transport(url, "unexpected read"))
        }

        async fn post_json(&self, url: &str, body: Vec<u8>) -> ProbeResult<HttpResponse> {
            self.posts.lock().push((url.to_string(), body));
            match self.status {
                Some(status) => Ok(HttpResponse {
                    status,
                    body: Bytes::new(),
                    elapsed: Duration::from_millis(1),
                }),
                None => Err(ProbeError::transport(url, "connection refused")),
            }
        }
    }

    fn emitter(
        endpoints: &str,
        status: Option<u16>,
    ) -> (WriteEmitter<RecordingTransport>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport {
            status,
            ..Default::default()
        });
        let emitter = WriteEmitter::new(
            ReplicaTargets::resolve(Some(endpoints)),
            AdjustmentGenerator::new("PROMO", AdjustmentMode::Absolute, 1, 10, 1),
            Arc::clone(&transport),
        );
        (emitter, transport)
    }

    #[tokio::test]
    async fn test_emit_posts_adjustment() {
        let (emitter, transport) = emitter("http://a:8080", Some(200));

        let outcome = emitter.emit(0, 0, 9999).await;
        assert!(outcome.ok());
        assert_eq!(outcome.endpoint, "http://a:8080");

        let posts = transport.posts.lock();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "http://a:8080/admin/price/9999/adjustments");

        let body: AdjustmentBody = serde_json::from_slice(&posts[0].1).unwrap();
        match body {
            AdjustmentBody::Single(adjustment) => {
                assert_eq!(adjustment.kind, "PROMO");
                assert!((1.0..=10.0).contains(&adjustment.value));
            }
            AdjustmentBody::Batch(_) => panic!("expected a single adjustment"),
        }
    }

    #[tokio::test]
    async fn test_emit_rotates_endpoints() {
        let (emitter, transport) = emitter("http://a,http://b", Some(200));

        for iteration in 0..4 {
            emitter.emit(0, iteration, 1).await;
        }

        let urls: Vec<String> = transport.posts.lock().iter().map(|(url, _)| url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                "http://a/admin/price/1/adjustments",
                "http://b/admin/price/1/adjustments",
                "http://a/admin/price/1/adjustments",
                "http://b/admin/price/1/adjustments",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_writes_are_reported_not_raised() {
        let (rejecting, _) = emitter("http://a", Some(500));
        let outcome = rejecting.emit(0, 0, 1).await;
        assert!(!outcome.ok());
        assert_eq!(outcome.status, Some(500));

        let (refusing, _) = emitter("http://a", None);
        let outcome = refusing.emit(0, 0, 1).await;
        assert!(!outcome.ok());
        assert_eq!(outcome.status, None);
    }
}
