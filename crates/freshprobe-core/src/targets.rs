//! Resolution of the configured replica endpoints.

use std::sync::Arc;

/// Endpoint used when nothing is configured.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// Ordered, de-duplicated set of replica base addresses.
///
/// Built once at start and shared read-only by every worker. Order only
/// matters for round-robin write placement and poll order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTargets {
    endpoints: Arc<[String]>,
}

impl ReplicaTargets {
    /// Resolve a single endpoint or a comma-delimited list.
    ///
    /// Entries are trimmed, trailing slashes dropped and duplicates removed
    /// keeping the first occurrence. Falls back to [`DEFAULT_ENDPOINT`] when
    /// the input is absent or yields no entries.
    pub fn resolve(raw: Option<&str>) -> Self {
        let mut endpoints: Vec<String> = Vec::new();

        for entry in raw.unwrap_or_default().split(',') {
            let entry = entry.trim().trim_end_matches('/');
            if entry.is_empty() || endpoints.iter().any(|known| known == entry) {
                continue;
            }
            endpoints.push(entry.to_string());
        }

        if endpoints.is_empty() {
            endpoints.push(DEFAULT_ENDPOINT.to_string());
        }

        Self {
            endpoints: endpoints.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: resolution guarantees at least one endpoint.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(String::as_str)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.endpoints.get(index).map(String::as_str)
    }

    /// Endpoint receiving the write of a given worker iteration.
    ///
    /// Rotates with both the worker id and its iteration counter so that
    /// concurrent workers start on different endpoints.
    pub fn write_endpoint(&self, worker_id: usize, iteration: u64) -> &str {
        let len = self.endpoints.len() as u64;
        let index = (worker_id as u64 % len + iteration % len) % len;
        &self.endpoints[index as usize]
    }
}

impl Default for ReplicaTargets {
    fn default() -> Self {
        Self::resolve(None)
    }
}
