//! Probe subject selection

use crate::wire::ProductId;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How each iteration chooses the product it writes and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectStrategy {
    /// Every iteration uses the same product (maximum contention).
    Fixed(ProductId),

    /// Uniformly random product in `[min, max]`.
    Random { min: ProductId, max: ProductId },

    /// Each worker owns `base + worker_id % spread`, so concurrent workers
    /// do not write the same product.
    PerWorker { base: ProductId, spread: u64 },
}

impl SubjectStrategy {
    /// Choose the subject for one iteration.
    pub fn pick(&self, worker_id: usize, _iteration: u64) -> ProductId {
        match *self {
            Self::Fixed(id) => id,
            Self::Random { min, max } => {
                let (low, high) = if min <= max { (min, max) } else { (max, min) };
                rand::thread_rng().gen_range(low..=high)
            }
            Self::PerWorker { base, spread } => {
                base.saturating_add(worker_id as u64 % spread.max(1))
            }
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Fixed(id) => format!("fixed product {}", id),
            Self::Random { min, max } => format!("random product {}..={}", min, max),
            Self::PerWorker { base, spread } => {
                format!("per-worker products {}..{}", base, base.saturating_add(*spread))
            }
        }
    }
}

impl Default for SubjectStrategy {
    fn default() -> Self {
        Self::Fixed(9999)
    }
}
