use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent outbound synthesis calls per process,
/// chosen to stay under the remote service's global session quota when
/// split across worker processes.
pub const DEFAULT_CONCURRENT_SYNTHESES: usize = 3;

/// Bounded gate for concurrent outbound synthesis calls.
///
/// Independent of the task monitor's idempotency check: that prevents
/// duplicate work, this prevents excessive concurrent work. The permit is
/// held across the whole remote round-trip and released on drop, so a
/// failing synthesis can never leak a slot.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// RAII slot handle; dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Block until a slot is free.
    pub async fn acquire(&self) -> AdmissionPermit {
        // The semaphore is never closed while the gate is alive.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("admission gate semaphore closed");
        tracing::debug!(
            available = self.permits.available_permits(),
            limit = self.limit,
            "admission slot acquired"
        );
        AdmissionPermit { _permit: permit }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENT_SYNTHESES)
    }
}
