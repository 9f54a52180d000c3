//! Concurrency governor bounding in-flight handler executions

use crate::consumer::error::{ConsumerError, ConsumerResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on concurrently processed messages
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Counting semaphore limiting how many messages are processed at once
#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    /// Maximum number of inflight messages
    max_inflight: usize,
    /// Current inflight count
    inflight_count: Arc<AtomicUsize>,
    /// Semaphore for limiting concurrency
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGovernor {
    /// Create a governor with `max_inflight` processing slots
    pub fn new(max_inflight: usize) -> Self {
        Self {
            max_inflight,
            inflight_count: Arc::new(AtomicUsize::new(0)),
            semaphore: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Wait for a free slot, giving up when `cancel` fires
    pub async fn acquire(&self, cancel: &CancellationToken) -> ConsumerResult<BackpressurePermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConsumerError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| ConsumerError::TransportFault("concurrency governor closed".to_string()))?,
        };

        let count = self.inflight_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Acquired permit, inflight: {}/{}", count, self.max_inflight);

        Ok(BackpressurePermit {
            inflight_count: self.inflight_count.clone(),
            _permit: permit,
        })
    }

    /// Messages currently holding a slot
    pub fn inflight(&self) -> usize {
        self.inflight_count.load(Ordering::Acquire)
    }
}

/// A processing slot, released on drop
#[derive(Debug)]
pub struct BackpressurePermit {
    inflight_count: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BackpressurePermit {
    fn drop(&mut self) {
        self.inflight_count.fetch_sub(1, Ordering::AcqRel);
    }
}
