//! Consume loop state and counters

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Where the consume loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Not started
    Idle = 0,
    /// Waiting for the next record
    Polling = 1,
    /// Decoding and running a handler
    Dispatching = 2,
    /// Committing an offset
    Committing = 3,
    /// Publishing to the dead-letter topic
    DeadLettering = 4,
    /// Terminal
    Stopped = 5,
}

impl LoopState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LoopState::Idle,
            1 => LoopState::Polling,
            2 => LoopState::Dispatching,
            3 => LoopState::Committing,
            4 => LoopState::DeadLettering,
            _ => LoopState::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Polling => "polling",
            LoopState::Dispatching => "dispatching",
            LoopState::Committing => "committing",
            LoopState::DeadLettering => "dead-lettering",
            LoopState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared, lock-free view of the loop state
#[derive(Debug, Clone)]
pub struct LoopStatus {
    state: Arc<AtomicU8>,
}

impl LoopStatus {
    /// Create a status in [`LoopState::Idle`]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(LoopState::Idle as u8)),
        }
    }

    /// Current state
    pub fn get(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Once stopped the status never changes again.
    pub fn set(&self, next: LoopState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != LoopState::Stopped as u8).then_some(next as u8)
            });
    }

    /// Whether the loop has reached its terminal state
    pub fn is_stopped(&self) -> bool {
        self.get() == LoopState::Stopped
    }
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-consumer counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    committed: AtomicU64,
    succeeded: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    unroutable: AtomicU64,
    duplicates: AtomicU64,
    retries: AtomicU64,
    transport_errors: AtomicU64,
}

impl ConsumerStats {
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, attempts: u32) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_retries(attempts);
    }

    pub(crate) fn record_dead_lettered(&self, attempts: u32) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.record_retries(attempts);
    }

    pub(crate) fn record_dropped(&self, attempts: u32) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.record_retries(attempts);
    }

    pub(crate) fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retries(&self, attempts: u32) {
        let retries = attempts.saturating_sub(1) as u64;
        if retries > 0 {
            self.retries.fetch_add(retries, Ordering::Relaxed);
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Records pulled from the wire
    pub received: u64,
    /// Offsets committed
    pub committed: u64,
    /// Handlers that completed
    pub succeeded: u64,
    /// Messages published to the dead-letter topic
    pub dead_lettered: u64,
    /// Exhausted messages dropped because no dead-letter topic is configured or publishing failed
    pub dropped: u64,
    /// Records on topics with no route
    pub unroutable: u64,
    /// Records skipped by the inbox
    pub duplicates: u64,
    /// Retries performed across all messages
    pub retries: u64,
    /// Transient transport errors seen while polling
    pub transport_errors: u64,
}
