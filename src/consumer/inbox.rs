//! Idempotency inbox keyed by message id
//!
//! Redelivery is expected under at-least-once semantics. An inbox lets the
//! loop skip messages it has already processed.
//!
//! [`MemoryInbox`] forgets finished records after a retention period. A
//! duplicate arriving later than that is processed again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::consumer::error::ConsumerResult;

/// Result of trying to claim a message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxAcquire {
    /// Caller owns the message and should process it
    Acquired,
    /// The message was processed before
    AlreadyProcessed,
    /// Another worker holds the message
    Locked,
}

/// Processing status of an inbox record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    /// Claimed, not finished
    Processing,
    /// Finished successfully
    Processed,
    /// Gave up
    Failed,
}

/// Idempotency store consulted before a handler runs
#[async_trait]
pub trait Inbox: Send + Sync + 'static {
    /// Claim `message_id` for processing
    async fn try_acquire(&self, message_id: &str) -> ConsumerResult<InboxAcquire>;

    /// Record a successful run
    async fn mark_processed(&self, message_id: &str) -> ConsumerResult<()>;

    /// Record a failed run
    async fn mark_failed(&self, message_id: &str, reason: &str) -> ConsumerResult<()>;
}

/// Inbox that never deduplicates
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpInbox;

#[async_trait]
impl Inbox for NoOpInbox {
    async fn try_acquire(&self, _message_id: &str) -> ConsumerResult<InboxAcquire> {
        Ok(InboxAcquire::Acquired)
    }

    async fn mark_processed(&self, _message_id: &str) -> ConsumerResult<()> {
        Ok(())
    }

    async fn mark_failed(&self, _message_id: &str, _reason: &str) -> ConsumerResult<()> {
        Ok(())
    }
}

/// One tracked message
#[derive(Debug, Clone)]
pub struct InboxRecord {
    /// Current status
    pub status: InboxStatus,
    /// When the id was first claimed
    pub first_seen_at: DateTime<Utc>,
    /// Claim expiry for records in [`InboxStatus::Processing`]
    pub lock_until: DateTime<Utc>,
    /// Times the id was claimed
    pub attempts: u32,
    /// When processing finished successfully
    pub processed_at: Option<DateTime<Utc>>,
    /// When processing last gave up
    pub failed_at: Option<DateTime<Utc>>,
    /// Last failure reason
    pub last_error: Option<String>,
}

impl InboxRecord {
    /// When the record reached a terminal status
    fn settled_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            InboxStatus::Processing => None,
            InboxStatus::Processed => self.processed_at,
            InboxStatus::Failed => self.failed_at,
        }
    }
}

/// Default time finished records are remembered
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound between two eviction sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process inbox; failed messages may be claimed again
#[derive(Debug)]
pub struct MemoryInbox {
    records: DashMap<String, InboxRecord>,
    lock_ttl: chrono::Duration,
    retention: chrono::Duration,
    next_sweep_ms: AtomicI64,
}

impl MemoryInbox {
    /// Create an inbox whose claims expire after `lock_ttl`
    pub fn new(lock_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            lock_ttl: to_chrono(lock_ttl),
            retention: to_chrono(DEFAULT_RETENTION),
            next_sweep_ms: AtomicI64::new(0),
        }
    }

    /// Forget processed and failed records after `retention`
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = to_chrono(retention);
        self
    }

    /// Drop finished records older than the retention period, returning how many went
    pub fn evict_expired(&self) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.retention) else {
            return 0;
        };

        let before = self.records.len();
        self.records
            .retain(|_, record| record.settled_at().map_or(true, |at| at > cutoff));
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            debug!("Evicted {} inbox records settled before {}", evicted, cutoff);
        }
        evicted
    }

    /// Sweep when the previous sweep is older than the sweep interval
    fn maybe_evict(&self, now: DateTime<Utc>) {
        let now_ms = now.timestamp_millis();
        let due = self.next_sweep_ms.load(Ordering::Acquire);
        if now_ms < due {
            return;
        }

        let interval = self
            .retention
            .min(to_chrono(MAX_SWEEP_INTERVAL))
            .num_milliseconds();
        let next = now_ms.saturating_add(interval);
        if self
            .next_sweep_ms
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.evict_expired();
        }
    }

    /// Snapshot of one record
    pub fn record(&self, message_id: &str) -> Option<InboxRecord> {
        self.records.get(message_id).map(|r| r.value().clone())
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lock_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.lock_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

impl Default for MemoryInbox {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Inbox for MemoryInbox {
    async fn try_acquire(&self, message_id: &str) -> ConsumerResult<InboxAcquire> {
        let now = Utc::now();
        self.maybe_evict(now);
        let lock_until = self.lock_deadline(now);

        match self.records.entry(message_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(InboxRecord {
                    status: InboxStatus::Processing,
                    first_seen_at: now,
                    lock_until,
                    attempts: 1,
                    processed_at: None,
                    failed_at: None,
                    last_error: None,
                });
                Ok(InboxAcquire::Acquired)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                match record.status {
                    InboxStatus::Processed => Ok(InboxAcquire::AlreadyProcessed),
                    InboxStatus::Processing if record.lock_until > now => {
                        debug!("Inbox record {} is locked until {}", message_id, record.lock_until);
                        Ok(InboxAcquire::Locked)
                    }
                    _ => {
                        record.status = InboxStatus::Processing;
                        record.lock_until = lock_until;
                        record.attempts += 1;
                        Ok(InboxAcquire::Acquired)
                    }
                }
            }
        }
    }

    async fn mark_processed(&self, message_id: &str) -> ConsumerResult<()> {
        if let Some(mut record) = self.records.get_mut(message_id) {
            record.status = InboxStatus::Processed;
            record.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: &str, reason: &str) -> ConsumerResult<()> {
        if let Some(mut record) = self.records.get_mut(message_id) {
            record.status = InboxStatus::Failed;
            record.failed_at = Some(Utc::now());
            record.last_error = Some(reason.to_string());
        }
        Ok(())
    }
}
