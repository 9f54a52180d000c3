//! In-order offset tracking for concurrent dispatch
//!
//! Messages on one partition may settle out of order when several are in
//! flight. Committing a later offset acknowledges every earlier one, so the
//! tracker only releases the highest offset below which everything settled.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Pending offsets per topic and partition
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<(String, i32), BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a polled offset as in flight
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Mark `offset` settled.
    ///
    /// Returns the offset to commit when the settled prefix of the partition
    /// grew, `None` while an earlier offset is still in flight.
    pub fn settle(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let key = (topic.to_string(), partition);
        let pending = self.partitions.get_mut(&key)?;

        match pending.get_mut(&offset) {
            Some(settled) => *settled = true,
            None => {
                debug!("Offset {} on {}[{}] was never tracked", offset, topic, partition);
                return None;
            }
        }

        let mut watermark = None;
        while let Some(entry) = pending.first_entry() {
            if !*entry.get() {
                break;
            }
            watermark = Some(entry.remove_entry().0);
        }

        if pending.is_empty() {
            self.partitions.remove(&key);
        }
        watermark
    }

    /// Offsets tracked but not yet released
    pub fn pending(&self) -> usize {
        self.partitions.values().map(BTreeMap::len).sum()
    }
}
