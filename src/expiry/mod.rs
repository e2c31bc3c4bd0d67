//! Expiry consumer: applies `segment_expiry` instructions.
//!
//! Instructions are read sequentially from a single partition. A due
//! instruction removes the membership and appends a `DELETE` history entry;
//! one that is not yet due goes into the durable expiry schedule, which is
//! swept on every poll interval.

mod consumer;

pub use consumer::{ExpiryCollaborators, ExpiryConsumer};

/// What happened to one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The membership row was deleted and history recorded.
    Removed,
    /// Nothing to delete (already gone, or the segment no longer exists).
    Absent,
    /// Row kept: permanent, or re-added with a later ttl.
    Superseded,
    /// Not yet due; stored in the schedule.
    Deferred,
    /// Undecodable payload; skipped.
    Malformed,
    /// Storage error; logged.
    Failed,
}

/// Outcome counters for a consumer run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub removed: u64,
    pub absent: u64,
    pub superseded: u64,
    pub deferred: u64,
    pub malformed: u64,
    pub failed: u64,
    /// Scheduled instructions completed by sweeps.
    pub swept: u64,
}

impl ConsumerStats {
    pub fn record(&mut self, outcome: ExpiryOutcome) {
        match outcome {
            ExpiryOutcome::Removed => self.removed += 1,
            ExpiryOutcome::Absent => self.absent += 1,
            ExpiryOutcome::Superseded => self.superseded += 1,
            ExpiryOutcome::Deferred => self.deferred += 1,
            ExpiryOutcome::Malformed => self.malformed += 1,
            ExpiryOutcome::Failed => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &ConsumerStats) {
        self.received += other.received;
        self.removed += other.removed;
        self.absent += other.absent;
        self.superseded += other.superseded;
        self.deferred += other.deferred;
        self.malformed += other.malformed;
        self.failed += other.failed;
        self.swept += other.swept;
    }
}
