//! Narrow capability interfaces between the mutation pipeline and storage.
//!
//! The transaction manager and the expiry consumer only see these traits, so
//! each collaborator can be swapped for a fake in tests. [`crate::db::Database`]
//! implements all of them on top of SQLite.

use crate::error::{CohortError, Result};
use crate::events::{ExpiryInstruction, OutboundMessage};
use crate::types::{HistoryEntry, Membership, SegmentId, Slug, Timestamp, UserId};

/// Can check whether a subject exists.
pub trait SubjectDirectory: Send + Sync {
    fn subject_exists(&self, user_id: UserId) -> Result<bool>;
}

/// Per-slug outcome of a segment lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: Vec<(Slug, SegmentId)>,
    pub missing: Vec<Slug>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Ids in request order, or `SegmentNotFound` naming every miss.
    pub fn into_ids(self) -> Result<Vec<SegmentId>> {
        if !self.missing.is_empty() {
            return Err(CohortError::SegmentNotFound(self.missing));
        }
        Ok(self.resolved.into_iter().map(|(_, id)| id).collect())
    }
}

/// Can map slugs to segment ids.
pub trait SegmentResolver: Send + Sync {
    /// Look up every slug, reporting hits and misses separately.
    fn lookup(&self, slugs: &[Slug]) -> Result<Resolution>;

    /// Resolve all slugs or fail; never returns a shorter id list.
    fn resolve_many(&self, slugs: &[Slug]) -> Result<Vec<SegmentId>> {
        if slugs.is_empty() {
            return Ok(Vec::new());
        }
        self.lookup(slugs)?.into_ids()
    }

    fn resolve_one(&self, slug: &Slug) -> Result<SegmentId> {
        let ids = self.resolve_many(std::slice::from_ref(slug))?;
        ids.into_iter()
            .next()
            .ok_or_else(|| CohortError::SegmentNotFound(vec![slug.clone()]))
    }
}

/// One atomic membership mutation.
#[derive(Clone, Debug, Default)]
pub struct MembershipBatch {
    pub user_id: UserId,
    /// Upserted in order, each with `ttl`.
    pub upserts: Vec<SegmentId>,
    pub ttl: Option<Timestamp>,
    /// Deleted after the upserts.
    pub deletes: Vec<SegmentId>,
    /// Outbound messages committed in the same transaction.
    pub outbox: Vec<OutboundMessage>,
}

/// Condition under which a membership row may be removed by expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalGuard {
    /// Remove the row if it carries any ttl.
    TimeBounded,
    /// Remove the row only if its ttl is at or before this deadline.
    ExpiringBy(Timestamp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    Absent,
    /// Row kept: permanent, or the guard did not match.
    Superseded,
}

/// Durable (subject, segment, ttl) rows.
pub trait MembershipStore: Send + Sync {
    /// Apply upserts, then deletes, then outbox inserts, in one transaction.
    fn apply(&self, batch: &MembershipBatch) -> Result<()>;

    fn memberships_of(&self, user_id: UserId) -> Result<Vec<Membership>>;

    fn remove_membership(
        &self,
        user_id: UserId,
        segment_id: SegmentId,
        guard: RemovalGuard,
    ) -> Result<RemovalOutcome>;
}

/// Can append and read history.
pub trait HistoryRecorder: Send + Sync {
    /// Append an entry; returns its row id.
    fn record(&self, entry: &HistoryEntry) -> Result<i64>;

    /// Entries with `start <= operation_date <= end`, oldest first.
    fn query_range(&self, user_id: UserId, start: Timestamp, end: Timestamp)
        -> Result<Vec<HistoryEntry>>;
}

/// A committed-but-maybe-unsent outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEvent {
    pub seq: i64,
    pub message: OutboundMessage,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
}

pub trait OutboxStore: Send + Sync {
    /// Unsent, non-dead-lettered events in sequence order.
    fn pending(&self, limit: usize) -> Result<Vec<OutboxEvent>>;
    fn mark_sent(&self, seq: i64) -> Result<()>;
    /// Bump the attempt counter; returns the new count.
    fn record_failure(&self, seq: i64, error: &str) -> Result<u32>;
    fn mark_dead_letter(&self, seq: i64) -> Result<()>;
    /// Delete events sent at or before `before`; returns how many.
    fn prune_sent(&self, before: Timestamp) -> Result<usize>;
}

/// Time-ordered durable store of not-yet-due expiry instructions.
pub trait ExpirySchedule: Send + Sync {
    fn defer(&self, instruction: &ExpiryInstruction) -> Result<()>;
    /// Instructions with `ttl <= now`, earliest first.
    fn due(&self, now: Timestamp, limit: usize) -> Result<Vec<ExpiryInstruction>>;
    fn complete(&self, instruction: &ExpiryInstruction) -> Result<()>;
}

/// Committed read positions of broker consumers.
pub trait OffsetStore: Send + Sync {
    /// Next offset to read, if one was ever committed.
    fn committed(&self, topic: &str, partition: u32) -> Result<Option<u64>>;
    fn commit(&self, topic: &str, partition: u32, next_offset: u64) -> Result<()>;
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<(&'static str, i64)>);

    impl SegmentResolver for Fixed {
        fn lookup(&self, slugs: &[Slug]) -> Result<Resolution> {
            let mut resolution = Resolution::default();
            for slug in slugs {
                match self.0.iter().find(|(s, _)| *s == slug.as_str()) {
                    Some((_, id)) => resolution.resolved.push((slug.clone(), SegmentId(*id))),
                    None => resolution.missing.push(slug.clone()),
                }
            }
            Ok(resolution)
        }
    }

    #[test]
    fn test_resolve_many_fails_closed() {
        let resolver = Fixed(vec![("A", 1), ("B", 2)]);
        let slugs = [Slug::from("A"), Slug::from("X"), Slug::from("B"), Slug::from("Y")];

        match resolver.resolve_many(&slugs) {
            Err(CohortError::SegmentNotFound(missing)) => {
                assert_eq!(missing, vec![Slug::from("X"), Slug::from("Y")]);
            }
            other => panic!("expected SegmentNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_preserves_order() {
        let resolver = Fixed(vec![("A", 1), ("B", 2)]);
        let ids = resolver
            .resolve_many(&[Slug::from("B"), Slug::from("A")])
            .unwrap();
        assert_eq!(ids, vec![SegmentId(2), SegmentId(1)]);
        assert!(resolver.resolve_many(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_one() {
        let resolver = Fixed(vec![("A", 1)]);
        assert_eq!(resolver.resolve_one(&Slug::from("A")).unwrap(), SegmentId(1));
        assert!(matches!(
            resolver.resolve_one(&Slug::from("Z")),
            Err(CohortError::SegmentNotFound(_))
        ));
    }
}
