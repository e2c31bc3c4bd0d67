use crate::capabilities::{
    HistoryRecorder, MembershipBatch, MembershipStore, SegmentResolver, SubjectDirectory,
};
use crate::config::DeliveryMode;
use crate::error::{CohortError, PostCommitStage, Result};
use crate::events::{notifications_for, EventPublisher, Notification};
use crate::types::{HistoryEntry, MembershipChange, Operation, SegmentId, Slug};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Everything the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub subjects: Arc<dyn SubjectDirectory>,
    pub segments: Arc<dyn SegmentResolver>,
    pub store: Arc<dyn MembershipStore>,
    pub history: Arc<dyn HistoryRecorder>,
    pub publisher: Arc<dyn EventPublisher>,
}

pub struct MembershipManager {
    deps: Collaborators,
    delivery: DeliveryMode,
}

impl MembershipManager {
    pub fn new(deps: Collaborators, delivery: DeliveryMode) -> Self {
        Self { deps, delivery }
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Apply an add/delete change for one subject.
    ///
    /// A slug in both sets is added and then deleted, so it ends up absent;
    /// history and events show the add followed by the delete.
    #[tracing::instrument(
        level = "debug",
        skip(self, change),
        fields(user_id = change.user_id.0, add = change.add.len(), delete = change.delete.len())
    )]
    pub fn apply_change(&self, change: &MembershipChange) -> Result<()> {
        if !self.deps.subjects.subject_exists(change.user_id)? {
            return Err(CohortError::SubjectNotFound(change.user_id));
        }
        if change.is_noop() {
            debug!("empty change");
            return Ok(());
        }

        let (upserts, deletes) = self.resolve(&change.add, &change.delete)?;
        let notifications = notifications_for(change);

        let outbox = match self.delivery {
            DeliveryMode::Outbox => notifications
                .iter()
                .map(Notification::to_message)
                .collect::<Result<Vec<_>>>()?,
            DeliveryMode::Immediate => Vec::new(),
        };

        self.deps.store.apply(&MembershipBatch {
            user_id: change.user_id,
            upserts,
            ttl: change.ttl,
            deletes,
            outbox,
        })?;
        info!(
            user_id = change.user_id.0,
            added = change.add.len(),
            deleted = change.delete.len(),
            "membership change committed"
        );

        let history = self.record_history(change);
        let published = match self.delivery {
            DeliveryMode::Immediate => self.publish(&notifications),
            DeliveryMode::Outbox => Ok(()),
        };

        history.map_err(|e| CohortError::post_commit(PostCommitStage::History, e))?;
        published.map_err(|e| CohortError::post_commit(PostCommitStage::Publish, e))
    }

    /// Resolve both sides, reporting every missing slug at once.
    fn resolve(&self, add: &[Slug], delete: &[Slug]) -> Result<(Vec<SegmentId>, Vec<SegmentId>)> {
        let mut missing = Vec::new();
        let mut ids = |slugs: &[Slug]| -> Result<Vec<SegmentId>> {
            if slugs.is_empty() {
                return Ok(Vec::new());
            }
            let resolution = self.deps.segments.lookup(slugs)?;
            missing.extend(resolution.missing);
            Ok(resolution.resolved.into_iter().map(|(_, id)| id).collect())
        };

        let upserts = ids(add)?;
        let deletes = ids(delete)?;

        if !missing.is_empty() {
            return Err(CohortError::SegmentNotFound(missing));
        }
        Ok((upserts, deletes))
    }

    /// One entry per slug. Every entry is attempted; the first error wins.
    fn record_history(&self, change: &MembershipChange) -> Result<()> {
        let entries = change
            .add
            .iter()
            .map(|slug| (slug, Operation::Add))
            .chain(change.delete.iter().map(|slug| (slug, Operation::Delete)));

        let mut first_error = None;
        for (slug, operation) in entries {
            let entry = HistoryEntry::now(change.user_id, slug.clone(), operation);
            if let Err(e) = self.deps.history.record(&entry) {
                error!(
                    user_id = change.user_id.0,
                    segment = %slug,
                    operation = %operation,
                    error = %e,
                    "history write failed"
                );
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Publish in order, stopping at the first failure so a subject's
    /// events are never sent out of order.
    fn publish(&self, notifications: &[Notification]) -> Result<()> {
        for notification in notifications {
            if let Err(e) = self.deps.publisher.publish(notification) {
                error!(user_id = notification.user_id().0, error = %e, "event publish failed");
                return Err(e);
            }
        }
        Ok(())
    }
}
