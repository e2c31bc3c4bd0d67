//! `Cohort`: the composition root tying storage, broker and workers together.

use crate::broker::{LocalBroker, MessageBroker, PartitionConsumer};
use crate::capabilities::{HistoryRecorder, MembershipStore, SubjectDirectory};
use crate::config::{CohortConfig, DeliveryMode};
use crate::db::Database;
use crate::error::{CohortError, Result};
use crate::events::{
    BrokerPublisher, DispatchStats, OutboxDispatcher, RetryPolicy, CHANGES_TOPIC, EXPIRY_TOPIC,
};
use crate::expiry::{ConsumerStats, ExpiryCollaborators, ExpiryConsumer};
use crate::membership::{Collaborators, MembershipManager};
use crate::types::{
    month_range, ChangeRequest, HistoryEntry, Membership, MembershipChange, SegmentId, Slug,
    Timestamp, UserId, UserSegments,
};
use crate::worker::WorkerHandle;
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Magic bytes for the data directory manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"CHT\0";

/// Current data directory format version.
const MANIFEST_VERSION: u8 = 1;

/// The expiry topic always has exactly one partition.
const EXPIRY_PARTITION: u32 = 0;

/// A membership store with change propagation and TTL expiry.
///
/// Owns the data directory exclusively:
/// - `cohort.db`: memberships, history, outbox, expiry schedule
/// - `broker/`: topic partition logs
/// - `LOCK`, `MANIFEST`
pub struct Cohort {
    config: CohortConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    db: Arc<Database>,
    broker: Arc<LocalBroker>,
    manager: MembershipManager,
    expiry: ExpiryConsumer,
}

impl Cohort {
    /// Open the data directory, creating it when allowed.
    pub fn open(config: CohortConfig) -> Result<Self> {
        let path = config.path.clone();
        if !path.join("MANIFEST").exists() {
            if !config.create_if_missing {
                return Err(CohortError::NotInitialized);
            }
            fs::create_dir_all(&path)?;
        }

        // The manifest is only read or written under the lock.
        let lock_file = acquire_lock(&path)?;
        if path.join("MANIFEST").exists() {
            verify_manifest(&path)?;
        } else if config.create_if_missing {
            write_manifest(&path)?;
        } else {
            return Err(CohortError::NotInitialized);
        }

        let db = Arc::new(Database::open(path.join("cohort.db"), &config.database)?);
        let broker = Arc::new(LocalBroker::open(path.join("broker"), config.broker.clone())?);
        broker.create_topic(CHANGES_TOPIC, config.broker.partitions)?;
        broker.create_topic(EXPIRY_TOPIC, 1)?;

        let publisher = Arc::new(BrokerPublisher::new(
            broker.clone(),
            RetryPolicy::from(&config.publisher),
        ));
        let manager = MembershipManager::new(
            Collaborators {
                subjects: db.clone(),
                segments: db.clone(),
                store: db.clone(),
                history: db.clone(),
                publisher,
            },
            config.publisher.delivery,
        );
        let expiry = ExpiryConsumer::new(
            ExpiryCollaborators {
                segments: db.clone(),
                store: db.clone(),
                history: db.clone(),
                schedule: db.clone(),
                offsets: db.clone(),
            },
            config.expiry.clone(),
        );

        info!(
            path = %path.display(),
            delivery = ?config.publisher.delivery,
            partitions = config.broker.partitions,
            "cohort opened"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            db,
            broker,
            manager,
            expiry,
        })
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn broker(&self) -> &Arc<LocalBroker> {
        &self.broker
    }

    pub fn expiry_consumer(&self) -> &ExpiryConsumer {
        &self.expiry
    }

    /// Validate and apply an API mutation payload.
    ///
    /// A malformed ttl or blank slug is rejected before anything is read or
    /// written. See [`MembershipManager::apply_change`] for the rest.
    pub fn apply_change(&self, request: &ChangeRequest) -> Result<()> {
        let change = request.validate()?;
        self.manager.apply_change(&change)
    }

    /// Apply an already-validated change.
    pub fn apply(&self, change: &MembershipChange) -> Result<()> {
        self.manager.apply_change(change)
    }

    /// Current segments of a subject, by slug.
    pub fn user_segments(&self, user_id: UserId) -> Result<UserSegments> {
        let segments = self
            .memberships(user_id)?
            .into_iter()
            .map(|m| m.segment)
            .collect();
        Ok(UserSegments { user_id, segments })
    }

    /// Current memberships of a subject, with their ttl.
    pub fn memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        if !self.db.subject_exists(user_id)? {
            return Err(CohortError::SubjectNotFound(user_id));
        }
        self.db.memberships_of(user_id)
    }

    /// History of a subject with `start <= operation_date <= end`.
    pub fn history(
        &self,
        user_id: UserId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<HistoryEntry>> {
        if start > end {
            return Err(CohortError::InvalidRequest(format!(
                "history range starts after it ends ({start} > {end})"
            )));
        }
        self.db.query_range(user_id, start, end)
    }

    /// History of a subject for one calendar month, `YYYY-MM`.
    pub fn monthly_history(&self, user_id: UserId, month: &str) -> Result<Vec<HistoryEntry>> {
        let (start, end) = month_range(month)?;
        self.history(user_id, start, end)
    }

    pub fn register_user(&self, user_id: UserId, name: &str) -> Result<()> {
        self.db.insert_user(user_id, name)
    }

    pub fn register_segment(&self, slug: &str) -> Result<SegmentId> {
        let slug = Slug::from(slug);
        if slug.is_blank() {
            return Err(CohortError::InvalidRequest("blank segment slug".into()));
        }
        self.db.insert_segment(&slug)
    }

    /// Start the expiry consumer on its own thread. It resumes after the
    /// last committed offset, or from the oldest message on first start.
    pub fn spawn_expiry_consumer(&self) -> Result<WorkerHandle<ConsumerStats>> {
        let start = self.expiry.resume_from(EXPIRY_TOPIC, EXPIRY_PARTITION)?;
        let broker: Arc<dyn MessageBroker> = self.broker.clone();
        let mut partition = PartitionConsumer::new(broker, EXPIRY_TOPIC, EXPIRY_PARTITION, start)?;
        let consumer = self.expiry.clone();

        WorkerHandle::spawn("cohort-expiry", move |stop| {
            consumer.run(&mut partition, &stop)
        })
    }

    /// One outbox relay pass.
    pub fn dispatch_outbox(&self) -> Result<DispatchStats> {
        self.dispatcher().dispatch_pending()
    }

    /// Start the outbox relay on its own thread.
    pub fn spawn_outbox_dispatcher(&self) -> Result<WorkerHandle<DispatchStats>> {
        if self.config.publisher.delivery != DeliveryMode::Outbox {
            info!("outbox dispatcher started while delivery is immediate");
        }
        let dispatcher = self.dispatcher();
        WorkerHandle::spawn("cohort-outbox", move |stop| dispatcher.run(&stop))
    }

    fn dispatcher(&self) -> OutboxDispatcher {
        OutboxDispatcher::new(
            self.db.clone(),
            self.broker.clone(),
            self.config.outbox.clone(),
        )
    }
}

fn write_manifest(path: &Path) -> Result<()> {
    let mut file = File::create(path.join("MANIFEST"))?;
    file.write_all(MANIFEST_MAGIC)?;
    file.write_all(&[MANIFEST_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn verify_manifest(path: &Path) -> Result<()> {
    let mut file = File::open(path.join("MANIFEST"))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MANIFEST_MAGIC {
        return Err(CohortError::InvalidFormat("invalid cohort manifest".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != MANIFEST_VERSION {
        return Err(CohortError::InvalidFormat(format!(
            "unsupported cohort version: {}",
            version[0]
        )));
    }

    Ok(())
}

fn acquire_lock(path: &Path) -> Result<File> {
    let lock_file = File::create(path.join("LOCK"))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| CohortError::Locked)?;
    Ok(lock_file)
}
