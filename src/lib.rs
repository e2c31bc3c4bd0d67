//! # Cohort
//!
//! A segment membership store: subjects ("users") belong to named segments,
//! optionally until an expiry time. Every change is committed atomically,
//! recorded in an append-only history and announced on a broker topic;
//! time-bounded memberships are removed by an expiry consumer.
//!
//! ## Core Concepts
//!
//! - **Membership change**: one atomic add/delete batch for one subject
//! - **History**: append-only `ADD`/`DELETE` audit entries
//! - **Events**: `user-segments` change notifications and `segment_expiry`
//!   instructions, keyed by user id
//! - **Expiry consumer**: applies due instructions and schedules early ones
//! - **Outbox**: optional transactional delivery of events
//!
//! ## Example
//!
//! ```ignore
//! use cohort::{ChangeRequest, Cohort, CohortConfig, UserId};
//!
//! let cohort = Cohort::open(CohortConfig::at("./cohort-data"))?;
//! cohort.register_user(UserId(42), "alice")?;
//! cohort.register_segment("PROMO")?;
//!
//! cohort.apply_change(&ChangeRequest {
//!     user_id: 42,
//!     add_segments: vec!["PROMO".into()],
//!     ttl: Some("2030-01-01T00:00:00Z".into()),
//!     ..Default::default()
//! })?;
//!
//! let expiry = cohort.spawn_expiry_consumer()?;
//! // ...
//! let stats = expiry.stop()?;
//! ```

pub mod broker;
pub mod capabilities;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod expiry;
pub mod membership;
pub mod service;
pub mod types;
pub mod worker;

// Re-exports
pub use broker::{Delivery, LocalBroker, Message, MessageBroker, PartitionConsumer, StartOffset};
pub use capabilities::{
    Clock, ExpirySchedule, HistoryRecorder, MembershipBatch, MembershipStore, OffsetStore,
    OutboxEvent, OutboxStore, RemovalGuard, RemovalOutcome, Resolution, SegmentResolver,
    SubjectDirectory, SystemClock,
};
pub use config::{
    BrokerConfig, CohortConfig, DatabaseConfig, DeliveryMode, ExpiryConfig, OutboxConfig,
    PublisherConfig,
};
pub use db::Database;
pub use error::{CohortError, PostCommitStage, Result};
pub use events::{
    BrokerPublisher, ChangeAction, DispatchStats, EventPublisher, ExpiryInstruction,
    MembershipChanged, Notification, OutboundMessage, OutboxDispatcher, RetryPolicy,
    CHANGES_TOPIC, EXPIRY_TOPIC,
};
pub use expiry::{ConsumerStats, ExpiryCollaborators, ExpiryConsumer, ExpiryOutcome};
pub use membership::{Collaborators, MembershipManager};
pub use service::Cohort;
pub use types::*;
pub use worker::WorkerHandle;
