//! Error types for the membership store.

use crate::types::{Slug, UserId};
use std::fmt;
use thiserror::Error;

/// Which post-commit step failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostCommitStage {
    /// Appending history entries.
    History,
    /// Publishing change or expiry events.
    Publish,
}

impl fmt::Display for PostCommitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostCommitStage::History => f.write_str("history"),
            PostCommitStage::Publish => f.write_str("publish"),
        }
    }
}

/// Main error type.
#[derive(Debug, Error)]
pub enum CohortError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Subject not found: {0}")]
    SubjectNotFound(UserId),

    #[error("Segment not found: {}", join_slugs(.0))]
    SegmentNotFound(Vec<Slug>),

    #[error("Invalid TTL: {0}")]
    InvalidTtl(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Mutation failed before commit; nothing was applied.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Membership change is durable, but audit or notification is incomplete.
    #[error("Membership changed but {stage} step failed: {source}")]
    PostCommit {
        stage: PostCommitStage,
        #[source]
        source: Box<CohortError>,
    },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Data directory is locked by another process")]
    Locked,

    #[error("Data directory not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker {0} panicked")]
    WorkerPanicked(String),
}

impl CohortError {
    pub fn post_commit(stage: PostCommitStage, source: CohortError) -> Self {
        CohortError::PostCommit {
            stage,
            source: Box::new(source),
        }
    }

    /// True when the membership change was committed despite the error.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, CohortError::PostCommit { .. })
    }

    /// Failures worth retrying: broker hiccups, I/O, a busy database.
    pub fn is_transient(&self) -> bool {
        match self {
            CohortError::Broker(_) | CohortError::Io(_) => true,
            CohortError::Sql(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

fn join_slugs(slugs: &[Slug]) -> String {
    slugs
        .iter()
        .map(Slug::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<serde_json::Error> for CohortError {
    fn from(e: serde_json::Error) -> Self {
        CohortError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CohortError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CohortError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CohortError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CohortError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, CohortError>;
