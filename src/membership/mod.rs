//! The membership transaction manager.
//!
//! A change runs in three phases:
//! 1. checks: subject exists, every slug resolves (nothing is written if
//!    either fails)
//! 2. one atomic store transaction: upserts, then deletes, then (in outbox
//!    mode) the outbound events
//! 3. post-commit: history entries, then (in immediate mode) publication
//!
//! Failures in phase 3 come back as [`CohortError::PostCommit`]; the
//! membership change itself stays applied.
//!
//! [`CohortError::PostCommit`]: crate::error::CohortError::PostCommit

mod manager;

pub use manager::{Collaborators, MembershipManager};
