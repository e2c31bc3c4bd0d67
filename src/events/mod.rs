//! Membership events and their broker wire format.
//!
//! Two topics carry JSON messages keyed by the decimal user id:
//! - `user-segments`: one [`MembershipChanged`] per affected slug
//! - `segment_expiry`: one [`ExpiryInstruction`] per TTL-bearing add
//!
//! Delivery goes through an [`EventPublisher`] right after commit, or via
//! the transactional outbox and an [`OutboxDispatcher`].

mod dispatcher;
mod publisher;

pub use dispatcher::{DispatchStats, OutboxDispatcher};
pub use publisher::{BrokerPublisher, EventPublisher, RetryPolicy};

use crate::error::{CohortError, Result};
use crate::types::{MembershipChange, Slug, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Topic for change notifications.
pub const CHANGES_TOPIC: &str = "user-segments";

/// Topic for scheduled-expiry instructions.
pub const EXPIRY_TOPIC: &str = "segment_expiry";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Delete,
}

/// Body of a `user-segments` message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChanged {
    pub user_id: UserId,
    pub segment: Slug,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Timestamp>,
}

/// Body of a `segment_expiry` message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpiryInstruction {
    pub user_id: UserId,
    pub segment: Slug,
    pub ttl: Timestamp,
}

impl ExpiryInstruction {
    /// Decode a broker payload. Bad JSON and bad timestamps both fail here.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| CohortError::Deserialization(e.to_string()))
    }
}

impl MembershipChanged {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| CohortError::Deserialization(e.to_string()))
    }
}

/// A message ready for the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// One event produced by a committed change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Change(MembershipChanged),
    Expiry(ExpiryInstruction),
}

impl Notification {
    pub fn user_id(&self) -> UserId {
        match self {
            Notification::Change(e) => e.user_id,
            Notification::Expiry(i) => i.user_id,
        }
    }

    pub fn to_message(&self) -> Result<OutboundMessage> {
        let (topic, payload) = match self {
            Notification::Change(event) => (CHANGES_TOPIC, serde_json::to_vec(event)?),
            Notification::Expiry(instruction) => (EXPIRY_TOPIC, serde_json::to_vec(instruction)?),
        };
        Ok(OutboundMessage {
            topic: topic.to_string(),
            key: self.user_id().key(),
            payload,
        })
    }
}

/// Events for a change, in publish order.
///
/// Each add yields its expiry instruction (when a ttl is set) followed by the
/// change event; deletes follow all adds.
pub fn notifications_for(change: &MembershipChange) -> Vec<Notification> {
    let mut out = Vec::with_capacity(change.add.len() * 2 + change.delete.len());

    for slug in &change.add {
        if let Some(ttl) = change.ttl {
            out.push(Notification::Expiry(ExpiryInstruction {
                user_id: change.user_id,
                segment: slug.clone(),
                ttl,
            }));
        }
        out.push(Notification::Change(MembershipChanged {
            user_id: change.user_id,
            segment: slug.clone(),
            action: ChangeAction::Add,
            ttl: change.ttl,
        }));
    }

    for slug in &change.delete {
        out.push(Notification::Change(MembershipChanged {
            user_id: change.user_id,
            segment: slug.clone(),
            action: ChangeAction::Delete,
            ttl: None,
        }));
    }

    out
}
