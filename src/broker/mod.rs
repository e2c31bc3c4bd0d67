//! Message broker protocol and an embedded file-backed broker.
//!
//! The mutation pipeline only needs four things from a broker:
//! - keyed, acknowledged sends (one key always lands on one partition)
//! - sequential reads of a partition by offset
//! - the oldest retained offset, to start consumers from the beginning
//! - a wake-up signal when a partition grows
//!
//! [`LocalBroker`] provides these on top of one append-only log per
//! partition.

mod consumer;
mod local;
mod log;

pub use self::log::TopicLog;
pub use consumer::{PartitionConsumer, StartOffset};
pub use local::LocalBroker;

use crate::error::Result;
use crate::types::Timestamp;
use crossbeam_channel::Receiver;

/// Acknowledgement of a durable send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub partition: u32,
    pub offset: u64,
}

/// A message read back from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub timestamp: Timestamp,
}

pub trait MessageBroker: Send + Sync {
    /// Send and wait until the message is durable.
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery>;

    /// Up to `max` messages starting at `offset`.
    fn fetch(&self, topic: &str, partition: u32, offset: u64, max: usize) -> Result<Vec<Message>>;

    /// First retained offset of a partition.
    fn oldest_offset(&self, topic: &str, partition: u32) -> Result<u64>;

    /// Offset the next send to this partition will get.
    fn next_offset(&self, topic: &str, partition: u32) -> Result<u64>;

    /// Receives the new end offset whenever the partition grows. Wake-ups
    /// may coalesce; readers must re-fetch rather than count them.
    fn watch(&self, topic: &str, partition: u32) -> Result<Receiver<u64>>;
}

/// Partition for a key; stable for a given partition count.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    crc32fast::hash(key.as_bytes()) % partitions.max(1)
}
