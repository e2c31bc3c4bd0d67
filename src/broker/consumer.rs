//! Sequential reader of one topic partition.

use super::{Message, MessageBroker};
use crate::error::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_FETCH_MAX: usize = 64;

/// Where a new consumer begins reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOffset {
    /// The oldest retained message.
    Oldest,
    /// Only messages sent after the consumer was created.
    Latest,
    At(u64),
}

pub struct PartitionConsumer {
    broker: Arc<dyn MessageBroker>,
    topic: String,
    partition: u32,
    position: u64,
    buffered: VecDeque<Message>,
    wakeups: Receiver<u64>,
    fetch_max: usize,
}

impl PartitionConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        topic: impl Into<String>,
        partition: u32,
        start: StartOffset,
    ) -> Result<Self> {
        let topic = topic.into();

        // Subscribe before reading the end offset so no send is missed.
        let wakeups = broker.watch(&topic, partition)?;
        let position = match start {
            StartOffset::Oldest => broker.oldest_offset(&topic, partition)?,
            StartOffset::Latest => broker.next_offset(&topic, partition)?,
            StartOffset::At(offset) => offset,
        };

        Ok(Self {
            broker,
            topic,
            partition,
            position,
            buffered: VecDeque::new(),
            wakeups,
            fetch_max: DEFAULT_FETCH_MAX,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Offset of the next message [`poll`](Self::poll) will return.
    pub fn position(&self) -> u64 {
        self.buffered
            .front()
            .map_or(self.position, |message| message.offset)
    }

    /// Next message, waiting up to `timeout` for one to arrive.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Message>> {
        if let Some(message) = self.buffered.pop_front() {
            return Ok(Some(message));
        }

        self.fill()?;
        if let Some(message) = self.buffered.pop_front() {
            return Ok(Some(message));
        }

        match self.wakeups.recv_timeout(timeout) {
            Ok(_) => {
                self.fill()?;
                Ok(self.buffered.pop_front())
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn fill(&mut self) -> Result<()> {
        let batch = self
            .broker
            .fetch(&self.topic, self.partition, self.position, self.fetch_max)?;
        if let Some(last) = batch.last() {
            self.position = last.offset + 1;
        }
        self.buffered.extend(batch);
        Ok(())
    }
}
