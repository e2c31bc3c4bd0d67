//! Synchronous event publication with bounded retries.

use super::{ExpiryInstruction, MembershipChanged, Notification, OutboundMessage};
use crate::broker::{Delivery, MessageBroker};
use crate::config::PublisherConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends membership events; each call returns once the broker acknowledged.
pub trait EventPublisher: Send + Sync {
    fn publish_change(&self, event: &MembershipChanged) -> Result<()>;
    fn publish_expiry(&self, instruction: &ExpiryInstruction) -> Result<()>;

    fn publish(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::Change(event) => self.publish_change(event),
            Notification::Expiry(instruction) => self.publish_expiry(instruction),
        }
    }
}

/// Fixed-backoff retry of transient failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

impl From<&PublisherConfig> for RetryPolicy {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(what, attempt, max_retries = self.max_retries, error = %e, "retrying");
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// [`EventPublisher`] over a [`MessageBroker`].
pub struct BrokerPublisher {
    broker: Arc<dyn MessageBroker>,
    retry: RetryPolicy,
}

impl BrokerPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>, retry: RetryPolicy) -> Self {
        Self { broker, retry }
    }

    /// Send a prepared message, retrying transient failures.
    pub fn send(&self, message: &OutboundMessage) -> Result<Delivery> {
        let delivery = self.retry.run(&message.topic, || {
            self.broker.send(&message.topic, &message.key, &message.payload)
        })?;
        debug!(
            topic = %message.topic,
            key = %message.key,
            partition = delivery.partition,
            offset = delivery.offset,
            "event published"
        );
        Ok(delivery)
    }
}

impl EventPublisher for BrokerPublisher {
    fn publish_change(&self, event: &MembershipChanged) -> Result<()> {
        self.send(&Notification::Change(event.clone()).to_message()?)
            .map(|_| ())
    }

    fn publish_expiry(&self, instruction: &ExpiryInstruction) -> Result<()> {
        self.send(&Notification::Expiry(instruction.clone()).to_message()?)
            .map(|_| ())
    }
}
