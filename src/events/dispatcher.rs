//! Relays committed outbox rows to the broker.

use crate::broker::MessageBroker;
use crate::capabilities::OutboxStore;
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::types::Timestamp;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters for one or more dispatch passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub sent: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Sent events deleted after the retention window.
    pub pruned: u64,
}

impl DispatchStats {
    fn absorb(&mut self, other: DispatchStats) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.pruned += other.pruned;
    }
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    /// Send one batch of pending events in sequence order.
    ///
    /// The pass stops at the first send failure so later events for the same
    /// key are never delivered ahead of it. An event that has used up its
    /// attempts is dead-lettered and the pass continues past it.
    pub fn dispatch_pending(&self) -> Result<DispatchStats> {
        let mut stats = DispatchStats::default();

        for event in self.outbox.pending(self.config.batch_size)? {
            let message = &event.message;
            match self.broker.send(&message.topic, &message.key, &message.payload) {
                Ok(delivery) => {
                    self.outbox.mark_sent(event.seq)?;
                    stats.sent += 1;
                    debug!(
                        seq = event.seq,
                        topic = %message.topic,
                        offset = delivery.offset,
                        "outbox event sent"
                    );
                }
                Err(e) => {
                    let attempts = self.outbox.record_failure(event.seq, &e.to_string())?;
                    if attempts >= self.config.max_attempts {
                        self.outbox.mark_dead_letter(event.seq)?;
                        stats.dead_lettered += 1;
                        error!(
                            seq = event.seq,
                            topic = %message.topic,
                            attempts,
                            error = %e,
                            "outbox event dead-lettered"
                        );
                        continue;
                    }
                    stats.failed += 1;
                    warn!(seq = event.seq, attempts, error = %e, "outbox send failed");
                    break;
                }
            }
        }

        Ok(stats)
    }

    /// Delete sent events older than the retention window.
    pub fn prune_sent(&self) -> Result<u64> {
        let cutoff = Timestamp::now().minus(Duration::from_millis(self.config.retention_ms));
        let pruned = self.outbox.prune_sent(cutoff)? as u64;
        if pruned > 0 {
            debug!(pruned, "pruned sent outbox events");
        }
        Ok(pruned)
    }

    /// Dispatch and prune on an interval until `stop` fires or disconnects.
    pub fn run(&self, stop: &Receiver<()>) -> DispatchStats {
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut total = DispatchStats::default();
        info!(interval_ms = self.config.interval_ms, "outbox dispatcher started");

        loop {
            match self.dispatch_pending() {
                Ok(stats) => total.absorb(stats),
                Err(e) => error!(error = %e, "outbox dispatch pass failed"),
            }
            match self.prune_sent() {
                Ok(pruned) => total.pruned += pruned,
                Err(e) => warn!(error = %e, "outbox prune failed"),
            }

            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            sent = total.sent,
            failed = total.failed,
            dead_lettered = total.dead_lettered,
            pruned = total.pruned,
            "outbox dispatcher stopped"
        );
        total
    }
}
