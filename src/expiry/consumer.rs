use super::{ConsumerStats, ExpiryOutcome};
use crate::broker::{PartitionConsumer, StartOffset};
use crate::capabilities::{
    Clock, ExpirySchedule, HistoryRecorder, MembershipStore, OffsetStore, RemovalGuard,
    RemovalOutcome, SegmentResolver, SystemClock,
};
use crate::config::ExpiryConfig;
use crate::error::{CohortError, Result};
use crate::events::ExpiryInstruction;
use crate::types::{HistoryEntry, Operation};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the consumer talks to.
#[derive(Clone)]
pub struct ExpiryCollaborators {
    pub segments: Arc<dyn SegmentResolver>,
    pub store: Arc<dyn MembershipStore>,
    pub history: Arc<dyn HistoryRecorder>,
    pub schedule: Arc<dyn ExpirySchedule>,
    pub offsets: Arc<dyn OffsetStore>,
}

#[derive(Clone)]
pub struct ExpiryConsumer {
    deps: ExpiryCollaborators,
    clock: Arc<dyn Clock>,
    config: ExpiryConfig,
}

impl ExpiryConsumer {
    pub fn new(deps: ExpiryCollaborators, config: ExpiryConfig) -> Self {
        Self {
            deps,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Where a consumer of `topic`/`partition` should resume.
    pub fn resume_from(&self, topic: &str, partition: u32) -> Result<StartOffset> {
        Ok(match self.deps.offsets.committed(topic, partition)? {
            Some(next) => StartOffset::At(next),
            None => StartOffset::Oldest,
        })
    }

    /// Handle one raw `segment_expiry` payload. Errors are logged, never
    /// returned: the message counts as consumed either way.
    pub fn process(&self, payload: &[u8]) -> ExpiryOutcome {
        let instruction = match ExpiryInstruction::from_payload(payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "skipping malformed expiry instruction");
                return ExpiryOutcome::Malformed;
            }
        };

        if self.clock.now() < instruction.ttl {
            return match self.deps.schedule.defer(&instruction) {
                Ok(()) => {
                    debug!(
                        user_id = instruction.user_id.0,
                        segment = %instruction.segment,
                        ttl = %instruction.ttl,
                        "expiry not yet due, scheduled"
                    );
                    ExpiryOutcome::Deferred
                }
                Err(e) => {
                    error!(
                        user_id = instruction.user_id.0,
                        segment = %instruction.segment,
                        error = %e,
                        "failed to schedule expiry"
                    );
                    ExpiryOutcome::Failed
                }
            };
        }

        match self.expire(&instruction) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    user_id = instruction.user_id.0,
                    segment = %instruction.segment,
                    error = %e,
                    "expiry failed"
                );
                ExpiryOutcome::Failed
            }
        }
    }

    /// Apply a due instruction. History is written only when a row was
    /// actually removed, so repeating an instruction is harmless.
    pub fn expire(&self, instruction: &ExpiryInstruction) -> Result<ExpiryOutcome> {
        let segment_id = match self.deps.segments.resolve_one(&instruction.segment) {
            Ok(id) => id,
            Err(CohortError::SegmentNotFound(_)) => {
                debug!(segment = %instruction.segment, "segment gone, nothing to expire");
                return Ok(ExpiryOutcome::Absent);
            }
            Err(e) => return Err(e),
        };

        let guard = if self.config.skip_superseded {
            RemovalGuard::ExpiringBy(instruction.ttl)
        } else {
            RemovalGuard::TimeBounded
        };

        match self
            .deps
            .store
            .remove_membership(instruction.user_id, segment_id, guard)?
        {
            RemovalOutcome::Removed => {}
            RemovalOutcome::Absent => return Ok(ExpiryOutcome::Absent),
            RemovalOutcome::Superseded => {
                info!(
                    user_id = instruction.user_id.0,
                    segment = %instruction.segment,
                    "membership outlived expiry instruction, kept"
                );
                return Ok(ExpiryOutcome::Superseded);
            }
        }

        self.deps.history.record(&HistoryEntry::now(
            instruction.user_id,
            instruction.segment.clone(),
            Operation::Delete,
        ))?;
        info!(
            user_id = instruction.user_id.0,
            segment = %instruction.segment,
            "membership expired"
        );
        Ok(ExpiryOutcome::Removed)
    }

    /// Apply scheduled instructions that have come due, earliest first.
    /// Failed ones stay scheduled for the next sweep.
    pub fn sweep(&self) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();

        for instruction in self
            .deps
            .schedule
            .due(self.clock.now(), self.config.sweep_batch)?
        {
            match self.expire(&instruction) {
                Ok(outcome) => {
                    self.deps.schedule.complete(&instruction)?;
                    stats.record(outcome);
                    stats.swept += 1;
                }
                Err(e) => {
                    stats.record(ExpiryOutcome::Failed);
                    warn!(
                        user_id = instruction.user_id.0,
                        segment = %instruction.segment,
                        error = %e,
                        "scheduled expiry failed, will retry"
                    );
                }
            }
        }

        Ok(stats)
    }

    /// Receive loop. Handles one message at a time and checks `stop` between
    /// messages; a sent or disconnected stop channel ends the loop.
    pub fn run(&self, consumer: &mut PartitionConsumer, stop: &Receiver<()>) -> ConsumerStats {
        let interval = self.config.poll_interval();
        let mut stats = ConsumerStats::default();
        let mut last_sweep: Option<Instant> = None;

        info!(
            topic = consumer.topic(),
            partition = consumer.partition(),
            position = consumer.position(),
            "expiry consumer started"
        );

        loop {
            match stop.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => break,
            }

            if last_sweep.map_or(true, |at| at.elapsed() >= interval) {
                match self.sweep() {
                    Ok(swept) => stats.merge(&swept),
                    Err(e) => error!(error = %e, "expiry sweep failed"),
                }
                last_sweep = Some(Instant::now());
            }

            match consumer.poll(interval) {
                Ok(Some(message)) => {
                    stats.received += 1;
                    stats.record(self.process(&message.payload));
                    if let Err(e) = self.deps.offsets.commit(
                        consumer.topic(),
                        consumer.partition(),
                        message.offset + 1,
                    ) {
                        error!(offset = message.offset, error = %e, "offset commit failed");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "expiry receive failed");
                    match stop.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
        }

        info!(
            received = stats.received,
            removed = stats.removed,
            deferred = stats.deferred,
            malformed = stats.malformed,
            failed = stats.failed,
            "expiry consumer stopped"
        );
        stats
    }
}
