//! Embedded broker: one [`TopicLog`] per (topic, partition) under a
//! directory, with bounded wake-up channels for readers.

use super::log::TopicLog;
use super::{partition_for, Delivery, Message, MessageBroker};
use crate::config::BrokerConfig;
use crate::error::{CohortError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// File-backed broker with per-partition logs.
pub struct LocalBroker {
    dir: PathBuf,
    config: BrokerConfig,
    topics: RwLock<HashMap<String, Vec<Arc<TopicLog>>>>,
    /// Wake-up senders per (topic, partition).
    watchers: Mutex<HashMap<(String, u32), Vec<Sender<u64>>>>,
}

impl LocalBroker {
    pub fn open(dir: impl AsRef<Path>, config: BrokerConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            config,
            topics: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Create (or reopen) a topic. Reopening keeps the partition count found
    /// on disk when it is larger than requested.
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CohortError::InvalidRequest(format!("invalid topic name {name:?}")));
        }

        let mut topics = self.topics.write();
        if topics.contains_key(name) {
            return Ok(());
        }

        let topic_dir = self.dir.join(name);
        fs::create_dir_all(&topic_dir)?;

        let on_disk = count_partitions(&topic_dir)?;
        let partitions = partitions.max(1).max(on_disk);

        let mut logs = Vec::with_capacity(partitions as usize);
        for p in 0..partitions {
            let path = topic_dir.join(format!("partition-{p}.log"));
            logs.push(Arc::new(TopicLog::open_with_sync_interval(
                path,
                self.config.sync_interval,
            )?));
        }

        info!(topic = name, partitions, "topic opened");
        topics.insert(name.to_string(), logs);
        Ok(())
    }

    pub fn partitions(&self, topic: &str) -> Result<u32> {
        let topics = self.topics.read();
        topics
            .get(topic)
            .map(|logs| logs.len() as u32)
            .ok_or_else(|| CohortError::UnknownTopic(topic.to_string()))
    }

    /// Every message of a topic, partition by partition. Intended for
    /// inspection and tests.
    pub fn read_all(&self, topic: &str) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for partition in 0..self.partitions(topic)? {
            let log = self.log(topic, partition)?;
            for stored in log.read_from(0, usize::MAX)? {
                out.push(Message {
                    topic: topic.to_string(),
                    partition,
                    offset: stored.offset,
                    key: stored.key,
                    payload: stored.payload,
                    timestamp: stored.timestamp,
                });
            }
        }
        Ok(out)
    }

    fn log(&self, topic: &str, partition: u32) -> Result<Arc<TopicLog>> {
        let topics = self.topics.read();
        let logs = topics
            .get(topic)
            .ok_or_else(|| CohortError::UnknownTopic(topic.to_string()))?;
        logs.get(partition as usize).cloned().ok_or_else(|| {
            CohortError::InvalidRequest(format!("topic {topic} has no partition {partition}"))
        })
    }

    /// Wake watchers of a partition. A full channel already holds a pending
    /// wake-up; disconnected watchers are dropped.
    fn notify(&self, topic: &str, partition: u32, end: u64) {
        let mut watchers = self.watchers.lock();
        if let Some(senders) = watchers.get_mut(&(topic.to_string(), partition)) {
            senders.retain(|sender| match sender.try_send(end) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
    }

    /// Number of live watchers (for tests and diagnostics).
    pub fn watcher_count(&self, topic: &str, partition: u32) -> usize {
        self.watchers
            .lock()
            .get(&(topic.to_string(), partition))
            .map_or(0, Vec::len)
    }
}

impl MessageBroker for LocalBroker {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery> {
        let partition = partition_for(key, self.partitions(topic)?);
        let log = self.log(topic, partition)?;

        let stored = log.append(key, payload)?;
        debug!(topic, partition, offset = stored.offset, key, "message appended");

        self.notify(topic, partition, stored.offset + 1);
        Ok(Delivery {
            partition,
            offset: stored.offset,
        })
    }

    fn fetch(&self, topic: &str, partition: u32, offset: u64, max: usize) -> Result<Vec<Message>> {
        let log = self.log(topic, partition)?;
        Ok(log
            .read_from(offset, max)?
            .into_iter()
            .map(|stored| Message {
                topic: topic.to_string(),
                partition,
                offset: stored.offset,
                key: stored.key,
                payload: stored.payload,
                timestamp: stored.timestamp,
            })
            .collect())
    }

    fn oldest_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        // No retention: everything ever written is still there.
        self.log(topic, partition).map(|_| 0)
    }

    fn next_offset(&self, topic: &str, partition: u32) -> Result<u64> {
        Ok(self.log(topic, partition)?.next_offset())
    }

    fn watch(&self, topic: &str, partition: u32) -> Result<Receiver<u64>> {
        self.log(topic, partition)?;

        let (sender, receiver) = bounded(1);
        self.watchers
            .lock()
            .entry((topic.to_string(), partition))
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}

fn count_partitions(topic_dir: &Path) -> Result<u32> {
    let mut count = 0;
    for entry in fs::read_dir(topic_dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(index) = name
            .strip_prefix("partition-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            count = count.max(index + 1);
        }
    }
    Ok(count)
}
