//! Broker collaborator interfaces.

use std::{fmt, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Broker client error: {0}")]
    Client(String),
    #[error("Watermark query for {0} failed: {1}")]
    Watermark(TopicPartition, String),
    #[error("Failed to assign partitions: {0}")]
    Assign(String),
    #[error("Failed to publish to {0}: {1}")]
    Publish(String, String),
    #[error("Flush did not complete: {0}")]
    Flush(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    /// Whatever the broker resolves: committed offset or the reset policy.
    Stored,
    Beginning,
    End,
    At(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOffset {
    pub partition: TopicPartition,
    pub offset: Offset,
}

impl PartitionOffset {
    pub fn new(partition: TopicPartition, offset: Offset) -> Self {
        Self { partition, offset }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp_ms: Option<i64>,
    pub partition: TopicPartition,
    pub offset: i64,
}

#[derive(Debug)]
pub enum BrokerEvent {
    Assigned(Vec<PartitionOffset>),
    Revoked(Vec<PartitionOffset>),
    PartitionEof(TopicPartition),
    Message(Message),
    Error(BrokerError),
}

pub trait BrokerConsumer: Send {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for the next event.
    fn poll(&mut self, timeout: Duration) -> Option<BrokerEvent>;

    fn assign(&mut self, partitions: &[PartitionOffset]) -> Result<(), BrokerError>;

    fn unassign(&mut self) -> Result<(), BrokerError>;

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError>;

    /// Next offset that will be read, if the client knows one yet.
    fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, BrokerError>;

    /// Returns `(low, high)` watermarks.
    fn query_watermarks(
        &self,
        partition: &TopicPartition,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError>;
}

pub trait BrokerProducer: Send + Sync {
    /// Queues `value` for delivery without waiting for the acknowledgement.
    fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BrokerError>;

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub partition: TopicPartition,
    pub result: Result<i64, String>,
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    pub(crate) struct MockConsumer {
        pub(crate) subscribed: Vec<String>,
        pub(crate) events: VecDeque<BrokerEvent>,
        pub(crate) assigned: Vec<TopicPartition>,
        pub(crate) positions: HashMap<TopicPartition, i64>,
        pub(crate) watermarks: HashMap<TopicPartition, (i64, i64)>,
        pub(crate) failing_watermarks: HashSet<TopicPartition>,
        pub(crate) assign_calls: Vec<Vec<PartitionOffset>>,
        pub(crate) failing_assign: bool,
    }

    impl MockConsumer {
        pub(crate) fn push_message(
            &mut self,
            partition: &TopicPartition,
            offset: i64,
            value: Vec<u8>,
        ) {
            self.events.push_back(BrokerEvent::Message(Message {
                key: Some(b"video".to_vec()),
                value,
                timestamp_ms: Some(0),
                partition: partition.clone(),
                offset,
            }));
        }
    }

    impl BrokerConsumer for MockConsumer {
        fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
            self.subscribed = topics.to_vec();
            Ok(())
        }

        fn poll(&mut self, _timeout: Duration) -> Option<BrokerEvent> {
            let event = self.events.pop_front()?;
            if let BrokerEvent::Message(message) = &event {
                self.positions
                    .insert(message.partition.clone(), message.offset + 1);
            }
            Some(event)
        }

        fn assign(&mut self, partitions: &[PartitionOffset]) -> Result<(), BrokerError> {
            self.assign_calls.push(partitions.to_vec());
            if self.failing_assign {
                return Err(BrokerError::Assign("coordinator unavailable".into()));
            }
            self.assigned = partitions.iter().map(|p| p.partition.clone()).collect();
            for p in partitions {
                if let Offset::At(offset) = p.offset {
                    self.positions.insert(p.partition.clone(), offset);
                }
            }
            Ok(())
        }

        fn unassign(&mut self) -> Result<(), BrokerError> {
            self.assigned.clear();
            Ok(())
        }

        fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
            Ok(self.assigned.clone())
        }

        fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, BrokerError> {
            Ok(self.positions.get(partition).copied())
        }

        fn query_watermarks(
            &self,
            partition: &TopicPartition,
            _timeout: Duration,
        ) -> Result<(i64, i64), BrokerError> {
            if self.failing_watermarks.contains(partition) {
                return Err(BrokerError::Watermark(partition.clone(), "timed out".into()));
            }
            self.watermarks
                .get(partition)
                .copied()
                .ok_or_else(|| {
                    BrokerError::Watermark(partition.clone(), "unknown partition".into())
                })
        }
    }

    #[derive(Default)]
    pub(crate) struct MockProducer {
        pub(crate) published: Mutex<Vec<(String, String, Vec<u8>)>>,
        pub(crate) flushes: Mutex<Vec<Duration>>,
    }

    impl BrokerProducer for MockProducer {
        fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BrokerError> {
            self.published
                .lock()
                .push((topic.to_string(), key.to_string(), value.to_vec()));
            Ok(())
        }

        fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
            self.flushes.lock().push(timeout);
            Ok(())
        }
    }
}
