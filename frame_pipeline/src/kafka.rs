//! `rdkafka` implementations of the broker traits.

use crate::{
    broker::{
        BrokerConsumer, BrokerError, BrokerEvent, BrokerProducer, DeliveryReport, Message, Offset,
        PartitionOffset, TopicPartition,
    },
    config::BrokerConfig,
};
use parking_lot::Mutex;
use rdkafka::{
    client::ClientContext,
    config::{ClientConfig, RDKafkaLogLevel},
    consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance},
    error::{KafkaError, KafkaResult},
    message::{BorrowedMessage, Message as _},
    producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer},
    topic_partition_list::{Offset as KafkaOffset, TopicPartitionList},
};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::mpsc;

fn forward_log(level: RDKafkaLogLevel, facility: &str, message: &str) {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => tracing::error!(facility, "librdkafka: {}", message),
        RDKafkaLogLevel::Warning => tracing::warn!(facility, "librdkafka: {}", message),
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
            tracing::info!(facility, "librdkafka: {}", message)
        }
        RDKafkaLogLevel::Debug => tracing::debug!(facility, "librdkafka: {}", message),
    }
}

/// Queues rebalance notifications so the consume loop sees them as ordinary events.
pub struct RebalanceContext {
    events: Arc<Mutex<VecDeque<BrokerEvent>>>,
}

impl ClientContext for RebalanceContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }
}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        let event = match rebalance {
            Rebalance::Assign(list) => BrokerEvent::Assigned(partition_offsets(list)),
            Rebalance::Revoke(list) => BrokerEvent::Revoked(partition_offsets(list)),
            Rebalance::Error(e) => BrokerEvent::Error(BrokerError::Client(e.to_string())),
        };
        self.events.lock().push_back(event);
    }
}

pub struct KafkaConsumer {
    consumer: BaseConsumer<RebalanceContext>,
    events: Arc<Mutex<VecDeque<BrokerEvent>>>,
    topic: String,
}

impl KafkaConsumer {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let context = RebalanceContext {
            events: events.clone(),
        };

        let consumer: BaseConsumer<RebalanceContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.partition.eof", "true")
            .create_with_context(context)
            .map_err(client_error)?;

        Ok(Self {
            consumer,
            events,
            topic: config.input_topic.clone(),
        })
    }

    fn to_event(&self, polled: KafkaResult<BorrowedMessage<'_>>) -> BrokerEvent {
        match polled {
            Ok(message) => BrokerEvent::Message(Message {
                key: message.key().map(<[u8]>::to_vec),
                value: message.payload().unwrap_or_default().to_vec(),
                timestamp_ms: message.timestamp().to_millis(),
                partition: TopicPartition::new(message.topic(), message.partition()),
                offset: message.offset(),
            }),
            Err(KafkaError::PartitionEOF(partition)) => {
                BrokerEvent::PartitionEof(TopicPartition::new(self.topic.as_str(), partition))
            }
            Err(e) => BrokerEvent::Error(client_error(e)),
        }
    }
}

impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(client_error)
    }

    fn poll(&mut self, timeout: Duration) -> Option<BrokerEvent> {
        if let Some(event) = self.events.lock().pop_front() {
            return Some(event);
        }

        // a rebalance callback may fire inside this poll and must be seen first
        let polled = self.consumer.poll(timeout).map(|result| self.to_event(result));

        let mut events = self.events.lock();
        match polled {
            Some(event) if !events.is_empty() => {
                events.push_back(event);
                events.pop_front()
            }
            Some(event) => Some(event),
            None => events.pop_front(),
        }
    }

    fn assign(&mut self, partitions: &[PartitionOffset]) -> Result<(), BrokerError> {
        let mut list = TopicPartitionList::with_capacity(partitions.len());
        for p in partitions {
            list.add_partition_offset(
                &p.partition.topic,
                p.partition.partition,
                kafka_offset(p.offset),
            )
            .map_err(|e| BrokerError::Assign(e.to_string()))?;
        }
        self.consumer
            .assign(&list)
            .map_err(|e| BrokerError::Assign(e.to_string()))
    }

    fn unassign(&mut self) -> Result<(), BrokerError> {
        self.consumer.unassign().map_err(client_error)
    }

    fn assignment(&self) -> Result<Vec<TopicPartition>, BrokerError> {
        let list = self.consumer.assignment().map_err(client_error)?;
        Ok(list
            .elements()
            .iter()
            .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
            .collect())
    }

    fn position(&self, partition: &TopicPartition) -> Result<Option<i64>, BrokerError> {
        let list = self.consumer.position().map_err(client_error)?;
        Ok(list
            .find_partition(&partition.topic, partition.partition)
            .and_then(|elem| match elem.offset() {
                KafkaOffset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    fn query_watermarks(
        &self,
        partition: &TopicPartition,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError> {
        self.consumer
            .fetch_watermarks(&partition.topic, partition.partition, timeout)
            .map_err(|e| BrokerError::Watermark(partition.clone(), e.to_string()))
    }
}

/// Hands delivery outcomes to the async side without ever blocking the producer thread.
pub struct DeliveryContext {
    reports: mpsc::Sender<DeliveryReport>,
}

impl ClientContext for DeliveryContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_log(level, fac, log_message);
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = ();

    fn delivery(
        &self,
        delivery_result: &DeliveryResult<'_>,
        _delivery_opaque: Self::DeliveryOpaque,
    ) {
        let report = match delivery_result {
            Ok(message) => DeliveryReport {
                partition: TopicPartition::new(message.topic(), message.partition()),
                result: Ok(message.offset()),
            },
            Err((e, message)) => DeliveryReport {
                partition: TopicPartition::new(message.topic(), message.partition()),
                result: Err(e.to_string()),
            },
        };
        if self.reports.try_send(report).is_err() {
            tracing::debug!("Delivery report channel full, report dropped");
        }
    }
}

pub struct KafkaProducer {
    producer: ThreadedProducer<DeliveryContext>,
}

impl KafkaProducer {
    pub fn new(
        config: &BrokerConfig,
        reports: mpsc::Sender<DeliveryReport>,
    ) -> Result<Self, BrokerError> {
        let producer: ThreadedProducer<DeliveryContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.max.bytes", config.message_max_bytes.to_string())
            .set("compression.type", &config.compression)
            .create_with_context(DeliveryContext { reports })
            .map_err(client_error)?;

        Ok(Self { producer })
    }
}

impl BrokerProducer for KafkaProducer {
    fn publish(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), BrokerError> {
        let record: BaseRecord<'_, str, [u8]> = BaseRecord::to(topic).key(key).payload(value);
        self.producer
            .send(record)
            .map_err(|(e, _)| BrokerError::Publish(topic.to_string(), e.to_string()))
    }

    fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer
            .flush(timeout)
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}

fn client_error(e: KafkaError) -> BrokerError {
    BrokerError::Client(e.to_string())
}

fn kafka_offset(offset: Offset) -> KafkaOffset {
    match offset {
        Offset::Stored => KafkaOffset::Stored,
        Offset::Beginning => KafkaOffset::Beginning,
        Offset::End => KafkaOffset::End,
        Offset::At(offset) => KafkaOffset::Offset(offset),
    }
}

fn partition_offsets(list: &TopicPartitionList) -> Vec<PartitionOffset> {
    list.elements()
        .iter()
        .map(|elem| {
            let offset = match elem.offset() {
                KafkaOffset::Offset(offset) => Offset::At(offset),
                KafkaOffset::Beginning => Offset::Beginning,
                KafkaOffset::End => Offset::End,
                _ => Offset::Stored,
            };
            PartitionOffset::new(TopicPartition::new(elem.topic(), elem.partition()), offset)
        })
        .collect()
}
