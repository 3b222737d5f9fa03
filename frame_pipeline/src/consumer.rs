//! Latest-wins consumption of the input topic.

use crate::{
    broker::{BrokerConsumer, BrokerError, BrokerEvent, Offset, PartitionOffset, TopicPartition},
    codec::FrameEnvelope,
    config::ConsumerConfig,
    telemetry::Metrics,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Receives every frame that decoded successfully.
pub trait FrameHandler {
    fn handle(&mut self, frame: FrameEnvelope);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Joining,
    Assigned,
    Steady,
}

#[derive(Debug, Clone, Copy)]
pub struct ReseekPolicy {
    pub min_gap: i64,
    pub watermark_timeout: Duration,
}

impl From<&ConsumerConfig> for ReseekPolicy {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            min_gap: config.reseek_min_gap,
            watermark_timeout: config.watermark_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReseekReport {
    /// Partitions moved, with the watermark they were moved to.
    pub reseeked: Vec<(TopicPartition, i64)>,
    pub skipped: usize,
    pub failed: usize,
    pub discarded: i64,
}

pub struct LatestOffsetConsumer<C> {
    client: C,
    policy: ReseekPolicy,
    state: ConsumerState,
    last_reseek: Option<ReseekReport>,
    metrics: Arc<Metrics>,
}

impl<C: BrokerConsumer> LatestOffsetConsumer<C> {
    pub fn new(
        mut client: C,
        topics: &[String],
        policy: ReseekPolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BrokerError> {
        client.subscribe(topics)?;
        tracing::info!("Subscribed to {:?}", topics);
        Ok(Self {
            client,
            policy,
            state: ConsumerState::Joining,
            last_reseek: None,
            metrics,
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn last_reseek(&self) -> Option<&ReseekReport> {
        self.last_reseek.as_ref()
    }

    /// Consumes until `shutdown` is set. Per-message failures never end the loop.
    pub fn run<H: FrameHandler>(
        &mut self,
        handler: &mut H,
        poll_timeout: Duration,
        shutdown: &AtomicBool,
    ) {
        tracing::info!("Consume loop started");
        while !shutdown.load(Ordering::Relaxed) {
            self.poll_once(handler, poll_timeout);
        }
        tracing::info!("Consume loop stopped");
    }

    /// Handles at most one broker event. Returns `false` when the poll timed out.
    pub fn poll_once<H: FrameHandler>(&mut self, handler: &mut H, timeout: Duration) -> bool {
        let Some(event) = self.client.poll(timeout) else {
            return false;
        };

        match event {
            BrokerEvent::Assigned(partitions) => {
                tracing::info!("Partitions assigned: {:?}", partitions);
                if let Err(e) = self.client.assign(&partitions) {
                    tracing::error!("Failed to accept assignment: {}", e);
                }
                self.state = ConsumerState::Assigned;
            }
            BrokerEvent::Revoked(partitions) => {
                tracing::info!("Partitions revoked: {:?}", partitions);
                if let Err(e) = self.client.unassign() {
                    tracing::error!("Failed to release assignment: {}", e);
                }
                self.state = ConsumerState::Joining;
            }
            BrokerEvent::PartitionEof(partition) => {
                tracing::debug!("Reached end of {}", partition);
            }
            BrokerEvent::Error(e) => {
                // the client reconnects on its own
                tracing::info!("Broker error: {}", e);
            }
            BrokerEvent::Message(message) => {
                self.state = ConsumerState::Steady;
                tracing::debug!(
                    "Message at {} offset {} (timestamp {:?})",
                    message.partition,
                    message.offset,
                    message.timestamp_ms
                );
                match FrameEnvelope::decode(&message.value) {
                    Ok(frame) => {
                        self.metrics.record_frame_consumed();
                        handler.handle(frame);
                    }
                    Err(e) => {
                        self.metrics.record_decode_failure();
                        tracing::warn!("Skipping message at {}: {}", message.partition, e);
                    }
                }
                let report = self.reseek_to_latest();
                self.last_reseek = Some(report);
            }
        }
        true
    }

    /// Moves every partition that is far enough behind to its high watermark.
    pub fn reseek_to_latest(&mut self) -> ReseekReport {
        let mut report = ReseekReport::default();
        let assignment = match self.client.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                tracing::warn!("Could not read assignment: {}", e);
                return report;
            }
        };

        let mut targets = Vec::with_capacity(assignment.len());
        for partition in assignment {
            let position = match self.client.position(&partition) {
                Ok(position) => position,
                Err(e) => {
                    tracing::warn!("Could not read position of {}: {}", partition, e);
                    None
                }
            };
            let keep = PartitionOffset::new(
                partition.clone(),
                position.map_or(Offset::Stored, Offset::At),
            );

            let (low, high) = match self
                .client
                .query_watermarks(&partition, self.policy.watermark_timeout)
            {
                Ok(watermarks) => watermarks,
                Err(e) => {
                    tracing::warn!("Skipping reseek of {}: {}", partition, e);
                    report.failed += 1;
                    targets.push(keep);
                    continue;
                }
            };

            let gap = high - position.unwrap_or(low);
            if gap > 0 && gap >= self.policy.min_gap {
                report.reseeked.push((partition.clone(), high));
                report.discarded += gap;
                targets.push(PartitionOffset::new(partition, Offset::At(high)));
            } else {
                report.skipped += 1;
                targets.push(keep);
            }
        }

        if report.reseeked.is_empty() {
            return report;
        }

        // one assign call covers every partition, so a failure leaves all of them in place
        if let Err(e) = self.client.assign(&targets) {
            let partitions: Vec<String> = report
                .reseeked
                .iter()
                .map(|(partition, _)| partition.to_string())
                .collect();
            tracing::warn!("Reseek of {} failed: {}", partitions.join(", "), e);
            report.failed += report.reseeked.len();
            report.reseeked.clear();
            report.discarded = 0;
            return report;
        }

        for (partition, high) in &report.reseeked {
            tracing::debug!("Reseeked {} to {}", partition, high);
        }
        self.metrics.record_reseek(report.discarded as u64);
        report
    }
}
