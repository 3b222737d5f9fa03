use crate::{
    broker::{BrokerError, BrokerProducer, DeliveryReport},
    codec::{CodecError, FrameEnvelope},
    display::DisplayError,
    telemetry::Metrics,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to encode frame: {0}")]
    Codec(#[from] CodecError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Display error: {0}")]
    Display(#[from] DisplayError),
}

/// Where annotated frames go once the overlay is drawn.
pub trait FrameSink: Send {
    fn send(&self, frame: &FrameEnvelope) -> Result<(), SinkError>;

    /// Waits up to `timeout` for frames still in flight.
    fn flush(&self, timeout: Duration) -> Result<(), SinkError>;
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn send(&self, frame: &FrameEnvelope) -> Result<(), SinkError> {
        (**self).send(frame)
    }

    fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        (**self).flush(timeout)
    }
}

/// Writes annotated frames back to the broker under a fixed key.
pub struct RepublishSink<P> {
    producer: P,
    topic: String,
    key: String,
    metrics: Arc<Metrics>,
}

impl<P: BrokerProducer> RepublishSink<P> {
    pub fn new(producer: P, topic: &str, key: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
            key: key.to_string(),
            metrics,
        }
    }
}

impl<P: BrokerProducer> FrameSink for RepublishSink<P> {
    fn send(&self, frame: &FrameEnvelope) -> Result<(), SinkError> {
        let payload = frame.encode()?;
        self.producer.publish(&self.topic, &self.key, &payload)?;
        self.metrics.record_frame_published();
        Ok(())
    }

    fn flush(&self, timeout: Duration) -> Result<(), SinkError> {
        tracing::info!("Flushing pending deliveries to {}", self.topic);
        Ok(self.producer.flush(timeout)?)
    }
}

/// Logs delivery outcomes reported by the producer until it goes away.
pub async fn drain_delivery_reports(
    mut reports: mpsc::Receiver<DeliveryReport>,
    metrics: Arc<Metrics>,
) {
    while let Some(report) = reports.recv().await {
        match report.result {
            Ok(offset) => {
                tracing::debug!("Delivered frame to {} at offset {}", report.partition, offset);
            }
            Err(e) => {
                metrics.record_delivery_failure();
                tracing::warn!("Delivery to {} failed: {}", report.partition, e);
            }
        }
    }
    tracing::debug!("Delivery report channel closed");
}
