//! Publishing camera frames to the input topic.

use crate::{
    broker::{BrokerError, BrokerProducer},
    codec::{CodecError, FrameEnvelope},
};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};
use thiserror::Error;

/// Consecutive empty reads after which the device is considered gone.
pub const MAX_EMPTY_READS: u32 = 30;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture device error: {0}")]
    Device(String),
    #[error("No frame from capture device after {0} attempts")]
    NoFrames(u32),
    #[error("Failed to build frame: {0}")]
    Codec(#[from] CodecError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub trait FrameSource: Send {
    /// `Ok(None)` means the device produced nothing this time.
    fn read(&mut self) -> Result<Option<FrameEnvelope>, CaptureError>;
}

pub struct CaptureLoop<S, P> {
    source: S,
    producer: P,
    topic: String,
    key: String,
    interval: Duration,
}

impl<S: FrameSource, P: BrokerProducer> CaptureLoop<S, P> {
    pub fn new(source: S, producer: P, topic: &str, key: &str, interval: Duration) -> Self {
        Self {
            source,
            producer,
            topic: topic.to_string(),
            key: key.to_string(),
            interval,
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// Publishes one frame per interval until `shutdown` is set. Returns the number published.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<u64, CaptureError> {
        let mut published = 0;
        let mut empty_reads = 0;

        while !shutdown.load(Ordering::Relaxed) {
            match self.source.read()? {
                Some(frame) => {
                    empty_reads = 0;
                    if self.publish(&frame) {
                        published += 1;
                    }
                }
                None => {
                    empty_reads += 1;
                    tracing::debug!("Empty read {}/{}", empty_reads, MAX_EMPTY_READS);
                    if empty_reads >= MAX_EMPTY_READS {
                        return Err(CaptureError::NoFrames(empty_reads));
                    }
                }
            }
            thread::sleep(self.interval);
        }

        tracing::info!("Capture stopped after {} frames", published);
        Ok(published)
    }

    fn publish(&self, frame: &FrameEnvelope) -> bool {
        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Skipping frame: {}", e);
                return false;
            }
        };
        match self.producer.publish(&self.topic, &self.key, &payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to publish frame: {}", e);
                false
            }
        }
    }
}
