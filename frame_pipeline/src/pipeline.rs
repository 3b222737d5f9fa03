//! Per-frame work between the consumer and the sink.

use crate::{
    broker::BrokerConsumer,
    codec::FrameEnvelope,
    consumer::{FrameHandler, LatestOffsetConsumer},
    overlay::RenderError,
    registry::WorkerRegistry,
    sink::FrameSink,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;

/// The consumer and the pipeline it feeds, shared by the consume task and shutdown.
pub type SharedPipeline<C, S> = Arc<Mutex<(LatestOffsetConsumer<C>, Pipeline<S>)>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed,
    Failed,
    TimedOut,
}

pub struct Pipeline<S> {
    registry: WorkerRegistry,
    sink: S,
}

impl<S: FrameSink> Pipeline<S> {
    pub fn new(registry: WorkerRegistry, sink: S) -> Self {
        Self { registry, sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn annotate(&self, frame: FrameEnvelope) -> Option<FrameEnvelope> {
        match self.registry.render(&frame) {
            Ok(annotated) => Some(annotated),
            Err(RenderError::UnsupportedPixelType(code)) => {
                tracing::warn!("Forwarding frame without overlay, pixel type {}", code);
                Some(frame)
            }
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                None
            }
        }
    }
}

impl<S: FrameSink> FrameHandler for Pipeline<S> {
    fn handle(&mut self, frame: FrameEnvelope) {
        self.registry.dispatch(&frame);

        let Some(annotated) = self.annotate(frame) else {
            return;
        };
        if let Err(e) = self.sink.send(&annotated) {
            tracing::warn!("Failed to forward frame: {}", e);
        }
    }
}

/// Stops the consume loop and flushes the sink once the loop lets go of it.
///
/// Returns within `flush_timeout + poll_timeout` of the consume task ending, even when the
/// sink never finishes flushing.
pub async fn stop_and_flush<C, S>(
    shared: SharedPipeline<C, S>,
    stop: &AtomicBool,
    consume_task: JoinHandle<()>,
    flush_timeout: Duration,
    poll_timeout: Duration,
) -> FlushOutcome
where
    C: BrokerConsumer + Send + 'static,
    S: FrameSink + 'static,
{
    stop.store(true, Ordering::Relaxed);
    if let Err(e) = consume_task.await {
        tracing::error!("Consume task ended abnormally: {}", e);
    }

    let flushed = tokio::time::timeout(
        flush_timeout + poll_timeout,
        tokio::task::spawn_blocking(move || {
            // blocks until the consume loop observes the stop flag
            let guard = shared.lock();
            guard.1.sink().flush(flush_timeout)
        }),
    )
    .await;

    match flushed {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Sink flushed");
            FlushOutcome::Flushed
        }
        Ok(Ok(Err(e))) => {
            tracing::error!("Failed to flush sink: {}", e);
            FlushOutcome::Failed
        }
        Ok(Err(e)) => {
            tracing::error!("Flush task failed: {}", e);
            FlushOutcome::Failed
        }
        Err(_) => {
            tracing::error!("Timed out flushing sink");
            FlushOutcome::TimedOut
        }
    }
}
