//! Non-blocking bridge between the consume loop and one remote model.

use crate::{
    codec::FrameEnvelope,
    inference::{Predictor, SENTINEL_LABEL},
    supervisor::Supervisor,
    telemetry::Metrics,
};
use std::{sync::Arc, time::Instant};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    watch, Mutex,
};

/// What the registry needs from a model, whatever its family.
pub trait ModelHandler: Send {
    fn name(&self) -> &str;

    /// Offers a frame to the model. Never blocks; the frame is dropped if the model is busy.
    fn post(&self, frame: &FrameEnvelope);

    /// Returns the newest label if one arrived since the previous call.
    fn get(&mut self) -> Option<String>;
}

struct WorkerShared<P> {
    name: String,
    predictor: P,
    // Kept outside the run loop so a restart does not lose the slots.
    input: Mutex<mpsc::Receiver<FrameEnvelope>>,
    output: watch::Sender<String>,
    metrics: Arc<Metrics>,
}

pub struct InferenceWorker {
    name: String,
    input: mpsc::Sender<FrameEnvelope>,
    output: watch::Receiver<String>,
    metrics: Arc<Metrics>,
}

impl InferenceWorker {
    /// Starts the supervised run loop and publishes the sentinel label.
    pub fn spawn<P: Predictor>(
        name: &str,
        predictor: P,
        supervisor: &Supervisor,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(1);
        let (output_tx, output_rx) = watch::channel(String::new());
        output_tx.send_replace(SENTINEL_LABEL.to_string());

        let shared = Arc::new(WorkerShared {
            name: name.to_string(),
            predictor,
            input: Mutex::new(input_rx),
            output: output_tx,
            metrics: metrics.clone(),
        });

        supervisor.supervise(&format!("worker:{}", name), move || run(shared.clone()));

        Self {
            name: name.to_string(),
            input: input_tx,
            output: output_rx,
            metrics,
        }
    }
}

async fn run<P: Predictor>(shared: Arc<WorkerShared<P>>) -> anyhow::Result<()> {
    let mut input = shared.input.lock().await;
    tracing::info!(model = %shared.name, "Inference worker running");

    while let Some(frame) = input.recv().await {
        let started = Instant::now();
        match shared.predictor.predict(&frame).await {
            Ok(label) => {
                shared
                    .metrics
                    .record_inference_duration(started.elapsed().as_millis() as u64, &shared.name);
                shared.output.send_replace(label);
            }
            Err(e) => {
                tracing::warn!(model = %shared.name, "Inference failed: {}", e);
            }
        }
    }

    tracing::info!(model = %shared.name, "Inference worker input closed");
    Ok(())
}

impl ModelHandler for InferenceWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, frame: &FrameEnvelope) {
        match self.input.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_frame_dropped(&self.name);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!(model = %self.name, "Inference worker is not accepting frames");
            }
        }
    }

    fn get(&mut self) -> Option<String> {
        match self.output.has_changed() {
            Ok(true) => Some(self.output.borrow_and_update().clone()),
            _ => None,
        }
    }
}
