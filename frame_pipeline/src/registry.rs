use crate::{
    codec::FrameEnvelope,
    config::{Config, ModelFamily},
    inference::{ImagenetClassifier, InferenceError, LabelTable, SENTINEL_LABEL},
    overlay::{self, OverlayLine, OverlayStyle, RenderError},
    supervisor::Supervisor,
    telemetry::Metrics,
    worker::{InferenceWorker, ModelHandler},
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model {0}: {1}")]
    UnknownFamily(String, String),
    #[error("Model {0}: {1}")]
    Inference(String, InferenceError),
}

pub struct ModelSlot {
    worker: Box<dyn ModelHandler>,
    last_prediction: String,
}

impl ModelSlot {
    pub fn name(&self) -> &str {
        self.worker.name()
    }

    pub fn last_prediction(&self) -> &str {
        &self.last_prediction
    }
}

pub struct WorkerRegistry {
    slots: Vec<ModelSlot>,
    style: OverlayStyle,
}

impl WorkerRegistry {
    pub fn new(style: OverlayStyle) -> Self {
        Self {
            slots: Vec::new(),
            style,
        }
    }

    /// Builds one supervised worker per configured model, in configuration order.
    pub fn from_config(
        config: &Config,
        supervisor: &Supervisor,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new(OverlayStyle::from(&config.overlay));

        for model in &config.models {
            let family = ModelFamily::try_from(model.family())
                .map_err(|e| RegistryError::UnknownFamily(model.name.clone(), e))?;
            let labels = LabelTable::load(&model.labels)
                .map_err(|e| RegistryError::Inference(model.name.clone(), e))?;

            let worker = match family {
                ModelFamily::Imagenet => {
                    let predictor =
                        ImagenetClassifier::new(model, labels, config.sink.jpeg_quality)
                            .map_err(|e| RegistryError::Inference(model.name.clone(), e))?;
                    InferenceWorker::spawn(&model.name, predictor, supervisor, metrics.clone())
                }
            };
            tracing::info!(model = %model.name, url = %model.url, "Registered model");
            registry.register(Box::new(worker));
        }

        Ok(registry)
    }

    pub fn register(&mut self, worker: Box<dyn ModelHandler>) {
        self.slots.push(ModelSlot {
            worker,
            last_prediction: SENTINEL_LABEL.to_string(),
        });
    }

    pub fn slots(&self) -> &[ModelSlot] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn dispatch(&mut self, frame: &FrameEnvelope) {
        for slot in &mut self.slots {
            slot.worker.post(frame);
            if let Some(label) = slot.worker.get() {
                slot.last_prediction = label;
            }
        }
    }

    /// Overlay text and anchor for every slot, one line per slot in registration order.
    pub fn overlay(&self) -> Vec<OverlayLine> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| OverlayLine {
                text: format!("{}: {}", slot.name(), slot.last_prediction),
                x: self.style.x,
                y: index as i32 * self.style.line_height + self.style.base_offset,
            })
            .collect()
    }

    pub fn render(&self, frame: &FrameEnvelope) -> Result<FrameEnvelope, RenderError> {
        if self.slots.is_empty() {
            return Ok(frame.clone());
        }
        overlay::draw(frame, &self.overlay(), &self.style)
    }
}
