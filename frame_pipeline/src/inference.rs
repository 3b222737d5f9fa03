use crate::{
    codec::{CodecError, FrameEnvelope},
    config::ModelConfig,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use thiserror::Error;
use tracing::instrument;

/// Placeholder shown before a model answers and whenever a class has no label.
pub const SENTINEL_LABEL: &str = "Nothing";

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to read label file {0}: {1}")]
    LabelFile(String, std::io::Error),
    #[error("Invalid label file {0}: {1}")]
    LabelFormat(String, serde_json::Error),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] CodecError),
    #[error("Inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Inference endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("Inference response carried no predictions")]
    EmptyResponse,
}

/// Class index to label mapping, keyed by `class - 1` as the serving model reports it.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<i64, String>,
}

impl LabelTable {
    pub fn new(labels: HashMap<i64, String>) -> Self {
        Self { labels }
    }

    pub fn load(path: &Path) -> Result<Self, InferenceError> {
        let display = path.display().to_string();
        let data = std::fs::read(path).map_err(|e| InferenceError::LabelFile(display.clone(), e))?;
        let labels: HashMap<i64, String> =
            serde_json::from_slice(&data).map_err(|e| InferenceError::LabelFormat(display, e))?;
        Ok(Self { labels })
    }

    pub fn lookup(&self, class: i64) -> &str {
        self.labels
            .get(&(class - 1))
            .map(String::as_str)
            .unwrap_or(SENTINEL_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One remote model call: frame in, label out.
#[async_trait]
pub trait Predictor: Send + Sync + 'static {
    async fn predict(&self, frame: &FrameEnvelope) -> Result<String, InferenceError>;
}

#[derive(Serialize)]
struct InferRequest {
    instances: Vec<Instance>,
}

#[derive(Serialize)]
struct Instance {
    // serving decodes `_bytes` suffixed fields as binary
    image_bytes: EncodedImage,
}

#[derive(Serialize)]
struct EncodedImage {
    b64: String,
}

#[derive(Deserialize)]
struct InferResponse {
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    classes: i64,
    #[serde(default)]
    #[allow(dead_code)]
    probabilities: Vec<f64>,
}

/// TF-Serving style image classifier reached over HTTP.
pub struct ImagenetClassifier {
    client: reqwest::Client,
    url: String,
    labels: LabelTable,
    jpeg_quality: u8,
}

impl ImagenetClassifier {
    pub fn new(
        model: &ModelConfig,
        labels: LabelTable,
        jpeg_quality: u8,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(model.request_timeout())
            .build()?;
        Ok(Self {
            client,
            url: model.url.clone(),
            labels,
            jpeg_quality,
        })
    }
}

#[async_trait]
impl Predictor for ImagenetClassifier {
    #[instrument(skip(self, frame), fields(url = %self.url))]
    async fn predict(&self, frame: &FrameEnvelope) -> Result<String, InferenceError> {
        let jpeg = frame.to_jpeg(self.jpeg_quality)?;
        let request = InferRequest {
            instances: vec![Instance {
                image_bytes: EncodedImage {
                    b64: STANDARD.encode(&jpeg),
                },
            }],
        };

        let response = self.client.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(InferenceError::Status(response.status()));
        }

        let body: InferResponse = response.json().await?;
        let prediction = body
            .predictions
            .first()
            .ok_or(InferenceError::EmptyResponse)?;
        let label = self.labels.lookup(prediction.classes);

        tracing::debug!("Class {} mapped to {}", prediction.classes, label);
        Ok(label.to_string())
    }
}
