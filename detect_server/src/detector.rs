//! Detector boundary: asynchronous, fallible model loading and per-frame detection.
//!
use std::sync::Arc;

use async_trait::async_trait;
use common::detection::Detection;
use image::RgbImage;
use thiserror::Error;

/// Failure to bring up a detector. Terminal for the load attempt.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file {0} not found and no download URL configured")]
    MissingModel(String),
    #[error("failed to download model from {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("failed to access model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to initialize model: {0}")]
    Model(String),
    #[error("model loading task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failure of a single tick. The loop logs it and carries on.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("failed to capture frame: {0}")]
    Capture(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A loaded model detecting objects in single frames.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: RgbImage) -> Result<Vec<Detection>, DetectionError>;
}

/// Produces a ready [`Detector`].
#[async_trait]
pub trait DetectorLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn Detector>, ModelLoadError>;
}

/// Synchronous inference on one frame.
pub trait InferModel: Send + Sync + 'static {
    fn run(&self, frame: &RgbImage) -> Result<Vec<Detection>, DetectionError>;
}

/// Runs a CPU-bound [`InferModel`] on the blocking thread pool.
pub struct BlockingDetector<M> {
    model: Arc<M>,
}

impl<M: InferModel> BlockingDetector<M> {
    pub fn new(model: M) -> Self {
        Self {
            model: Arc::new(model),
        }
    }
}

#[async_trait]
impl<M: InferModel> Detector for BlockingDetector<M> {
    async fn detect(&self, frame: RgbImage) -> Result<Vec<Detection>, DetectionError> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.run(&frame)).await?
    }
}
