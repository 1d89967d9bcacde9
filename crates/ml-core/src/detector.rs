use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_ingest::{CaptureError, Frame};

/// Single detection returned by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Pixel corners `[x1, y1, x2, y2]` in the coordinates of the submitted frame.
    pub bbox: [f32; 4],
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to prepare frame for detection: {0}")]
    Frame(#[from] CaptureError),
    #[error("detection request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("detector returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Object detector invoked once per sampled frame. Implementations hold no
/// per-stream state the caller relies on.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Detector that never finds anything; frames pass through unannotated.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDetector;

impl Detector for PassthroughDetector {
    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}
