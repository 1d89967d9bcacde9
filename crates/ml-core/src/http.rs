//! Client for a detection service reachable over HTTP.
//!
//! Each call POSTs the frame as `image/jpeg` and expects
//! `{"detections": [{"label", "confidence", "bbox"}]}` back.

use std::time::Duration;

use reqwest::{
    blocking::Client,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Deserialize;
use tracing::trace;
use video_ingest::Frame;

use crate::detector::{Detection, Detector, DetectorError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_JPEG_QUALITY: u8 = 90;

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct HttpDetector {
    client: Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, DetectorError> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl Detector for HttpDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let jpeg = frame.to_jpeg(UPLOAD_JPEG_QUALITY)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "image/jpeg")
            .header(ACCEPT, "application/json")
            .body(jpeg)
            .send()?
            .error_for_status()?;
        let body = response.text()?;
        let parsed = parse_response(&body)?;
        trace!(
            "detector {} returned {} detections",
            self.endpoint,
            parsed.len()
        );
        Ok(parsed)
    }
}

fn parse_response(body: &str) -> Result<Vec<Detection>, DetectorError> {
    let parsed: DetectResponse = serde_json::from_str(body)
        .map_err(|err| DetectorError::InvalidResponse(err.to_string()))?;
    for detection in &parsed.detections {
        if !detection.confidence.is_finite() || detection.bbox.iter().any(|v| !v.is_finite()) {
            return Err(DetectorError::InvalidResponse(format!(
                "non-finite values in detection {:?}",
                detection.label
            )));
        }
    }
    Ok(parsed.detections)
}
