//! JPEG encoding and the chunk framings written to HTTP clients.

use std::time::Instant;

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use image::RgbImage;
use serde::Serialize;
use video_ingest::{CaptureError, Frame, encode_rgb_jpeg};

pub(crate) const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub(crate) const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

#[derive(Serialize)]
struct FrameEvent<'a> {
    camera_id: &'a str,
    frame: String,
}

/// Encode a stored frame for a viewer, recording the encode latency under `stage`.
pub(crate) fn encode_frame(
    frame: &Frame,
    quality: u8,
    stage: &'static str,
) -> Result<Vec<u8>, CaptureError> {
    let started = Instant::now();
    let result = frame.to_jpeg(quality);
    record(stage, started, result.is_ok());
    result
}

pub(crate) fn encode_image(
    image: &RgbImage,
    quality: u8,
    stage: &'static str,
) -> Result<Vec<u8>, CaptureError> {
    let started = Instant::now();
    let result = encode_rgb_jpeg(image, quality);
    record(stage, started, result.is_ok());
    result
}

fn record(stage: &'static str, started: Instant, ok: bool) {
    metrics::histogram!("hub_jpeg_encode_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
    if !ok {
        metrics::counter!("hub_encode_errors_total", "stage" => stage).increment(1);
    }
}

/// One part of a `multipart/x-mixed-replace` stream.
pub(crate) fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(jpeg.len() + 48);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// One Server-Sent Event carrying a base64 JPEG for `camera_id`.
pub(crate) fn sse_event(camera_id: &str, jpeg: &[u8]) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(&FrameEvent {
        camera_id,
        frame: STANDARD.encode(jpeg),
    })?;
    let mut chunk = String::with_capacity(json.len() + 8);
    chunk.push_str("data: ");
    chunk.push_str(&json);
    chunk.push_str("\n\n");
    Ok(Bytes::from(chunk))
}

#[cfg(test)]
mod tests {
    use video_ingest::PixelFormat;

    use super::*;

    #[test]
    fn multipart_chunk_layout() {
        let chunk = multipart_chunk(b"\xFF\xD8JPEG");
        assert_eq!(
            &chunk[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8JPEG\r\n"
        );
    }

    #[test]
    fn sse_event_carries_camera_and_base64_frame() {
        let chunk = sse_event("gate", &[1, 2, 3]).unwrap();
        let text = std::str::from_utf8(&chunk).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        let value: serde_json::Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(value["camera_id"], "gate");
        assert_eq!(value["frame"], "AQID");
    }

    #[test]
    fn encoded_frame_is_jpeg() {
        let frame = Frame::new(vec![200; 16 * 16], 16, 16, PixelFormat::Gray8).unwrap();
        let jpeg = encode_frame(&frame, 85, "test").unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
