//! Wire format of the ingestion endpoint.
//!
//! Every request and reply is one length-delimited frame (4-byte big-endian
//! length prefix). A request body is a bincode `FrameMessage`; the reply body
//! is the two bytes `OK`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;
use video_ingest::{CaptureError, Frame, PixelFormat};

pub(crate) const ACK: &[u8] = b"OK";

/// Length prefix size used by both ends.
pub(crate) const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FrameMessage {
    pub(crate) camera_id: String,
    pub(crate) payload: FramePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FramePayload {
    Raw {
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    },
    Jpeg(Vec<u8>),
}

#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    #[error("malformed frame message: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("frame message carries an empty camera id")]
    EmptyCameraId,
    #[error("invalid raw frame from camera {camera:?}: {source}")]
    InvalidFrame {
        camera: String,
        #[source]
        source: CaptureError,
    },
    #[error("expected acknowledgment, got {0:?}")]
    UnexpectedAck(Vec<u8>),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of decoding one request.
#[derive(Debug)]
pub(crate) enum Ingest {
    Frame { camera_id: String, frame: Frame },
    /// Well-formed message whose JPEG body did not decode. Acknowledged and
    /// dropped.
    Undecodable {
        camera_id: String,
        error: CaptureError,
    },
}

impl FrameMessage {
    pub(crate) fn raw(camera_id: impl Into<String>, frame: Frame) -> Self {
        Self {
            camera_id: camera_id.into(),
            payload: FramePayload::Raw {
                width: frame.width,
                height: frame.height,
                format: frame.format,
                data: frame.data,
            },
        }
    }

    pub(crate) fn jpeg(camera_id: impl Into<String>, jpeg: Vec<u8>) -> Self {
        Self {
            camera_id: camera_id.into(),
            payload: FramePayload::Jpeg(jpeg),
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decode a request body into a frame ready for the store.
///
/// Bincode failures, empty camera ids and raw matrices whose length disagrees
/// with their geometry are transport errors. A JPEG that fails to decode is
/// reported as [`Ingest::Undecodable`].
pub(crate) fn decode_request(bytes: &[u8]) -> Result<Ingest, ProtocolError> {
    let FrameMessage { camera_id, payload } = FrameMessage::decode(bytes)?;
    if camera_id.is_empty() {
        return Err(ProtocolError::EmptyCameraId);
    }
    match payload {
        FramePayload::Raw {
            width,
            height,
            format,
            data,
        } => match Frame::new(data, width, height, format) {
            Ok(frame) => Ok(Ingest::Frame { camera_id, frame }),
            Err(source) => Err(ProtocolError::InvalidFrame {
                camera: camera_id,
                source,
            }),
        },
        FramePayload::Jpeg(jpeg) => match Frame::from_jpeg(&jpeg) {
            Ok(frame) => Ok(Ingest::Frame { camera_id, frame }),
            Err(error) => Ok(Ingest::Undecodable { camera_id, error }),
        },
    }
}

pub(crate) fn codec(max_message_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(LENGTH_PREFIX_BYTES)
        .max_frame_length(max_message_bytes)
        .new_codec()
}
