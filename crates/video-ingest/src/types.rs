use anyhow::Error;
use chrono::Utc;
use image::{ImageFormat, RgbImage, codecs::jpeg::JpegEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decoded image matrix: `height` rows of `width` pixels, `format.channels()`
/// bytes per pixel, no row padding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: PixelFormat,
}

/// Sample layout of a [`Frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("frame buffer holds {actual} bytes, which does not fit {width}x{height} {format:?}")]
    FrameSize {
        width: u32,
        height: u32,
        format: PixelFormat,
        /// `None` when the geometry does not fit in memory at all.
        expected: Option<usize>,
        actual: usize,
    },
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
    #[error(transparent)]
    Other(#[from] Error),
}

impl Frame {
    /// Wrap a raw pixel buffer, checking that its length matches the geometry.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, CaptureError> {
        let expected = Self::expected_len(width, height, format);
        if width == 0 || height == 0 || expected != Some(data.len()) {
            return Err(CaptureError::FrameSize {
                width,
                height,
                format,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            format,
        })
    }

    /// Decode a compressed JPEG into an RGB frame.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self, CaptureError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8();
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgb8)
    }

    /// Buffer length for the geometry, or `None` if the product overflows.
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> Option<usize> {
        usize::try_from(width)
            .ok()?
            .checked_mul(usize::try_from(height).ok()?)?
            .checked_mul(format.channels())
    }

    /// Copy the frame into an RGB image regardless of the source layout.
    pub fn to_rgb_image(&self) -> Result<RgbImage, CaptureError> {
        let rgb = match self.format {
            PixelFormat::Rgb8 => self.data.clone(),
            PixelFormat::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
        };
        RgbImage::from_raw(self.width, self.height, rgb).ok_or(CaptureError::FrameSize {
            width: self.width,
            height: self.height,
            format: self.format,
            expected: Self::expected_len(self.width, self.height, self.format),
            actual: self.data.len(),
        })
    }

    /// Compress the frame to JPEG at `quality` (clamped to 1..=100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, CaptureError> {
        encode_rgb_jpeg(&self.to_rgb_image()?, quality)
    }
}

/// JPEG-encode an RGB image.
pub fn encode_rgb_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_buffer_with_wrong_length() {
        let err = Frame::new(vec![0; 11], 2, 2, PixelFormat::Bgr8).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FrameSize {
                expected: Some(12),
                actual: 11,
                ..
            }
        ));
    }

    #[test]
    fn overflowing_geometry_is_rejected() {
        assert_eq!(
            Frame::expected_len(u32::MAX, u32::MAX, PixelFormat::Bgr8),
            None
        );
        // Wraps to exactly 26 bytes under unchecked multiplication.
        let err = Frame::new(vec![0; 26], 2_007_567_422, 3_062_868_337, PixelFormat::Bgr8)
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::FrameSize {
                expected: None,
                actual: 26,
                ..
            }
        ));
    }

    #[test]
    fn rejects_empty_geometry() {
        assert!(Frame::new(Vec::new(), 0, 4, PixelFormat::Gray8).is_err());
    }

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let frame = Frame::new(vec![1, 2, 3], 1, 1, PixelFormat::Bgr8).unwrap();
        let rgb = frame.to_rgb_image().unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [3, 2, 1]);
    }

    #[test]
    fn gray_expands_to_three_channels() {
        let frame = Frame::new(vec![7, 9], 2, 1, PixelFormat::Gray8).unwrap();
        let rgb = frame.to_rgb_image().unwrap();
        assert_eq!(rgb.get_pixel(1, 0).0, [9, 9, 9]);
    }

    #[test]
    fn jpeg_output_decodes_with_same_geometry() {
        let frame = Frame::new(vec![128; 16 * 8 * 3], 16, 8, PixelFormat::Bgr8).unwrap();
        let jpeg = frame.to_jpeg(80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = Frame::from_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width, decoded.height), (16, 8));
        assert_eq!(decoded.format, PixelFormat::Rgb8);
    }

    #[test]
    fn garbage_jpeg_is_a_codec_error() {
        let err = Frame::from_jpeg(b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, CaptureError::Codec(_)));
    }
}
