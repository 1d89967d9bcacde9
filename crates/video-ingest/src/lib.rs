//! Decoded frames and the sources that produce them.
//!
//! `Frame` is the unit shared by the hub's frame store, the wire protocol and
//! the detection pipeline. `FrameSource` is the pull interface the detection
//! pipeline and the publisher read from; `FfmpegSource` implements it over an
//! ffmpeg child process emitting raw BGR24.

mod ffmpeg;
mod source;
mod types;

pub use ffmpeg::FfmpegSource;
pub use source::{FrameSource, ScopedSource};
pub use types::{CaptureError, Frame, PixelFormat, encode_rgb_jpeg};
