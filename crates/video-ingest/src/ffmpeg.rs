use std::{
    io::{ErrorKind, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::{
    source::FrameSource,
    types::{CaptureError, Frame, PixelFormat},
};

/// Decodes any ffmpeg-readable input (file, RTSP, V4L device) into BGR8 frames
/// scaled to a fixed size, read sequentially from the child's stdout.
pub struct FfmpegSource {
    uri: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    target_size: (u32, u32),
    frame_len: usize,
    sequence: u64,
}

impl FfmpegSource {
    pub fn open(uri: &str, target_size: (u32, u32)) -> Result<Self, CaptureError> {
        let frame_len = match Frame::expected_len(target_size.0, target_size.1, PixelFormat::Bgr8) {
            Some(len) if len > 0 => len,
            _ => {
                return Err(CaptureError::Other(anyhow!(
                    "target size must be non-zero and addressable, got {}x{}",
                    target_size.0,
                    target_size.1
                )));
            }
        };
        if is_local_path(uri) && !Path::new(uri).exists() {
            return Err(CaptureError::Open {
                uri: uri.to_string(),
            });
        }

        let mut cmd = ffmpeg_command(uri, target_size);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };
        debug!("ffmpeg source opened for {uri}");

        Ok(Self {
            uri: uri.to_string(),
            child: Some(child),
            stdout: Some(stdout),
            target_size,
            frame_len,
            sequence: 0,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let (width, height) = self.target_size;
        let mut buffer = vec![0u8; self.frame_len];

        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                self.sequence += 1;
                Frame::new(buffer, width, height, PixelFormat::Bgr8).map(Some)
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(CaptureError::Other(err.into())),
        }
    }

    fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                if err.kind() != ErrorKind::InvalidInput {
                    warn!("failed to stop ffmpeg for {}: {err}", self.uri);
                }
            }
            let _ = child.wait();
            debug!(
                "ffmpeg source for {} released after {} frames",
                self.uri, self.sequence
            );
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn ffmpeg_command(uri: &str, target_size: (u32, u32)) -> Command {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    let input = if let Some(index) = parse_device_index(uri) {
        cmd.arg("-f").arg("video4linux2");
        format!("/dev/video{index}")
    } else if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
        cmd.arg("-rtsp_transport")
            .arg("tcp")
            .arg("-fflags")
            .arg("nobuffer")
            .arg("-flags")
            .arg("low_delay");
        uri.to_string()
    } else {
        uri.to_string()
    };

    cmd.arg("-i")
        .arg(input)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

/// Parse a `/dev/videoX` style URI (or a bare index) and return the index.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<u32>().ok();
    }
    None
}

fn is_local_path(uri: &str) -> bool {
    !uri.contains("://") && parse_device_index(uri).is_none()
}
