//! Configuration parsing for the hub and the publisher.
//!
//! CLI arguments are collected by clap into `*CliArgs` structs and validated
//! into the config structs the rest of the crate consumes.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;

use crate::hub::detection::DetectionFilter;

pub(crate) const DEFAULT_FRAME_SKIP: u64 = 3;
pub(crate) const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
/// Everything `serve` needs.
pub struct HubConfig {
    /// Address the HTTP viewer endpoints bind to.
    pub http_bind: SocketAddr,
    /// Ingestion endpoint settings.
    pub receiver: ReceiverConfig,
    /// Viewer stream settings.
    pub viewer: ViewerConfig,
    /// Detection stream settings.
    pub detection: DetectionConfig,
    /// Evict cameras that have not published for this long. `None` keeps every
    /// camera for the life of the process.
    pub stale_after: Option<Duration>,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    pub bind: SocketAddr,
    /// Wait between a failed endpoint and the next attempt.
    pub backoff: Duration,
    /// Largest accepted request frame.
    pub max_message_bytes: usize,
}

impl ReceiverConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            backoff: DEFAULT_BACKOFF,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ViewerConfig {
    pub jpeg_quality: u8,
    /// Upper bound on how long a viewer waits for a store update before
    /// re-checking its camera.
    pub poll_interval: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DetectionConfig {
    /// Server-resident video behind `GET /video`.
    pub video_path: Option<PathBuf>,
    /// Camera id → source URI for the SSE variant.
    pub streams: BTreeMap<String, String>,
    /// Process every Nth decoded frame.
    pub frame_skip: u64,
    /// Detection service URL; `None` streams frames without detections.
    pub detector_url: Option<String>,
    pub filter: DetectionFilter,
    /// Size `/video` decodes its file at; ffmpeg scales to it.
    pub frame_size: (u32, u32),
    pub jpeg_quality: u8,
    /// Size frames are decoded at for the SSE variant.
    pub event_frame_size: (u32, u32),
    pub event_jpeg_quality: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            video_path: None,
            streams: BTreeMap::new(),
            frame_skip: DEFAULT_FRAME_SKIP,
            detector_url: None,
            filter: DetectionFilter::default(),
            frame_size: (640, 480),
            jpeg_quality: 85,
            event_frame_size: (640, 480),
            event_jpeg_quality: 70,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct HubCliArgs {
    /// HTTP bind address for viewers.
    #[arg(long = "http-bind", value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub http_bind: SocketAddr,
    /// Bind address of the frame ingestion endpoint.
    #[arg(long = "ingest-bind", value_name = "ADDR", default_value = "0.0.0.0:5555")]
    pub ingest_bind: SocketAddr,
    /// Seconds to wait before reopening a failed ingestion endpoint.
    #[arg(long = "backoff-secs", value_name = "SECS", default_value_t = 5)]
    pub backoff_secs: u64,
    /// Largest accepted frame message in bytes.
    #[arg(long = "max-message-bytes", value_name = "BYTES")]
    pub max_message_bytes: Option<usize>,
    /// JPEG quality of viewer streams (1-100).
    #[arg(long = "jpeg-quality", value_name = "QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
    /// Longest a viewer waits for a new frame before re-checking.
    #[arg(long = "viewer-poll-ms", value_name = "MS", default_value_t = 100)]
    pub viewer_poll_ms: u64,
    /// Forget cameras that have not published for this many seconds.
    #[arg(long = "stale-after-secs", value_name = "SECS")]
    pub stale_after_secs: Option<u64>,
    /// Video file served by `GET /video`.
    #[arg(long = "video-path", value_name = "PATH")]
    pub video_path: Option<PathBuf>,
    /// Width `/video` decodes at; set to the file's native width to avoid
    /// scaling (default: --detect-width).
    #[arg(long = "video-width", value_name = "PX")]
    pub video_width: Option<u32>,
    /// Height `/video` decodes at (default: --detect-height).
    #[arg(long = "video-height", value_name = "PX")]
    pub video_height: Option<u32>,
    /// Detection event stream source, as `camera_id=uri` (repeatable).
    #[arg(long = "stream", value_name = "CAMERA=URI")]
    pub streams: Vec<String>,
    /// Process every Nth frame of a detection source.
    #[arg(long = "frame-skip", value_name = "N", default_value_t = DEFAULT_FRAME_SKIP)]
    pub frame_skip: u64,
    /// Detection service endpoint.
    #[arg(long = "detector-url", value_name = "URL", env = "FRAME_HUB_DETECTOR_URL")]
    pub detector_url: Option<String>,
    /// Label drawn on detection frames (repeatable, default: every label).
    #[arg(long = "target-class", value_name = "LABEL")]
    pub target_classes: Vec<String>,
    /// Minimum confidence for a detection to be drawn.
    #[arg(long = "min-confidence", value_name = "SCORE", default_value_t = 0.5)]
    pub min_confidence: f32,
    /// Width detection event frames are decoded at.
    #[arg(long = "detect-width", value_name = "PX", default_value_t = 640)]
    pub detect_width: u32,
    /// Height detection event frames are decoded at.
    #[arg(long = "detect-height", value_name = "PX", default_value_t = 480)]
    pub detect_height: u32,
    /// JPEG quality of detection event frames (1-100).
    #[arg(long = "event-jpeg-quality", value_name = "QUALITY", default_value_t = 70)]
    pub event_jpeg_quality: u8,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<HubCliArgs> for HubConfig {
    type Error = anyhow::Error;

    fn try_from(args: HubCliArgs) -> Result<Self> {
        if args.backoff_secs == 0 {
            bail!("--backoff-secs must be at least 1");
        }
        validate_quality("--jpeg-quality", args.jpeg_quality)?;
        validate_quality("--event-jpeg-quality", args.event_jpeg_quality)?;
        if args.viewer_poll_ms == 0 {
            bail!("--viewer-poll-ms must be at least 1");
        }
        if args.frame_skip == 0 {
            bail!("--frame-skip must be at least 1");
        }
        if !(0.0..=1.0).contains(&args.min_confidence) {
            bail!("--min-confidence must be between 0 and 1");
        }
        if args.detect_width == 0 || args.detect_height == 0 {
            bail!("Detection frame dimensions must be positive integers");
        }
        let video_size = (
            args.video_width.unwrap_or(args.detect_width),
            args.video_height.unwrap_or(args.detect_height),
        );
        if video_size.0 == 0 || video_size.1 == 0 {
            bail!("--video-width and --video-height must be positive integers");
        }
        let stale_after = match args.stale_after_secs {
            Some(0) => bail!("--stale-after-secs must be at least 1"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        let max_message_bytes = args.max_message_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        if max_message_bytes < 1024 {
            bail!("--max-message-bytes must be at least 1024");
        }

        let mut streams = BTreeMap::new();
        for entry in &args.streams {
            let (camera_id, uri) = parse_stream(entry)?;
            if streams.insert(camera_id.clone(), uri).is_some() {
                bail!("--stream {camera_id} given more than once");
            }
        }

        let detector_url = args.detector_url.filter(|url| !url.trim().is_empty());

        Ok(Self {
            http_bind: args.http_bind,
            receiver: ReceiverConfig {
                backoff: Duration::from_secs(args.backoff_secs),
                max_message_bytes,
                ..ReceiverConfig::new(args.ingest_bind)
            },
            viewer: ViewerConfig {
                jpeg_quality: args.jpeg_quality,
                poll_interval: Duration::from_millis(args.viewer_poll_ms),
            },
            detection: DetectionConfig {
                video_path: args.video_path,
                streams,
                frame_skip: args.frame_skip,
                detector_url,
                filter: DetectionFilter::new(args.target_classes, args.min_confidence),
                frame_size: video_size,
                jpeg_quality: args.jpeg_quality,
                event_frame_size: (args.detect_width, args.detect_height),
                event_jpeg_quality: args.event_jpeg_quality,
            },
            stale_after,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

#[derive(Clone, Debug)]
/// Everything `publish` needs.
pub struct PublishConfig {
    /// Hub ingestion endpoint, `host:port`.
    pub hub_addr: String,
    pub camera_id: String,
    pub source_uri: String,
    pub frame_size: (u32, u32),
    /// Send JPEG at this quality instead of raw pixels.
    pub jpeg_quality: Option<u8>,
    /// Wait after a failed send before reconnecting.
    pub reconnect_delay: Duration,
    /// Give up on an acknowledgment after this long.
    pub ack_timeout: Duration,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `publish` subcommand.
#[derive(Debug, Args)]
pub struct PublishCliArgs {
    /// Camera identifier announced to the hub.
    #[arg(value_name = "CAMERA_ID")]
    pub camera_id: String,
    /// Video source (file, RTSP URL or V4L device).
    #[arg(value_name = "SOURCE")]
    pub source_uri: String,
    /// Hub ingestion endpoint.
    #[arg(long = "hub", value_name = "HOST:PORT", default_value = "127.0.0.1:5555")]
    pub hub_addr: String,
    /// Frame width.
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: u32,
    /// Frame height.
    #[arg(long = "height", value_name = "PX", default_value_t = 480)]
    pub height: u32,
    /// Compress frames to JPEG at this quality before sending.
    #[arg(long = "jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<u8>,
    /// Seconds to wait before reconnecting after a failed send.
    #[arg(long = "reconnect-secs", value_name = "SECS", default_value_t = 2)]
    pub reconnect_secs: u64,
    /// Seconds to wait for each acknowledgment.
    #[arg(long = "ack-timeout-secs", value_name = "SECS", default_value_t = 10)]
    pub ack_timeout_secs: u64,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<PublishCliArgs> for PublishConfig {
    type Error = anyhow::Error;

    fn try_from(args: PublishCliArgs) -> Result<Self> {
        if args.camera_id.trim().is_empty() {
            bail!("Camera id must not be empty");
        }
        if args.width == 0 || args.height == 0 {
            bail!("Frame width and height must be positive integers");
        }
        if let Some(quality) = args.jpeg_quality {
            validate_quality("--jpeg-quality", quality)?;
        }
        if args.ack_timeout_secs == 0 {
            bail!("--ack-timeout-secs must be at least 1");
        }
        Ok(Self {
            hub_addr: args.hub_addr,
            camera_id: args.camera_id,
            source_uri: args.source_uri,
            frame_size: (args.width, args.height),
            jpeg_quality: args.jpeg_quality,
            reconnect_delay: Duration::from_secs(args.reconnect_secs),
            ack_timeout: Duration::from_secs(args.ack_timeout_secs),
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}

fn validate_quality(flag: &str, quality: u8) -> Result<()> {
    if !(1..=100).contains(&quality) {
        bail!("{flag} must be an integer between 1 and 100");
    }
    Ok(())
}

fn parse_stream(entry: &str) -> Result<(String, String)> {
    let (camera_id, uri) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("--stream expects CAMERA=URI, got {entry:?}"))?;
    let camera_id = camera_id.trim();
    let uri = uri.trim();
    if camera_id.is_empty() || uri.is_empty() {
        bail!("--stream expects CAMERA=URI, got {entry:?}");
    }
    Ok((camera_id.to_string(), uri.to_string()))
}
