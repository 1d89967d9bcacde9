//! Blocking publisher client and the `publish` command built on it.
//!
//! The client speaks the same length-delimited framing as the hub's codec
//! (4-byte big-endian prefix) over a plain `std::net::TcpStream` and blocks for
//! the `OK` reply after every frame. A failed exchange drops the connection;
//! the next send reconnects.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use video_ingest::{FfmpegSource, Frame, FrameSource, ScopedSource};

use crate::hub::{
    config::PublishConfig,
    protocol::{ACK, FrameMessage, LENGTH_PREFIX_BYTES, ProtocolError},
    telemetry,
};

/// Replies longer than this are never a valid acknowledgment.
const MAX_REPLY_BYTES: usize = 64;

pub(crate) struct Publisher {
    addr: String,
    ack_timeout: Duration,
    stream: Option<TcpStream>,
}

impl Publisher {
    /// Create a publisher that connects lazily on the first send.
    pub(crate) fn new(addr: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            ack_timeout,
            stream: None,
        }
    }

    pub(crate) fn send_frame(&mut self, camera_id: &str, frame: Frame) -> Result<(), ProtocolError> {
        self.send(&FrameMessage::raw(camera_id, frame))
    }

    pub(crate) fn send_jpeg(&mut self, camera_id: &str, jpeg: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(&FrameMessage::jpeg(camera_id, jpeg))
    }

    /// Send one message and wait for its acknowledgment.
    pub(crate) fn send(&mut self, message: &FrameMessage) -> Result<(), ProtocolError> {
        let body = message.encode()?;
        let result = self.exchange(&body);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn exchange(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        let len = u32::try_from(body.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame message too large")
        })?;
        let stream = self.connected()?;
        stream.write_all(&len.to_be_bytes())?;
        stream.write_all(body)?;
        stream.flush()?;

        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        stream.read_exact(&mut prefix)?;
        let reply_len = u32::from_be_bytes(prefix) as usize;
        if reply_len > MAX_REPLY_BYTES {
            return Err(ProtocolError::UnexpectedAck(prefix.to_vec()));
        }
        let mut reply = vec![0u8; reply_len];
        stream.read_exact(&mut reply)?;
        if reply != ACK {
            return Err(ProtocolError::UnexpectedAck(reply));
        }
        Ok(())
    }

    fn connected(&mut self) -> Result<&mut TcpStream, ProtocolError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(self.addr.as_str())?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(self.ack_timeout))?;
            debug!("connected to hub at {}", self.addr);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no hub connection").into())
    }
}

/// Entry point for the `publish` subcommand: pump frames from a source into
/// the hub until the source ends or Ctrl+C is pressed.
pub(crate) fn run(config: PublishConfig) -> Result<()> {
    let _telemetry = telemetry::install(&config.telemetry)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    let source = FfmpegSource::open(&config.source_uri, config.frame_size)
        .with_context(|| format!("Failed to open video source {}", config.source_uri))?;
    let sent = publish_frames(ScopedSource::new(source), &config, &shutdown)?;
    info!(camera = %config.camera_id, sent, "Publisher finished");
    Ok(())
}

/// Read frames from `source` and push each one, reconnecting after failed
/// sends. Returns the number of acknowledged frames.
pub(crate) fn publish_frames<S: FrameSource>(
    mut source: ScopedSource<S>,
    config: &PublishConfig,
    shutdown: &AtomicBool,
) -> Result<u64> {
    let mut publisher = Publisher::new(config.hub_addr.clone(), config.ack_timeout);
    let mut sent = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        let Some(frame) = source.read_frame().context("Failed to read frame")? else {
            break;
        };
        let started = Instant::now();
        let outcome = match config.jpeg_quality {
            Some(quality) => match frame.to_jpeg(quality) {
                Ok(jpeg) => publisher.send_jpeg(&config.camera_id, jpeg),
                Err(err) => {
                    warn!("Skipping frame that failed to encode: {err}");
                    continue;
                }
            },
            None => publisher.send_frame(&config.camera_id, frame),
        };
        match outcome {
            Ok(()) => {
                sent += 1;
                metrics::histogram!("publisher_roundtrip_seconds")
                    .record(started.elapsed().as_secs_f64());
            }
            Err(err) => {
                warn!(
                    "Send to {} failed: {err}; retrying in {:.1}s",
                    config.hub_addr,
                    config.reconnect_delay.as_secs_f32()
                );
                thread::sleep(config.reconnect_delay);
            }
        }
    }
    source.close();
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use video_ingest::{CaptureError, PixelFormat};

    use super::*;
    use crate::hub::{
        config::{ReceiverConfig, TelemetryOptions},
        protocol::FramePayload,
        receiver::{ReceiverState, spawn_receiver},
        store::FrameStore,
    };

    /// Replies to every request with `reply`, recording each decoded message.
    fn fake_hub(reply: &'static [u8]) -> (String, thread::JoinHandle<Vec<FrameMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            loop {
                let mut prefix = [0u8; 4];
                if socket.read_exact(&mut prefix).is_err() {
                    return seen;
                }
                let mut body = vec![0u8; u32::from_be_bytes(prefix) as usize];
                socket.read_exact(&mut body).unwrap();
                seen.push(FrameMessage::decode(&body).unwrap());
                socket
                    .write_all(&(reply.len() as u32).to_be_bytes())
                    .unwrap();
                socket.write_all(reply).unwrap();
            }
        });
        (addr, handle)
    }

    struct StripSource {
        remaining: u8,
    }

    impl FrameSource for StripSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Frame::new(vec![self.remaining; 12], 2, 2, PixelFormat::Rgb8).map(Some)
        }

        fn release(&mut self) {}
    }

    fn publish_config(hub_addr: String, jpeg_quality: Option<u8>) -> PublishConfig {
        PublishConfig {
            hub_addr,
            camera_id: "porch".into(),
            source_uri: "unused".into(),
            frame_size: (2, 2),
            jpeg_quality,
            reconnect_delay: Duration::from_millis(10),
            ack_timeout: Duration::from_secs(5),
            telemetry: TelemetryOptions::default(),
        }
    }

    #[test]
    fn send_waits_for_ack() {
        let (addr, hub) = fake_hub(b"OK");
        let mut publisher = Publisher::new(addr, Duration::from_secs(5));
        let frame = Frame::new(vec![1; 12], 2, 2, PixelFormat::Rgb8).unwrap();
        publisher.send_frame("cam0", frame).unwrap();
        assert!(publisher.stream.is_some());
        drop(publisher);

        let seen = hub.join().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].camera_id, "cam0");
        assert!(matches!(seen[0].payload, FramePayload::Raw { width: 2, .. }));
    }

    #[test]
    fn wrong_reply_is_an_error_and_drops_connection() {
        let (addr, _hub) = fake_hub(b"NO");
        let mut publisher = Publisher::new(addr, Duration::from_secs(5));
        let err = publisher.send_jpeg("cam0", vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedAck(reply) if reply == b"NO"));
        assert!(publisher.stream.is_none());
    }

    #[test]
    fn unreachable_hub_is_an_io_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let mut publisher = Publisher::new(addr, Duration::from_secs(1));
        let err = publisher.send_jpeg("cam0", vec![0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn publish_frames_sends_every_frame_as_jpeg() {
        let (addr, hub) = fake_hub(b"OK");
        let config = publish_config(addr, Some(80));
        let shutdown = AtomicBool::new(false);
        let sent = publish_frames(
            ScopedSource::new(StripSource { remaining: 4 }),
            &config,
            &shutdown,
        )
        .unwrap();
        assert_eq!(sent, 4);
        let seen = hub.join().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(
            seen.iter()
                .all(|m| m.camera_id == "porch" && matches!(m.payload, FramePayload::Jpeg(_)))
        );
    }

    #[test]
    fn publish_frames_reaches_a_live_hub() {
        let store = Arc::new(FrameStore::new());
        let handle = spawn_receiver(
            Arc::clone(&store),
            ReceiverConfig::new(([127, 0, 0, 1], 0).into()),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        let addr = loop {
            if let ReceiverState::Listening { addr } = handle.state() {
                break addr;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        };

        let config = publish_config(addr.to_string(), None);
        let sent = publish_frames(
            ScopedSource::new(StripSource { remaining: 3 }),
            &config,
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(sent, 3);
        assert_eq!(store.list_keys(), vec!["porch"]);
        assert_eq!(store.get("porch").unwrap().data[0], 0);
        handle.stop();
    }
}
