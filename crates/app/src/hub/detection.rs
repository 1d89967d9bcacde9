//! Frame-skip detection pipeline.
//!
//! A pipeline pulls frames sequentially from one source, hands every Nth one to
//! the detector, draws the accepted detections and emits the JPEG. It runs on
//! its own thread per request and feeds the HTTP response through a bounded
//! channel; a closed channel means the client left. The source is released
//! exactly once whichever way the loop ends.

use std::{io, ops::ControlFlow, time::Instant};

use bytes::Bytes;
use ml_core::{Detection, Detector, DetectorError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};
use video_ingest::{CaptureError, FrameSource, ScopedSource};

use crate::hub::{annotation, encoding, telemetry};

/// Chunks buffered between the pipeline thread and the HTTP response.
const STREAM_DEPTH: usize = 2;

/// Which detections get drawn.
#[derive(Clone, Debug)]
pub(crate) struct DetectionFilter {
    /// Labels to draw; empty draws every label.
    target_classes: Vec<String>,
    min_confidence: f32,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self::new(Vec::new(), 0.5)
    }
}

impl DetectionFilter {
    pub(crate) fn new(target_classes: Vec<String>, min_confidence: f32) -> Self {
        Self {
            target_classes,
            min_confidence,
        }
    }

    /// Confidence must exceed the threshold, not merely reach it.
    pub(crate) fn accepts(&self, detection: &Detection) -> bool {
        detection.confidence > self.min_confidence
            && (self.target_classes.is_empty()
                || self
                    .target_classes
                    .iter()
                    .any(|class| class.eq_ignore_ascii_case(&detection.label)))
    }
}

/// Samples every Nth frame, counting from 1.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameSkip {
    every: u64,
    count: u64,
}

impl FrameSkip {
    pub(crate) fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
        }
    }

    /// Count one decoded frame; returns its number when it is sampled.
    pub(crate) fn admit(&mut self) -> Option<u64> {
        self.count += 1;
        (self.count % self.every == 0).then_some(self.count)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PipelineExit {
    EndOfStream,
    ReadError,
    DetectorError,
    Disconnected,
}

#[derive(Clone, Debug)]
pub(crate) struct PipelineSettings {
    pub(crate) frame_skip: u64,
    pub(crate) filter: DetectionFilter,
    pub(crate) jpeg_quality: u8,
}

pub(crate) struct DetectionPipeline<S: FrameSource, D: Detector> {
    source: ScopedSource<S>,
    detector: D,
    skip: FrameSkip,
    filter: DetectionFilter,
    jpeg_quality: u8,
}

impl<S: FrameSource, D: Detector> DetectionPipeline<S, D> {
    pub(crate) fn new(source: S, detector: D, settings: PipelineSettings) -> Self {
        Self {
            source: ScopedSource::new(source),
            detector,
            skip: FrameSkip::new(settings.frame_skip),
            filter: settings.filter,
            jpeg_quality: settings.jpeg_quality,
        }
    }

    /// Drive the source to completion, handing each annotated JPEG to `emit`.
    /// `emit` returning `Break` means the consumer is gone.
    pub(crate) fn run(mut self, mut emit: impl FnMut(Vec<u8>) -> ControlFlow<()>) -> PipelineExit {
        let span = info_span!("detection.pipeline", every = self.skip.every);
        let _guard = span.enter();

        let exit = loop {
            let frame = match self.source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break PipelineExit::EndOfStream,
                Err(err) => {
                    warn!("Detection source read failed: {err}");
                    break PipelineExit::ReadError;
                }
            };
            let Some(index) = self.skip.admit() else {
                continue;
            };

            let started = Instant::now();
            let detections = match self.detector.detect(&frame) {
                Ok(detections) => detections,
                Err(err) => {
                    error!(frame = index, "Detector failed: {err}");
                    break PipelineExit::DetectorError;
                }
            };
            metrics::histogram!("detection_latency_seconds")
                .record(started.elapsed().as_secs_f64());

            let accepted: Vec<Detection> = detections
                .into_iter()
                .filter(|detection| self.filter.accepts(detection))
                .collect();
            let jpeg = match annotation::annotate(&frame, &accepted).and_then(|image| {
                encoding::encode_image(&image, self.jpeg_quality, "detection")
            }) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    warn!(frame = index, "Skipping sample that failed to encode: {err}");
                    continue;
                }
            };
            metrics::counter!("detection_samples_total").increment(1);
            debug!(frame = index, detections = accepted.len(), "sample ready");

            if emit(jpeg).is_break() {
                break PipelineExit::Disconnected;
            }
        };

        self.source.close();
        metrics::counter!("detection_pipeline_exits_total", "reason" => exit.label()).increment(1);
        info!("Detection pipeline finished: {}", exit.label());
        exit
    }
}

impl PipelineExit {
    fn label(self) -> &'static str {
        match self {
            PipelineExit::EndOfStream => "end_of_stream",
            PipelineExit::ReadError => "read_error",
            PipelineExit::DetectorError => "detector_error",
            PipelineExit::Disconnected => "disconnected",
        }
    }
}

/// How samples are framed on the wire.
#[derive(Clone, Debug)]
pub(crate) enum Framing {
    Multipart,
    Events { camera_id: String },
}

impl Framing {
    fn chunk(&self, jpeg: &[u8]) -> Option<Bytes> {
        match self {
            Framing::Multipart => Some(encoding::multipart_chunk(jpeg)),
            Framing::Events { camera_id } => match encoding::sse_event(camera_id, jpeg) {
                Ok(chunk) => Some(chunk),
                Err(err) => {
                    warn!(camera = %camera_id, "Skipping sample that failed to serialise: {err}");
                    None
                }
            },
        }
    }
}

/// Run a pipeline on its own thread and return the receiving end of its
/// chunks. The detector is built before the source is opened so a failed
/// detector never leaves a source open. Either failing ends the stream empty.
pub(crate) fn spawn_detection_stream<S, D, O, M>(
    open_source: O,
    make_detector: M,
    settings: PipelineSettings,
    framing: Framing,
) -> io::Result<mpsc::Receiver<Bytes>>
where
    S: FrameSource + 'static,
    D: Detector + 'static,
    O: FnOnce() -> Result<S, CaptureError> + Send + 'static,
    M: FnOnce() -> Result<D, DetectorError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    telemetry::spawn_thread("hub-detection", move || {
        let detector = match make_detector() {
            Ok(detector) => detector,
            Err(err) => {
                error!("Failed to create detector: {err}");
                return;
            }
        };
        let source = match open_source() {
            Ok(source) => source,
            Err(err) => {
                warn!("Failed to open detection source: {err}");
                return;
            }
        };
        DetectionPipeline::new(source, detector, settings).run(|jpeg| {
            let Some(chunk) = framing.chunk(&jpeg) else {
                return ControlFlow::Continue(());
            };
            match tx.blocking_send(chunk) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });
    })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use video_ingest::{Frame, PixelFormat};

    use super::*;

    /// Yields frames whose pixels all equal their 1-based position.
    struct ScriptedSource {
        total: Option<u8>,
        fail_at: Option<u8>,
        produced: u8,
        releases: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(total: Option<u8>, releases: &Arc<AtomicUsize>) -> Self {
            Self {
                total,
                fail_at: None,
                produced: 0,
                releases: Arc::clone(releases),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let next = self.produced.wrapping_add(1);
            if self.fail_at == Some(next) {
                return Err(CaptureError::Other(anyhow::anyhow!("forced read failure")));
            }
            if self.total.is_some_and(|total| self.produced >= total) {
                return Ok(None);
            }
            self.produced = next;
            Frame::new(vec![next; 4 * 4 * 3], 4, 4, PixelFormat::Bgr8).map(Some)
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default, Clone)]
    struct RecordingDetector {
        seen: Arc<Mutex<Vec<u8>>>,
        fail: bool,
    }

    impl Detector for RecordingDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
            self.seen.lock().unwrap().push(frame.data[0]);
            if self.fail {
                return Err(DetectorError::InvalidResponse("forced".into()));
            }
            Ok(vec![Detection {
                label: "accident".into(),
                confidence: 0.9,
                bbox: [0.0, 0.0, 3.0, 3.0],
            }])
        }
    }

    fn settings(frame_skip: u64) -> PipelineSettings {
        PipelineSettings {
            frame_skip,
            filter: DetectionFilter::default(),
            jpeg_quality: 80,
        }
    }

    fn detection(label: &str, confidence: f32) -> Detection {
        Detection {
            label: label.into(),
            confidence,
            bbox: [0.0; 4],
        }
    }

    #[test]
    fn every_third_frame_reaches_the_detector() {
        let releases = Arc::new(AtomicUsize::new(0));
        let detector = RecordingDetector::default();
        let mut emitted = 0;
        let exit = DetectionPipeline::new(
            ScriptedSource::new(Some(10), &releases),
            detector.clone(),
            settings(3),
        )
        .run(|jpeg| {
            assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
            emitted += 1;
            ControlFlow::Continue(())
        });

        assert_eq!(exit, PipelineExit::EndOfStream);
        assert_eq!(*detector.seen.lock().unwrap(), vec![3, 6, 9]);
        assert_eq!(emitted, 3);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_error_ends_pipeline_and_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut source = ScriptedSource::new(Some(10), &releases);
        source.fail_at = Some(5);
        let detector = RecordingDetector::default();
        let exit =
            DetectionPipeline::new(source, detector.clone(), settings(3)).run(|_| ControlFlow::Continue(()));

        assert_eq!(exit, PipelineExit::ReadError);
        assert_eq!(*detector.seen.lock().unwrap(), vec![3]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_ends_pipeline_and_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let detector = RecordingDetector::default();
        let exit = DetectionPipeline::new(
            ScriptedSource::new(None, &releases),
            detector.clone(),
            settings(3),
        )
        .run(|_| ControlFlow::Break(()));

        assert_eq!(exit, PipelineExit::Disconnected);
        assert_eq!(*detector.seen.lock().unwrap(), vec![3]);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detector_error_ends_pipeline_and_releases_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let detector = RecordingDetector {
            fail: true,
            ..Default::default()
        };
        let exit = DetectionPipeline::new(
            ScriptedSource::new(Some(10), &releases),
            detector,
            settings(1),
        )
        .run(|_| ControlFlow::Continue(()));

        assert_eq!(exit, PipelineExit::DetectorError);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_skip_of_one_samples_everything() {
        let mut skip = FrameSkip::new(1);
        assert_eq!(
            (0..4).filter_map(|_| skip.admit()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        let mut zero = FrameSkip::new(0);
        assert_eq!(zero.admit(), Some(1));
    }

    #[test]
    fn filter_requires_target_class_and_confidence_above_threshold() {
        let filter = DetectionFilter::new(vec!["accident".into()], 0.5);
        assert!(filter.accepts(&detection("accident", 0.51)));
        assert!(filter.accepts(&detection("Accident", 0.9)));
        assert!(!filter.accepts(&detection("accident", 0.5)));
        assert!(!filter.accepts(&detection("non-accident", 0.99)));
    }

    #[test]
    fn empty_filter_accepts_any_label() {
        let filter = DetectionFilter::default();
        assert!(filter.accepts(&detection("anything", 0.75)));
        assert!(!filter.accepts(&detection("anything", 0.25)));
    }

    #[test]
    fn spawned_stream_frames_multipart_chunks() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source_releases = Arc::clone(&releases);
        let mut rx = spawn_detection_stream(
            move || Ok(ScriptedSource::new(Some(6), &source_releases)),
            || Ok(RecordingDetector::default()),
            settings(3),
            Framing::Multipart,
        )
        .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.blocking_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn spawned_stream_emits_sse_events() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source_releases = Arc::clone(&releases);
        let mut rx = spawn_detection_stream(
            move || Ok(ScriptedSource::new(Some(3), &source_releases)),
            || Ok(RecordingDetector::default()),
            settings(3),
            Framing::Events {
                camera_id: "gate".into(),
            },
        )
        .unwrap();

        let chunk = rx.blocking_recv().unwrap();
        let text = std::str::from_utf8(&chunk).unwrap();
        assert!(text.starts_with("data: {\"camera_id\":\"gate\",\"frame\":\"/9j/"));
        assert!(rx.blocking_recv().is_none());
    }

    #[test]
    fn dropped_receiver_releases_the_source() {
        let releases = Arc::new(AtomicUsize::new(0));
        let source_releases = Arc::clone(&releases);
        let mut rx = spawn_detection_stream(
            move || Ok(ScriptedSource::new(None, &source_releases)),
            || Ok(RecordingDetector::default()),
            settings(1),
            Framing::Multipart,
        )
        .unwrap();
        assert!(rx.blocking_recv().is_some());
        drop(rx);

        for _ in 0..500 {
            if releases.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_failure_ends_stream_empty() {
        let mut rx = spawn_detection_stream(
            || -> Result<ScriptedSource, CaptureError> {
                Err(CaptureError::Open {
                    uri: "missing.mp4".into(),
                })
            },
            || Ok(RecordingDetector::default()),
            settings(3),
            Framing::Multipart,
        )
        .unwrap();
        assert!(rx.blocking_recv().is_none());
    }
}
