//! Per-connection MJPEG stream over one camera's slot in the frame store.
//!
//! The stream never waits for a camera to exist. It re-encodes only when the
//! slot's sequence advances and otherwise parks on the store's notifier for at
//! most one poll interval. Frames published faster than a viewer consumes them
//! are skipped; the viewer always gets the latest.

use std::sync::Arc;

use actix_web::{rt::time::timeout, web};
use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use tracing::{debug, warn};

use crate::hub::{config::ViewerConfig, encoding, store::FrameStore};

struct ViewerGuard {
    camera_id: String,
}

impl ViewerGuard {
    fn new(camera_id: &str) -> Self {
        metrics::gauge!("hub_active_viewers").increment(1.0);
        debug!(camera = %camera_id, "viewer attached");
        Self {
            camera_id: camera_id.to_string(),
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        metrics::gauge!("hub_active_viewers").decrement(1.0);
        debug!(camera = %self.camera_id, "viewer detached");
    }
}

/// Multipart chunks for `camera_id`, until the client goes away.
pub(crate) fn frame_stream(
    store: Arc<FrameStore>,
    camera_id: String,
    config: ViewerConfig,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    stream! {
        let _viewer = ViewerGuard::new(&camera_id);
        let mut last_sequence = None;
        loop {
            let notified = store.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let fresh = store
                .snapshot(&camera_id)
                .filter(|snapshot| last_sequence != Some(snapshot.sequence));
            let Some(snapshot) = fresh else {
                let _ = timeout(config.poll_interval, notified).await;
                continue;
            };
            last_sequence = Some(snapshot.sequence);

            let frame = snapshot.frame;
            let quality = config.jpeg_quality;
            match web::block(move || encoding::encode_frame(&frame, quality, "viewer")).await {
                Ok(Ok(jpeg)) => {
                    metrics::counter!("hub_viewer_chunks_total").increment(1);
                    yield Ok::<Bytes, actix_web::Error>(encoding::multipart_chunk(&jpeg));
                }
                Ok(Err(err)) => {
                    warn!(camera = %camera_id, "Skipping frame that failed to encode: {err}");
                }
                Err(err) => {
                    warn!(camera = %camera_id, "Encode task failed: {err}");
                }
            }
        }
    }
}
