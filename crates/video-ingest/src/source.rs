//! Pull-based frame sources with scoped release.

use tracing::debug;

use crate::types::{CaptureError, Frame};

/// Sequential reader over a video source.
pub trait FrameSource: Send {
    /// Next decoded frame, or `Ok(None)` once the source is exhausted.
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Close the underlying handle. Must tolerate repeated calls.
    fn release(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Owns a source and releases it exactly once, on drop or via [`ScopedSource::close`].
pub struct ScopedSource<S: FrameSource> {
    inner: S,
    released: bool,
}

impl<S: FrameSource> ScopedSource<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            released: false,
        }
    }

    pub fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.released {
            return Ok(None);
        }
        self.inner.read_frame()
    }

    pub fn close(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release();
            debug!("frame source released");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<S: FrameSource> Drop for ScopedSource<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::types::PixelFormat;

    struct CountingSource {
        remaining: usize,
        releases: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Frame::new(vec![0; 3], 1, 1, PixelFormat::Bgr8).map(Some)
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drop_releases_once_even_after_close() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut scoped = ScopedSource::new(CountingSource {
            remaining: 2,
            releases: releases.clone(),
        });
        assert!(scoped.read_frame().unwrap().is_some());
        scoped.close();
        scoped.close();
        drop(scoped);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_source_reads_as_exhausted() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut scoped = ScopedSource::new(CountingSource {
            remaining: 5,
            releases,
        });
        scoped.close();
        assert!(scoped.is_released());
        assert!(scoped.read_frame().unwrap().is_none());
    }
}
