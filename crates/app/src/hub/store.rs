//! Latest-frame-per-camera store shared by the receiver and every viewer.
//!
//! Each slot holds an `Arc<Frame>` so readers clone a pointer under the lock
//! and never observe a partially replaced frame. A store-wide `Notify` wakes
//! viewers after every write.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::{Notify, futures::Notified};
use video_ingest::Frame;

struct Slot {
    frame: Arc<Frame>,
    sequence: u64,
    updated_at: Instant,
}

#[derive(Default)]
struct Slots {
    map: HashMap<String, Slot>,
    next_sequence: u64,
}

/// Point-in-time view of one camera slot.
#[derive(Clone, Debug)]
pub(crate) struct Snapshot {
    pub(crate) frame: Arc<Frame>,
    /// Store-wide write counter at the time this frame was put. Strictly
    /// increases across writes to the same camera.
    pub(crate) sequence: u64,
}

#[derive(Default)]
pub(crate) struct FrameStore {
    slots: Mutex<Slots>,
    updated: Notify,
}

impl FrameStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the camera's latest frame, creating the slot on first write.
    /// Returns the sequence assigned to the write.
    pub(crate) fn put(&self, camera_id: &str, frame: impl Into<Arc<Frame>>) -> u64 {
        let frame = frame.into();
        let (sequence, previous, known) = {
            let mut slots = self.lock();
            slots.next_sequence += 1;
            let sequence = slots.next_sequence;
            let slot = Slot {
                frame,
                sequence,
                updated_at: Instant::now(),
            };
            let previous = match slots.map.get_mut(camera_id) {
                Some(existing) => Some(std::mem::replace(existing, slot)),
                None => {
                    slots.map.insert(camera_id.to_string(), slot);
                    None
                }
            };
            (sequence, previous, slots.map.len())
        };
        // The replaced frame may be large; release it outside the lock.
        drop(previous);
        metrics::gauge!("hub_known_cameras").set(known as f64);
        self.updated.notify_waiters();
        sequence
    }

    pub(crate) fn get(&self, camera_id: &str) -> Option<Arc<Frame>> {
        self.lock()
            .map
            .get(camera_id)
            .map(|slot| Arc::clone(&slot.frame))
    }

    pub(crate) fn snapshot(&self, camera_id: &str) -> Option<Snapshot> {
        self.lock().map.get(camera_id).map(|slot| Snapshot {
            frame: Arc::clone(&slot.frame),
            sequence: slot.sequence,
        })
    }

    /// Camera ids with a stored frame, sorted.
    pub(crate) fn list_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().map.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Future resolving on the next write. Create it before checking the
    /// store so a write in between is not missed.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.updated.notified()
    }

    /// Drop slots not written within `max_age`; returns the evicted ids.
    pub(crate) fn evict_stale(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let (evicted, remaining) = {
            let mut slots = self.lock();
            let stale: Vec<String> = slots
                .map
                .iter()
                .filter(|(_, slot)| now.saturating_duration_since(slot.updated_at) > max_age)
                .map(|(camera_id, _)| camera_id.clone())
                .collect();
            for camera_id in &stale {
                slots.map.remove(camera_id);
            }
            (stale, slots.map.len())
        };
        if !evicted.is_empty() {
            metrics::gauge!("hub_known_cameras").set(remaining as f64);
            self.updated.notify_waiters();
        }
        evicted
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panicking writer cannot leave a slot half-written: every mutation
        // is a single insert/replace/remove.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
