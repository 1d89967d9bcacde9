use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::info;

use crate::hub::{store::FrameStore, telemetry};

pub(crate) const EVICTION_POLL_INTERVAL_MS: u64 = 500;

/// Handle for the thread that forgets cameras which stopped publishing.
pub(crate) struct Janitor {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Janitor {
    pub(crate) fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Evict slots idle for longer than `max_age`, checking every
/// `max(max_age / 2, 1s)`.
pub(crate) fn spawn_janitor(store: Arc<FrameStore>, max_age: Duration) -> io::Result<Janitor> {
    spawn_janitor_with(
        store,
        max_age,
        check_interval(max_age),
        Duration::from_millis(EVICTION_POLL_INTERVAL_MS),
    )
}

fn check_interval(max_age: Duration) -> Duration {
    (max_age / 2).max(Duration::from_secs(1))
}

fn spawn_janitor_with(
    store: Arc<FrameStore>,
    max_age: Duration,
    check_every: Duration,
    poll: Duration,
) -> io::Result<Janitor> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let handle = telemetry::spawn_thread("hub-eviction", move || {
        let mut last_check = Instant::now();
        while flag.load(Ordering::Relaxed) {
            thread::sleep(poll);
            if last_check.elapsed() < check_every {
                continue;
            }
            last_check = Instant::now();
            let evicted = store.evict_stale(max_age);
            if evicted.is_empty() {
                continue;
            }
            metrics::counter!("hub_evicted_cameras_total").increment(evicted.len() as u64);
            for camera_id in &evicted {
                info!(
                    camera = %camera_id,
                    "Evicted camera idle for more than {:.1}s",
                    max_age.as_secs_f32()
                );
            }
        }
    })?;
    Ok(Janitor {
        running,
        handle: Some(handle),
    })
}
