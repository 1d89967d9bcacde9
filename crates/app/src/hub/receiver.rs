//! Background ingestion endpoint feeding the frame store.
//!
//! One endpoint instance is a TCP listener plus every publisher connection it
//! accepted. Requests from all connections take turns: decode, `put`, write the
//! ack, then the next request. Any transport fault tears the whole instance
//! down; the outer loop waits out the backoff and opens a fresh one, until the
//! handle is stopped.

use std::{io, net::SocketAddr, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, watch},
    task::JoinSet,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::hub::{
    config::ReceiverConfig,
    protocol::{self, ACK, Ingest, ProtocolError},
    store::FrameStore,
    telemetry,
};

/// Longest the endpoint waits on one publisher to take its ack.
const ACK_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub(crate) enum ReceiverState {
    Starting,
    Listening { addr: SocketAddr },
    Backoff { attempt: u32 },
    Stopped,
}

/// Delay before reopening the endpoint after its `attempt`-th consecutive
/// failure.
pub(crate) trait Backoff: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct FixedBackoff(pub(crate) Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Handle for the receiver thread.
pub(crate) struct ReceiverHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ReceiverState>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReceiverHandle {
    pub(crate) fn state(&self) -> ReceiverState {
        self.state.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.state.clone()
    }

    /// Signal the receiver to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start the ingestion endpoint on its own thread and runtime.
pub(crate) fn spawn_receiver(
    store: Arc<FrameStore>,
    config: ReceiverConfig,
) -> io::Result<ReceiverHandle> {
    let backoff = FixedBackoff(config.backoff);
    spawn_receiver_with(store, config, backoff)
}

pub(crate) fn spawn_receiver_with<B: Backoff + 'static>(
    store: Arc<FrameStore>,
    config: ReceiverConfig,
    backoff: B,
) -> io::Result<ReceiverHandle> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(ReceiverState::Starting);
    let task_cancel = cancel.clone();
    let thread = telemetry::spawn_thread("hub-receiver", move || {
        runtime.block_on(run_receiver(store, config, &backoff, state_tx, task_cancel));
    })?;
    Ok(ReceiverHandle {
        cancel,
        state: state_rx,
        thread: Some(thread),
    })
}

/// Keep an endpoint open until `cancel` fires, reopening after every fault.
pub(crate) async fn run_receiver(
    store: Arc<FrameStore>,
    config: ReceiverConfig,
    backoff: &dyn Backoff,
    state: watch::Sender<ReceiverState>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        state.send_replace(ReceiverState::Starting);
        let span = info_span!("receiver.endpoint", addr = %config.bind, attempt);
        let outcome = serve_endpoint(&store, &config, &state, &cancel)
            .instrument(span)
            .await;
        let Err(err) = outcome else {
            break;
        };

        // Count consecutive faults only; an endpoint that got as far as
        // listening starts the count over.
        if matches!(*state.borrow(), ReceiverState::Listening { .. }) {
            attempt = 0;
        }
        attempt = attempt.saturating_add(1);
        metrics::counter!("hub_receiver_restarts_total").increment(1);
        let delay = backoff.delay(attempt);
        warn!(
            attempt,
            "Ingestion endpoint failed: {err:#}; reopening in {:.1}s",
            delay.as_secs_f32()
        );
        state.send_replace(ReceiverState::Backoff { attempt });
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    state.send_replace(ReceiverState::Stopped);
    info!("Ingestion endpoint stopped");
}

/// Run one endpoint instance. `Ok` means cancelled; `Err` is a fault.
async fn serve_endpoint(
    store: &Arc<FrameStore>,
    config: &ReceiverConfig,
    state: &watch::Sender<ReceiverState>,
    cancel: &CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind ingestion endpoint {}", config.bind))?;
    let local = listener
        .local_addr()
        .context("ingestion endpoint has no local address")?;
    state.send_replace(ReceiverState::Listening { addr: local });
    info!("Ingestion endpoint listening on {local}");

    let turn = Arc::new(Mutex::new(()));
    // Dropping the set on return aborts every publisher connection.
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (socket, peer) = accepted.context("accept failed")?;
                debug!(%peer, "publisher connected");
                let conn = PublisherConnection {
                    store: Arc::clone(store),
                    turn: Arc::clone(&turn),
                    max_message_bytes: config.max_message_bytes,
                };
                connections.spawn(
                    async move { (peer, conn.serve(socket).await) }
                        .instrument(info_span!("receiver.publisher", %peer)),
                );
            }
            Some(joined) = connections.join_next() => {
                match joined {
                    Ok((peer, Ok(()))) => debug!(%peer, "publisher disconnected"),
                    Ok((peer, Err(err))) => {
                        return Err(anyhow!(err).context(format!("publisher {peer} failed")));
                    }
                    Err(err) => return Err(anyhow!("publisher connection task failed: {err}")),
                }
            }
        }
    }
}

struct PublisherConnection {
    store: Arc<FrameStore>,
    turn: Arc<Mutex<()>>,
    max_message_bytes: usize,
}

impl PublisherConnection {
    /// Serve requests until the publisher disconnects between messages.
    async fn serve(self, socket: TcpStream) -> Result<(), ProtocolError> {
        let _ = socket.set_nodelay(true);
        let mut framed = Framed::new(socket, protocol::codec(self.max_message_bytes));
        while let Some(request) = framed.next().await {
            let request = request?;
            metrics::histogram!("hub_ingest_message_bytes").record(request.len() as f64);
            // JPEG decoding stays off the runtime thread so accepts keep going.
            let ingest = tokio::task::spawn_blocking(move || protocol::decode_request(&request))
                .await
                .map_err(|err| ProtocolError::Io(io::Error::other(err)))??;

            let _turn = self.turn.lock().await;
            match ingest {
                Ingest::Frame { camera_id, frame } => {
                    self.store.put(&camera_id, frame);
                    metrics::counter!("hub_frames_received_total").increment(1);
                }
                Ingest::Undecodable { camera_id, error } => {
                    warn!(camera = %camera_id, "Skipping undecodable JPEG frame: {error}");
                    metrics::counter!("hub_decode_errors_total").increment(1);
                }
            }
            match tokio::time::timeout(ACK_WRITE_TIMEOUT, framed.send(Bytes::from_static(ACK))).await
            {
                Ok(sent) => sent?,
                Err(_) => {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "publisher did not take the acknowledgment",
                    )));
                }
            }
        }
        Ok(())
    }
}
