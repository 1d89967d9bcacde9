//! Camera frame hub: ingestion endpoint, shared frame store, viewer streams
//! and the frame-skip detection pipeline.

mod annotation;
pub(crate) mod config;
mod detection;
mod encoding;
mod eviction;
mod protocol;
pub(crate) mod publisher;
mod receiver;
mod server;
mod store;
mod telemetry;
mod viewer;

use std::sync::Arc;

use actix_web::web;
use anyhow::{Context, Result};
use tracing::info;

use crate::hub::{config::HubConfig, server::HubState, store::FrameStore};

/// Entry point for the `serve` subcommand. Blocks until the HTTP server stops.
pub(crate) fn serve(config: HubConfig) -> Result<()> {
    let _telemetry = telemetry::install(&config.telemetry)?;
    let prometheus = telemetry::init_metrics_recorder()?.clone();

    let store = Arc::new(FrameStore::new());
    let receiver = receiver::spawn_receiver(Arc::clone(&store), config.receiver.clone())
        .context("Failed to spawn receiver thread")?;
    let janitor = match config.stale_after {
        Some(max_age) => {
            info!(
                "Evicting cameras idle for more than {}s",
                max_age.as_secs()
            );
            Some(
                eviction::spawn_janitor(Arc::clone(&store), max_age)
                    .context("Failed to spawn eviction thread")?,
            )
        }
        None => None,
    };

    let state = web::Data::new(HubState {
        store,
        viewer: config.viewer,
        detection: config.detection,
        prometheus: Some(prometheus),
        receiver: Some(receiver.subscribe()),
    });
    let served = actix_web::rt::System::new().block_on(server::run(config.http_bind, state));

    info!("HTTP server stopped; shutting down ingestion");
    if let Some(janitor) = janitor {
        janitor.stop();
    }
    receiver.stop();
    served.with_context(|| format!("HTTP server on {} failed", config.http_bind))
}
