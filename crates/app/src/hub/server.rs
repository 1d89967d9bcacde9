//! Actix Web server exposing the camera streams, discovery and detection routes.

use std::{net::SocketAddr, sync::Arc};

use actix_web::{
    App, HttpResponse, HttpResponseBuilder, HttpServer,
    http::{StatusCode, header},
    web::{self, Bytes},
};
use async_stream::stream;
use metrics_exporter_prometheus::PrometheusHandle;
use ml_core::{Detector, DetectorError, HttpDetector, PassthroughDetector};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use video_ingest::FfmpegSource;

use crate::hub::{
    config::{DetectionConfig, ViewerConfig},
    detection::{self, Framing, PipelineSettings},
    encoding::{self, EVENT_STREAM_CONTENT_TYPE, MULTIPART_CONTENT_TYPE},
    receiver::ReceiverState,
    store::FrameStore,
    viewer,
};

/// Shared state backing HTTP handlers.
pub(crate) struct HubState {
    pub(crate) store: Arc<FrameStore>,
    pub(crate) viewer: ViewerConfig,
    pub(crate) detection: DetectionConfig,
    pub(crate) prometheus: Option<PrometheusHandle>,
    /// Live state of the ingestion endpoint, when one is running.
    pub(crate) receiver: Option<watch::Receiver<ReceiverState>>,
}

#[derive(Serialize)]
struct Health {
    receiver: Option<ReceiverState>,
    cameras: usize,
}

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/video_feed/{camera_id}", web::get().to(video_feed))
        .route("/snapshot/{camera_id}", web::get().to(snapshot))
        .route("/camera_urls", web::get().to(camera_urls))
        .route("/debug/frame_dict", web::get().to(camera_urls))
        .route("/video", web::get().to(video))
        .route("/video_events/{camera_id}", web::get().to(video_events))
        .route("/healthz", web::get().to(healthz))
        .route("/metrics", web::get().to(metrics_route));
}

/// Serve until the server is stopped (Ctrl+C / SIGTERM).
pub(crate) async fn run(bind: SocketAddr, state: web::Data<HubState>) -> std::io::Result<()> {
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(configure))
        .bind(bind)?
        .run();
    info!("Viewer endpoints listening on http://{bind}");
    server.await
}

fn streaming_response(content_type: &'static str) -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONTENT_TYPE, content_type));
    builder
}

/// Stream one camera's latest frames as MJPEG.
async fn video_feed(path: web::Path<String>, state: web::Data<HubState>) -> HttpResponse {
    let camera_id = path.into_inner();
    let stream = viewer::frame_stream(Arc::clone(&state.store), camera_id, state.viewer);
    streaming_response(MULTIPART_CONTENT_TYPE).streaming(stream)
}

/// Return one camera's latest frame as a single JPEG.
async fn snapshot(path: web::Path<String>, state: web::Data<HubState>) -> HttpResponse {
    let camera_id = path.into_inner();
    let Some(frame) = state.store.get(&camera_id) else {
        return HttpResponse::NoContent().finish();
    };
    let quality = state.viewer.jpeg_quality;
    match web::block(move || encoding::encode_frame(&frame, quality, "snapshot")).await {
        Ok(Ok(jpeg)) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(jpeg),
        Ok(Err(err)) => {
            warn!(camera = %camera_id, "Snapshot encode failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
        Err(err) => {
            warn!(camera = %camera_id, "Snapshot encode task failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

/// Known camera ids as a JSON array.
async fn camera_urls(state: web::Data<HubState>) -> HttpResponse {
    HttpResponse::Ok().json(state.store.list_keys())
}

/// Run the detection pipeline over the configured video and stream it as MJPEG.
async fn video(state: web::Data<HubState>) -> HttpResponse {
    let Some(path) = state.detection.video_path.as_ref() else {
        return HttpResponse::NotFound().body("no video configured");
    };
    let uri = path.to_string_lossy().into_owned();
    let config = &state.detection;
    detection_response(
        config,
        uri,
        config.frame_size,
        config.jpeg_quality,
        Framing::Multipart,
    )
}

/// Run the detection pipeline over a configured camera source and stream it
/// as Server-Sent Events.
async fn video_events(path: web::Path<String>, state: web::Data<HubState>) -> HttpResponse {
    let camera_id = path.into_inner();
    let config = &state.detection;
    let Some(uri) = config.streams.get(&camera_id).cloned() else {
        return HttpResponse::NotFound().body(format!("no stream configured for {camera_id}"));
    };
    detection_response(
        config,
        uri,
        config.event_frame_size,
        config.event_jpeg_quality,
        Framing::Events { camera_id },
    )
}

fn detection_response(
    config: &DetectionConfig,
    uri: String,
    frame_size: (u32, u32),
    jpeg_quality: u8,
    framing: Framing,
) -> HttpResponse {
    let content_type = match framing {
        Framing::Multipart => MULTIPART_CONTENT_TYPE,
        Framing::Events { .. } => EVENT_STREAM_CONTENT_TYPE,
    };
    let settings = PipelineSettings {
        frame_skip: config.frame_skip,
        filter: config.filter.clone(),
        jpeg_quality,
    };
    let detector_url = config.detector_url.clone();
    info!("Starting detection stream over {uri}");
    let spawned = detection::spawn_detection_stream(
        move || FfmpegSource::open(&uri, frame_size),
        move || make_detector(detector_url),
        settings,
        framing,
    );
    match spawned {
        Ok(mut chunks) => {
            let body = stream! {
                while let Some(chunk) = chunks.recv().await {
                    yield Ok::<Bytes, actix_web::Error>(chunk);
                }
            };
            streaming_response(content_type).streaming(body)
        }
        Err(err) => {
            error!("Failed to spawn detection thread: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

fn make_detector(url: Option<String>) -> Result<Box<dyn Detector>, DetectorError> {
    let detector: Box<dyn Detector> = match url {
        Some(url) => Box::new(HttpDetector::new(url)?),
        None => Box::new(PassthroughDetector),
    };
    Ok(detector)
}

/// Ingestion endpoint state and the number of known cameras.
async fn healthz(state: web::Data<HubState>) -> HttpResponse {
    let receiver = state
        .receiver
        .as_ref()
        .map(|receiver| receiver.borrow().clone());
    HttpResponse::Ok().json(Health {
        receiver,
        cameras: state.store.list_keys().len(),
    })
}

async fn metrics_route(state: web::Data<HubState>) -> HttpResponse {
    match state.prometheus.as_ref() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::build(StatusCode::SERVICE_UNAVAILABLE)
            .body("metrics recorder not installed"),
    }
}
