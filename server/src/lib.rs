use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use blur_watch_common::config::ServerConfig;
use blur_watch_pipeline::mjpeg::{encode_part, STREAM_CONTENT_TYPE};
use blur_watch_pipeline::orchestrator::{
    FrameOrchestrator, PipelineContext, PipelineSettings, SessionFactory, StopSignal,
};
use blur_watch_pipeline::sink::{encode_jpeg, Delivery, OutputSink, SinkError};
use bytes::Bytes;
use futures_util::Stream;
use image::RgbImage;
use tokio::sync::{mpsc, Semaphore};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span};

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Face Blur Detection</title>
</head>
<body>
    <h1>Face Blur Detection</h1>
    <img src="/video_feed" width="640">
</body>
</html>
"#;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    factory: Arc<dyn SessionFactory>,
    settings: PipelineSettings,
    context: PipelineContext,
    sessions: Arc<Semaphore>,
    channel_capacity: usize,
    jpeg_quality: u8,
    shutdown: StopSignal,
    next_session: AtomicU64,
}

impl AppState {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        settings: PipelineSettings,
        context: PipelineContext,
        server: &ServerConfig,
        jpeg_quality: u8,
        shutdown: StopSignal,
    ) -> Self {
        Self {
            factory,
            settings,
            context,
            sessions: Arc::new(Semaphore::new(server.max_sessions)),
            channel_capacity: server.channel_capacity,
            jpeg_quality,
            shutdown,
            next_session: AtomicU64::new(1),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /: viewer page embedding the stream
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed: multipart JPEG stream from a fresh pipeline session
async fn video_feed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<Bytes>(state.channel_capacity);
    tokio::spawn(run_session(state, tx));

    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(part_stream(rx)),
    )
}

fn part_stream(rx: mpsc::Receiver<Bytes>) -> impl Stream<Item = Result<Bytes, Infallible>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|part| (Ok(part), rx))
    })
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

async fn run_session(state: Arc<AppState>, tx: mpsc::Sender<Bytes>) {
    let id = state.next_session.fetch_add(1, Ordering::Relaxed);
    let permit = match Arc::clone(&state.sessions).acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            error!(session = id, error = %e, "session limiter closed");
            return;
        }
    };

    let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _span = info_span!("session", id).entered();
        stream_session(&state, tx);
    })
    .await;

    if let Err(e) = result {
        error!(session = id, error = %e, "streaming session panicked");
    }
}

/// Blocking body of one session. Dropping `tx` on return ends the HTTP body.
fn stream_session(state: &AppState, tx: mpsc::Sender<Bytes>) {
    if state.shutdown.is_stopped() {
        return;
    }
    // Waiting for a permit can outlast the viewer.
    if tx.is_closed() {
        debug!("viewer left before the session started");
        return;
    }

    let mut orchestrator = match FrameOrchestrator::initialize(
        state.factory.as_ref(),
        state.settings,
        state.context.clone(),
        state.shutdown.clone(),
    ) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "streaming session failed to start");
            return;
        }
    };

    info!("streaming session started");
    let mut sink = MultipartSink::new(tx, state.jpeg_quality);
    let summary = orchestrator.run(&mut sink);
    info!(
        frames = summary.frames,
        skipped = summary.skipped,
        saved = summary.samples_saved,
        reason = ?summary.reason,
        "streaming session ended"
    );
}

/// Encodes frames as multipart parts and hands them to the HTTP body.
pub struct MultipartSink {
    tx: mpsc::Sender<Bytes>,
    jpeg_quality: u8,
}

impl MultipartSink {
    pub fn new(tx: mpsc::Sender<Bytes>, jpeg_quality: u8) -> Self {
        Self { tx, jpeg_quality }
    }
}

impl OutputSink for MultipartSink {
    fn deliver(&mut self, frame: &RgbImage) -> Result<Delivery, SinkError> {
        let jpeg = encode_jpeg(frame, self.jpeg_quality)?;
        // Blocks while the channel is full, i.e. until the client catches up.
        match self.tx.blocking_send(encode_part(&jpeg)) {
            Ok(()) => Ok(Delivery::Continue),
            Err(_) => {
                debug!("stream consumer disconnected");
                Ok(Delivery::Stop)
            }
        }
    }
}
