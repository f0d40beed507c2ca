use std::path::PathBuf;
use std::sync::Arc;

use blur_watch_common::config::Config;
use blur_watch_pipeline::backends::cv::ConfiguredSessions;
use blur_watch_pipeline::orchestrator::{
    PipelineContext, PipelineSettings, SessionFactory, StopSignal,
};
use blur_watch_server::{router, AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source = config.source.kind,
        threshold = config.blur.threshold,
        interval_secs = config.throttle.interval_secs,
        persistence = config.persistence.enabled,
        "starting blur-watch server"
    );

    let factory = ConfiguredSessions::new(config.source.clone(), config.detector.clone());
    // Sessions load their own detector; this only proves the cascade is usable.
    if let Err(e) = factory.load_locator() {
        error!(error = %e, "face detector failed to load");
        std::process::exit(1);
    }

    let context = match PipelineContext::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to prepare sample storage");
            std::process::exit(1);
        }
    };

    let shutdown = StopSignal::new();
    let state = Arc::new(AppState::new(
        Arc::new(factory),
        PipelineSettings::from_config(&config),
        context,
        &config.server,
        config.frame.jpeg_quality,
        shutdown.clone(),
    ));
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!(addr, "blur-watch server listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
    {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("server stopped");
}

/// Resolves on Ctrl-C after raising the stop flag every session watches.
async fn shutdown_signal(stop: StopSignal) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, draining sessions");
    stop.stop();
}
