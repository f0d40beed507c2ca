use std::path::PathBuf;

use blur_watch_common::config::Config;
use blur_watch_pipeline::backends::cv::{ConfiguredSessions, PreviewWindow};
use blur_watch_pipeline::orchestrator::{
    FrameOrchestrator, PipelineContext, PipelineSettings, StopSignal,
};
use tracing::{error, info};

fn main() {
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
        device = config.source.device_index,
        threshold = config.blur.threshold,
        "starting blur-watch preview"
    );

    std::process::exit(run_preview(&config));
}

/// Runs the preview and returns the process exit code. The camera is
/// released before this returns.
fn run_preview(config: &Config) -> i32 {
    let context = match PipelineContext::from_config(config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to prepare sample storage");
            return 1;
        }
    };

    let factory = ConfiguredSessions::new(config.source.clone(), config.detector.clone());
    let mut orchestrator = match FrameOrchestrator::initialize(
        &factory,
        PipelineSettings::from_config(config),
        context,
        StopSignal::new(),
    ) {
        Ok(o) => o,
        Err(e) => {
            error!(error = %e, "startup failed");
            return 1;
        }
    };

    let mut window = match PreviewWindow::open(
        &config.preview.window_title,
        config.preview.stop_key,
    ) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "failed to open preview window");
            return 1;
        }
    };

    info!(
        stop_key = %config.preview.stop_key,
        "camera started, press the stop key or ESC to quit"
    );
    let summary = orchestrator.run(&mut window);
    info!(
        frames = summary.frames,
        saved = summary.samples_saved,
        reason = ?summary.reason,
        "camera stopped"
    );
    0
}
