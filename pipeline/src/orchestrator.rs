use blur_watch_common::config::Config;
use blur_watch_common::frame::{BlurResult, Detection, SavedSample};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::annotate::FrameAnnotator;
use crate::blur::BlurScorer;
use crate::clock::{Clock, SystemClock};
use crate::locator::{DetectionParams, FaceLocator, LocatorError};
use crate::sink::{Delivery, OutputSink};
use crate::source::{SourceError, VideoSource};
use crate::storage::{DiskSampleSink, SampleSink, SinkWriteError};
use crate::throttle::SaveThrottle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shared stop signal was raised (process shutdown).
    StopRequested,
    /// The output sink asked to stop: key press or consumer disconnected.
    SinkClosed,
    /// The video source could not produce another frame.
    ReadFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub skipped: u64,
    pub samples_saved: u64,
    pub reason: StopReason,
}

/// Cooperative stop flag shared between a session and whoever may end it.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("face detector failed to load: {0}")]
    DetectorLoad(String),
}

impl From<SourceError> for StartupError {
    fn from(e: SourceError) -> Self {
        StartupError::DeviceUnavailable(e.to_string())
    }
}

impl From<LocatorError> for StartupError {
    fn from(e: LocatorError) -> Self {
        StartupError::DetectorLoad(e.to_string())
    }
}

/// Acquires the per-session resources: one face locator and one video source.
pub trait SessionFactory: Send + Sync {
    fn load_locator(&self) -> Result<Box<dyn FaceLocator>, LocatorError>;
    fn open_source(&self) -> Result<Box<dyn VideoSource>, SourceError>;
}

/// Per-frame knobs taken from the config file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub width: u32,
    pub height: u32,
    pub params: DetectionParams,
    pub blur_threshold: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.frame.width,
            height: config.frame.height,
            params: DetectionParams::from(&config.detector),
            blur_threshold: config.blur.threshold,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Process-wide collaborators shared by every session.
#[derive(Clone)]
pub struct PipelineContext {
    pub throttle: Arc<SaveThrottle>,
    /// `None` when persistence is disabled.
    pub samples: Option<Arc<dyn SampleSink>>,
    pub clock: Arc<dyn Clock>,
    pub annotator: Arc<FrameAnnotator>,
}

impl PipelineContext {
    /// Production wiring: wall clock, configured throttle interval, disk
    /// persistence when enabled, and the annotation font if it loads.
    pub fn from_config(config: &Config) -> Result<Self, SinkWriteError> {
        let samples: Option<Arc<dyn SampleSink>> = if config.persistence.enabled {
            Some(Arc::new(DiskSampleSink::open(
                &config.persistence,
                config.frame.jpeg_quality,
            )?))
        } else {
            info!("persistence disabled");
            None
        };

        Ok(Self {
            throttle: Arc::new(SaveThrottle::from_secs_f64(config.throttle.interval_secs)),
            samples,
            clock: Arc::new(SystemClock),
            annotator: Arc::new(FrameAnnotator::load(config.annotate.font_path.as_deref())),
        })
    }
}

/// Result of one pipeline iteration.
pub struct ProcessedFrame {
    pub annotated: RgbImage,
    pub faces: Vec<(Detection, BlurResult)>,
    pub saved: Option<SavedSample>,
}

/// Owns one session's per-frame loop.
///
/// Read, resize, grayscale, locate, score, annotate, throttle and persist,
/// deliver. The video source is released exactly once: on drain, or on
/// drop if the loop never reached it.
pub struct FrameOrchestrator {
    source: Option<Box<dyn VideoSource>>,
    locator: Box<dyn FaceLocator>,
    settings: PipelineSettings,
    scorer: BlurScorer,
    context: PipelineContext,
    stop: StopSignal,
    state: PipelineState,
}

impl FrameOrchestrator {
    pub fn new(
        source: Box<dyn VideoSource>,
        locator: Box<dyn FaceLocator>,
        settings: PipelineSettings,
        context: PipelineContext,
        stop: StopSignal,
    ) -> Self {
        Self {
            source: Some(source),
            locator,
            scorer: BlurScorer::new(settings.blur_threshold),
            settings,
            context,
            stop,
            state: PipelineState::Initializing,
        }
    }

    /// Load the detector, then open the video source. Either failure is fatal
    /// for the session.
    pub fn initialize(
        factory: &dyn SessionFactory,
        settings: PipelineSettings,
        context: PipelineContext,
        stop: StopSignal,
    ) -> Result<Self, StartupError> {
        let locator = factory.load_locator()?;
        info!(locator = locator.name(), "face locator loaded");
        let source = factory.open_source()?;
        info!(source = source.name(), "video source opened");
        Ok(Self::new(source, locator, settings, context, stop))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Run until a stop signal, a sink stop or a read failure, then drain.
    pub fn run(&mut self, sink: &mut dyn OutputSink) -> RunSummary {
        let mut summary = RunSummary {
            frames: 0,
            skipped: 0,
            samples_saved: 0,
            reason: StopReason::StopRequested,
        };
        if self.state == PipelineState::Stopped {
            return summary;
        }

        self.state = PipelineState::Running;
        info!(
            width = self.settings.width,
            height = self.settings.height,
            threshold = self.settings.blur_threshold,
            "pipeline running"
        );

        summary.reason = loop {
            if self.stop.is_stopped() {
                break StopReason::StopRequested;
            }
            let Some(source) = self.source.as_mut() else {
                break StopReason::ReadFailure;
            };
            let frame = match source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, frames = summary.frames, "frame read failed, draining");
                    break StopReason::ReadFailure;
                }
            };

            let processed = self.analyze(frame);
            summary.frames += 1;

            let delivery = sink.deliver(&processed.annotated);
            // A frame the sink could not take is not persisted either.
            if delivery.is_ok()
                && self
                    .persist(&processed.annotated, &processed.faces)
                    .is_some()
            {
                summary.samples_saved += 1;
            }

            match delivery {
                Ok(Delivery::Continue) => {}
                Ok(Delivery::Stop) => break StopReason::SinkClosed,
                Err(e) => {
                    summary.skipped += 1;
                    warn!(error = %e, frame = summary.frames, "frame delivery failed, skipping");
                }
            }

            if summary.frames % 100 == 0 {
                debug!(frames = summary.frames, "frames processed");
            }
        };

        self.drain(sink);
        info!(
            frames = summary.frames,
            skipped = summary.skipped,
            saved = summary.samples_saved,
            reason = ?summary.reason,
            "pipeline stopped"
        );
        summary
    }

    /// One iteration minus the read and the delivery.
    pub fn process_frame(&mut self, frame: RgbImage) -> ProcessedFrame {
        let mut processed = self.analyze(frame);
        processed.saved = self.persist(&processed.annotated, &processed.faces);
        processed
    }

    /// Resize, locate, score and annotate. Nothing is persisted.
    fn analyze(&mut self, frame: RgbImage) -> ProcessedFrame {
        let (width, height) = (self.settings.width, self.settings.height);
        let frame = if frame.dimensions() == (width, height) {
            frame
        } else {
            imageops::resize(&frame, width, height, FilterType::Triangle)
        };
        let gray = to_gray(&frame);

        let detections = match self.locator.detect(&gray, &self.settings.params) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "face detection failed, treating frame as empty");
                Vec::new()
            }
        };

        let faces: Vec<(Detection, BlurResult)> = detections
            .iter()
            .filter_map(|d| d.clip(width, height))
            .map(|d| {
                let region = imageops::crop_imm(&gray, d.x, d.y, d.width, d.height).to_image();
                (d, self.scorer.evaluate(&region))
            })
            .collect();

        let annotated = self.context.annotator.annotate(&frame, &faces);

        ProcessedFrame {
            annotated,
            faces,
            saved: None,
        }
    }

    /// Ask the throttle once per blurry face; the first success saves the
    /// annotated frame.
    fn persist(
        &self,
        annotated: &RgbImage,
        faces: &[(Detection, BlurResult)],
    ) -> Option<SavedSample> {
        let samples = self.context.samples.as_ref()?;
        let mut saved = None;

        for (_, result) in faces.iter().filter(|(_, r)| r.is_blurry()) {
            let now = self.context.clock.now();
            if !self.context.throttle.try_acquire(&now, true) {
                continue;
            }
            match samples.save(annotated, result.score, faces.len(), now) {
                Ok(sample) => {
                    info!(
                        path = sample.image_path.display().to_string(),
                        score = format!("{:.2}", sample.score),
                        faces = sample.face_count,
                        "blurry face saved"
                    );
                    saved = Some(sample);
                }
                Err(e) => {
                    error!(error = %e, "failed to persist blurry sample");
                }
            }
        }

        saved
    }

    fn drain(&mut self, sink: &mut dyn OutputSink) {
        self.state = PipelineState::Draining;
        self.release_source();
        sink.close();
        self.state = PipelineState::Stopped;
    }

    fn release_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
            info!(source = source.name(), "video source released");
        }
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        self.release_source();
    }
}

/// BT.601 luma with the same fixed-point rounding OpenCV uses, so cascade
/// detectors see the grayscale they were trained on.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let [r, g, b] = frame.get_pixel(x, y).0;
        let luma = (r as u32 * 4899 + g as u32 * 9617 + b as u32 * 1868 + 8192) >> 14;
        Luma([luma as u8])
    })
}
