use blur_watch_common::config::DetectorConfig;
use blur_watch_common::frame::Detection;
use image::GrayImage;

/// Cascade search parameters handed to the locator on every frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Image pyramid step, must be > 1.0.
    pub scale_factor: f64,
    /// Overlapping candidates required to keep a detection.
    pub min_neighbors: i32,
    /// Smallest accepted box side, in pixels.
    pub min_size: u32,
}

impl From<&DetectorConfig> for DetectionParams {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            min_size: config.min_size,
        }
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::from(&DetectorConfig::default())
    }
}

/// Face localization capability.
///
/// Implementations receive the grayscale frame and return boxes where faces
/// are believed to be. No ordering of the result is assumed; boxes may
/// overhang the frame and are clipped by the caller.
pub trait FaceLocator: Send {
    fn detect(
        &mut self,
        gray: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, LocatorError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("failed to load detector parameters from {0}: {1}")]
    Load(String, String),
    #[error("face detection failed: {0}")]
    Detect(String),
}
