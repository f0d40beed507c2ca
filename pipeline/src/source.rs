use image::RgbImage;

/// A live frame source: a camera device or a network stream.
///
/// Opening happens in the implementation's constructor and fails with
/// [`SourceError::DeviceUnavailable`]. `release` must be idempotent;
/// implementations should also release on drop.
pub trait VideoSource: Send {
    /// Read the next frame. An error ends the stream.
    fn read(&mut self) -> Result<RgbImage, SourceError>;

    /// Release the underlying device or connection.
    fn release(&mut self);

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailure(String),
}
