use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// What the orchestrator should do after a frame was handed to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Continue,
    /// The consumer is gone or asked to stop (key press, closed connection).
    Stop,
}

/// Destination of annotated frames: a preview window or a network stream.
pub trait OutputSink {
    /// Deliver one annotated frame. An error skips the frame; it does not
    /// end the session.
    fn deliver(&mut self, frame: &RgbImage) -> Result<Delivery, SinkError>;

    /// Tear down encoder or window resources. Called once on drain.
    fn close(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("display failed: {0}")]
    Display(String),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode frame as JPEG: {0}")]
pub struct EncodeError(pub String);

/// Encode an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError(format!("empty frame {width}x{height}")));
    }
    let mut buf = Vec::with_capacity(frame.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(frame)
        .map_err(|e| EncodeError(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encodes_valid_jpeg() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn zero_sized_frame_fails_to_encode() {
        let frame = RgbImage::new(0, 0);
        assert!(encode_jpeg(&frame, 80).is_err());
    }
}
