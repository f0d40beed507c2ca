use blur_watch_common::config::{DetectorConfig, SourceConfig};
use blur_watch_common::frame::Detection;
use image::{GrayImage, RgbImage};
use opencv::core::{Mat, Rect, Scalar, Size, Vector, CV_8UC1, CV_8UC3};
use opencv::prelude::*;
use opencv::{highgui, objdetect, videoio};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::locator::{DetectionParams, FaceLocator, LocatorError};
use crate::mjpeg::MjpegHttpSource;
use crate::orchestrator::SessionFactory;
use crate::sink::{Delivery, OutputSink, SinkError};
use crate::source::{SourceError, VideoSource};

const ESC: i32 = 27;

/// Local camera opened through OpenCV's video I/O.
pub struct OpenCvCamera {
    capture: Option<videoio::VideoCapture>,
    name: String,
    buf: Mat,
}

impl OpenCvCamera {
    pub fn open(device_index: i32) -> Result<Self, SourceError> {
        let name = format!("camera:{device_index}");
        let capture = videoio::VideoCapture::new(device_index, videoio::CAP_ANY)
            .map_err(|e| SourceError::DeviceUnavailable(format!("{name}: {e}")))?;
        let opened = capture
            .is_opened()
            .map_err(|e| SourceError::DeviceUnavailable(format!("{name}: {e}")))?;
        if !opened {
            return Err(SourceError::DeviceUnavailable(format!(
                "{name}: device could not be opened"
            )));
        }
        info!(device = device_index, "camera opened");
        Ok(Self {
            capture: Some(capture),
            name,
            buf: Mat::default(),
        })
    }
}

impl VideoSource for OpenCvCamera {
    fn read(&mut self) -> Result<RgbImage, SourceError> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(SourceError::ReadFailure("camera released".into()));
        };
        let grabbed = capture
            .read(&mut self.buf)
            .map_err(|e| SourceError::ReadFailure(e.to_string()))?;
        if !grabbed || self.buf.empty() {
            return Err(SourceError::ReadFailure("no frame from camera".into()));
        }
        bgr_mat_to_rgb(&self.buf)
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!(camera = self.name.as_str(), error = %e, "camera release failed");
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for OpenCvCamera {
    fn drop(&mut self) {
        self.release();
    }
}

/// Viola-Jones face detector backed by an OpenCV cascade file.
pub struct HaarCascadeLocator {
    classifier: objdetect::CascadeClassifier,
    faces: Vector<Rect>,
}

impl HaarCascadeLocator {
    pub fn load(path: &Path) -> Result<Self, LocatorError> {
        let display = path.display().to_string();
        let Some(file) = path.to_str() else {
            return Err(LocatorError::Load(display, "path is not valid UTF-8".into()));
        };
        if !path.is_file() {
            return Err(LocatorError::Load(display, "file not found".into()));
        }
        let classifier = objdetect::CascadeClassifier::new(file)
            .map_err(|e| LocatorError::Load(display.clone(), e.to_string()))?;
        let empty = classifier
            .empty()
            .map_err(|e| LocatorError::Load(display.clone(), e.to_string()))?;
        if empty {
            return Err(LocatorError::Load(display, "cascade is empty".into()));
        }
        Ok(Self {
            classifier,
            faces: Vector::new(),
        })
    }
}

impl FaceLocator for HaarCascadeLocator {
    fn detect(
        &mut self,
        gray: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<Detection>, LocatorError> {
        let mat = mat_from_bytes(gray.height(), gray.width(), CV_8UC1, gray.as_raw())
            .map_err(|e| LocatorError::Detect(e.to_string()))?;
        let min_side = params.min_size as i32;

        self.faces.clear();
        self.classifier
            .detect_multi_scale(
                &mat,
                &mut self.faces,
                params.scale_factor,
                params.min_neighbors,
                0,
                Size::new(min_side, min_side),
                Size::default(),
            )
            .map_err(|e| LocatorError::Detect(e.to_string()))?;

        Ok(self
            .faces
            .iter()
            .filter(|r| r.width > 0 && r.height > 0)
            .map(|r| {
                Detection::new(
                    r.x.max(0) as u32,
                    r.y.max(0) as u32,
                    r.width as u32,
                    r.height as u32,
                )
            })
            .collect())
    }

    fn name(&self) -> &str {
        "haar-cascade"
    }
}

/// Opens the configured source and loads the cascade for every session.
pub struct ConfiguredSessions {
    source: SourceConfig,
    detector: DetectorConfig,
}

impl ConfiguredSessions {
    pub fn new(source: SourceConfig, detector: DetectorConfig) -> Self {
        Self { source, detector }
    }
}

impl SessionFactory for ConfiguredSessions {
    fn load_locator(&self) -> Result<Box<dyn FaceLocator>, LocatorError> {
        Ok(Box::new(HaarCascadeLocator::load(&self.detector.cascade_path)?))
    }

    fn open_source(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        match (self.source.kind.as_str(), self.source.url.as_deref()) {
            ("mjpeg", Some(url)) => Ok(Box::new(MjpegHttpSource::open(
                url,
                Duration::from_secs(self.source.connect_timeout_secs),
            )?)),
            _ => Ok(Box::new(OpenCvCamera::open(self.source.device_index)?)),
        }
    }
}

/// Desktop preview window. Stops on the configured key or ESC.
pub struct PreviewWindow {
    title: String,
    stop_key: char,
    open: bool,
}

impl PreviewWindow {
    pub fn open(title: &str, stop_key: char) -> Result<Self, SinkError> {
        highgui::named_window(title, highgui::WINDOW_AUTOSIZE)
            .map_err(|e| SinkError::Display(e.to_string()))?;
        Ok(Self {
            title: title.to_string(),
            stop_key,
            open: true,
        })
    }
}

impl OutputSink for PreviewWindow {
    fn deliver(&mut self, frame: &RgbImage) -> Result<Delivery, SinkError> {
        let mat = rgb_to_bgr_mat(frame).map_err(|e| SinkError::Display(e.to_string()))?;
        highgui::imshow(&self.title, &mat).map_err(|e| SinkError::Display(e.to_string()))?;
        let key = highgui::wait_key(1).map_err(|e| SinkError::Display(e.to_string()))?;
        if key == ESC || key == self.stop_key as i32 {
            info!(key, "stop key pressed");
            return Ok(Delivery::Stop);
        }
        Ok(Delivery::Continue)
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = highgui::destroy_all_windows() {
            warn!(error = %e, "failed to close preview window");
        }
    }
}

impl Drop for PreviewWindow {
    fn drop(&mut self) {
        self.close();
    }
}

fn mat_from_bytes(rows: u32, cols: u32, typ: i32, bytes: &[u8]) -> opencv::Result<Mat> {
    let mut mat =
        Mat::new_rows_cols_with_default(rows as i32, cols as i32, typ, Scalar::all(0.0))?;
    mat.data_bytes_mut()?.copy_from_slice(bytes);
    Ok(mat)
}

fn bgr_mat_to_rgb(mat: &Mat) -> Result<RgbImage, SourceError> {
    if mat.typ() != CV_8UC3 {
        return Err(SourceError::ReadFailure(format!(
            "unexpected camera pixel type {}",
            mat.typ()
        )));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat
            .try_clone()
            .map_err(|e| SourceError::ReadFailure(e.to_string()))?;
        &owned
    };
    let bytes = mat
        .data_bytes()
        .map_err(|e| SourceError::ReadFailure(e.to_string()))?;
    let mut rgb = bytes.to_vec();
    for px in rgb.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    RgbImage::from_raw(mat.cols() as u32, mat.rows() as u32, rgb)
        .ok_or_else(|| SourceError::ReadFailure("camera frame size mismatch".into()))
}

/// Copy an RGB frame into a BGR `Mat` for display.
pub fn rgb_to_bgr_mat(frame: &RgbImage) -> opencv::Result<Mat> {
    let mut bgr = frame.as_raw().clone();
    for px in bgr.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    mat_from_bytes(frame.height(), frame.width(), CV_8UC3, &bgr)
}
