use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;

/// An axis-aligned face bounding box in frame coordinates.
///
/// Detections carry no identity; two detections in consecutive frames are
/// unrelated even when they cover the same face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Detection {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip the box to a `frame_width` x `frame_height` frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<Detection> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let right = self.x.saturating_add(self.width).min(frame_width);
        let bottom = self.y.saturating_add(self.height).min(frame_height);
        let clipped = Detection::new(self.x, self.y, right - self.x, bottom - self.y);
        (clipped.area() > 0).then_some(clipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Clear,
    Blurry,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Clear => "CLEAR",
            Classification::Blurry => "BLURRY",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sharpness score of one face region and its classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurResult {
    pub score: f64,
    pub classification: Classification,
}

impl BlurResult {
    pub fn is_blurry(&self) -> bool {
        self.classification == Classification::Blurry
    }
}

/// A persisted blurry-face sample: one image file plus one log line.
#[derive(Debug, Clone)]
pub struct SavedSample {
    pub image_path: PathBuf,
    pub score: f64,
    pub face_count: usize,
    pub timestamp: DateTime<Local>,
}

impl SavedSample {
    /// The detection log line for this sample, without trailing newline.
    ///
    /// e.g. `2026-02-18 09:30:00,123 | BLUR_DETECTED | score=12.34 | faces=2`
    pub fn log_line(&self) -> String {
        format!(
            "{} | BLUR_DETECTED | score={:.2} | faces={}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S,%3f"),
            self.score,
            self.face_count
        )
    }
}

/// File name for a saved sample, e.g. `blur_20260218_093000.jpg`.
pub fn sample_file_name(timestamp: &DateTime<Local>) -> String {
    format!("blur_{}.jpg", timestamp.format("%Y%m%d_%H%M%S"))
}
