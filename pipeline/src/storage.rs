use blur_watch_common::config::PersistenceConfig;
use blur_watch_common::frame::{sample_file_name, SavedSample};
use chrono::{DateTime, Local};
use image::RgbImage;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::sink::encode_jpeg;

/// Destination for throttled blurry-face samples.
///
/// Shared by every session of a process, so implementations must be
/// safe to call concurrently.
pub trait SampleSink: Send + Sync {
    fn save(
        &self,
        frame: &RgbImage,
        score: f64,
        face_count: usize,
        timestamp: DateTime<Local>,
    ) -> Result<SavedSample, SinkWriteError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SinkWriteError {
    #[error("failed to create directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to open detection log {0}: {1}")]
    OpenLog(String, std::io::Error),
    #[error("failed to write image {0}: {1}")]
    WriteImage(String, String),
    #[error("failed to append to detection log: {0}")]
    AppendLog(std::io::Error),
}

/// Writes `blur_<YYYYMMDD_HHMMSS>.jpg` files into a directory and appends
/// one `BLUR_DETECTED` line per sample to an append-only log.
///
/// Opened once at startup; the log handle is kept for the process lifetime.
pub struct DiskSampleSink {
    output_dir: PathBuf,
    jpeg_quality: u8,
    log: Mutex<File>,
}

impl DiskSampleSink {
    /// Create the output directory and the log file (and its parent) if absent.
    pub fn open(config: &PersistenceConfig, jpeg_quality: u8) -> Result<Self, SinkWriteError> {
        create_dir(&config.output_dir)?;
        if let Some(parent) = config.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir(parent)?;
            }
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)
            .map_err(|e| SinkWriteError::OpenLog(config.log_path.display().to_string(), e))?;

        info!(
            output_dir = config.output_dir.display().to_string(),
            log_path = config.log_path.display().to_string(),
            "sample sink ready"
        );

        Ok(Self {
            output_dir: config.output_dir.clone(),
            jpeg_quality,
            log: Mutex::new(log),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl SampleSink for DiskSampleSink {
    fn save(
        &self,
        frame: &RgbImage,
        score: f64,
        face_count: usize,
        timestamp: DateTime<Local>,
    ) -> Result<SavedSample, SinkWriteError> {
        let image_path = self.output_dir.join(sample_file_name(&timestamp));
        let jpeg = encode_jpeg(frame, self.jpeg_quality)
            .map_err(|e| SinkWriteError::WriteImage(image_path.display().to_string(), e.0))?;
        std::fs::write(&image_path, &jpeg).map_err(|e| {
            SinkWriteError::WriteImage(image_path.display().to_string(), e.to_string())
        })?;

        let sample = SavedSample {
            image_path,
            score,
            face_count,
            timestamp,
        };

        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(log, "{}", sample.log_line()).map_err(SinkWriteError::AppendLog)?;
        log.flush().map_err(SinkWriteError::AppendLog)?;

        debug!(
            path = sample.image_path.display().to_string(),
            bytes = jpeg.len(),
            "sample written"
        );
        Ok(sample)
    }
}

fn create_dir(dir: &Path) -> Result<(), SinkWriteError> {
    std::fs::create_dir_all(dir).map_err(|e| SinkWriteError::CreateDir(dir.display().to_string(), e))
}
