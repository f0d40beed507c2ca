use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub blur: BlurConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub annotate: AnnotateConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where frames come from.
///
/// `kind = "device"` opens a local camera by index (requires the `opencv`
/// feature); `kind = "mjpeg"` reads a network camera's multipart stream.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: String,
    #[serde(default)]
    pub device_index: i32,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_cascade_path")]
    pub cascade_path: PathBuf,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_min_neighbors")]
    pub min_neighbors: i32,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlurConfig {
    #[serde(default = "default_blur_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotateConfig {
    #[serde(default = "default_font_path")]
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_window_title")]
    pub window_title: String,
    #[serde(default = "default_stop_key")]
    pub stop_key: char,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            device_index: 0,
            url: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade_path: default_cascade_path(),
            scale_factor: default_scale_factor(),
            min_neighbors: default_min_neighbors(),
            min_size: default_min_size(),
        }
    }
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            threshold: default_blur_threshold(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for AnnotateConfig {
    fn default() -> Self {
        Self {
            font_path: default_font_path(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_output_dir(),
            log_path: default_log_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_sessions: default_max_sessions(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            window_title: default_window_title(),
            stop_key: default_stop_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = path.display().to_string(), "config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.source.kind.as_str() {
            "device" => {}
            "mjpeg" if self.source.url.is_some() => {}
            "mjpeg" => {
                return Err(ConfigError::Invalid(
                    "source.url is required when source.kind = \"mjpeg\"".into(),
                ))
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown source.kind '{other}', expected 'device' or 'mjpeg'"
                )))
            }
        }
        if self.detector.scale_factor <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "detector.scale_factor must be > 1.0, got {}",
                self.detector.scale_factor
            )));
        }
        if self.detector.min_neighbors < 0 {
            return Err(ConfigError::Invalid(
                "detector.min_neighbors must not be negative".into(),
            ));
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size must be non-zero, got {}x{}",
                self.frame.width, self.frame.height
            )));
        }
        if !(1..=100).contains(&self.frame.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "frame.jpeg_quality must be in 1..=100, got {}",
                self.frame.jpeg_quality
            )));
        }
        if !matches!(
            std::time::Duration::try_from_secs_f64(self.throttle.interval_secs),
            Ok(d) if !d.is_zero()
        ) {
            return Err(ConfigError::Invalid(format!(
                "throttle.interval_secs must be a positive representable duration, got {}",
                self.throttle.interval_secs
            )));
        }
        if !self.blur.threshold.is_finite() || self.blur.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "blur.threshold must be a non-negative number, got {}",
                self.blur.threshold
            )));
        }
        if self.server.max_sessions == 0 || self.server.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.max_sessions and server.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_source_kind() -> String {
    "device".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_cascade_path() -> PathBuf {
    PathBuf::from("assets/haarcascade_frontalface_default.xml")
}
fn default_scale_factor() -> f64 {
    1.1
}
fn default_min_neighbors() -> i32 {
    3
}
fn default_min_size() -> u32 {
    40
}
fn default_blur_threshold() -> f64 {
    80.0
}
fn default_interval_secs() -> f64 {
    5.0
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_font_path() -> Option<PathBuf> {
    None
}
fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("saved_frames")
}
fn default_log_path() -> PathBuf {
    PathBuf::from("logs/detections.log")
}
fn default_port() -> u16 {
    5000
}
fn default_max_sessions() -> usize {
    1
}
fn default_channel_capacity() -> usize {
    2
}
fn default_window_title() -> String {
    "Face Detection".into()
}
fn default_stop_key() -> char {
    'q'
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.source.kind, "device");
        assert_eq!(config.detector.scale_factor, 1.1);
        assert_eq!(config.detector.min_neighbors, 3);
        assert_eq!(config.detector.min_size, 40);
        assert_eq!(config.blur.threshold, 80.0);
        assert_eq!(config.throttle.interval_secs, 5.0);
        assert_eq!((config.frame.width, config.frame.height), (640, 480));
        assert_eq!(config.server.port, 5000);
        assert!(config.persistence.enabled);
        assert_eq!(config.preview.stop_key, 'q');
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = Config::from_toml(include_str!("../../config.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(shipped.detector.cascade_path, defaults.detector.cascade_path);
        assert_eq!(shipped.detector.min_size, defaults.detector.min_size);
        assert_eq!(shipped.throttle.interval_secs, defaults.throttle.interval_secs);
        assert_eq!(shipped.persistence.log_path, defaults.persistence.log_path);
        assert_eq!(shipped.preview.stop_key, defaults.preview.stop_key);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [detector]
            scale_factor = 1.3
            min_neighbors = 5
            min_size = 60

            [persistence]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.detector.scale_factor, 1.3);
        assert_eq!(config.detector.min_neighbors, 5);
        assert_eq!(config.detector.min_size, 60);
        assert!(!config.persistence.enabled);
        assert_eq!(config.persistence.output_dir, PathBuf::from("saved_frames"));
        assert_eq!(config.blur.threshold, 80.0);
    }

    #[test]
    fn rejects_scale_factor_not_above_one() {
        let err = Config::from_toml("[detector]\nscale_factor = 1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn mjpeg_source_needs_url() {
        let err = Config::from_toml("[source]\nkind = \"mjpeg\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = Config::from_toml(
            "[source]\nkind = \"mjpeg\"\nurl = \"http://10.0.0.5:8080/stream\"\n",
        )
        .unwrap();
        assert_eq!(config.source.url.as_deref(), Some("http://10.0.0.5:8080/stream"));

        let err = Config::from_toml("[source]\nkind = \"rtsp\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = Config::from_toml("[throttle]\ninterval_secs = 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unrepresentable_interval() {
        let err = Config::from_toml("[throttle]\ninterval_secs = 1e20\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = Config::from_toml("[throttle]\ninterval_secs = -3.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let err = Config::from_toml("[frame]\njpeg_quality = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[blur\nthreshold = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = Config::load(Path::new("/nonexistent/blur-watch.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile(..)));
    }
}
