use anyhow::{Context, Result};
use selfiecam_core::{CaptureConfig, CaptureFlags};
use selfiecam_hw::StreamConstraints;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: an optional TOML file, then `SELFIECAM_*`
/// environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the UltraFace ONNX model.
    pub model_path: PathBuf,
    /// Requested capture width.
    pub width: u32,
    /// Requested capture height.
    pub height: u32,
    /// Minimum face score that counts as "face present".
    pub score_threshold: f32,
    /// Milliseconds between detection polls.
    pub poll_interval_ms: u64,
    /// Countdown start value in seconds.
    pub countdown_secs: u8,
    /// JPEG quality of captured stills (1-100).
    pub jpeg_quality: u8,
    /// Open the camera as soon as the shell is ready.
    pub auto_start: bool,
    pub disabled_skip: bool,
    pub initializing: bool,
}

impl Default for Config {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_path: selfiecam_core::default_model_dir().join(selfiecam_core::FACE_MODEL_FILE),
            width: capture.constraints.width,
            height: capture.constraints.height,
            score_threshold: capture.score_threshold,
            poll_interval_ms: capture.poll_interval.as_millis() as u64,
            countdown_secs: capture.countdown_start,
            jpeg_quality: capture.jpeg_quality,
            auto_start: false,
            disabled_skip: false,
            initializing: false,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a TOML config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Override fields from `SELFIECAM_*` variables. Unparseable values
    /// leave the field unchanged.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(device) = var("SELFIECAM_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Some(path) = var("SELFIECAM_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        self.width = parse_or(&var, "SELFIECAM_WIDTH", self.width);
        self.height = parse_or(&var, "SELFIECAM_HEIGHT", self.height);
        self.score_threshold = parse_or(&var, "SELFIECAM_SCORE_THRESHOLD", self.score_threshold);
        self.poll_interval_ms = parse_or(&var, "SELFIECAM_POLL_INTERVAL_MS", self.poll_interval_ms);
        self.countdown_secs = parse_or(&var, "SELFIECAM_COUNTDOWN_SECS", self.countdown_secs);
        self.jpeg_quality = parse_or(&var, "SELFIECAM_JPEG_QUALITY", self.jpeg_quality);
        self.auto_start = flag_or(&var, "SELFIECAM_AUTO_START", self.auto_start);
        self.disabled_skip = flag_or(&var, "SELFIECAM_DISABLED_SKIP", self.disabled_skip);
        self.initializing = flag_or(&var, "SELFIECAM_INITIALIZING", self.initializing);
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            countdown_start: self.countdown_secs,
            score_threshold: self.score_threshold,
            jpeg_quality: self.jpeg_quality.clamp(1, 100),
            constraints: StreamConstraints {
                width: self.width,
                height: self.height,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn flags(&self) -> CaptureFlags {
        CaptureFlags {
            auto_start: self.auto_start,
            disabled_skip: self.disabled_skip,
            initializing: self.initializing,
        }
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

/// `$SELFIECAM_CONFIG`, else `$XDG_CONFIG_HOME/selfiecam/config.toml`.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SELFIECAM_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("selfiecam/config.toml")
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

fn flag_or(var: &impl Fn(&str) -> Option<String>, key: &str, current: bool) -> bool {
    var(key).map(|v| v != "0" && v != "false").unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_controller() {
        let config = Config::default();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.countdown_secs, 5);
        assert_eq!(config.jpeg_quality, 92);
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(config.model_path.ends_with("version-RFB-320.onnx"));
        assert_eq!(config.flags(), CaptureFlags::default());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.camera_device, "/dev/video0");
    }

    #[test]
    fn test_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "camera_device = \"/dev/video4\"\ncountdown_secs = 3\nauto_start = true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.countdown_secs, 3);
        assert!(config.auto_start);
        assert_eq!(config.jpeg_quality, 92);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "countdown_secs = \"soon\"").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(vars(&[
            ("SELFIECAM_CAMERA_DEVICE", "/dev/video9"),
            ("SELFIECAM_POLL_INTERVAL_MS", "100"),
            ("SELFIECAM_SCORE_THRESHOLD", "0.7"),
            ("SELFIECAM_AUTO_START", "1"),
            ("SELFIECAM_DISABLED_SKIP", "true"),
            ("SELFIECAM_JPEG_QUALITY", "not-a-number"),
        ]));

        assert_eq!(config.camera_device, "/dev/video9");
        assert_eq!(config.poll_interval_ms, 100);
        assert!((config.score_threshold - 0.7).abs() < 1e-6);
        assert!(config.auto_start);
        assert!(config.disabled_skip);
        assert_eq!(config.jpeg_quality, 92);
    }

    #[test]
    fn test_flag_zero_disables() {
        let mut config = Config {
            auto_start: true,
            ..Default::default()
        };
        config.apply_overrides(vars(&[("SELFIECAM_AUTO_START", "0")]));
        assert!(!config.auto_start);
    }

    #[test]
    fn test_capture_config_conversion() {
        let config = Config {
            poll_interval_ms: 0,
            jpeg_quality: 0,
            width: 640,
            height: 480,
            ..Default::default()
        };
        let capture = config.capture_config();
        assert_eq!(capture.poll_interval, Duration::from_millis(1));
        assert_eq!(capture.jpeg_quality, 1);
        assert_eq!((capture.constraints.width, capture.constraints.height), (640, 480));
        assert_eq!(capture.countdown_period, Duration::from_secs(1));
    }
}
