use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "rollcall.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Application configuration: built-in defaults, then an optional TOML
/// file, then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Requested capture size; the driver may pick the nearest it supports.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// One sub-directory of reference images per enrolled person.
    pub known_faces_dir: PathBuf,
    /// Where the daily attendance spreadsheets are written.
    pub reports_dir: PathBuf,
    /// Euclidean distance below which a face matches a known person.
    pub match_threshold: f32,
    /// Analyse every Nth frame.
    pub frame_interval: u32,
    /// Downscale factor applied before analysis (1.0 = full size).
    pub process_scale: f32,
    /// Frames discarded after opening the camera (AGC/AE stabilisation).
    pub warmup_frames: usize,
    /// Minimum detector confidence for an enrollment capture.
    pub enroll_min_confidence: f32,
    /// Frames tried per pose before the pose is given up.
    pub enroll_max_attempts: usize,
    /// Pause after each pose prompt so the person can turn their head.
    pub enroll_settle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: default_model_dir(),
            known_faces_dir: PathBuf::from("known_faces"),
            reports_dir: PathBuf::from("attendance_reports"),
            match_threshold: 1.10,
            frame_interval: 5,
            process_scale: 1.0,
            warmup_frames: 4,
            enroll_min_confidence: 0.6,
            enroll_max_attempts: 60,
            enroll_settle_ms: 1500,
        }
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}

impl Config {
    /// Load configuration from `path` (or `./rollcall.toml` if it exists),
    /// then apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };

        let mut config = match file {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "loaded config file");
                config
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables, looked up through `lookup`.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        env_parse(&lookup, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width)?;
        env_parse(&lookup, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height)?;
        env_parse(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold)?;
        env_parse(&lookup, "ROLLCALL_FRAME_INTERVAL", &mut self.frame_interval)?;
        env_parse(&lookup, "ROLLCALL_PROCESS_SCALE", &mut self.process_scale)?;
        env_parse(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames)?;
        env_parse(&lookup, "ROLLCALL_ENROLL_MIN_CONFIDENCE", &mut self.enroll_min_confidence)?;
        env_parse(&lookup, "ROLLCALL_ENROLL_MAX_ATTEMPTS", &mut self.enroll_max_attempts)?;
        env_parse(&lookup, "ROLLCALL_ENROLL_SETTLE_MS", &mut self.enroll_settle_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid("match_threshold must be positive".into()));
        }
        if self.frame_interval == 0 {
            return Err(ConfigError::Invalid("frame_interval must be at least 1".into()));
        }
        if !(self.process_scale > 0.0 && self.process_scale <= 1.0) {
            return Err(ConfigError::Invalid("process_scale must be in (0, 1]".into()));
        }
        if self.enroll_max_attempts == 0 {
            return Err(ConfigError::Invalid("enroll_max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value })?;
    }
    Ok(())
}
