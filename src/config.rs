use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use facegate_vision::EncoderSettings;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/facegate/config.toml"))
});

pub static FACE_STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_STORE_PREFIX").unwrap_or("/usr/local/etc/facegate"))
});

/// Tuning constants. Each one is the default of the matching config field.
pub mod defaults {
    pub const CONSENSUS_REQUIRED: u32 = 3;
    pub const MAX_ATTEMPTS: u32 = 40;
    pub const PREVIEW_INTERVAL_MS: u64 = 33;
    pub const VERIFY_INTERVAL_MS: u64 = 300;
    pub const REGISTER_INTERVAL_MS: u64 = 400;
    pub const WARMUP_MS: u64 = 600;
    pub const THRESHOLD_VERIFY: f32 = 0.45;
    pub const THRESHOLD_IDENTIFY: f32 = 0.42;
    pub const EPSILON: f32 = 0.01;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: String,
    pub detector_model: PathBuf,
    pub recognizer_model: PathBuf,
    pub session: SessionConfig,
    pub matching: MatchingConfig,
    pub encoder: EncoderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: "/dev/video0".to_string(),
            detector_model: PathBuf::from(
                "/usr/local/share/facegate/face_detection_yunet_2023mar.onnx",
            ),
            recognizer_model: PathBuf::from(
                "/usr/local/share/facegate/face_recognition_sface_2021dec.onnx",
            ),
            session: SessionConfig::default(),
            matching: MatchingConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub consensus_required: u32,
    pub max_attempts: u32,
    pub preview_interval_ms: u64,
    pub verify_interval_ms: u64,
    pub register_interval_ms: u64,
    pub warmup_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            consensus_required: defaults::CONSENSUS_REQUIRED,
            max_attempts: defaults::MAX_ATTEMPTS,
            preview_interval_ms: defaults::PREVIEW_INTERVAL_MS,
            verify_interval_ms: defaults::VERIFY_INTERVAL_MS,
            register_interval_ms: defaults::REGISTER_INTERVAL_MS,
            warmup_ms: defaults::WARMUP_MS,
        }
    }
}

const MIN_CAPTURE_TIMEOUT_MS: u64 = 100;

impl SessionConfig {
    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_millis(self.register_interval_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Longest a single camera read may block. Bounds how long cancelling
    /// waits on a stalled device.
    pub fn capture_timeout(&self) -> Duration {
        (self.preview_interval() * 4).max(Duration::from_millis(MIN_CAPTURE_TIMEOUT_MS))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`; 0 for identical directions, 2 for opposite ones.
    #[default]
    Cosine,
    /// L2 distance between the raw vectors.
    Euclidean,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MatchingConfig {
    pub metric: DistanceMetric,
    /// Largest distance (inclusive) accepted by a 1:1 verification.
    pub threshold_verify: f32,
    /// Largest distance (inclusive) accepted by identification and the
    /// duplicate scan at registration.
    pub threshold_identify: f32,
    /// Two identities closer than this to the best distance make an
    /// identification ambiguous.
    pub epsilon: f32,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            threshold_verify: defaults::THRESHOLD_VERIFY,
            threshold_identify: defaults::THRESHOLD_IDENTIFY,
            epsilon: defaults::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub detection_scale: f32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    pub min_face_size: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let s = EncoderSettings::default();
        Self {
            detection_scale: s.detection_scale,
            score_threshold: s.score_threshold,
            nms_threshold: s.nms_threshold,
            min_face_size: s.min_face_size,
        }
    }
}

impl From<EncoderConfig> for EncoderSettings {
    fn from(c: EncoderConfig) -> Self {
        Self {
            detection_scale: c.detection_scale,
            score_threshold: c.score_threshold,
            nms_threshold: c.nms_threshold,
            min_face_size: c.min_face_size,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.consensus_required == 0 {
            anyhow::bail!("session.consensus_required must be at least 1");
        }
        if s.max_attempts == 0 {
            anyhow::bail!("session.max_attempts must be at least 1");
        }
        if s.preview_interval_ms == 0 || s.verify_interval_ms == 0 || s.register_interval_ms == 0 {
            anyhow::bail!("session intervals must be non-zero");
        }
        let m = &self.matching;
        for (name, value) in [
            ("threshold_verify", m.threshold_verify),
            ("threshold_identify", m.threshold_identify),
            ("epsilon", m.epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("matching.{name} must be a non-negative number, got {value}");
            }
        }
        let scale = self.encoder.detection_scale;
        if !(scale > 0.0 && scale <= 1.0) {
            anyhow::bail!("encoder.detection_scale must be in (0, 1], got {scale}");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        log::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
