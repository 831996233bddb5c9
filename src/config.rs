use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub alignment: AlignmentConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default = "default_version")]
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    User,
    Environment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_facing")]
    pub facing: Facing,
    #[serde(default = "default_frame_width")]
    pub width: u32,
    #[serde(default = "default_frame_height")]
    pub height: u32,
    /// Overrides the facing-based default (front cameras are previewed mirrored).
    #[serde(default)]
    pub mirror: Option<bool>,
    /// Size of the on-screen preview the guide is drawn on. Defaults to the frame size.
    #[serde(default)]
    pub preview_width: Option<u32>,
    #[serde(default)]
    pub preview_height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuidePolicy {
    Fixed { width_ratio: f64, height_ratio: f64 },
    FaceBox { scale: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default = "default_guide")]
    pub guide: GuidePolicy,
    /// Fraction of the guide's smaller side the nose may stray from its center.
    #[serde(default = "default_center_tolerance")]
    pub center_tolerance: f64,
    /// Minimum face box width as a fraction of the frame width.
    #[serde(default = "default_min_face_width_ratio")]
    pub min_face_width_ratio: f64,
    #[serde(default = "default_hysteresis_frames")]
    pub hysteresis_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionSize {
    Fixed { pixels: u32 },
    BoxFraction { fraction: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_region")]
    pub region: RegionSize,
    #[serde(default = "default_stride")]
    pub stride: u32,
    /// Mean squared Laplacian is divided by this before comparing to `min_sharpness`.
    #[serde(default = "default_sharpness_divisor")]
    pub sharpness_divisor: f64,
    #[serde(default = "default_min_sharpness")]
    pub min_sharpness: f64,
    #[serde(default = "default_true")]
    pub check_brightness: bool,
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u32,
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default = "default_recapture_interval_secs")]
    pub recapture_interval_secs: f64,
    /// Width:height of the saved photo; `None` keeps the native frame.
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: Option<(u32, u32)>,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_max_frame_errors")]
    pub max_frame_errors: u32,
    #[serde(default)]
    pub session_timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    Local { dir: PathBuf },
    Remote { base_url: String, cache_dir: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_model_sources")]
    pub sources: Vec<ModelSource>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: f64,
    #[serde(default = "default_model_attempts")]
    pub attempts: u32,
    #[serde(default = "default_model_retry_delay")]
    pub retry_delay_secs: f64,
}

fn default_version() -> u32 { 1 }
fn default_device() -> String { "/dev/video0".to_string() }
fn default_facing() -> Facing { Facing::User }
fn default_frame_width() -> u32 { 640 }
fn default_frame_height() -> u32 { 480 }
fn default_guide() -> GuidePolicy { GuidePolicy::Fixed { width_ratio: 0.5, height_ratio: 0.75 } }
fn default_center_tolerance() -> f64 { 0.35 }
fn default_min_face_width_ratio() -> f64 { 0.08 }
fn default_hysteresis_frames() -> u32 { 4 }
fn default_region() -> RegionSize { RegionSize::Fixed { pixels: 96 } }
fn default_stride() -> u32 { 1 }
fn default_sharpness_divisor() -> f64 { 1000.0 }
fn default_min_sharpness() -> f64 { 0.05 }
fn default_true() -> bool { true }
fn default_min_brightness() -> f64 { 0.2 }
fn default_countdown_secs() -> u32 { 3 }
fn default_cycle_interval_ms() -> u64 { 100 }
fn default_recapture_interval_secs() -> f64 { 3.0 }
fn default_aspect_ratio() -> Option<(u32, u32)> { Some((3, 4)) }
fn default_jpeg_quality() -> u8 { 95 }
fn default_max_frame_errors() -> u32 { 30 }
fn default_model_timeout() -> f64 { 10.0 }
fn default_model_attempts() -> u32 { 3 }
fn default_model_retry_delay() -> f64 { 2.0 }

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("glance").join("models"))
        .unwrap_or_else(|| PathBuf::from("./models"))
}

fn default_model_sources() -> Vec<ModelSource> {
    vec![
        ModelSource::Local { dir: PathBuf::from("/usr/share/glance/models") },
        ModelSource::Local { dir: default_models_dir() },
        ModelSource::Remote {
            base_url: "http://dlib.net/files".to_string(),
            cache_dir: default_models_dir(),
        },
    ]
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            alignment: AlignmentConfig::default(),
            quality: QualityConfig::default(),
            capture: CaptureSettings::default(),
            models: ModelsConfig::default(),
            version: default_version(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            facing: default_facing(),
            width: default_frame_width(),
            height: default_frame_height(),
            mirror: None,
            preview_width: None,
            preview_height: None,
        }
    }
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            guide: default_guide(),
            center_tolerance: default_center_tolerance(),
            min_face_width_ratio: default_min_face_width_ratio(),
            hysteresis_frames: default_hysteresis_frames(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            stride: default_stride(),
            sharpness_divisor: default_sharpness_divisor(),
            min_sharpness: default_min_sharpness(),
            check_brightness: default_true(),
            min_brightness: default_min_brightness(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            cycle_interval_ms: default_cycle_interval_ms(),
            recapture_interval_secs: default_recapture_interval_secs(),
            aspect_ratio: default_aspect_ratio(),
            jpeg_quality: default_jpeg_quality(),
            max_frame_errors: default_max_frame_errors(),
            session_timeout_secs: None,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            sources: default_model_sources(),
            timeout_secs: default_model_timeout(),
            attempts: default_model_attempts(),
            retry_delay_secs: default_model_retry_delay(),
        }
    }
}

impl CameraConfig {
    pub fn mirror(&self) -> bool {
        self.mirror.unwrap_or(self.facing == Facing::User)
    }
}

impl CaptureSettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(1))
    }

    pub fn recapture_interval(&self) -> Duration {
        Duration::from_secs_f64(self.recapture_interval_secs.max(0.0))
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_secs
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl CaptureConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: CaptureConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// User config, then system config, then built-in defaults.
    pub fn load_default() -> Self {
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/glance/capture.json");
            if user_config.exists() {
                match Self::load(&user_config) {
                    Ok(config) => return config,
                    Err(e) => log::warn!("Ignoring {:?}: {}", user_config, e),
                }
            }
        }

        let system_config = Path::new("/etc/glance/capture.json");
        if system_config.exists() {
            match Self::load(system_config) {
                Ok(config) => return config,
                Err(e) => log::warn!("Ignoring {:?}: {}", system_config, e),
            }
        }

        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        match self.alignment.guide {
            GuidePolicy::Fixed { width_ratio, height_ratio } => {
                if !(width_ratio > 0.0 && height_ratio > 0.0) {
                    return invalid("guide ratios must be positive");
                }
            }
            GuidePolicy::FaceBox { scale } => {
                if !(scale > 0.0) {
                    return invalid("guide scale must be positive");
                }
            }
        }
        if !(self.alignment.center_tolerance > 0.0 && self.alignment.center_tolerance <= 1.0) {
            return invalid("center_tolerance must be in (0, 1]");
        }
        if !(self.alignment.min_face_width_ratio > 0.0 && self.alignment.min_face_width_ratio <= 1.0) {
            return invalid("min_face_width_ratio must be in (0, 1]");
        }
        if self.alignment.hysteresis_frames == 0 {
            return invalid("hysteresis_frames must be at least 1");
        }
        if self.quality.stride == 0 {
            return invalid("quality stride must be at least 1");
        }
        if !(self.quality.sharpness_divisor > 0.0) {
            return invalid("sharpness_divisor must be positive");
        }
        if let RegionSize::BoxFraction { fraction } = self.quality.region {
            if !(fraction > 0.0) {
                return invalid("quality region fraction must be positive");
            }
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return invalid("jpeg_quality must be between 1 and 100");
        }
        if let Some((w, h)) = self.capture.aspect_ratio {
            if w == 0 || h == 0 {
                return invalid("aspect_ratio terms must be positive");
            }
        }
        if self.models.sources.is_empty() {
            return invalid("at least one model source is required");
        }

        Ok(())
    }
}
