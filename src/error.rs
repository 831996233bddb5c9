use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera access denied for {device}")]
    PermissionDenied { device: String },
    #[error("no camera found at {device}")]
    NotFound { device: String },
    #[error("camera {device} is in use by another application")]
    Busy { device: String },
    #[error("camera stream error: {0}")]
    Stream(String),
}

impl CameraError {
    /// Classify an I/O failure raised while opening `device`.
    pub fn from_io(device: &str, err: &std::io::Error) -> Self {
        let device = device.to_string();

        if err.raw_os_error() == Some(libc::EBUSY) {
            return CameraError::Busy { device };
        }

        match err.kind() {
            std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied { device },
            std::io::ErrorKind::NotFound => CameraError::NotFound { device },
            _ => CameraError::Stream(format!("{}: {}", device, err)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model artifact {artifact} not found in {dir:?}")]
    Missing { artifact: &'static str, dir: PathBuf },
    #[error("failed to download {artifact}: {reason}")]
    Download { artifact: &'static str, reason: String },
    #[error("checksum mismatch for {artifact}")]
    Checksum { artifact: &'static str },
    #[error("model source timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to open models from {dir:?}: {reason}")]
    Open { dir: PathBuf, reason: String },
    #[error("all model sources exhausted after {attempts} attempt(s)")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModelLoadError {
    /// Whether trying the same source again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ModelLoadError::Missing { .. } | ModelLoadError::Exhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("video not ready ({width}x{height})")]
    VideoNotReady { width: u32, height: u32 },
    #[error("encoder produced an empty image")]
    EmptyImage,
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Error, PartialEq)]
#[error("guide region must have positive size (got {width}x{height})")]
pub struct GuideError {
    pub width: f64,
    pub height: f64,
}

/// Failures that end a session and need an explicit retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("camera stopped delivering frames: {0}")]
    FrameSource(String),
}
