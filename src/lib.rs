//! Guided face photo capture.
//!
//! A [`CaptureSession`] reads frames from a [`FrameSource`], runs a
//! [`FaceDetector`] on each one, and lets the [`CaptureStateMachine`] decide
//! when a face is centered, close enough, sharp and well lit. Then it counts
//! down and encodes a cropped JPEG. [`CaptureFlow`] chains sessions for
//! review and retakes.

pub mod alignment;
pub mod camera;
pub mod capture;
pub mod config;
pub mod detector;
pub mod error;
pub mod feedback;
pub mod flow;
pub mod frame;
pub mod guide;
pub mod machine;
pub mod models;
pub mod quality;
pub mod session;

pub use camera::FrameSource;
pub use capture::{CaptureMetadata, CapturedImage};
pub use config::CaptureConfig;
pub use detector::{BoundingBox, Detection, FaceDetector, Point};
pub use error::{CameraError, CaptureError, ConfigError, ModelLoadError, SessionError};
pub use feedback::{FeedbackCode, Tone};
pub use flow::{CaptureFlow, ResultHandoff, Review};
pub use frame::Frame;
pub use machine::{CaptureState, CaptureStateMachine};
pub use models::ModelLoader;
pub use session::{CaptureSession, SessionHandle, SessionOutcome};

/// Logs to stderr, `info` unless `RUST_LOG` says otherwise. Safe to call twice.
pub fn init_logging() {
    init_logging_at("info");
}

pub fn init_logging_at(default_level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).try_init();
}
