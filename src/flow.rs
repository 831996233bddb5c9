use log::info;
use tokio::time::Instant;

use crate::camera::FrameSource;
use crate::capture::CapturedImage;
use crate::config::{CameraConfig, CaptureConfig};
use crate::detector::FaceDetector;
use crate::error::{CameraError, SessionError};
use crate::feedback::FeedbackCode;
use crate::session::{CaptureSession, SessionHandle, SessionOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Review {
    Confirm,
    Retake,
}

/// Whoever consumes captures: shows feedback, reviews stills, decides on retries.
#[allow(async_fn_in_trait)]
pub trait ResultHandoff {
    /// Called once per session before it starts. The session is cancelled as
    /// soon as every clone of `handle` is dropped.
    fn attach(&mut self, handle: SessionHandle);

    async fn review(&mut self, image: &CapturedImage) -> Review;

    /// Whether to start a new session after `error`.
    async fn on_failure(&mut self, error: &SessionError) -> bool;

    async fn on_timeout(&mut self, last_feedback: FeedbackCode) -> bool {
        let _ = last_feedback;
        false
    }
}

/// Runs capture sessions one after another until a still is confirmed or the
/// handoff gives up.
pub struct CaptureFlow<'d, D: FaceDetector> {
    config: CaptureConfig,
    detector: Option<&'d mut D>,
    not_before: Option<Instant>,
}

impl<'d, D: FaceDetector> CaptureFlow<'d, D> {
    pub fn new(config: CaptureConfig, detector: Option<&'d mut D>) -> Self {
        Self {
            config,
            detector,
            not_before: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.detector.is_none()
    }

    /// `acquire` opens the camera for each session; the previous session's
    /// camera is always released before it is called again.
    pub async fn run<S, A, H>(&mut self, mut acquire: A, handoff: &mut H) -> Option<CapturedImage>
    where
        S: FrameSource,
        A: FnMut(&CameraConfig) -> Result<S, CameraError>,
        H: ResultHandoff,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            info!("Capture attempt {}", attempt);

            let source = acquire(&self.config.camera);
            let (session, handle) =
                CaptureSession::start(&self.config, source, self.detector.as_deref_mut(), self.not_before);
            handoff.attach(handle);

            match session.run().await {
                SessionOutcome::Captured(image) => {
                    let captured = Instant::now();
                    match handoff.review(&image).await {
                        Review::Confirm => {
                            info!("Photo confirmed after {} attempt(s)", attempt);
                            return Some(image);
                        }
                        Review::Retake => {
                            info!("Retake requested");
                            self.not_before = Some(captured + self.config.capture.recapture_interval());
                        }
                    }
                }
                SessionOutcome::Cancelled => return None,
                SessionOutcome::Failed(error) => {
                    if !handoff.on_failure(&error).await {
                        return None;
                    }
                }
                SessionOutcome::TimedOut { last_feedback } => {
                    if !handoff.on_timeout(last_feedback).await {
                        return None;
                    }
                }
            }
        }
    }
}
