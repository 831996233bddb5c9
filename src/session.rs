//! One capture session: a camera, an optional detector and the state machine,
//! driven by a tokio interval until a still is captured or the session ends.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::FrameSource;
use crate::capture::{capture_still, CapturedImage};
use crate::config::CaptureConfig;
use crate::detector::{Detection, FaceDetector};
use crate::error::{CameraError, SessionError};
use crate::feedback::FeedbackCode;
use crate::frame::Frame;
use crate::machine::{CaptureState, CaptureStateMachine};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);
const COMMAND_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ManualCapture,
}

/// Control side of a running session. Dropping every handle cancels it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    // Separate from `commands` so a full command queue can't swallow it.
    cancel: Arc<watch::Sender<bool>>,
    feedback: watch::Receiver<FeedbackCode>,
}

impl SessionHandle {
    /// Asks for a capture without waiting for alignment. Returns `false` if
    /// the session has already ended or too many requests are queued.
    pub fn request_manual_capture(&self) -> bool {
        self.commands.try_send(SessionCommand::ManualCapture).is_ok()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn feedback(&self) -> watch::Receiver<FeedbackCode> {
        self.feedback.clone()
    }

    pub fn current_feedback(&self) -> FeedbackCode {
        *self.feedback.borrow()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Captured(CapturedImage),
    Cancelled,
    Failed(SessionError),
    TimedOut { last_feedback: FeedbackCode },
}

enum Wake {
    Command(Option<SessionCommand>),
    Cancelled,
    TimedOut,
    Tick,
    Detected(anyhow::Result<Vec<Detection>>),
}

pub struct CaptureSession<'d, S: FrameSource, D: FaceDetector> {
    config: CaptureConfig,
    machine: CaptureStateMachine,
    source: Option<S>,
    acquire_error: Option<CameraError>,
    detector: Option<&'d mut D>,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: watch::Receiver<bool>,
    feedback: watch::Sender<FeedbackCode>,
    frame_errors: u32,
}

impl<'d, S: FrameSource, D: FaceDetector> CaptureSession<'d, S, D> {
    /// Builds a session around an acquired camera (or the reason acquisition
    /// failed). Without a detector the session runs in manual-capture mode.
    pub fn start(
        config: &CaptureConfig,
        source: Result<S, CameraError>,
        detector: Option<&'d mut D>,
        not_before: Option<Instant>,
    ) -> (Self, SessionHandle) {
        let machine = CaptureStateMachine::new(config).with_not_before(not_before);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (feedback_tx, feedback_rx) = watch::channel(machine.feedback());

        let (source, acquire_error) = match source {
            Ok(source) => (Some(source), None),
            Err(e) => (None, Some(e)),
        };

        let session = Self {
            config: config.clone(),
            machine,
            source,
            acquire_error,
            detector,
            commands: command_rx,
            cancel: cancel_rx,
            feedback: feedback_tx,
            frame_errors: 0,
        };
        let handle = SessionHandle {
            commands: command_tx,
            cancel: Arc::new(cancel_tx),
            feedback: feedback_rx,
        };
        (session, handle)
    }

    pub fn state(&self) -> &CaptureState {
        self.machine.state()
    }

    /// Runs until the session ends. The camera is released before returning.
    pub async fn run(mut self) -> SessionOutcome {
        info!(
            "Starting capture session (detector: {}, timeout: {:?})",
            if self.detector.is_some() { "yes" } else { "none, manual only" },
            self.config.capture.session_timeout()
        );

        let outcome = self.drive().await;
        self.release();

        match &outcome {
            SessionOutcome::Captured(image) => info!("Session captured a {}x{} photo", image.width, image.height),
            SessionOutcome::Cancelled => info!("Session cancelled"),
            SessionOutcome::Failed(e) => error!("Session failed: {}", e),
            SessionOutcome::TimedOut { last_feedback } => info!("Session timed out ({:?})", last_feedback),
        }
        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        if let Some(err) = self.acquire_error.take() {
            return self.fail(SessionError::Camera(err));
        }

        let deadline = self.config.capture.session_timeout().map(|t| Instant::now() + t);
        let timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout);

        let mut interval = tokio::time::interval(self.config.capture.cycle_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_step: Option<Instant> = None;

        loop {
            if let CaptureState::Countdown { remaining } = *self.machine.state() {
                if remaining == 0 {
                    next_step = None;
                    if let Some(image) = self.take_still() {
                        return SessionOutcome::Captured(image);
                    }
                    continue;
                }

                let step = *next_step.get_or_insert_with(|| Instant::now() + COUNTDOWN_STEP);
                let wake = tokio::select! {
                    biased;
                    _ = self.cancel.changed() => Wake::Cancelled,
                    cmd = self.commands.recv() => Wake::Command(cmd),
                    _ = &mut timeout => Wake::TimedOut,
                    _ = tokio::time::sleep_until(step) => Wake::Tick,
                };

                match wake {
                    Wake::Command(Some(SessionCommand::ManualCapture)) => debug!("Already counting down"),
                    Wake::Command(None) | Wake::Cancelled => return SessionOutcome::Cancelled,
                    Wake::TimedOut => return self.time_out(),
                    _ => {
                        next_step = Some(step + COUNTDOWN_STEP);
                        self.machine.tick_countdown();
                        self.publish();
                    }
                }
                continue;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.changed() => Wake::Cancelled,
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = &mut timeout => Wake::TimedOut,
                _ = interval.tick() => Wake::Tick,
            };
            match wake {
                Wake::Command(Some(SessionCommand::ManualCapture)) => {
                    self.manual_capture();
                    continue;
                }
                Wake::Command(None) | Wake::Cancelled => return SessionOutcome::Cancelled,
                Wake::TimedOut => return self.time_out(),
                _ => {}
            }

            let frame = match self.read_frame() {
                Ok(frame) => {
                    self.frame_errors = 0;
                    frame
                }
                Err(e) => {
                    self.frame_errors += 1;
                    debug!("Frame unavailable ({} in a row): {}", self.frame_errors, e);
                    if self.frame_errors >= self.config.capture.max_frame_errors.max(1) {
                        return self.fail(SessionError::FrameSource(format!(
                            "{} consecutive read failures, last: {}",
                            self.frame_errors, e
                        )));
                    }
                    self.machine.frame_unavailable();
                    self.publish();
                    continue;
                }
            };

            let Some(detector) = self.detector.as_deref_mut() else {
                self.machine.degraded(Instant::now());
                self.publish();
                continue;
            };

            let wake = tokio::select! {
                biased;
                _ = self.cancel.changed() => Wake::Cancelled,
                cmd = self.commands.recv() => Wake::Command(cmd),
                _ = &mut timeout => Wake::TimedOut,
                result = detector.detect(&frame) => Wake::Detected(result),
            };

            match wake {
                Wake::Detected(Ok(detections)) => {
                    let evaluation = self.machine.observe(&frame, detections, Instant::now());
                    debug!(
                        "Evaluation: {:?}, {} aligned frame(s)",
                        evaluation.feedback, evaluation.aligned_frames
                    );
                }
                Wake::Detected(Err(e)) => {
                    warn!("Face detection failed: {:#}", e);
                    self.machine.detection_failed();
                }
                Wake::Command(Some(SessionCommand::ManualCapture)) => self.manual_capture(),
                Wake::Command(None) | Wake::Cancelled => return SessionOutcome::Cancelled,
                Wake::TimedOut => return self.time_out(),
                Wake::Tick => {}
            }
            self.publish();
        }
    }

    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let source = self
            .source
            .as_mut()
            .ok_or_else(|| CameraError::Stream("camera already released".to_string()))?;

        if !source.is_ready() {
            return Err(CameraError::Stream("video not ready".to_string()));
        }

        let frame = source.snapshot()?;
        if !frame.is_ready() {
            return Err(CameraError::Stream(format!(
                "incomplete frame ({}x{})",
                frame.width(),
                frame.height()
            )));
        }
        Ok(frame)
    }

    fn take_still(&mut self) -> Option<CapturedImage> {
        let result = self.read_frame().map_err(|e| e.to_string()).and_then(|frame| {
            // Save what the user saw in the preview.
            let frame = if self.config.camera.mirror() { frame.mirrored() } else { frame };
            capture_still(&frame, &self.config.capture).map_err(|e| e.to_string())
        });

        match result {
            Ok(image) => {
                self.machine.complete_capture();
                self.publish();
                Some(image)
            }
            Err(e) => {
                warn!("Capture failed: {}", e);
                self.machine.capture_failed();
                self.publish();
                None
            }
        }
    }

    fn manual_capture(&mut self) {
        if self.machine.begin_manual_capture(Instant::now()) {
            self.publish();
        }
    }

    fn time_out(&mut self) -> SessionOutcome {
        let last_feedback = self.machine.feedback();
        self.machine.timed_out();
        self.publish();
        SessionOutcome::TimedOut { last_feedback }
    }

    fn fail(&mut self, error: SessionError) -> SessionOutcome {
        self.machine.fail(error.clone());
        self.publish();
        SessionOutcome::Failed(error)
    }

    fn publish(&self) {
        let code = self.machine.feedback();
        self.feedback.send_if_modified(|current| {
            if *current == code {
                return false;
            }
            *current = code;
            true
        });
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.release();
        }
    }
}

impl<S: FrameSource, D: FaceDetector> Drop for CaptureSession<'_, S, D> {
    fn drop(&mut self) {
        self.release();
    }
}
