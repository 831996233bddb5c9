//! The capture state machine.
//!
//! `Searching → Aligning → QualityGate → Countdown → Captured`, with `Error`
//! reachable from anywhere. All mutation of session state happens in the
//! transition methods below; the session driver only feeds it frames,
//! detections and timer ticks.

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::alignment::{AlignmentScorer, AlignmentState, AlignmentVerdict};
use crate::config::{CaptureConfig, GuidePolicy};
use crate::detector::{sanitize_detections, Detection};
use crate::error::SessionError;
use crate::feedback::FeedbackCode;
use crate::frame::Frame;
use crate::guide::{GuideRegion, PreviewMapping};
use crate::quality::{QualityEstimator, QualityMetrics, QualityVerdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Searching,
    Aligning,
    QualityGate,
    Countdown { remaining: u32 },
    Captured,
    Error(SessionError),
}

impl CaptureState {
    /// States in which frames are evaluated.
    pub fn is_evaluating(&self) -> bool {
        matches!(self, CaptureState::Searching | CaptureState::Aligning | CaptureState::QualityGate)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureState::Captured | CaptureState::Error(_))
    }
}

/// What one evaluation concluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub feedback: FeedbackCode,
    pub aligned_frames: u32,
    pub alignment: Option<AlignmentVerdict>,
    pub quality: Option<QualityMetrics>,
}

#[derive(Debug)]
pub struct CaptureStateMachine {
    state: CaptureState,
    feedback: FeedbackCode,
    alignment: AlignmentState,
    scorer: AlignmentScorer,
    estimator: QualityEstimator,
    guide_policy: GuidePolicy,
    guide: Option<GuideRegion>,
    preview: Option<(u32, u32)>,
    mirror: bool,
    hysteresis_frames: u32,
    countdown_secs: u32,
    not_before: Option<Instant>,
    manual_pending: bool,
}

impl CaptureStateMachine {
    pub fn new(config: &CaptureConfig) -> Self {
        let preview = match (config.camera.preview_width, config.camera.preview_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        };

        Self {
            state: CaptureState::Searching,
            feedback: FeedbackCode::Initializing,
            alignment: AlignmentState::default(),
            scorer: AlignmentScorer::new(&config.alignment),
            estimator: QualityEstimator::new(&config.quality),
            guide_policy: config.alignment.guide,
            guide: None,
            preview,
            mirror: config.camera.mirror(),
            hysteresis_frames: config.alignment.hysteresis_frames.max(1),
            countdown_secs: config.capture.countdown_secs,
            not_before: None,
            manual_pending: false,
        }
    }

    /// Refuse to start a countdown before `instant` (minimum re-capture interval).
    pub fn with_not_before(mut self, instant: Option<Instant>) -> Self {
        self.not_before = instant;
        self
    }

    pub fn state(&self) -> &CaptureState {
        &self.state
    }

    pub fn feedback(&self) -> FeedbackCode {
        self.feedback
    }

    pub fn alignment(&self) -> AlignmentState {
        self.alignment
    }

    pub fn guide(&self) -> Option<&GuideRegion> {
        self.guide.as_ref()
    }

    /// Frame → preview mapping for `frame`, also used for debug overlays.
    pub fn mapping(&self, frame: &Frame) -> PreviewMapping {
        let dims = (frame.width(), frame.height());
        PreviewMapping::new(dims, self.preview.unwrap_or(dims), self.mirror)
    }

    /// Evaluates one frame and its detections.
    pub fn observe(&mut self, frame: &Frame, detections: Vec<Detection>, now: Instant) -> Evaluation {
        if !self.state.is_evaluating() {
            debug!("Ignoring frame in state {:?}", self.state);
            return self.evaluation(None, None);
        }
        if self.resume_manual_capture(now) {
            return self.evaluation(None, None);
        }

        let detections = sanitize_detections(detections, frame.width(), frame.height());
        let face = match detections.as_slice() {
            [face] => *face,
            [] => return self.lose_face(AlignmentVerdict::NoFace),
            many => return self.lose_face(AlignmentVerdict::MultipleFaces(many.len())),
        };

        let mapping = self.mapping(frame);
        let guide = match self.resolve_guide(&mapping, &face) {
            Some(guide) => guide,
            None => {
                self.alignment.reset();
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::CenterFace;
                return self.evaluation(None, None);
            }
        };

        let verdict = self.scorer.score(&[face], &mapping, &guide, &mut self.alignment);
        match verdict {
            AlignmentVerdict::OffCenter { .. } => {
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::CenterFace;
                return self.evaluation(Some(verdict), None);
            }
            AlignmentVerdict::TooSmall { .. } => {
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::MoveCloser;
                return self.evaluation(Some(verdict), None);
            }
            AlignmentVerdict::NoFace | AlignmentVerdict::MultipleFaces(_) => {
                return self.lose_face(verdict);
            }
            AlignmentVerdict::Aligned { .. } => {}
        }

        if self.alignment.aligned_frame_count < self.hysteresis_frames {
            self.set_state(CaptureState::Aligning);
            self.feedback = FeedbackCode::HoldStill;
            return self.evaluation(Some(verdict), None);
        }

        self.set_state(CaptureState::QualityGate);
        let (metrics, quality) = self.estimator.check(frame, &face.bounding_box);
        debug!(
            "Quality gate: sharpness {:.3}, brightness {:?}",
            metrics.sharpness, metrics.brightness
        );

        match quality {
            QualityVerdict::TooDark { .. } => {
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::TooDark;
            }
            QualityVerdict::TooBlurry { .. } => {
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::TooBlurry;
            }
            QualityVerdict::Pass if self.not_before.is_some_and(|t| now < t) => {
                self.set_state(CaptureState::Aligning);
                self.feedback = FeedbackCode::HoldStill;
            }
            QualityVerdict::Pass => self.start_countdown(),
        }

        self.evaluation(Some(verdict), Some(metrics))
    }

    /// The detector failed on this cycle; counts as no detection.
    pub fn detection_failed(&mut self) -> Evaluation {
        if !self.state.is_evaluating() {
            return self.evaluation(None, None);
        }
        self.alignment.reset();
        self.set_state(CaptureState::Searching);
        self.feedback = FeedbackCode::DetectionFailed;
        self.evaluation(None, None)
    }

    /// No frame could be read on this cycle.
    pub fn frame_unavailable(&mut self) -> Evaluation {
        if !self.state.is_evaluating() {
            return self.evaluation(None, None);
        }
        self.alignment.reset();
        self.set_state(CaptureState::Searching);
        self.feedback = FeedbackCode::VideoNotReady;
        self.evaluation(None, None)
    }

    /// Degraded mode cycle: no detector, so nothing is gated automatically.
    pub fn degraded(&mut self, now: Instant) -> Evaluation {
        if !self.state.is_evaluating() {
            return self.evaluation(None, None);
        }
        if self.resume_manual_capture(now) {
            return self.evaluation(None, None);
        }
        self.alignment.reset();
        self.set_state(CaptureState::Searching);
        self.feedback = FeedbackCode::ManualCaptureOnly;
        self.evaluation(None, None)
    }

    /// Starts the countdown without alignment or quality gating. Too soon
    /// after the previous capture the request is held and the countdown starts
    /// on the first cycle past the re-capture interval.
    pub fn begin_manual_capture(&mut self, now: Instant) -> bool {
        if !self.state.is_evaluating() {
            return false;
        }
        info!("Manual capture requested");
        self.manual_pending = true;
        self.resume_manual_capture(now);
        true
    }

    pub fn manual_capture_pending(&self) -> bool {
        self.manual_pending
    }

    fn resume_manual_capture(&mut self, now: Instant) -> bool {
        if !self.manual_pending {
            return false;
        }
        if self.not_before.is_some_and(|t| now < t) {
            debug!("Holding manual capture until the re-capture interval elapses");
            self.feedback = FeedbackCode::WaitingToRetake;
            return true;
        }
        self.manual_pending = false;
        self.start_countdown();
        true
    }

    /// One second of countdown elapsed. Returns the seconds left, or `None`
    /// outside the countdown.
    pub fn tick_countdown(&mut self) -> Option<u32> {
        let CaptureState::Countdown { remaining } = self.state else {
            return None;
        };

        let remaining = remaining.saturating_sub(1);
        self.state = CaptureState::Countdown { remaining };
        self.feedback = if remaining == 0 {
            FeedbackCode::Capturing
        } else {
            FeedbackCode::Countdown(remaining)
        };
        Some(remaining)
    }

    /// The countdown ran out and the still was produced.
    pub fn complete_capture(&mut self) -> bool {
        if self.state != (CaptureState::Countdown { remaining: 0 }) {
            warn!("Capture completed in unexpected state {:?}", self.state);
            return false;
        }
        self.set_state(CaptureState::Captured);
        self.feedback = FeedbackCode::Captured;
        true
    }

    /// The still couldn't be produced; go back to aligning and require a
    /// fresh run of stable frames before the next attempt.
    pub fn capture_failed(&mut self) {
        if !matches!(self.state, CaptureState::Countdown { .. }) {
            return;
        }
        self.alignment.reset();
        self.set_state(CaptureState::Aligning);
        self.feedback = FeedbackCode::VideoNotReady;
    }

    pub fn fail(&mut self, error: SessionError) {
        self.feedback = match &error {
            SessionError::Camera(e) => FeedbackCode::from(e),
            SessionError::FrameSource(_) => FeedbackCode::CameraFailure,
        };
        self.alignment.reset();
        self.set_state(CaptureState::Error(error));
    }

    pub fn timed_out(&mut self) {
        self.feedback = FeedbackCode::TimedOut;
    }

    fn start_countdown(&mut self) {
        self.set_state(CaptureState::Countdown { remaining: self.countdown_secs });
        self.feedback = if self.countdown_secs == 0 {
            FeedbackCode::Capturing
        } else {
            FeedbackCode::Countdown(self.countdown_secs)
        };
    }

    fn lose_face(&mut self, verdict: AlignmentVerdict) -> Evaluation {
        self.alignment.reset();
        self.set_state(CaptureState::Searching);
        self.feedback = match verdict {
            AlignmentVerdict::MultipleFaces(_) => FeedbackCode::MultipleFaces,
            _ => FeedbackCode::NoFace,
        };
        self.evaluation(Some(verdict), None)
    }

    fn resolve_guide(&mut self, mapping: &PreviewMapping, face: &Detection) -> Option<GuideRegion> {
        if let Some(guide) = self.guide {
            return Some(guide);
        }

        match GuideRegion::for_policy(self.guide_policy, mapping, Some(&face.bounding_box))? {
            Ok(guide) => {
                debug!(
                    "Guide locked at ({:.0}, {:.0}) {:.0}x{:.0}",
                    guide.center().x, guide.center().y, guide.width(), guide.height()
                );
                self.guide = Some(guide);
                Some(guide)
            }
            Err(e) => {
                warn!("Cannot place guide: {}", e);
                None
            }
        }
    }

    fn set_state(&mut self, next: CaptureState) {
        if self.state != next {
            info!("Capture state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn evaluation(&self, alignment: Option<AlignmentVerdict>, quality: Option<QualityMetrics>) -> Evaluation {
        Evaluation {
            feedback: self.feedback,
            aligned_frames: self.alignment.aligned_frame_count,
            alignment,
            quality,
        }
    }
}
