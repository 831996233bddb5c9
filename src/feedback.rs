//! User-facing status for the capture screen.
//!
//! The state machine only ever emits a [`FeedbackCode`]; turning it into text,
//! an icon and a tone is left to whoever draws the UI.

use std::fmt;

use crate::error::CameraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackCode {
    Initializing,
    NoFace,
    MultipleFaces,
    CenterFace,
    MoveCloser,
    HoldStill,
    TooBlurry,
    TooDark,
    Countdown(u32),
    Capturing,
    Captured,
    VideoNotReady,
    DetectionFailed,
    /// Detection models are unavailable; only manual capture works.
    ManualCaptureOnly,
    /// A capture was asked for too soon after the previous one.
    WaitingToRetake,
    CameraPermissionDenied,
    CameraNotFound,
    CameraBusy,
    CameraFailure,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Neutral,
    Success,
    Warning,
    Error,
}

impl Tone {
    /// CSS class used for the guidance label on the capture page.
    pub fn css_class(self) -> &'static str {
        match self {
            Tone::Neutral => "guidance-neutral",
            Tone::Success => "guidance-success",
            Tone::Warning => "guidance-warning",
            Tone::Error => "guidance-error",
        }
    }
}

impl FeedbackCode {
    pub fn tone(self) -> Tone {
        use FeedbackCode::*;
        match self {
            Initializing | NoFace | Countdown(_) | Capturing | WaitingToRetake => Tone::Neutral,
            HoldStill | Captured => Tone::Success,
            MultipleFaces | CenterFace | MoveCloser | TooBlurry | TooDark | VideoNotReady
            | DetectionFailed | ManualCaptureOnly | TimedOut => Tone::Warning,
            CameraPermissionDenied | CameraNotFound | CameraBusy | CameraFailure => Tone::Error,
        }
    }

    pub fn icon(self) -> &'static str {
        use FeedbackCode::*;
        match self {
            Initializing | WaitingToRetake => "⏳",
            NoFace => "😶",
            MultipleFaces | DetectionFailed | ManualCaptureOnly => "⚠️",
            CenterFace => "↔",
            MoveCloser => "🔍",
            HoldStill => "✅",
            TooBlurry | TooDark => "💡",
            Countdown(_) => "⏱",
            Capturing | Captured => "📸",
            VideoNotReady | TimedOut => "⌛",
            CameraPermissionDenied | CameraNotFound | CameraBusy | CameraFailure => "🚫",
        }
    }

    /// Whether the message needs an explicit retry action next to it.
    pub fn needs_retry(self) -> bool {
        matches!(self.tone(), Tone::Error) || self == FeedbackCode::TimedOut
    }
}

impl From<&CameraError> for FeedbackCode {
    fn from(err: &CameraError) -> Self {
        match err {
            CameraError::PermissionDenied { .. } => FeedbackCode::CameraPermissionDenied,
            CameraError::NotFound { .. } => FeedbackCode::CameraNotFound,
            CameraError::Busy { .. } => FeedbackCode::CameraBusy,
            CameraError::Stream(_) => FeedbackCode::CameraFailure,
        }
    }
}

impl fmt::Display for FeedbackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FeedbackCode::*;
        match self {
            Initializing => write!(f, "Setting up..."),
            NoFace => write!(f, "No face detected"),
            MultipleFaces => write!(f, "Only one face, please"),
            CenterFace => write!(f, "Center your face in the oval"),
            MoveCloser => write!(f, "Move closer"),
            HoldStill => write!(f, "Aligned! Hold still..."),
            TooBlurry => write!(f, "Too blurry, hold still"),
            TooDark => write!(f, "Improve the lighting"),
            Countdown(n) => write!(f, "{}...", n),
            Capturing => write!(f, "Capturing..."),
            Captured => write!(f, "Photo captured"),
            VideoNotReady => write!(f, "Video is not ready yet"),
            DetectionFailed => write!(f, "Face detection hiccup, retrying"),
            ManualCaptureOnly => write!(f, "Face detection unavailable, take the photo manually"),
            WaitingToRetake => write!(f, "Get ready, taking the next photo in a moment"),
            CameraPermissionDenied => write!(f, "Camera access denied. Allow camera access in your privacy settings."),
            CameraNotFound => write!(f, "No camera found. Check the connection."),
            CameraBusy => write!(f, "Camera is in use by another application. Close it and try again."),
            CameraFailure => write!(f, "Could not start the camera"),
            TimedOut => write!(f, "Took too long, try again"),
        }
    }
}
