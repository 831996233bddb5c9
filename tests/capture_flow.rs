use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use glance_capture::config::ModelSource;
use glance_capture::{
    BoundingBox, CameraError, CaptureConfig, CaptureFlow, CaptureSession, CapturedImage, Detection, FaceDetector,
    FeedbackCode, Frame, FrameSource, ModelLoadError, ModelLoader, Point, ResultHandoff, Review, SessionError,
    SessionHandle, SessionOutcome,
};
use tokio::time::Instant;

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;

fn checker_frame(lo: u8, hi: u8) -> Frame {
    Frame::from_fn(WIDTH, HEIGHT, |x, y| {
        let v = if (x / 2 + y / 2) % 2 == 0 { lo } else { hi };
        [v, v, v]
    })
}

fn lit_frame() -> Frame {
    checker_frame(60, 230)
}

fn dark_frame() -> Frame {
    checker_frame(0, 40)
}

/// One face filling the middle of the frame, nose on the guide center.
fn centered_face() -> Vec<Detection> {
    vec![Detection::new(
        BoundingBox::new(50.0, 25.0, 60.0, 70.0),
        Point::new(80.0, 60.0),
    )]
}

struct FakeCamera {
    frame: Option<Frame>,
    released: Rc<Cell<u32>>,
    reads: Cell<u32>,
    // 1-based read numbers on which the video reports not ready.
    unready: Vec<u32>,
}

impl FakeCamera {
    fn new(frame: Frame, released: &Rc<Cell<u32>>) -> Self {
        Self {
            frame: Some(frame),
            released: released.clone(),
            reads: Cell::new(0),
            unready: Vec::new(),
        }
    }

    fn broken(released: &Rc<Cell<u32>>) -> Self {
        Self {
            frame: None,
            ..Self::new(lit_frame(), released)
        }
    }

    fn stalling_on(frame: Frame, released: &Rc<Cell<u32>>, reads: &[u32]) -> Self {
        Self {
            unready: reads.to_vec(),
            ..Self::new(frame, released)
        }
    }
}

impl FrameSource for FakeCamera {
    fn is_ready(&self) -> bool {
        let read = self.reads.get() + 1;
        self.reads.set(read);
        !self.unready.contains(&read)
    }

    fn snapshot(&mut self) -> Result<Frame, CameraError> {
        self.frame
            .clone()
            .ok_or_else(|| CameraError::Stream("unplugged".to_string()))
    }

    fn release(&mut self) {
        self.released.set(self.released.get() + 1);
    }
}

/// Plays back scripted results, then repeats `steady` forever.
struct FakeDetector {
    script: VecDeque<Vec<Detection>>,
    steady: Vec<Detection>,
    fail: bool,
    calls: u32,
}

impl FakeDetector {
    fn steady(detections: Vec<Detection>) -> Self {
        Self {
            script: VecDeque::new(),
            steady: detections,
            fail: false,
            calls: 0,
        }
    }

    fn scripted(script: Vec<Vec<Detection>>, steady: Vec<Detection>) -> Self {
        Self {
            script: script.into(),
            ..Self::steady(steady)
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::steady(Vec::new())
        }
    }
}

impl FaceDetector for FakeDetector {
    async fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        self.calls += 1;
        if self.fail {
            anyhow::bail!("inference backend crashed");
        }
        Ok(self.script.pop_front().unwrap_or_else(|| self.steady.clone()))
    }
}

/// Inference that takes a while on a worker thread, like a CNN on a CPU.
struct SlowDetector;

impl FaceDetector for SlowDetector {
    async fn detect(&mut self, _frame: &Frame) -> anyhow::Result<Vec<Detection>> {
        let detections = tokio::task::spawn_blocking(|| {
            std::thread::sleep(Duration::from_millis(800));
            Vec::new()
        })
        .await?;
        Ok(detections)
    }
}

fn config() -> CaptureConfig {
    let mut config = CaptureConfig::default();
    config.camera.width = WIDTH;
    config.camera.height = HEIGHT;
    config
}

fn expect_captured(outcome: SessionOutcome) -> CapturedImage {
    match outcome {
        SessionOutcome::Captured(image) => image,
        other => panic!("expected a capture, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn steady_face_is_captured_after_countdown() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let started = Instant::now();
    let image = expect_captured(session.run().await);

    // Four aligned frames 100 ms apart, then three seconds of countdown.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(3300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3400), "{:?}", elapsed);

    assert_eq!((image.width, image.height), (90, 120));
    assert_eq!(&image.bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(handle.current_feedback(), FeedbackCode::Captured);
    assert_eq!(released.get(), 1);
    assert_eq!(detector.calls, 4);
}

#[tokio::test(start_paused = true)]
async fn losing_the_face_restarts_the_hold() {
    let released = Rc::new(Cell::new(0));
    let face = centered_face();
    let mut detector = FakeDetector::scripted(
        vec![face.clone(), face.clone(), face.clone(), Vec::new()],
        face,
    );
    let (session, _handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let started = Instant::now();
    expect_captured(session.run().await);

    // Three aligned, one empty, then four more aligned before counting down.
    assert!(started.elapsed() >= Duration::from_millis(3700));
    assert_eq!(detector.calls, 8);
}

#[tokio::test(start_paused = true)]
async fn dark_room_never_counts_down() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.session_timeout_secs = Some(2.0);

    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config,
        Ok(FakeCamera::new(dark_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let outcome = session.run().await;
    assert_eq!(
        outcome,
        SessionOutcome::TimedOut {
            last_feedback: FeedbackCode::TooDark
        }
    );
    assert_eq!(handle.current_feedback(), FeedbackCode::TimedOut);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_models_fall_back_to_manual_capture() {
    let empty = tempfile::tempdir().unwrap();
    let loader = ModelLoader::new(
        vec![ModelSource::Local {
            dir: empty.path().to_path_buf(),
        }],
        3,
        Duration::from_secs(2),
        Duration::from_secs(10),
    );
    let loaded = loader.load(|_| Ok(FakeDetector::steady(centered_face()))).await;
    assert!(matches!(loaded, Err(ModelLoadError::Exhausted { attempts: 1 })));

    let released = Rc::new(Cell::new(0));
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        None::<&mut FakeDetector>,
        None,
    );

    let user = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.current_feedback(), FeedbackCode::ManualCaptureOnly);
        assert!(handle.request_manual_capture());
    };
    let (outcome, ()) = tokio::join!(session.run(), user);

    expect_captured(outcome);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn busy_camera_fails_with_its_own_feedback() {
    let mut detector = FakeDetector::steady(centered_face());
    let busy = CameraError::Busy {
        device: "/dev/video0".to_string(),
    };
    let (session, handle) = CaptureSession::<FakeCamera, _>::start(&config(), Err(busy.clone()), Some(&mut detector), None);

    assert_eq!(session.run().await, SessionOutcome::Failed(SessionError::Camera(busy)));
    assert_eq!(handle.current_feedback(), FeedbackCode::CameraBusy);
    assert_eq!(detector.calls, 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_read_failures_end_the_session() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.max_frame_errors = 5;

    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) =
        CaptureSession::start(&config, Ok(FakeCamera::broken(&released)), Some(&mut detector), None);

    assert!(matches!(
        session.run().await,
        SessionOutcome::Failed(SessionError::FrameSource(_))
    ));
    assert_eq!(handle.current_feedback(), FeedbackCode::CameraFailure);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn detection_errors_are_transient() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.session_timeout_secs = Some(1.0);

    let mut detector = FakeDetector::failing();
    let (session, _handle) = CaptureSession::start(
        &config,
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    assert_eq!(
        session.run().await,
        SessionOutcome::TimedOut {
            last_feedback: FeedbackCode::DetectionFailed
        }
    );
    assert!(detector.calls >= 9);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_countdown_releases_camera() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let user = async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(handle.current_feedback(), FeedbackCode::Countdown(2));
        handle.cancel();
    };
    let (outcome, ()) = tokio::join!(session.run(), user);

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_cancels() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );
    drop(handle);

    assert_eq!(session.run().await, SessionOutcome::Cancelled);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_survives_a_full_command_queue() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    while handle.request_manual_capture() {}
    handle.cancel();

    assert_eq!(session.run().await, SessionOutcome::Cancelled);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_requests_do_not_stretch_the_countdown() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let user = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.current_feedback(), FeedbackCode::Countdown(3));
        for _ in 0..6 {
            handle.request_manual_capture();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };
    let started = Instant::now();
    let (outcome, ()) = tokio::join!(session.run(), user);

    expect_captured(outcome);
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(3400), "{:?}", elapsed);
}

#[tokio::test]
async fn cancel_is_seen_while_inference_runs() {
    let released = Rc::new(Cell::new(0));
    let mut detector = SlowDetector;
    let (session, handle) = CaptureSession::start(
        &config(),
        Ok(FakeCamera::new(lit_frame(), &released)),
        Some(&mut detector),
        None,
    );

    let user = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    };
    let started = Instant::now();
    let (outcome, ()) = tokio::join!(session.run(), user);

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn unready_video_at_capture_needs_a_fresh_hold() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    // Reads 1-4 pass the gate; read 5 is the still.
    let camera = FakeCamera::stalling_on(lit_frame(), &released, &[5]);
    let (session, _handle) = CaptureSession::start(&config(), Ok(camera), Some(&mut detector), None);

    let started = Instant::now();
    expect_captured(session.run().await);

    // 0.3 s hold + 3 s countdown, then a new 4 frame hold and countdown.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(6600), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(6700), "{:?}", elapsed);
    assert_eq!(detector.calls, 8);
    assert_eq!(released.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn unready_video_at_capture_is_reported() {
    let released = Rc::new(Cell::new(0));
    let mut detector = FakeDetector::steady(centered_face());
    let camera = FakeCamera::stalling_on(lit_frame(), &released, &[5, 6]);
    let (session, handle) = CaptureSession::start(&config(), Ok(camera), Some(&mut detector), None);

    let mut feedback = handle.feedback();
    let watcher = async {
        let mut seen = Vec::new();
        while feedback.changed().await.is_ok() {
            seen.push(*feedback.borrow_and_update());
        }
        seen
    };
    let (outcome, seen) = tokio::join!(session.run(), watcher);
    expect_captured(outcome);

    let stalled = seen
        .iter()
        .position(|c| *c == FeedbackCode::VideoNotReady)
        .unwrap_or_else(|| panic!("no VideoNotReady in {:?}", seen));
    assert!(seen[..stalled].contains(&FeedbackCode::Countdown(1)));
    assert_eq!(seen[stalled + 1], FeedbackCode::HoldStill);
    assert!(seen[stalled..].contains(&FeedbackCode::Countdown(3)));
}

#[derive(Default)]
struct ScriptedHandoff {
    reviews: VecDeque<Review>,
    retry_failures: bool,
    manual: bool,
    handles: Vec<SessionHandle>,
    reviewed_at: Vec<Instant>,
    failures: Vec<SessionError>,
}

impl ResultHandoff for ScriptedHandoff {
    fn attach(&mut self, handle: SessionHandle) {
        if self.manual {
            assert!(handle.request_manual_capture());
        }
        self.handles.push(handle);
    }

    async fn review(&mut self, _image: &CapturedImage) -> Review {
        self.reviewed_at.push(Instant::now());
        self.reviews.pop_front().unwrap_or(Review::Confirm)
    }

    async fn on_failure(&mut self, error: &SessionError) -> bool {
        self.failures.push(error.clone());
        self.retry_failures
    }
}

#[tokio::test(start_paused = true)]
async fn retake_waits_for_the_recapture_interval() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.countdown_secs = 0;

    let mut detector = FakeDetector::steady(centered_face());
    let mut handoff = ScriptedHandoff {
        reviews: VecDeque::from([Review::Retake, Review::Confirm]),
        ..ScriptedHandoff::default()
    };

    let mut flow = CaptureFlow::new(config, Some(&mut detector));
    let image = flow
        .run(|_| Ok(FakeCamera::new(lit_frame(), &released)), &mut handoff)
        .await;

    assert!(image.is_some());
    assert_eq!(handoff.handles.len(), 2);
    assert_eq!(handoff.reviewed_at.len(), 2);
    assert!(handoff.reviewed_at[1] - handoff.reviewed_at[0] >= Duration::from_secs(3));
    assert_eq!(released.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_session_can_be_retried() {
    let released = Rc::new(Cell::new(0));
    let acquired = Cell::new(0);
    let mut detector = FakeDetector::steady(centered_face());
    let mut handoff = ScriptedHandoff {
        retry_failures: true,
        ..ScriptedHandoff::default()
    };

    let mut flow = CaptureFlow::new(config(), Some(&mut detector));
    let image = flow
        .run(
            |camera| {
                acquired.set(acquired.get() + 1);
                if acquired.get() == 1 {
                    return Err(CameraError::PermissionDenied {
                        device: camera.device.clone(),
                    });
                }
                Ok(FakeCamera::new(lit_frame(), &released))
            },
            &mut handoff,
        )
        .await;

    assert!(image.is_some());
    assert_eq!(acquired.get(), 2);
    assert_eq!(handoff.failures.len(), 1);
    assert_eq!(handoff.handles[0].current_feedback(), FeedbackCode::CameraPermissionDenied);
}

#[tokio::test(start_paused = true)]
async fn timeout_ends_the_flow_by_default() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.session_timeout_secs = Some(1.0);

    let mut detector = FakeDetector::steady(Vec::new());
    let mut handoff = ScriptedHandoff::default();
    let mut flow = CaptureFlow::new(config, Some(&mut detector));

    let image = flow
        .run(|_| Ok(FakeCamera::new(lit_frame(), &released)), &mut handoff)
        .await;

    assert!(image.is_none());
    assert!(handoff.reviewed_at.is_empty());
    assert_eq!(handoff.handles[0].current_feedback(), FeedbackCode::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn degraded_retake_still_captures_manually() {
    let released = Rc::new(Cell::new(0));
    let mut config = config();
    config.capture.countdown_secs = 0;

    let mut handoff = ScriptedHandoff {
        reviews: VecDeque::from([Review::Retake, Review::Confirm]),
        manual: true,
        ..ScriptedHandoff::default()
    };

    let mut flow = CaptureFlow::<FakeDetector>::new(config, None);
    assert!(flow.is_degraded());

    let run = flow.run(|_| Ok(FakeCamera::new(lit_frame(), &released)), &mut handoff);
    let image = tokio::time::timeout(Duration::from_secs(60), run)
        .await
        .expect("the retake was never captured");

    assert!(image.is_some());
    assert_eq!(handoff.handles.len(), 2);
    assert_eq!(handoff.reviewed_at.len(), 2);
    assert!(handoff.reviewed_at[1] - handoff.reviewed_at[0] >= Duration::from_secs(3));
    assert_eq!(handoff.handles[1].current_feedback(), FeedbackCode::Captured);
    assert_eq!(released.get(), 2);
}
