use anyhow::Context;
use log::{error, info, warn};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use glance_capture::camera::{self, OpenCvCamera};
use glance_capture::detector::DlibDetector;
use glance_capture::{
    CaptureConfig, CaptureFlow, CapturedImage, FeedbackCode, ModelLoader, ResultHandoff, Review, SessionError,
    SessionHandle,
};

#[derive(Debug, Clone)]
struct Args {
    config_file: Option<PathBuf>,
    output: PathBuf,
    device: Option<String>,
    timeout: Option<f64>,
    debug: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_file: None,
            output: PathBuf::from("capture.jpg"),
            device: None,
            timeout: None,
            debug: false,
        }
    }
}

fn parse_args(args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();

    for arg in args {
        if let Some(value) = arg.strip_prefix("config=") {
            parsed.config_file = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("output=") {
            parsed.output = PathBuf::from(value);
        } else if let Some(value) = arg.strip_prefix("device=") {
            parsed.device = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("timeout=") {
            parsed.timeout = Some(value.parse().with_context(|| format!("bad timeout {:?}", value))?);
        } else if arg == "debug" {
            parsed.debug = true;
        } else {
            anyhow::bail!("unknown argument {:?} (expected config=, output=, device=, timeout=, debug)", arg);
        }
    }

    Ok(parsed)
}

async fn ask(prompt: String) -> String {
    tokio::task::spawn_blocking(move || {
        eprint!("{}", prompt);
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        line.trim().to_lowercase()
    })
    .await
    .unwrap_or_default()
}

/// Prints feedback as it changes and asks on the terminal.
struct TerminalHandoff {
    degraded: bool,
    handle: Option<SessionHandle>,
    printer: Option<tokio::task::JoinHandle<()>>,
}

impl ResultHandoff for TerminalHandoff {
    fn attach(&mut self, handle: SessionHandle) {
        if let Some(printer) = self.printer.take() {
            printer.abort();
        }

        let mut feedback = handle.feedback();
        self.printer = Some(tokio::spawn(async move {
            while feedback.changed().await.is_ok() {
                let code = *feedback.borrow_and_update();
                eprintln!("{} {}", code.icon(), code);
            }
        }));

        if self.degraded {
            eprintln!("{} {}", FeedbackCode::ManualCaptureOnly.icon(), FeedbackCode::ManualCaptureOnly);
            // Held until the re-capture interval has passed after a retake.
            if !handle.request_manual_capture() {
                warn!("Manual capture request was not accepted");
            }
        }
        // Held until the next session; dropping it would cancel this one.
        self.handle.replace(handle);
    }

    async fn review(&mut self, image: &CapturedImage) -> Review {
        let answer = ask(format!("Captured {}x{} photo. Keep it? [Y/n] ", image.width, image.height)).await;
        if answer.starts_with('n') || answer.starts_with('r') {
            Review::Retake
        } else {
            Review::Confirm
        }
    }

    async fn on_failure(&mut self, error: &SessionError) -> bool {
        let code = match error {
            SessionError::Camera(e) => FeedbackCode::from(e),
            SessionError::FrameSource(_) => FeedbackCode::CameraFailure,
        };
        eprintln!("{} {}", code.icon(), code);
        ask("Try again? [y/N] ".to_string()).await.starts_with('y')
    }

    async fn on_timeout(&mut self, last_feedback: FeedbackCode) -> bool {
        eprintln!("{} {} (last: {})", FeedbackCode::TimedOut.icon(), FeedbackCode::TimedOut, last_feedback);
        ask("Try again? [y/N] ".to_string()).await.starts_with('y')
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config_file {
        Some(path) => CaptureConfig::load(path).with_context(|| format!("loading {:?}", path))?,
        None => CaptureConfig::load_default(),
    };
    if let Some(device) = &args.device {
        config.camera.device = device.clone();
    } else if !std::path::Path::new(&config.camera.device).exists() {
        if let Some(device) = camera::list_devices().into_iter().next() {
            info!("{} not present, using {}", config.camera.device, device);
            config.camera.device = device;
        }
    }
    if let Some(timeout) = args.timeout {
        config.capture.session_timeout_secs = Some(timeout);
    }
    config.validate()?;

    let loader = ModelLoader::from_config(&config.models);
    let mut detector = match loader.load(DlibDetector::open).await {
        Ok(detector) => Some(detector),
        Err(e) => {
            warn!("Continuing without face detection: {}", e);
            None
        }
    };

    let mut flow = CaptureFlow::new(config, detector.as_mut());
    let mut handoff = TerminalHandoff {
        degraded: flow.is_degraded(),
        handle: None,
        printer: None,
    };

    let Some(image) = flow.run(OpenCvCamera::open, &mut handoff).await else {
        anyhow::bail!("No photo captured");
    };
    if let Some(printer) = handoff.printer.take() {
        printer.abort();
    }

    std::fs::write(&args.output, &image.bytes).with_context(|| format!("writing {:?}", args.output))?;
    let meta_path = args.output.with_extension("json");
    std::fs::write(&meta_path, serde_json::to_string_pretty(&image.metadata())?)?;

    info!("Saved photo to {:?} ({} bytes)", args.output, image.bytes.len());
    println!("{}", args.output.display());
    Ok(())
}

fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("glance-capture: {:#}", e);
            std::process::exit(2);
        }
    };
    if args.debug {
        glance_capture::init_logging_at("debug");
    } else {
        glance_capture::init_logging();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
