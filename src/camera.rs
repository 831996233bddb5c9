use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::path::Path;

use crate::error::CameraError;
use crate::frame::Frame;

/// A live feed that can be snapshotted into pixel data.
///
/// The active capture session owns its source exclusively and calls
/// [`FrameSource::release`] when it ends.
pub trait FrameSource {
    fn is_ready(&self) -> bool;
    fn snapshot(&mut self) -> Result<Frame, CameraError>;
    fn release(&mut self);
}

/// Opens the device node once to find out why a camera can't be used before
/// handing it to the capture backend.
pub fn probe_device(device: &str) -> Result<(), CameraError> {
    let path = Path::new(device);

    if !path.exists() {
        warn!("Camera device {} does not exist", device);
        return Err(CameraError::NotFound { device: device.to_string() });
    }

    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(_) => {
            debug!("Camera device {} is accessible", device);
            Ok(())
        }
        Err(e) => {
            let err = CameraError::from_io(device, &e);
            warn!("Camera device {} unusable: {}", device, err);
            Err(err)
        }
    }
}

/// Index of `/dev/videoN`, if the path has that shape.
pub fn device_index(device: &str) -> Option<i32> {
    Path::new(device)
        .file_name()?
        .to_str()?
        .strip_prefix("video")?
        .parse()
        .ok()
}

/// Lists `/dev/videoN` capture nodes, skipping metadata nodes.
pub fn list_devices() -> Vec<String> {
    let mut devices = Vec::new();

    let Ok(entries) = std::fs::read_dir("/sys/class/video4linux") else {
        return devices;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("video") {
            continue;
        }

        // Index 0 is the capture node; higher indices are metadata.
        let index = std::fs::read_to_string(entry.path().join("index"))
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .unwrap_or(0);
        if index != 0 {
            debug!("Skipping {} (index {}), likely a metadata node", name, index);
            continue;
        }

        devices.push(format!("/dev/{}", name));
    }

    devices.sort_by_key(|d| device_index(d).unwrap_or(i32::MAX));
    info!("Found {} capture device(s)", devices.len());
    devices
}

#[cfg(feature = "opencv")]
pub use self::opencv_camera::OpenCvCamera;

#[cfg(feature = "opencv")]
mod opencv_camera {
    use log::{info, warn};
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture},
    };

    use super::{device_index, probe_device, FrameSource};
    use crate::config::CameraConfig;
    use crate::error::CameraError;
    use crate::frame::Frame;

    pub struct OpenCvCamera {
        capture: Option<VideoCapture>,
        device: String,
    }

    impl OpenCvCamera {
        pub fn open(config: &CameraConfig) -> Result<Self, CameraError> {
            probe_device(&config.device)?;

            let index = device_index(&config.device)
                .ok_or_else(|| CameraError::NotFound { device: config.device.clone() })?;
            let stream_err = |e: opencv::Error| CameraError::Stream(format!("{}: {}", config.device, e));

            let mut capture = VideoCapture::new(index, videoio::CAP_V4L2).map_err(stream_err)?;
            if !capture.is_opened().unwrap_or(false) {
                // V4L2 refuses a second opener of the same node.
                return Err(CameraError::Busy { device: config.device.clone() });
            }

            capture.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64).map_err(stream_err)?;
            capture.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64).map_err(stream_err)?;

            // Some drivers open fine and then never deliver a frame.
            let mut test_frame = Mat::default();
            if !capture.read(&mut test_frame).unwrap_or(false) || test_frame.empty() {
                let _ = capture.release();
                return Err(CameraError::Stream(format!("{} opened but delivered no frames", config.device)));
            }

            info!("Opened camera {} ({}x{} requested)", config.device, config.width, config.height);
            Ok(Self {
                capture: Some(capture),
                device: config.device.clone(),
            })
        }

        fn read_rgb(capture: &mut VideoCapture) -> opencv::Result<Option<Frame>> {
            let mut mat = Mat::default();
            capture.read(&mut mat)?;
            if mat.empty() {
                return Ok(None);
            }

            let mut rgb = Mat::default();
            let code = if mat.channels() == 1 { imgproc::COLOR_GRAY2RGB } else { imgproc::COLOR_BGR2RGB };
            imgproc::cvt_color(&mat, &mut rgb, code, 0)?;

            let width = rgb.cols() as u32;
            let height = rgb.rows() as u32;
            let data = rgb.data_bytes()?.to_vec();
            Ok(Some(Frame::from_rgb(data, width, height)))
        }
    }

    impl FrameSource for OpenCvCamera {
        fn is_ready(&self) -> bool {
            self.capture
                .as_ref()
                .map(|c| c.is_opened().unwrap_or(false))
                .unwrap_or(false)
        }

        fn snapshot(&mut self) -> Result<Frame, CameraError> {
            let capture = self
                .capture
                .as_mut()
                .ok_or_else(|| CameraError::Stream(format!("{} already released", self.device)))?;

            match Self::read_rgb(capture) {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(CameraError::Stream("empty frame captured".to_string())),
                Err(e) => Err(CameraError::Stream(e.to_string())),
            }
        }

        fn release(&mut self) {
            if let Some(mut capture) = self.capture.take() {
                if let Err(e) = capture.release() {
                    warn!("Failed to release {}: {}", self.device, e);
                }
                info!("Released camera {}", self.device);
            }
        }
    }

    impl Drop for OpenCvCamera {
        fn drop(&mut self) {
            self.release();
        }
    }
}
