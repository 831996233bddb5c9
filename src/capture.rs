use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use log::{debug, info};
use serde::Serialize;

use crate::config::CaptureSettings;
use crate::error::CaptureError;
use crate::frame::Frame;

pub const JPEG_MIME: &str = "image/jpeg";

/// The final still handed to whoever consumes the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
    pub captured_at: DateTime<Utc>,
}

/// Everything about a still except its pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureMetadata {
    pub width: u32,
    pub height: u32,
    pub mime_type: &'static str,
    pub size_bytes: usize,
    pub captured_at: DateTime<Utc>,
}

impl CapturedImage {
    pub fn metadata(&self) -> CaptureMetadata {
        CaptureMetadata {
            width: self.width,
            height: self.height,
            mime_type: self.mime_type,
            size_bytes: self.bytes.len(),
            captured_at: self.captured_at,
        }
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Largest centered window with the `(w, h)` aspect ratio that fits inside
/// `width x height`. Returns `(x, y, width, height)`.
pub fn centered_crop(width: u32, height: u32, aspect: (u32, u32)) -> (u32, u32, u32, u32) {
    let (aw, ah) = (aspect.0.max(1) as u64, aspect.1.max(1) as u64);
    let (w, h) = (width as u64, height as u64);

    let (crop_w, crop_h) = if w * ah > h * aw {
        // Too wide: keep full height.
        ((h * aw / ah).max(1), h)
    } else {
        (w, (w * ah / aw).max(1))
    };

    let x = (w - crop_w) / 2;
    let y = (h - crop_h) / 2;
    (x as u32, y as u32, crop_w as u32, crop_h as u32)
}

/// Crops and encodes `frame` as configured. `frame` must already be oriented
/// the way the user saw it in the preview.
pub fn capture_still(frame: &Frame, settings: &CaptureSettings) -> Result<CapturedImage, CaptureError> {
    if !frame.is_ready() {
        return Err(CaptureError::VideoNotReady {
            width: frame.width(),
            height: frame.height(),
        });
    }

    let rgb = RgbImage::from_raw(frame.width(), frame.height(), frame.to_rgb()).ok_or(
        CaptureError::VideoNotReady {
            width: frame.width(),
            height: frame.height(),
        },
    )?;

    let image = match settings.aspect_ratio {
        Some(aspect) => {
            let (x, y, w, h) = centered_crop(rgb.width(), rgb.height(), aspect);
            debug!("Cropping {}x{} to {}x{} at ({}, {})", rgb.width(), rgb.height(), w, h, x, y);
            image::imageops::crop_imm(&rgb, x, y, w, h).to_image()
        }
        None => rgb,
    };

    let mut bytes = Vec::new();
    let quality = settings.jpeg_quality.clamp(1, 100);
    JpegEncoder::new_with_quality(&mut bytes, quality).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;

    if bytes.is_empty() {
        return Err(CaptureError::EmptyImage);
    }

    info!(
        "Captured {}x{} photo ({} bytes, quality {})",
        image.width(),
        image.height(),
        bytes.len(),
        quality
    );

    Ok(CapturedImage {
        bytes,
        width: image.width(),
        height: image.height(),
        mime_type: JPEG_MIME,
        captured_at: Utc::now(),
    })
}
