//! Blur and lighting checks for the face area.
//!
//! Sharpness is the mean squared response of the 4-neighbour Laplacian
//! `[[0,1,0],[1,-4,1],[0,1,0]]` over a square window centered on the face,
//! divided by `sharpness_divisor` (1000 by default) so that thresholds stay in a
//! human-sized range: a flat patch scores 0, a soft webcam face lands around
//! 0.05-1, crisp edges go well above 10. Brightness is the mean luminance of the
//! same window on a 0-1 scale.

use crate::config::{QualityConfig, RegionSize};
use crate::detector::BoundingBox;
use crate::frame::Frame;

// Smallest window that still has one interior pixel.
const MIN_WINDOW: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityMetrics {
    pub sharpness: f64,
    pub brightness: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityVerdict {
    Pass,
    TooDark { brightness: f64 },
    TooBlurry { sharpness: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

#[derive(Debug, Clone)]
pub struct QualityEstimator {
    config: QualityConfig,
}

impl QualityEstimator {
    pub fn new(config: &QualityConfig) -> Self {
        Self { config: config.clone() }
    }

    /// Pure function of `(frame, face)`. Returns zeros when no usable window
    /// exists inside the frame.
    pub fn measure(&self, frame: &Frame, face: &BoundingBox) -> QualityMetrics {
        let empty = QualityMetrics {
            sharpness: 0.0,
            brightness: self.config.check_brightness.then_some(0.0),
        };

        if !frame.is_ready() {
            return empty;
        }
        let Some(window) = self.window(frame, face) else {
            return empty;
        };

        let stride = self.config.stride.max(1) as usize;

        let mut laplacian_sum = 0.0;
        let mut laplacian_count = 0u64;
        for y in (window.y0 + 1..window.y1 - 1).step_by(stride) {
            for x in (window.x0 + 1..window.x1 - 1).step_by(stride) {
                let lap = frame.luma(x, y - 1)
                    + frame.luma(x, y + 1)
                    + frame.luma(x - 1, y)
                    + frame.luma(x + 1, y)
                    - 4.0 * frame.luma(x, y);
                laplacian_sum += lap * lap;
                laplacian_count += 1;
            }
        }

        let sharpness = if laplacian_count > 0 {
            laplacian_sum / laplacian_count as f64 / self.config.sharpness_divisor
        } else {
            0.0
        };

        let brightness = self.config.check_brightness.then(|| {
            let mut sum = 0.0;
            let mut count = 0u64;
            for y in (window.y0..window.y1).step_by(stride) {
                for x in (window.x0..window.x1).step_by(stride) {
                    sum += frame.luma(x, y);
                    count += 1;
                }
            }
            if count > 0 { sum / count as f64 / 255.0 } else { 0.0 }
        });

        QualityMetrics { sharpness, brightness }
    }

    pub fn judge(&self, metrics: &QualityMetrics) -> QualityVerdict {
        if self.config.check_brightness {
            let brightness = metrics.brightness.unwrap_or(0.0);
            if brightness < self.config.min_brightness {
                return QualityVerdict::TooDark { brightness };
            }
        }

        if metrics.sharpness <= self.config.min_sharpness {
            return QualityVerdict::TooBlurry { sharpness: metrics.sharpness };
        }

        QualityVerdict::Pass
    }

    pub fn check(&self, frame: &Frame, face: &BoundingBox) -> (QualityMetrics, QualityVerdict) {
        let metrics = self.measure(frame, face);
        (metrics, self.judge(&metrics))
    }

    fn window(&self, frame: &Frame, face: &BoundingBox) -> Option<Window> {
        if face.is_degenerate() {
            return None;
        }

        let side = match self.config.region {
            RegionSize::Fixed { pixels } => pixels as f64,
            RegionSize::BoxFraction { fraction } => face.width.min(face.height) * fraction,
        };
        if !(side >= MIN_WINDOW as f64) {
            return None;
        }

        let center = face.center();
        let half = side / 2.0;
        let left = (center.x - half).floor().max(0.0);
        let top = (center.y - half).floor().max(0.0);
        let right = (center.x + half).floor().min(frame.width() as f64);
        let bottom = (center.y + half).floor().min(frame.height() as f64);

        if right - left < MIN_WINDOW as f64 || bottom - top < MIN_WINDOW as f64 {
            return None;
        }

        Some(Window {
            x0: left as u32,
            y0: top as u32,
            x1: right as u32,
            y1: bottom as u32,
        })
    }
}
