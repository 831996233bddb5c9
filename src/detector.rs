use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }

    /// Intersection with `[0, width) x [0, height)`.
    pub fn clip(&self, width: u32, height: u32) -> Self {
        let left = self.x.max(0.0);
        let top = self.y.max(0.0);
        let right = (self.x + self.width).min(width as f64);
        let bottom = (self.y + self.height).min(height as f64);
        Self::new(left, top, right - left, bottom - top)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub nose: Point,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub landmarks: Landmarks,
}

impl Detection {
    pub fn new(bounding_box: BoundingBox, nose: Point) -> Self {
        Self {
            bounding_box,
            landmarks: Landmarks { nose },
        }
    }
}

/// Wraps a pretrained face localization model.
///
/// `detect` may fail transiently; the capture loop treats an error as "no
/// detection this cycle" and keeps going.
#[allow(async_fn_in_trait)]
pub trait FaceDetector {
    async fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>>;
}

/// Drops detections that can't be scored: degenerate boxes (before or after
/// clipping to the frame) and nose points outside the frame.
pub fn sanitize_detections(detections: Vec<Detection>, width: u32, height: u32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| !d.bounding_box.is_degenerate())
        .filter_map(|d| {
            let clipped = d.bounding_box.clip(width, height);
            let nose = d.landmarks.nose;
            let nose_inside = nose.x >= 0.0
                && nose.y >= 0.0
                && nose.x < width as f64
                && nose.y < height as f64;

            if clipped.is_degenerate() || !nose_inside {
                None
            } else {
                Some(Detection::new(clipped, nose))
            }
        })
        .collect()
}

#[cfg(feature = "dlib")]
pub use self::dlib::DlibDetector;

#[cfg(feature = "dlib")]
mod dlib {
    use dlib_face_recognition::{
        FaceDetectorCnn, FaceDetectorTrait,
        LandmarkPredictor, LandmarkPredictorTrait,
        ImageMatrix,
    };
    use log::{debug, info};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::{BoundingBox, Detection, FaceDetector, Point};
    use crate::frame::Frame;
    use crate::models::{FACE_DETECTOR, LANDMARK_PREDICTOR};

    // Index of the nose tip in the 68 point iBUG layout.
    const NOSE_TIP: usize = 30;

    struct Models {
        detector: FaceDetectorCnn,
        predictor: LandmarkPredictor,
    }

    impl Models {
        fn detect(&self, rgb: &[u8], width: u32, height: u32) -> Vec<Detection> {
            let image = unsafe { ImageMatrix::new(width as usize, height as usize, rgb.as_ptr()) };

            let rects = self.detector.face_locations(&image);
            debug!("dlib found {} face(s)", rects.len());

            let mut detections = Vec::with_capacity(rects.len());
            for rect in rects.iter() {
                let landmarks = self.predictor.face_landmarks(&image, rect);
                let Some(nose) = landmarks.get(NOSE_TIP) else {
                    continue;
                };

                detections.push(Detection::new(
                    BoundingBox::new(
                        rect.left as f64,
                        rect.top as f64,
                        (rect.right - rect.left) as f64,
                        (rect.bottom - rect.top) as f64,
                    ),
                    Point::new(nose.x() as f64, nose.y() as f64),
                ));
            }
            detections
        }
    }

    /// CNN inference takes hundreds of milliseconds on a CPU, so it runs on
    /// the blocking pool and the capture loop keeps serving commands meanwhile.
    #[derive(Clone)]
    pub struct DlibDetector {
        models: Arc<Mutex<Models>>,
    }

    impl std::fmt::Debug for DlibDetector {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DlibDetector").finish_non_exhaustive()
        }
    }

    impl DlibDetector {
        pub fn open(models_dir: &Path) -> anyhow::Result<Self> {
            let detector_path = models_dir.join(FACE_DETECTOR.name);
            let predictor_path = models_dir.join(LANDMARK_PREDICTOR.name);

            let detector = FaceDetectorCnn::open(&detector_path).map_err(|e| anyhow::anyhow!(e))?;
            info!("Loaded face detector from {:?}", detector_path);

            let predictor = LandmarkPredictor::open(&predictor_path).map_err(|e| anyhow::anyhow!(e))?;
            info!("Loaded landmark predictor from {:?}", predictor_path);

            Ok(Self {
                models: Arc::new(Mutex::new(Models { detector, predictor })),
            })
        }
    }

    impl FaceDetector for DlibDetector {
        async fn detect(&mut self, frame: &Frame) -> anyhow::Result<Vec<Detection>> {
            if !frame.is_ready() {
                anyhow::bail!("Frame not ready ({}x{})", frame.width(), frame.height());
            }

            let rgb = frame.to_rgb();
            let (width, height) = (frame.width(), frame.height());
            let models = Arc::clone(&self.models);

            tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Detection>> {
                let models = models
                    .lock()
                    .map_err(|_| anyhow::anyhow!("face detector poisoned by an earlier panic"))?;
                Ok(models.detect(&rgb, width, height))
            })
            .await?
        }
    }
}
