use crate::config::AlignmentConfig;
use crate::detector::Detection;
use crate::guide::{GuideRegion, PreviewMapping};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignmentState {
    pub aligned_frame_count: u32,
    pub is_aligned: bool,
}

impl AlignmentState {
    pub fn record(&mut self, aligned: bool) {
        self.is_aligned = aligned;
        if aligned {
            self.aligned_frame_count = self.aligned_frame_count.saturating_add(1);
        } else {
            self.aligned_frame_count = 0;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignmentVerdict {
    NoFace,
    MultipleFaces(usize),
    /// Nose is too far from the guide center.
    OffCenter { distance: f64, max_distance: f64 },
    /// Face box is narrower than the minimum.
    TooSmall { face_width: f64, min_width: f64 },
    Aligned { distance: f64 },
}

impl AlignmentVerdict {
    pub fn is_aligned(&self) -> bool {
        matches!(self, AlignmentVerdict::Aligned { .. })
    }
}

#[derive(Debug, Clone)]
pub struct AlignmentScorer {
    center_tolerance: f64,
    min_face_width_ratio: f64,
}

impl AlignmentScorer {
    pub fn new(config: &AlignmentConfig) -> Self {
        Self {
            center_tolerance: config.center_tolerance,
            min_face_width_ratio: config.min_face_width_ratio,
        }
    }

    /// Scores one frame's detections against the guide and updates `state`.
    pub fn score(
        &self,
        detections: &[Detection],
        mapping: &PreviewMapping,
        guide: &GuideRegion,
        state: &mut AlignmentState,
    ) -> AlignmentVerdict {
        let verdict = match detections {
            [] => AlignmentVerdict::NoFace,
            [face] => self.evaluate(face, mapping, guide),
            many => AlignmentVerdict::MultipleFaces(many.len()),
        };

        state.record(verdict.is_aligned());
        verdict
    }

    fn evaluate(&self, face: &Detection, mapping: &PreviewMapping, guide: &GuideRegion) -> AlignmentVerdict {
        let nose = mapping.map_point(face.landmarks.nose);
        let distance = nose.distance(&guide.center());
        let max_distance = guide.min_side() * self.center_tolerance;

        if distance >= max_distance {
            return AlignmentVerdict::OffCenter { distance, max_distance };
        }

        let face_width = face.bounding_box.width;
        let min_width = mapping.frame_width * self.min_face_width_ratio;
        if face_width <= min_width {
            return AlignmentVerdict::TooSmall { face_width, min_width };
        }

        AlignmentVerdict::Aligned { distance }
    }
}
