//! Guide region geometry and the frame → preview coordinate mapping.
//!
//! Detections come back in raw frame pixels while the guide is drawn on the
//! preview the user sees, which may be scaled and, for front cameras,
//! horizontally mirrored. Everything that compares a detection against the
//! guide goes through [`PreviewMapping::map_point`].

use crate::config::GuidePolicy;
use crate::detector::{BoundingBox, Point};
use crate::error::GuideError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviewMapping {
    pub frame_width: f64,
    pub frame_height: f64,
    pub preview_width: f64,
    pub preview_height: f64,
    pub mirrored: bool,
}

impl PreviewMapping {
    pub fn new(frame: (u32, u32), preview: (u32, u32), mirrored: bool) -> Self {
        Self {
            frame_width: frame.0 as f64,
            frame_height: frame.1 as f64,
            preview_width: preview.0 as f64,
            preview_height: preview.1 as f64,
            mirrored,
        }
    }

    pub fn scale_x(&self) -> f64 {
        if self.frame_width > 0.0 { self.preview_width / self.frame_width } else { 0.0 }
    }

    pub fn scale_y(&self) -> f64 {
        if self.frame_height > 0.0 { self.preview_height / self.frame_height } else { 0.0 }
    }

    /// Frame space to preview space. When mirrored the x axis is inverted:
    /// `x' = preview_width - x * scale_x`.
    pub fn map_point(&self, p: Point) -> Point {
        let x = p.x * self.scale_x();
        let x = if self.mirrored { self.preview_width - x } else { x };
        Point::new(x, p.y * self.scale_y())
    }

    pub fn map_box(&self, b: &BoundingBox) -> BoundingBox {
        let width = b.width * self.scale_x();
        let height = b.height * self.scale_y();
        let top_left = self.map_point(Point::new(b.x, b.y));
        let x = if self.mirrored { top_left.x - width } else { top_left.x };
        BoundingBox::new(x, top_left.y, width, height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuideRegion {
    center: Point,
    width: f64,
    height: f64,
}

impl GuideRegion {
    pub fn new(center: Point, width: f64, height: f64) -> Result<Self, GuideError> {
        if !(width > 0.0 && height > 0.0) {
            return Err(GuideError { width, height });
        }
        Ok(Self { center, width, height })
    }

    /// Guide centered on the preview, sized relative to it.
    pub fn fixed(mapping: &PreviewMapping, width_ratio: f64, height_ratio: f64) -> Result<Self, GuideError> {
        Self::new(
            Point::new(mapping.preview_width / 2.0, mapping.preview_height / 2.0),
            mapping.preview_width * width_ratio,
            mapping.preview_height * height_ratio,
        )
    }

    /// Guide centered on the preview, sized from a detected face box.
    pub fn from_face_box(mapping: &PreviewMapping, face: &BoundingBox, scale: f64) -> Result<Self, GuideError> {
        let mapped = mapping.map_box(face);
        Self::new(
            Point::new(mapping.preview_width / 2.0, mapping.preview_height / 2.0),
            mapped.width * scale,
            mapped.height * scale,
        )
    }

    /// Resolves `policy` for this session. `FaceBox` needs a face to size from.
    pub fn for_policy(
        policy: GuidePolicy,
        mapping: &PreviewMapping,
        face: Option<&BoundingBox>,
    ) -> Option<Result<Self, GuideError>> {
        match policy {
            GuidePolicy::Fixed { width_ratio, height_ratio } => {
                Some(Self::fixed(mapping, width_ratio, height_ratio))
            }
            GuidePolicy::FaceBox { scale } => face.map(|f| Self::from_face_box(mapping, f, scale)),
        }
    }

    pub fn center(&self) -> Point {
        self.center
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn min_side(&self) -> f64 {
        self.width.min(self.height)
    }
}
