use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates.
///
/// Which image the coordinates refer to depends on where the box came from:
/// backends report boxes in the space of the image they were handed, and
/// `CoordinateTransform::to_original` maps them back to the source frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Clamp into a `width` x `height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> BBox {
        let w = width as f32;
        let h = height as f32;
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One detected object. Produced per frame and consumed immediately.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Inference parameters handed to a backend with every frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InferenceParams {
    /// Minimum class score kept by the backend.
    pub confidence_threshold: f32,
    /// IoU above which overlapping same-class boxes are suppressed.
    pub overlap_threshold: f32,
    /// Square input resolution the backend expects, if it cares.
    pub input_resolution: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.1,
            overlap_threshold: 0.45,
            input_resolution: 320,
        }
    }
}

/// Greedy class-aware non-maximum suppression.
///
/// Candidates are visited in descending confidence order; a candidate is
/// dropped when it overlaps an already kept box of the same class by more than
/// `iou_thresh`.
pub fn nms(mut candidates: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    candidates.sort_unstable_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        let current = candidates[i];
        kept.push(current);
        for j in (i + 1)..candidates.len() {
            if candidates[j].class_id == current.class_id
                && current.bbox.iou(&candidates[j].bbox) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}
