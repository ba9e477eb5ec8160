use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bbox::BBox;
use crate::frame::Frame;

/// COCO class ids for bottle, wine glass and cup.
pub const BEVERAGE_CLASSES: [u32; 3] = [39, 40, 41];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_id: u32,
    pub confidence: f64,
    pub bbox: BBox,
}

/// External object detector. The core never runs a network itself.
pub trait ObjectDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Shape checks and class/confidence gating applied to raw detector output.
#[derive(Clone, Debug)]
pub struct DetectionFilter {
    /// Empty keeps every class
    pub allowed_classes: Vec<u32>,
    pub min_confidence: f64,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            allowed_classes: BEVERAGE_CLASSES.to_vec(),
            min_confidence: 0.25,
        }
    }
}

impl DetectionFilter {
    /// Drops malformed records one by one; confidence is clamped into [0, 1].
    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let total = detections.len();
        let kept: Vec<Detection> = detections
            .into_iter()
            .filter_map(|mut d| {
                if !d.bbox.is_valid() || !d.confidence.is_finite() {
                    debug!(?d, "dropping malformed detection");
                    return None;
                }
                d.confidence = d.confidence.clamp(0., 1.);
                if !self.allowed_classes.is_empty() && !self.allowed_classes.contains(&d.class_id) {
                    return None;
                }
                (d.confidence >= self.min_confidence).then_some(d)
            })
            .collect();
        if kept.len() != total {
            debug!(total, kept = kept.len(), "filtered detections");
        }
        kept
    }
}
