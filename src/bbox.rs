use serde::{Deserialize, Serialize};

use crate::my_types::*;

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from top-left corner plus width and height.
    pub fn from_tlwh(tlwh: [f64; 4]) -> Self {
        let [x, y, w, h] = tlwh;
        Self::new(x, y, x + w, y + h)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Zero for degenerate boxes.
    pub fn area(&self) -> f64 {
        self.width().max(0.) * self.height().max(0.)
    }

    pub fn center(&self) -> Vector2d {
        Vector2d::new((self.x1 + self.x2) / 2., (self.y1 + self.y2) / 2.)
    }

    /// Finite coordinates with `x1 < x2` and `y1 < y2`.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn iou(&self, other: &BBox) -> f64 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        let intersection = (x2 - x1).max(0.) * (y2 - y1).max(0.);
        let union = self.area() + other.area() - intersection;
        if union <= 0. {
            return 0.;
        }
        intersection / union
    }

    /// Euclidean distance between the two box centers.
    pub fn center_distance(&self, other: &BBox) -> f64 {
        (self.center() - other.center()).norm()
    }
}

impl From<[f64; 4]> for BBox {
    fn from(v: [f64; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f64; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}
