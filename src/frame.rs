use std::sync::Arc;

use crate::image::Image;
use crate::my_types::*;

/// A captured image tagged with its capture time.
///
/// Cloning is cheap: the pixels are shared and never written after capture,
/// so a consumer holding a `Frame` can't observe the producer's next write.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: Arc<Image>,
    pub captured_at: Timestamp,
    /// Position in the camera's publish order, starting at 0.
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: Image, captured_at: Timestamp, sequence: u64) -> Frame {
        Frame {
            image: Arc::new(image),
            captured_at,
            sequence,
        }
    }

    pub fn width(&self) -> usize {
        self.image.width
    }

    pub fn height(&self) -> usize {
        self.image.height
    }
}
