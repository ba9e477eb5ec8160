use anyhow::Result;

use crate::bbox::BBox;
use crate::frame::Frame;

/// External segmentation step estimating how full the container inside `roi` is.
pub trait FillEstimator {
    /// `Ok(None)` when no estimate could be made for this region.
    fn estimate(&mut self, frame: &Frame, roi: &BBox) -> Result<Option<f64>>;
}

/// Estimator for pipelines without a segmenter; every track stays without a fill reading.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFill;

impl FillEstimator for NoFill {
    fn estimate(&mut self, _frame: &Frame, _roi: &BBox) -> Result<Option<f64>> {
        Ok(None)
    }
}

/// Largest mask area over the ROI area. An empty ROI reads as 0.
pub fn mask_area_ratio(mask_areas: &[f64], roi: &BBox) -> f64 {
    let roi_area = roi.area();
    if roi_area <= 0. {
        return 0.;
    }
    let best = mask_areas
        .iter()
        .copied()
        .filter(|a| a.is_finite())
        .fold(0., f64::max);
    best / roi_area
}

/// Liquid box height over glass box height, when both boxes were found.
pub fn liquid_height_ratio(glass: &BBox, liquid: &BBox) -> Option<f64> {
    let glass_height = glass.height();
    if !glass_height.is_finite() || glass_height <= 0. {
        return None;
    }
    Some(liquid.height().max(0.) / glass_height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_area_ratio() {
        let roi = BBox::new(0., 0., 10., 20.);
        assert_eq!(mask_area_ratio(&[50., 120., 80.], &roi), 0.6);
        assert_eq!(mask_area_ratio(&[], &roi), 0.);
        assert_eq!(mask_area_ratio(&[50.], &BBox::new(0., 0., 0., 10.)), 0.);
    }

    #[test]
    fn test_liquid_height_ratio() {
        let glass = BBox::new(0., 0., 10., 40.);
        let liquid = BBox::new(1., 10., 9., 40.);
        assert_eq!(liquid_height_ratio(&glass, &liquid), Some(0.75));
        assert_eq!(liquid_height_ratio(&BBox::new(0., 5., 1., 5.), &liquid), None);
    }
}
