use anyhow::{bail, Context as AnyhowContext, Result};
use cv2::prelude::*;
use opencv as cv2;

use crate::camera::{CameraSource, FrameSource};
use crate::image::Image;

/// Live frames from a USB device or network stream through OpenCV.
pub struct VideoCaptureSource {
    capture: cv2::videoio::VideoCapture,
    mat: cv2::core::Mat,
}

impl std::fmt::Debug for VideoCaptureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoCaptureSource").finish_non_exhaustive()
    }
}

impl VideoCaptureSource {
    pub fn open(source: &CameraSource) -> Result<Self> {
        let capture = match source {
            CameraSource::Device(index) => {
                cv2::videoio::VideoCapture::new(*index, cv2::videoio::CAP_ANY)
            }
            CameraSource::Url(url) => {
                cv2::videoio::VideoCapture::from_file(url, cv2::videoio::CAP_ANY)
            }
        }
        .with_context(|| format!("failed to create capture for {source}"))?;

        if !capture.is_opened()? {
            bail!("cannot open video source {source}");
        }
        Ok(Self {
            capture,
            mat: cv2::core::Mat::default(),
        })
    }
}

impl FrameSource for VideoCaptureSource {
    fn grab(&mut self) -> Result<Option<Image>> {
        if !self.capture.read(&mut self.mat)? {
            return Ok(None);
        }
        let size = self.mat.size()?;
        let (width, height) = (size.width as usize, size.height as usize);
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let bytes = self.mat.data_bytes()?;
        let channels = bytes.len() / (width * height);
        Ok(Some(Image::new(bytes.to_vec(), width, height, channels)))
    }
}
