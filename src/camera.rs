use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::frame::Frame;
use crate::frame_buffer::{FrameBuffer, RateLimiter};
use crate::image::Image;
use crate::my_types::*;

/// Where a camera reads its frames from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraSource {
    /// Local capture device index, e.g. `0` for the first USB webcam
    Device(i32),
    /// Network stream or file path
    Url(String),
}

impl CameraSource {
    /// IP camera apps usually serve MJPEG at `/video`.
    pub fn ip_camera(host: &str, port: u16) -> Self {
        CameraSource::Url(format!("http://{host}:{port}/video"))
    }
}

impl FromStr for CameraSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<i32>() {
            Ok(index) => CameraSource::Device(index),
            Err(_) => CameraSource::Url(s.trim().to_string()),
        })
    }
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Device(index) => write!(f, "device:{index}"),
            CameraSource::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Something that produces images, one per call.
pub trait FrameSource: Send + fmt::Debug {
    /// `Ok(None)` when the source had nothing to give this time.
    fn grab(&mut self) -> Result<Option<Image>>;

    /// Capture time of the image returned by the last successful `grab`, for
    /// sources that carry their own clock (recordings). Live sources use the
    /// wall clock.
    fn timestamp(&self) -> Option<Timestamp> {
        None
    }
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera `{0}` is not registered")]
    Unknown(String),
    #[error("camera `{0}` is already registered")]
    Duplicate(String),
    #[error("camera `{0}` is already running")]
    AlreadyRunning(String),
    #[error("camera `{0}` lost its frame source")]
    SourceLost(String),
}

#[derive(Clone, Copy, Debug)]
pub struct CaptureSettings {
    /// Zero means unlimited
    pub max_fps: f64,
    /// Pause after a failed capture before trying again
    pub retry_backoff: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_fps: 0.,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

#[derive(Debug)]
pub struct Camera {
    pub id: String,
    pub source: CameraSource,
    pub settings: CaptureSettings,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    frame_source: Option<Box<dyn FrameSource>>,
    handle: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl Camera {
    pub fn new(
        id: &str,
        source: CameraSource,
        frame_source: Box<dyn FrameSource>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            id: id.to_string(),
            source,
            settings,
            buffer: Arc::new(FrameBuffer::new()),
            running: Arc::new(AtomicBool::new(false)),
            frame_source: Some(frame_source),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Shared handle to this camera's frame slot.
    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.buffer.latest()
    }

    /// Spawn the capture thread.
    pub fn start(&mut self) -> Result<(), CameraError> {
        if self.handle.is_some() {
            return Err(CameraError::AlreadyRunning(self.id.clone()));
        }
        let frame_source = self
            .frame_source
            .take()
            .ok_or_else(|| CameraError::SourceLost(self.id.clone()))?;

        self.running.store(true, Ordering::SeqCst);
        let worker = CaptureWorker {
            camera_id: self.id.clone(),
            source: frame_source,
            buffer: self.buffer.clone(),
            running: self.running.clone(),
            settings: self.settings,
            // continue numbering after a restart
            sequence: self.buffer.latest().map(|f| f.sequence + 1).unwrap_or(0),
        };
        info!(camera = %self.id, source = %self.source, "starting capture");
        self.handle = Some(thread::spawn(move || worker.run()));
        Ok(())
    }

    /// Signal the capture thread to exit and wait for it. No-op when stopped.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(source) => self.frame_source = Some(source),
                Err(_) => warn!(camera = %self.id, "capture thread panicked"),
            }
            info!(camera = %self.id, "capture stopped");
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State moved into the capture thread.
struct CaptureWorker {
    camera_id: String,
    source: Box<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    running: Arc<AtomicBool>,
    settings: CaptureSettings,
    sequence: u64,
}

impl CaptureWorker {
    /// Runs until the running flag clears, then hands the source back.
    fn run(mut self) -> Box<dyn FrameSource> {
        let mut limiter = RateLimiter::new(self.settings.max_fps);
        let mut rng = rand::thread_rng();
        let mut last_time = f64::MIN;

        while self.running.load(Ordering::SeqCst) {
            limiter.wait();
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match self.source.grab() {
                Ok(Some(image)) if !image.is_consistent() => {
                    warn!(
                        camera = %self.camera_id,
                        bytes = image.data.len(),
                        width = image.width,
                        height = image.height,
                        channels = image.channels,
                        "malformed image, dropping it"
                    );
                    self.backoff(&mut rng);
                }
                Ok(Some(image)) => {
                    limiter.mark(Instant::now());
                    // wall clock can step backwards, keep timestamps monotonic
                    let captured_at = self.source.timestamp().unwrap_or_else(wall_clock).max(last_time);
                    last_time = captured_at;
                    self.buffer
                        .publish(Frame::new(image, captured_at, self.sequence));
                    self.sequence += 1;
                }
                Ok(None) => {
                    trace!(camera = %self.camera_id, "no frame, retrying");
                    self.backoff(&mut rng);
                }
                Err(err) => {
                    trace!(camera = %self.camera_id, "capture failed, retrying: {err:#}");
                    self.backoff(&mut rng);
                }
            }
        }
        debug!(camera = %self.camera_id, frames = self.sequence, "capture loop exited");
        self.source
    }

    fn backoff(&self, rng: &mut impl Rng) {
        let base = self.settings.retry_backoff;
        if base.is_zero() {
            thread::yield_now();
            return;
        }
        let jitter = rng.gen_range(0..=base.as_micros() as u64 / 2);
        thread::sleep(base + Duration::from_micros(jitter));
    }
}

fn wall_clock() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

/// Owns every camera by id.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    cameras: HashMap<String, Camera>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, camera: Camera) -> Result<(), CameraError> {
        if self.cameras.contains_key(&camera.id) {
            return Err(CameraError::Duplicate(camera.id.clone()));
        }
        debug!(camera = %camera.id, source = %camera.source, "registered camera");
        self.cameras.insert(camera.id.clone(), camera);
        Ok(())
    }

    /// Stops the camera before handing it back.
    pub fn remove(&mut self, id: &str) -> Option<Camera> {
        let mut camera = self.cameras.remove(id)?;
        camera.stop();
        Some(camera)
    }

    pub fn get(&self, id: &str) -> Option<&Camera> {
        self.cameras.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.cameras.keys().map(String::as_str)
    }

    pub fn start(&mut self, id: &str) -> Result<(), CameraError> {
        self.camera_mut(id)?.start()
    }

    pub fn start_all(&mut self) -> Result<(), CameraError> {
        for camera in self.cameras.values_mut() {
            if !camera.is_running() {
                camera.start()?;
            }
        }
        Ok(())
    }

    pub fn stop(&mut self, id: &str) -> Result<(), CameraError> {
        self.camera_mut(id)?.stop();
        Ok(())
    }

    pub fn stop_all(&mut self) {
        for camera in self.cameras.values_mut() {
            camera.stop();
        }
    }

    pub fn buffer(&self, id: &str) -> Result<Arc<FrameBuffer>, CameraError> {
        self.cameras
            .get(id)
            .map(Camera::buffer)
            .ok_or_else(|| CameraError::Unknown(id.to_string()))
    }

    /// `None` for unknown cameras and cameras that have not produced a frame yet.
    pub fn latest_frame(&self, id: &str) -> Option<Frame> {
        self.cameras.get(id).and_then(Camera::latest)
    }

    fn camera_mut(&mut self, id: &str) -> Result<&mut Camera, CameraError> {
        self.cameras
            .get_mut(id)
            .ok_or_else(|| CameraError::Unknown(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    /// Fails every other call, otherwise yields a 2x2 image filled with a counter.
    #[derive(Debug)]
    struct FlakySource {
        calls: Arc<AtomicUsize>,
    }

    impl FrameSource for FlakySource {
        fn grab(&mut self) -> Result<Option<Image>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match n % 3 {
                0 => bail!("device busy"),
                1 => Ok(None),
                _ => Ok(Some(Image::new(vec![(n % 256) as u8; 4], 2, 2, 1))),
            }
        }
    }

    fn wait_for_frames(camera: &Camera, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while camera.buffer().published_count() < count {
            assert!(Instant::now() < deadline, "camera produced no frames");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("0".parse::<CameraSource>().unwrap(), CameraSource::Device(0));
        assert_eq!(
            "rtsp://10.0.0.2/stream".parse::<CameraSource>().unwrap(),
            CameraSource::Url("rtsp://10.0.0.2/stream".to_string())
        );
        assert_eq!(
            CameraSource::ip_camera("192.168.1.12", 4747),
            CameraSource::Url("http://192.168.1.12:4747/video".to_string())
        );
    }

    #[test]
    fn test_capture_retries_until_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut camera = Camera::new(
            "cam1",
            CameraSource::Device(0),
            Box::new(FlakySource {
                calls: calls.clone(),
            }),
            CaptureSettings {
                max_fps: 0.,
                retry_backoff: Duration::from_millis(1),
            },
        );
        assert!(camera.latest().is_none());

        camera.start().unwrap();
        assert!(matches!(camera.start(), Err(CameraError::AlreadyRunning(_))));
        wait_for_frames(&camera, 3);
        camera.stop();
        assert!(!camera.is_running());

        let published = camera.buffer().published_count();
        let latest = camera.latest().unwrap();
        assert_eq!(latest.sequence, published - 1);
        // failures were retried, never surfaced
        assert!(calls.load(Ordering::SeqCst) >= 3 * published as usize - 1);

        // producer is gone, nothing changes after stop
        thread::sleep(Duration::from_millis(10));
        assert_eq!(camera.buffer().published_count(), published);

        // restart continues the sequence
        camera.start().unwrap();
        wait_for_frames(&camera, published + 1);
        camera.stop();
        assert!(camera.latest().unwrap().sequence >= published);
    }

    /// Claims a 4x4 frame but only carries a few bytes.
    #[derive(Debug)]
    struct TruncatedSource;

    impl FrameSource for TruncatedSource {
        fn grab(&mut self) -> Result<Option<Image>> {
            Ok(Some(Image::new(vec![0; 3], 4, 4, 1)))
        }
    }

    #[test]
    fn test_malformed_images_are_not_published() {
        let mut camera = Camera::new(
            "broken",
            CameraSource::Device(2),
            Box::new(TruncatedSource),
            CaptureSettings {
                max_fps: 0.,
                retry_backoff: Duration::from_millis(1),
            },
        );
        camera.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        camera.stop();
        assert_eq!(camera.buffer().published_count(), 0);
        assert!(camera.latest().is_none());
    }

    #[test]
    fn test_rate_cap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut camera = Camera::new(
            "slow",
            CameraSource::Device(1),
            Box::new(FlakySource {
                calls: calls.clone(),
            }),
            CaptureSettings {
                max_fps: 50.,
                retry_backoff: Duration::ZERO,
            },
        );
        camera.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        camera.stop();
        // 50 fps over 200 ms, with slack for scheduling
        assert!(camera.buffer().published_count() <= 12);
    }

    #[test]
    fn test_registry() {
        let mut registry = CameraRegistry::new();
        let make = |id: &str| {
            Camera::new(
                id,
                CameraSource::Device(0),
                Box::new(FlakySource {
                    calls: Arc::new(AtomicUsize::new(2)),
                }),
                CaptureSettings::default(),
            )
        };
        registry.add(make("a")).unwrap();
        assert!(matches!(registry.add(make("a")), Err(CameraError::Duplicate(_))));
        registry.add(make("b")).unwrap();

        assert!(matches!(registry.start("zzz"), Err(CameraError::Unknown(_))));
        assert!(registry.latest_frame("a").is_none());
        assert!(registry.latest_frame("zzz").is_none());

        registry.start_all().unwrap();
        let buffer = registry.buffer("a").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while buffer.latest().is_none() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }
        registry.stop_all();
        assert!(registry.latest_frame("a").is_some());

        let mut ids: Vec<_> = registry.ids().collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        let removed = registry.remove("b").unwrap();
        assert!(!removed.is_running());
        assert!(registry.get("b").is_none());
        assert!(registry.stop("b").is_err());
    }
}
