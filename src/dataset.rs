use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use log::{debug, warn};
use ndarray as nd;
use serde::Deserialize;

use crate::bbox::BBox;
use crate::camera::FrameSource;
use crate::detector::{Detection, ObjectDetector};
use crate::fill::{liquid_height_ratio, mask_area_ratio, FillEstimator};
use crate::frame::Frame;
use crate::image::Image;
use crate::my_types::*;
use crate::tracker::{AssociationEngine, EngineOutput};

/// A detection as written by the perception recorder, with whatever the
/// segmenter had to say about the region.
#[derive(Clone, Debug, Deserialize)]
pub struct RecordedDetection {
    #[serde(flatten)]
    pub detection: Detection,
    #[serde(default)]
    pub fill_ratio: Option<f64>,
    /// Pixel area of the liquid mask inside the box
    #[serde(default)]
    pub mask_area: Option<f64>,
    /// Liquid region found by a level detector
    #[serde(default)]
    pub liquid_bbox: Option<BBox>,
}

impl RecordedDetection {
    pub fn fill_estimate(&self) -> Option<f64> {
        let bbox = &self.detection.bbox;
        self.fill_ratio
            .or_else(|| self.mask_area.map(|area| mask_area_ratio(&[area], bbox)))
            .or_else(|| self.liquid_bbox.and_then(|liquid| liquid_height_ratio(bbox, &liquid)))
    }
}

/// Everything perception produced for one frame.
#[derive(Clone, Debug, Deserialize)]
pub struct PerceptionRecord {
    pub time: Timestamp,
    #[serde(default)]
    pub detections: Vec<RecordedDetection>,
    /// Association engine output, when the recorder ran one
    #[serde(default)]
    pub tracked: Option<Vec<EngineOutput>>,
}

/// A JSON-lines perception recording, one record per frame.
#[derive(Clone, Debug)]
pub struct Recording {
    records: Arc<Vec<PerceptionRecord>>,
}

impl Recording {
    pub fn load(path: &Path) -> Result<Recording> {
        let file = File::open(path).with_context(|| format!("cannot open recording {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Malformed lines are skipped with a warning.
    pub fn from_reader(mut reader: impl BufRead) -> Result<Recording> {
        let mut records = vec![];
        let mut line = String::new();
        let mut line_number = 0;
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Err(err) => bail!("Failed to read line {}: {}", line_number + 1, err),
                _ => {}
            }
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PerceptionRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!("skipping line {}: {}", line_number, err),
            }
        }
        debug!("loaded {} perception records", records.len());
        Ok(Recording {
            records: Arc::new(records),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_engine_outputs(&self) -> bool {
        self.records.iter().any(|r| r.tracked.is_some())
    }

    fn record(&self, frame: &Frame) -> Result<&PerceptionRecord> {
        self.records
            .get(frame.sequence as usize)
            .ok_or_else(|| anyhow!("no recorded perception for frame {}", frame.sequence))
    }

    pub fn source(&self) -> ReplaySource {
        ReplaySource {
            recording: self.clone(),
            next: 0,
            timestamp: None,
            speed: 0.,
            clock: None,
        }
    }

    pub fn detector(&self) -> ReplayDetector {
        ReplayDetector {
            recording: self.clone(),
        }
    }

    pub fn engine(&self) -> ReplayEngine {
        ReplayEngine {
            recording: self.clone(),
        }
    }

    pub fn fill_estimator(&self) -> RecordedFill {
        RecordedFill {
            recording: self.clone(),
        }
    }
}

/// Yields one blank frame per record, stamped with the recorded time.
#[derive(Debug)]
pub struct ReplaySource {
    recording: Recording,
    next: usize,
    timestamp: Option<Timestamp>,
    /// Playback rate relative to the recording, 0 for as fast as possible
    speed: f64,
    /// Wall time and recorded time of the first paced frame
    clock: Option<(Instant, Timestamp)>,
}

impl ReplaySource {
    /// Deliver frames at the recorded pace, `speed` times faster.
    pub fn paced(mut self, speed: f64) -> Self {
        self.speed = if speed.is_finite() { speed.max(0.) } else { 0. };
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.recording.len()
    }

    fn wait_for(&mut self, time: Timestamp) {
        if self.speed <= 0. || !time.is_finite() {
            return;
        }
        let (start, t0) = *self.clock.get_or_insert((Instant::now(), time));
        let offset = Duration::try_from_secs_f64(((time - t0) / self.speed).max(0.));
        let Some(due) = offset.ok().and_then(|offset| start.checked_add(offset)) else {
            return;
        };
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
    }
}

impl FrameSource for ReplaySource {
    fn grab(&mut self) -> Result<Option<Image>> {
        let Some(record) = self.recording.records.get(self.next) else {
            // a finished recording behaves like a camera that stopped delivering
            return Ok(None);
        };
        let time = record.time;
        self.wait_for(time);
        self.timestamp = Some(time);
        self.next += 1;
        Ok(Some(Image::empty()))
    }

    fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }
}

#[derive(Debug)]
pub struct ReplayDetector {
    recording: Recording,
}

impl ObjectDetector for ReplayDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let record = self.recording.record(frame)?;
        Ok(record.detections.iter().map(|d| d.detection).collect())
    }
}

#[derive(Debug)]
pub struct ReplayEngine {
    recording: Recording,
}

impl AssociationEngine for ReplayEngine {
    fn update(&mut self, _detections: nd::ArrayView2<f64>, frame: &Frame) -> Result<Vec<EngineOutput>> {
        self.recording
            .record(frame)?
            .tracked
            .clone()
            .ok_or_else(|| anyhow!("frame {} has no recorded engine output", frame.sequence))
    }
}

/// Fill reading of the recorded detection overlapping the region best.
#[derive(Debug)]
pub struct RecordedFill {
    recording: Recording,
}

impl FillEstimator for RecordedFill {
    fn estimate(&mut self, frame: &Frame, roi: &BBox) -> Result<Option<f64>> {
        let record = self.recording.record(frame)?;
        let best = record
            .detections
            .iter()
            .map(|d| (d.detection.bbox.iou(roi), d))
            .filter(|(iou, _)| *iou > 0.)
            .max_by(|a, b| a.0.total_cmp(&b.0));
        Ok(best.and_then(|(_, d)| d.fill_estimate()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const RECORDING: &str = r#"
{"time": 0.0, "detections": [{"class": 41, "confidence": 0.9, "bbox": [90, 80, 110, 120], "fill_ratio": 0.9}], "tracked": [[90, 80, 110, 120, 7, 41]]}
not json at all
{"time": 1.0, "detections": [{"class": 41, "confidence": 0.9, "bbox": [91, 80, 111, 120], "mask_area": 600}], "tracked": [{"track_id": 7, "tlwh": [91, 80, 20, 40]}]}

{"time": 2.0, "detections": [{"class": 41, "confidence": 0.8, "bbox": [99, 80, 119, 120], "liquid_bbox": [100, 114, 118, 120]}], "tracked": [[99, 80, 119, 120, 7, 41]]}
{"time": 3.0, "detections": [], "tracked": []}
"#;

    pub(crate) fn recording() -> Recording {
        Recording::from_reader(RECORDING.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_skips_bad_lines() {
        let recording = recording();
        assert_eq!(recording.len(), 4);
        assert!(recording.has_engine_outputs());
        assert!(!recording.is_empty());
    }

    #[test]
    fn test_fill_hints() {
        let recording = recording();
        let fills: Vec<_> = recording
            .records
            .iter()
            .flat_map(|r| r.detections.iter().map(RecordedDetection::fill_estimate))
            .collect();
        assert_eq!(fills[0], Some(0.9));
        // 600 / (20 * 40)
        assert_eq!(fills[1], Some(0.75));
        // 6 / 40
        assert_eq!(fills[2], Some(0.15));
    }

    #[test]
    fn test_replay_source_stamps_recorded_time() {
        let recording = recording();
        let mut source = recording.source();
        for expected in [0.0, 1.0, 2.0, 3.0] {
            assert!(source.grab().unwrap().is_some());
            assert_eq!(source.timestamp(), Some(expected));
        }
        assert!(source.is_exhausted());
        assert!(source.grab().unwrap().is_none());
    }

    #[test]
    fn test_paced_replay_follows_recorded_time() {
        let recording = recording();
        let mut source = recording.source().paced(20.);
        let start = Instant::now();
        while source.grab().unwrap().is_some() {}
        // 3 recorded seconds at 20x
        assert!(start.elapsed() >= Duration::from_millis(140));
        assert_eq!(source.timestamp(), Some(3.0));
    }

    #[test]
    fn test_replay_adapters_follow_frame_sequence() {
        let recording = recording();
        let frame = Frame::new(Image::empty(), 1.0, 1);

        let detections = recording.detector().detect(&frame).unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox, BBox::new(91., 80., 111., 120.));

        let table = nd::Array2::<f64>::zeros((0, 6));
        let tracked = recording.engine().update(table.view(), &frame).unwrap();
        assert_eq!(tracked.len(), 1);

        let fill = recording
            .fill_estimator()
            .estimate(&frame, &BBox::new(90., 80., 110., 120.))
            .unwrap();
        assert_eq!(fill, Some(0.75));

        let far = recording
            .fill_estimator()
            .estimate(&frame, &BBox::new(400., 400., 420., 440.))
            .unwrap();
        assert_eq!(far, None);

        let missing = Frame::new(Image::empty(), 9.0, 9);
        assert!(recording.detector().detect(&missing).is_err());
    }
}
