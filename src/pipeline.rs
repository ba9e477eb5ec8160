use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::detector::{Detection, DetectionFilter, ObjectDetector};
use crate::fill::FillEstimator;
use crate::frame::Frame;
use crate::frame_buffer::FrameBuffer;
use crate::lifecycle::Reaper;
use crate::my_types::*;
use crate::state::{Observation, Track, TrackStatus, TrackStore};
use crate::tracker::TrackAssociator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The container just became empty
    NeedsRefill,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub track_id: TrackId,
    pub kind: AlertKind,
    pub timestamp: Timestamp,
}

/// What one processed frame looks like to the display and alerting layers.
#[derive(Clone, Debug, Serialize)]
pub struct FrameSnapshot {
    pub camera_id: String,
    pub sequence: u64,
    pub captured_at: Timestamp,
    /// Every live track after this frame
    pub tracks: BTreeMap<TrackId, Track>,
    /// Tracks reaped in this frame, with their final event
    pub removed: Vec<Track>,
    pub alerts: Vec<Alert>,
}

/// Per-camera processing path: detections in, track snapshot out.
///
/// Owns the camera's track store, so one pipeline must not be shared between
/// cameras; run one per camera instead.
pub struct Pipeline {
    camera_id: String,
    filter: DetectionFilter,
    associator: TrackAssociator,
    fill: Box<dyn FillEstimator>,
    store: TrackStore,
    reaper: Reaper,
    last_sequence: Option<u64>,
}

impl Pipeline {
    pub fn new(
        camera_id: &str,
        config: &Config,
        associator: TrackAssociator,
        fill: Box<dyn FillEstimator>,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            filter: config.detection_filter(),
            associator,
            fill,
            store: TrackStore::new(config.thresholds()),
            reaper: Reaper::new(config.reap_grace_secs),
            last_sequence: None,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn store(&self) -> &TrackStore {
        &self.store
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Process the camera's newest frame if it has not been seen yet.
    ///
    /// Frames published in between two polls are skipped. Detector and engine
    /// failures are logged and the cycle is dropped, tracks keep their state.
    pub fn poll(
        &mut self,
        buffer: &FrameBuffer,
        detector: &mut dyn ObjectDetector,
    ) -> Option<FrameSnapshot> {
        let frame = buffer.latest()?;
        if matches!(self.last_sequence, Some(last) if frame.sequence <= last) {
            return None;
        }
        if let Some(last) = self.last_sequence {
            if frame.sequence > last + 1 {
                debug!(
                    camera = %self.camera_id,
                    skipped = frame.sequence - last - 1,
                    "consumer fell behind, skipping stale frames"
                );
            }
        }

        let detections = match detector.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                warn!(camera = %self.camera_id, sequence = frame.sequence, "detection failed: {err:#}");
                self.last_sequence = Some(frame.sequence);
                return None;
            }
        };
        match self.process(&frame, detections) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(camera = %self.camera_id, sequence = frame.sequence, "skipping frame: {err:#}");
                None
            }
        }
    }

    /// One full cycle: filter, associate, update every track, reap the missing ones.
    #[instrument(level = "debug", skip_all, fields(camera = %self.camera_id, sequence = frame.sequence))]
    pub fn process(&mut self, frame: &Frame, detections: Vec<Detection>) -> Result<FrameSnapshot> {
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                bail!("frame {} arrived after frame {}", frame.sequence, last);
            }
        }
        self.last_sequence = Some(frame.sequence);

        let detections = self.filter.apply(detections);
        let association = self.associator.associate(&detections, frame)?;

        let now = frame.captured_at;
        let mut active = HashSet::with_capacity(association.tracked.len() + association.held.len());
        // still there, just not measurable this frame
        active.extend(association.held.iter().copied());
        let mut alerts = vec![];
        for a in association.tracked {
            let fill_ratio = match self.fill.estimate(frame, &a.bbox) {
                Ok(fill) => fill,
                Err(err) => {
                    warn!(track_id = %a.track_id, "fill estimation failed: {err:#}");
                    None
                }
            };
            let before = self.store.get(a.track_id).map(|t| t.status);
            let track = self.store.update(
                a.track_id,
                &Observation {
                    bbox: a.bbox,
                    fill_ratio,
                    timestamp: now,
                },
            );
            if track.status == TrackStatus::Empty && before != Some(TrackStatus::Empty) {
                info!(camera = %self.camera_id, track_id = %a.track_id, "needs refill");
                alerts.push(Alert {
                    track_id: a.track_id,
                    kind: AlertKind::NeedsRefill,
                    timestamp: track.last_seen,
                });
            }
            active.insert(a.track_id);
        }

        let removed = self.reaper.sweep(&mut self.store, &active, now);
        let retired: Vec<TrackId> = removed.iter().map(|t| t.track_id).collect();
        self.associator.retire(&retired);

        debug!(
            width = frame.width(),
            height = frame.height(),
            tracks = self.store.len(),
            removed = removed.len(),
            "frame processed"
        );
        Ok(FrameSnapshot {
            camera_id: self.camera_id.clone(),
            sequence: frame.sequence,
            captured_at: now,
            tracks: self.store.snapshot(),
            removed,
            alerts,
        })
    }
}
