use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bbox::BBox;
use crate::my_types::*;

/// Slack for threshold comparisons on fill deltas, `0.5 - 0.4` is not quite `0.1`.
const FILL_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    /// No fill reading yet
    Unknown,
    Full,
    Partial,
    Empty,
    /// Moving while partially filled
    Moving,
    /// Moving while nearly empty
    Drinking,
    /// Moving while full
    Refilling,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The container was first seen
    Served,
    Sip,
    Refill,
    /// An out-of-range fill reading was clamped, detail holds the raw value
    Clamped,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackEvent {
    pub kind: EventKind,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: TrackId,
    pub bbox: BBox,
    pub fill_ratio: Option<f64>,
    /// Distance between the last two box centers
    pub movement: f64,
    pub status: TrackStatus,
    pub sip_count: u32,
    pub created_at: Timestamp,
    pub last_seen: Timestamp,
    pub events: Vec<TrackEvent>,
}

impl Track {
    fn push_event(&mut self, kind: EventKind, timestamp: Timestamp, detail: Option<f64>) {
        // keep the log ordered even if the caller's clock stepped back
        let timestamp = self
            .events
            .last()
            .map_or(timestamp, |e| e.timestamp.max(timestamp));
        self.events.push(TrackEvent {
            kind,
            timestamp,
            detail,
        });
    }

    pub fn count_events(&self, kind: EventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

/// What the perception layer saw for one track in one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub bbox: BBox,
    pub fill_ratio: Option<f64>,
    pub timestamp: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusThresholds {
    /// Below this the container counts as empty
    pub empty: f64,
    /// Above this the container counts as full
    pub full: f64,
    /// Minimum fill drop between two readings to count as a sip
    pub sip: f64,
    /// Sips after which the container is considered drunk dry
    pub sips_to_empty: u32,
    /// Center displacement above which the container counts as moving
    pub movement: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            empty: 0.2,
            full: 0.8,
            sip: 0.1,
            sips_to_empty: 10,
            movement: 5.,
        }
    }
}

/// Status from the fill level alone.
pub fn fill_status(fill_ratio: Option<f64>, thresholds: &StatusThresholds) -> TrackStatus {
    match fill_ratio {
        None => TrackStatus::Unknown,
        Some(f) if f < thresholds.empty => TrackStatus::Empty,
        Some(f) if f > thresholds.full => TrackStatus::Full,
        Some(_) => TrackStatus::Partial,
    }
}

/// Pure status derivation, recomputed on every update.
pub fn derive_status(
    fill_ratio: Option<f64>,
    movement: f64,
    sip_count: u32,
    thresholds: &StatusThresholds,
) -> TrackStatus {
    if sip_count >= thresholds.sips_to_empty {
        return TrackStatus::Empty;
    }
    let status = fill_status(fill_ratio, thresholds);
    if movement > thresholds.movement {
        return match status {
            TrackStatus::Empty => TrackStatus::Drinking,
            TrackStatus::Full => TrackStatus::Refilling,
            _ => TrackStatus::Moving,
        };
    }
    status
}

/// Drops non-finite readings and clamps the rest into [0, 1]. The second value
/// is the raw reading when clamping happened.
fn sanitize_fill(raw: Option<f64>) -> (Option<f64>, Option<f64>) {
    match raw {
        Some(f) if !f.is_finite() => {
            debug!(fill_ratio = f, "ignoring non-finite fill reading");
            (None, None)
        }
        Some(f) if !(0. ..=1.).contains(&f) => (Some(f.clamp(0., 1.)), Some(f)),
        other => (other, None),
    }
}

/// Canonical per-track records for the live set of one camera.
#[derive(Debug, Default)]
pub struct TrackStore {
    thresholds: StatusThresholds,
    tracks: BTreeMap<TrackId, Track>,
}

impl TrackStore {
    pub fn new(thresholds: StatusThresholds) -> Self {
        Self {
            thresholds,
            tracks: BTreeMap::new(),
        }
    }

    pub fn thresholds(&self) -> &StatusThresholds {
        &self.thresholds
    }

    pub fn get(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    /// Owned copy of every live track, for handing to consumers.
    pub fn snapshot(&self) -> BTreeMap<TrackId, Track> {
        self.tracks.clone()
    }

    /// Apply one observation, creating the track on first sight.
    pub fn update(&mut self, track_id: TrackId, observation: &Observation) -> &Track {
        let thresholds = self.thresholds;
        let (fill_ratio, clamped_from) = sanitize_fill(observation.fill_ratio);

        let track = self
            .tracks
            .entry(track_id)
            .and_modify(|track| {
                let now = observation.timestamp.max(track.last_seen);
                if let Some(raw) = clamped_from {
                    track.push_event(EventKind::Clamped, now, Some(raw));
                }

                let movement = track.bbox.center_distance(&observation.bbox);
                if let (Some(previous), Some(current)) = (track.fill_ratio, fill_ratio) {
                    let delta = previous - current;
                    if delta + FILL_EPSILON >= thresholds.sip {
                        track.sip_count += 1;
                        track.push_event(EventKind::Sip, now, Some(delta));
                        trace!(%track_id, delta, sips = track.sip_count, "sip");
                    } else if -delta + FILL_EPSILON >= thresholds.sip {
                        track.push_event(EventKind::Refill, now, Some(-delta));
                        trace!(%track_id, delta = -delta, "refill");
                    }
                }

                let fill_ratio = fill_ratio.or(track.fill_ratio);
                track.status = derive_status(fill_ratio, movement, track.sip_count, &thresholds);
                track.fill_ratio = fill_ratio;
                track.movement = movement;
                track.bbox = observation.bbox;
                track.last_seen = now;
            })
            .or_insert_with(|| {
                let now = observation.timestamp;
                let mut track = Track {
                    track_id,
                    bbox: observation.bbox,
                    fill_ratio,
                    movement: 0.,
                    status: derive_status(fill_ratio, 0., 0, &thresholds),
                    sip_count: 0,
                    created_at: now,
                    last_seen: now,
                    events: vec![],
                };
                track.push_event(EventKind::Served, now, None);
                if let Some(raw) = clamped_from {
                    track.push_event(EventKind::Clamped, now, Some(raw));
                }
                debug!(%track_id, ?fill_ratio, status = ?track.status, "new track");
                track
            });
        track
    }

    /// Mark a track removed, log it and take it out of the live set.
    /// Unknown ids are ignored.
    pub fn evict(&mut self, track_id: TrackId, now: Timestamp) -> Option<Track> {
        let mut track = self.tracks.remove(&track_id)?;
        track.status = TrackStatus::Removed;
        let now = now.max(track.last_seen);
        track.push_event(EventKind::Removed, now, None);
        debug!(%track_id, sips = track.sip_count, "track removed");
        Some(track)
    }
}
