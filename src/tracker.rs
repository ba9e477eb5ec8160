use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use anyhow::Result;
use ndarray as nd;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::bbox::BBox;
use crate::detector::Detection;
use crate::frame::Frame;
use crate::my_types::*;

/// Columns of the detection table handed to an engine: `[x1, y1, x2, y2, confidence, class_id]`.
pub const DETECTION_COLUMNS: usize = 6;

/// One tracked object as reported by an association engine. Engines differ in
/// what they return, so every known shape gets a variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineOutput {
    /// Structured record with a top-left/width/height box
    Record { track_id: i64, tlwh: [f64; 4] },
    /// Dense row `[x1, y1, x2, y2, track_id, class_id, ...]`
    Row(Vec<f64>),
    /// Anything else, kept only so it can be reported
    Other(serde_json::Value),
}

/// Why an engine record could not be turned into an observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejected {
    /// No readable id, nothing to attribute the record to
    Unrecognized,
    /// The id is readable but the box is degenerate or missing
    BadBox(u64),
}

impl EngineOutput {
    /// The engine's id and box.
    pub fn normalize(&self) -> Result<(u64, BBox), Rejected> {
        let (id, bbox) = match self {
            EngineOutput::Record { track_id, tlwh } => {
                let id = u64::try_from(*track_id).map_err(|_| Rejected::Unrecognized)?;
                (id, BBox::from_tlwh(*tlwh))
            }
            EngineOutput::Row(row) => {
                if row.len() < 5 {
                    return Err(Rejected::Unrecognized);
                }
                let id = row[4];
                if !id.is_finite() || id < 0. || id.fract() != 0. {
                    return Err(Rejected::Unrecognized);
                }
                (id as u64, BBox::new(row[0], row[1], row[2], row[3]))
            }
            // a record whose box did not parse still names its id
            EngineOutput::Other(value) => {
                return Err(value
                    .get("track_id")
                    .and_then(serde_json::Value::as_u64)
                    .map_or(Rejected::Unrecognized, Rejected::BadBox))
            }
        };
        if bbox.is_valid() {
            Ok((id, bbox))
        } else {
            Err(Rejected::BadBox(id))
        }
    }
}

/// External multi-object tracker (e.g. a ReID-backed BoT-SORT), treated as a black box.
pub trait AssociationEngine {
    /// `detections` has one row per detection, see [`DETECTION_COLUMNS`].
    fn update(&mut self, detections: nd::ArrayView2<f64>, frame: &Frame) -> Result<Vec<EngineOutput>>;
}

/// A detection resolved to a stable identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Associated {
    pub track_id: TrackId,
    pub bbox: BBox,
}

/// Result of one association round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Association {
    pub tracked: Vec<Associated>,
    /// Live identities the engine still reports but without a usable box.
    /// They get no update this round and must not be reaped either.
    pub held: Vec<TrackId>,
}

pub fn detections_to_array(detections: &[Detection]) -> nd::Array2<f64> {
    nd::Array2::from_shape_fn((detections.len(), DETECTION_COLUMNS), |(i, j)| {
        let d = &detections[i];
        match j {
            0 => d.bbox.x1,
            1 => d.bbox.y1,
            2 => d.bbox.x2,
            3 => d.bbox.y2,
            4 => d.confidence,
            _ => d.class_id as f64,
        }
    })
}

#[derive(Debug, Default)]
struct IdMinter {
    next: u64,
}

impl IdMinter {
    fn mint(&mut self) -> TrackId {
        self.next += 1;
        TrackId(self.next)
    }
}

/// Identity by maximal box overlap with the boxes of live identities.
#[derive(Debug)]
pub struct IouMatcher {
    threshold: f64,
    known: BTreeMap<TrackId, BBox>,
}

impl IouMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            known: BTreeMap::new(),
        }
    }

    /// Greedy matching, best overlaps first. Each live identity is claimed at
    /// most once per call; leftovers get fresh ids.
    fn assign(&mut self, detections: &[Detection], minter: &mut IdMinter) -> Vec<Associated> {
        let mut pairs = vec![];
        for (i, det) in detections.iter().enumerate() {
            for (&id, bbox) in &self.known {
                let iou = det.bbox.iou(bbox);
                if iou > self.threshold {
                    pairs.push((iou, i, id));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<TrackId>> = vec![None; detections.len()];
        let mut claimed = HashSet::new();
        for (_, i, id) in pairs {
            if assigned[i].is_none() && !claimed.contains(&id) {
                assigned[i] = Some(id);
                claimed.insert(id);
            }
        }

        detections
            .iter()
            .zip(assigned)
            .map(|(det, id)| {
                let track_id = id.unwrap_or_else(|| minter.mint());
                self.known.insert(track_id, det.bbox);
                Associated {
                    track_id,
                    bbox: det.bbox,
                }
            })
            .collect()
    }

    fn retire(&mut self, id: TrackId) {
        self.known.remove(&id);
    }
}

enum Backend {
    Engine {
        engine: Box<dyn AssociationEngine>,
        /// engine id -> core id for identities still alive
        ids: HashMap<u64, TrackId>,
    },
    Overlap(IouMatcher),
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Engine { ids, .. } => f.debug_struct("Engine").field("ids", ids).finish(),
            Backend::Overlap(m) => f.debug_tuple("Overlap").field(m).finish(),
        }
    }
}

/// Turns per-frame detections into `(track_id, bbox)` pairs.
///
/// Core ids are minted here and never reused: once an id is retired, an object
/// showing up again gets a new one even if the engine hands back its old id.
#[derive(Debug)]
pub struct TrackAssociator {
    backend: Backend,
    minter: IdMinter,
}

impl TrackAssociator {
    pub fn with_engine(engine: Box<dyn AssociationEngine>) -> Self {
        Self {
            backend: Backend::Engine {
                engine,
                ids: HashMap::new(),
            },
            minter: IdMinter::default(),
        }
    }

    pub fn overlap(iou_threshold: f64) -> Self {
        Self {
            backend: Backend::Overlap(IouMatcher::new(iou_threshold)),
            minter: IdMinter::default(),
        }
    }

    pub fn uses_engine(&self) -> bool {
        matches!(self.backend, Backend::Engine { .. })
    }

    /// Fails only when the engine itself fails; bad engine records are skipped.
    #[instrument(level = "debug", skip_all, fields(sequence = frame.sequence, detections = detections.len()))]
    pub fn associate(&mut self, detections: &[Detection], frame: &Frame) -> Result<Association> {
        match &mut self.backend {
            Backend::Overlap(matcher) => Ok(Association {
                tracked: matcher.assign(detections, &mut self.minter),
                held: vec![],
            }),
            Backend::Engine { engine, ids } => {
                let table = detections_to_array(detections);
                let outputs = engine.update(table.view(), frame)?;

                let mut seen = HashSet::new();
                let mut association = Association::default();
                for output in &outputs {
                    let (engine_id, bbox) = match output.normalize() {
                        Ok(normalized) => normalized,
                        Err(Rejected::BadBox(engine_id)) => {
                            match ids.get(&engine_id) {
                                Some(&track_id) if seen.insert(engine_id) => {
                                    warn!(engine_id, %track_id, "unusable box, holding track as is");
                                    association.held.push(track_id);
                                }
                                _ => warn!(?output, "skipping engine output with unusable box"),
                            }
                            continue;
                        }
                        Err(Rejected::Unrecognized) => {
                            warn!(?output, "skipping unrecognized engine output");
                            continue;
                        }
                    };
                    if !seen.insert(engine_id) {
                        warn!(engine_id, "engine reported the same id twice, keeping the first");
                        continue;
                    }
                    let minter = &mut self.minter;
                    let track_id = *ids.entry(engine_id).or_insert_with(|| minter.mint());
                    association.tracked.push(Associated { track_id, bbox });
                }
                debug!(
                    tracked = association.tracked.len(),
                    held = association.held.len(),
                    "engine association done"
                );
                Ok(association)
            }
        }
    }

    /// Forget identities that were reaped.
    pub fn retire(&mut self, retired: &[TrackId]) {
        if retired.is_empty() {
            return;
        }
        match &mut self.backend {
            Backend::Overlap(matcher) => retired.iter().for_each(|&id| matcher.retire(id)),
            Backend::Engine { ids, .. } => ids.retain(|_, id| !retired.contains(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;
    use std::collections::VecDeque;

    fn det(bbox: [f64; 4]) -> Detection {
        Detection {
            class_id: 41,
            confidence: 0.9,
            bbox: bbox.into(),
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(Image::empty(), seq as f64, seq)
    }

    /// Replays canned outputs.
    struct ScriptedEngine {
        outputs: VecDeque<Result<Vec<EngineOutput>>>,
    }

    impl AssociationEngine for ScriptedEngine {
        fn update(&mut self, detections: nd::ArrayView2<f64>, _frame: &Frame) -> Result<Vec<EngineOutput>> {
            assert_eq!(detections.ncols(), DETECTION_COLUMNS);
            self.outputs.pop_front().unwrap_or_else(|| Ok(vec![]))
        }
    }

    #[test]
    fn test_detection_table() {
        let table = detections_to_array(&[det([1., 2., 3., 4.])]);
        assert_eq!(table.dim(), (1, DETECTION_COLUMNS));
        assert_eq!(table.row(0).to_vec(), vec![1., 2., 3., 4., 0.9, 41.]);
        assert_eq!(detections_to_array(&[]).dim(), (0, DETECTION_COLUMNS));
    }

    #[test]
    fn test_normalize_engine_shapes() {
        let outputs: Vec<EngineOutput> = serde_json::from_str(
            r#"[
                {"track_id": 3, "tlwh": [10, 20, 30, 40], "score": 0.7},
                [1, 2, 11, 12, 4, 41, 0.8],
                [1, 2, 11, 12],
                [1, 2, 11, 12, 2.5, 41],
                {"track_id": -1, "tlwh": [0, 0, 5, 5]},
                "garbage"
            ]"#,
        )
        .unwrap();
        assert!(matches!(outputs[0], EngineOutput::Record { .. }));
        assert!(matches!(outputs[1], EngineOutput::Row(_)));
        assert!(matches!(outputs[5], EngineOutput::Other(_)));

        let normalized: Vec<_> = outputs.iter().map(EngineOutput::normalize).collect();
        assert_eq!(normalized[0], Ok((3, BBox::new(10., 20., 40., 60.))));
        assert_eq!(normalized[1], Ok((4, BBox::new(1., 2., 11., 12.))));
        assert!(normalized[2..].iter().all(|n| *n == Err(Rejected::Unrecognized)));
    }

    #[test]
    fn test_normalize_keeps_id_of_unusable_box() {
        let degenerate = EngineOutput::Row(vec![5., 5., 5., 5., 1., 41.]);
        assert_eq!(degenerate.normalize(), Err(Rejected::BadBox(1)));

        let flat = EngineOutput::Record {
            track_id: 2,
            tlwh: [0., 0., 0., 10.],
        };
        assert_eq!(flat.normalize(), Err(Rejected::BadBox(2)));

        let broken: EngineOutput = serde_json::from_str(r#"{"track_id": 3, "tlwh": "n/a"}"#).unwrap();
        assert!(matches!(broken, EngineOutput::Other(_)));
        assert_eq!(broken.normalize(), Err(Rejected::BadBox(3)));
    }

    #[test]
    fn test_engine_mode_skips_bad_records() {
        let engine = ScriptedEngine {
            outputs: VecDeque::from(vec![Ok(vec![
                EngineOutput::Row(vec![0., 0., 10., 10., 5., 41.]),
                EngineOutput::Other(serde_json::json!({"tlbr": [0, 0, 1, 1]})),
                EngineOutput::Row(vec![50., 50., 60., 60., 5., 41.]),
                EngineOutput::Record {
                    track_id: 9,
                    tlwh: [20., 20., 10., 10.],
                },
            ])]),
        };
        let mut associator = TrackAssociator::with_engine(Box::new(engine));
        assert!(associator.uses_engine());

        let tracked = associator
            .associate(&[det([0., 0., 10., 10.]), det([20., 20., 30., 30.])], &frame(0))
            .unwrap()
            .tracked;
        // duplicate id 5 and the unknown shape are dropped
        assert_eq!(tracked.len(), 2);
        assert_ne!(tracked[0].track_id, tracked[1].track_id);
        assert_eq!(tracked[1].bbox, BBox::new(20., 20., 30., 30.));
    }

    #[test]
    fn test_engine_holds_known_identity_with_bad_box() {
        let engine = ScriptedEngine {
            outputs: VecDeque::from(vec![
                Ok(vec![EngineOutput::Row(vec![0., 0., 10., 10., 1., 41.])]),
                Ok(vec![
                    EngineOutput::Row(vec![5., 5., 5., 5., 1., 41.]),
                    EngineOutput::Row(vec![5., 5., 5., 5., 8., 41.]),
                ]),
            ]),
        };
        let mut associator = TrackAssociator::with_engine(Box::new(engine));
        let d = [det([0., 0., 10., 10.])];
        let first = associator.associate(&d, &frame(0)).unwrap().tracked[0].track_id;

        let second = associator.associate(&d, &frame(1)).unwrap();
        assert!(second.tracked.is_empty());
        // id 8 was never seen with a usable box, so there is nothing to hold
        assert_eq!(second.held, vec![first]);
    }

    #[test]
    fn test_engine_ids_are_stable_until_retired() {
        let row = || EngineOutput::Row(vec![0., 0., 10., 10., 1., 41.]);
        let engine = ScriptedEngine {
            outputs: VecDeque::from(vec![
                Ok(vec![row()]),
                Ok(vec![row()]),
                Err(anyhow::anyhow!("reid model crashed")),
                Ok(vec![row()]),
            ]),
        };
        let mut associator = TrackAssociator::with_engine(Box::new(engine));
        let d = [det([0., 0., 10., 10.])];

        let first = associator.associate(&d, &frame(0)).unwrap().tracked[0].track_id;
        let second = associator.associate(&d, &frame(1)).unwrap().tracked[0].track_id;
        assert_eq!(first, second);

        assert!(associator.associate(&d, &frame(2)).is_err());

        associator.retire(&[first]);
        let third = associator.associate(&d, &frame(3)).unwrap().tracked[0].track_id;
        assert_ne!(third, first);
    }

    #[test]
    fn test_engine_failure_is_propagated() {
        let engine = ScriptedEngine {
            outputs: VecDeque::from(vec![Err(anyhow::anyhow!("boom"))]),
        };
        let mut associator = TrackAssociator::with_engine(Box::new(engine));
        let err = associator.associate(&[], &frame(0)).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_overlap_mode() {
        let mut associator = TrackAssociator::overlap(0.5);
        assert!(!associator.uses_engine());

        let a = associator
            .associate(&[det([0., 0., 10., 10.]), det([100., 100., 110., 110.])], &frame(0))
            .unwrap()
            .tracked;
        assert_eq!(a[0].track_id, TrackId(1));
        assert_eq!(a[1].track_id, TrackId(2));

        // small shift keeps the ids, a far box gets a new one
        let b = associator
            .associate(
                &[
                    det([101., 100., 111., 110.]),
                    det([1., 0., 11., 10.]),
                    det([300., 300., 310., 310.]),
                ],
                &frame(1),
            )
            .unwrap()
            .tracked;
        assert_eq!(b[0].track_id, TrackId(2));
        assert_eq!(b[1].track_id, TrackId(1));
        assert_eq!(b[2].track_id, TrackId(3));
    }

    #[test]
    fn test_overlap_claims_each_identity_once() {
        let mut associator = TrackAssociator::overlap(0.5);
        associator.associate(&[det([0., 0., 10., 10.])], &frame(0)).unwrap();

        let b = associator
            .associate(&[det([1., 0., 11., 10.]), det([0., 0., 10., 10.])], &frame(1))
            .unwrap()
            .tracked;
        // the exact overlap wins the old id
        assert_eq!(b[1].track_id, TrackId(1));
        assert_eq!(b[0].track_id, TrackId(2));
    }

    #[test]
    fn test_overlap_retired_identity_is_not_reused() {
        let mut associator = TrackAssociator::overlap(0.5);
        let d = [det([0., 0., 10., 10.])];
        let first = associator.associate(&d, &frame(0)).unwrap().tracked[0].track_id;
        associator.retire(&[first]);
        let again = associator.associate(&d, &frame(1)).unwrap().tracked[0].track_id;
        assert_ne!(first, again);
    }
}
