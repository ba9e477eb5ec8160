use std::collections::HashSet;

use tracing::{debug, instrument};

use crate::my_types::*;
use crate::state::{Track, TrackStore};

/// Evicts tracks that dropped out of the active set.
#[derive(Clone, Copy, Debug, Default)]
pub struct Reaper {
    /// Seconds a track may stay unseen before it is removed; 0 removes it on
    /// the first cycle it is missing.
    pub grace_period: f64,
}

impl Reaper {
    pub fn new(grace_period: f64) -> Self {
        Self {
            grace_period: grace_period.max(0.),
        }
    }

    /// Remove every track absent from `active` for at least the grace period.
    /// Returns the removed tracks with their final "removed" event.
    #[instrument(level = "debug", skip_all, fields(active = active.len()))]
    pub fn sweep(&self, store: &mut TrackStore, active: &HashSet<TrackId>, now: Timestamp) -> Vec<Track> {
        let expired: Vec<TrackId> = store
            .tracks()
            .filter(|t| !active.contains(&t.track_id))
            .filter(|t| now - t.last_seen >= self.grace_period)
            .map(|t| t.track_id)
            .collect();

        let removed: Vec<Track> = expired
            .into_iter()
            .filter_map(|id| store.evict(id, now))
            .collect();
        if !removed.is_empty() {
            debug!(removed = removed.len(), remaining = store.len(), "reaped tracks");
        }
        removed
    }
}
