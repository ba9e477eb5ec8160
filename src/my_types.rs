use std::fmt;

use nalgebra as na;
use serde::{Deserialize, Serialize};

pub type Vector2d = na::Vector2<f64>;

/// Seconds, either wall clock or recording time.
pub type Timestamp = f64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
