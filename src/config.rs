use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context as AnyhowContext, Result};
use serde::Deserialize;

use crate::camera::CaptureSettings;
use crate::detector::DetectionFilter;
use crate::state::StatusThresholds;

/// Every tunable of the monitor. Usable as CLI flags or loaded from a JSON file;
/// fields missing from the file keep their defaults.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[derive(clap::Parser)]
#[serde(default)]
pub struct Config {
    /// Fill ratio below which a container is empty
    #[clap(long, default_value = "0.2")]
    pub empty_threshold: f64,

    /// Fill ratio above which a container is full
    #[clap(long, default_value = "0.8")]
    pub full_threshold: f64,

    /// Fill drop between two readings that counts as a sip
    #[clap(long, default_value = "0.1")]
    pub sip_threshold: f64,

    /// Number of sips after which a container is considered empty
    #[clap(long, default_value = "10")]
    pub sips_to_empty: u32,

    /// Box center displacement (pixels per frame) that counts as moving
    #[clap(long, default_value = "5.0")]
    pub movement_threshold: f64,

    /// Per-camera capture rate cap, 0 for unlimited
    #[clap(long, default_value = "0")]
    pub max_fps: f64,

    /// Minimum overlap for the fallback association to keep an identity
    #[clap(long, default_value = "0.5")]
    pub iou_threshold: f64,

    /// Seconds an unseen track survives before it is removed
    #[clap(long, default_value = "0")]
    pub reap_grace_secs: f64,

    /// Detector classes to keep, empty keeps all
    #[clap(long, value_delimiter = ',', default_values = &["39", "40", "41"])]
    pub allowed_classes: Vec<u32>,

    /// Minimum detector confidence
    #[clap(long, default_value = "0.25")]
    pub min_confidence: f64,

    /// Pause after a failed capture before retrying
    #[clap(long, default_value = "5")]
    pub retry_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let thresholds = StatusThresholds::default();
        let filter = DetectionFilter::default();
        Self {
            empty_threshold: thresholds.empty,
            full_threshold: thresholds.full,
            sip_threshold: thresholds.sip,
            sips_to_empty: thresholds.sips_to_empty,
            movement_threshold: thresholds.movement,
            max_fps: 0.,
            iou_threshold: 0.5,
            reap_grace_secs: 0.,
            allowed_classes: filter.allowed_classes,
            min_confidence: filter.min_confidence,
            retry_backoff_ms: 5,
        }
    }
}

impl Config {
    pub fn from_json_file(path: &Path) -> Result<Config> {
        let file = File::open(path).with_context(|| format!("cannot open config {}", path.display()))?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("empty_threshold", self.empty_threshold),
            ("full_threshold", self.full_threshold),
            ("sip_threshold", self.sip_threshold),
            ("iou_threshold", self.iou_threshold),
            ("min_confidence", self.min_confidence),
        ] {
            if !(0. ..=1.).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.empty_threshold >= self.full_threshold {
            bail!(
                "empty_threshold ({}) must be below full_threshold ({})",
                self.empty_threshold,
                self.full_threshold
            );
        }
        // a zero threshold would count every unchanged reading as a sip
        if self.sip_threshold <= 0. {
            bail!("sip_threshold must be positive, got {}", self.sip_threshold);
        }
        if self.sips_to_empty == 0 {
            bail!("sips_to_empty must be at least 1");
        }
        for (name, value) in [
            ("movement_threshold", self.movement_threshold),
            ("max_fps", self.max_fps),
            ("reap_grace_secs", self.reap_grace_secs),
        ] {
            if !value.is_finite() || value < 0. {
                bail!("{name} must be a non-negative number, got {value}");
            }
        }
        Ok(())
    }

    pub fn thresholds(&self) -> StatusThresholds {
        StatusThresholds {
            empty: self.empty_threshold,
            full: self.full_threshold,
            sip: self.sip_threshold,
            sips_to_empty: self.sips_to_empty,
            movement: self.movement_threshold,
        }
    }

    pub fn detection_filter(&self) -> DetectionFilter {
        DetectionFilter {
            allowed_classes: self.allowed_classes.clone(),
            min_confidence: self.min_confidence,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_fps: self.max_fps,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}
