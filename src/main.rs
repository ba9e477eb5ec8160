use anyhow::{bail, Context as AnyhowContext, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use indicatif::ProgressStyle;
use tracing::info_span;
use tracing::Span;
use tracing::{info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter::LevelFilter, prelude::*};

use beverage_monitor::camera::*;
use beverage_monitor::config::*;
use beverage_monitor::dataset::*;
use beverage_monitor::pipeline::Pipeline;
use beverage_monitor::tracker::TrackAssociator;
use beverage_monitor::visualization::*;

#[derive(Parser)]
pub struct Args {
    /// JSON-lines perception recording to replay
    #[clap(short, default_value = "./data/recording.jsonl")]
    pub input: PathBuf,
    #[clap(long, default_value = "cam1")]
    pub camera_id: String,
    /// Playback rate relative to the recorded timestamps, 0 replays as fast as
    /// possible and may skip frames
    #[clap(long, default_value = "1.0")]
    pub replay_speed: f64,
    /// Read the configuration from a JSON file instead of the flags below
    #[clap(long)]
    pub config_file: Option<PathBuf>,
    /// Write snapshots here instead of stdout
    #[clap(long)]
    pub output: Option<PathBuf>,
    /// Also record track overlays to this .rrd file
    #[cfg(feature = "rerun")]
    #[clap(long)]
    pub rerun: Option<PathBuf>,
    /// Only check a live source: capture for a while and report the frame rate
    #[cfg(feature = "opencv")]
    #[clap(long)]
    pub source: Option<CameraSource>,
    #[cfg(feature = "opencv")]
    #[clap(long, default_value = "10")]
    pub duration_secs: u64,
    #[clap(long, default_value = "info")]
    pub log_level: tracing::Level,
    #[clap(flatten)]
    pub config: Config,
}

fn main() -> Result<()> {
    // parse the config
    let args = Args::parse();
    let config = match &args.config_file {
        Some(path) => Config::from_json_file(path)?,
        None => {
            args.config.validate()?;
            args.config.clone()
        }
    };

    // setup logging
    let indicatif_layer = IndicatifLayer::new();
    let stdout = indicatif_layer.get_stdout_writer();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stdout_writer())
                .with_filter(LevelFilter::from_level(args.log_level)),
        )
        .with(indicatif_layer)
        .init();

    #[cfg(feature = "opencv")]
    if let Some(source) = &args.source {
        return check_live_source(&args.camera_id, source, &config, args.duration_secs);
    }

    // load recording
    let recording = Recording::load(&args.input)?;
    if recording.is_empty() {
        bail!("recording {} has no frames", args.input.display());
    }

    let mut sinks: Vec<Box<dyn SnapshotSink>> = vec![];
    match &args.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
            sinks.push(Box::new(JsonLinesSink::new(BufWriter::new(file))));
        }
        None => sinks.push(Box::new(JsonLinesSink::new(stdout))),
    }
    #[cfg(feature = "rerun")]
    if let Some(path) = &args.rerun {
        sinks.push(Box::new(RerunSink::save(path)?));
    }

    // the recording plays the camera, the detector, the engine and the segmenter
    let mut registry = CameraRegistry::new();
    registry.add(Camera::new(
        &args.camera_id,
        CameraSource::Url(args.input.display().to_string()),
        Box::new(recording.source().paced(args.replay_speed)),
        config.capture_settings(),
    ))?;
    let buffer = registry.buffer(&args.camera_id)?;

    let associator = if recording.has_engine_outputs() {
        TrackAssociator::with_engine(Box::new(recording.engine()))
    } else {
        info!("recording has no engine output, associating by overlap");
        TrackAssociator::overlap(config.iou_threshold)
    };
    let mut pipeline = Pipeline::new(
        &args.camera_id,
        &config,
        associator,
        Box::new(recording.fill_estimator()),
    );
    let mut detector = recording.detector();

    let header_span = info_span!("header");
    header_span.pb_set_style(&ProgressStyle::default_bar());
    header_span.pb_set_length(recording.len() as u64);
    let header_span_enter = header_span.enter();

    registry.start(&args.camera_id)?;
    let last = recording.len() as u64 - 1;
    let mut alerts = 0;
    while pipeline.last_sequence() != Some(last) {
        let before = pipeline.last_sequence().map_or(0, |s| s + 1);
        let Some(snapshot) = pipeline.poll(&buffer, &mut detector) else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        Span::current().pb_inc(snapshot.sequence + 1 - before);
        alerts += snapshot.alerts.len();
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.publish(&snapshot) {
                warn!("failed to publish snapshot {}: {err:#}", snapshot.sequence);
            }
        }
    }
    registry.stop_all();

    std::mem::drop(header_span_enter);
    std::mem::drop(header_span);

    info!(
        frames = recording.len(),
        captured = buffer.published_count(),
        live_tracks = pipeline.store().len(),
        alerts,
        "replay finished"
    );
    Ok(())
}

#[cfg(feature = "opencv")]
fn check_live_source(camera_id: &str, source: &CameraSource, config: &Config, duration_secs: u64) -> Result<()> {
    use beverage_monitor::capture::VideoCaptureSource;

    let frame_source = VideoCaptureSource::open(source)?;
    let mut camera = Camera::new(camera_id, source.clone(), Box::new(frame_source), config.capture_settings());
    camera.start()?;
    thread::sleep(Duration::from_secs(duration_secs));
    camera.stop();

    let buffer = camera.buffer();
    let frames = buffer.published_count();
    let latest = camera.latest();
    info!(
        frames,
        fps = frames as f64 / duration_secs.max(1) as f64,
        width = ?latest.as_ref().map(|f| f.width()),
        height = ?latest.as_ref().map(|f| f.height()),
        "live source check finished"
    );
    if frames == 0 {
        bail!("{source} delivered no frames in {duration_secs}s");
    }
    Ok(())
}
