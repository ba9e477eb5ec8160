use std::io::Write;

use anyhow::Result;

use crate::pipeline::FrameSnapshot;

/// Downstream consumer of per-frame track snapshots (overlay, alerting, logs).
pub trait SnapshotSink {
    fn publish(&mut self, snapshot: &FrameSnapshot) -> Result<()>;
}

/// One JSON object per processed frame.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &FrameSnapshot) -> Result<()> {
        serde_json::to_writer(&mut self.writer, snapshot)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Logs track boxes, labels and refill alerts into a rerun recording.
#[cfg(feature = "rerun")]
pub struct RerunSink {
    recorder: rerun::RecordingStream,
}

#[cfg(feature = "rerun")]
impl RerunSink {
    pub fn save(path: &std::path::Path) -> Result<Self> {
        let recorder = rerun::RecordingStreamBuilder::new("beverage-monitor").save(path)?;
        Ok(Self { recorder })
    }
}

#[cfg(feature = "rerun")]
impl SnapshotSink for RerunSink {
    fn publish(&mut self, snapshot: &FrameSnapshot) -> Result<()> {
        self.recorder
            .set_time_seconds("capture_time", snapshot.captured_at);

        let tracks: Vec<_> = snapshot.tracks.values().collect();
        let mins = tracks
            .iter()
            .map(|t| (t.bbox.x1 as f32, t.bbox.y1 as f32));
        let sizes = tracks
            .iter()
            .map(|t| (t.bbox.width() as f32, t.bbox.height() as f32));
        let labels = tracks.iter().map(|t| {
            let fill = t
                .fill_ratio
                .map(|f| format!("{:.0}%", f * 100.))
                .unwrap_or_else(|| "?".to_string());
            format!("ID {} - {:?} - Fill: {} - sips {}", t.track_id, t.status, fill, t.sip_count)
        });
        self.recorder.log(
            format!("camera/{}/tracks", snapshot.camera_id),
            &rerun::Boxes2D::from_mins_and_sizes(mins, sizes).with_labels(labels),
        )?;

        for alert in &snapshot.alerts {
            self.recorder.log(
                format!("camera/{}/alerts", snapshot.camera_id),
                &rerun::TextLog::new(format!("track {} needs refill", alert.track_id)),
            )?;
        }
        Ok(())
    }
}
