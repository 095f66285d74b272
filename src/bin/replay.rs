//! Replay a recorded pose trace through the measurement pipeline.
//!
//! The trace is a JSON array with one element per frame, each element being
//! the detector's pose list for that frame. Frames themselves are synthesized
//! (there is no camera here); the accepted measurement of the final frame is
//! saved as a snapshot so the whole store path gets exercised.
//!
//! Usage: `replay <trace.json> [data-dir]`

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use image::{ImageFormat, RgbaImage};
use log::info;

use flexion::{
    Frame, FrameSource, MeasureConfig, MeasurementLoop, Measurement, NewSnapshot, Pose,
    PoseDetector, RenderSink, SettingsStore, SnapshotStore,
};

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;

struct TraceSource {
    remaining: usize,
    frame: Frame,
}

impl FrameSource for TraceSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.frame.clone())
    }
}

struct TraceDetector {
    frames: VecDeque<Vec<Pose>>,
}

impl PoseDetector for TraceDetector {
    async fn estimate_poses(&mut self, _frame: &Frame) -> Result<Vec<Pose>> {
        Ok(self.frames.pop_front().unwrap_or_default())
    }
}

struct LogSink {
    frame_no: usize,
}

impl RenderSink for LogSink {
    fn render(&mut self, _frame: &Frame, poses: &[Pose], measurement: Option<&Measurement>) {
        self.frame_no += 1;
        match measurement {
            Some(m) => info!(
                "frame {}: {}deg / {:.3}",
                self.frame_no, m.display_angle, m.confidence
            ),
            None => info!(
                "frame {}: no measurement ({} poses)",
                self.frame_no,
                poses.len()
            ),
        }
    }
}

fn blank_frame() -> Result<Frame> {
    let img = RgbaImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, image::Rgba([24, 24, 24, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .context("failed to encode synthetic frame")?;
    Ok(Frame {
        image: buf.into_inner(),
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let trace_path = args
        .next()
        .context("usage: replay <trace.json> [data-dir]")?;
    let data_dir = PathBuf::from(args.next().unwrap_or_else(|| "flexion-data".into()));
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    let trace = std::fs::read_to_string(&trace_path)
        .with_context(|| format!("failed to read trace {trace_path}"))?;
    let frames: Vec<Vec<Pose>> =
        serde_json::from_str(&trace).context("trace is not a JSON array of pose lists")?;
    info!("replaying {} frames from {trace_path}", frames.len());

    let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
    let store = SnapshotStore::new(data_dir.join("snapshots.sqlite"))?;

    let source = TraceSource {
        remaining: frames.len(),
        frame: blank_frame()?,
    };
    let mut script = Some(TraceDetector {
        frames: frames.into(),
    });
    let builder = move || script.take().context("detector already failed once");

    let pipeline = MeasurementLoop::new(
        source,
        builder,
        LogSink { frame_no: 0 },
        settings.clone(),
        MeasureConfig::default(),
    );
    let latest = pipeline.latest();
    pipeline.run().await?;

    match latest.get() {
        Some((frame, measurement)) => {
            let key = store
                .put(NewSnapshot {
                    image: frame.image,
                    measurement,
                    recorded_at: Utc::now(),
                    camera: settings.camera_facing(),
                })
                .await?;
            info!("saved snapshot {key}");
        }
        None => info!("trace produced no accepted measurement; nothing saved"),
    }

    for entry in store.get_entries().await? {
        info!(
            "stored: {} ({}x{}, confidence {:.3})",
            entry.key, entry.width, entry.height, entry.confidence
        );
    }

    Ok(())
}
