//! Per-frame measurement loop.
//!
//! One frame is processed at a time: the next frame is requested only after
//! the current pass completes, so there is never an overlapping invocation.
//! The detector call is the only suspension point in a pass. A failing
//! detector is discarded and rebuilt on the next frame; the failed frame is
//! not retried.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::measure::{select_knee_points, MeasureConfig, Measurement, Rejection};
use crate::pose::Pose;
use crate::settings::SettingsStore;

/// A camera frame handle: encoded pixels plus dimensions. The pipeline never
/// inspects the pixels; they ride along for overlay rendering and snapshots.
#[derive(Debug, Clone)]
pub struct Frame {
    /// PNG-encoded frame contents.
    pub image: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Supplies frames to the loop. Camera acquisition lives behind this seam.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    /// The next frame, or `None` when the stream ends.
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// The external pose-estimation collaborator.
#[allow(async_fn_in_trait)]
pub trait PoseDetector {
    async fn estimate_poses(&mut self, frame: &Frame) -> Result<Vec<Pose>>;
}

/// Receives every processed frame for display. Drawing is out of scope here;
/// implementations get the frame, the raw poses and the frame's accepted
/// measurement (if any) and do what they like with them.
pub trait RenderSink {
    fn render(&mut self, frame: &Frame, poses: &[Pose], measurement: Option<&Measurement>);
}

/// Shared handle to the most recent accepted measurement and the frame it
/// was taken from. Rejected frames leave it untouched, so save/display
/// actions always see the last good pose.
#[derive(Clone, Default)]
pub struct LatestMeasurement {
    inner: Arc<Mutex<Option<(Frame, Measurement)>>>,
}

impl LatestMeasurement {
    pub fn get(&self) -> Option<(Frame, Measurement)> {
        self.inner.lock().unwrap().clone()
    }

    fn set(&self, frame: Frame, measurement: Measurement) {
        *self.inner.lock().unwrap() = Some((frame, measurement));
    }
}

pub struct MeasurementLoop<S, D, B, R>
where
    S: FrameSource,
    D: PoseDetector,
    B: FnMut() -> Result<D>,
    R: RenderSink,
{
    source: S,
    build_detector: B,
    detector: Option<D>,
    sink: R,
    settings: Arc<SettingsStore>,
    config: MeasureConfig,
    latest: LatestMeasurement,
    cancel: CancellationToken,
    in_flight: bool,
}

impl<S, D, B, R> MeasurementLoop<S, D, B, R>
where
    S: FrameSource,
    D: PoseDetector,
    B: FnMut() -> Result<D>,
    R: RenderSink,
{
    pub fn new(
        source: S,
        build_detector: B,
        sink: R,
        settings: Arc<SettingsStore>,
        config: MeasureConfig,
    ) -> Self {
        Self {
            source,
            build_detector,
            detector: None,
            sink,
            settings,
            config,
            latest: LatestMeasurement::default(),
            cancel: CancellationToken::new(),
            in_flight: false,
        }
    }

    /// Token that stops the loop between frames.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for reading the last good measurement from outside the loop.
    pub fn latest(&self) -> LatestMeasurement {
        self.latest.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("measurement loop shutting down");
                    break;
                }
                frame = self.source.next_frame() => match frame {
                    Some(frame) => frame,
                    None => {
                        info!("frame source exhausted");
                        break;
                    }
                },
            };

            self.process_frame(frame).await;
        }

        Ok(())
    }

    async fn process_frame(&mut self, frame: Frame) {
        // Single-flight invariant: the scheduler never overlaps passes.
        assert!(!self.in_flight, "overlapping frame-processing passes");
        self.in_flight = true;
        self.process_frame_inner(frame).await;
        self.in_flight = false;
    }

    async fn process_frame_inner(&mut self, frame: Frame) {
        if self.detector.is_none() {
            match (self.build_detector)() {
                Ok(detector) => self.detector = Some(detector),
                Err(err) => {
                    warn!("detector construction failed: {err:?}");
                    return;
                }
            }
        }
        let Some(detector) = self.detector.as_mut() else {
            return;
        };

        let poses = match detector.estimate_poses(&frame).await {
            Ok(poses) => poses,
            Err(err) => {
                // No retry of this frame; a fresh detector serves the next one.
                warn!("pose detection failed, discarding detector: {err:?}");
                self.detector = None;
                return;
            }
        };

        let selected = Pose::primary(&poses)
            .map(|pose| {
                select_knee_points(
                    &pose.keypoints,
                    self.settings.side_preference(),
                    self.config.score_threshold,
                )
            })
            .unwrap_or(Err(Rejection::NoKeypoints));

        let measurement = match selected {
            Ok(measurement) => {
                self.latest.set(frame.clone(), measurement.clone());
                Some(measurement)
            }
            Err(reason) => {
                debug!("frame yielded no measurement: {reason:?}");
                None
            }
        };

        self.sink.render(&frame, &poses, measurement.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::Keypoint;
    use anyhow::{bail, Context};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame() -> Frame {
        Frame {
            image: Vec::new(),
            width: 640,
            height: 480,
        }
    }

    fn bent_left_leg() -> Vec<Keypoint> {
        vec![
            Keypoint::new("left_hip", 200.0, 100.0, 0.9),
            Keypoint::new("left_knee", 200.0, 200.0, 0.9),
            Keypoint::new("left_ankle", 300.0, 200.0, 0.9),
        ]
    }

    struct ScriptedSource {
        frames: VecDeque<Frame>,
    }

    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Option<Frame> {
            self.frames.pop_front()
        }
    }

    /// Source that never yields, for cancellation tests.
    struct PendingSource;

    impl FrameSource for PendingSource {
        async fn next_frame(&mut self) -> Option<Frame> {
            std::future::pending().await
        }
    }

    enum Response {
        Poses(Vec<Pose>),
        Fail,
    }

    struct ScriptedDetector {
        responses: VecDeque<Response>,
    }

    impl PoseDetector for ScriptedDetector {
        async fn estimate_poses(&mut self, _frame: &Frame) -> Result<Vec<Pose>> {
            match self.responses.pop_front() {
                Some(Response::Poses(poses)) => Ok(poses),
                Some(Response::Fail) => bail!("backend lost the model"),
                None => Ok(Vec::new()),
            }
        }
    }

    #[derive(Clone, Default)]
    struct CollectSink {
        rendered: Arc<Mutex<Vec<Option<i32>>>>,
    }

    impl RenderSink for CollectSink {
        fn render(&mut self, _frame: &Frame, _poses: &[Pose], measurement: Option<&Measurement>) {
            self.rendered
                .lock()
                .unwrap()
                .push(measurement.map(|m| m.display_angle));
        }
    }

    fn test_settings() -> Arc<SettingsStore> {
        let path = std::env::temp_dir()
            .join(format!("flexion-pipeline-{}.json", uuid::Uuid::new_v4()));
        Arc::new(SettingsStore::new(path).unwrap())
    }

    fn pose_with(keypoints: Vec<Keypoint>) -> Vec<Pose> {
        vec![Pose {
            keypoints,
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn failed_detector_is_rebuilt_without_retrying_the_frame() {
        let source = ScriptedSource {
            frames: VecDeque::from([frame(), frame()]),
        };
        let mut detectors = VecDeque::from([
            ScriptedDetector {
                responses: VecDeque::from([Response::Fail]),
            },
            ScriptedDetector {
                responses: VecDeque::from([Response::Poses(pose_with(bent_left_leg()))]),
            },
        ]);
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_seen = builds.clone();
        let builder = move || {
            builds.fetch_add(1, Ordering::SeqCst);
            detectors.pop_front().context("detector script exhausted")
        };

        let sink = CollectSink::default();
        let rendered = sink.rendered.clone();
        let pipeline = MeasurementLoop::new(
            source,
            builder,
            sink,
            test_settings(),
            MeasureConfig::default(),
        );
        let latest = pipeline.latest();
        pipeline.run().await.unwrap();

        assert_eq!(builds_seen.load(Ordering::SeqCst), 2);
        // Frame 1 was dropped with the broken detector; frame 2 measured 90°.
        assert_eq!(*rendered.lock().unwrap(), vec![Some(90)]);
        assert_eq!(latest.get().unwrap().1.display_angle, 90);
    }

    #[tokio::test]
    async fn last_good_measurement_survives_rejected_frames() {
        let source = ScriptedSource {
            frames: VecDeque::from([frame(), frame()]),
        };
        let mut detectors = VecDeque::from([ScriptedDetector {
            responses: VecDeque::from([
                Response::Poses(pose_with(bent_left_leg())),
                Response::Poses(Vec::new()),
            ]),
        }]);
        let builder = move || detectors.pop_front().context("detector script exhausted");

        let sink = CollectSink::default();
        let rendered = sink.rendered.clone();
        let pipeline = MeasurementLoop::new(
            source,
            builder,
            sink,
            test_settings(),
            MeasureConfig::default(),
        );
        let latest = pipeline.latest();
        pipeline.run().await.unwrap();

        assert_eq!(*rendered.lock().unwrap(), vec![Some(90), None]);
        assert_eq!(latest.get().unwrap().1.display_angle, 90);
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_loop() {
        let mut detectors = VecDeque::from([ScriptedDetector {
            responses: VecDeque::new(),
        }]);
        let builder = move || detectors.pop_front().context("detector script exhausted");

        let pipeline = MeasurementLoop::new(
            PendingSource,
            builder,
            CollectSink::default(),
            test_settings(),
            MeasureConfig::default(),
        );
        let token = pipeline.cancellation_token();
        token.cancel();

        pipeline.run().await.unwrap();
    }
}
