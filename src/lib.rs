//! Knee flexion measurement from pose-estimation keypoints.
//!
//! Given a per-frame list of named, scored keypoints from an external pose
//! detector, this crate decides which leg to measure, validates that the
//! detection is anatomically plausible, computes the flexion angle, and
//! persists user-saved snapshots of achieved angles.

pub mod measure;
pub mod pipeline;
pub mod pose;
pub mod settings;
pub mod store;

pub use measure::{
    filter_side, select_knee_points, MeasureConfig, Measurement, Rejection, SidePreference,
};
pub use pipeline::{Frame, FrameSource, LatestMeasurement, MeasurementLoop, PoseDetector, RenderSink};
pub use pose::{Keypoint, KneeTriple, PixelPoint, Pose, Side};
pub use settings::{CameraFacing, SettingsStore};
pub use store::{snapshot_key, NewSnapshot, SnapshotEntry, SnapshotStore};
