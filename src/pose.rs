use serde::{Deserialize, Serialize};

/// A single named, scored landmark as produced by a pose detector.
///
/// Coordinates are in pixel space of the source frame. `z` is only present
/// for detectors that estimate depth; this crate ignores it for measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub name: String,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    /// Detector-assigned confidence in [0, 1].
    pub score: f64,
}

impl Keypoint {
    pub fn new(name: impl Into<String>, x: f64, y: f64, score: f64) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            z: None,
            score,
        }
    }
}

/// Normalized per-frame detector output.
///
/// Detector backends differ in keypoint sets, 2D vs. 3D output and tracking
/// ids; everything downstream of the ingestion boundary sees only this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints_3d: Option<Vec<Keypoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl Pose {
    /// The pose the measurement pipeline tracks. Single-person use case:
    /// always the first detected pose, as the original demo did.
    pub fn primary(poses: &[Pose]) -> Option<&Pose> {
        poses.first()
    }
}

/// Body side of the leg being measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Landmark names for this side, in hip → knee → ankle order.
    pub fn landmark_names(self) -> [&'static str; 3] {
        match self {
            Side::Left => ["left_hip", "left_knee", "left_ankle"],
            Side::Right => ["right_hip", "right_knee", "right_ankle"],
        }
    }
}

/// A keypoint rounded to integer pixel coordinates for overlay and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    pub fn from_keypoint(kp: &Keypoint) -> Self {
        Self {
            x: kp.x.round() as i32,
            y: kp.y.round() as i32,
        }
    }
}

/// The hip/knee/ankle points of one leg, always in that order.
///
/// The knee is the vertex for angle computation. Coordinates are rounded;
/// the flexion angle itself is computed from raw keypoints before rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KneeTriple {
    pub hip: PixelPoint,
    pub knee: PixelPoint,
    pub ankle: PixelPoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landmark_names_are_ordered_hip_knee_ankle() {
        assert_eq!(
            Side::Left.landmark_names(),
            ["left_hip", "left_knee", "left_ankle"]
        );
        assert_eq!(
            Side::Right.landmark_names(),
            ["right_hip", "right_knee", "right_ankle"]
        );
    }

    #[test]
    fn pixel_point_rounds_to_nearest() {
        let kp = Keypoint::new("left_knee", 10.6, 20.4, 0.9);
        let px = PixelPoint::from_keypoint(&kp);
        assert_eq!(px, PixelPoint { x: 11, y: 20 });
    }

    #[test]
    fn primary_pose_is_first() {
        let poses = vec![
            Pose {
                id: Some(7),
                ..Default::default()
            },
            Pose {
                id: Some(8),
                ..Default::default()
            },
        ];
        assert_eq!(Pose::primary(&poses).and_then(|p| p.id), Some(7));
        assert!(Pose::primary(&[]).is_none());
    }
}
