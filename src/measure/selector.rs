use crate::pose::{Keypoint, KneeTriple, PixelPoint, Side};

use super::geometry::{self, distance, sum_scores};
use super::{Measurement, SidePreference};

/// The selection gate is the per-keypoint threshold scaled for three points,
/// with headroom.
pub const GATE_SCORE_MULTIPLIER: f64 = 3.5;

/// Flexion beyond this is anatomically implausible: the hip and ankle
/// directions nearly coincide, which in practice means the detector latched
/// onto background geometry rather than a leg.
pub const MAX_FLEXION_DEG: f64 = 170.0;

/// Hip↔knee and knee↔ankle should be of similar length. A ratio below this
/// means the detector has likely conflated two unrelated points.
pub const SEGMENT_RATIO_MIN: f64 = 0.2;

/// AUTO mode picks the side whose interior angle is closest to this: among
/// two well-tracked legs, the more bent one is the one being measured.
pub const AUTO_REFERENCE_ANGLE_DEG: f64 = 70.0;

/// Why a frame yielded no measurement. All variants are non-fatal skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The detector produced no usable triple for the requested side(s).
    NoKeypoints,
    /// Summed confidence did not clear the gate.
    BelowConfidence,
    /// Straight-segment or segment-ratio sanity check failed.
    GeometricImplausible,
    /// The angle is undefined (coincident points). Treated like a frame
    /// with no keypoints.
    NumericDegenerate,
}

/// Raw hip/knee/ankle keypoints for one side, in that fixed order.
#[derive(Debug, Clone, Copy)]
pub struct SideTriple<'a> {
    pub hip: &'a Keypoint,
    pub knee: &'a Keypoint,
    pub ankle: &'a Keypoint,
}

impl SideTriple<'_> {
    pub fn score_sum(&self) -> f64 {
        sum_scores([self.hip, self.knee, self.ankle])
    }

    pub fn interior_angle_deg(&self) -> Option<f64> {
        geometry::interior_angle_deg(self.hip, self.knee, self.ankle)
    }

    /// Integer-pixel form for overlay drawing and storage.
    pub fn rounded(&self) -> KneeTriple {
        KneeTriple {
            hip: PixelPoint::from_keypoint(self.hip),
            knee: PixelPoint::from_keypoint(self.knee),
            ankle: PixelPoint::from_keypoint(self.ankle),
        }
    }
}

/// Extract the hip/knee/ankle keypoints for one side, reordering as needed.
/// `None` when any of the three landmarks is missing.
pub fn filter_side(keypoints: &[Keypoint], side: Side) -> Option<SideTriple<'_>> {
    let [hip, knee, ankle] = side.landmark_names();
    let find = |name: &str| keypoints.iter().find(|kp| kp.name == name);

    Some(SideTriple {
        hip: find(hip)?,
        knee: find(knee)?,
        ankle: find(ankle)?,
    })
}

/// Decide which leg this frame measures and compute its flexion.
///
/// Confidence gating uses a strict comparison against
/// `score_threshold * GATE_SCORE_MULTIPLIER`; the anatomical sanity checks
/// apply to the surviving triple regardless of preference mode.
pub fn select_knee_points(
    keypoints: &[Keypoint],
    preference: SidePreference,
    score_threshold: f64,
) -> Result<Measurement, Rejection> {
    let left = filter_side(keypoints, Side::Left);
    let right = filter_side(keypoints, Side::Right);
    if left.is_none() && right.is_none() {
        return Err(Rejection::NoKeypoints);
    }

    let gate = score_threshold * GATE_SCORE_MULTIPLIER;

    let chosen = match preference {
        SidePreference::Left => gated(left, gate)?,
        SidePreference::Right => gated(right, gate)?,
        SidePreference::Auto => {
            let left_pass = left.filter(|t| t.score_sum() > gate);
            let right_pass = right.filter(|t| t.score_sum() > gate);
            match (left_pass, right_pass) {
                (None, None) => return Err(Rejection::BelowConfidence),
                (Some(t), None) | (None, Some(t)) => t,
                (Some(l), Some(r)) => closest_to_reference(l, r)?,
            }
        }
    };

    let angle_deg = chosen
        .interior_angle_deg()
        .ok_or(Rejection::NumericDegenerate)?;

    // Not a legit angle.
    if 180.0 - angle_deg > MAX_FLEXION_DEG {
        return Err(Rejection::GeometricImplausible);
    }

    // The hip-knee and knee-ankle distances should be similar. If one is
    // substantially smaller, it's probably combining points, so throw it out.
    let d1 = distance(chosen.hip, chosen.knee);
    let d2 = distance(chosen.knee, chosen.ankle);
    if d1.min(d2) / d1.max(d2) < SEGMENT_RATIO_MIN {
        return Err(Rejection::GeometricImplausible);
    }

    Ok(Measurement {
        points: chosen.rounded(),
        angle_deg,
        display_angle: geometry::display_angle(angle_deg),
        confidence: chosen.score_sum(),
    })
}

fn gated(triple: Option<SideTriple<'_>>, gate: f64) -> Result<SideTriple<'_>, Rejection> {
    let triple = triple.ok_or(Rejection::NoKeypoints)?;
    if triple.score_sum() > gate {
        Ok(triple)
    } else {
        Err(Rejection::BelowConfidence)
    }
}

fn closest_to_reference<'a>(
    left: SideTriple<'a>,
    right: SideTriple<'a>,
) -> Result<SideTriple<'a>, Rejection> {
    match (left.interior_angle_deg(), right.interior_angle_deg()) {
        (Some(la), Some(ra)) => {
            if (AUTO_REFERENCE_ANGLE_DEG - la).abs() <= (AUTO_REFERENCE_ANGLE_DEG - ra).abs() {
                Ok(left)
            } else {
                Ok(right)
            }
        }
        (Some(_), None) => Ok(left),
        (None, Some(_)) => Ok(right),
        (None, None) => Err(Rejection::NumericDegenerate),
    }
}
