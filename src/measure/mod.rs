//! Knee flexion measurement: angle math and per-frame leg selection.

pub mod geometry;
mod selector;

pub use selector::{filter_side, select_knee_points, Rejection, SideTriple};

use serde::{Deserialize, Serialize};

use crate::pose::KneeTriple;

/// Which leg the user wants measured. `Auto` lets the selector choose the
/// better-tracked, more-bent side each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SidePreference {
    Auto,
    Left,
    Right,
}

impl SidePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            SidePreference::Auto => "AUTO",
            SidePreference::Left => "LEFT",
            SidePreference::Right => "RIGHT",
        }
    }
}

impl Default for SidePreference {
    fn default() -> Self {
        SidePreference::Left
    }
}

/// Tunable measurement thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureConfig {
    /// Per-keypoint detector confidence threshold. The selection gate is
    /// derived from this (see [`selector`] constants).
    pub score_threshold: f64,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.3,
        }
    }
}

/// One frame's accepted measurement. Ephemeral; persisted only when the
/// user snapshots it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub points: KneeTriple,
    /// Interior angle at the knee, computed from raw (unrounded) keypoints.
    pub angle_deg: f64,
    /// Flexion as deviation from full extension: `round(180 - angle_deg)`.
    pub display_angle: i32,
    /// Summed keypoint scores of the measured triple.
    pub confidence: f64,
}
