use crate::pose::{Keypoint, PixelPoint};

pub const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// Interior angle at the knee vertex, in degrees.
///
/// Forms the vectors knee→hip and knee→ankle and takes
/// `acos(dot / (|v1||v2|))`. Returns `None` when either vector has zero
/// magnitude (coincident points), where the ratio is undefined; NaN never
/// escapes into display logic.
pub fn interior_angle_deg(hip: &Keypoint, knee: &Keypoint, ankle: &Keypoint) -> Option<f64> {
    let v1 = (hip.x - knee.x, hip.y - knee.y);
    let v2 = (ankle.x - knee.x, ankle.y - knee.y);

    let dot = v1.0 * v2.0 + v1.1 * v2.1;
    let mag1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
    let mag2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();

    let cosine = dot / (mag1 * mag2);
    if cosine.is_nan() {
        return None;
    }

    // Rounded inputs can push the ratio marginally outside [-1, 1].
    Some(cosine.clamp(-1.0, 1.0).acos() * RAD_TO_DEG)
}

/// Flexion shown to the user: deviation from full extension (180°).
pub fn display_angle(interior_deg: f64) -> i32 {
    (180.0 - interior_deg).round() as i32
}

/// Bearing of the segment p1→p2 in radians, for overlay arc drawing only.
/// Never used for the authoritative flexion measurement.
pub fn bearing_angle_rad(p1: PixelPoint, p2: PixelPoint) -> f64 {
    let dx = (p2.x - p1.x) as f64;
    let dy = (p2.y - p1.y) as f64;
    dy.atan2(dx)
}

/// Euclidean distance between two keypoints.
pub fn distance(a: &Keypoint, b: &Keypoint) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    (dx * dx + dy * dy).sqrt()
}

/// Summed detector confidence across a set of points. Doubles as the
/// measurement's confidence figure and as the selection gate criterion.
pub fn sum_scores<'a>(points: impl IntoIterator<Item = &'a Keypoint>) -> f64 {
    points.into_iter().map(|kp| kp.score).sum()
}
