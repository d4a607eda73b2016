//! Synthetic faces for unit tests.

use crate::landmarks::{Landmark, LandmarkSet, LandmarkTable, Point3, MEDIAPIPE_LANDMARK_COUNT};

const BASE: [(Landmark, [f32; 3]); Landmark::COUNT] = [
    (Landmark::LeftEyeOuter, [0.30, 0.40, 0.00]),
    (Landmark::LeftEyeInner, [0.42, 0.40, 0.01]),
    (Landmark::RightEyeOuter, [0.70, 0.40, 0.00]),
    (Landmark::RightEyeInner, [0.58, 0.40, 0.01]),
    (Landmark::LeftEyeTop, [0.36, 0.38, 0.00]),
    (Landmark::LeftEyeBottom, [0.36, 0.42, 0.00]),
    (Landmark::RightEyeTop, [0.64, 0.38, 0.00]),
    (Landmark::RightEyeBottom, [0.64, 0.42, 0.00]),
    (Landmark::NoseTip, [0.50, 0.55, -0.05]),
    (Landmark::NoseBridge, [0.50, 0.42, -0.02]),
    (Landmark::LeftMouth, [0.40, 0.68, 0.00]),
    (Landmark::RightMouth, [0.60, 0.68, 0.00]),
    (Landmark::MouthTop, [0.50, 0.66, -0.01]),
    (Landmark::MouthBottom, [0.50, 0.71, -0.01]),
    (Landmark::LeftCheek, [0.22, 0.52, 0.05]),
    (Landmark::RightCheek, [0.78, 0.52, 0.05]),
    (Landmark::Chin, [0.50, 0.88, 0.00]),
    (Landmark::Forehead, [0.50, 0.15, 0.00]),
    (Landmark::LeftEyebrowInner, [0.40, 0.33, 0.00]),
    (Landmark::LeftEyebrowOuter, [0.28, 0.34, 0.00]),
    (Landmark::RightEyebrowInner, [0.60, 0.33, 0.00]),
    (Landmark::RightEyebrowOuter, [0.72, 0.34, 0.00]),
];

fn build(adjust: impl Fn(usize, Landmark, [f32; 3]) -> [f32; 3]) -> LandmarkSet {
    let table = LandmarkTable::mediapipe();
    let mut points = vec![Point3::new(0.5, 0.5, 0.0); MEDIAPIPE_LANDMARK_COUNT];
    for (i, (landmark, base)) in BASE.iter().enumerate() {
        points[table.index(*landmark)] = Point3::from(adjust(i, *landmark, *base));
    }
    LandmarkSet::new(points)
}

/// A plausible frontal face in normalized image coordinates, left/right symmetric.
pub(crate) fn reference_face() -> LandmarkSet {
    build(|_, _, point| point)
}

/// The reference face with a small deterministic per-`seed` wobble.
pub(crate) fn face(seed: usize) -> LandmarkSet {
    build(|i, _, [x, y, z]| {
        let wobble = ((i * 7 + seed * 3) % 5) as f32 - 2.0;
        [x + 0.002 * wobble, y - 0.0015 * wobble, z]
    })
}

/// [`face`] with one landmark moved by `offset`.
pub(crate) fn shifted_face(seed: usize, moved: Landmark, offset: [f32; 3]) -> LandmarkSet {
    build(|i, landmark, [x, y, z]| {
        let wobble = ((i * 7 + seed * 3) % 5) as f32 - 2.0;
        let [dx, dy, dz] = if landmark == moved { offset } else { [0.0; 3] };
        [x + 0.002 * wobble + dx, y - 0.0015 * wobble + dy, z + dz]
    })
}

/// A face with clearly different proportions from [`face`].
pub(crate) fn other_face(seed: usize) -> LandmarkSet {
    build(|i, landmark, [x, y, z]| {
        let wobble = ((i * 5 + seed * 3) % 5) as f32 - 2.0;
        let [x, y, z] = match landmark {
            Landmark::NoseTip => [x + 0.06, y + 0.08, z - 0.06],
            Landmark::Chin => [x - 0.08, y - 0.12, z + 0.03],
            Landmark::LeftMouth => [x - 0.08, y - 0.04, z],
            Landmark::MouthBottom => [x + 0.03, y + 0.05, z],
            Landmark::LeftEyeOuter => [x - 0.06, y + 0.05, z],
            Landmark::RightEyeTop => [x, y - 0.06, z],
            Landmark::Forehead => [x + 0.1, y + 0.1, z],
            _ => [x, y, z],
        };
        [x + 0.002 * wobble, y + 0.0015 * wobble, z]
    })
}

/// Every point in the same place: passes the usability check, carries no geometry.
pub(crate) fn collapsed_face() -> LandmarkSet {
    LandmarkSet::new(vec![Point3::new(0.5, 0.5, 0.0); MEDIAPIPE_LANDMARK_COUNT])
}
