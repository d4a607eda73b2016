#![allow(dead_code)]

use meshprint_core::landmarks::MEDIAPIPE_LANDMARK_COUNT;
use meshprint_core::{Landmark, LandmarkSet, LandmarkTable, Point3, Sample};

/// Reference geometry in normalized image coordinates.
pub fn base_point(landmark: Landmark) -> [f32; 3] {
    match landmark {
        Landmark::LeftEyeOuter => [0.30, 0.40, 0.00],
        Landmark::LeftEyeInner => [0.42, 0.40, 0.01],
        Landmark::RightEyeOuter => [0.70, 0.40, 0.00],
        Landmark::RightEyeInner => [0.58, 0.40, 0.01],
        Landmark::LeftEyeTop => [0.36, 0.38, 0.00],
        Landmark::LeftEyeBottom => [0.36, 0.42, 0.00],
        Landmark::RightEyeTop => [0.64, 0.38, 0.00],
        Landmark::RightEyeBottom => [0.64, 0.42, 0.00],
        Landmark::NoseTip => [0.50, 0.55, -0.05],
        Landmark::NoseBridge => [0.50, 0.42, -0.02],
        Landmark::LeftMouth => [0.40, 0.68, 0.00],
        Landmark::RightMouth => [0.60, 0.68, 0.00],
        Landmark::MouthTop => [0.50, 0.66, -0.01],
        Landmark::MouthBottom => [0.50, 0.71, -0.01],
        Landmark::LeftCheek => [0.22, 0.52, 0.05],
        Landmark::RightCheek => [0.78, 0.52, 0.05],
        Landmark::Chin => [0.50, 0.88, 0.00],
        Landmark::Forehead => [0.50, 0.15, 0.00],
        Landmark::LeftEyebrowInner => [0.40, 0.33, 0.00],
        Landmark::LeftEyebrowOuter => [0.28, 0.34, 0.00],
        Landmark::RightEyebrowInner => [0.60, 0.33, 0.00],
        Landmark::RightEyebrowOuter => [0.72, 0.34, 0.00],
    }
}

/// A full 468-point mesh with the key landmarks placed by `place`.
pub fn mesh(place: impl Fn(usize, Landmark) -> [f32; 3]) -> LandmarkSet {
    let table = LandmarkTable::mediapipe();
    let mut points = vec![Point3::new(0.5, 0.5, 0.0); MEDIAPIPE_LANDMARK_COUNT];
    for (i, landmark) in Landmark::ALL.iter().enumerate() {
        points[table.index(*landmark)] = Point3::from(place(i, *landmark));
    }
    LandmarkSet::new(points)
}

/// The reference face with a small deterministic per-`seed` wobble.
pub fn face(seed: usize) -> LandmarkSet {
    mesh(|i, landmark| {
        let [x, y, z] = base_point(landmark);
        let wobble = ((i * 7 + seed * 3) % 5) as f32 - 2.0;
        [x + 0.002 * wobble, y - 0.0015 * wobble, z]
    })
}

/// A face whose proportions differ clearly from [`face`].
pub fn other_face(seed: usize) -> LandmarkSet {
    mesh(|i, landmark| {
        let [x, y, z] = base_point(landmark);
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
        let wobble = ((i * 5 + seed * 3) % 5) as f32 - 2.0;
        [x + 0.002 * wobble, y + 0.0015 * wobble, z]
    })
}

/// Every point in one place: finite but geometrically empty.
pub fn collapsed_face() -> LandmarkSet {
    LandmarkSet::new(vec![Point3::new(0.5, 0.5, 0.0); MEDIAPIPE_LANDMARK_COUNT])
}

pub fn samples(make: fn(usize) -> LandmarkSet, count: usize) -> Vec<Sample> {
    (0..count).map(|seed| Sample::new(make(seed))).collect()
}
