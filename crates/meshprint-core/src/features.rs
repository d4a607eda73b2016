//! Geometric feature extraction from facial landmarks.
//!
//! Turns one [`LandmarkSet`] into a fixed-length [`FeatureVector`]. The layout
//! is, in order:
//!
//! | block      | count | contents                                                    |
//! |------------|-------|-------------------------------------------------------------|
//! | distances  | 9     | inter-ocular, eye→nose (L, R), nose→mouth, mouth width, face height, face width, eyebrow span (L, R) |
//! | ratios     | 5     | eye/face width, nose-mouth/face height, mouth/face width, eye height/width (L, R) |
//! | angles     | 4     | eyes at nose tip, nose bridge, jaw (L, R), in degrees       |
//! | eye/mouth  | 4     | eye aperture (L, R), mouth aperture, eye-nose symmetry      |
//!
//! The concatenated vector is then standardized against its own mean and
//! standard deviation.

use crate::landmarks::{Landmark, LandmarkSet, LandmarkTable, Point3};
use crate::types::FeatureVector;

pub const DISTANCE_FEATURES: usize = 9;
pub const RATIO_FEATURES: usize = 5;
pub const ANGLE_FEATURES: usize = 4;
pub const EYE_MOUTH_FEATURES: usize = 4;

/// Length of every vector produced by [`FeatureExtractor::extract`].
pub const FEATURE_DIM: usize =
    DISTANCE_FEATURES + RATIO_FEATURES + ANGLE_FEATURES + EYE_MOUTH_FEATURES;

/// Added to every ratio denominator.
const RATIO_EPSILON: f32 = 1e-6;
/// Arms shorter than this make an angle undefined; it degrades to 0°.
const ANGLE_EPSILON: f32 = 1e-6;
/// Below this standard deviation the vector is left unnormalized.
const NORMALIZATION_EPSILON: f32 = 1e-6;

/// Landmark-geometry feature extractor.
///
/// Stateless apart from its immutable landmark table; `extract` is pure and
/// safe to call from any number of threads.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    table: LandmarkTable,
    normalize: bool,
}

impl FeatureExtractor {
    pub fn new(table: LandmarkTable) -> Self {
        Self {
            table,
            normalize: true,
        }
    }

    /// Disable standardization, keeping raw geometric values. Mostly useful
    /// for diagnostics; vectors from differently configured extractors must
    /// never be compared.
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn table(&self) -> &LandmarkTable {
        &self.table
    }

    /// Extract a feature vector from one face.
    ///
    /// # Panics
    /// Panics if `landmarks` has fewer points than the table requires.
    pub fn extract(&self, landmarks: &LandmarkSet) -> FeatureVector {
        assert!(
            landmarks.len() >= self.table.required_len(),
            "landmark set has {} points, table requires at least {}",
            landmarks.len(),
            self.table.required_len()
        );

        let face = Face {
            landmarks,
            table: &self.table,
        };

        let mut values = Vec::with_capacity(FEATURE_DIM);
        values.extend_from_slice(&distance_features(&face));
        values.extend_from_slice(&ratio_features(&face));
        values.extend_from_slice(&angle_features(&face));
        values.extend_from_slice(&eye_mouth_features(&face));
        debug_assert_eq!(values.len(), FEATURE_DIM);

        if self.normalize {
            standardize(&mut values);
        }

        FeatureVector::new(values)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(LandmarkTable::mediapipe())
    }
}

/// Landmark lookups for one face through the table.
struct Face<'a> {
    landmarks: &'a LandmarkSet,
    table: &'a LandmarkTable,
}

impl Face<'_> {
    fn at(&self, landmark: Landmark) -> Point3 {
        self.landmarks.point(self.table.index(landmark))
    }

    fn dist(&self, a: Landmark, b: Landmark) -> f32 {
        self.at(a).distance(self.at(b))
    }

    fn angle(&self, a: Landmark, vertex: Landmark, b: Landmark) -> f32 {
        angle_at(self.at(a), self.at(vertex), self.at(b))
    }
}

fn distance_features(face: &Face<'_>) -> [f32; DISTANCE_FEATURES] {
    use Landmark::*;
    [
        face.dist(LeftEyeInner, RightEyeInner),
        face.dist(LeftEyeInner, NoseTip),
        face.dist(RightEyeInner, NoseTip),
        face.dist(NoseTip, MouthTop),
        face.dist(LeftMouth, RightMouth),
        face.dist(Forehead, Chin),
        face.dist(LeftCheek, RightCheek),
        face.dist(LeftEyebrowInner, LeftEyebrowOuter),
        face.dist(RightEyebrowInner, RightEyebrowOuter),
    ]
}

fn ratio_features(face: &Face<'_>) -> [f32; RATIO_FEATURES] {
    use Landmark::*;
    let eye_distance = face.dist(LeftEyeInner, RightEyeInner);
    let face_width = face.dist(LeftCheek, RightCheek);
    let face_height = face.dist(Forehead, Chin);
    let nose_mouth = face.dist(NoseTip, MouthTop);
    let mouth_width = face.dist(LeftMouth, RightMouth);
    let left_eye_height = face.dist(LeftEyeTop, LeftEyeBottom);
    let left_eye_width = face.dist(LeftEyeOuter, LeftEyeInner);
    let right_eye_height = face.dist(RightEyeTop, RightEyeBottom);
    let right_eye_width = face.dist(RightEyeOuter, RightEyeInner);

    [
        ratio(eye_distance, face_width),
        ratio(nose_mouth, face_height),
        ratio(mouth_width, face_width),
        ratio(left_eye_height, left_eye_width),
        ratio(right_eye_height, right_eye_width),
    ]
}

fn angle_features(face: &Face<'_>) -> [f32; ANGLE_FEATURES] {
    use Landmark::*;
    [
        face.angle(LeftEyeInner, NoseTip, RightEyeInner),
        face.angle(Forehead, NoseBridge, NoseTip),
        face.angle(LeftCheek, Chin, LeftMouth),
        face.angle(RightCheek, Chin, RightMouth),
    ]
}

fn eye_mouth_features(face: &Face<'_>) -> [f32; EYE_MOUTH_FEATURES] {
    use Landmark::*;
    let left_eye_nose = face.dist(LeftEyeInner, NoseTip);
    let right_eye_nose = face.dist(RightEyeInner, NoseTip);
    [
        face.dist(LeftEyeTop, LeftEyeBottom),
        face.dist(RightEyeTop, RightEyeBottom),
        face.dist(MouthTop, MouthBottom),
        (left_eye_nose - right_eye_nose).abs(),
    ]
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
    numerator / (denominator + RATIO_EPSILON)
}

/// Angle at `vertex` between the arms towards `a` and `b`, in degrees.
///
/// The cosine is clamped to [-1, 1] before `acos`. A zero-length arm yields 0°.
pub fn angle_at(a: Point3, vertex: Point3, b: Point3) -> f32 {
    let v1 = a - vertex;
    let v2 = b - vertex;
    let n1 = v1.norm();
    let n2 = v2.norm();
    if n1 < ANGLE_EPSILON || n2 < ANGLE_EPSILON {
        return 0.0;
    }
    let cosine = (v1.dot(v2) / (n1 * n2)).clamp(-1.0, 1.0);
    cosine.acos().to_degrees()
}

/// Standardize in place to zero mean and unit (population) variance.
///
/// Returns `false` and leaves `values` untouched when the standard deviation
/// is below epsilon (or the slice is empty).
pub fn standardize(values: &mut [f32]) -> bool {
    if values.is_empty() {
        return false;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = variance.sqrt();
    if std.is_nan() || std < NORMALIZATION_EPSILON {
        return false;
    }
    for v in values.iter_mut() {
        *v = (*v - mean) / std;
    }
    true
}
