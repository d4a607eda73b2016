//! Landmark sets and the symbolic landmark table.
//!
//! A detector hands us an ordered, index-stable list of 3D points per face.
//! The extractor never addresses those points by raw integer; it goes through
//! a [`LandmarkTable`] that maps each symbolic [`Landmark`] to its index. The
//! table is resolved once and passed to the extractor at construction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Sub;
use thiserror::Error;

/// Number of points produced by the MediaPipe FaceMesh model (without iris refinement).
pub const MEDIAPIPE_LANDMARK_COUNT: usize = 468;

/// A single landmark point in detector coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Point3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Euclidean distance between two points.
    pub fn distance(self, other: Point3) -> f32 {
        (self - other).norm()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Sub for Point3 {
    type Output = Point3;

    fn sub(self, rhs: Point3) -> Point3 {
        Point3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl From<[f32; 3]> for Point3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self::new(x, y, z)
    }
}

/// Ordered landmark points for one detected face.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LandmarkSet {
    points: Vec<Point3>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point3>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    /// Mutable access for callers that post-process detector output.
    pub fn points_mut(&mut self) -> &mut [Point3] {
        &mut self.points
    }

    /// Whether this set carries usable geometry: non-empty and every coordinate finite.
    pub fn is_usable(&self) -> bool {
        !self.points.is_empty() && self.points.iter().all(|p| p.is_finite())
    }

    /// Point at `index`.
    ///
    /// # Panics
    /// Panics when `index` is out of range. Landmark indices come from a
    /// [`LandmarkTable`] that must match the detector, so a miss is a caller bug.
    pub fn point(&self, index: usize) -> Point3 {
        match self.points.get(index) {
            Some(p) => *p,
            None => panic!(
                "landmark index {index} out of range for a set of {} points",
                self.points.len()
            ),
        }
    }
}

impl From<Vec<[f32; 3]>> for LandmarkSet {
    fn from(points: Vec<[f32; 3]>) -> Self {
        Self::new(points.into_iter().map(Point3::from).collect())
    }
}

/// Symbolic facial landmarks used by the feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    LeftEyeOuter,
    LeftEyeInner,
    RightEyeOuter,
    RightEyeInner,
    LeftEyeTop,
    LeftEyeBottom,
    RightEyeTop,
    RightEyeBottom,
    NoseTip,
    NoseBridge,
    LeftMouth,
    RightMouth,
    MouthTop,
    MouthBottom,
    LeftCheek,
    RightCheek,
    Chin,
    Forehead,
    LeftEyebrowInner,
    LeftEyebrowOuter,
    RightEyebrowInner,
    RightEyebrowOuter,
}

impl Landmark {
    pub const COUNT: usize = 22;

    /// Every landmark, in discriminant order.
    pub const ALL: [Landmark; Landmark::COUNT] = [
        Landmark::LeftEyeOuter,
        Landmark::LeftEyeInner,
        Landmark::RightEyeOuter,
        Landmark::RightEyeInner,
        Landmark::LeftEyeTop,
        Landmark::LeftEyeBottom,
        Landmark::RightEyeTop,
        Landmark::RightEyeBottom,
        Landmark::NoseTip,
        Landmark::NoseBridge,
        Landmark::LeftMouth,
        Landmark::RightMouth,
        Landmark::MouthTop,
        Landmark::MouthBottom,
        Landmark::LeftCheek,
        Landmark::RightCheek,
        Landmark::Chin,
        Landmark::Forehead,
        Landmark::LeftEyebrowInner,
        Landmark::LeftEyebrowOuter,
        Landmark::RightEyebrowInner,
        Landmark::RightEyebrowOuter,
    ];

    /// Configuration name (`snake_case`).
    pub fn name(self) -> &'static str {
        match self {
            Landmark::LeftEyeOuter => "left_eye_outer",
            Landmark::LeftEyeInner => "left_eye_inner",
            Landmark::RightEyeOuter => "right_eye_outer",
            Landmark::RightEyeInner => "right_eye_inner",
            Landmark::LeftEyeTop => "left_eye_top",
            Landmark::LeftEyeBottom => "left_eye_bottom",
            Landmark::RightEyeTop => "right_eye_top",
            Landmark::RightEyeBottom => "right_eye_bottom",
            Landmark::NoseTip => "nose_tip",
            Landmark::NoseBridge => "nose_bridge",
            Landmark::LeftMouth => "left_mouth",
            Landmark::RightMouth => "right_mouth",
            Landmark::MouthTop => "mouth_top",
            Landmark::MouthBottom => "mouth_bottom",
            Landmark::LeftCheek => "left_cheek",
            Landmark::RightCheek => "right_cheek",
            Landmark::Chin => "chin",
            Landmark::Forehead => "forehead",
            Landmark::LeftEyebrowInner => "left_eyebrow_inner",
            Landmark::LeftEyebrowOuter => "left_eyebrow_outer",
            Landmark::RightEyebrowInner => "right_eyebrow_inner",
            Landmark::RightEyebrowOuter => "right_eyebrow_outer",
        }
    }
}

/// MediaPipe FaceMesh indices, in [`Landmark::ALL`] order.
const MEDIAPIPE_INDICES: [usize; Landmark::COUNT] = [
    33, 133, 362, 263, 159, 145, 386, 374, 1, 6, 61, 291, 13, 14, 234, 454, 152, 10, 70, 46, 300,
    276,
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LandmarkTableError {
    #[error("landmark table is missing `{}`", .0.name())]
    Missing(Landmark),
}

/// Immutable mapping from symbolic landmark to detector point index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<Landmark, usize>",
    into = "BTreeMap<Landmark, usize>"
)]
pub struct LandmarkTable {
    indices: [usize; Landmark::COUNT],
}

impl LandmarkTable {
    /// Table for the MediaPipe FaceMesh 468-point topology.
    pub fn mediapipe() -> Self {
        Self {
            indices: MEDIAPIPE_INDICES,
        }
    }

    /// Build a table from an explicit mapping. Every landmark must be present.
    pub fn from_map(map: &BTreeMap<Landmark, usize>) -> Result<Self, LandmarkTableError> {
        let mut indices = [0usize; Landmark::COUNT];
        for landmark in Landmark::ALL {
            indices[landmark as usize] = *map
                .get(&landmark)
                .ok_or(LandmarkTableError::Missing(landmark))?;
        }
        Ok(Self { indices })
    }

    pub fn index(&self, landmark: Landmark) -> usize {
        self.indices[landmark as usize]
    }

    /// Minimum number of points a [`LandmarkSet`] needs for this table.
    pub fn required_len(&self) -> usize {
        self.indices.iter().copied().max().unwrap_or(0) + 1
    }

    pub fn to_map(&self) -> BTreeMap<Landmark, usize> {
        Landmark::ALL
            .iter()
            .map(|&landmark| (landmark, self.index(landmark)))
            .collect()
    }
}

impl Default for LandmarkTable {
    fn default() -> Self {
        Self::mediapipe()
    }
}

impl TryFrom<BTreeMap<Landmark, usize>> for LandmarkTable {
    type Error = LandmarkTableError;

    fn try_from(map: BTreeMap<Landmark, usize>) -> Result<Self, Self::Error> {
        Self::from_map(&map)
    }
}

impl From<LandmarkTable> for BTreeMap<Landmark, usize> {
    fn from(table: LandmarkTable) -> Self {
        table.to_map()
    }
}
