//! Detector output and image files.

use anyhow::{Context, Result};
use meshprint_core::quality::{self, QualityMetrics};
use meshprint_core::LandmarkSet;
use serde::Deserialize;
use std::path::Path;

/// Landmark file layout: `{"faces": [[[x, y, z], ...], ...]}`.
#[derive(Debug, Deserialize)]
struct LandmarkFile {
    faces: Vec<Vec<[f32; 3]>>,
}

pub fn parse_faces(json: &str) -> Result<Vec<LandmarkSet>> {
    let file: LandmarkFile = serde_json::from_str(json).context("invalid landmark JSON")?;
    Ok(file.faces.into_iter().map(LandmarkSet::from).collect())
}

/// All faces in a landmark file, in detector order.
pub fn load_faces(path: &Path) -> Result<Vec<LandmarkSet>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let faces = parse_faces(&json).with_context(|| format!("in {}", path.display()))?;
    tracing::debug!(path = %path.display(), faces = faces.len(), "landmarks loaded");
    Ok(faces)
}

/// The first face of a landmark file, for enrollment. An empty file yields an
/// empty set, which enrollment reports as a missing detection.
pub fn load_sample_face(path: &Path) -> Result<LandmarkSet> {
    Ok(load_faces(path)?.into_iter().next().unwrap_or_default())
}

/// Decode an image file to grayscale and score it.
pub fn assess_image(path: &Path) -> Result<QualityMetrics> {
    let gray = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_luma8();
    let (width, height) = gray.dimensions();
    quality::assess(gray.as_raw(), width, height)
        .with_context(|| format!("cannot assess {}", path.display()))
}
