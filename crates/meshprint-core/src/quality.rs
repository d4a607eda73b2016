//! Source-image quality assessment: sharpness, brightness, contrast.
//!
//! Operates on 8-bit grayscale buffers (width * height bytes). Decoding is the
//! caller's job. Scores never feed into similarity; they gate and flag
//! enrollment samples and are recorded alongside templates and match logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Laplacian variance that maps to a sharpness score of 1.0.
const SHARPNESS_REFERENCE_VARIANCE: f64 = 1000.0;
/// Brightness band (mean luma / 255) outside which the score is capped.
const BRIGHTNESS_BAND: (f64, f64) = (0.3, 0.8);
const BRIGHTNESS_PEAK: f64 = 0.55;
const BRIGHTNESS_HALF_WIDTH: f64 = 0.25;
const BRIGHTNESS_OUT_OF_BAND_SCORE: f64 = 0.5;
/// Luma standard deviation that maps to a contrast score of 1.0.
const CONTRAST_REFERENCE_STD: f64 = 128.0;

const SHARPNESS_WEIGHT: f32 = 0.4;
const BRIGHTNESS_WEIGHT: f32 = 0.3;
const CONTRAST_WEIGHT: f32 = 0.3;

/// Per-image quality scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    /// 0.4 · sharpness + 0.3 · brightness + 0.3 · contrast.
    pub quality_score: f32,
}

impl QualityMetrics {
    /// Combine component scores with the fixed weights.
    pub fn from_components(sharpness: f32, brightness: f32, contrast: f32) -> Self {
        let quality_score = SHARPNESS_WEIGHT * sharpness
            + BRIGHTNESS_WEIGHT * brightness
            + CONTRAST_WEIGHT * contrast;
        Self {
            sharpness,
            brightness,
            contrast,
            quality_score: quality_score.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QualityError {
    #[error("image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("invalid grayscale buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Assess a grayscale image.
pub fn assess(gray: &[u8], width: u32, height: u32) -> Result<QualityMetrics, QualityError> {
    let expected = width as usize * height as usize;
    if expected == 0 {
        return Err(QualityError::EmptyImage { width, height });
    }
    if gray.len() != expected {
        return Err(QualityError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }

    let (mean, std) = luma_moments(gray);
    let sharpness = sharpness_score(laplacian_variance(gray, width as usize, height as usize));
    let brightness = brightness_score(mean / 255.0);
    let contrast = (std / CONTRAST_REFERENCE_STD).min(1.0);

    let metrics =
        QualityMetrics::from_components(sharpness as f32, brightness as f32, contrast as f32);
    tracing::debug!(
        sharpness = metrics.sharpness,
        brightness = metrics.brightness,
        contrast = metrics.contrast,
        quality = metrics.quality_score,
        "image quality assessed"
    );
    Ok(metrics)
}

/// Mean and population standard deviation of the luma values.
fn luma_moments(gray: &[u8]) -> (f64, f64) {
    let n = gray.len() as f64;
    let mean = gray.iter().map(|&p| p as f64).sum::<f64>() / n;
    let variance = gray.iter().map(|&p| (p as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian response over interior pixels.
///
/// Images smaller than 3×3 have no interior and report 0.
fn laplacian_variance(gray: &[u8], width: usize, height: usize) -> f64 {
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: usize, y: usize| gray[y * width + x] as f64;
    let mut responses = Vec::with_capacity((width - 2) * (height - 2));
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let response = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1)
                - 4.0 * px(x, y);
            responses.push(response);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}

fn sharpness_score(variance: f64) -> f64 {
    (variance / SHARPNESS_REFERENCE_VARIANCE).min(1.0)
}

fn brightness_score(brightness: f64) -> f64 {
    let (low, high) = BRIGHTNESS_BAND;
    if !(low..=high).contains(&brightness) {
        return BRIGHTNESS_OUT_OF_BAND_SCORE;
    }
    (1.0 - (brightness - BRIGHTNESS_PEAK).abs() / BRIGHTNESS_HALF_WIDTH).clamp(0.0, 1.0)
}
