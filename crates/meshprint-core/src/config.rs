use serde::{Deserialize, Serialize};

/// Decision thresholds and enrollment policy.
///
/// All thresholds are empirical; none is derived from a calibration procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum best-template similarity to accept a 1:1 claim.
    pub verification_threshold: f32,
    /// Minimum blended confidence for a 1:N candidate to be reported.
    pub identification_threshold: f32,
    /// Minimum similarity between every pair of enrollment samples.
    pub consistency_threshold: f32,
    /// Samples required to create an identity.
    pub min_enrollment_samples: usize,
    /// Samples with a lower image quality score are rejected outright.
    pub min_sample_quality: f32,
    /// Samples with a lower image quality score are accepted but flagged for review.
    pub review_quality: f32,
    /// Default number of identification candidates to return.
    pub top_k: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            verification_threshold: 0.75,
            identification_threshold: 0.70,
            consistency_threshold: 0.65,
            min_enrollment_samples: 3,
            min_sample_quality: 0.0,
            review_quality: 0.5,
            top_k: 5,
        }
    }
}
