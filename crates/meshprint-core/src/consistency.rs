//! Enrollment-time consistency check.
//!
//! Every unordered pair of enrollment vectors must score at least the minimum
//! similarity; otherwise the batch probably mixes subjects or contains a bad
//! capture and must not be enrolled.

use crate::types::FeatureVector;

/// First pair of samples that failed the check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InconsistentPair {
    pub first: usize,
    pub second: usize,
    pub similarity: f32,
}

/// Find the first pair (in `(i, j)` lexicographic order, `i < j`) scoring below
/// `min_pairwise_similarity`. Batches of 0 or 1 vectors never fail.
pub fn find_inconsistent_pair(
    vectors: &[FeatureVector],
    min_pairwise_similarity: f32,
) -> Option<InconsistentPair> {
    for (i, a) in vectors.iter().enumerate() {
        for (j, b) in vectors.iter().enumerate().skip(i + 1) {
            let similarity = a.similarity(b);
            if similarity < min_pairwise_similarity {
                tracing::debug!(
                    first = i,
                    second = j,
                    similarity,
                    minimum = min_pairwise_similarity,
                    "inconsistent sample pair"
                );
                return Some(InconsistentPair {
                    first: i,
                    second: j,
                    similarity,
                });
            }
        }
    }
    None
}

/// Whether all pairs of `vectors` are at least `min_pairwise_similarity` alike.
pub fn consistent(vectors: &[FeatureVector], min_pairwise_similarity: f32) -> bool {
    find_inconsistent_pair(vectors, min_pairwise_similarity).is_none()
}
