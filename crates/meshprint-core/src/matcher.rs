//! Verification (1:1) and identification (1:N) over feature vectors.
//!
//! The two protocols derive confidence differently, on purpose:
//!
//! - verification uses the single best similarity against the claimed
//!   identity's templates;
//! - identification blends `0.7 * max + 0.3 * avg` so one lucky template
//!   cannot carry a candidate without support from the identity's others.
//!
//! Every template is always compared; there is no early exit on a good match.

use crate::types::{FeatureVector, IdentityId, MatchResult, Template};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Weight of the best similarity in identification confidence.
pub const MAX_SIMILARITY_WEIGHT: f32 = 0.7;
/// Weight of the mean similarity in identification confidence.
pub const AVG_SIMILARITY_WEIGHT: f32 = 0.3;

/// Similarity summary of a probe against one identity's templates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateScore {
    pub max_similarity: f32,
    pub avg_similarity: f32,
    /// Index of the first template reaching `max_similarity`.
    pub best_index: usize,
    pub compared: usize,
}

impl TemplateScore {
    /// Identification confidence for this identity.
    pub fn blended_confidence(&self) -> f32 {
        (MAX_SIMILARITY_WEIGHT * self.max_similarity + AVG_SIMILARITY_WEIGHT * self.avg_similarity)
            .clamp(0.0, 1.0)
    }
}

/// Score `probe` against every template vector. `None` when there are none.
pub fn score_templates<'a, I>(probe: &FeatureVector, templates: I) -> Option<TemplateScore>
where
    I: IntoIterator<Item = &'a FeatureVector>,
{
    let mut max_similarity = f32::NEG_INFINITY;
    let mut best_index = 0;
    let mut sum = 0.0f64;
    let mut compared = 0usize;

    for (i, template) in templates.into_iter().enumerate() {
        let similarity = probe.similarity(template);
        if similarity > max_similarity {
            max_similarity = similarity;
            best_index = i;
        }
        sum += similarity as f64;
        compared += 1;
    }

    if compared == 0 {
        return None;
    }

    Some(TemplateScore {
        max_similarity,
        avg_similarity: (sum / compared as f64) as f32,
        best_index,
        compared,
    })
}

/// 1:1 decision for `identity` given its stored templates.
///
/// Confidence is the maximum similarity; `matched` is `confidence >= threshold`.
/// Returns `None` when `templates` is empty: the identity is unknown.
pub fn verify_templates(
    probe: &FeatureVector,
    identity: &IdentityId,
    templates: &[Template],
    threshold: f32,
) -> Option<MatchResult> {
    let score = score_templates(probe, templates.iter().map(|t| &t.vector))?;
    let confidence = score.max_similarity;
    Some(MatchResult {
        identity: Some(identity.clone()),
        confidence,
        max_similarity: score.max_similarity,
        avg_similarity: score.avg_similarity,
        matched: confidence >= threshold,
        best_template: Some(score.best_index),
        templates_compared: score.compared,
    })
}

/// A scored identification candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity: IdentityId,
    pub confidence: f32,
    pub score: TemplateScore,
}

impl Candidate {
    pub fn new(identity: IdentityId, score: TemplateScore) -> Self {
        Self {
            identity,
            confidence: score.blended_confidence(),
            score,
        }
    }

    fn into_match_result(self, threshold: f32) -> MatchResult {
        MatchResult {
            matched: self.confidence >= threshold,
            confidence: self.confidence,
            max_similarity: self.score.max_similarity,
            avg_similarity: self.score.avg_similarity,
            best_template: Some(self.score.best_index),
            templates_compared: self.score.compared,
            identity: Some(self.identity),
        }
    }
}

/// Ranking order: confidence descending, then identity id ascending.
fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.identity.cmp(&b.identity))
}

/// Sort, drop candidates below `threshold`, keep at most `top_k`.
///
/// Equal confidences are ordered by identity id ascending, so the output is
/// reproducible regardless of input order.
pub fn rank_candidates(mut candidates: Vec<Candidate>, threshold: f32, top_k: usize) -> Vec<Candidate> {
    candidates.sort_by(rank_order);
    candidates.retain(|c| c.confidence >= threshold);
    candidates.truncate(top_k);
    candidates
}

/// 1:N identification of `probe` against a gallery snapshot.
///
/// Identities without templates contribute no candidate. Scoring runs in
/// parallel; ranking makes the result independent of scheduling.
pub fn identify_gallery(
    probe: &FeatureVector,
    gallery: &[(IdentityId, Vec<FeatureVector>)],
    threshold: f32,
    top_k: usize,
) -> Vec<MatchResult> {
    let candidates: Vec<Candidate> = gallery
        .par_iter()
        .filter_map(|(identity, vectors)| {
            score_templates(probe, vectors).map(|score| Candidate::new(identity.clone(), score))
        })
        .collect();

    tracing::debug!(
        identities = gallery.len(),
        candidates = candidates.len(),
        threshold,
        top_k,
        "identification scored"
    );

    rank_candidates(candidates, threshold, top_k)
        .into_iter()
        .map(|c| c.into_match_result(threshold))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    /// Unit vector whose rescaled similarity to `[1, 0]` is `similarity`.
    fn at_similarity(similarity: f32) -> FeatureVector {
        let cos = 2.0 * similarity - 1.0;
        fv(&[cos, (1.0 - cos * cos).max(0.0).sqrt()])
    }

    fn template(values: &[f32]) -> Template {
        Template::new(fv(values), None)
    }

    fn candidate(id: &str, confidence: f32) -> Candidate {
        Candidate {
            identity: IdentityId::from(id),
            confidence,
            score: TemplateScore {
                max_similarity: confidence,
                avg_similarity: confidence,
                best_index: 0,
                compared: 1,
            },
        }
    }

    fn ids(results: &[MatchResult]) -> Vec<&str> {
        results
            .iter()
            .map(|r| r.identity.as_ref().map(|i| i.as_str()).unwrap_or("-"))
            .collect()
    }

    #[test]
    fn test_score_templates_empty() {
        assert!(score_templates(&fv(&[1.0, 0.0]), &Vec::<FeatureVector>::new()).is_none());
    }

    #[test]
    fn test_score_templates_max_avg_and_best_index() {
        let probe = fv(&[1.0, 0.0]);
        let templates = [fv(&[0.0, 1.0]), fv(&[1.0, 0.0]), fv(&[-1.0, 0.0])];
        let score = score_templates(&probe, &templates).unwrap();
        assert!((score.max_similarity - 1.0).abs() < 1e-6);
        assert!((score.avg_similarity - 0.5).abs() < 1e-6);
        assert_eq!(score.best_index, 1);
        assert_eq!(score.compared, 3);
        assert!((score.blended_confidence() - (0.7 + 0.15)).abs() < 1e-6);
    }

    #[test]
    fn test_verify_uses_max_similarity() {
        let probe = fv(&[1.0, 0.0]);
        let id = IdentityId::from("alice");
        let templates = [template(&[0.0, 1.0]), template(&[1.0, 0.0])];
        let result = verify_templates(&probe, &id, &templates, 0.75).unwrap();
        assert!(result.matched);
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert!((result.avg_similarity - 0.75).abs() < 1e-6);
        assert_eq!(result.best_template, Some(1));
        assert_eq!(result.identity, Some(id));
    }

    #[test]
    fn test_verify_unknown_without_templates() {
        let id = IdentityId::from("ghost");
        assert!(verify_templates(&fv(&[1.0]), &id, &[], 0.5).is_none());
    }

    #[test]
    fn test_verify_threshold_monotonic() {
        let probe = fv(&[1.0, 0.0]);
        let id = IdentityId::from("alice");
        let templates = [template(&[0.8, 0.6])];
        let thresholds = [0.0, 0.5, 0.85, 0.89, 0.9, 0.91, 0.95, 1.0];
        let mut previously_accepted = true;
        for t in thresholds {
            let accepted = verify_templates(&probe, &id, &templates, t).unwrap().matched;
            assert!(
                previously_accepted || !accepted,
                "threshold {t} accepted after a lower threshold rejected"
            );
            previously_accepted = accepted;
        }
        assert!(!previously_accepted);
    }

    #[test]
    fn test_identify_ranking_top_k() {
        let probe = fv(&[1.0, 0.0]);
        let gallery = vec![
            (IdentityId::from("A"), vec![at_similarity(0.9)]),
            (IdentityId::from("B"), vec![at_similarity(0.7)]),
            (IdentityId::from("C"), vec![at_similarity(0.95)]),
        ];
        let results = identify_gallery(&probe, &gallery, 0.5, 2);
        assert_eq!(ids(&results), vec!["C", "A"]);
        assert!((results[0].confidence - 0.95).abs() < 1e-5);
        assert!((results[1].confidence - 0.9).abs() < 1e-5);
        assert!(results.iter().all(|r| r.matched));
    }

    #[test]
    fn test_rank_candidates_spec_confidences() {
        let ranked = rank_candidates(
            vec![candidate("A", 0.9), candidate("B", 0.7), candidate("C", 0.95)],
            0.0,
            2,
        );
        let order: Vec<&str> = ranked.iter().map(|c| c.identity.as_str()).collect();
        assert_eq!(order, vec!["C", "A"]);
    }

    #[test]
    fn test_rank_ties_broken_by_identity_ascending() {
        let forward = rank_candidates(
            vec![candidate("zoe", 0.8), candidate("adam", 0.8), candidate("mia", 0.8)],
            0.0,
            10,
        );
        let reversed = rank_candidates(
            vec![candidate("mia", 0.8), candidate("adam", 0.8), candidate("zoe", 0.8)],
            0.0,
            10,
        );
        let order: Vec<&str> = forward.iter().map(|c| c.identity.as_str()).collect();
        assert_eq!(order, vec!["adam", "mia", "zoe"]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_identify_filters_below_threshold() {
        let probe = fv(&[1.0, 0.0]);
        let gallery = vec![
            (IdentityId::from("near"), vec![at_similarity(0.9)]),
            (IdentityId::from("far"), vec![at_similarity(0.3)]),
        ];
        let results = identify_gallery(&probe, &gallery, 0.7, 5);
        assert_eq!(ids(&results), vec!["near"]);
    }

    #[test]
    fn test_identify_threshold_monotonic() {
        let probe = fv(&[1.0, 0.0]);
        let gallery: Vec<(IdentityId, Vec<FeatureVector>)> = [0.55, 0.62, 0.7, 0.78, 0.86, 0.93]
            .iter()
            .enumerate()
            .map(|(i, &s)| (IdentityId::new(format!("id{i}")), vec![at_similarity(s)]))
            .collect();

        let thresholds = [0.5, 0.6, 0.7, 0.8, 0.9, 0.99];
        for pair in thresholds.windows(2) {
            for top_k in [1, 3, 10] {
                let low = identify_gallery(&probe, &gallery, pair[0], top_k);
                let high = identify_gallery(&probe, &gallery, pair[1], top_k);
                for r in &high {
                    assert!(
                        low.iter().any(|l| l.identity == r.identity),
                        "{:?} accepted at {} but not at {}",
                        r.identity,
                        pair[1],
                        pair[0]
                    );
                }
            }
        }
    }

    #[test]
    fn test_identify_skips_empty_identities() {
        let probe = fv(&[1.0, 0.0]);
        let gallery = vec![
            (IdentityId::from("empty"), Vec::new()),
            (IdentityId::from("real"), vec![fv(&[1.0, 0.0])]),
        ];
        let results = identify_gallery(&probe, &gallery, 0.0, 10);
        assert_eq!(ids(&results), vec!["real"]);
    }

    #[test]
    fn test_identify_blends_max_and_average() {
        let probe = fv(&[1.0, 0.0]);
        // "steady": two templates at 0.9. "spiky": one perfect, one opposite.
        let gallery = vec![
            (
                IdentityId::from("spiky"),
                vec![fv(&[1.0, 0.0]), fv(&[-1.0, 0.0])],
            ),
            (
                IdentityId::from("steady"),
                vec![at_similarity(0.9), at_similarity(0.9)],
            ),
        ];
        let results = identify_gallery(&probe, &gallery, 0.0, 10);
        // spiky: 0.7 * 1.0 + 0.3 * 0.5 = 0.85; steady: 0.9
        assert_eq!(ids(&results), vec!["steady", "spiky"]);
        assert!((results[1].confidence - 0.85).abs() < 1e-5);
        assert!((results[1].max_similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_identify_empty_gallery() {
        assert!(identify_gallery(&fv(&[1.0]), &[], 0.0, 5).is_empty());
    }
}
