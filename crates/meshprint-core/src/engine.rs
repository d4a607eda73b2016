//! Enrollment, verification and identification over a template store.
//!
//! [`Engine`] wires the extractor, the decision thresholds and a
//! [`TemplateStore`] together. It holds no mutable state of its own, so one
//! engine can serve any number of threads; the store serializes writes.

use crate::config::MatchConfig;
use crate::consistency::find_inconsistent_pair;
use crate::features::FeatureExtractor;
use crate::landmarks::LandmarkSet;
use crate::matcher;
use crate::quality::QualityMetrics;
use crate::store::{StoreError, TemplateStore};
use crate::types::{FeatureVector, IdentityId, IdentitySummary, MatchResult, Template};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("no usable face geometry in probe")]
    NoDetection,
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("need at least {required} samples, got {provided}")]
    TooFewSamples { required: usize, provided: usize },
    #[error("no usable face geometry in sample {sample}")]
    NoDetection { sample: usize },
    #[error("sample {sample} quality {score:.2} is below the minimum {minimum:.2}")]
    LowQuality {
        sample: usize,
        score: f32,
        minimum: f32,
    },
    #[error(
        "samples {first} and {second} are inconsistent (similarity {similarity:.3} < {minimum:.3}); \
         all samples must show the same person"
    )]
    InconsistentSamples {
        first: usize,
        second: usize,
        similarity: f32,
        minimum: f32,
    },
    #[error("identity already enrolled: {0}")]
    AlreadyEnrolled(IdentityId),
    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists(id) => EnrollError::AlreadyEnrolled(id),
            StoreError::NotFound(id) => EnrollError::UnknownIdentity(id),
            other => EnrollError::Store(other),
        }
    }
}

/// One enrollment capture: the detected face and, if the source image was
/// available, its quality.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub landmarks: LandmarkSet,
    pub quality: Option<QualityMetrics>,
}

impl Sample {
    pub fn new(landmarks: LandmarkSet) -> Self {
        Self {
            landmarks,
            quality: None,
        }
    }

    pub fn with_quality(mut self, quality: QualityMetrics) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// Result of a successful enrollment or template addition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollOutcome {
    pub identity: IdentityId,
    pub templates_added: usize,
    /// Indices of samples whose image quality warrants human review.
    pub flagged_for_review: Vec<usize>,
}

/// 1:1 decision with the threshold it was made against.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub result: MatchResult,
    pub threshold: f32,
}

impl Verification {
    pub fn verified(&self) -> bool {
        self.result.matched
    }

    pub fn confidence(&self) -> f32 {
        self.result.confidence
    }
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.verified() {
            write!(
                f,
                "verification successful (confidence {:.2}%)",
                self.confidence() * 100.0
            )
        } else {
            write!(
                f,
                "verification failed (confidence {:.2}%, threshold {:.2}%)",
                self.confidence() * 100.0,
                self.threshold * 100.0
            )
        }
    }
}

/// Biometric matching service over a template store.
pub struct Engine<S> {
    extractor: FeatureExtractor,
    config: MatchConfig,
    store: S,
}

impl<S: TemplateStore> Engine<S> {
    pub fn new(extractor: FeatureExtractor, config: MatchConfig, store: S) -> Self {
        Self {
            extractor,
            config,
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    /// Features of the first detected face, or `None` if there is no usable face.
    pub fn probe_features(&self, faces: &[LandmarkSet]) -> Option<FeatureVector> {
        faces
            .first()
            .filter(|face| face.is_usable())
            .map(|face| self.extractor.extract(face))
    }

    /// Create `identity` from a batch of samples.
    ///
    /// Nothing is written unless every sample has usable geometry, passes the
    /// quality gate, and the batch is pairwise consistent. The identity and all
    /// of its templates are then created in one store operation.
    pub fn enroll(
        &self,
        identity: &IdentityId,
        samples: &[Sample],
        metadata: serde_json::Value,
    ) -> Result<EnrollOutcome, EnrollError> {
        let required = self.config.min_enrollment_samples.max(1);
        if samples.len() < required {
            return Err(EnrollError::TooFewSamples {
                required,
                provided: samples.len(),
            });
        }

        let (vectors, flagged) = self.sample_vectors(samples)?;
        self.check_consistency(&vectors)?;

        let templates: Vec<Template> = vectors
            .into_iter()
            .zip(samples)
            .map(|(vector, sample)| Template::new(vector, sample.quality))
            .collect();
        let templates_added = templates.len();

        self.store.create_identity(identity, metadata, templates)?;

        tracing::info!(
            identity = %identity,
            templates = templates_added,
            flagged = flagged.len(),
            "identity enrolled"
        );

        Ok(EnrollOutcome {
            identity: identity.clone(),
            templates_added,
            flagged_for_review: flagged,
        })
    }

    /// Append samples to an existing identity.
    ///
    /// The new samples must be consistent with each other and with the stored
    /// templates. The check against the stored templates runs inside the
    /// store's write for this identity, so concurrent additions cannot both
    /// pass against the same snapshot. In an
    /// [`EnrollError::InconsistentSamples`] error, indices below
    /// `samples.len()` are new samples; higher indices are stored templates
    /// offset by `samples.len()`.
    pub fn add_samples(
        &self,
        identity: &IdentityId,
        samples: &[Sample],
    ) -> Result<EnrollOutcome, EnrollError> {
        if samples.is_empty() {
            return Err(EnrollError::TooFewSamples {
                required: 1,
                provided: 0,
            });
        }

        let (vectors, flagged) = self.sample_vectors(samples)?;
        self.check_consistency(&vectors)?;

        let templates: Vec<Template> = vectors
            .iter()
            .zip(samples)
            .map(|(vector, sample)| Template::new(vector.clone(), sample.quality))
            .collect();
        let templates_added = templates.len();

        let mut rejection = None;
        let appended = self.store.put_templates_if(identity, templates, &mut |stored| {
            if stored.is_empty() {
                rejection = Some(EnrollError::UnknownIdentity(identity.clone()));
                return false;
            }
            let mut combined = vectors.clone();
            combined.extend(stored.iter().map(|t| t.vector.clone()));
            match self.check_consistency(&combined) {
                Ok(()) => true,
                Err(err) => {
                    rejection = Some(err);
                    false
                }
            }
        })?;
        if !appended {
            return Err(rejection.unwrap_or_else(|| EnrollError::UnknownIdentity(identity.clone())));
        }

        tracing::info!(
            identity = %identity,
            templates = templates_added,
            "templates added"
        );

        Ok(EnrollOutcome {
            identity: identity.clone(),
            templates_added,
            flagged_for_review: flagged,
        })
    }

    /// Merge `metadata` into an identity's metadata.
    pub fn update_metadata(
        &self,
        identity: &IdentityId,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.update_metadata(identity, metadata)?;
        tracing::info!(identity = %identity, "metadata updated");
        Ok(())
    }

    /// Enrolled identities whose id or metadata contains `query`.
    pub fn search(&self, query: &str) -> Result<Vec<IdentitySummary>, StoreError> {
        self.store.search(query)
    }

    /// 1:1 verification against the configured threshold.
    pub fn verify(
        &self,
        identity: &IdentityId,
        faces: &[LandmarkSet],
    ) -> Result<Verification, MatchError> {
        self.verify_with_threshold(identity, faces, self.config.verification_threshold)
    }

    /// 1:1 verification: does the probe match `identity`?
    ///
    /// Fails with [`MatchError::UnknownIdentity`] before looking at the probe
    /// if the identity has no templates, then with [`MatchError::NoDetection`]
    /// if the probe has no usable face.
    pub fn verify_with_threshold(
        &self,
        identity: &IdentityId,
        faces: &[LandmarkSet],
        threshold: f32,
    ) -> Result<Verification, MatchError> {
        let templates = match self.store.get_templates(identity) {
            Ok(templates) => templates,
            Err(StoreError::NotFound(id)) => return Err(MatchError::UnknownIdentity(id)),
            Err(err) => return Err(err.into()),
        };
        if templates.is_empty() {
            return Err(MatchError::UnknownIdentity(identity.clone()));
        }

        let probe = self.probe_features(faces).ok_or(MatchError::NoDetection)?;
        let result = matcher::verify_templates(&probe, identity, &templates, threshold)
            .ok_or_else(|| MatchError::UnknownIdentity(identity.clone()))?;

        tracing::info!(
            identity = %identity,
            confidence = result.confidence,
            threshold,
            verified = result.matched,
            "verify decision"
        );

        Ok(Verification { result, threshold })
    }

    /// 1:N identification with the configured threshold. `top_k` defaults to
    /// the configured value.
    pub fn identify(
        &self,
        faces: &[LandmarkSet],
        top_k: Option<usize>,
    ) -> Result<Vec<MatchResult>, MatchError> {
        self.identify_with_threshold(
            faces,
            self.config.identification_threshold,
            top_k.unwrap_or(self.config.top_k),
        )
    }

    /// 1:N identification. A probe without usable geometry yields an empty list.
    pub fn identify_with_threshold(
        &self,
        faces: &[LandmarkSet],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<MatchResult>, MatchError> {
        let Some(probe) = self.probe_features(faces) else {
            tracing::debug!("identify: no usable face in probe");
            return Ok(Vec::new());
        };

        let gallery = self.store.all_identities()?;
        let results = matcher::identify_gallery(&probe, &gallery, threshold, top_k);

        tracing::info!(
            gallery = gallery.len(),
            candidates = results.len(),
            best = ?results.first().and_then(|r| r.identity.as_ref()).map(|id| id.as_str()),
            "identify decision"
        );

        Ok(results)
    }

    /// Delete an identity and its templates.
    pub fn remove_identity(&self, identity: &IdentityId) -> Result<usize, StoreError> {
        let removed = self.store.remove_identity(identity)?;
        tracing::info!(identity = %identity, templates = removed, "identity removed");
        Ok(removed)
    }

    /// Delete one template; the last template of an identity is never removed.
    pub fn remove_template(&self, identity: &IdentityId, template: Uuid) -> Result<(), StoreError> {
        self.store.remove_template(identity, template)?;
        tracing::info!(identity = %identity, template = %template, "template removed");
        Ok(())
    }

    /// Extract every sample, applying the geometry and quality gates.
    fn sample_vectors(
        &self,
        samples: &[Sample],
    ) -> Result<(Vec<FeatureVector>, Vec<usize>), EnrollError> {
        let mut vectors = Vec::with_capacity(samples.len());
        let mut flagged = Vec::new();

        for (i, sample) in samples.iter().enumerate() {
            if !sample.landmarks.is_usable() {
                return Err(EnrollError::NoDetection { sample: i });
            }
            if let Some(quality) = &sample.quality {
                if quality.quality_score < self.config.min_sample_quality {
                    return Err(EnrollError::LowQuality {
                        sample: i,
                        score: quality.quality_score,
                        minimum: self.config.min_sample_quality,
                    });
                }
                if quality.quality_score < self.config.review_quality {
                    tracing::warn!(
                        sample = i,
                        quality = quality.quality_score,
                        "low-quality enrollment sample flagged for review"
                    );
                    flagged.push(i);
                }
            }
            vectors.push(self.extractor.extract(&sample.landmarks));
        }

        Ok((vectors, flagged))
    }

    fn check_consistency(&self, vectors: &[FeatureVector]) -> Result<(), EnrollError> {
        let minimum = self.config.consistency_threshold;
        match find_inconsistent_pair(vectors, minimum) {
            Some(pair) => {
                tracing::warn!(
                    first = pair.first,
                    second = pair.second,
                    similarity = pair.similarity,
                    minimum,
                    "enrollment rejected: inconsistent samples"
                );
                Err(EnrollError::InconsistentSamples {
                    first: pair.first,
                    second: pair.second,
                    similarity: pair.similarity,
                    minimum,
                })
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::consistency::consistent;
    use crate::landmarks::Landmark;
    use crate::test_support::{collapsed_face, face, other_face, shifted_face};
    use serde_json::json;

    fn engine() -> Engine<MemoryStore> {
        Engine::new(
            FeatureExtractor::default(),
            MatchConfig::default(),
            MemoryStore::new(),
        )
    }

    fn samples(make: fn(usize) -> LandmarkSet) -> Vec<Sample> {
        (0..3).map(|seed| Sample::new(make(seed))).collect()
    }

    fn alice() -> IdentityId {
        IdentityId::from("alice")
    }

    #[test]
    fn test_enroll_then_verify_same_face() {
        let engine = engine();
        let outcome = engine
            .enroll(&alice(), &samples(face), json!({"name": "Alice"}))
            .unwrap();
        assert_eq!(outcome.templates_added, 3);
        assert!(outcome.flagged_for_review.is_empty());

        let verification = engine.verify(&alice(), &[face(0)]).unwrap();
        assert!(verification.verified());
        assert!(verification.confidence() > 0.999);
        assert_eq!(verification.result.best_template, Some(0));
        assert_eq!(verification.result.templates_compared, 3);
        assert!(verification.to_string().starts_with("verification successful"));
    }

    #[test]
    fn test_enroll_too_few_samples() {
        let engine = engine();
        let err = engine
            .enroll(&alice(), &[Sample::new(face(0))], json!(null))
            .unwrap_err();
        assert!(matches!(
            err,
            EnrollError::TooFewSamples {
                required: 3,
                provided: 1
            }
        ));
        assert!(engine.store().list_identities().unwrap().is_empty());
    }

    #[test]
    fn test_enroll_rejects_unusable_sample() {
        let engine = engine();
        let mut batch = samples(face);
        batch[1] = Sample::new(LandmarkSet::default());
        let err = engine.enroll(&alice(), &batch, json!(null)).unwrap_err();
        assert!(matches!(err, EnrollError::NoDetection { sample: 1 }));
    }

    #[test]
    fn test_enroll_rejects_inconsistent_batch() {
        let engine = engine();
        let mut batch = samples(face);
        batch[2] = Sample::new(collapsed_face());
        let err = engine.enroll(&alice(), &batch, json!(null)).unwrap_err();
        match err {
            EnrollError::InconsistentSamples {
                first,
                second,
                similarity,
                minimum,
            } => {
                assert_eq!((first, second), (0, 2));
                assert_eq!(similarity, 0.0);
                assert_eq!(minimum, 0.65);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            engine.verify(&alice(), &[face(0)]),
            Err(MatchError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn test_enroll_duplicate_identity() {
        let engine = engine();
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        let err = engine
            .enroll(&alice(), &samples(face), json!(null))
            .unwrap_err();
        assert!(matches!(err, EnrollError::AlreadyEnrolled(_)));
        assert_eq!(engine.store().get_templates(&alice()).unwrap().len(), 3);
    }

    #[test]
    fn test_quality_gate_and_review_flag() {
        let config = MatchConfig {
            min_sample_quality: 0.2,
            ..MatchConfig::default()
        };
        let engine = Engine::new(FeatureExtractor::default(), config, MemoryStore::new());

        let good = QualityMetrics::from_components(1.0, 0.55, 1.0);
        let fair = QualityMetrics::from_components(0.2, 0.55, 0.2);
        let poor = QualityMetrics::from_components(0.0, 0.0, 0.0);

        let mut batch = samples(face);
        batch[0].quality = Some(poor);
        let err = engine.enroll(&alice(), &batch, json!(null)).unwrap_err();
        assert!(matches!(err, EnrollError::LowQuality { sample: 0, .. }));

        batch[0].quality = Some(good);
        batch[1].quality = Some(fair);
        let outcome = engine.enroll(&alice(), &batch, json!(null)).unwrap();
        assert_eq!(outcome.flagged_for_review, vec![1]);
        let stored = engine.store().get_templates(&alice()).unwrap();
        assert_eq!(stored[1].quality, Some(fair));
        assert_eq!(stored[2].quality, None);
    }

    #[test]
    fn test_verify_unknown_identity_checked_before_probe() {
        let engine = engine();
        assert!(matches!(
            engine.verify(&IdentityId::from("bob"), &[]),
            Err(MatchError::UnknownIdentity(id)) if id.as_str() == "bob"
        ));
    }

    #[test]
    fn test_verify_without_face() {
        let engine = engine();
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        assert!(matches!(
            engine.verify(&alice(), &[]),
            Err(MatchError::NoDetection)
        ));
        assert!(matches!(
            engine.verify(&alice(), &[LandmarkSet::default(), face(0)]),
            Err(MatchError::NoDetection)
        ));
    }

    #[test]
    fn test_verify_threshold_is_inclusive() {
        let engine = engine();
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        let confidence = engine.verify(&alice(), &[face(1)]).unwrap().confidence();
        let at = engine
            .verify_with_threshold(&alice(), &[face(1)], confidence)
            .unwrap();
        assert!(at.verified());
        let above = engine
            .verify_with_threshold(&alice(), &[face(1)], 1.5)
            .unwrap();
        assert!(!above.verified());
        assert!(above.to_string().starts_with("verification failed"));
    }

    #[test]
    fn test_identify_ranks_enrolled_face_first() {
        let engine = engine();
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        engine
            .enroll(&IdentityId::from("bob"), &samples(other_face), json!(null))
            .unwrap();

        let results = engine.identify_with_threshold(&[face(0)], 0.0, 5).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].identity, Some(alice()));
        assert!(results[0].confidence >= results[1].confidence);
        assert!(results.iter().all(|r| r.matched));

        let top1 = engine.identify_with_threshold(&[face(0)], 0.0, 1).unwrap();
        assert_eq!(top1.len(), 1);
        assert_eq!(top1[0].identity, Some(alice()));
    }

    #[test]
    fn test_identify_no_face_or_empty_gallery() {
        let engine = engine();
        assert!(engine.identify(&[face(0)], None).unwrap().is_empty());
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        assert!(engine.identify(&[], None).unwrap().is_empty());
        assert!(engine.identify(&[face(0)], Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_add_samples() {
        let engine = engine();
        assert!(matches!(
            engine.add_samples(&alice(), &[Sample::new(face(3))]),
            Err(EnrollError::UnknownIdentity(_))
        ));

        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        let outcome = engine
            .add_samples(&alice(), &[Sample::new(face(3))])
            .unwrap();
        assert_eq!(outcome.templates_added, 1);
        assert_eq!(engine.store().get_templates(&alice()).unwrap().len(), 4);

        let err = engine
            .add_samples(&alice(), &[Sample::new(collapsed_face())])
            .unwrap_err();
        assert!(matches!(
            err,
            EnrollError::InconsistentSamples {
                first: 0,
                second: 1,
                ..
            }
        ));
        assert_eq!(engine.store().get_templates(&alice()).unwrap().len(), 4);

        assert!(matches!(
            engine.add_samples(&alice(), &[]),
            Err(EnrollError::TooFewSamples { .. })
        ));
    }

    #[test]
    fn test_concurrent_add_samples_keep_identity_consistent() {
        // Chin pushed 0.12 left or right: each variant stays close to the
        // enrolled face (> 0.996) but the two are further apart (< 0.990).
        let config = MatchConfig {
            consistency_threshold: 0.993,
            ..MatchConfig::default()
        };
        let engine = Engine::new(FeatureExtractor::default(), config, MemoryStore::new());
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();

        let left = Sample::new(shifted_face(3, Landmark::Chin, [0.12, 0.0, 0.0]));
        let right = Sample::new(shifted_face(4, Landmark::Chin, [-0.12, 0.0, 0.0]));
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<Result<EnrollOutcome, EnrollError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = [left, right]
                .into_iter()
                .map(|sample| {
                    let engine = &engine;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        engine.add_samples(&alice(), &[sample])
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(EnrollError::InconsistentSamples { first: 0, .. })
        )));

        let stored: Vec<FeatureVector> = engine
            .store()
            .get_templates(&alice())
            .unwrap()
            .into_iter()
            .map(|t| t.vector)
            .collect();
        assert_eq!(stored.len(), 4);
        assert!(consistent(&stored, 0.993));
    }

    #[test]
    fn test_update_metadata_and_search() {
        let engine = engine();
        engine
            .enroll(&alice(), &samples(face), json!({"name": "Alice"}))
            .unwrap();
        engine
            .update_metadata(&alice(), json!({"badge": "B-17"}))
            .unwrap();
        let found = engine.search("b-1").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata, json!({"name": "Alice", "badge": "B-17"}));
        assert!(matches!(
            engine.update_metadata(&IdentityId::from("bob"), json!({})),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_template_and_identity() {
        let engine = engine();
        engine.enroll(&alice(), &samples(face), json!(null)).unwrap();
        let ids: Vec<Uuid> = engine
            .store()
            .get_templates(&alice())
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();

        engine.remove_template(&alice(), ids[0]).unwrap();
        engine.remove_template(&alice(), ids[1]).unwrap();
        assert!(matches!(
            engine.remove_template(&alice(), ids[2]),
            Err(StoreError::LastTemplate(_))
        ));

        assert_eq!(engine.remove_identity(&alice()).unwrap(), 1);
        assert!(matches!(
            engine.verify(&alice(), &[face(0)]),
            Err(MatchError::UnknownIdentity(_))
        ));
    }
}
