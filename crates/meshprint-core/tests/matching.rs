mod common;

use common::{collapsed_face, face, other_face, samples};
use meshprint_core::{
    EnrollError, Engine, FeatureExtractor, IdentityId, MatchConfig, MatchError, MemoryStore,
    TemplateStore,
};
use serde_json::json;
use std::sync::Arc;

fn engine() -> Engine<MemoryStore> {
    Engine::new(
        FeatureExtractor::default(),
        MatchConfig::default(),
        MemoryStore::new(),
    )
}

#[test]
fn test_enroll_verify_and_unknown_identity() {
    let engine = engine();
    let alice = IdentityId::from("alice");
    engine
        .enroll(&alice, &samples(face, 3), json!({"department": "research"}))
        .unwrap();

    let verification = engine.verify(&alice, &[face(2)]).unwrap();
    assert!(verification.verified());
    assert!((verification.confidence() - 1.0).abs() < 1e-4);

    assert!(matches!(
        engine.verify(&IdentityId::from("bob"), &[face(2)]),
        Err(MatchError::UnknownIdentity(_))
    ));
}

#[test]
fn test_failed_enrollment_leaves_nothing_behind() {
    let engine = engine();
    let alice = IdentityId::from("alice");
    let mut batch = samples(face, 3);
    batch[1].landmarks = collapsed_face();

    assert!(matches!(
        engine.enroll(&alice, &batch, json!(null)),
        Err(EnrollError::InconsistentSamples { first: 0, second: 1, .. })
    ));
    assert!(engine.store().list_identities().unwrap().is_empty());
    assert!(engine.identify(&[face(0)], None).unwrap().is_empty());
}

#[test]
fn test_identification_prefers_the_enrolled_face() {
    let engine = engine();
    engine
        .enroll(&IdentityId::from("alice"), &samples(face, 3), json!(null))
        .unwrap();
    engine
        .enroll(&IdentityId::from("bob"), &samples(other_face, 3), json!(null))
        .unwrap();

    let for_alice = engine.identify_with_threshold(&[face(1)], 0.0, 5).unwrap();
    assert_eq!(for_alice[0].identity, Some(IdentityId::from("alice")));

    let for_bob = engine.identify_with_threshold(&[other_face(1)], 0.0, 5).unwrap();
    assert_eq!(for_bob[0].identity, Some(IdentityId::from("bob")));

    for results in [&for_alice, &for_bob] {
        assert!(results
            .windows(2)
            .all(|pair| pair[0].confidence >= pair[1].confidence));
    }
}

#[test]
fn test_identification_threshold_filters() {
    let engine = engine();
    engine
        .enroll(&IdentityId::from("alice"), &samples(face, 3), json!(null))
        .unwrap();
    let results = engine.identify_with_threshold(&[face(0)], 1.01, 5).unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_repeated_queries_are_identical() {
    let engine = engine();
    engine
        .enroll(&IdentityId::from("alice"), &samples(face, 3), json!(null))
        .unwrap();
    engine
        .enroll(&IdentityId::from("bob"), &samples(other_face, 3), json!(null))
        .unwrap();

    let first = engine.identify_with_threshold(&[face(4)], 0.0, 5).unwrap();
    let second = engine.identify_with_threshold(&[face(4)], 0.0, 5).unwrap();
    assert_eq!(first, second);

    let a = engine.verify(&IdentityId::from("bob"), &[face(4)]).unwrap();
    let b = engine.verify(&IdentityId::from("bob"), &[face(4)]).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_concurrent_verification_and_enrollment() {
    let engine = Arc::new(engine());
    engine
        .enroll(&IdentityId::from("alice"), &samples(face, 3), json!(null))
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let id = IdentityId::new(format!("user{i}"));
                engine.enroll(&id, &samples(face, 3), json!(null)).unwrap();
                for seed in 0..10 {
                    let verification = engine.verify(&IdentityId::from("alice"), &[face(seed)]).unwrap();
                    assert!(verification.verified());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.store().stats().unwrap().identities, 5);
}
