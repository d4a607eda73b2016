//! meshprint-core — Face geometry matching engine.
//!
//! Turns 3D facial landmarks into a fixed 22-dimensional geometric feature
//! vector, compares vectors by cosine similarity mapped onto [0, 1], and runs
//! 1:1 verification and 1:N identification against enrolled templates.
//! Persistence sits behind the [`TemplateStore`] trait.

pub mod config;
pub mod consistency;
pub mod engine;
pub mod features;
pub mod landmarks;
pub mod matcher;
pub mod quality;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::MatchConfig;
pub use engine::{EnrollError, EnrollOutcome, Engine, MatchError, Sample, Verification};
pub use features::{FeatureExtractor, FEATURE_DIM};
pub use landmarks::{Landmark, LandmarkSet, LandmarkTable, Point3};
pub use quality::{QualityError, QualityMetrics};
pub use store::{MemoryStore, StoreError, StoreStats, TemplateStore};
pub use types::{FeatureVector, Identity, IdentityId, IdentitySummary, MatchResult, Template};
