use crate::quality::QualityMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an enrolled subject.
///
/// Ordering is plain string ordering; identification uses it to break
/// confidence ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank ids are rejected by every store.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for IdentityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Geometric feature vector derived from one landmark set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A vector with zero norm (or any non-finite value) cannot be compared meaningfully.
    pub fn is_degenerate(&self) -> bool {
        let norm_sq: f32 = self.values.iter().map(|v| v * v).sum();
        norm_sq <= 0.0 || !norm_sq.is_finite()
    }

    /// Cosine similarity rescaled from [-1, 1] into [0, 1].
    ///
    /// Symmetric, and 1.0 for any non-degenerate vector compared with itself.
    /// A degenerate operand scores 0.0 so it can never pass a threshold.
    /// Always processes all dimensions.
    ///
    /// # Panics
    /// Panics when the vectors differ in length.
    pub fn similarity(&self, other: &FeatureVector) -> f32 {
        assert_eq!(
            self.len(),
            other.len(),
            "feature vector length mismatch"
        );

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom <= 0.0 || !denom.is_finite() {
            return 0.0;
        }
        let cosine = dot / denom;
        if cosine.is_nan() {
            return 0.0;
        }
        ((cosine + 1.0) * 0.5).clamp(0.0, 1.0)
    }

    /// Euclidean distance between two vectors. Diagnostics only; never used for decisions.
    ///
    /// # Panics
    /// Panics when the vectors differ in length.
    pub fn distance(&self, other: &FeatureVector) -> f32 {
        assert_eq!(
            self.len(),
            other.len(),
            "feature vector length mismatch"
        );
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One stored enrollment sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub vector: FeatureVector,
    /// Quality of the source image, when one was available at enrollment.
    pub quality: Option<QualityMetrics>,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn new(vector: FeatureVector, quality: Option<QualityMetrics>) -> Self {
        Self {
            id: Uuid::new_v4(),
            vector,
            quality,
            created_at: Utc::now(),
        }
    }
}

/// An enrolled subject with all of its templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub templates: Vec<Template>,
    /// Caller-defined data (display name, consent notes, ...). Never interpreted.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing view of an identity without its vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub template_count: usize,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Identity> for IdentitySummary {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            template_count: identity.templates.len(),
            metadata: identity.metadata.clone(),
            created_at: identity.created_at,
            updated_at: identity.updated_at,
        }
    }
}

impl IdentitySummary {
    /// Case-insensitive substring match against the id and any string value in
    /// the metadata (nested values included).
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.id.as_str().to_lowercase().contains(&query) || value_contains(&self.metadata, &query)
    }
}

fn value_contains(value: &serde_json::Value, query: &str) -> bool {
    use serde_json::Value;
    match value {
        Value::String(s) => s.to_lowercase().contains(query),
        Value::Array(items) => items.iter().any(|v| value_contains(v, query)),
        Value::Object(map) => map.values().any(|v| value_contains(v, query)),
        _ => false,
    }
}

/// Apply a metadata update: object keys are merged into an object, anything
/// else replaces the stored value.
pub fn merge_metadata(stored: &mut serde_json::Value, update: serde_json::Value) {
    use serde_json::Value;
    match (stored, update) {
        (Value::Object(stored), Value::Object(update)) => stored.extend(update),
        (stored, update) => *stored = update,
    }
}

/// Outcome of comparing a probe against one identity's templates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity: Option<IdentityId>,
    /// Protocol confidence in [0, 1]; see `matcher` for how each protocol derives it.
    pub confidence: f32,
    pub max_similarity: f32,
    pub avg_similarity: f32,
    pub matched: bool,
    /// Index of the best-scoring template, if any were compared.
    pub best_template: Option<usize>,
    pub templates_compared: usize,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            max_similarity: 0.0,
            avg_similarity: 0.0,
            matched: false,
            best_template: None,
            templates_compared: 0,
        }
    }
}
