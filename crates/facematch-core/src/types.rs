use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Face embedding vector as produced by the embedding model (typically 128 or 512-dimensional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., the ONNX file stem).
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Distance to another embedding under the given metric.
    pub fn distance(&self, other: &Embedding, metric: Metric) -> f64 {
        metric.distance(&self.values, &other.values)
    }
}

/// Distance metric used to compare two embeddings.
///
/// All arithmetic is done in `f64` regardless of the `f32` storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cos(a, b)`, in [0, 2]. Lower = more similar.
    #[default]
    Cosine,
    /// L2 distance, in [0, inf).
    Euclidean,
}

impl Metric {
    /// Compute the distance between two equal-length vectors.
    ///
    /// Callers are responsible for the length check; extra trailing
    /// components of the longer slice are ignored.
    pub fn distance(self, a: &[f32], b: &[f32]) -> f64 {
        match self {
            Metric::Cosine => cosine_distance(a, b),
            Metric::Euclidean => euclidean_distance(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric '{0}' (expected 'cosine' or 'euclidean')")]
pub struct ParseMetricError(String);

impl FromStr for Metric {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            other => Err(ParseMetricError(other.to_string())),
        }
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    match (norm_a > 0.0, norm_b > 0.0) {
        // Two zero vectors are identical.
        (false, false) => 0.0,
        (true, true) => {
            // sqrt(n * n) == n exactly, so a vector against itself yields 0.
            let cos = dot / (norm_a * norm_b).sqrt();
            (1.0 - cos).clamp(0.0, 2.0)
        }
        _ => 1.0,
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// The persisted unit: one embedding enrolled under one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: String,
    pub name: String,
    pub values: Vec<f32>,
    /// RFC 3339 enrollment time.
    pub created_at: String,
}

impl EmbeddingRecord {
    /// Create a record with a fresh UUID and the current time.
    pub fn new(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            values,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One row of [`EmbeddingStore::list`](crate::EmbeddingStore::list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub name: String,
    pub count: usize,
}

/// Best match returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub name: String,
    /// ID of the stored embedding that produced the match.
    pub embedding_id: String,
    pub distance: f64,
}
