use facematch_core::embedder::{DEFAULT_INPUT_SIZE, DEFAULT_MIN_FACE_CONFIDENCE};
use facematch_core::{EmbedderOptions, Metric, StoreConfig};
use std::path::PathBuf;

const DEFAULT_THRESHOLD: f64 = 0.40;

/// Where enrolled embeddings are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Encrypted SQLite database.
    Sqlite,
    /// One JSON file per embedding.
    Directory,
    /// Nothing persisted; the gallery is lost on exit.
    Memory,
}

/// Which message bus to serve on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the ONNX embedding model.
    pub model_path: PathBuf,
    pub backend: Backend,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory for the `dir` backend.
    pub store_dir: PathBuf,
    /// Key file for embedding encryption (created on first start).
    pub key_path: PathBuf,
    pub metric: Metric,
    /// Maximum distance for a positive match.
    pub threshold: f64,
    /// Fixed embedding dimension; otherwise taken from the first enrollment.
    pub embedding_dim: Option<usize>,
    /// Side length of the square model input.
    pub input_size: u32,
    /// Minimum face score, for models that output one.
    pub min_face_confidence: f32,
    pub bus: Bus,
}

impl Config {
    /// Load configuration from `FACEMATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FACEMATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facematch_core::default_data_dir());

        let model_path = std::env::var("FACEMATCH_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models/embedding.onnx"));

        let backend = match std::env::var("FACEMATCH_BACKEND").as_deref() {
            Ok("dir") | Ok("directory") => Backend::Directory,
            Ok("memory") => Backend::Memory,
            Ok("sqlite") | Err(_) => Backend::Sqlite,
            Ok(other) => {
                tracing::warn!(value = other, "unknown FACEMATCH_BACKEND; using sqlite");
                Backend::Sqlite
            }
        };

        let metric = match std::env::var("FACEMATCH_METRIC") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "bad FACEMATCH_METRIC; using cosine");
                Metric::Cosine
            }),
            Err(_) => Metric::Cosine,
        };

        let bus = match std::env::var("FACEMATCH_BUS").as_deref() {
            Ok("system") => Bus::System,
            _ => Bus::Session,
        };

        Self {
            model_path,
            backend,
            db_path: env_path("FACEMATCH_DB_PATH", data_dir.join("faces.db")),
            store_dir: env_path("FACEMATCH_STORE_DIR", data_dir.join("faces")),
            key_path: env_path("FACEMATCH_KEY_PATH", data_dir.join("embedding.key")),
            metric,
            threshold: parse_threshold(std::env::var("FACEMATCH_THRESHOLD").ok().as_deref()),
            embedding_dim: std::env::var("FACEMATCH_EMBEDDING_DIM")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&d: &usize| d > 0),
            input_size: env_u32("FACEMATCH_INPUT_SIZE", DEFAULT_INPUT_SIZE),
            min_face_confidence: env_f32("FACEMATCH_MIN_FACE_CONFIDENCE", DEFAULT_MIN_FACE_CONFIDENCE),
            bus,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            dimension: self.embedding_dim,
        }
    }

    pub fn embedder_options(&self) -> EmbedderOptions {
        EmbedderOptions {
            input_size: self.input_size,
            min_face_confidence: self.min_face_confidence,
        }
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

/// Threshold must be a finite, non-negative distance; anything else falls back
/// to the default.
fn parse_threshold(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else {
        return DEFAULT_THRESHOLD;
    };
    match raw.trim().parse::<f64>() {
        Ok(t) if t.is_finite() && t >= 0.0 => t,
        _ => {
            tracing::warn!(value = raw, default = DEFAULT_THRESHOLD, "bad FACEMATCH_THRESHOLD; using default");
            DEFAULT_THRESHOLD
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_default_when_unset() {
        assert_eq!(parse_threshold(None), DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_threshold_accepts_finite_non_negative() {
        assert_eq!(parse_threshold(Some("0.55")), 0.55);
        assert_eq!(parse_threshold(Some(" 0 ")), 0.0);
        assert_eq!(parse_threshold(Some("1.2")), 1.2);
    }

    #[test]
    fn test_threshold_rejects_nan_inf_negative_and_garbage() {
        for raw in ["NaN", "nan", "inf", "-inf", "-0.1", "close", ""] {
            assert_eq!(parse_threshold(Some(raw)), DEFAULT_THRESHOLD, "{raw}");
        }
    }
}
