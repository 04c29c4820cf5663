//! facematch-core — Face embedding store and similarity search.
//!
//! Holds enrolled embeddings per identity, answers nearest-identity queries
//! under cosine or Euclidean distance, and defines the persistence and
//! embedding-function seams the daemon plugs into.

pub mod embedder;
pub mod persistence;
pub mod search;
pub mod store;
pub mod types;

pub use embedder::{Embedder, EmbedError, EmbedderOptions, OnnxEmbedder};
pub use persistence::{DirectoryPersistence, MemoryPersistence, PersistenceAdapter, PersistenceError};
pub use search::{LinearScan, Matcher};
pub use store::{EmbeddingStore, Gallery, Listing, StoreConfig, StoreError};
pub use types::{Embedding, EmbeddingRecord, IdentitySummary, Match, Metric};

/// Default data directory: `$XDG_DATA_HOME/facematch` or `~/.local/share/facematch`.
pub fn default_data_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
}
