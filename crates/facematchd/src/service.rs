//! Enrollment and recognition.
//!
//! Embedding and persistence I/O run without holding any store lock. Mutations
//! are serialised by an async write gate so the persisted set and the in-memory
//! gallery never diverge; queries never take the gate.

use crate::engine::{EngineError, EngineHandle};
use facematch_core::{
    EmbedError, EmbeddingRecord, EmbeddingStore, IdentitySummary, Match, Metric,
    PersistenceAdapter, PersistenceError, StoreError,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid image data: {0}")]
    Decode(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("storage failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("embedding engine failed: {0}")]
    Engine(String),
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Embed(EmbedError::Decode(msg)) => ServiceError::Decode(msg),
            EngineError::Embed(EmbedError::NoFaceDetected) => ServiceError::NoFaceDetected,
            other => ServiceError::Engine(other.to_string()),
        }
    }
}

impl ServiceError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Decode(_) => "DecodeError",
            ServiceError::NoFaceDetected => "NoFaceDetected",
            ServiceError::Store(StoreError::EmptyName) => "EmptyName",
            ServiceError::Store(StoreError::NotFound(_)) => "NotFound",
            ServiceError::Store(StoreError::InvalidDimension { .. })
            | ServiceError::Store(StoreError::EmptyVector) => "InvalidDimension",
            ServiceError::Store(StoreError::NonFiniteValue) => "NonFiniteValue",
            ServiceError::Persistence(_) => "PersistenceError",
            ServiceError::Engine(_) => "EngineError",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub name: String,
    pub embedding_id: String,
    /// Embeddings now enrolled under `name`.
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub matched: bool,
    pub name: Option<String>,
    pub distance: Option<f64>,
    pub metric: Metric,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Removal {
    pub name: String,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub backend: String,
    pub metric: Metric,
    pub threshold: f64,
    pub dimension: Option<usize>,
    pub identities: usize,
    pub embeddings: usize,
}

pub struct FaceService {
    engine: EngineHandle,
    store: Arc<EmbeddingStore>,
    persistence: Arc<dyn PersistenceAdapter>,
    metric: Metric,
    threshold: f64,
    write_gate: Mutex<()>,
}

/// Run a persistence call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
{
    let out = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Backend(format!("storage task failed: {e}")))?;
    Ok(out?)
}

impl FaceService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<EmbeddingStore>,
        persistence: Arc<dyn PersistenceAdapter>,
        metric: Metric,
        threshold: f64,
    ) -> Self {
        Self {
            engine,
            store,
            persistence,
            metric,
            threshold,
            write_gate: Mutex::new(()),
        }
    }

    /// Embed `image` and enroll it under `name`.
    pub async fn enroll(&self, name: &str, image: Vec<u8>) -> Result<Enrollment, ServiceError> {
        // Reject before paying for inference.
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName.into());
        }
        let embedding = self.engine.embed(image).await?;

        let _gate = self.write_gate.lock().await;
        self.store.check(name, &embedding.values)?;

        let persistence = Arc::clone(&self.persistence);
        let record = EmbeddingRecord::new(name, embedding.values);
        let record = blocking(move || persistence.save(&record).map(|_| record)).await?;
        let embedding_id = record.id.clone();

        // Only reachable if the store is written outside the gate. The save is
        // undone so storage never holds a record the gallery lacks.
        if let Err(e) = self.store.insert_record(record) {
            tracing::warn!(name, id = %embedding_id, error = %e, "insert failed after save; rolling back");
            let persistence = Arc::clone(&self.persistence);
            let id = embedding_id.clone();
            if let Err(rb) = blocking(move || persistence.delete_record(&id)).await {
                tracing::error!(id = %embedding_id, error = %rb, "rollback failed; record orphaned until restart");
            }
            return Err(e.into());
        }

        let count = self
            .store
            .snapshot()
            .get(name)
            .map_or(0, |i| i.vectors().len());
        tracing::info!(name, id = %embedding_id, count, "face enrolled");

        Ok(Enrollment {
            name: name.to_string(),
            embedding_id,
            count,
        })
    }

    /// Embed `image` and find the closest enrolled identity within the threshold.
    pub async fn identify(&self, image: Vec<u8>) -> Result<Identification, ServiceError> {
        let embedding = self.engine.embed(image).await?;
        let best = self.store.query(&embedding.values, self.metric, self.threshold)?;

        match &best {
            Some(m) => tracing::info!(name = %m.name, distance = m.distance, "face identified"),
            None => tracing::info!(gallery = self.store.len(), "no matching face"),
        }

        Ok(Identification {
            matched: best.is_some(),
            distance: best.as_ref().map(|m| m.distance),
            name: best.map(|m| m.name),
            metric: self.metric,
            threshold: self.threshold,
        })
    }

    /// Closest `k` identities regardless of threshold.
    pub async fn rank(&self, image: Vec<u8>, k: usize) -> Result<Vec<Match>, ServiceError> {
        let embedding = self.engine.embed(image).await?;
        Ok(self.store.rank(&embedding.values, self.metric, k)?)
    }

    pub fn list(&self) -> Vec<IdentitySummary> {
        self.store.list().iter().collect()
    }

    /// Delete every embedding of `name`, durably first.
    pub async fn remove(&self, name: &str) -> Result<Removal, ServiceError> {
        let _gate = self.write_gate.lock().await;
        if !self.store.contains(name) {
            return Err(StoreError::NotFound(name.to_string()).into());
        }

        let persistence = Arc::clone(&self.persistence);
        let owned = name.to_string();
        let persisted = match blocking(move || persistence.delete(&owned)).await {
            Ok(n) => n,
            Err(ServiceError::Persistence(err)) => {
                if let PersistenceError::PartialDelete { removed, total, .. } = &err {
                    // Drop what is already gone from storage so both sides agree.
                    let dropped = self.store.remove_vectors(name, removed).unwrap_or(0);
                    tracing::error!(name, dropped, total, error = %err, "remove failed part way; gallery resynced");
                }
                return Err(err.into());
            }
            Err(e) => return Err(e),
        };
        let removed = self.store.remove(name)?;
        if persisted != removed {
            tracing::warn!(name, persisted, removed, "persisted and in-memory counts differ");
        }
        tracing::info!(name, removed, "identity removed");

        Ok(Removal {
            name: name.to_string(),
            removed,
        })
    }

    pub fn status(&self) -> Status {
        let snapshot = self.store.snapshot();
        Status {
            version: env!("CARGO_PKG_VERSION"),
            backend: self.persistence.describe(),
            metric: self.metric,
            threshold: self.threshold,
            dimension: snapshot.dimension(),
            identities: snapshot.identity_count(),
            embeddings: snapshot.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::testing::TextEmbedder;
    use facematch_core::{MemoryPersistence, StoreConfig};

    struct BrokenPersistence;

    impl PersistenceAdapter for BrokenPersistence {
        fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
            Ok(Vec::new())
        }
        fn save(&self, _: &EmbeddingRecord) -> Result<(), PersistenceError> {
            Err(PersistenceError::Backend("disk on fire".into()))
        }
        fn delete(&self, _: &str) -> Result<usize, PersistenceError> {
            Err(PersistenceError::Backend("disk on fire".into()))
        }
        fn delete_record(&self, _: &str) -> Result<bool, PersistenceError> {
            Ok(false)
        }
        fn describe(&self) -> String {
            "broken".into()
        }
    }

    /// Fails every multi-record delete after removing the first match.
    struct FlakyDelete(MemoryPersistence);

    impl PersistenceAdapter for FlakyDelete {
        fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
            self.0.load()
        }
        fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError> {
            self.0.save(record)
        }
        fn delete(&self, name: &str) -> Result<usize, PersistenceError> {
            let matching: Vec<_> = self.0.load()?.into_iter().filter(|r| r.name == name).collect();
            let first = matching[0].id.clone();
            self.0.delete_record(&first)?;
            Err(PersistenceError::PartialDelete {
                removed: vec![first],
                total: matching.len(),
                source: Box::new(PersistenceError::Backend("unlink failed".into())),
            })
        }
        fn delete_record(&self, id: &str) -> Result<bool, PersistenceError> {
            self.0.delete_record(id)
        }
        fn describe(&self) -> String {
            "flaky".into()
        }
    }

    /// Writes a conflicting vector straight into the store while saving.
    struct RacingWriter {
        inner: MemoryPersistence,
        store: Arc<EmbeddingStore>,
    }

    impl PersistenceAdapter for RacingWriter {
        fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
            self.inner.load()
        }
        fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError> {
            self.store.insert("intruder", vec![1.0; record.values.len() + 1]).unwrap();
            self.inner.save(record)
        }
        fn delete(&self, name: &str) -> Result<usize, PersistenceError> {
            self.inner.delete(name)
        }
        fn delete_record(&self, id: &str) -> Result<bool, PersistenceError> {
            self.inner.delete_record(id)
        }
        fn describe(&self) -> String {
            "racing".into()
        }
    }

    fn service_with(persistence: Arc<dyn PersistenceAdapter>) -> FaceService {
        let engine = spawn_engine(Box::new(TextEmbedder)).unwrap();
        let store = Arc::new(EmbeddingStore::new(StoreConfig::default()));
        FaceService::new(engine, store, persistence, Metric::Cosine, 0.4)
    }

    fn service() -> (FaceService, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        (service_with(persistence.clone()), persistence)
    }

    #[tokio::test]
    async fn test_enroll_then_identify() {
        let (svc, _) = service();
        svc.enroll("alice", b"0.1,0.2,0.3,0.4".to_vec()).await.unwrap();
        svc.enroll("bob", b"0.9,0.8,0.7,0.6".to_vec()).await.unwrap();

        let id = svc.identify(b"0.12,0.21,0.29,0.41".to_vec()).await.unwrap();
        assert!(id.matched);
        assert_eq!(id.name.as_deref(), Some("alice"));
        assert!(id.distance.unwrap() < 0.4);
    }

    #[tokio::test]
    async fn test_identify_empty_gallery_is_no_match() {
        let (svc, _) = service();
        let id = svc.identify(b"1,0,0".to_vec()).await.unwrap();
        assert!(!id.matched);
        assert_eq!(id.name, None);
        assert_eq!(id.distance, None);
    }

    #[tokio::test]
    async fn test_enroll_persists_record() {
        let (svc, persistence) = service();
        let e = svc.enroll("alice", b"1,0".to_vec()).await.unwrap();
        let e2 = svc.enroll("alice", b"0.9,0.1".to_vec()).await.unwrap();
        assert_eq!(e2.count, 2);

        let saved = persistence.load().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].id, e.embedding_id);
        assert_eq!(saved[0].values, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let (svc, _) = service();
        svc.enroll("alice", b"1,0".to_vec()).await.unwrap();

        let cases: [(Result<Enrollment, ServiceError>, &str); 4] = [
            (svc.enroll("  ", b"1,0".to_vec()).await, "EmptyName"),
            (svc.enroll("bob", vec![0xff]).await, "DecodeError"),
            (svc.enroll("bob", b"noface".to_vec()).await, "NoFaceDetected"),
            (svc.enroll("bob", b"1,0,0".to_vec()).await, "InvalidDimension"),
        ];
        for (result, kind) in cases {
            assert_eq!(result.unwrap_err().kind(), kind);
        }
        assert_eq!(svc.identify(b"1".to_vec()).await.unwrap_err().kind(), "InvalidDimension");
        assert_eq!(svc.remove("nobody").await.unwrap_err().kind(), "NotFound");
        assert_eq!(svc.list().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_store_unchanged() {
        let svc = service_with(Arc::new(BrokenPersistence));
        let err = svc.enroll("alice", b"1,0".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), "PersistenceError");
        assert!(svc.list().is_empty());
        assert_eq!(svc.status().dimension, None);
    }

    #[tokio::test]
    async fn test_partial_remove_resyncs_gallery() {
        let persistence = Arc::new(FlakyDelete(MemoryPersistence::new()));
        let svc = service_with(persistence.clone());
        svc.enroll("alice", b"1,0".to_vec()).await.unwrap();
        svc.enroll("alice", b"0,1".to_vec()).await.unwrap();
        svc.enroll("bob", b"1,1".to_vec()).await.unwrap();

        let err = svc.remove("alice").await.unwrap_err();
        assert_eq!(err.kind(), "PersistenceError");

        let on_disk = persistence.load().unwrap();
        let alice_on_disk = on_disk.iter().filter(|r| r.name == "alice").count();
        let listed = svc.list();
        let alice = listed.iter().find(|s| s.name == "alice").unwrap();
        assert_eq!(alice_on_disk, 1);
        assert_eq!(alice.count, 1);
        assert_eq!(svc.status().embeddings, on_disk.len());
    }

    #[tokio::test]
    async fn test_insert_failure_after_save_rolls_back() {
        let store = Arc::new(EmbeddingStore::new(StoreConfig::default()));
        let persistence = Arc::new(RacingWriter {
            inner: MemoryPersistence::new(),
            store: Arc::clone(&store),
        });
        let engine = spawn_engine(Box::new(TextEmbedder)).unwrap();
        let svc = FaceService::new(engine, Arc::clone(&store), persistence.clone(), Metric::Cosine, 0.4);

        let err = svc.enroll("alice", b"1,0".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidDimension");
        assert!(persistence.load().unwrap().is_empty());
        assert!(!store.contains("alice"));
    }

    #[tokio::test]
    async fn test_remove_is_durable_and_not_repeatable() {
        let (svc, persistence) = service();
        svc.enroll("alice", b"1,0".to_vec()).await.unwrap();
        svc.enroll("alice", b"0,1".to_vec()).await.unwrap();
        svc.enroll("bob", b"1,1".to_vec()).await.unwrap();

        let r = svc.remove("alice").await.unwrap();
        assert_eq!(r.removed, 2);
        assert!(persistence.load().unwrap().iter().all(|rec| rec.name == "bob"));
        assert_eq!(svc.remove("alice").await.unwrap_err().kind(), "NotFound");

        let id = svc.identify(b"1,0".to_vec()).await.unwrap();
        assert_ne!(id.name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_rank_and_status() {
        let (svc, _) = service();
        svc.enroll("a", b"1,0".to_vec()).await.unwrap();
        svc.enroll("b", b"0,1".to_vec()).await.unwrap();
        svc.enroll("c", b"-1,0".to_vec()).await.unwrap();

        let ranked = svc.rank(b"0.9,0.1".to_vec(), 2).await.unwrap();
        let names: Vec<_> = ranked.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);

        let status = svc.status();
        assert_eq!(status.identities, 3);
        assert_eq!(status.embeddings, 3);
        assert_eq!(status.dimension, Some(2));
        assert_eq!(status.backend, "memory");
    }

    #[tokio::test]
    async fn test_concurrent_enrollments_stay_consistent() {
        let (svc, persistence) = service();
        let svc = Arc::new(svc);
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let svc = Arc::clone(&svc);
                tokio::spawn(async move {
                    svc.enroll(&format!("p{}", i % 5), format!("{i},1").into_bytes()).await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(persistence.load().unwrap().len(), 20);
        let counts: usize = svc.list().iter().map(|s| s.count).sum();
        assert_eq!(counts, 20);
    }
}
