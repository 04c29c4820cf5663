//! In-memory embedding store.
//!
//! The gallery lives behind `RwLock<Arc<Gallery>>`. Writers clone the current
//! gallery, mutate the clone and swap it in while holding the write lock, so a
//! reader only ever sees a complete snapshot. Readers hold the read lock just
//! long enough to clone the `Arc` and then scan without any lock.
//!
//! Identities are shared between snapshots behind their own `Arc`; a write
//! copies only the identity it touches.

use crate::search::{LinearScan, Matcher};
use crate::types::{EmbeddingRecord, IdentitySummary, Match, Metric};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("expected {expected}-dim embedding, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
    #[error("embedding has no components")]
    EmptyVector,
    #[error("embedding contains NaN or infinite components")]
    NonFiniteValue,
    #[error("identity not found: {0}")]
    NotFound(String),
}

/// Store construction parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreConfig {
    /// Fixed embedding dimension. `None` lets the first insert establish it.
    pub dimension: Option<usize>,
}

/// One enrolled vector.
#[derive(Debug, Clone)]
pub struct StoredVector {
    id: String,
    seq: u64,
    created_at: String,
    values: Arc<[f32]>,
}

impl StoredVector {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Global insertion sequence number; lower = inserted earlier.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// A named identity and its enrolled vectors, in insertion order.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    vectors: Vec<StoredVector>,
}

impl Identity {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vectors(&self) -> &[StoredVector] {
        &self.vectors
    }
}

/// Immutable view of the store contents at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    dimension: Option<usize>,
    identities: Vec<Arc<Identity>>,
    next_seq: u64,
}

impl Gallery {
    fn with_config(config: StoreConfig) -> Self {
        Self {
            dimension: config.dimension,
            ..Self::default()
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Identities in order of first enrollment.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter().map(Arc::as_ref)
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Total number of stored vectors.
    pub fn len(&self) -> usize {
        self.identities.iter().map(|i| i.vectors.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.name == name).map(Arc::as_ref)
    }

    fn check_dimension(&self, actual: usize) -> Result<(), StoreError> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(StoreError::InvalidDimension { expected, actual })
            }
            _ => Ok(()),
        }
    }

    fn validate(&self, name: &str, values: &[f32]) -> Result<(), StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::EmptyName);
        }
        if values.is_empty() {
            return Err(StoreError::EmptyVector);
        }
        self.check_dimension(values.len())?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(StoreError::NonFiniteValue);
        }
        Ok(())
    }

    fn push(&mut self, record: EmbeddingRecord) -> Result<(), StoreError> {
        self.validate(&record.name, &record.values)?;

        let dim = record.values.len();
        let stored = StoredVector {
            id: record.id,
            seq: self.next_seq,
            created_at: record.created_at,
            values: record.values.into(),
        };
        self.next_seq += 1;
        self.dimension.get_or_insert(dim);

        match self.identities.iter_mut().find(|i| i.name == record.name) {
            Some(identity) => Arc::make_mut(identity).vectors.push(stored),
            None => self.identities.push(Arc::new(Identity {
                name: record.name,
                vectors: vec![stored],
            })),
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize, StoreError> {
        self.identities
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn remove(&mut self, name: &str) -> Result<usize, StoreError> {
        let pos = self.position(name)?;
        Ok(self.identities.remove(pos).vectors.len())
    }

    fn remove_vectors(&mut self, name: &str, ids: &[String]) -> Result<usize, StoreError> {
        let pos = self.position(name)?;
        let identity = Arc::make_mut(&mut self.identities[pos]);
        let before = identity.vectors.len();
        identity.vectors.retain(|v| !ids.contains(&v.id));
        let removed = before - identity.vectors.len();
        if identity.vectors.is_empty() {
            self.identities.remove(pos);
        }
        Ok(removed)
    }
}

/// Lazy, restartable listing of `(name, vector count)` in enrollment order.
///
/// Holds its own snapshot, so iterating it again yields the same sequence
/// even if the store changed in between.
#[derive(Debug, Clone)]
pub struct Listing {
    snapshot: Arc<Gallery>,
}

impl Listing {
    pub fn iter(&self) -> impl Iterator<Item = IdentitySummary> + '_ {
        self.snapshot.identities().map(|i| IdentitySummary {
            name: i.name.clone(),
            count: i.vectors.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.snapshot.identity_count()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

impl<'a> IntoIterator for &'a Listing {
    type Item = IdentitySummary;
    type IntoIter = Box<dyn Iterator<Item = IdentitySummary> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Identity name -> enrolled embeddings, safe for concurrent readers.
#[derive(Debug)]
pub struct EmbeddingStore {
    gallery: RwLock<Arc<Gallery>>,
}

impl EmbeddingStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            gallery: RwLock::new(Arc::new(Gallery::with_config(config))),
        }
    }

    /// Build a store from a persistence snapshot, replaying records in order.
    ///
    /// Fails on the first record that would be rejected by [`insert_record`](Self::insert_record).
    pub fn from_records(
        config: StoreConfig,
        records: impl IntoIterator<Item = EmbeddingRecord>,
    ) -> Result<Self, StoreError> {
        let mut gallery = Gallery::with_config(config);
        for record in records {
            let id = record.id.clone();
            gallery.push(record).map_err(|e| {
                tracing::error!(id = %id, error = %e, "rejected persisted embedding");
                e
            })?;
        }
        tracing::info!(
            identities = gallery.identity_count(),
            embeddings = gallery.len(),
            dimension = ?gallery.dimension(),
            "embedding store loaded"
        );
        Ok(Self {
            gallery: RwLock::new(Arc::new(gallery)),
        })
    }

    /// Current contents. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<Gallery> {
        // The guarded value is an immutable Arc, so a poisoned lock is still consistent.
        let guard = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Gallery) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Gallery::clone(&guard);
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Validate an insert without performing it.
    pub fn check(&self, name: &str, values: &[f32]) -> Result<(), StoreError> {
        self.snapshot().validate(name, values)
    }

    /// Append `values` under `name`, creating the identity if needed.
    ///
    /// Returns the new embedding ID. On error the store is unchanged.
    pub fn insert(&self, name: &str, values: Vec<f32>) -> Result<String, StoreError> {
        let record = EmbeddingRecord::new(name, values);
        let id = record.id.clone();
        self.insert_record(record)?;
        Ok(id)
    }

    /// Append a record with a caller-assigned ID and timestamp.
    pub fn insert_record(&self, record: EmbeddingRecord) -> Result<(), StoreError> {
        let (id, name, dim) = (record.id.clone(), record.name.clone(), record.values.len());
        self.mutate(|g| g.push(record))?;
        tracing::debug!(name = %name, id = %id, dim, "embedding inserted");
        Ok(())
    }

    /// Delete every embedding of `name`. Returns how many were removed.
    pub fn remove(&self, name: &str) -> Result<usize, StoreError> {
        let removed = self.mutate(|g| g.remove(name))?;
        tracing::debug!(name, removed, "identity removed");
        Ok(removed)
    }

    /// Delete the listed embeddings of `name`, dropping the identity once it
    /// has none left. IDs not enrolled under `name` are ignored.
    pub fn remove_vectors(&self, name: &str, ids: &[String]) -> Result<usize, StoreError> {
        let removed = self.mutate(|g| g.remove_vectors(name, ids))?;
        tracing::debug!(name, removed, "embeddings removed");
        Ok(removed)
    }

    pub fn list(&self) -> Listing {
        Listing {
            snapshot: self.snapshot(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().get(name).is_some()
    }

    /// Total number of stored vectors.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.snapshot().identity_count()
    }

    /// Established dimension, if any vector was inserted or one was configured.
    pub fn dimension(&self) -> Option<usize> {
        self.snapshot().dimension()
    }

    /// Closest enrolled identity within `threshold` under `metric`, if any.
    pub fn query(
        &self,
        probe: &[f32],
        metric: Metric,
        threshold: f64,
    ) -> Result<Option<Match>, StoreError> {
        self.query_with(&LinearScan::new(metric), probe, threshold)
    }

    /// [`query`](Self::query) with an explicit matching strategy.
    pub fn query_with(
        &self,
        matcher: &dyn Matcher,
        probe: &[f32],
        threshold: f64,
    ) -> Result<Option<Match>, StoreError> {
        let gallery = self.snapshot();
        check_probe(&gallery, probe)?;
        Ok(matcher.best_match(probe, &gallery, threshold))
    }

    /// Best distance per identity, ascending, at most `k` entries.
    pub fn rank(&self, probe: &[f32], metric: Metric, k: usize) -> Result<Vec<Match>, StoreError> {
        let gallery = self.snapshot();
        check_probe(&gallery, probe)?;
        Ok(LinearScan::new(metric).rank(probe, &gallery, k))
    }
}

fn check_probe(gallery: &Gallery, probe: &[f32]) -> Result<(), StoreError> {
    gallery.check_dimension(probe.len())?;
    if probe.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::NonFiniteValue);
    }
    Ok(())
}
