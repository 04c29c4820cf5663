//! Persistence adapters.
//!
//! The store itself is purely in-memory; an adapter supplies the snapshot it
//! is built from at startup and makes each enrollment and removal durable.
//! Backends own their own retry policy, the store never retries.

use crate::types::EmbeddingRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage backend error: {0}")]
    Backend(String),
    /// A multi-record delete stopped part way. `removed` lists the IDs that are
    /// already gone from storage.
    #[error("deleted {done} of {total} records before failing: {source}", done = .removed.len())]
    PartialDelete {
        removed: Vec<String>,
        total: usize,
        #[source]
        source: Box<PersistenceError>,
    },
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable storage for enrolled embeddings.
///
/// `load` returns every record in insertion order. `save` and `delete` must be
/// durable before they return.
pub trait PersistenceAdapter: Send + Sync {
    fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError>;

    fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError>;

    /// Remove every record stored under `name`. Returns how many were removed.
    fn delete(&self, name: &str) -> Result<usize, PersistenceError>;

    /// Remove a single record by ID. Used to roll back a save whose insert failed.
    fn delete_record(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Short backend label for logs and status output.
    fn describe(&self) -> String;
}

/// Non-durable adapter. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<EmbeddingRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<EmbeddingRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
        Ok(self.records().clone())
    }

    fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError> {
        self.records().push(record.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<usize, PersistenceError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|r| r.name != name);
        Ok(before - records.len())
    }

    fn delete_record(&self, id: &str) -> Result<bool, PersistenceError> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

const RECORD_EXT: &str = "json";

/// One JSON file per embedding in a flat directory.
///
/// File names are `<save sequence, zero-padded>-<id>.json`, so a lexical sort
/// of the directory is save order regardless of the wall clock. The sequence
/// resumes after the highest file found on open. Writes go through a temp
/// file, `fsync`, then rename.
#[derive(Debug)]
pub struct DirectoryPersistence {
    root: PathBuf,
    /// Next file sequence. Held for the whole save so sequence order is
    /// durable order.
    next_seq: Mutex<u64>,
}

impl DirectoryPersistence {
    /// Open (and create if missing) the storage directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| PersistenceError::io(&root, e))?;
        let next_seq = Self::scan(&root)?
            .iter()
            .filter_map(|p| Self::sequence_of(p))
            .max()
            .map_or(0, |s| s.saturating_add(1));
        tracing::info!(path = %root.display(), next_seq, "directory persistence opened");
        Ok(Self {
            root,
            next_seq: Mutex::new(next_seq),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(seq: u64, id: &str) -> String {
        format!("{seq:020}-{id}.{RECORD_EXT}")
    }

    fn sequence_of(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        name.split_once('-')?.0.parse().ok()
    }

    /// Record files in save order.
    fn scan(root: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
        let entries = fs::read_dir(root).map_err(|e| PersistenceError::io(root, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| PersistenceError::io(root, e))?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn record_paths(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        Self::scan(&self.root)
    }

    fn read_record(path: &Path) -> Result<EmbeddingRecord, PersistenceError> {
        let data = fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|source| PersistenceError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn remove_file(path: &Path) -> Result<(), PersistenceError> {
        fs::remove_file(path).map_err(|e| PersistenceError::io(path, e))
    }

    fn sync_dir(&self) -> Result<(), PersistenceError> {
        // Directory fsync makes the rename/unlink itself durable.
        fs::File::open(&self.root)
            .and_then(|d| d.sync_all())
            .map_err(|e| PersistenceError::io(&self.root, e))
    }
}

impl PersistenceAdapter for DirectoryPersistence {
    fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
        self.record_paths()?
            .iter()
            .map(|p| Self::read_record(p))
            .collect()
    }

    fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError> {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = *next_seq;
        *next_seq = seq.saturating_add(1);

        let final_path = self.root.join(Self::file_name(seq, &record.id));
        let tmp_path = self.root.join(format!(".{}.tmp", record.id));

        let data = serde_json::to_vec(record).map_err(|e| PersistenceError::Backend(e.to_string()))?;
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(PersistenceError::io(&tmp_path, e));
        }
        fs::rename(&tmp_path, &final_path).map_err(|e| PersistenceError::io(&final_path, e))?;
        self.sync_dir()?;

        tracing::debug!(path = %final_path.display(), name = %record.name, seq, "record saved");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<usize, PersistenceError> {
        // Resolve every match before unlinking anything.
        let mut matching = Vec::new();
        for path in self.record_paths()? {
            match Self::read_record(&path) {
                Ok(record) if record.name == name => matching.push((path, record.id)),
                Ok(_) => {}
                Err(e @ PersistenceError::Corrupt { .. }) => {
                    tracing::warn!(error = %e, "skipping unreadable record during delete");
                }
                Err(e) => return Err(e),
            }
        }

        let total = matching.len();
        let mut removed = Vec::with_capacity(total);
        for (path, id) in matching {
            if let Err(e) = Self::remove_file(&path) {
                if !removed.is_empty() {
                    let _ = self.sync_dir();
                }
                return Err(PersistenceError::PartialDelete {
                    removed,
                    total,
                    source: Box::new(e),
                });
            }
            removed.push(id);
        }
        if total > 0 {
            self.sync_dir()?;
        }
        Ok(total)
    }

    fn delete_record(&self, id: &str) -> Result<bool, PersistenceError> {
        let suffix = format!("-{id}.{RECORD_EXT}");
        let found = self.record_paths()?.into_iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix))
        });
        match found {
            Some(path) => {
                Self::remove_file(&path)?;
                self.sync_dir()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}
