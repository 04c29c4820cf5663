//! SQLite persistence for enrolled embeddings.
//!
//! Embeddings are encrypted at rest; names, IDs and timestamps are not.

use crate::crypto::EmbeddingCipher;
use facematch_core::{EmbeddingRecord, PersistenceAdapter, PersistenceError};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embeddings (
    id         TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    dim        INTEGER NOT NULL,
    nonce      BLOB NOT NULL,
    data       BLOB NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_name ON embeddings(name);
";

fn backend_err(e: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Backend(e.to_string())
}

pub struct SqlitePersistence {
    conn: Mutex<Connection>,
    cipher: EmbeddingCipher,
    path: PathBuf,
}

impl SqlitePersistence {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, cipher: EmbeddingCipher) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(backend_err)?;
        Self::init(conn, cipher, path.to_path_buf())
    }

    #[cfg(test)]
    pub fn open_in_memory(cipher: EmbeddingCipher) -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Self::init(conn, cipher, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, cipher: EmbeddingCipher, path: PathBuf) -> Result<Self, PersistenceError> {
        // FULL sync: a committed enrollment survives power loss.
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(backend_err)?;
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        tracing::info!(path = %path.display(), "sqlite persistence opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
            path,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistenceAdapter for SqlitePersistence {
    fn load(&self) -> Result<Vec<EmbeddingRecord>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, name, dim, nonce, data, created_at FROM embeddings ORDER BY rowid")
            .map_err(backend_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(backend_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, dim, nonce, data, created_at) = row.map_err(backend_err)?;
            let values = self.cipher.open(&nonce, &data).map_err(|e| {
                PersistenceError::Backend(format!("embedding {id}: {e}"))
            })?;
            if values.len() as i64 != dim {
                return Err(PersistenceError::Backend(format!(
                    "embedding {id}: stored dim {dim}, decoded {}",
                    values.len()
                )));
            }
            records.push(EmbeddingRecord {
                id,
                name,
                values,
                created_at,
            });
        }
        Ok(records)
    }

    fn save(&self, record: &EmbeddingRecord) -> Result<(), PersistenceError> {
        let (nonce, data) = self.cipher.seal(&record.values).map_err(backend_err)?;
        self.conn()
            .execute(
                "INSERT INTO embeddings (id, name, dim, nonce, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.name,
                    record.values.len() as i64,
                    nonce,
                    data,
                    record.created_at
                ],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<usize, PersistenceError> {
        self.conn()
            .execute("DELETE FROM embeddings WHERE name = ?1", params![name])
            .map_err(backend_err)
    }

    fn delete_record(&self, id: &str) -> Result<bool, PersistenceError> {
        let n = self
            .conn()
            .execute("DELETE FROM embeddings WHERE id = ?1", params![id])
            .map_err(backend_err)?;
        Ok(n > 0)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> SqlitePersistence {
        SqlitePersistence::open_in_memory(EmbeddingCipher::from_secret(b"test")).unwrap()
    }

    #[test]
    fn test_save_load_in_insertion_order() {
        let db = open();
        let a = EmbeddingRecord::new("alice", vec![0.1, 0.2, 0.3]);
        let b = EmbeddingRecord::new("bob", vec![0.4, 0.5, 0.6]);
        let c = EmbeddingRecord::new("alice", vec![0.7, 0.8, 0.9]);
        for r in [&a, &b, &c] {
            db.save(r).unwrap();
        }
        assert_eq!(db.load().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_embeddings_not_stored_in_clear() {
        let db = open();
        let r = EmbeddingRecord::new("alice", vec![1.0, 2.0]);
        db.save(&r).unwrap();
        let data: Vec<u8> = db
            .conn()
            .query_row("SELECT data FROM embeddings WHERE id = ?1", params![r.id], |row| row.get(0))
            .unwrap();
        let clear: Vec<u8> = r.values.iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_ne!(data, clear);
    }

    #[test]
    fn test_delete_by_name_and_id() {
        let db = open();
        let a = EmbeddingRecord::new("alice", vec![1.0]);
        db.save(&a).unwrap();
        db.save(&EmbeddingRecord::new("alice", vec![2.0])).unwrap();
        let b = EmbeddingRecord::new("bob", vec![3.0]);
        db.save(&b).unwrap();

        assert!(db.delete_record(&b.id).unwrap());
        assert!(!db.delete_record(&b.id).unwrap());
        assert_eq!(db.delete("alice").unwrap(), 2);
        assert_eq!(db.delete("alice").unwrap(), 0);
        assert!(db.load().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let db = open();
        let r = EmbeddingRecord::new("alice", vec![1.0]);
        db.save(&r).unwrap();
        assert!(db.save(&r).is_err());
    }

    #[test]
    fn test_reopen_file_with_same_key() {
        let dir = std::env::temp_dir().join(format!("facematch-db-{}", uuid::Uuid::new_v4()));
        let path = dir.join("faces.db");
        let r = EmbeddingRecord::new("alice", vec![0.5, -0.5]);
        {
            let db = SqlitePersistence::open(&path, EmbeddingCipher::from_secret(b"k")).unwrap();
            db.save(&r).unwrap();
        }
        let db = SqlitePersistence::open(&path, EmbeddingCipher::from_secret(b"k")).unwrap();
        assert_eq!(db.load().unwrap(), vec![r]);

        let wrong = SqlitePersistence::open(&path, EmbeddingCipher::from_secret(b"other")).unwrap();
        assert!(wrong.load().is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
