//! Embedding encryption at rest (AES-256-GCM).
//!
//! The cipher key is SHA-256 of a key file's contents. The key file is created
//! with 32 random bytes and mode 0600 the first time the daemon starts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_FILE_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKey(String),
    #[error("embedding encryption failed")]
    Seal,
    #[error("embedding decryption failed (wrong key or corrupt data)")]
    Open,
    #[error("decrypted embedding has {0} bytes, not a multiple of 4")]
    BadLength(usize),
}

pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    /// Derive the cipher from arbitrary secret bytes.
    pub fn from_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        Self {
            cipher: Aes256Gcm::new(&digest),
        }
    }

    /// Read the key file, creating it with fresh random bytes if missing.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        let key_err = |source| CryptoError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(key_err)?;
            }
            let mut secret = [0u8; KEY_FILE_LEN];
            OsRng.fill_bytes(&mut secret);
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
                .map_err(key_err)?;
            file.write_all(&secret).map_err(key_err)?;
            file.sync_all().map_err(key_err)?;
            tracing::info!(path = %path.display(), "generated embedding key");
        }

        let secret = std::fs::read(path).map_err(key_err)?;
        if secret.is_empty() {
            return Err(CryptoError::EmptyKey(path.display().to_string()));
        }
        Ok(Self::from_secret(&secret))
    }

    /// Encrypt an embedding. Returns `(nonce, ciphertext)`.
    pub fn seal(&self, values: &[f32]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let plaintext: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CryptoError::Seal)?;
        Ok((nonce.to_vec(), ciphertext))
    }

    /// Decrypt an embedding sealed by [`seal`](Self::seal).
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<f32>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)?;
        decode_f32_le(&plaintext)
    }
}

/// Little-endian `f32` bytes back to values.
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>, CryptoError> {
    if bytes.len() % 4 != 0 {
        return Err(CryptoError::BadLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let cipher = EmbeddingCipher::from_secret(b"test secret");
        let values = vec![0.25f32, -1.5, 3.0e-7, 0.0];
        let (nonce, data) = cipher.seal(&values).unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert_eq!(cipher.open(&nonce, &data).unwrap(), values);
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let cipher = EmbeddingCipher::from_secret(b"k");
        let (n1, c1) = cipher.seal(&[1.0]).unwrap();
        let (n2, c2) = cipher.seal(&[1.0]).unwrap();
        assert_ne!(n1, n2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, data) = EmbeddingCipher::from_secret(b"one").seal(&[1.0, 2.0]).unwrap();
        let other = EmbeddingCipher::from_secret(b"two");
        assert!(matches!(other.open(&nonce, &data), Err(CryptoError::Open)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = EmbeddingCipher::from_secret(b"k");
        let (nonce, mut data) = cipher.seal(&[1.0, 2.0]).unwrap();
        data[0] ^= 0xff;
        assert!(cipher.open(&nonce, &data).is_err());
        assert!(cipher.open(&nonce[..4], &data).is_err());
    }

    #[test]
    fn test_key_file_created_once() {
        let dir = std::env::temp_dir().join(format!("facematch-key-{}", uuid::Uuid::new_v4()));
        let path = dir.join("embedding.key");

        let first = EmbeddingCipher::load_or_create(&path).unwrap();
        let secret = std::fs::read(&path).unwrap();
        assert_eq!(secret.len(), KEY_FILE_LEN);

        let (nonce, data) = first.seal(&[4.0, 5.0]).unwrap();
        let second = EmbeddingCipher::load_or_create(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), secret);
        assert_eq!(second.open(&nonce, &data).unwrap(), vec![4.0, 5.0]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_decode_f32_le_rejects_partial() {
        assert!(matches!(decode_f32_le(&[0, 0, 0]), Err(CryptoError::BadLength(3))));
    }
}
