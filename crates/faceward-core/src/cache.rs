//! Blob persistence and content hashing for the encoding cache.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache read failed at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cache write failed at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Keyed blob storage for the persisted encoding store and its metadata.
pub trait PersistentCache: Send + Sync {
    /// Read a blob; `Ok(None)` when the key has never been written.
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Replace a blob. Readers observe either the old or the new bytes, never a mix.
    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;
}

/// Digest used to detect dataset changes.
pub trait ContentHasher: Send + Sync {
    fn hash(&self, bytes: &[u8]) -> String;
}

/// SHA-256, rendered as lowercase hex.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }
}

/// Directory of files, one per key.
#[derive(Debug, Clone)]
pub struct FsBlobCache {
    root: PathBuf,
}

impl FsBlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(file)
    }
}

impl PersistentCache for FsBlobCache {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.blob_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Read { path, source }),
        }
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.blob_path(key);
        let write_err = |source| CacheError::Write {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.root).map_err(write_err)?;

        // Same directory as the target so the final rename stays on one filesystem.
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(write_err)?;
        tmp.write_all(bytes).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "cache blob written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        // SHA-256("abc")
        assert_eq!(
            Sha256Hasher.hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_blob_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsBlobCache::new(dir.path());
        assert!(cache.read_blob("absent").unwrap().is_none());
    }

    #[test]
    fn test_write_then_read_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsBlobCache::new(dir.path().join("nested"));
        cache.write_blob("k.json", b"first").unwrap();
        cache.write_blob("k.json", b"second").unwrap();
        assert_eq!(cache.read_blob("k.json").unwrap().as_deref(), Some(&b"second"[..]));

        // Only the blob itself remains; temp files were renamed away.
        let entries = fs::read_dir(cache.root()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FsBlobCache::new(dir.path());
        cache.write_blob("../outside", b"x").unwrap();
        assert!(dir.path().join(".._outside").exists());
    }
}
