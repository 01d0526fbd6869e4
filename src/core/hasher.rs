//! Streaming SHA-256 content hashing.
//!
//! Digests depend only on bytes: filename, timestamps and filesystem play no
//! part. Two files with the same digest are treated as identical content;
//! no byte-for-byte comparison follows a digest match.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::domain::ContentDigest;

/// Read buffer size for streaming hashes
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors that can occur while hashing a file
#[derive(Debug, Error)]
pub enum HashError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Hashing {path} took longer than {limit:?}")]
    TimedOut { path: PathBuf, limit: std::time::Duration },
}

impl HashError {
    /// Underlying I/O error kind
    pub fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            HashError::Open { source, .. } | HashError::Read { source, .. } => source.kind(),
            HashError::TimedOut { .. } => std::io::ErrorKind::TimedOut,
        }
    }
}

/// Digest and size of a hashed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub digest: ContentDigest,
    pub size: u64,
}

/// Incremental hasher
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes seen so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish and produce the digest
    pub fn finalize(self) -> ContentDigest {
        ContentDigest::from_bytes(&self.inner.finalize())
    }

    /// Digest an in-memory buffer
    pub fn digest_bytes(bytes: &[u8]) -> ContentDigest {
        ContentDigest::from_bytes(&Sha256::digest(bytes))
    }

    /// Digest any reader with bounded memory
    pub fn digest_reader<R: Read>(mut reader: R) -> std::io::Result<HashedFile> {
        let mut hasher = Self::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let size = hasher.bytes();
        Ok(HashedFile {
            digest: hasher.finalize(),
            size,
        })
    }

    /// Digest a file on disk
    pub async fn digest_file(path: &Path) -> Result<HashedFile, HashError> {
        let mut file = File::open(path).await.map_err(|source| HashError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hasher = Self::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(|source| HashError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let size = hasher.bytes();
        Ok(HashedFile {
            digest: hasher.finalize(),
            size,
        })
    }
}
