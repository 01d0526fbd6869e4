//! Crash-safe file placement.
//!
//! Bytes go to a hidden temp file in the destination directory, are synced,
//! and only then renamed onto the final path. Until the rename, the final
//! path either does not exist or still holds its previous content. A failed
//! placement removes its temp file.
//!
//! The async entry points bound the whole placement, including a read that
//! never returns. A placement abandoned that way loses its temp file at
//! once and can no longer reach the rename.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use super::hasher::{ContentHasher, CHUNK_SIZE};
use crate::domain::ContentDigest;

/// Prefix of in-progress temp files (hidden, skipped by scans)
pub const TEMP_PREFIX: &str = ".locvault-";

/// Suffix of in-progress temp files
pub const TEMP_SUFFIX: &str = ".tmp";

/// Errors that can occur while placing a file
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("Source unreadable: {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not enough space for {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Copy to {path} timed out after {elapsed:?}")]
    TimedOut { path: PathBuf, elapsed: Duration },

    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: ContentDigest,
        actual: ContentDigest,
    },

    #[error("Destination has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("Writer task failed: {0}")]
    Join(String),
}

/// What ended up on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFile {
    pub path: PathBuf,
    pub digest: ContentDigest,
    pub size: u64,
}

#[derive(Debug)]
enum CopyState {
    Copying { temp: Option<PathBuf> },
    Abandoned,
    Committing,
}

/// Handshake between a blocking copy and the async caller bounding it
#[derive(Debug, Clone)]
struct CopyControl(Arc<Mutex<CopyState>>);

impl Default for CopyControl {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(CopyState::Copying { temp: None })))
    }
}

impl CopyControl {
    fn state(&self) -> std::sync::MutexGuard<'_, CopyState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Note the temp file; false once the caller has given up
    fn register(&self, temp: &Path) -> bool {
        match &mut *self.state() {
            CopyState::Copying { temp: slot } => {
                *slot = Some(temp.to_path_buf());
                true
            }
            _ => false,
        }
    }

    fn abandoned(&self) -> bool {
        matches!(*self.state(), CopyState::Abandoned)
    }

    /// Claim the rename; false once the caller has given up
    fn commit(&self) -> bool {
        let mut state = self.state();
        if matches!(*state, CopyState::Abandoned) {
            return false;
        }
        *state = CopyState::Committing;
        true
    }

    /// Give up on the copy. `Err` means the rename is already under way.
    fn abandon(&self) -> Result<Option<PathBuf>, ()> {
        let mut state = self.state();
        match std::mem::replace(&mut *state, CopyState::Abandoned) {
            CopyState::Copying { temp } => Ok(temp),
            CopyState::Abandoned => Ok(None),
            CopyState::Committing => {
                *state = CopyState::Committing;
                Err(())
            }
        }
    }
}

/// Temp-file-then-rename writer
#[derive(Debug, Clone, Default)]
pub struct AtomicWriter {
    /// Upper bound on a single placement
    timeout: Option<Duration>,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each placement; exceeding it fails the placement cleanly
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Copy `source` to `dest`, verifying the copied bytes against `expected`
    pub fn place(
        &self,
        source: &Path,
        dest: &Path,
        expected: Option<&ContentDigest>,
    ) -> Result<PlacedFile, WriteError> {
        self.copy_file(source, dest, expected, &CopyControl::default())
    }

    fn copy_file(
        &self,
        source: &Path,
        dest: &Path,
        expected: Option<&ContentDigest>,
        control: &CopyControl,
    ) -> Result<PlacedFile, WriteError> {
        let file = fs::File::open(source).map_err(|e| WriteError::SourceUnreadable {
            path: source.to_path_buf(),
            source: e,
        })?;
        let size_hint = file.metadata().ok().map(|m| m.len());

        self.copy(file, size_hint, dest, expected, control)
            .map_err(|e| match e {
                // Read errors surfaced mid-copy belong to the source
                WriteError::SourceUnreadable { source: err, .. } => WriteError::SourceUnreadable {
                    path: source.to_path_buf(),
                    source: err,
                },
                other => other,
            })
    }

    /// Write an in-memory buffer to `dest`
    pub fn place_bytes(&self, bytes: &[u8], dest: &Path) -> Result<PlacedFile, WriteError> {
        self.place_reader(bytes, Some(bytes.len() as u64), dest, None)
    }

    /// Stream any reader to `dest`
    pub fn place_reader<R: Read>(
        &self,
        reader: R,
        size_hint: Option<u64>,
        dest: &Path,
        expected: Option<&ContentDigest>,
    ) -> Result<PlacedFile, WriteError> {
        self.copy(reader, size_hint, dest, expected, &CopyControl::default())
    }

    fn copy<R: Read>(
        &self,
        mut reader: R,
        size_hint: Option<u64>,
        dest: &Path,
        expected: Option<&ContentDigest>,
        control: &CopyControl,
    ) -> Result<PlacedFile, WriteError> {
        let started = Instant::now();
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| WriteError::NoParent(dest.to_path_buf()))?;

        fs::create_dir_all(parent).map_err(|source| WriteError::Io {
            path: parent.to_path_buf(),
            source,
        })?;

        if let Some(needed) = size_hint {
            check_space(parent, needed)?;
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(parent)
            .map_err(|source| WriteError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        let timed_out = || WriteError::TimedOut {
            path: dest.to_path_buf(),
            elapsed: started.elapsed(),
        };
        if !control.register(tmp.path()) {
            return Err(timed_out());
        }

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            if control.abandoned() {
                return Err(timed_out());
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() > limit {
                    return Err(WriteError::TimedOut {
                        path: dest.to_path_buf(),
                        elapsed: started.elapsed(),
                    });
                }
            }

            let n = reader
                .read(&mut buf)
                .map_err(|source| WriteError::SourceUnreadable {
                    path: dest.to_path_buf(),
                    source,
                })?;
            if n == 0 {
                break;
            }

            tmp.write_all(&buf[..n]).map_err(|source| WriteError::Io {
                path: tmp.path().to_path_buf(),
                source,
            })?;
            hasher.update(&buf[..n]);
        }

        tmp.flush().map_err(|source| WriteError::Io {
            path: tmp.path().to_path_buf(),
            source,
        })?;
        tmp.as_file().sync_all().map_err(|source| WriteError::Io {
            path: tmp.path().to_path_buf(),
            source,
        })?;

        let size = hasher.bytes();
        let digest = hasher.finalize();
        if let Some(expected) = expected {
            if &digest != expected {
                return Err(WriteError::DigestMismatch {
                    path: dest.to_path_buf(),
                    expected: expected.clone(),
                    actual: digest,
                });
            }
        }

        if !control.commit() {
            return Err(timed_out());
        }

        // Dropping the PersistError drops the temp file with it
        tmp.persist(dest).map_err(|e| WriteError::Io {
            path: dest.to_path_buf(),
            source: e.error,
        })?;
        sync_dir(parent);

        debug!(path = %dest.display(), size, "Placed file");

        Ok(PlacedFile {
            path: dest.to_path_buf(),
            digest,
            size,
        })
    }

    /// Async wrapper around [`AtomicWriter::place`], bounded by the timeout
    pub async fn place_async(
        &self,
        source: PathBuf,
        dest: PathBuf,
        expected: Option<ContentDigest>,
    ) -> Result<PlacedFile, WriteError> {
        let writer = self.clone();
        let target = dest.clone();
        self.bounded(target, move |control| {
            writer.copy_file(&source, &dest, expected.as_ref(), control)
        })
        .await
    }

    /// Async wrapper around [`AtomicWriter::place_reader`], bounded by the timeout
    pub async fn place_reader_async<R: Read + Send + 'static>(
        &self,
        reader: R,
        size_hint: Option<u64>,
        dest: PathBuf,
        expected: Option<ContentDigest>,
    ) -> Result<PlacedFile, WriteError> {
        let writer = self.clone();
        let target = dest.clone();
        self.bounded(target, move |control| {
            writer.copy(reader, size_hint, &dest, expected.as_ref(), control)
        })
        .await
    }

    /// Async wrapper around [`AtomicWriter::place_bytes`]
    pub async fn place_bytes_async(
        &self,
        bytes: Vec<u8>,
        dest: PathBuf,
    ) -> Result<PlacedFile, WriteError> {
        let size = bytes.len() as u64;
        self.place_reader_async(std::io::Cursor::new(bytes), Some(size), dest, None)
            .await
    }

    /// Run a blocking copy, giving up on it once the timeout passes.
    ///
    /// A copy that is already renaming is waited for instead, so the result
    /// always matches what is on disk.
    async fn bounded<F>(&self, dest: PathBuf, job: F) -> Result<PlacedFile, WriteError>
    where
        F: FnOnce(&CopyControl) -> Result<PlacedFile, WriteError> + Send + 'static,
    {
        let control = CopyControl::default();
        let worker = control.clone();
        let mut task = tokio::task::spawn_blocking(move || job(&worker));

        let Some(limit) = self.timeout else {
            return task.await.map_err(|e| WriteError::Join(e.to_string()))?;
        };

        match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined.map_err(|e| WriteError::Join(e.to_string()))?,
            Err(_) => match control.abandon() {
                Ok(temp) => {
                    if let Some(temp) = temp {
                        remove_abandoned(&temp);
                    }
                    warn!(path = %dest.display(), ?limit, "Placement abandoned");
                    Err(WriteError::TimedOut {
                        path: dest,
                        elapsed: limit,
                    })
                }
                Err(()) => task.await.map_err(|e| WriteError::Join(e.to_string()))?,
            },
        }
    }
}

fn remove_abandoned(temp: &Path) {
    match fs::remove_file(temp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %temp.display(), error = %e, "Failed to remove abandoned temp file"),
    }
}

/// Whether a file name is one of our in-progress temp files
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

fn check_space(dir: &Path, needed: u64) -> Result<(), WriteError> {
    match fs2::available_space(dir) {
        Ok(available) if available < needed => Err(WriteError::InsufficientSpace {
            path: dir.to_path_buf(),
            needed,
            available,
        }),
        Ok(_) => Ok(()),
        Err(e) => {
            // The copy itself still reports a real disk-full error
            debug!(dir = %dir.display(), error = %e, "Free space unknown");
            Ok(())
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    let synced = fs::File::open(dir).and_then(|handle| handle.sync_all());
    if let Err(e) = synced {
        warn!(dir = %dir.display(), error = %e, "Failed to sync directory after rename");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
