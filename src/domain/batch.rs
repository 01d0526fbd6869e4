//! Import batches and their outcomes.
//!
//! A batch only lives while it is being processed. Once finished, its
//! [`BatchSummary`] is written to the completion log and the batch is gone.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::location::LocationId;
use super::media::{ContentDigest, MediaRecord};

/// A unit of import work
#[derive(Debug, Clone)]
pub struct ImportBatch {
    /// Unique identifier for this batch
    pub id: Uuid,

    /// Target location
    pub location_id: LocationId,

    /// Source paths in submission order (files or directories)
    pub sources: Vec<PathBuf>,

    /// When the batch was submitted
    pub submitted_at: DateTime<Utc>,
}

impl ImportBatch {
    /// Create a new batch
    pub fn new(location_id: LocationId, sources: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            location_id,
            sources,
            submitted_at: Utc::now(),
        }
    }
}

/// Phase of a running batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Scanning,
    Hashing,
    Placing,
    Cataloging,
}

/// Terminal status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every file was placed or skipped as a duplicate
    Complete,

    /// At least one file failed, at least one source was readable
    Partial,

    /// No input file could be read
    Failed,

    /// Cancelled before any file reached the archive
    Cancelled,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Complete => "complete",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a single file did not make it into the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportErrorKind {
    /// Source missing or permission denied
    UnreadableSource,

    /// Destination could not be written (disk full, permissions)
    WriteFailure,

    /// Source bytes changed between hashing and copying
    DigestMismatch,

    /// Copy exceeded the per-file timeout
    Timeout,

    /// Batch was cancelled before this file was processed
    Cancelled,

    /// File was placed but the catalog refused the record
    CatalogFailure,
}

impl std::fmt::Display for ImportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImportErrorKind::UnreadableSource => "unreadable_source",
            ImportErrorKind::WriteFailure => "write_failure",
            ImportErrorKind::DigestMismatch => "digest_mismatch",
            ImportErrorKind::Timeout => "timeout",
            ImportErrorKind::Cancelled => "cancelled",
            ImportErrorKind::CatalogFailure => "catalog_failure",
        };
        f.write_str(s)
    }
}

/// A per-file failure entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub kind: ImportErrorKind,
    pub message: String,
}

/// Result of processing a single file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// New file placed and cataloged
    Placed { path: PathBuf, record: MediaRecord },

    /// Digest already present for the location (no-op)
    Skipped {
        path: PathBuf,
        digest: ContentDigest,
        reason: SkipReason,
    },

    /// File failed
    Failed(FileFailure),
}

impl FileOutcome {
    /// Source path of the file
    pub fn path(&self) -> &PathBuf {
        match self {
            FileOutcome::Placed { path, .. } | FileOutcome::Skipped { path, .. } => path,
            FileOutcome::Failed(failure) => &failure.path,
        }
    }
}

/// Why a file was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Already recorded for the location
    AlreadyArchived,

    /// Another batch (or an earlier file of this batch) is placing it right now
    InFlight,
}

/// Terminal report for a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub location_id: LocationId,
    pub status: BatchStatus,
    pub total: usize,
    pub placed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FileFailure>,
    /// Batch-level warnings (e.g. manifest update failures)
    #[serde(default)]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BatchSummary {
    /// Derive the terminal status from per-file outcomes.
    ///
    /// `readable` is the number of files whose source could be read at all.
    pub fn status_for(
        total: usize,
        readable: usize,
        failed: usize,
        cancelled: bool,
        placed_or_skipped: usize,
    ) -> BatchStatus {
        if cancelled && placed_or_skipped == 0 {
            BatchStatus::Cancelled
        } else if total == 0 || readable == 0 {
            BatchStatus::Failed
        } else if failed > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Complete
        }
    }
}
