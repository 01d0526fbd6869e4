//! Domain types for the archive.
//!
//! This module contains the core data structures:
//! - Location: the archival subject and its package folder
//! - MediaRecord / ContentDigest: imported files and their identity
//! - ImportBatch: ephemeral import work and its outcomes
//! - IntegrityCheckResult: validation verdicts
//! - ArchiveEvent: outward notifications

pub mod batch;
pub mod events;
pub mod integrity;
pub mod location;
pub mod media;

// Re-export commonly used types
pub use batch::{
    BatchPhase, BatchStatus, BatchSummary, FileFailure, FileOutcome, ImportBatch,
    ImportErrorKind, SkipReason,
};
pub use events::{ArchiveEvent, EventKind};
pub use integrity::{CheckLevel, IntegrityCheckResult, IntegrityIssue, IntegrityStatus};
pub use location::{GeoPoint, Location, LocationId};
pub use media::{ContentDigest, MediaCategory, MediaRecord};
