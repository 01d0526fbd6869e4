//! locvault - Content-addressed media archive with integrity checking
//!
//! Imports media into per-location folders where every file is named by
//! its SHA-256 digest, keeps a checksum manifest next to the payload, and
//! re-verifies packages on a schedule.
//!
//! # Architecture
//!
//! The import path is a short pipeline per batch:
//! - files are hashed, and the digest decides both identity and location
//! - new content is placed with an atomic temp-file + rename
//! - catalog rows and the package manifest follow each placement
//! - integrity checks are read-only and never repair anything
//!
//! # Modules
//!
//! - `core`: Hashing, path planning, atomic writes, dedup, orchestration
//! - `package`: Package files (manifest, tag manifest, package-info) and validation
//! - `catalog`: Durable state (SQLite catalog, batch log)
//! - `jobs`: Background scheduler for imports and periodic validation
//! - `ingest`: Source scanning and drop-folder watching
//! - `domain`: Data structures (Location, MediaRecord, ImportBatch, events)
//! - `vault`: Application facade used by the CLI
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Register a location
//! locvault location add "Old Mill" --latitude 51.5 --longitude -0.12
//!
//! # Import photos
//! locvault import <location-id> ~/Pictures/mill
//!
//! # Re-hash everything
//! locvault validate <location-id> --full
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod jobs;
pub mod package;
pub mod vault;

// Re-export main types at crate root for convenience
pub use catalog::{Catalog, SqliteCatalog};
pub use core::{ImportOrchestrator, ImportSettings};
pub use domain::{
    ArchiveEvent, BatchStatus, BatchSummary, EventKind, IntegrityCheckResult, IntegrityStatus,
    Location, LocationId, MediaRecord,
};
pub use package::{IntegrityValidator, ManifestGenerator};
pub use vault::{ProgressStream, Vault};
