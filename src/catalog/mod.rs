//! Durable catalog of locations, media records and integrity status.
//!
//! The catalog owns the Location and MediaRecord lifecycle. The import core
//! only talks to it through the narrow [`Catalog`] trait, so a different
//! store can stand in for the bundled SQLite implementation.
//!
//! # Storage Layout
//!
//! ```text
//! ~/.locvault/
//! ├── catalog.sqlite            # locations, media, integrity_status
//! └── batches.jsonl             # one line per finished import batch
//! ```

pub mod batch_log;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ContentDigest, IntegrityCheckResult, Location, LocationId, MediaRecord};

pub use batch_log::BatchLog;
pub use sqlite::SqliteCatalog;

/// Errors that can occur with the catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Location not found: {0}")]
    LocationNotFound(LocationId),

    #[error("Location already exists: {0}")]
    LocationExists(LocationId),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt catalog row: {0}")]
    Corrupt(String),

    #[error("Catalog task failed: {0}")]
    Task(String),
}

/// Result of recording a media row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New row written
    Inserted,

    /// (location, digest) already present; nothing written
    Duplicate,
}

/// Narrow catalog interface used by the archive core
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register a new location; ids are unique
    async fn insert_location(&self, location: &Location) -> Result<(), CatalogError>;

    /// Update descriptive fields of an existing location (id and root are fixed)
    async fn update_location(&self, location: &Location) -> Result<(), CatalogError>;

    async fn get_location(&self, id: &LocationId) -> Result<Option<Location>, CatalogError>;

    async fn list_locations(&self) -> Result<Vec<Location>, CatalogError>;

    /// The record of a digest in a location, if any
    async fn find_media(
        &self,
        location_id: &LocationId,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, CatalogError>;

    /// Record an imported file. The (location, digest) pair is unique.
    async fn record_media(&self, record: &MediaRecord) -> Result<RecordOutcome, CatalogError>;

    /// All media of a location, ordered by relative path
    async fn list_media(&self, location_id: &LocationId) -> Result<Vec<MediaRecord>, CatalogError>;

    /// Remove a media row, returning it if it existed
    async fn remove_media(
        &self,
        location_id: &LocationId,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, CatalogError>;

    /// Replace the current integrity status of a location
    async fn save_integrity(&self, result: &IntegrityCheckResult) -> Result<(), CatalogError>;

    /// Current integrity status of a location
    async fn integrity(
        &self,
        location_id: &LocationId,
    ) -> Result<Option<IntegrityCheckResult>, CatalogError>;

    /// When the last successful full check ran
    async fn last_full_check(
        &self,
        location_id: &LocationId,
    ) -> Result<Option<DateTime<Utc>>, CatalogError>;
}
