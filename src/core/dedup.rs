//! Deduplicator: at most one materialised copy per (location, digest).
//!
//! The check against existing digests and the reservation of a new one
//! happen under the location's lock, so two batches racing on the same
//! content cannot both decide to place it. The lock covers only the
//! check-and-reserve step; the copy itself runs outside it while the
//! [`Reservation`] keeps other batches away from that digest.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::locks::LocationLocks;
use crate::catalog::{Catalog, CatalogError};
use crate::domain::{ContentDigest, Location, LocationId, MediaRecord};
use crate::package::{ChecksumEntry, ManifestError};

/// Source of truth for "is this digest already archived here"
#[async_trait]
pub trait DigestIndex: Send + Sync {
    /// The record of a digest already archived for the location
    async fn lookup(
        &self,
        location: &Location,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, DedupError>;
}

/// Errors consulting a digest index
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Catalog lookup failed: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Manifest lookup failed: {0}")]
    Manifest(#[from] ManifestError),
}

/// Lookup against catalog media rows
pub struct CatalogIndex {
    catalog: Arc<dyn Catalog>,
}

impl CatalogIndex {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl DigestIndex for CatalogIndex {
    async fn lookup(
        &self,
        location: &Location,
        digest: &ContentDigest,
    ) -> Result<Option<MediaRecord>, DedupError> {
        Ok(self.catalog.find_media(&location.id, digest).await?)
    }
}

/// Digests in a package's payload listing, read once per batch.
///
/// Answers for content whose catalog row is missing, and tells which
/// cataloged content the listing still lacks.
#[derive(Debug, Clone, Default)]
pub struct ListedDigests {
    paths: HashMap<ContentDigest, String>,
}

impl ListedDigests {
    pub fn from_entries(entries: Vec<ChecksumEntry>) -> Self {
        Self {
            paths: entries
                .into_iter()
                .map(|entry| (entry.digest, entry.path))
                .collect(),
        }
    }

    /// Listed relative path of a digest
    pub fn path_of(&self, digest: &ContentDigest) -> Option<&str> {
        self.paths.get(digest).map(String::as_str)
    }

    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.paths.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Outcome of asking whether a digest should be placed
#[derive(Debug)]
pub enum Placement {
    /// New content; the holder must place it and then drop the reservation
    Reserved(Reservation),

    /// Already recorded in the catalog for this location
    Cataloged(MediaRecord),

    /// Listed in the package but missing from the catalog
    Listed { relative_path: String },

    /// Another placement of the same digest is under way
    InFlight,
}

impl Placement {
    pub fn is_new(&self) -> bool {
        matches!(self, Placement::Reserved(_))
    }
}

type InFlight = Arc<Mutex<HashMap<LocationId, HashSet<ContentDigest>>>>;

/// Claim on a digest for one location, released on drop.
///
/// Drop it only after the catalog record is durable, so the index already
/// has the record by the time other batches can look again.
#[derive(Debug)]
pub struct Reservation {
    location_id: LocationId,
    digest: ContentDigest,
    in_flight: InFlight,
}

impl Reservation {
    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = map.get_mut(&self.location_id) {
            set.remove(&self.digest);
            if set.is_empty() {
                map.remove(&self.location_id);
            }
        }
    }
}

/// Check-and-reserve gate in front of the writer
#[derive(Clone)]
pub struct Deduplicator {
    indexes: Vec<Arc<dyn DigestIndex>>,
    locks: LocationLocks,
    in_flight: InFlight,
}

impl Deduplicator {
    /// Consult the given indexes in order; any hit means already archived.
    /// With no indexes, only the per-batch listing is consulted.
    pub fn new(indexes: Vec<Arc<dyn DigestIndex>>) -> Self {
        Self {
            indexes,
            locks: LocationLocks::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Catalog-backed; the batch's listing covers rows the catalog lost
    pub fn with_catalog(catalog: Arc<dyn Catalog>) -> Self {
        Self::new(vec![Arc::new(CatalogIndex::new(catalog))])
    }

    /// Decide whether `digest` must be placed for `location`, reserving it if so
    pub async fn should_place(
        &self,
        location: &Location,
        digest: &ContentDigest,
        listed: &ListedDigests,
    ) -> Result<Placement, DedupError> {
        let _guard = self.locks.lock(&location.id).await;

        if self.is_reserved(&location.id, digest) {
            debug!(location = %location.id, digest = %digest.short(), "Digest in flight");
            return Ok(Placement::InFlight);
        }

        for index in &self.indexes {
            if let Some(record) = index.lookup(location, digest).await? {
                debug!(location = %location.id, digest = %digest.short(), "Digest already archived");
                return Ok(Placement::Cataloged(record));
            }
        }

        if let Some(path) = listed.path_of(digest) {
            debug!(location = %location.id, digest = %digest.short(), "Digest listed without catalog row");
            return Ok(Placement::Listed {
                relative_path: path.to_string(),
            });
        }

        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(location.id.clone())
            .or_default()
            .insert(digest.clone());

        Ok(Placement::Reserved(Reservation {
            location_id: location.id.clone(),
            digest: digest.clone(),
            in_flight: self.in_flight.clone(),
        }))
    }

    fn is_reserved(&self, location_id: &LocationId, digest: &ContentDigest) -> bool {
        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.get(location_id)
            .map(|set| set.contains(digest))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::core::hasher::ContentHasher;
    use crate::domain::{MediaCategory, MediaRecord};
    use crate::package::manifest::read_manifest;
    use crate::package::ManifestGenerator;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(location: &Location, digest: &ContentDigest) -> MediaRecord {
        MediaRecord {
            location_id: location.id.clone(),
            digest: digest.clone(),
            original_name: "a.jpg".to_string(),
            size: 1,
            category: MediaCategory::Image,
            relative_path: format!("image/{}/{}.jpg", digest.prefix(), digest),
            imported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reservation_blocks_second_claim() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let dedup = Deduplicator::new(Vec::new());
        let listed = ListedDigests::default();
        let digest = ContentHasher::digest_bytes(b"photo");

        let first = dedup.should_place(&location, &digest, &listed).await.unwrap();
        assert!(first.is_new());

        let second = dedup.should_place(&location, &digest, &listed).await.unwrap();
        assert!(matches!(second, Placement::InFlight));

        drop(first);
        let third = dedup.should_place(&location, &digest, &listed).await.unwrap();
        assert!(third.is_new());
    }

    #[tokio::test]
    async fn test_other_location_is_independent() {
        let temp = TempDir::new().unwrap();
        let a = Location::new("A", temp.path());
        let b = Location::new("B", temp.path());
        let dedup = Deduplicator::new(Vec::new());
        let listed = ListedDigests::default();
        let digest = ContentHasher::digest_bytes(b"photo");

        let _held = dedup.should_place(&a, &digest, &listed).await.unwrap();
        assert!(dedup.should_place(&b, &digest, &listed).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_catalog_hit_returns_record() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        catalog.insert_location(&location).await.unwrap();
        let digest = ContentHasher::digest_bytes(b"photo");
        let stored = record(&location, &digest);
        catalog.record_media(&stored).await.unwrap();

        let dedup = Deduplicator::with_catalog(catalog);
        let placement = dedup
            .should_place(&location, &digest, &ListedDigests::default())
            .await
            .unwrap();
        assert!(matches!(placement, Placement::Cataloged(found) if found == stored));
    }

    #[tokio::test]
    async fn test_listing_answers_without_catalog_row() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        catalog.insert_location(&location).await.unwrap();
        let digest = ContentHasher::digest_bytes(b"photo");

        assert!(read_manifest(&location).await.unwrap().is_none());

        let listed_record = record(&location, &digest);
        ManifestGenerator::default()
            .add_payload_entries(&location, std::slice::from_ref(&listed_record))
            .await
            .unwrap();

        let listed = ListedDigests::from_entries(read_manifest(&location).await.unwrap().unwrap());
        assert_eq!(listed.len(), 1);
        assert!(listed.contains(&digest));

        let placement = Deduplicator::with_catalog(catalog)
            .should_place(&location, &digest, &listed)
            .await
            .unwrap();
        assert!(matches!(
            placement,
            Placement::Listed { relative_path } if relative_path == listed_record.relative_path
        ));
    }
}
