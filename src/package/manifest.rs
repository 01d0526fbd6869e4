//! ManifestGenerator: the only writer of a location's package files.
//!
//! Every update rewrites the affected files through [`AtomicWriter`] and
//! then recomputes the tag manifest over all of them. Updates for one
//! location are serialised by a per-location lock, since each one is a
//! read-modify-write of the listing.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, instrument};

use super::format::{self, ChecksumEntry, PackageInfo, PayloadOxum};
use super::{
    tag_path, ManifestError, INFO_FILE, MANIFEST_FILE, TAGMANIFEST_FILE, TAG_FILES, VERSION_FILE,
};
use crate::core::hasher::ContentHasher;
use crate::core::locks::LocationLocks;
use crate::core::writer::AtomicWriter;
use crate::domain::{ContentDigest, Location, MediaRecord};

/// Writes and updates package files
#[derive(Debug, Clone, Default)]
pub struct ManifestGenerator {
    writer: AtomicWriter,
    locks: LocationLocks,
}

/// Files to rewrite in one update
struct Update {
    version: bool,
    entries: Option<Vec<ChecksumEntry>>,
    oxum: PayloadOxum,
}

impl ManifestGenerator {
    pub fn new(writer: AtomicWriter) -> Self {
        Self {
            writer,
            locks: LocationLocks::new(),
        }
    }

    /// Per-location locks serialising package updates; readers that need a
    /// consistent view of several package files take the same lock
    pub fn locks(&self) -> &LocationLocks {
        &self.locks
    }

    /// Create the package files for a location.
    ///
    /// Idempotent: an existing payload listing is kept as is.
    #[instrument(skip(self, location), fields(location = %location.id))]
    pub async fn initialize(&self, location: &Location) -> Result<(), ManifestError> {
        let _guard = self.locks.lock(&location.id).await;

        let existing = read_manifest(location).await?;
        let oxum = match &existing {
            Some(entries) => current_oxum(location, entries).await?,
            None => PayloadOxum::default(),
        };
        let entries = if existing.is_some() {
            None
        } else {
            Some(Vec::new())
        };

        self.commit(
            location,
            Update {
                version: true,
                entries,
                oxum,
            },
        )
        .await?;

        info!("Initialized package");
        Ok(())
    }

    /// Rewrite descriptive metadata after a location was edited
    #[instrument(skip(self, location), fields(location = %location.id))]
    pub async fn update_descriptive_metadata(&self, location: &Location) -> Result<(), ManifestError> {
        let _guard = self.locks.lock(&location.id).await;

        let (entries, fresh) = match read_manifest(location).await? {
            Some(entries) => (entries, false),
            None => (Vec::new(), true),
        };
        let oxum = current_oxum(location, &entries).await?;

        self.commit(
            location,
            Update {
                version: fresh,
                entries: fresh.then_some(entries),
                oxum,
            },
        )
        .await
    }

    /// List newly placed payload files.
    ///
    /// Entries already listed are ignored, so retrying an update is harmless.
    #[instrument(skip(self, location, records), fields(location = %location.id, count = records.len()))]
    pub async fn add_payload_entries(
        &self,
        location: &Location,
        records: &[MediaRecord],
    ) -> Result<PayloadOxum, ManifestError> {
        let _guard = self.locks.lock(&location.id).await;

        let (mut entries, fresh) = match read_manifest(location).await? {
            Some(entries) => (entries, false),
            None => (Vec::new(), true),
        };
        let mut oxum = current_oxum(location, &entries).await?;

        let listed: HashSet<String> = entries.iter().map(|e| e.path.clone()).collect();
        let mut added = 0;
        for record in records {
            if listed.contains(&record.relative_path) {
                continue;
            }
            entries.push(ChecksumEntry::new(
                record.digest.clone(),
                record.relative_path.clone(),
            ));
            oxum.bytes += record.size;
            oxum.count += 1;
            added += 1;
        }

        if added == 0 && !fresh {
            debug!("No new payload entries");
            return Ok(oxum);
        }

        self.commit(
            location,
            Update {
                version: fresh,
                entries: Some(entries),
                oxum,
            },
        )
        .await?;

        debug!(added, oxum = %oxum, "Payload entries added");
        Ok(oxum)
    }

    /// Drop payload entries. Records carry the sizes needed for the summary.
    #[instrument(skip(self, location, removed), fields(location = %location.id, count = removed.len()))]
    pub async fn remove_payload_entries(
        &self,
        location: &Location,
        removed: &[MediaRecord],
    ) -> Result<PayloadOxum, ManifestError> {
        let _guard = self.locks.lock(&location.id).await;

        let Some(mut entries) = read_manifest(location).await? else {
            return Ok(PayloadOxum::default());
        };
        let mut oxum = current_oxum(location, &entries).await?;

        let listed: HashSet<ContentDigest> = entries.iter().map(|e| e.digest.clone()).collect();
        let gone: HashSet<&ContentDigest> = removed.iter().map(|r| &r.digest).collect();
        let before = entries.len();
        entries.retain(|e| !gone.contains(&e.digest));
        if entries.len() == before {
            return Ok(oxum);
        }

        for record in removed.iter().filter(|r| listed.contains(&r.digest)) {
            oxum.bytes = oxum.bytes.saturating_sub(record.size);
        }
        oxum.count = entries.len() as u64;
        if entries.is_empty() {
            oxum.bytes = 0;
        }

        self.commit(
            location,
            Update {
                version: false,
                entries: Some(entries),
                oxum,
            },
        )
        .await?;

        debug!(removed = before - oxum.count as usize, "Payload entries removed");
        Ok(oxum)
    }

    /// Rebuild every package file from catalog records
    #[instrument(skip(self, location, records), fields(location = %location.id, count = records.len()))]
    pub async fn regenerate(
        &self,
        location: &Location,
        records: &[MediaRecord],
    ) -> Result<PayloadOxum, ManifestError> {
        let _guard = self.locks.lock(&location.id).await;

        let mut by_path: BTreeMap<String, &MediaRecord> = BTreeMap::new();
        for record in records {
            by_path.insert(record.relative_path.clone(), record);
        }

        let oxum = PayloadOxum::new(
            by_path.values().map(|r| r.size).sum(),
            by_path.len() as u64,
        );
        let entries = by_path
            .into_iter()
            .map(|(path, r)| ChecksumEntry::new(r.digest.clone(), path))
            .collect();

        self.commit(
            location,
            Update {
                version: true,
                entries: Some(entries),
                oxum,
            },
        )
        .await?;

        info!(oxum = %oxum, "Regenerated package");
        Ok(oxum)
    }

    async fn commit(&self, location: &Location, update: Update) -> Result<(), ManifestError> {
        let dir = location.package_dir();
        let mut written: BTreeMap<&str, Vec<u8>> = BTreeMap::new();

        if update.version {
            written.insert(VERSION_FILE, format::render_version().into_bytes());
        }
        if let Some(entries) = &update.entries {
            written.insert(MANIFEST_FILE, format::render_checksums(entries).into_bytes());
        }
        let info = PackageInfo::for_location(location, update.oxum);
        written.insert(INFO_FILE, info.render().into_bytes());

        // Payload listing first, tag manifest last
        for name in [VERSION_FILE, MANIFEST_FILE, INFO_FILE] {
            if let Some(bytes) = written.get(name) {
                self.writer
                    .place_bytes_async(bytes.clone(), dir.join(name))
                    .await?;
            }
        }

        let mut tag_entries = Vec::with_capacity(TAG_FILES.len());
        for name in TAG_FILES {
            let digest = match written.get(name) {
                Some(bytes) => ContentHasher::digest_bytes(bytes),
                None => {
                    let path = dir.join(name);
                    let bytes = tokio::fs::read(&path)
                        .await
                        .map_err(|e| ManifestError::io(&path, e))?;
                    ContentHasher::digest_bytes(&bytes)
                }
            };
            tag_entries.push(ChecksumEntry::new(digest, tag_path(name)));
        }

        self.writer
            .place_bytes_async(
                format::render_checksums(&tag_entries).into_bytes(),
                dir.join(TAGMANIFEST_FILE),
            )
            .await?;

        Ok(())
    }
}

/// Summary to carry forward.
///
/// The recorded value is only trusted while its file count matches the
/// listing. Anything else is reported rather than guessed from the disk,
/// which may already hold unlisted or damaged payload.
async fn current_oxum(
    location: &Location,
    entries: &[ChecksumEntry],
) -> Result<PayloadOxum, ManifestError> {
    let recorded = match read_info(location).await {
        Ok(info) => info.map(|i| i.payload_oxum),
        Err(ManifestError::Format { .. }) => None,
        Err(e) => return Err(e),
    };

    match recorded {
        Some(oxum) if oxum.count == entries.len() as u64 => Ok(oxum),
        None if entries.is_empty() => Ok(PayloadOxum::default()),
        recorded => Err(ManifestError::StaleSummary {
            recorded,
            listed: entries.len(),
        }),
    }
}

/// Raw bytes of a package file, `None` if it does not exist
pub(crate) async fn read_package_bytes(
    location: &Location,
    name: &str,
) -> Result<Option<Vec<u8>>, ManifestError> {
    let path = location.package_dir().join(name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ManifestError::io(path, e)),
    }
}

/// Read a package file, `None` if it does not exist
async fn read_package_file(location: &Location, name: &str) -> Result<Option<String>, ManifestError> {
    let path = location.package_dir().join(name);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ManifestError::io(path, e)),
    }
}

/// Parsed payload listing, `None` if the location has no package yet
pub async fn read_manifest(location: &Location) -> Result<Option<Vec<ChecksumEntry>>, ManifestError> {
    match read_package_file(location, MANIFEST_FILE).await? {
        Some(text) => format::parse_checksums(&text)
            .map(Some)
            .map_err(|source| ManifestError::Format {
                file: tag_path(MANIFEST_FILE),
                source,
            }),
        None => Ok(None),
    }
}

/// Parsed descriptive metadata
pub async fn read_info(location: &Location) -> Result<Option<PackageInfo>, ManifestError> {
    match read_package_file(location, INFO_FILE).await? {
        Some(text) => PackageInfo::parse(&text)
            .map(Some)
            .map_err(|source| ManifestError::Format {
                file: tag_path(INFO_FILE),
                source,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::planner;
    use crate::domain::MediaCategory;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(location: &Location, bytes: &[u8]) -> MediaRecord {
        let digest = ContentHasher::digest_bytes(bytes);
        let relative_path = planner::plan(&location.id, MediaCategory::Image, &digest, "jpg");
        std::fs::create_dir_all(planner::resolve(&location.root, &relative_path).parent().unwrap())
            .unwrap();
        std::fs::write(planner::resolve(&location.root, &relative_path), bytes).unwrap();
        MediaRecord {
            location_id: location.id.clone(),
            digest,
            original_name: "a.jpg".to_string(),
            size: bytes.len() as u64,
            category: MediaCategory::Image,
            relative_path,
            imported_at: Utc::now(),
        }
    }

    fn tag_digests(location: &Location) -> Vec<ChecksumEntry> {
        let text =
            std::fs::read_to_string(location.package_dir().join(TAGMANIFEST_FILE)).unwrap();
        format::parse_checksums(&text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_creates_all_files() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();

        generator.initialize(&location).await.unwrap();

        let dir = location.package_dir();
        for name in [VERSION_FILE, INFO_FILE, MANIFEST_FILE, TAGMANIFEST_FILE] {
            assert!(dir.join(name).exists(), "{} missing", name);
        }
        assert_eq!(std::fs::read_to_string(dir.join(MANIFEST_FILE)).unwrap(), "");

        let tags = tag_digests(&location);
        let paths: Vec<&str> = tags.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "_package/bagit-version.txt",
                "_package/manifest-checksums.txt",
                "_package/package-info.txt",
            ]
        );
    }

    #[tokio::test]
    async fn test_add_updates_summary_and_tags() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();
        generator.initialize(&location).await.unwrap();
        let tags_before = tag_digests(&location);

        let a = record(&location, b"aaaa");
        let b = record(&location, b"bb");
        let oxum = generator
            .add_payload_entries(&location, &[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(oxum, PayloadOxum::new(6, 2));

        // Re-adding is a no-op
        let again = generator.add_payload_entries(&location, &[a.clone()]).await.unwrap();
        assert_eq!(again, PayloadOxum::new(6, 2));

        let info = read_info(&location).await.unwrap().unwrap();
        assert_eq!(info.payload_oxum, PayloadOxum::new(6, 2));
        let entries = read_manifest(&location).await.unwrap().unwrap();
        assert_eq!(entries.len(), 2);

        let tags_after = tag_digests(&location);
        assert_ne!(tags_before, tags_after);
    }

    #[tokio::test]
    async fn test_remove_entries() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();

        let a = record(&location, b"aaaa");
        let b = record(&location, b"bb");
        generator
            .add_payload_entries(&location, &[a.clone(), b.clone()])
            .await
            .unwrap();

        let oxum = generator
            .remove_payload_entries(&location, &[a.clone()])
            .await
            .unwrap();
        assert_eq!(oxum, PayloadOxum::new(2, 1));

        let entries = read_manifest(&location).await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].digest, b.digest);
    }

    #[tokio::test]
    async fn test_regenerate_replaces_listing() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();

        let a = record(&location, b"aaaa");
        let b = record(&location, b"bb");
        generator.add_payload_entries(&location, &[a.clone()]).await.unwrap();

        let oxum = generator.regenerate(&location, &[b.clone()]).await.unwrap();
        assert_eq!(oxum, PayloadOxum::new(2, 1));
        let entries = read_manifest(&location).await.unwrap().unwrap();
        assert_eq!(entries, vec![ChecksumEntry::new(b.digest, b.relative_path)]);
    }

    #[tokio::test]
    async fn test_metadata_update_keeps_listing() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();
        let a = record(&location, b"aaaa");
        generator.add_payload_entries(&location, &[a]).await.unwrap();

        let edited = location.clone().with_address("1 Race St");
        generator.update_descriptive_metadata(&edited).await.unwrap();

        let info = read_info(&edited).await.unwrap().unwrap();
        assert_eq!(info.address.as_deref(), Some("1 Race St"));
        assert_eq!(info.payload_oxum, PayloadOxum::new(4, 1));
        assert_eq!(read_manifest(&edited).await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_summary_is_reported_not_measured() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();
        let a = record(&location, b"aaaa");
        generator.add_payload_entries(&location, &[a]).await.unwrap();

        // Summary lost; the payload on disk must not be taken as the answer
        std::fs::remove_file(location.package_dir().join(INFO_FILE)).unwrap();
        let b = record(&location, b"bb");
        let err = generator.add_payload_entries(&location, &[b.clone()]).await.unwrap_err();
        assert!(matches!(
            err,
            ManifestError::StaleSummary { recorded: None, listed: 1 }
        ));
        assert_eq!(read_manifest(&location).await.unwrap().unwrap().len(), 1);

        // Rebuilding from records is the way back
        let a = record(&location, b"aaaa");
        let oxum = generator.regenerate(&location, &[a, b]).await.unwrap();
        assert_eq!(oxum, PayloadOxum::new(6, 2));
    }

    #[tokio::test]
    async fn test_empty_listing_without_summary_starts_at_zero() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let generator = ManifestGenerator::default();
        generator.initialize(&location).await.unwrap();
        std::fs::remove_file(location.package_dir().join(INFO_FILE)).unwrap();

        let oxum = generator
            .add_payload_entries(&location, &[record(&location, b"cc")])
            .await
            .unwrap();
        assert_eq!(oxum, PayloadOxum::new(2, 1));
    }
}
