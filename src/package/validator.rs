//! IntegrityValidator: checks a location package against the filesystem.
//!
//! A quick check compares the recorded Payload-Oxum with a directory
//! listing. A full check verifies the tag manifest and then rehashes every
//! listed payload file. [`IntegrityValidator::validate`] escalates a failed
//! quick check to a full one and stores the verdict in the catalog.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::format::{self, is_safe_relative_path, PackageInfo, PayloadOxum};
use super::manifest::read_package_bytes;
use super::{
    tag_path, ManifestError, INFO_FILE, MANIFEST_FILE, TAGMANIFEST_FILE, TAG_FILES, VERSION_FILE,
};
use crate::catalog::Catalog;
use crate::core::hasher::ContentHasher;
use crate::core::locks::LocationLocks;
use crate::core::planner;
use crate::core::writer::is_temp_file;
use crate::domain::{
    CheckLevel, IntegrityCheckResult, IntegrityIssue, IntegrityStatus, Location, MediaCategory,
};

/// Package files read together while the location lock is held
struct PackageSnapshot {
    files: HashMap<&'static str, Vec<u8>>,
}

impl PackageSnapshot {
    async fn take(location: &Location, locks: &LocationLocks) -> Result<Self, ManifestError> {
        let _guard = locks.lock(&location.id).await;

        let mut files = HashMap::new();
        for name in [VERSION_FILE, INFO_FILE, MANIFEST_FILE, TAGMANIFEST_FILE] {
            if let Some(bytes) = read_package_bytes(location, name).await? {
                files.insert(name, bytes);
            }
        }
        Ok(Self { files })
    }

    fn text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.files.get(name).map(|bytes| String::from_utf8_lossy(bytes))
    }

    /// Bytes of a tag file named by its location-relative path
    fn tag_file(&self, path: &str) -> Option<Option<&[u8]>> {
        TAG_FILES
            .iter()
            .find(|name| tag_path(name) == path)
            .map(|name| self.files.get(name).map(Vec::as_slice))
    }
}

/// Validates location packages and records the outcome.
///
/// Package files are read under the same per-location locks the
/// [`ManifestGenerator`](super::ManifestGenerator) writes under, so a check
/// never sees a listing from one update and a tag manifest from another.
#[derive(Clone)]
pub struct IntegrityValidator {
    catalog: Arc<dyn Catalog>,
    locks: LocationLocks,
}

impl IntegrityValidator {
    pub fn new(catalog: Arc<dyn Catalog>, locks: LocationLocks) -> Self {
        Self { catalog, locks }
    }

    /// Run a check and store it as the location's current status.
    ///
    /// A quick check that does not pass is immediately followed by a full
    /// check, whose result is the one returned.
    #[instrument(skip(self, location), fields(location = %location.id))]
    pub async fn validate(
        &self,
        location: &Location,
        level: CheckLevel,
    ) -> Result<IntegrityCheckResult, ManifestError> {
        let result = match level {
            CheckLevel::Full => self.full_check(location).await?,
            CheckLevel::Quick => {
                let quick = self.quick_check(location).await?;
                match quick.status {
                    IntegrityStatus::Complete | IntegrityStatus::Absent => quick,
                    _ => {
                        info!("Quick check failed, running full check");
                        self.full_check(location).await?
                    }
                }
            }
        };

        self.catalog.save_integrity(&result).await?;

        match result.status {
            IntegrityStatus::Valid | IntegrityStatus::Complete => {
                info!(status = %result.status, files = result.files_checked, "Location verified")
            }
            IntegrityStatus::Absent => info!("Location has no package yet"),
            _ if result.manifest_corrupt() => {
                error!(status = %result.status, issues = result.issues.len(), "Package metadata corrupt")
            }
            _ => warn!(status = %result.status, issues = result.issues.len(), "Location failed validation"),
        }

        Ok(result)
    }

    /// Compare the recorded summary with a directory listing.
    ///
    /// Yields `Complete`, `Absent`, or `Incomplete` with the reason; it
    /// never reads payload bytes.
    pub async fn quick_check(&self, location: &Location) -> Result<IntegrityCheckResult, ManifestError> {
        let mut result =
            IntegrityCheckResult::new(location.id.clone(), IntegrityStatus::Complete, CheckLevel::Quick);

        let snapshot = PackageSnapshot::take(location, &self.locks).await?;
        if snapshot.text(MANIFEST_FILE).is_none() {
            result.status = IntegrityStatus::Absent;
            return Ok(result);
        }

        let recorded = match snapshot.text(INFO_FILE) {
            Some(text) => match PackageInfo::parse(&text) {
                Ok(info) => info.payload_oxum,
                Err(e) => {
                    result.status = IntegrityStatus::Incomplete;
                    result.issues.push(IntegrityIssue::ManifestCorrupt {
                        file: tag_path(INFO_FILE),
                        detail: e.to_string(),
                    });
                    return Ok(result);
                }
            },
            None => {
                result.status = IntegrityStatus::Incomplete;
                result.issues.push(IntegrityIssue::ManifestCorrupt {
                    file: tag_path(INFO_FILE),
                    detail: "missing".to_string(),
                });
                return Ok(result);
            }
        };

        let listing = list_payload(&location.root).await?;
        let actual = PayloadOxum::new(
            listing.iter().map(|(_, size)| size).sum(),
            listing.len() as u64,
        );
        result.files_checked = actual.count;
        result.bytes_checked = actual.bytes;

        if actual != recorded {
            debug!(%recorded, %actual, "Payload summary differs");
            result.status = IntegrityStatus::Incomplete;
            result.issues.push(IntegrityIssue::SummaryMismatch {
                expected_bytes: recorded.bytes,
                expected_files: recorded.count,
                actual_bytes: actual.bytes,
                actual_files: actual.count,
            });
        }

        Ok(result)
    }

    /// Verify the tag manifest and rehash every listed payload file
    pub async fn full_check(&self, location: &Location) -> Result<IntegrityCheckResult, ManifestError> {
        let mut result =
            IntegrityCheckResult::new(location.id.clone(), IntegrityStatus::Valid, CheckLevel::Full);

        let snapshot = PackageSnapshot::take(location, &self.locks).await?;
        let Some(manifest_text) = snapshot.text(MANIFEST_FILE) else {
            result.status = IntegrityStatus::Absent;
            return Ok(result);
        };

        check_tag_layer(location, &snapshot, &mut result).await;

        match format::parse_checksums(&manifest_text) {
            Ok(entries) => {
                let mut listed = HashSet::new();
                for entry in &entries {
                    listed.insert(entry.path.clone());
                    if !is_safe_relative_path(&entry.path) {
                        result.issues.push(IntegrityIssue::ManifestCorrupt {
                            file: tag_path(MANIFEST_FILE),
                            detail: format!("path escapes location: {}", entry.path),
                        });
                        continue;
                    }

                    let path = planner::resolve(&location.root, &entry.path);
                    match ContentHasher::digest_file(&path).await {
                        Ok(hashed) => {
                            result.files_checked += 1;
                            result.bytes_checked += hashed.size;
                            if hashed.digest != entry.digest {
                                result.issues.push(IntegrityIssue::DigestMismatch {
                                    path: entry.path.clone(),
                                    expected: entry.digest.clone(),
                                    actual: hashed.digest,
                                });
                            }
                        }
                        Err(e) if e.io_kind() == std::io::ErrorKind::NotFound => {
                            result.issues.push(IntegrityIssue::MissingPayload {
                                path: entry.path.clone(),
                            });
                        }
                        Err(e) => {
                            result.issues.push(IntegrityIssue::Unreadable {
                                path: entry.path.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }

                for (path, _) in list_payload(&location.root).await? {
                    if !listed.contains(&path) {
                        result.issues.push(IntegrityIssue::Unlisted { path });
                    }
                }
            }
            Err(e) => {
                result.issues.push(IntegrityIssue::ManifestCorrupt {
                    file: tag_path(MANIFEST_FILE),
                    detail: e.to_string(),
                });
            }
        }

        result.status = status_from(&result.issues);
        Ok(result)
    }
}

/// Checksums of the package files themselves
async fn check_tag_layer(location: &Location, snapshot: &PackageSnapshot, result: &mut IntegrityCheckResult) {
    let tag_file = tag_path(TAGMANIFEST_FILE);
    let Some(text) = snapshot.text(TAGMANIFEST_FILE) else {
        result.issues.push(IntegrityIssue::ManifestCorrupt {
            file: tag_file,
            detail: "missing".to_string(),
        });
        return;
    };

    let tags = match format::parse_checksums(&text) {
        Ok(tags) => tags,
        Err(e) => {
            result.issues.push(IntegrityIssue::ManifestCorrupt {
                file: tag_file,
                detail: e.to_string(),
            });
            return;
        }
    };

    for name in TAG_FILES {
        let expected = tag_path(name);
        if !tags.iter().any(|t| t.path == expected) {
            result.issues.push(IntegrityIssue::ManifestCorrupt {
                file: expected,
                detail: "not covered by tag manifest".to_string(),
            });
        }
    }

    for tag in &tags {
        if !is_safe_relative_path(&tag.path) {
            result.issues.push(IntegrityIssue::ManifestCorrupt {
                file: tag_file.clone(),
                detail: format!("path escapes location: {}", tag.path),
            });
            continue;
        }

        let actual = match snapshot.tag_file(&tag.path) {
            Some(Some(bytes)) => Ok(ContentHasher::digest_bytes(bytes)),
            Some(None) => Err("missing".to_string()),
            // Extra tag files are not written by us; read them as they are
            None => ContentHasher::digest_file(&planner::resolve(&location.root, &tag.path))
                .await
                .map(|hashed| hashed.digest)
                .map_err(|e| e.to_string()),
        };
        match actual {
            Ok(digest) if digest == tag.digest => {}
            Ok(digest) => result.issues.push(IntegrityIssue::ManifestCorrupt {
                file: tag.path.clone(),
                detail: format!("checksum {} does not match {}", digest.short(), tag.digest.short()),
            }),
            Err(detail) => result.issues.push(IntegrityIssue::ManifestCorrupt {
                file: tag.path.clone(),
                detail,
            }),
        }
    }

    // A package copied under the wrong location folder is not this location's package
    if let Some(text) = snapshot.text(INFO_FILE) {
        if let Ok(info) = PackageInfo::parse(&text) {
            if info.external_identifier != location.id {
                result.issues.push(IntegrityIssue::ManifestCorrupt {
                    file: tag_path(INFO_FILE),
                    detail: format!("identifier {} belongs to another location", info.external_identifier),
                });
            }
        }
    }
}

/// Verdict for a full check
pub fn status_from(issues: &[IntegrityIssue]) -> IntegrityStatus {
    let invalid = issues.iter().any(|i| {
        matches!(
            i,
            IntegrityIssue::ManifestCorrupt { .. } | IntegrityIssue::DigestMismatch { .. }
        )
    });
    let incomplete = issues.iter().any(|i| {
        matches!(
            i,
            IntegrityIssue::MissingPayload { .. } | IntegrityIssue::Unreadable { .. }
        )
    });

    if invalid {
        IntegrityStatus::Invalid
    } else if incomplete {
        IntegrityStatus::Incomplete
    } else {
        IntegrityStatus::Valid
    }
}

/// Payload files on disk: (relative path, size), sorted by path.
///
/// Only category folders count; hidden files and in-progress temp files
/// are ignored.
pub async fn list_payload(root: &Path) -> Result<Vec<(String, u64)>, ManifestError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for category in MediaCategory::ALL {
            let dir = root.join(category.dir_name());
            walk(&dir, category.dir_name(), &mut out)?;
        }
        out.sort();
        Ok(out)
    })
    .await
    .map_err(|e| ManifestError::io(PathBuf::new(), std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn walk(dir: &Path, prefix: &str, out: &mut Vec<(String, u64)>) -> Result<(), ManifestError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ManifestError::io(dir, e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| ManifestError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || is_temp_file(&name) {
            continue;
        }
        let file_type = entry.file_type().map_err(|e| ManifestError::io(entry.path(), e))?;
        let relative = format!("{}/{}", prefix, name);
        if file_type.is_dir() {
            walk(&entry.path(), &relative, out)?;
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(|e| ManifestError::io(entry.path(), e))?;
            out.push((relative, meta.len()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::domain::{ContentDigest, MediaRecord};
    use crate::package::ManifestGenerator;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        location: Location,
        records: Vec<MediaRecord>,
        validator: IntegrityValidator,
        generator: ManifestGenerator,
        catalog: Arc<SqliteCatalog>,
    }

    async fn fixture(payloads: &[&[u8]]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Mill", temp.path());
        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        catalog.insert_location(&location).await.unwrap();

        let mut records = Vec::new();
        for bytes in payloads {
            let digest: ContentDigest = ContentHasher::digest_bytes(bytes);
            let relative_path = planner::plan(&location.id, MediaCategory::Image, &digest, "jpg");
            let path = planner::resolve(&location.root, &relative_path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, bytes).unwrap();
            records.push(MediaRecord {
                location_id: location.id.clone(),
                digest,
                original_name: "x.jpg".to_string(),
                size: bytes.len() as u64,
                category: MediaCategory::Image,
                relative_path,
                imported_at: Utc::now(),
            });
        }

        let generator = ManifestGenerator::default();
        generator.regenerate(&location, &records).await.unwrap();

        Fixture {
            validator: IntegrityValidator::new(catalog.clone(), generator.locks().clone()),
            generator,
            _temp: temp,
            location,
            records,
            catalog,
        }
    }

    fn payload_path(f: &Fixture, idx: usize) -> std::path::PathBuf {
        planner::resolve(&f.location.root, &f.records[idx].relative_path)
    }

    #[tokio::test]
    async fn test_absent_without_manifest() {
        let temp = TempDir::new().unwrap();
        let location = Location::new("Nowhere", temp.path());
        let catalog = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        let validator = IntegrityValidator::new(catalog, LocationLocks::new());

        for level in [CheckLevel::Quick, CheckLevel::Full] {
            let result = validator.validate(&location, level).await.unwrap();
            assert_eq!(result.status, IntegrityStatus::Absent);
        }
    }

    #[tokio::test]
    async fn test_quick_and_full_pass() {
        let f = fixture(&[b"one", b"two", b"three"]).await;

        let quick = f.validator.validate(&f.location, CheckLevel::Quick).await.unwrap();
        assert_eq!(quick.status, IntegrityStatus::Complete);
        assert_eq!(quick.level, CheckLevel::Quick);

        let full = f.validator.validate(&f.location, CheckLevel::Full).await.unwrap();
        assert_eq!(full.status, IntegrityStatus::Valid);
        assert_eq!(full.files_checked, 3);
        assert!(full.issues.is_empty());

        let stored = f.catalog.integrity(&f.location.id).await.unwrap().unwrap();
        assert_eq!(stored.status, IntegrityStatus::Valid);
    }

    #[tokio::test]
    async fn test_corrupted_byte_is_invalid_and_localized() {
        let f = fixture(&[b"one", b"two", b"three"]).await;
        let target = payload_path(&f, 1);
        let mut bytes = std::fs::read(&target).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&target, bytes).unwrap();

        let result = f.validator.full_check(&f.location).await.unwrap();
        assert_eq!(result.status, IntegrityStatus::Invalid);
        assert_eq!(result.mismatched_paths(), vec![f.records[1].relative_path.as_str()]);
        assert!(result.missing_paths().is_empty());
    }

    #[tokio::test]
    async fn test_truncation_escalates_from_quick() {
        let f = fixture(&[b"one", b"two"]).await;
        std::fs::write(payload_path(&f, 0), b"o").unwrap();

        let result = f.validator.validate(&f.location, CheckLevel::Quick).await.unwrap();
        assert_eq!(result.level, CheckLevel::Full);
        assert_eq!(result.status, IntegrityStatus::Invalid);
        assert_eq!(result.mismatched_paths().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_is_incomplete_not_invalid() {
        let f = fixture(&[b"one", b"two"]).await;
        std::fs::remove_file(payload_path(&f, 0)).unwrap();

        let result = f.validator.validate(&f.location, CheckLevel::Quick).await.unwrap();
        assert_eq!(result.status, IntegrityStatus::Incomplete);
        assert_eq!(result.missing_paths(), vec![f.records[0].relative_path.as_str()]);
        assert!(result.mismatched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_manifest_is_flagged() {
        let f = fixture(&[b"one"]).await;
        let info = f.location.package_dir().join(INFO_FILE);
        let text = std::fs::read_to_string(&info).unwrap();
        std::fs::write(&info, text.replace("Location-Name: Mill", "Location-Name: Mall")).unwrap();

        let result = f.validator.full_check(&f.location).await.unwrap();
        assert_eq!(result.status, IntegrityStatus::Invalid);
        assert!(result.manifest_corrupt());
        assert!(result.mismatched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_and_temp_files() {
        let f = fixture(&[b"one"]).await;
        let dir = f.location.root.join("image/zz");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stray.jpg"), b"stray").unwrap();
        std::fs::write(dir.join(".locvault-abc.tmp"), b"partial").unwrap();

        let result = f.validator.full_check(&f.location).await.unwrap();
        assert_eq!(result.status, IntegrityStatus::Valid);
        assert_eq!(
            result.issues,
            vec![IntegrityIssue::Unlisted {
                path: "image/zz/stray.jpg".to_string()
            }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_full_check_during_metadata_edits() {
        let f = fixture(&[b"one", b"two", b"three"]).await;

        let generator = f.generator.clone();
        let location = f.location.clone();
        let editor = tokio::spawn(async move {
            for i in 0..300 {
                let edited = location.clone().with_notes(format!("survey pass {}", i));
                generator.update_descriptive_metadata(&edited).await.unwrap();
            }
        });

        loop {
            let result = f.validator.full_check(&f.location).await.unwrap();
            assert_eq!(result.status, IntegrityStatus::Valid, "{:?}", result.issues);
            let quick = f.validator.quick_check(&f.location).await.unwrap();
            assert_eq!(quick.status, IntegrityStatus::Complete, "{:?}", quick.issues);
            if editor.is_finished() {
                break;
            }
        }
        editor.await.unwrap();
    }

    #[test]
    fn test_missing_plus_mismatch_is_invalid() {
        let issues = vec![
            IntegrityIssue::MissingPayload {
                path: "a".to_string(),
            },
            IntegrityIssue::DigestMismatch {
                path: "b".to_string(),
                expected: ContentHasher::digest_bytes(b"1"),
                actual: ContentHasher::digest_bytes(b"2"),
            },
        ];
        assert_eq!(status_from(&issues), IntegrityStatus::Invalid);
        assert_eq!(status_from(&issues[..1]), IntegrityStatus::Incomplete);
        assert_eq!(status_from(&[]), IntegrityStatus::Valid);
    }
}
