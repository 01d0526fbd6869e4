//! Crash Safety Integration Tests
//!
//! Interrupted work must never look like archived content, and a rerun
//! must finish what was left.

use std::sync::Arc;

use chrono::Utc;
use locvault::core::{AtomicWriter, ContentHasher};
use locvault::domain::{BatchStatus, IntegrityIssue, Location, MediaCategory, MediaRecord};
use locvault::package::manifest::read_manifest;
use locvault::{Catalog, IntegrityStatus, SqliteCatalog, Vault};
use tempfile::TempDir;

fn vault(temp: &TempDir) -> Vault {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    Vault::new(Arc::new(catalog), temp.path().join("archive"))
}

#[tokio::test]
async fn test_leftover_temp_file_is_invisible() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = vault
        .add_location(Location::new("Tannery", vault.archive_root()))
        .await
        .unwrap();

    let source = temp.path().join("a.jpg");
    std::fs::write(&source, b"finished").unwrap();
    vault
        .import_files(&loc.id, vec![source])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    // A copy that died before its rename
    let shard = loc.root.join("image/zz");
    std::fs::create_dir_all(&shard).unwrap();
    std::fs::write(shard.join(".locvault-4f2a.tmp"), b"half a fi").unwrap();

    let quick = vault.validate(&loc.id, false).await.unwrap();
    assert_eq!(quick.status, IntegrityStatus::Complete);

    let full = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(full.status, IntegrityStatus::Valid);
    assert!(full.issues.is_empty());
}

#[tokio::test]
async fn test_rerun_completes_interrupted_import() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = vault
        .add_location(Location::new("Foundry", vault.archive_root()))
        .await
        .unwrap();

    let source = temp.path().join("casting.jpg");
    std::fs::write(&source, b"bronze").unwrap();

    // Crash after the rename, before catalog and manifest caught up
    let digest = ContentHasher::digest_bytes(b"bronze");
    let rel = format!("{}/{}/{}.jpg", MediaCategory::Image.dir_name(), digest.prefix(), digest);
    AtomicWriter::new()
        .place_bytes(b"bronze", &loc.root.join(&rel))
        .unwrap();

    let before = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(before.status, IntegrityStatus::Valid);
    assert!(before
        .issues
        .iter()
        .any(|i| matches!(i, IntegrityIssue::Unlisted { path } if path == &rel)));

    let summary = vault
        .import_files(&loc.id, vec![source])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Complete);
    assert_eq!(summary.placed, 1);

    let after = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(after.status, IntegrityStatus::Valid);
    assert!(after.issues.is_empty());
    assert_eq!(vault.media(&loc.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_manifest_answers_dedup_without_catalog_rows() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("archive");
    let source = temp.path().join("plan.pdf");
    std::fs::write(&source, b"survey").unwrap();

    let location = Location::new("Gasworks", &archive);
    {
        let first = vault(&temp);
        first.add_location(location.clone()).await.unwrap();
        let summary = first
            .import_files(&location.id, vec![source.clone()])
            .await
            .unwrap()
            .finish()
            .await
            .unwrap();
        assert_eq!(summary.placed, 1);
    }

    // Catalog lost; the package on disk survives
    let second = vault(&temp);
    second.add_location(location.clone()).await.unwrap();
    let summary = second
        .import_files(&location.id, vec![source])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!((summary.placed, summary.skipped), (0, 1));
    let result = second.validate(&location.id, true).await.unwrap();
    assert_eq!(result.status, IntegrityStatus::Valid);

    // The listed file got its catalog row back
    let media = second.media(&location.id).await.unwrap();
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].original_name, "plan.pdf");
    assert_eq!(media[0].size, 6);
    assert_eq!(media[0].category, MediaCategory::Document);
}

#[tokio::test]
async fn test_rerun_relists_cataloged_file() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = vault
        .add_location(Location::new("Ropewalk", vault.archive_root()))
        .await
        .unwrap();

    let kept = temp.path().join("kept.jpg");
    std::fs::write(&kept, b"hemp").unwrap();
    vault
        .import_files(&loc.id, vec![kept])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    // Crash after the catalog row, before the listing caught up
    let source = temp.path().join("coil.jpg");
    std::fs::write(&source, b"tar").unwrap();
    let digest = ContentHasher::digest_bytes(b"tar");
    let rel = format!("{}/{}/{}.jpg", MediaCategory::Image.dir_name(), digest.prefix(), digest);
    AtomicWriter::new()
        .place_bytes(b"tar", &loc.root.join(&rel))
        .unwrap();
    vault
        .catalog()
        .record_media(&MediaRecord {
            location_id: loc.id.clone(),
            digest: digest.clone(),
            original_name: "coil.jpg".to_string(),
            size: 3,
            category: MediaCategory::Image,
            relative_path: rel.clone(),
            imported_at: Utc::now(),
        })
        .await
        .unwrap();

    let before = vault.validate(&loc.id, true).await.unwrap();
    assert!(before
        .issues
        .iter()
        .any(|i| matches!(i, IntegrityIssue::Unlisted { path } if path == &rel)));

    let summary = vault
        .import_files(&loc.id, vec![source])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!((summary.placed, summary.skipped), (0, 1));
    assert!(summary.warnings.is_empty());

    let entries = read_manifest(&loc).await.unwrap().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.digest == digest && e.path == rel));

    let after = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(after.status, IntegrityStatus::Valid);
    assert!(after.issues.is_empty());
    let quick = vault.validate(&loc.id, false).await.unwrap();
    assert_eq!(quick.status, IntegrityStatus::Complete);
}

#[tokio::test]
async fn test_lost_summary_is_rebuilt_from_catalog() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = vault
        .add_location(Location::new("Brewery", vault.archive_root()))
        .await
        .unwrap();

    let first = temp.path().join("vat.jpg");
    std::fs::write(&first, b"copper").unwrap();
    vault
        .import_files(&loc.id, vec![first])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    std::fs::remove_file(loc.package_dir().join("package-info.txt")).unwrap();

    let second = temp.path().join("cask.jpg");
    std::fs::write(&second, b"oak").unwrap();
    let summary = vault
        .import_files(&loc.id, vec![second])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(summary.placed, 1);
    assert!(summary.warnings.iter().any(|w| w.contains("rebuilt from catalog")));

    let full = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(full.status, IntegrityStatus::Valid);
    assert!(full.issues.is_empty());
    let quick = vault.validate(&loc.id, false).await.unwrap();
    assert_eq!(quick.status, IntegrityStatus::Complete);
    assert_eq!(quick.bytes_checked, 9);
}

#[tokio::test]
async fn test_writer_leaves_no_temp_on_digest_mismatch() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("moving.jpg");
    std::fs::write(&src, b"changed underneath").unwrap();
    let dest = temp.path().join("out/image/ab/target.jpg");

    let wrong = ContentHasher::digest_bytes(b"what we hashed earlier");
    let result = AtomicWriter::new().place(&src, &dest, Some(&wrong));
    assert!(result.is_err());
    assert!(!dest.exists());

    let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
        .unwrap()
        .flatten()
        .collect();
    assert!(leftovers.is_empty());
}
