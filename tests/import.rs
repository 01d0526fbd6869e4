//! Import Integration Tests
//!
//! End-to-end batches through the Vault: placement, dedup, partial
//! failures and the progress stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use locvault::core::ContentHasher;
use locvault::domain::{
    BatchStatus, EventKind, FileOutcome, ImportErrorKind, Location, SkipReason,
};
use locvault::package::manifest::read_manifest;
use locvault::{IntegrityStatus, SqliteCatalog, Vault};
use tempfile::TempDir;

fn vault(temp: &TempDir) -> Vault {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    Vault::new(Arc::new(catalog), temp.path().join("archive"))
}

async fn location(vault: &Vault, name: &str) -> Location {
    let location = Location::new(name, vault.archive_root());
    vault.add_location(location).await.unwrap()
}

fn source(temp: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let dir = temp.path().join("incoming");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn manifest_text(location: &Location) -> String {
    std::fs::read_to_string(location.root.join("_package/manifest-checksums.txt")).unwrap()
}

#[tokio::test]
async fn test_import_places_by_digest() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Old Mill").await;

    let photo = source(&temp, "IMG_0001.JPG", b"photo bytes");
    let clip = source(&temp, "clip.mov", b"video bytes");
    let scan = source(&temp, "deed.pdf", b"document bytes");

    let summary = vault
        .import_files(&loc.id, vec![photo, clip, scan])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Complete);
    assert_eq!((summary.placed, summary.skipped, summary.failed), (3, 0, 0));

    let digest = ContentHasher::digest_bytes(b"photo bytes");
    let expected = format!("image/{}/{}.jpg", &digest.as_str()[..2], digest);
    assert!(loc.root.join(&expected).is_file());

    let manifest = manifest_text(&loc);
    assert_eq!(manifest.lines().count(), 3);
    assert!(manifest.contains(&format!("{}  {}", digest, expected)));

    let media = vault.media(&loc.id).await.unwrap();
    assert_eq!(media.len(), 3);

    let result = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(result.status, IntegrityStatus::Valid);
    assert_eq!(result.files_checked, 3);
}

#[tokio::test]
async fn test_reimport_is_a_noop() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Harbour").await;
    let photo = source(&temp, "a.jpg", b"same content");

    let first = vault
        .import_files(&loc.id, vec![photo.clone()])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(first.placed, 1);
    let manifest_before = manifest_text(&loc);

    let second = vault
        .import_files(&loc.id, vec![photo])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(second.status, BatchStatus::Complete);
    assert_eq!((second.placed, second.skipped), (0, 1));

    assert_eq!(manifest_text(&loc), manifest_before);
    assert_eq!(vault.media(&loc.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicates_within_one_batch_place_once() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Chapel").await;

    let a = source(&temp, "a.jpg", b"twin");
    let b = source(&temp, "b.jpg", b"twin");

    let summary = vault
        .import_files(&loc.id, vec![a, b])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Complete);
    assert_eq!((summary.placed, summary.skipped), (1, 1));
    assert_eq!(manifest_text(&loc).lines().count(), 1);
}

#[tokio::test]
async fn test_identity_ignores_mtime() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Quarry").await;

    let original = source(&temp, "original.jpg", b"stone");
    let copy = source(&temp, "copy-with-new-date.jpg", b"stone");
    let old = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(86_400 * 365));
    filetime::set_file_mtime(&original, old).unwrap();

    vault
        .import_files(&loc.id, vec![original])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    let summary = vault
        .import_files(&loc.id, vec![copy])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!((summary.placed, summary.skipped), (0, 1));
}

#[tokio::test]
async fn test_unreadable_file_makes_batch_partial() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Lighthouse").await;

    let a = source(&temp, "a.jpg", b"first");
    let b = temp.path().join("incoming/vanished.jpg");
    let c = source(&temp, "c.jpg", b"third");

    let summary = vault
        .import_files(&loc.id, vec![a, b.clone(), c])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Partial);
    assert_eq!((summary.placed, summary.failed), (2, 1));
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].path, b);
    assert_eq!(summary.failures[0].kind, ImportErrorKind::UnreadableSource);

    let entries = read_manifest(&loc).await.unwrap().unwrap();
    let listed: Vec<_> = entries.iter().map(|e| e.digest.clone()).collect();
    assert!(listed.contains(&ContentHasher::digest_bytes(b"first")));
    assert!(listed.contains(&ContentHasher::digest_bytes(b"third")));
    assert_eq!(listed.len(), 2);

    let result = vault.validate(&loc.id, true).await.unwrap();
    assert_eq!(result.status, IntegrityStatus::Valid);
}

#[tokio::test]
async fn test_nothing_readable_fails_batch() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Ruin").await;

    let summary = vault
        .import_files(&loc.id, vec![temp.path().join("nope.jpg")])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Failed);
    assert_eq!(summary.placed, 0);
}

#[tokio::test]
async fn test_concurrent_batches_same_content() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Station").await;

    let content = vec![7u8; 256 * 1024];
    let first = source(&temp, "one.jpg", &content);
    let second = source(&temp, "two.jpg", &content);

    let a = vault.import_files(&loc.id, vec![first]).await.unwrap();
    let b = vault.import_files(&loc.id, vec![second]).await.unwrap();
    let (a, b) = tokio::join!(a.finish(), b.finish());
    let (a, b) = (a.unwrap(), b.unwrap());

    // Exactly one batch placed it; the other saw it archived or in flight
    assert_eq!(a.placed + b.placed, 1);
    assert_eq!(a.skipped + b.skipped, 1);
    assert_eq!(vault.media(&loc.id).await.unwrap().len(), 1);
    assert_eq!(manifest_text(&loc).lines().count(), 1);

    let payload: Vec<_> = walk(&loc.root.join("image"));
    assert_eq!(payload.len(), 1);
}

#[tokio::test]
async fn test_directories_expand_and_skip_clutter() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Farmhouse").await;

    let dir = temp.path().join("card");
    std::fs::create_dir_all(dir.join("DCIM")).unwrap();
    std::fs::write(dir.join("DCIM/a.jpg"), b"a").unwrap();
    std::fs::write(dir.join("DCIM/b.jpg"), b"b").unwrap();
    std::fs::write(dir.join(".DS_Store"), b"junk").unwrap();
    std::fs::write(dir.join("Thumbs.db"), b"junk").unwrap();

    let summary = vault
        .import_files(&loc.id, vec![dir])
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.placed, 2);
}

#[tokio::test]
async fn test_progress_stream_events() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let loc = location(&vault, "Bridge").await;
    let files = vec![
        source(&temp, "1.jpg", b"one"),
        source(&temp, "2.jpg", b"two"),
        source(&temp, "1-again.jpg", b"one"),
    ];

    let mut stream = vault.import_files(&loc.id, files).await.unwrap();
    let mut names = Vec::new();
    let mut outcomes = Vec::new();
    while let Some(event) = stream.next().await {
        names.push(event.name());
        if let EventKind::FileComplete { index, outcome, .. } = &event.kind {
            outcomes.push((*index, outcome.clone()));
        }
        if event.is_batch_terminal() {
            break;
        }
    }
    let summary = stream.finish().await.unwrap();

    assert_eq!(names.first(), Some(&"import.progress"));
    assert_eq!(names.last(), Some(&"import.batchComplete"));
    assert_eq!(names.iter().filter(|n| **n == "import.fileComplete").count(), 3);

    // Files complete in submission order
    let indexes: Vec<_> = outcomes.iter().map(|(i, _)| *i).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(matches!(outcomes[0].1, FileOutcome::Placed { .. }));
    assert!(matches!(
        outcomes[2].1,
        FileOutcome::Skipped {
            reason: SkipReason::AlreadyArchived,
            ..
        }
    ));
    assert_eq!(summary.placed, 2);
}

#[tokio::test]
async fn test_unknown_location_is_rejected() {
    let temp = TempDir::new().unwrap();
    let vault = vault(&temp);
    let stranger = Location::new("Never added", vault.archive_root());

    let result = vault
        .import_files(&stranger.id, vec![source(&temp, "a.jpg", b"a")])
        .await;
    assert!(result.is_err());
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}
