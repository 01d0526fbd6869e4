//! Deterministic archive-relative path construction.
//!
//! The layout produced here is read back during validation and from
//! existing manifests, so it must stay stable across releases.

use std::path::{Path, PathBuf};

use crate::domain::{ContentDigest, LocationId, MediaCategory};

/// Extension used when a source has none (or none survives sanitising)
pub const FALLBACK_EXTENSION: &str = "bin";

const MAX_EXTENSION_LEN: usize = 16;

/// Compute `<category>/<digest[0..2]>/<digest>.<ext>`.
///
/// The location id does not appear in the returned path because payload
/// paths are relative to the location's own root; it is accepted so the
/// signature names the full identity triple.
pub fn plan(
    _location_id: &LocationId,
    category: MediaCategory,
    digest: &ContentDigest,
    extension: &str,
) -> String {
    format!(
        "{}/{}/{}.{}",
        category.dir_name(),
        digest.prefix(),
        digest.as_str(),
        sanitize_extension(extension)
    )
}

/// Normalise an extension: lowercase, `[a-z0-9]` only, bounded length
pub fn sanitize_extension(extension: &str) -> String {
    let cleaned: String = extension
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_EXTENSION_LEN)
        .collect();

    if cleaned.is_empty() {
        FALLBACK_EXTENSION.to_string()
    } else {
        cleaned
    }
}

/// Extension of a source path (may be empty)
pub fn source_extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

/// Join a forward-slash relative path onto a root
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hasher::ContentHasher;

    #[test]
    fn test_plan_layout_is_stable() {
        let location = LocationId::derive("Mill", None);
        let digest = ContentHasher::digest_bytes(b"test");

        assert_eq!(
            plan(&location, MediaCategory::Image, &digest, "JPG"),
            "image/9f/9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08.jpg"
        );
    }

    #[test]
    fn test_plan_is_total() {
        let location = LocationId::derive("Mill", None);
        let digest = ContentHasher::digest_bytes(b"x");

        assert!(plan(&location, MediaCategory::Document, &digest, "").ends_with(".bin"));
        assert!(plan(&location, MediaCategory::Document, &digest, "../..").ends_with(".bin"));
        assert!(plan(&location, MediaCategory::Map, &digest, ".tar gz").ends_with(".targz"));
        assert_eq!(sanitize_extension(&"a".repeat(40)).len(), 16);
    }

    #[test]
    fn test_distinct_inputs_do_not_collide() {
        let location = LocationId::derive("Mill", None);
        let d1 = ContentHasher::digest_bytes(b"one");
        let d2 = ContentHasher::digest_bytes(b"two");

        assert_ne!(
            plan(&location, MediaCategory::Image, &d1, "jpg"),
            plan(&location, MediaCategory::Image, &d2, "jpg")
        );
        assert_ne!(
            plan(&location, MediaCategory::Image, &d1, "jpg"),
            plan(&location, MediaCategory::Video, &d1, "jpg")
        );
    }

    #[test]
    fn test_resolve_relative() {
        let root = PathBuf::from("/archive/locations/abc");
        assert_eq!(
            resolve(&root, "image/ab/abcd.jpg"),
            PathBuf::from("/archive/locations/abc/image/ab/abcd.jpg")
        );
    }
}
