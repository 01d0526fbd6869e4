//! Media records and content digests.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::location::LocationId;

/// SHA-256 content digest, lowercase hex (64 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Length of a digest in hex characters
    pub const HEX_LEN: usize = 64;

    /// Build a digest from raw hash output
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Parse a hex digest (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == Self::HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Get the hex string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix used in payload paths
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }

    /// Abbreviated form for logs
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid content digest: {}", value))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

/// Category of imported media (also the top-level payload folder)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    Image,
    Video,
    Document,
    Map,
}

impl MediaCategory {
    pub const ALL: [MediaCategory; 4] = [
        MediaCategory::Image,
        MediaCategory::Video,
        MediaCategory::Document,
        MediaCategory::Map,
    ];

    /// Folder name inside a location package
    pub fn dir_name(&self) -> &'static str {
        match self {
            MediaCategory::Image => "image",
            MediaCategory::Video => "video",
            MediaCategory::Document => "document",
            MediaCategory::Map => "map",
        }
    }

    /// Infer a category from a file extension; unknown extensions are documents
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" | "tif" | "tiff" | "bmp"
            | "dng" | "cr2" | "cr3" | "nef" | "arw" | "orf" | "rw2" | "raf" => {
                MediaCategory::Image
            }
            "mp4" | "mov" | "m4v" | "avi" | "mkv" | "mts" | "m2ts" | "3gp" | "webm" | "wmv"
            | "mpg" | "mpeg" => MediaCategory::Video,
            "kml" | "kmz" | "gpx" | "geojson" | "shp" | "mbtiles" => MediaCategory::Map,
            _ => MediaCategory::Document,
        }
    }

    /// Infer a category from a path's extension
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(MediaCategory::Document)
    }
}

impl std::fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl std::str::FromStr for MediaCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "image" | "img" => Ok(MediaCategory::Image),
            "video" | "vid" => Ok(MediaCategory::Video),
            "document" | "doc" => Ok(MediaCategory::Document),
            "map" => Ok(MediaCategory::Map),
            _ => anyhow::bail!("Unknown media category: {}", s),
        }
    }
}

/// One imported file as recorded in the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Location the file belongs to
    pub location_id: LocationId,

    /// Content digest (identity, unique per location)
    pub digest: ContentDigest,

    /// Filename as it was on the source side
    pub original_name: String,

    /// Size in bytes
    pub size: u64,

    /// Media category
    pub category: MediaCategory,

    /// Path relative to the location root (forward slashes)
    pub relative_path: String,

    /// When the file was imported
    pub imported_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_digest_parse() {
        let digest = ContentDigest::parse(&SAMPLE.to_uppercase()).unwrap();
        assert_eq!(digest.as_str(), SAMPLE);
        assert_eq!(digest.prefix(), "9f");
        assert_eq!(digest.short().len(), 12);

        assert!(ContentDigest::parse("abc").is_none());
        assert!(ContentDigest::parse(&"z".repeat(64)).is_none());
    }

    #[test]
    fn test_digest_serde_rejects_garbage() {
        let json = format!("\"{}\"", SAMPLE);
        let digest: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest.as_str(), SAMPLE);

        assert!(serde_json::from_str::<ContentDigest>("\"nope\"").is_err());
    }

    #[test]
    fn test_category_from_extension() {
        assert_eq!(MediaCategory::from_extension("JPG"), MediaCategory::Image);
        assert_eq!(MediaCategory::from_extension(".mov"), MediaCategory::Video);
        assert_eq!(MediaCategory::from_extension("pdf"), MediaCategory::Document);
        assert_eq!(MediaCategory::from_extension("gpx"), MediaCategory::Map);
        assert_eq!(MediaCategory::from_extension(""), MediaCategory::Document);
        assert_eq!(
            MediaCategory::from_path(Path::new("/tmp/scan.tiff")),
            MediaCategory::Image
        );
    }
}
