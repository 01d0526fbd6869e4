//! Location records: the archival subject a package folder belongs to.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable location identifier (SHA256(normalised name [+ disambiguator])[0:16])
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    /// Length of an identifier in hex characters
    pub const LEN: usize = 16;

    /// Derive an identifier from a location name.
    ///
    /// The name is trimmed, lowercased and has its whitespace collapsed, so
    /// re-creating a location with the same name reproduces the same id. The
    /// optional disambiguator separates two distinct places sharing a name.
    pub fn derive(name: &str, disambiguator: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_name(name).as_bytes());
        if let Some(extra) = disambiguator {
            hasher.update(b"\0");
            hasher.update(normalize_name(extra).as_bytes());
        }
        let result = hasher.finalize();

        // Take first 8 bytes (16 hex chars)
        Self(hex::encode(&result[..8]))
    }

    /// Parse an identifier previously produced by [`LocationId::derive`]
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == Self::LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// Get the raw string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LocationId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::parse(s).ok_or_else(|| anyhow::anyhow!("Invalid location id: {}", s))
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Geographic point attached to a location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A logical archival subject with its own package folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Stable identifier, never changes after creation
    pub id: LocationId,

    /// Human-readable name
    pub name: String,

    /// Root folder of the location package
    pub root: PathBuf,

    /// Optional coordinates
    pub geo: Option<GeoPoint>,

    /// Optional street address
    pub address: Option<String>,

    /// Free-form notes
    pub notes: Option<String>,

    /// When the location was created
    pub created_at: DateTime<Utc>,
}

impl Location {
    /// Create a new location rooted under `<archive>/locations/<id>`
    pub fn new(name: impl Into<String>, archive_root: &Path) -> Self {
        let name = name.into();
        let id = LocationId::derive(&name, None);
        let root = Self::root_for(archive_root, &id);

        Self {
            id,
            name,
            root,
            geo: None,
            address: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    /// Folder a location with this id lives in
    pub fn root_for(archive_root: &Path, id: &LocationId) -> PathBuf {
        archive_root.join("locations").join(id.as_str())
    }

    /// Use a disambiguator when deriving the id (two places with one name)
    pub fn with_disambiguator(mut self, archive_root: &Path, disambiguator: &str) -> Self {
        self.id = LocationId::derive(&self.name, Some(disambiguator));
        self.root = Self::root_for(archive_root, &self.id);
        self
    }

    /// Set coordinates
    pub fn with_geo(mut self, latitude: f64, longitude: f64) -> Self {
        self.geo = Some(GeoPoint {
            latitude,
            longitude,
        });
        self
    }

    /// Set the street address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set notes
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Directory holding the package metadata files
    pub fn package_dir(&self) -> PathBuf {
        self.root.join(crate::package::PACKAGE_DIR)
    }
}
