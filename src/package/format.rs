//! Text formats of the package files.
//!
//! Everything here is pure: render to a `String`, parse from a `&str`.
//! Checksum listings use the `<hex>  <path>` layout understood by
//! `sha256sum -c`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ContentDigest, Location, LocationId};

/// Errors parsing a package file
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("line {line}: expected '<digest>  <path>', got {content:?}")]
    MalformedChecksum { line: usize, content: String },

    #[error("line {line}: expected 'Key: value', got {content:?}")]
    MalformedInfo { line: usize, content: String },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// One line of a checksum listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub digest: ContentDigest,
    /// Forward-slash path relative to the location root
    pub path: String,
}

impl ChecksumEntry {
    pub fn new(digest: ContentDigest, path: impl Into<String>) -> Self {
        Self {
            digest,
            path: path.into(),
        }
    }
}

/// Render a listing sorted by path
pub fn render_checksums(entries: &[ChecksumEntry]) -> String {
    let mut sorted: Vec<&ChecksumEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut out = String::new();
    for entry in sorted {
        out.push_str(entry.digest.as_str());
        out.push_str("  ");
        out.push_str(&entry.path);
        out.push('\n');
    }
    out
}

/// Parse a listing; blank lines are ignored
pub fn parse_checksums(text: &str) -> Result<Vec<ChecksumEntry>, FormatError> {
    let mut entries = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let malformed = || FormatError::MalformedChecksum {
            line: idx + 1,
            content: line.to_string(),
        };

        let (digest, path) = line.split_once("  ").ok_or_else(malformed)?;
        let digest = ContentDigest::parse(digest).ok_or_else(malformed)?;
        if path.is_empty() {
            return Err(malformed());
        }

        entries.push(ChecksumEntry::new(digest, path));
    }
    Ok(entries)
}

/// Whether a listed path stays inside the location root
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

/// Payload size summary: total bytes and file count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOxum {
    pub bytes: u64,
    pub count: u64,
}

impl PayloadOxum {
    pub fn new(bytes: u64, count: u64) -> Self {
        Self { bytes, count }
    }
}

impl fmt::Display for PayloadOxum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bytes, self.count)
    }
}

impl FromStr for PayloadOxum {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FormatError::InvalidValue {
            field: "Payload-Oxum",
            value: s.to_string(),
        };
        let (bytes, count) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            bytes: bytes.parse().map_err(|_| invalid())?,
            count: count.parse().map_err(|_| invalid())?,
        })
    }
}

/// Content of `bagit-version.txt`
pub fn render_version() -> String {
    "BagIt-Version: 1.0\nTag-File-Character-Encoding: UTF-8\n".to_string()
}

/// Descriptive metadata in `package-info.txt`
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub external_identifier: LocationId,
    pub location_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub bagging_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub payload_oxum: PayloadOxum,
    pub agent: String,
}

impl PackageInfo {
    /// Describe a location with the given payload summary
    pub fn for_location(location: &Location, payload_oxum: PayloadOxum) -> Self {
        Self {
            external_identifier: location.id.clone(),
            location_name: location.name.clone(),
            latitude: location.geo.map(|g| g.latitude),
            longitude: location.geo.map(|g| g.longitude),
            address: location.address.clone(),
            notes: location.notes.clone(),
            bagging_date: location.created_at,
            last_updated: Utc::now(),
            payload_oxum,
            agent: agent(),
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            ("External-Identifier", self.external_identifier.to_string()),
            ("Location-Name", fold(&self.location_name)),
        ];
        if let Some(lat) = self.latitude {
            lines.push(("Latitude", lat.to_string()));
        }
        if let Some(lon) = self.longitude {
            lines.push(("Longitude", lon.to_string()));
        }
        if let Some(address) = &self.address {
            lines.push(("Address", fold(address)));
        }
        if let Some(notes) = &self.notes {
            lines.push(("Internal-Sender-Description", fold(notes)));
        }
        lines.push(("Bagging-Date", self.bagging_date.to_rfc3339()));
        lines.push(("Last-Updated", self.last_updated.to_rfc3339()));
        lines.push(("Payload-Oxum", self.payload_oxum.to_string()));
        lines.push(("Bag-Software-Agent", self.agent.clone()));

        lines
            .into_iter()
            .map(|(k, v)| format!("{}: {}\n", k, v))
            .collect()
    }

    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let mut id = None;
        let mut name = None;
        let mut latitude = None;
        let mut longitude = None;
        let mut address = None;
        let mut notes = None;
        let mut bagging_date = None;
        let mut last_updated = None;
        let mut oxum = None;
        let mut agent_field = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FormatError::MalformedInfo {
                    line: idx + 1,
                    content: line.to_string(),
                })?;
            let value = value.trim();

            match key.trim() {
                "External-Identifier" => {
                    id = Some(LocationId::parse(value).ok_or(FormatError::InvalidValue {
                        field: "External-Identifier",
                        value: value.to_string(),
                    })?)
                }
                "Location-Name" => name = Some(value.to_string()),
                "Latitude" => latitude = Some(parse_float("Latitude", value)?),
                "Longitude" => longitude = Some(parse_float("Longitude", value)?),
                "Address" => address = Some(value.to_string()),
                "Internal-Sender-Description" => notes = Some(value.to_string()),
                "Bagging-Date" => bagging_date = Some(parse_time("Bagging-Date", value)?),
                "Last-Updated" => last_updated = Some(parse_time("Last-Updated", value)?),
                "Payload-Oxum" => oxum = Some(value.parse::<PayloadOxum>()?),
                "Bag-Software-Agent" => agent_field = Some(value.to_string()),
                // Unknown keys are tolerated so newer writers stay readable
                _ => {}
            }
        }

        Ok(Self {
            external_identifier: id.ok_or(FormatError::MissingField("External-Identifier"))?,
            location_name: name.ok_or(FormatError::MissingField("Location-Name"))?,
            latitude,
            longitude,
            address,
            notes,
            bagging_date: bagging_date.ok_or(FormatError::MissingField("Bagging-Date"))?,
            last_updated: last_updated.ok_or(FormatError::MissingField("Last-Updated"))?,
            payload_oxum: oxum.ok_or(FormatError::MissingField("Payload-Oxum"))?,
            agent: agent_field.unwrap_or_default(),
        })
    }
}

/// `locvault/<version>`
pub fn agent() -> String {
    format!("locvault/{}", env!("CARGO_PKG_VERSION"))
}

/// Values must stay on one line
fn fold(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_float(field: &'static str, value: &str) -> Result<f64, FormatError> {
    value.parse().map_err(|_| FormatError::InvalidValue {
        field,
        value: value.to_string(),
    })
}

fn parse_time(field: &'static str, value: &str) -> Result<DateTime<Utc>, FormatError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FormatError::InvalidValue {
            field,
            value: value.to_string(),
        })
}
