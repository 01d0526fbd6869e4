//! Integrity check results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::location::LocationId;
use super::media::ContentDigest;

/// Integrity status of a location package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Full check passed
    Valid,

    /// Quick check passed, full check not run
    Complete,

    /// A listed payload file is missing or unreadable
    Incomplete,

    /// A payload digest mismatched, or the manifest layer is corrupt
    Invalid,

    /// No manifest exists yet
    Absent,
}

impl IntegrityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityStatus::Valid => "valid",
            IntegrityStatus::Complete => "complete",
            IntegrityStatus::Incomplete => "incomplete",
            IntegrityStatus::Invalid => "invalid",
            IntegrityStatus::Absent => "absent",
        }
    }
}

impl std::fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Depth of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckLevel {
    /// Size and count against the recorded summary
    Quick,

    /// Every payload digest recomputed
    Full,
}

/// A single problem found during a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Listed payload file is absent
    MissingPayload { path: String },

    /// Payload file present but its digest differs
    DigestMismatch {
        path: String,
        expected: ContentDigest,
        actual: ContentDigest,
    },

    /// Payload file present but could not be opened or read
    Unreadable { path: String, error: String },

    /// A package metadata file does not match the tag manifest
    ManifestCorrupt { file: String, detail: String },

    /// Payload file on disk not listed in the manifest
    Unlisted { path: String },

    /// Quick-check summary disagreed with the filesystem
    SummaryMismatch {
        expected_bytes: u64,
        expected_files: u64,
        actual_bytes: u64,
        actual_files: u64,
    },
}

impl IntegrityIssue {
    /// Manifest corruption undermines every other finding
    pub fn is_manifest_corrupt(&self) -> bool {
        matches!(self, IntegrityIssue::ManifestCorrupt { .. })
    }
}

/// Outcome of validating one location at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub location_id: LocationId,
    pub status: IntegrityStatus,
    pub level: CheckLevel,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub issues: Vec<IntegrityIssue>,
    pub files_checked: u64,
    pub bytes_checked: u64,
}

impl IntegrityCheckResult {
    /// Create a result with no findings
    pub fn new(location_id: LocationId, status: IntegrityStatus, level: CheckLevel) -> Self {
        Self {
            location_id,
            status,
            level,
            checked_at: Utc::now(),
            issues: Vec::new(),
            files_checked: 0,
            bytes_checked: 0,
        }
    }

    /// Whether the manifest layer itself failed verification
    pub fn manifest_corrupt(&self) -> bool {
        self.issues.iter().any(IntegrityIssue::is_manifest_corrupt)
    }

    /// Paths flagged with a digest mismatch
    pub fn mismatched_paths(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter_map(|i| match i {
                IntegrityIssue::DigestMismatch { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Paths flagged as missing
    pub fn missing_paths(&self) -> Vec<&str> {
        self.issues
            .iter()
            .filter_map(|i| match i {
                IntegrityIssue::MissingPayload { path } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_column_matches_json() {
        for status in [
            IntegrityStatus::Valid,
            IntegrityStatus::Complete,
            IntegrityStatus::Incomplete,
            IntegrityStatus::Invalid,
            IntegrityStatus::Absent,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_issue_helpers() {
        let mut result = IntegrityCheckResult::new(
            LocationId::derive("Mill", None),
            IntegrityStatus::Incomplete,
            CheckLevel::Full,
        );
        result.issues.push(IntegrityIssue::MissingPayload {
            path: "image/ab/ab.jpg".to_string(),
        });

        assert_eq!(result.missing_paths(), vec!["image/ab/ab.jpg"]);
        assert!(result.mismatched_paths().is_empty());
        assert!(!result.manifest_corrupt());

        result.issues.push(IntegrityIssue::ManifestCorrupt {
            file: "_package/package-info.txt".to_string(),
            detail: "digest mismatch".to_string(),
        });
        assert!(result.manifest_corrupt());
    }
}
