//! Self-describing location packages.
//!
//! Every location folder carries a small metadata directory that makes it
//! verifiable without the catalog:
//!
//! ```text
//! <location-root>/
//! ├── image/ab/ab12….jpg                  # payload
//! └── _package/
//!     ├── bagit-version.txt               # version declaration
//!     ├── package-info.txt                # descriptive metadata
//!     ├── manifest-checksums.txt          # "<digest>  <path>" per payload file
//!     └── tagmanifest-checksums.txt       # checksums of the three files above
//! ```
//!
//! [`ManifestGenerator`] is the only writer of these files and
//! [`IntegrityValidator`] reads them back.

pub mod format;
pub mod manifest;
pub mod validator;

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::core::writer::WriteError;

pub use format::{ChecksumEntry, FormatError, PackageInfo, PayloadOxum};
pub use manifest::ManifestGenerator;
pub use validator::IntegrityValidator;

/// Metadata directory inside a location root
pub const PACKAGE_DIR: &str = "_package";

pub const VERSION_FILE: &str = "bagit-version.txt";
pub const INFO_FILE: &str = "package-info.txt";
pub const MANIFEST_FILE: &str = "manifest-checksums.txt";
pub const TAGMANIFEST_FILE: &str = "tagmanifest-checksums.txt";

/// Files covered by the tag manifest, in listing order
pub const TAG_FILES: [&str; 3] = [VERSION_FILE, INFO_FILE, MANIFEST_FILE];

/// Path of a package file relative to the location root
pub fn tag_path(file: &str) -> String {
    format!("{}/{}", PACKAGE_DIR, file)
}

/// Errors that can occur reading or writing package files
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write package file: {0}")]
    Write(#[from] WriteError),

    #[error("Malformed {file}: {source}")]
    Format {
        file: String,
        #[source]
        source: FormatError,
    },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Payload summary out of date ({listed} files listed, recorded {recorded:?})")]
    StaleSummary {
        recorded: Option<PayloadOxum>,
        listed: usize,
    },
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ManifestError::Io {
            path: path.into(),
            source,
        }
    }
}
