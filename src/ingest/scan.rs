//! Expansion of import sources into an ordered file list.
//!
//! Directories are walked recursively in sorted order. Hidden entries and
//! names matching the denylist are skipped while walking. Explicitly named
//! files are always kept, even if missing, so a bad path surfaces as a
//! per-file `UnreadableSource` failure instead of silently vanishing.

use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, warn};

/// Default patterns for OS clutter that never belongs in an archive
pub fn default_denylist() -> Vec<String> {
    vec![
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "desktop.ini".to_string(),
        "*.tmp".to_string(),
    ]
}

/// Turns user-supplied sources into the files of a batch
#[derive(Debug, Clone)]
pub struct SourceScanner {
    denylist: Vec<Pattern>,
}

impl Default for SourceScanner {
    fn default() -> Self {
        Self::new(&default_denylist())
    }
}

impl SourceScanner {
    /// Build from glob patterns; invalid patterns are logged and ignored
    pub fn new(patterns: &[String]) -> Self {
        let denylist = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid denylist pattern");
                    None
                }
            })
            .collect();
        Self { denylist }
    }

    /// Whether a file name is skipped during directory walks
    pub fn is_skipped(&self, name: &str) -> bool {
        name.starts_with('.') || self.denylist.iter().any(|p| p.matches(name))
    }

    /// Expand sources in submission order
    pub fn expand(&self, sources: &[PathBuf]) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for source in sources {
            if source.is_dir() {
                let before = files.len();
                self.walk(source, &mut files);
                debug!(dir = %source.display(), files = files.len() - before, "Expanded directory");
            } else {
                files.push(source.clone());
            }
        }
        files
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) {
        let mut entries: Vec<_> = match fs::read_dir(dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
            Err(e) => {
                // Surface the directory itself as an unreadable source
                warn!(dir = %dir.display(), error = %e, "Cannot read directory");
                out.push(dir.to_path_buf());
                return;
            }
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.is_skipped(&name) {
                continue;
            }
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => self.walk(&path, out),
                Ok(t) if t.is_file() => out.push(path),
                // Symlinks are followed only if they point at a file
                Ok(_) if path.is_file() => out.push(path),
                _ => {}
            }
        }
    }
}
