//! Drop-folder watcher.
//!
//! Watches a directory and submits files to a location as import batches
//! once their size has been stable for the configured delay (so half-copied
//! files are never imported). Re-submitting a file is harmless: the
//! deduplicator skips content the location already holds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scan::SourceScanner;
use crate::core::EventSink;
use crate::domain::{ImportBatch, LocationId};
use crate::jobs::SchedulerHandle;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler unavailable: {0}")]
    Scheduler(#[from] crate::jobs::SchedulerError),
}

/// Configuration for the watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directory to watch
    pub watch_path: PathBuf,

    /// Location the files are imported into
    pub location_id: LocationId,

    /// How long a file must be stable before import (seconds)
    pub stability_delay_secs: u64,

    /// Also watch subdirectories
    pub recursive: bool,
}

impl WatcherConfig {
    pub fn new(watch_path: PathBuf, location_id: LocationId) -> Self {
        Self {
            watch_path,
            location_id,
            stability_delay_secs: 5,
            recursive: true,
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.watch_path.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.watch_path.clone()));
        }
        Ok(())
    }
}

/// A batch the watcher handed to the scheduler
#[derive(Debug, Clone)]
pub struct SubmittedDrop {
    pub batch_id: Uuid,
    pub files: Vec<PathBuf>,
}

/// Watches a drop folder and feeds the scheduler
pub struct DropFolderWatcher {
    config: WatcherConfig,
    scanner: SourceScanner,
    scheduler: SchedulerHandle,
    sink: EventSink,
}

impl DropFolderWatcher {
    pub fn new(config: WatcherConfig, scheduler: SchedulerHandle, sink: EventSink) -> Self {
        Self {
            config,
            scanner: SourceScanner::default(),
            scheduler,
            sink,
        }
    }

    pub fn with_scanner(mut self, scanner: SourceScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Get the current configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Submit whatever is already in the folder as one batch
    pub async fn scan_once(&self) -> Result<Option<SubmittedDrop>, WatcherError> {
        self.config.validate()?;
        let files = self.scanner.expand(&[self.config.watch_path.clone()]);
        if files.is_empty() {
            return Ok(None);
        }
        let submitted = submit(&self.scheduler, &self.sink, &self.config.location_id, files).await?;
        Ok(Some(submitted))
    }

    /// Watch the directory until stopped via the returned handle
    pub fn watch(&self) -> Result<(mpsc::Receiver<SubmittedDrop>, WatchHandle), WatcherError> {
        self.config.validate()?;

        let (drop_tx, drop_rx) = mpsc::channel::<SubmittedDrop>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let config = self.config.clone();
        let scanner = self.scanner.clone();
        let scheduler = self.scheduler.clone();
        let sink = self.sink.clone();

        let task = tokio::spawn(async move {
            if let Err(e) = run_watcher(config, scanner, scheduler, sink, drop_tx, stop_rx).await {
                error!(error = %e, "Watcher error");
            }
        });

        Ok((drop_rx, WatchHandle { stop_tx, task }))
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        self.task.await?;
        Ok(())
    }
}

async fn submit(
    scheduler: &SchedulerHandle,
    sink: &EventSink,
    location_id: &LocationId,
    files: Vec<PathBuf>,
) -> Result<SubmittedDrop, WatcherError> {
    let batch = ImportBatch::new(location_id.clone(), files.clone());
    let batch_id = batch.id;
    // Completion is observed through the event sink
    let _summary = scheduler.submit_import(batch, sink.clone()).await?;
    info!(%batch_id, files = files.len(), "Drop folder batch submitted");
    Ok(SubmittedDrop { batch_id, files })
}

/// Files waiting for their size to settle
#[derive(Default)]
struct Stabilizer {
    pending: HashMap<PathBuf, (u64, Instant)>,
}

impl Stabilizer {
    fn observe(&mut self, path: PathBuf) {
        if let Ok(metadata) = std::fs::metadata(&path) {
            if metadata.is_file() {
                self.pending.insert(path, (metadata.len(), Instant::now()));
            }
        }
    }

    /// Files unchanged for `delay`, sorted; files that changed restart their clock
    fn take_stable(&mut self, delay: Duration) -> Vec<PathBuf> {
        let now = Instant::now();
        let mut stable = Vec::new();

        self.pending.retain(|path, (last_size, last_seen)| {
            if now.duration_since(*last_seen) < delay {
                return true;
            }
            match std::fs::metadata(path) {
                Ok(metadata) if metadata.len() == *last_size => {
                    stable.push(path.clone());
                    false
                }
                Ok(metadata) => {
                    *last_size = metadata.len();
                    *last_seen = now;
                    true
                }
                // Gone before it settled
                Err(_) => false,
            }
        });

        stable.sort();
        stable
    }
}

fn is_candidate(scanner: &SourceScanner, root: &Path, path: &Path) -> bool {
    // Every component below the watch root must pass the filter
    path.strip_prefix(root)
        .map(|rel| {
            rel.components()
                .all(|c| !scanner.is_skipped(&c.as_os_str().to_string_lossy()))
        })
        .unwrap_or(false)
}

/// Internal watcher loop
async fn run_watcher(
    config: WatcherConfig,
    scanner: SourceScanner,
    scheduler: SchedulerHandle,
    sink: EventSink,
    drop_tx: mpsc::Sender<SubmittedDrop>,
    mut stop_rx: mpsc::Receiver<()>,
) -> Result<(), WatcherError> {
    let mut stabilizer = Stabilizer::default();

    // Debouncer thread → async loop
    let (tx, mut rx) = mpsc::channel::<DebounceEventResult>(256);
    let mut debouncer = new_debouncer(Duration::from_secs(2), move |result: DebounceEventResult| {
        let _ = tx.blocking_send(result);
    })?;

    let mode = if config.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    debouncer.watcher().watch(&config.watch_path, mode)?;

    let stability_delay = Duration::from_secs(config.stability_delay_secs);
    let mut check = tokio::time::interval(Duration::from_millis(500));

    info!(path = %config.watch_path.display(), location = %config.location_id, "Watching drop folder");

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("Watcher stopping...");
                break;
            }
            received = rx.recv() => match received {
                Some(Ok(events)) => {
                    for event in events {
                        if is_candidate(&scanner, &config.watch_path, &event.path) {
                            stabilizer.observe(event.path);
                        }
                    }
                }
                Some(Err(e)) => warn!(error = ?e, "Watcher error"),
                None => {
                    error!("Watcher channel disconnected");
                    break;
                }
            },
            _ = check.tick() => {
                let stable = stabilizer.take_stable(stability_delay);
                if stable.is_empty() {
                    continue;
                }
                debug!(files = stable.len(), "Files settled");
                match submit(&scheduler, &sink, &config.location_id, stable).await {
                    Ok(submitted) => {
                        let _ = drop_tx.send(submitted).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Could not submit drop folder batch");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let temp = TempDir::new().unwrap();
        let id = LocationId::derive("Mill", None);
        assert!(WatcherConfig::new(temp.path().to_path_buf(), id.clone())
            .validate()
            .is_ok());
        assert!(matches!(
            WatcherConfig::new(temp.path().join("missing"), id).validate(),
            Err(WatcherError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn test_stabilizer_waits_for_settled_size() {
        let temp = TempDir::new().unwrap();
        let growing = temp.path().join("growing.jpg");
        let settled = temp.path().join("settled.jpg");
        std::fs::write(&growing, b"ab").unwrap();
        std::fs::write(&settled, b"abc").unwrap();

        let mut stabilizer = Stabilizer::default();
        stabilizer.observe(growing.clone());
        stabilizer.observe(settled.clone());

        // Not yet past the delay
        assert!(stabilizer.take_stable(Duration::from_secs(60)).is_empty());

        std::fs::write(&growing, b"abcdef").unwrap();
        let stable = stabilizer.take_stable(Duration::ZERO);
        assert_eq!(stable, vec![settled]);

        // Growing file restarted its clock with the new size
        let stable = stabilizer.take_stable(Duration::ZERO);
        assert_eq!(stable, vec![growing]);
    }

    #[test]
    fn test_stabilizer_releases_empty_files() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("placeholder.txt");
        std::fs::write(&empty, b"").unwrap();

        let mut stabilizer = Stabilizer::default();
        stabilizer.observe(empty.clone());

        assert_eq!(stabilizer.take_stable(Duration::ZERO), vec![empty]);
        assert!(stabilizer.pending.is_empty());
    }

    #[test]
    fn test_candidates_skip_hidden_and_denylisted() {
        let scanner = SourceScanner::default();
        let root = Path::new("/drop");
        assert!(is_candidate(&scanner, root, Path::new("/drop/a.jpg")));
        assert!(is_candidate(&scanner, root, Path::new("/drop/trip/a.jpg")));
        assert!(!is_candidate(&scanner, root, Path::new("/drop/.DS_Store")));
        assert!(!is_candidate(&scanner, root, Path::new("/drop/.partial/a.jpg")));
        assert!(!is_candidate(&scanner, root, Path::new("/drop/a.jpg.tmp")));
        assert!(!is_candidate(&scanner, root, Path::new("/elsewhere/a.jpg")));
    }
}
