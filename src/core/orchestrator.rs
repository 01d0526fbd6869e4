//! ImportOrchestrator: drives one import batch end to end.
//!
//! Scanning → Hashing → Placing → Cataloging, then a terminal summary.
//! A single file's failure never aborts the batch; it is recorded and the
//! batch carries on. Progress is published only after a file's catalog
//! step, so counts always match durable state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::dedup::{Deduplicator, ListedDigests, Placement};
use super::hasher::{ContentHasher, HashError, HashedFile};
use super::planner;
use super::writer::{AtomicWriter, WriteError};
use crate::catalog::{BatchLog, Catalog, CatalogError, RecordOutcome};
use crate::domain::{
    ArchiveEvent, BatchPhase, ContentDigest, BatchStatus, BatchSummary, EventKind, FileFailure, FileOutcome,
    ImportBatch, ImportErrorKind, Location, LocationId, MediaCategory, MediaRecord, SkipReason,
};
use crate::ingest::scan::SourceScanner;
use crate::package::manifest::read_manifest;
use crate::package::{ManifestError, ManifestGenerator, PayloadOxum};

/// Errors that prevent a batch from running at all
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Location not found: {0}")]
    LocationNotFound(LocationId),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation: checked between files, awaited while hashing
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            // Registered before the flag check so a cancel in between is not lost
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Where batch events go: the caller's progress stream and/or the shared bus
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    stream: Option<mpsc::Sender<ArchiveEvent>>,
    bus: Option<broadcast::Sender<ArchiveEvent>>,
}

impl EventSink {
    pub fn new(
        stream: Option<mpsc::Sender<ArchiveEvent>>,
        bus: Option<broadcast::Sender<ArchiveEvent>>,
    ) -> Self {
        Self { stream, bus }
    }

    /// Publish an event. Observers going away never affects the batch.
    pub async fn emit(&self, kind: EventKind) {
        let event = ArchiveEvent::new(kind);
        if let Some(bus) = &self.bus {
            // No subscribers is fine
            let _ = bus.send(event.clone());
        }
        if let Some(stream) = &self.stream {
            if stream.send(event).await.is_err() {
                debug!("Progress stream receiver dropped");
            }
        }
    }
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct ImportSettings {
    /// Upper bound on hashing or copying one file
    pub copy_timeout: Duration,

    /// Files hashed concurrently
    pub hash_concurrency: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            copy_timeout: Duration::from_secs(300),
            hash_concurrency: 4,
        }
    }
}

/// Sequences import batches
#[derive(Clone)]
pub struct ImportOrchestrator {
    catalog: Arc<dyn Catalog>,
    dedup: Deduplicator,
    writer: AtomicWriter,
    manifests: ManifestGenerator,
    scanner: SourceScanner,
    batch_log: Option<BatchLog>,
    hash_concurrency: usize,
    file_timeout: Duration,
}

impl ImportOrchestrator {
    pub fn new(catalog: Arc<dyn Catalog>, manifests: ManifestGenerator) -> Self {
        let settings = ImportSettings::default();
        Self {
            dedup: Deduplicator::with_catalog(catalog.clone()),
            catalog,
            writer: AtomicWriter::new().with_timeout(settings.copy_timeout),
            manifests,
            scanner: SourceScanner::default(),
            batch_log: None,
            hash_concurrency: settings.hash_concurrency,
            file_timeout: settings.copy_timeout,
        }
    }

    pub fn with_settings(mut self, settings: &ImportSettings) -> Self {
        self.writer = AtomicWriter::new().with_timeout(settings.copy_timeout);
        self.hash_concurrency = settings.hash_concurrency.max(1);
        self.file_timeout = settings.copy_timeout;
        self
    }

    pub fn with_deduplicator(mut self, dedup: Deduplicator) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_scanner(mut self, scanner: SourceScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_batch_log(mut self, log: BatchLog) -> Self {
        self.batch_log = Some(log);
        self
    }

    /// Run a batch to its terminal status.
    ///
    /// Returns `Err` only when the batch cannot start (unknown location or
    /// catalog unavailable); per-file problems end up in the summary.
    #[instrument(skip(self, batch, sink, cancel), fields(batch_id = %batch.id, location = %batch.location_id))]
    pub async fn run(
        &self,
        batch: &ImportBatch,
        sink: &EventSink,
        cancel: &CancelToken,
    ) -> Result<BatchSummary, ImportError> {
        let started_at = Utc::now();
        let location = self
            .catalog
            .get_location(&batch.location_id)
            .await?
            .ok_or_else(|| ImportError::LocationNotFound(batch.location_id.clone()))?;

        let mut warnings = Vec::new();
        let listed = self.ensure_package(&location, &mut warnings).await;

        // Scanning
        self.progress(sink, batch, BatchPhase::Scanning, 0, batch.sources.len())
            .await;
        let scanner = self.scanner.clone();
        let sources = batch.sources.clone();
        let files = tokio::task::spawn_blocking(move || scanner.expand(&sources))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Scan task failed");
                Vec::new()
            });
        let total = files.len();
        info!(total, "Batch started");

        // Hashing
        self.progress(sink, batch, BatchPhase::Hashing, 0, total).await;
        let hashes = self.hash_all(&files, cancel).await;

        // Placing + Cataloging, in submission order
        let mut outcomes = Vec::with_capacity(total);
        let mut to_list = Vec::new();
        let mut readable = 0;
        let mut cancelled = false;

        for (index, (path, hashed)) in files.iter().zip(hashes).enumerate() {
            if !cancelled && cancel.is_cancelled() {
                info!(remaining = total - index, "Batch cancelled");
                cancelled = true;
            }

            let outcome = match hashed {
                Some(Ok(hashed)) if !cancelled => {
                    readable += 1;
                    let (outcome, unlisted) = self
                        .place_one(&location, &listed, batch, sink, path, hashed, index, total)
                        .await;
                    to_list.extend(unlisted);
                    outcome
                }
                Some(Err(e)) if !cancelled => failure(path, hash_error_kind(&e), e.to_string()),
                // Cancelled batch, or hashing interrupted by the cancel
                _ => failure(path, ImportErrorKind::Cancelled, "batch cancelled"),
            };

            match &outcome {
                FileOutcome::Placed { .. } => {}
                FileOutcome::Skipped { digest, reason, .. } => {
                    debug!(path = %path.display(), digest = %digest.short(), ?reason, "Skipped")
                }
                FileOutcome::Failed(f) if f.kind != ImportErrorKind::Cancelled => {
                    warn!(path = %path.display(), kind = %f.kind, error = %f.message, "File failed")
                }
                FileOutcome::Failed(_) => {}
            }

            sink.emit(EventKind::FileComplete {
                batch_id: batch.id,
                location_id: location.id.clone(),
                index,
                outcome: outcome.clone(),
            })
            .await;
            self.progress(sink, batch, BatchPhase::Cataloging, index + 1, total)
                .await;
            outcomes.push(outcome);
        }

        if !to_list.is_empty() {
            self.update_manifest(&location, &to_list, &mut warnings).await;
        }

        let summary = summarize(batch, outcomes, readable, cancelled, warnings, started_at);
        info!(
            status = %summary.status,
            placed = summary.placed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Batch finished"
        );

        if let Some(log) = &self.batch_log {
            if let Err(e) = log.append(&summary).await {
                warn!(error = %e, "Failed to append batch log");
            }
        }

        sink.emit(EventKind::BatchComplete(summary.clone())).await;
        Ok(summary)
    }

    /// Dedupe, place and catalog one hashed file.
    ///
    /// Also returns the record the payload listing must gain, if any: the
    /// new placement, or a cataloged file the listing lost.
    #[allow(clippy::too_many_arguments)]
    async fn place_one(
        &self,
        location: &Location,
        listed: &ListedDigests,
        batch: &ImportBatch,
        sink: &EventSink,
        path: &Path,
        hashed: HashedFile,
        index: usize,
        total: usize,
    ) -> (FileOutcome, Option<MediaRecord>) {
        let HashedFile { digest, size } = hashed;
        let skipped = |digest: ContentDigest, reason| FileOutcome::Skipped {
            path: path.to_path_buf(),
            digest,
            reason,
        };

        let reservation = match self.dedup.should_place(location, &digest, listed).await {
            Ok(Placement::Reserved(r)) => r,
            Ok(Placement::Cataloged(record)) => {
                let unlisted = (!listed.contains(&record.digest)).then(|| {
                    info!(path = %record.relative_path, "Relisting cataloged file");
                    record
                });
                return (skipped(digest, SkipReason::AlreadyArchived), unlisted);
            }
            Ok(Placement::Listed { relative_path }) => {
                let outcome = match self.backfill(location, path, &digest, size, relative_path).await {
                    Ok(()) => skipped(digest, SkipReason::AlreadyArchived),
                    Err(e) => failure(path, ImportErrorKind::CatalogFailure, e.to_string()),
                };
                return (outcome, None);
            }
            Ok(Placement::InFlight) => return (skipped(digest, SkipReason::InFlight), None),
            Err(e) => {
                return (
                    failure(path, ImportErrorKind::CatalogFailure, e.to_string()),
                    None,
                )
            }
        };

        self.progress(sink, batch, BatchPhase::Placing, index, total)
            .await;

        let category = MediaCategory::from_path(path);
        let relative_path = planner::plan(
            &location.id,
            category,
            &digest,
            planner::source_extension(path),
        );
        let dest = planner::resolve(&location.root, &relative_path);

        let placed = match self
            .writer
            .place_async(path.to_path_buf(), dest, Some(digest.clone()))
            .await
        {
            Ok(placed) => placed,
            Err(e) => return (failure(path, write_error_kind(&e), e.to_string()), None),
        };

        let record = MediaRecord {
            location_id: location.id.clone(),
            digest,
            original_name: original_name(path),
            size: placed.size,
            category,
            relative_path,
            imported_at: Utc::now(),
        };

        let result = match self.catalog.record_media(&record).await {
            Ok(RecordOutcome::Inserted) => (
                FileOutcome::Placed {
                    path: path.to_path_buf(),
                    record: record.clone(),
                },
                Some(record),
            ),
            Ok(RecordOutcome::Duplicate) => (skipped(record.digest, SkipReason::AlreadyArchived), None),
            Err(e) => (failure(path, ImportErrorKind::CatalogFailure, e.to_string()), None),
        };

        // Released only once the row is durable
        drop(reservation);
        result
    }

    /// Restore the catalog row of a file the package already lists
    async fn backfill(
        &self,
        location: &Location,
        source: &Path,
        digest: &ContentDigest,
        size: u64,
        relative_path: String,
    ) -> Result<(), CatalogError> {
        let category = relative_path
            .split('/')
            .next()
            .and_then(|dir| dir.parse::<MediaCategory>().ok())
            .unwrap_or_else(|| MediaCategory::from_path(source));

        let record = MediaRecord {
            location_id: location.id.clone(),
            digest: digest.clone(),
            original_name: original_name(source),
            size,
            category,
            relative_path,
            imported_at: Utc::now(),
        };
        self.catalog.record_media(&record).await?;

        info!(path = %record.relative_path, "Catalog row restored from package listing");
        Ok(())
    }

    /// Hash every file, bounded concurrency, results in input order.
    ///
    /// Each file gets the per-file time limit. Files still waiting or
    /// hashing when the batch is cancelled come back as `None`.
    async fn hash_all(
        &self,
        files: &[PathBuf],
        cancel: &CancelToken,
    ) -> Vec<Option<Result<HashedFile, HashError>>> {
        let semaphore = Arc::new(Semaphore::new(self.hash_concurrency.max(1)));
        let limit = self.file_timeout;
        let mut set = JoinSet::new();

        for (index, path) in files.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let work = async {
                    let _permit = semaphore.acquire_owned().await;
                    tokio::time::timeout(limit, ContentHasher::digest_file(&path)).await
                };
                let hashed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    timed = work => Some(timed.unwrap_or_else(|_| Err(HashError::TimedOut {
                        path: path.clone(),
                        limit,
                    }))),
                };
                (index, hashed)
            });
        }

        let mut results: Vec<Option<Option<Result<HashedFile, HashError>>>> =
            (0..files.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "Hash task failed"),
            }
        }

        results
            .into_iter()
            .zip(files)
            .map(|(r, path)| {
                r.unwrap_or_else(|| {
                    Some(Err(HashError::Read {
                        path: path.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, "hash task aborted"),
                    }))
                })
            })
            .collect()
    }

    /// First import into a location creates its package. Returns what the
    /// package already lists, read once for the whole batch.
    async fn ensure_package(&self, location: &Location, warnings: &mut Vec<String>) -> ListedDigests {
        match read_manifest(location).await {
            Ok(Some(entries)) => {
                let listed = ListedDigests::from_entries(entries);
                debug!(listed = listed.len(), "Package listing loaded");
                listed
            }
            Ok(None) => {
                if let Err(e) = self.manifests.initialize(location).await {
                    warn!(error = %e, "Failed to initialize package");
                    warnings.push(format!("package initialization failed: {}", e));
                }
                ListedDigests::default()
            }
            // Corrupt listing: leave it for validation to report
            Err(e) => {
                warn!(error = %e, "Existing manifest unreadable");
                warnings.push(format!("existing manifest unreadable: {}", e));
                ListedDigests::default()
            }
        }
    }

    /// Retried once; a second failure becomes a batch warning.
    ///
    /// A listing whose recorded summary no longer matches is rebuilt from
    /// the catalog instead of being extended.
    async fn update_manifest(
        &self,
        location: &Location,
        records: &[MediaRecord],
        warnings: &mut Vec<String>,
    ) {
        let mut result = self.manifests.add_payload_entries(location, records).await;
        if let Err(first) = &result {
            let stale = matches!(first, ManifestError::StaleSummary { .. });
            warn!(error = %first, stale, "Manifest update failed, retrying");
            result = if stale {
                self.rebuild_manifest(location).await
            } else {
                self.manifests.add_payload_entries(location, records).await
            };
            if stale && result.is_ok() {
                warnings.push("package summary was out of date; package rebuilt from catalog".to_string());
            }
        }

        if let Err(e) = result {
            warn!(error = %e, "Manifest update failed again");
            warnings.push(format!("manifest update failed: {}", e));
        }
    }

    async fn rebuild_manifest(&self, location: &Location) -> Result<PayloadOxum, ManifestError> {
        let records = self.catalog.list_media(&location.id).await?;
        self.manifests.regenerate(location, &records).await
    }

    async fn progress(
        &self,
        sink: &EventSink,
        batch: &ImportBatch,
        phase: BatchPhase,
        processed: usize,
        total: usize,
    ) {
        sink.emit(EventKind::ImportProgress {
            batch_id: batch.id,
            location_id: batch.location_id.clone(),
            phase,
            processed,
            total,
        })
        .await;
    }
}

fn failure(path: &Path, kind: ImportErrorKind, message: impl Into<String>) -> FileOutcome {
    FileOutcome::Failed(FileFailure {
        path: path.to_path_buf(),
        kind,
        message: message.into(),
    })
}

fn original_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn hash_error_kind(error: &HashError) -> ImportErrorKind {
    match error {
        HashError::TimedOut { .. } => ImportErrorKind::Timeout,
        HashError::Open { .. } | HashError::Read { .. } => ImportErrorKind::UnreadableSource,
    }
}

fn write_error_kind(error: &WriteError) -> ImportErrorKind {
    match error {
        WriteError::SourceUnreadable { .. } => ImportErrorKind::UnreadableSource,
        WriteError::DigestMismatch { .. } => ImportErrorKind::DigestMismatch,
        WriteError::TimedOut { .. } => ImportErrorKind::Timeout,
        WriteError::InsufficientSpace { .. }
        | WriteError::Io { .. }
        | WriteError::NoParent(_)
        | WriteError::Join(_) => ImportErrorKind::WriteFailure,
    }
}

fn summarize(
    batch: &ImportBatch,
    outcomes: Vec<FileOutcome>,
    readable: usize,
    cancelled: bool,
    warnings: Vec<String>,
    started_at: chrono::DateTime<Utc>,
) -> BatchSummary {
    let total = outcomes.len();
    let mut placed = 0;
    let mut skipped = 0;
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            FileOutcome::Placed { .. } => placed += 1,
            FileOutcome::Skipped { .. } => skipped += 1,
            FileOutcome::Failed(f) => failures.push(f),
        }
    }

    let status: BatchStatus =
        BatchSummary::status_for(total, readable, failures.len(), cancelled, placed + skipped);

    BatchSummary {
        batch_id: batch.id,
        location_id: batch.location_id.clone(),
        status,
        total,
        placed,
        skipped,
        failed: failures.len(),
        failures,
        warnings,
        started_at,
        completed_at: Utc::now(),
    }
}
