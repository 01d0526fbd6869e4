//! Vault: the application-facing service.
//!
//! Wires the catalog, import pipeline, package files, validator and
//! scheduler together. Everything here returns `anyhow::Result`; the
//! typed errors of the inner modules become context-rich messages.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{BatchLog, Catalog, SqliteCatalog};
use crate::config::ResolvedConfig;
use crate::core::{CancelToken, EventSink, ImportOrchestrator, ImportSettings};
use crate::domain::{
    ArchiveEvent, BatchSummary, CheckLevel, ContentDigest, EventKind, ImportBatch,
    IntegrityCheckResult, Location, LocationId, MediaRecord,
};
use crate::ingest::{DropFolderWatcher, SourceScanner, WatcherConfig};
use crate::jobs::{
    due_locations, JobContext, JobScheduler, SchedulerError, SchedulerHandle, SchedulerSettings,
};
use crate::package::{IntegrityValidator, ManifestError, ManifestGenerator, PayloadOxum};

/// Buffered events per import stream
const STREAM_CAPACITY: usize = 256;

/// Buffered events on the shared bus
const BUS_CAPACITY: usize = 1024;

/// Events of one import batch, ending with `import.batchComplete`
pub struct ProgressStream {
    batch_id: Uuid,
    events: mpsc::Receiver<ArchiveEvent>,
    task: JoinHandle<Result<BatchSummary>>,
}

impl ProgressStream {
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    /// Next event, or `None` once the batch has finished
    pub async fn next(&mut self) -> Option<ArchiveEvent> {
        self.events.recv().await
    }

    /// Wait for the batch summary, discarding events not yet read
    pub async fn finish(self) -> Result<BatchSummary> {
        drop(self.events);
        self.task.await.context("Import task panicked")?
    }
}

/// Archive service
pub struct Vault {
    catalog: Arc<dyn Catalog>,
    archive_root: PathBuf,
    orchestrator: ImportOrchestrator,
    manifests: ManifestGenerator,
    validator: IntegrityValidator,
    scanner: SourceScanner,
    batch_log: Option<BatchLog>,
    validation_interval: Duration,
    bus: broadcast::Sender<ArchiveEvent>,
    scheduler: Option<SchedulerHandle>,
    cancels: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
}

impl Vault {
    /// Vault over an existing catalog with default settings
    pub fn new(catalog: Arc<dyn Catalog>, archive_root: PathBuf) -> Self {
        let manifests = ManifestGenerator::default();
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            orchestrator: ImportOrchestrator::new(catalog.clone(), manifests.clone()),
            validator: IntegrityValidator::new(catalog.clone(), manifests.locks().clone()),
            catalog,
            archive_root,
            manifests,
            scanner: SourceScanner::default(),
            batch_log: None,
            validation_interval: SchedulerSettings::default().validation_interval,
            bus,
            scheduler: None,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the vault described by a resolved config
    pub fn open(config: &ResolvedConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.home)
            .with_context(|| format!("Failed to create home: {}", config.home.display()))?;
        std::fs::create_dir_all(&config.archive)
            .with_context(|| format!("Failed to create archive: {}", config.archive.display()))?;

        let catalog_path = config.catalog_path();
        let catalog = SqliteCatalog::open(&catalog_path)
            .with_context(|| format!("Failed to open catalog: {}", catalog_path.display()))?;

        let vault = Self::new(Arc::new(catalog), config.archive.clone())
            .with_import_settings(&config.import_settings())
            .with_scanner(SourceScanner::new(&config.import.denylist))
            .with_batch_log(BatchLog::new(config.batch_log_path()))
            .with_validation_interval(config.validation_interval());

        debug!(archive = %config.archive.display(), "Vault opened");
        Ok(vault)
    }

    pub fn with_import_settings(mut self, settings: &ImportSettings) -> Self {
        self.orchestrator = self.orchestrator.with_settings(settings);
        self
    }

    pub fn with_scanner(mut self, scanner: SourceScanner) -> Self {
        self.orchestrator = self.orchestrator.with_scanner(scanner.clone());
        self.scanner = scanner;
        self
    }

    pub fn with_batch_log(mut self, log: BatchLog) -> Self {
        self.orchestrator = self.orchestrator.with_batch_log(log.clone());
        self.batch_log = Some(log);
        self
    }

    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Receive every event the vault emits
    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.bus.subscribe()
    }

    // ---------------------------------------------------------------
    // Locations
    // ---------------------------------------------------------------

    /// Register a location and create its package files
    pub async fn add_location(&self, location: Location) -> Result<Location> {
        self.catalog
            .insert_location(&location)
            .await
            .with_context(|| format!("Failed to register location '{}'", location.name))?;
        self.manifests
            .initialize(&location)
            .await
            .with_context(|| format!("Failed to create package for {}", location.id))?;

        info!(location = %location.id, name = %location.name, "Location added");
        Ok(location)
    }

    /// Change descriptive fields and rewrite package-info
    pub async fn update_location(&self, location: &Location) -> Result<()> {
        self.catalog
            .update_location(location)
            .await
            .with_context(|| format!("Failed to update location {}", location.id))?;
        match self.manifests.update_descriptive_metadata(location).await {
            Ok(()) => Ok(()),
            Err(ManifestError::StaleSummary { .. }) => {
                warn!(location = %location.id, "Package summary out of date, regenerating");
                self.regenerate_manifest(&location.id).await.map(|_| ())
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to update package info for {}", location.id)),
        }
    }

    pub async fn location(&self, id: &LocationId) -> Result<Location> {
        self.catalog
            .get_location(id)
            .await?
            .with_context(|| format!("Location not found: {}", id))
    }

    pub async fn locations(&self) -> Result<Vec<Location>> {
        Ok(self.catalog.list_locations().await?)
    }

    pub async fn media(&self, id: &LocationId) -> Result<Vec<MediaRecord>> {
        Ok(self.catalog.list_media(id).await?)
    }

    // ---------------------------------------------------------------
    // Import
    // ---------------------------------------------------------------

    /// Start importing files into a location.
    ///
    /// Runs on the scheduler when one is attached, otherwise on its own task.
    pub async fn import_files(&self, location_id: &LocationId, paths: Vec<PathBuf>) -> Result<ProgressStream> {
        // Fail fast instead of through the stream
        self.location(location_id).await?;

        let batch = ImportBatch::new(location_id.clone(), paths);
        let batch_id = batch.id;
        let (tx, events) = mpsc::channel(STREAM_CAPACITY);
        let sink = EventSink::new(Some(tx), Some(self.bus.clone()));

        let task = match &self.scheduler {
            Some(scheduler) => {
                let reply = scheduler.submit_import(batch, sink).await?;
                tokio::spawn(async move {
                    let summary = reply.await.map_err(|_| SchedulerError::Dropped)??;
                    Ok::<_, anyhow::Error>(summary)
                })
            }
            None => {
                let cancel = CancelToken::new();
                self.track(batch_id, cancel.clone());
                let orchestrator = self.orchestrator.clone();
                let cancels = self.cancels.clone();
                tokio::spawn(async move {
                    let result = orchestrator.run(&batch, &sink, &cancel).await;
                    if let Ok(mut map) = cancels.lock() {
                        map.remove(&batch.id);
                    }
                    Ok::<_, anyhow::Error>(result?)
                })
            }
        };

        info!(%batch_id, location = %location_id, "Import started");
        Ok(ProgressStream {
            batch_id,
            events,
            task,
        })
    }

    /// Cancel a running batch; files already placed stay placed
    pub async fn cancel(&self, batch_id: Uuid) -> Result<()> {
        if let Some(scheduler) = &self.scheduler {
            scheduler.cancel(batch_id).await?;
            return Ok(());
        }

        let token = self
            .cancels
            .lock()
            .ok()
            .and_then(|map| map.get(&batch_id).cloned());
        match token {
            Some(token) => token.cancel(),
            None => debug!(%batch_id, "Cancel for unknown or finished batch"),
        }
        Ok(())
    }

    fn track(&self, batch_id: Uuid, token: CancelToken) {
        if let Ok(mut map) = self.cancels.lock() {
            map.insert(batch_id, token);
        }
    }

    /// Most recent finished batches, newest first
    pub async fn recent_batches(&self, limit: usize) -> Result<Vec<BatchSummary>> {
        match &self.batch_log {
            Some(log) => Ok(log.recent(limit).await?),
            None => Ok(Vec::new()),
        }
    }

    /// A finished batch from the log
    pub async fn batch(&self, batch_id: Uuid) -> Result<Option<BatchSummary>> {
        match &self.batch_log {
            Some(log) => Ok(log.find(batch_id).await?),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------
    // Package maintenance
    // ---------------------------------------------------------------

    /// Rebuild all package files from the catalog
    pub async fn regenerate_manifest(&self, id: &LocationId) -> Result<PayloadOxum> {
        let location = self.location(id).await?;
        let records = self.catalog.list_media(id).await?;
        let oxum = self
            .manifests
            .regenerate(&location, &records)
            .await
            .with_context(|| format!("Failed to regenerate package for {}", id))?;

        info!(location = %id, oxum = %oxum, "Manifest regenerated");
        Ok(oxum)
    }

    /// Remove one payload file: catalog row, manifest entry, then the file
    pub async fn remove_media(&self, id: &LocationId, digest: &ContentDigest) -> Result<Option<MediaRecord>> {
        let location = self.location(id).await?;
        let Some(record) = self.catalog.remove_media(id, digest).await? else {
            return Ok(None);
        };

        match self
            .manifests
            .remove_payload_entries(&location, std::slice::from_ref(&record))
            .await
        {
            Ok(_) => {}
            Err(ManifestError::StaleSummary { .. }) => {
                warn!(location = %id, "Package summary out of date, regenerating");
                self.regenerate_manifest(id).await?;
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to update manifest for {}", id)),
        }

        let path = location.root.join(&record.relative_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Payload file already gone")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {}", path.display()))
            }
        }

        info!(location = %id, digest = %digest.short(), "Media removed");
        Ok(Some(record))
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    /// Check a location and record the result.
    ///
    /// With a scheduler attached the check is queued there, so it never
    /// runs alongside an import of the same location.
    pub async fn validate(&self, id: &LocationId, full: bool) -> Result<IntegrityCheckResult> {
        let level = if full { CheckLevel::Full } else { CheckLevel::Quick };

        if let Some(scheduler) = &self.scheduler {
            match scheduler.submit_validation(id.clone(), level).await {
                Ok(reply) => return Ok(reply.await.map_err(|_| SchedulerError::Dropped)??),
                Err(SchedulerError::Closed) => debug!("Scheduler stopped, validating inline"),
                Err(e) => return Err(e.into()),
            }
        }

        let location = self.location(id).await?;
        let result = self
            .validator
            .validate(&location, level)
            .await
            .with_context(|| format!("Validation of {} could not run", id))?;

        if self
            .bus
            .send(ArchiveEvent::new(EventKind::ValidationComplete(result.clone())))
            .is_err()
        {
            debug!("No event subscribers");
        }
        Ok(result)
    }

    /// Fully check every location whose last full check is overdue
    pub async fn validate_due(&self) -> Result<Vec<IntegrityCheckResult>> {
        let due = due_locations(self.catalog.as_ref(), self.validation_interval).await?;
        info!(due = due.len(), "Validating due locations");

        let mut results = Vec::with_capacity(due.len());
        if let Some(scheduler) = &self.scheduler {
            let mut replies = Vec::with_capacity(due.len());
            for location in &due {
                replies.push(
                    scheduler
                        .submit_validation(location.id.clone(), CheckLevel::Full)
                        .await?,
                );
            }
            for reply in replies {
                results.push(reply.await.map_err(|_| SchedulerError::Dropped)??);
            }
            return Ok(results);
        }

        for location in due {
            results.push(self.validate(&location.id, true).await?);
        }
        Ok(results)
    }

    /// Current integrity status as last recorded
    pub async fn status(&self, id: &LocationId) -> Result<Option<IntegrityCheckResult>> {
        Ok(self.catalog.integrity(id).await?)
    }

    // ---------------------------------------------------------------
    // Background work
    // ---------------------------------------------------------------

    /// Start the job scheduler; later imports are queued on it
    pub fn spawn_scheduler(&mut self, settings: SchedulerSettings) -> JoinHandle<()> {
        let context = JobContext {
            orchestrator: self.orchestrator.clone(),
            validator: self.validator.clone(),
            catalog: self.catalog.clone(),
            bus: self.bus.clone(),
        };
        let (handle, join) = JobScheduler::spawn(context, settings);
        self.scheduler = Some(handle);
        join
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Drop-folder watcher feeding the scheduler
    pub fn watcher(&self, config: WatcherConfig) -> Result<DropFolderWatcher> {
        let scheduler = self
            .scheduler
            .clone()
            .context("Scheduler must be running to watch a folder")?;
        config.validate()?;
        let sink = EventSink::new(None, Some(self.bus.clone()));
        Ok(DropFolderWatcher::new(config, scheduler, sink).with_scanner(self.scanner.clone()))
    }
}
