//! Command-line interface for locvault.
//!
//! Provides commands for managing locations, importing files, validating
//! packages, and running the background scheduler or a drop-folder watcher.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config::{self, ResolvedConfig};
use crate::domain::{
    ArchiveEvent, BatchStatus, BatchSummary, ContentDigest, EventKind, FileOutcome, IntegrityCheckResult,
    IntegrityIssue, IntegrityStatus, LocationId,
};
use crate::ingest::WatcherConfig;
use crate::vault::Vault;

pub mod location;

/// locvault - Content-addressed media archive with integrity checking
#[derive(Parser, Debug)]
#[command(name = "locvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage locations
    Location {
        #[command(subcommand)]
        command: location::LocationCommands,
    },

    /// Import files or folders into a location
    Import {
        /// Location ID
        location_id: String,

        /// Files or folders to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Only print the final summary
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a location package
    Validate {
        /// Location ID
        location_id: String,

        /// Re-hash every payload file instead of comparing counts
        #[arg(long)]
        full: bool,
    },

    /// Fully validate every location whose check is overdue
    ValidateDue,

    /// Show the last recorded integrity status of a location
    Status {
        /// Location ID
        location_id: String,
    },

    /// Rebuild a location's package files from the catalog
    Regenerate {
        /// Location ID
        location_id: String,
    },

    /// Remove one media file from a location
    Remove {
        /// Location ID
        location_id: String,

        /// Content digest (64 hex characters)
        digest: String,
    },

    /// List recently finished import batches
    Batches {
        /// Maximum number of batches to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Show one batch in detail, including its failures
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Import files dropped into a folder until interrupted
    Watch {
        /// Location ID
        location_id: String,

        /// Folder to watch
        dir: PathBuf,

        /// Seconds a file must stay unchanged before import
        #[arg(long)]
        stability_delay: Option<u64>,
    },

    /// Run the scheduler (startup and interval validation) until interrupted
    Daemon,

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Location { command } => location::execute(command, cfg).await,
            Commands::Import {
                location_id,
                paths,
                quiet,
            } => import(cfg, &location_id, paths, quiet).await,
            Commands::Validate { location_id, full } => validate(cfg, &location_id, full).await,
            Commands::ValidateDue => validate_due(cfg).await,
            Commands::Status { location_id } => show_status(cfg, &location_id).await,
            Commands::Regenerate { location_id } => regenerate(cfg, &location_id).await,
            Commands::Remove {
                location_id,
                digest,
            } => remove(cfg, &location_id, &digest).await,
            Commands::Batches { limit, id: None } => list_batches(cfg, limit).await,
            Commands::Batches { id: Some(id), .. } => show_batch(cfg, id).await,
            Commands::Watch {
                location_id,
                dir,
                stability_delay,
            } => watch(cfg, &location_id, dir, stability_delay).await,
            Commands::Daemon => daemon(cfg).await,
            Commands::Config => show_config(cfg),
        }
    }
}

/// Parse a location id argument
pub(crate) fn parse_location_id(s: &str) -> Result<LocationId> {
    LocationId::parse(s).with_context(|| format!("Invalid location ID: {} (expected 16 hex characters)", s))
}

/// Import paths and stream progress to stderr
async fn import(cfg: &ResolvedConfig, location_id: &str, paths: Vec<PathBuf>, quiet: bool) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let vault = Vault::open(cfg)?;

    let mut stream = vault.import_files(&id, paths).await?;
    eprintln!("Batch {} started", stream.batch_id());

    while let Some(event) = stream.next().await {
        if !quiet {
            print_event(&event);
        }
        if event.is_batch_terminal() {
            break;
        }
    }

    let summary = stream.finish().await?;
    println!();
    print_summary(&summary);

    if matches!(summary.status, BatchStatus::Failed | BatchStatus::Cancelled) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary) {
    println!("Status:  {}", summary.status);
    println!("Total:   {}", summary.total);
    println!("Placed:  {}", summary.placed);
    println!("Skipped: {}", summary.skipped);
    println!("Failed:  {}", summary.failed);

    if !summary.failures.is_empty() {
        println!("\nFailures:");
        for failure in &summary.failures {
            println!("  [{}] {}: {}", failure.kind, failure.path.display(), failure.message);
        }
    }
    for warning in &summary.warnings {
        println!("Warning: {}", warning);
    }
}

/// One-line rendering of an event
fn print_event(event: &ArchiveEvent) {
    match &event.kind {
        EventKind::ImportProgress {
            phase,
            processed,
            total,
            ..
        } => eprintln!("  {:?} {}/{}", phase, processed, total),
        EventKind::FileComplete { index, outcome, .. } => match outcome {
            FileOutcome::Placed { path, record } => {
                eprintln!("  #{} placed  {} -> {}", index, path.display(), record.relative_path)
            }
            FileOutcome::Skipped { path, reason, .. } => {
                eprintln!("  #{} skipped {} ({:?})", index, path.display(), reason)
            }
            FileOutcome::Failed(failure) => {
                eprintln!("  #{} failed  {} [{}] {}", index, failure.path.display(), failure.kind, failure.message)
            }
        },
        EventKind::BatchComplete(summary) => {
            eprintln!("  batch {} finished: {}", summary.batch_id, summary.status)
        }
        EventKind::ValidationComplete(result) => {
            eprintln!("  validation {}: {}", result.location_id, result.status)
        }
    }
}

/// Validate a location now
async fn validate(cfg: &ResolvedConfig, location_id: &str, full: bool) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let vault = Vault::open(cfg)?;

    let result = vault.validate(&id, full).await?;
    print_check(&result);

    if matches!(result.status, IntegrityStatus::Invalid | IntegrityStatus::Incomplete) {
        std::process::exit(1);
    }
    Ok(())
}

/// Validate all overdue locations
async fn validate_due(cfg: &ResolvedConfig) -> Result<()> {
    let vault = Vault::open(cfg)?;
    let results = vault.validate_due().await?;

    if results.is_empty() {
        println!("No locations due for validation.");
        return Ok(());
    }

    println!("{:<18} {:<12} {:>8} {:>7}", "LOCATION", "STATUS", "FILES", "ISSUES");
    println!("{}", "-".repeat(48));
    for result in &results {
        println!(
            "{:<18} {:<12} {:>8} {:>7}",
            result.location_id,
            result.status,
            result.files_checked,
            result.issues.len()
        );
    }
    Ok(())
}

/// Show the last recorded check
async fn show_status(cfg: &ResolvedConfig, location_id: &str) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let vault = Vault::open(cfg)?;
    let location = vault.location(&id).await?;

    println!("Location: {} ({})", location.name, location.id);
    println!("Root: {}", location.root.display());
    match vault.status(&id).await? {
        Some(result) => print_check(&result),
        None => println!("Never validated."),
    }
    Ok(())
}

fn print_check(result: &IntegrityCheckResult) {
    println!("Status: {}", result.status);
    println!("Level: {:?}", result.level);
    println!("Checked: {}", result.checked_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Files checked: {}", result.files_checked);

    if result.manifest_corrupt() {
        println!("\n!! Package metadata does not match its tag manifest.");
        println!("!! The checksum listing itself cannot be trusted.");
    }

    if !result.issues.is_empty() {
        println!("\nIssues:");
        for issue in &result.issues {
            match issue {
                IntegrityIssue::MissingPayload { path } => println!("  missing     {}", path),
                IntegrityIssue::DigestMismatch { path, .. } => println!("  mismatch    {}", path),
                IntegrityIssue::Unreadable { path, error } => {
                    println!("  unreadable  {} ({})", path, error)
                }
                IntegrityIssue::ManifestCorrupt { file, detail } => {
                    println!("  corrupt     {} ({})", file, detail)
                }
                IntegrityIssue::Unlisted { path } => println!("  unlisted    {}", path),
                IntegrityIssue::SummaryMismatch { .. } => println!("  summary     {:?}", issue),
            }
        }
    }
}

/// Rebuild package files
async fn regenerate(cfg: &ResolvedConfig, location_id: &str) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let vault = Vault::open(cfg)?;

    let oxum = vault.regenerate_manifest(&id).await?;
    println!("Regenerated package for {} (Payload-Oxum {})", id, oxum);
    Ok(())
}

/// Remove one media file
async fn remove(cfg: &ResolvedConfig, location_id: &str, digest: &str) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let digest = ContentDigest::parse(digest).with_context(|| format!("Invalid digest: {}", digest))?;
    let vault = Vault::open(cfg)?;

    match vault.remove_media(&id, &digest).await? {
        Some(record) => println!("Removed {} ({})", record.relative_path, record.original_name),
        None => println!("No media with digest {} in {}", digest.short(), id),
    }
    Ok(())
}

/// List finished batches
async fn list_batches(cfg: &ResolvedConfig, limit: usize) -> Result<()> {
    let vault = Vault::open(cfg)?;
    let batches = vault.recent_batches(limit).await?;

    if batches.is_empty() {
        println!("No batches found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<18} {:<10} {:>6} {:>6} {:>6}  {}",
        "BATCH ID", "LOCATION", "STATUS", "PLACED", "SKIP", "FAIL", "COMPLETED"
    );
    println!("{}", "-".repeat(110));
    for b in batches {
        println!(
            "{:<36} {:<18} {:<10} {:>6} {:>6} {:>6}  {}",
            b.batch_id,
            b.location_id,
            b.status,
            b.placed,
            b.skipped,
            b.failed,
            b.completed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Show one logged batch
async fn show_batch(cfg: &ResolvedConfig, id: Uuid) -> Result<()> {
    let vault = Vault::open(cfg)?;
    let Some(summary) = vault.batch(id).await? else {
        println!("Batch not found: {}", id);
        std::process::exit(1);
    };

    println!("Batch:     {}", summary.batch_id);
    println!("Location:  {}", summary.location_id);
    println!("Started:   {}", summary.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Completed: {}", summary.completed_at.format("%Y-%m-%d %H:%M:%S"));
    print_summary(&summary);
    Ok(())
}

/// Watch a drop folder until Ctrl-C
async fn watch(
    cfg: &ResolvedConfig,
    location_id: &str,
    dir: PathBuf,
    stability_delay: Option<u64>,
) -> Result<()> {
    let id = parse_location_id(location_id)?;
    let mut vault = Vault::open(cfg)?;
    vault.location(&id).await?;

    let mut settings = cfg.scheduler_settings();
    settings.validate_on_start = false;
    let scheduler_task = vault.spawn_scheduler(settings);

    let mut watcher_config = WatcherConfig::new(dir, id);
    watcher_config.stability_delay_secs = stability_delay.unwrap_or(cfg.watch.stability_delay_secs);
    let watcher = vault.watcher(watcher_config)?;

    if let Some(submitted) = watcher.scan_once().await? {
        eprintln!("Submitted {} existing file(s) as batch {}", submitted.files.len(), submitted.batch_id);
    }

    let (mut drops, handle) = watcher.watch()?;
    let mut events = vault.subscribe();
    eprintln!("Watching {} (Ctrl-C to stop)", watcher.config().watch_path.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            submitted = drops.recv() => match submitted {
                Some(submitted) => eprintln!("Submitted {} file(s) as batch {}", submitted.files.len(), submitted.batch_id),
                None => break,
            },
            event = events.recv() => {
                if let Ok(event) = event {
                    if event.is_batch_terminal() {
                        print_event(&event);
                    }
                }
            }
        }
    }

    handle.stop().await?;
    shutdown(&vault, scheduler_task).await
}

/// Run the scheduler until Ctrl-C
async fn daemon(cfg: &ResolvedConfig) -> Result<()> {
    let mut vault = Vault::open(cfg)?;
    let scheduler_task = vault.spawn_scheduler(cfg.scheduler_settings());
    let mut events = vault.subscribe();

    eprintln!(
        "Scheduler running: {} worker(s), full validation every {}h (Ctrl-C to stop)",
        cfg.scheduler.workers, cfg.validation.interval_hours
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                if let Ok(event) = event {
                    if matches!(event.kind, EventKind::ValidationComplete(_)) || event.is_batch_terminal() {
                        print_event(&event);
                    }
                }
            }
        }
    }

    shutdown(&vault, scheduler_task).await
}

async fn shutdown(vault: &Vault, scheduler_task: tokio::task::JoinHandle<()>) -> Result<()> {
    eprintln!("Stopping...");
    if let Some(scheduler) = vault.scheduler() {
        scheduler.shutdown().await?;
    }
    scheduler_task.await.context("Scheduler task panicked")?;
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Archive:             {}", cfg.archive.display());
    println!("  Catalog:             {}", cfg.catalog_path().display());
    println!("  Batch log:           {}", cfg.batch_log_path().display());
    println!();
    println!("Import:");
    println!("  Copy timeout:     {}s", cfg.import.copy_timeout_secs);
    println!("  Hash concurrency: {}", cfg.import.hash_concurrency);
    println!("  Denylist:         {}", cfg.import.denylist.join(", "));
    println!();
    println!("Validation:");
    println!("  Interval:     {}h", cfg.validation.interval_hours);
    println!("  Max attempts: {}", cfg.validation.retry.max_attempts);
    println!();
    println!("Scheduler:");
    println!("  Workers:           {}", cfg.scheduler.workers);
    println!("  Queue capacity:    {}", cfg.scheduler.queue_capacity);
    println!("  Validate on start: {}", cfg.scheduler.validate_on_start);

    Ok(())
}
