//! JobScheduler: background runner for import batches and validations.
//!
//! One dispatcher task owns every piece of scheduling state. Callers,
//! workers and timers talk to it only through [`Command`] messages on a
//! bounded channel, so submission, cancellation, retry and completion are
//! all plain messages rather than shared flags.
//!
//! Dispatch rules:
//! - at most `workers` jobs run at once
//! - pending imports always go before validations
//! - a location's validation waits while an import for it is pending or
//!   running, so half-written payload never shows up as `incomplete`
//! - an import arriving for a location under validation preempts that
//!   validation, which goes back to the head of the queue and reruns once
//!   the import is done

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::catalog::{Catalog, CatalogError};
use crate::core::{CancelToken, EventSink, ImportOrchestrator};
use crate::domain::{
    ArchiveEvent, BatchSummary, CheckLevel, EventKind, ImportBatch, IntegrityCheckResult, Location,
    LocationId,
};
use crate::package::IntegrityValidator;

/// Errors talking to the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Scheduler is shut down")]
    Closed,

    #[error("Job dropped before completion")]
    Dropped,

    #[error("Location not found: {0}")]
    LocationNotFound(LocationId),

    #[error("Job failed: {0}")]
    Failed(String),
}

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Concurrent jobs
    pub workers: usize,

    /// Capacity of the command channel
    pub queue_capacity: usize,

    /// How often every location gets a full check
    pub validation_interval: Duration,

    /// Enqueue due validations when the scheduler starts
    pub validate_on_start: bool,

    /// Backoff for validations that fail operationally
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            validation_interval: Duration::from_secs(7 * 24 * 3600),
            validate_on_start: true,
            retry: RetryPolicy::default(),
        }
    }
}

type ValidationReply = oneshot::Sender<Result<IntegrityCheckResult, SchedulerError>>;
type ImportReply = oneshot::Sender<Result<BatchSummary, SchedulerError>>;

/// Messages understood by the dispatcher
pub enum Command {
    SubmitImport {
        batch: ImportBatch,
        sink: EventSink,
        reply: Option<ImportReply>,
    },
    SubmitValidation {
        location_id: LocationId,
        level: CheckLevel,
        reply: Option<ValidationReply>,
    },
    Cancel {
        batch_id: Uuid,
    },
    JobFinished {
        job_id: u64,
        outcome: JobOutcome,
    },
    /// Enqueue due validations and re-run dispatch
    Tick,
    Shutdown,
}

/// What a worker reports back
pub enum JobOutcome {
    Import,
    Validated,
    /// Stopped for an import of the same location; queued again as is
    Preempted {
        location_id: LocationId,
        level: CheckLevel,
        attempt: u32,
        reply: Option<ValidationReply>,
    },
    /// Operational failure; the job comes back for a retry if allowed
    ValidationFailed {
        location_id: LocationId,
        level: CheckLevel,
        attempt: u32,
        error: String,
        reply: Option<ValidationReply>,
    },
}

struct ImportJob {
    batch: ImportBatch,
    sink: EventSink,
    cancel: CancelToken,
    reply: Option<ImportReply>,
}

struct ValidationJob {
    location_id: LocationId,
    level: CheckLevel,
    attempt: u32,
    not_before: Option<Instant>,
    reply: Option<ValidationReply>,
}

enum RunningKind {
    Import {
        batch_id: Uuid,
    },
    Validation {
        preempt: Option<oneshot::Sender<()>>,
    },
}

struct Running {
    location_id: LocationId,
    kind: RunningKind,
}

/// Shared collaborators the workers need
#[derive(Clone)]
pub struct JobContext {
    pub orchestrator: ImportOrchestrator,
    pub validator: IntegrityValidator,
    pub catalog: Arc<dyn Catalog>,
    pub bus: broadcast::Sender<ArchiveEvent>,
}

/// Handle for submitting work to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Queue an import batch; the receiver yields its summary
    pub async fn submit_import(
        &self,
        batch: ImportBatch,
        sink: EventSink,
    ) -> Result<oneshot::Receiver<Result<BatchSummary, SchedulerError>>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitImport {
            batch,
            sink,
            reply: Some(reply),
        })
        .await?;
        Ok(rx)
    }

    /// Queue a validation; the receiver yields its result
    pub async fn submit_validation(
        &self,
        location_id: LocationId,
        level: CheckLevel,
    ) -> Result<oneshot::Receiver<Result<IntegrityCheckResult, SchedulerError>>, SchedulerError>
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SubmitValidation {
            location_id,
            level,
            reply: Some(reply),
        })
        .await?;
        Ok(rx)
    }

    /// Cancel a pending or running batch; takes effect between files
    pub async fn cancel(&self, batch_id: Uuid) -> Result<(), SchedulerError> {
        self.send(Command::Cancel { batch_id }).await
    }

    /// Enqueue due validations now
    pub async fn tick(&self) -> Result<(), SchedulerError> {
        self.send(Command::Tick).await
    }

    /// Stop after in-flight work; running imports are cancelled between files
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send(Command::Shutdown).await
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx.send(command).await.map_err(|_| SchedulerError::Closed)
    }
}

/// Background job runner
pub struct JobScheduler;

impl JobScheduler {
    /// Start the dispatcher and its interval timer
    pub fn spawn(context: JobContext, settings: SchedulerSettings) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

        let ticker_tx = tx.clone();
        let period = settings.validation_interval.max(Duration::from_secs(1));
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                if ticker_tx.send(Command::Tick).await.is_err() {
                    break;
                }
            }
        });

        let dispatcher = Dispatcher {
            context,
            workers: settings.workers.max(1),
            retry: settings.retry.clone(),
            interval: settings.validation_interval,
            tx: tx.clone(),
            next_job_id: 0,
            imports: VecDeque::new(),
            validations: VecDeque::new(),
            running: HashMap::new(),
            cancels: HashMap::new(),
            shutting_down: false,
        };

        let validate_on_start = settings.validate_on_start;
        let handle = tokio::spawn(async move {
            dispatcher.run(rx, validate_on_start).await;
            ticker.abort();
        });

        (SchedulerHandle { tx }, handle)
    }
}

struct Dispatcher {
    context: JobContext,
    workers: usize,
    retry: RetryPolicy,
    interval: Duration,
    tx: mpsc::Sender<Command>,
    next_job_id: u64,
    imports: VecDeque<ImportJob>,
    validations: VecDeque<ValidationJob>,
    running: HashMap<u64, Running>,
    cancels: HashMap<Uuid, CancelToken>,
    shutting_down: bool,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, validate_on_start: bool) {
        info!(workers = self.workers, "Scheduler started");
        if validate_on_start {
            self.enqueue_due().await;
            self.dispatch();
        }

        while let Some(command) = rx.recv().await {
            match command {
                Command::SubmitImport { batch, sink, reply } => {
                    if self.shutting_down {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(SchedulerError::Closed));
                        }
                        continue;
                    }
                    let cancel = CancelToken::new();
                    self.cancels.insert(batch.id, cancel.clone());
                    debug!(batch_id = %batch.id, location = %batch.location_id, "Import queued");
                    self.imports.push_back(ImportJob {
                        batch,
                        sink,
                        cancel,
                        reply,
                    });
                }
                Command::SubmitValidation {
                    location_id,
                    level,
                    reply,
                } => {
                    if self.shutting_down {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(SchedulerError::Closed));
                        }
                        continue;
                    }
                    self.validations.push_back(ValidationJob {
                        location_id,
                        level,
                        attempt: 1,
                        not_before: None,
                        reply,
                    });
                }
                Command::Cancel { batch_id } => match self.cancels.get(&batch_id) {
                    Some(token) => {
                        info!(%batch_id, "Cancelling batch");
                        token.cancel();
                    }
                    None => debug!(%batch_id, "Cancel for unknown or finished batch"),
                },
                Command::JobFinished { job_id, outcome } => self.finish(job_id, outcome),
                Command::Tick => {
                    if !self.shutting_down {
                        self.enqueue_due().await;
                    }
                }
                Command::Shutdown => {
                    info!(running = self.running.len(), "Scheduler shutting down");
                    self.shutting_down = true;
                    for token in self.cancels.values() {
                        token.cancel();
                    }
                    for job in self.validations.drain(..) {
                        if let Some(reply) = job.reply {
                            let _ = reply.send(Err(SchedulerError::Closed));
                        }
                    }
                }
            }

            self.dispatch();

            if self.shutting_down && self.running.is_empty() && self.imports.is_empty() {
                break;
            }
        }

        info!("Scheduler stopped");
    }

    fn finish(&mut self, job_id: u64, outcome: JobOutcome) {
        let Some(running) = self.running.remove(&job_id) else {
            return;
        };
        if let RunningKind::Import { batch_id } = running.kind {
            self.cancels.remove(&batch_id);
        }

        if let JobOutcome::Preempted {
            location_id,
            level,
            attempt,
            reply,
        } = outcome
        {
            info!(location = %location_id, "Validation preempted by import, requeued");
            self.validations.push_front(ValidationJob {
                location_id,
                level,
                attempt,
                not_before: None,
                reply,
            });
        } else if let JobOutcome::ValidationFailed {
            location_id,
            level,
            attempt,
            error,
            reply,
        } = outcome
        {
            if self.retry.should_retry(attempt) && !self.shutting_down {
                let delay = self.retry.delay_for_attempt(attempt);
                warn!(location = %location_id, attempt, ?delay, error = %error, "Validation failed, will retry");
                self.validations.push_back(ValidationJob {
                    location_id,
                    level,
                    attempt: attempt + 1,
                    not_before: Some(Instant::now() + delay),
                    reply,
                });
                self.wake_after(delay);
            } else {
                error!(location = %location_id, attempt, error = %error, "Validation failed");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SchedulerError::Failed(error)));
                }
            }
        }
        debug!(job_id, location = %running.location_id, "Job finished");
    }

    /// Start as many jobs as the worker bound allows
    fn dispatch(&mut self) {
        self.preempt_validations();

        while self.running.len() < self.workers {
            // An import waits only for its own location's validation to stop
            let next_import = self
                .imports
                .iter()
                .position(|j| !self.validation_running(&j.batch.location_id));
            if let Some(job) = next_import.and_then(|idx| self.imports.remove(idx)) {
                self.start_import(job);
                continue;
            }

            let now = Instant::now();
            let ready = self.validations.iter().position(|v| {
                v.not_before.map_or(true, |t| t <= now)
                    && !self.import_touches(&v.location_id)
                    && !self.validation_running(&v.location_id)
            });
            match ready.and_then(|idx| self.validations.remove(idx)) {
                Some(job) => self.start_validation(job),
                None => break,
            }
        }
    }

    fn import_touches(&self, location_id: &LocationId) -> bool {
        self.imports
            .iter()
            .any(|j| &j.batch.location_id == location_id)
            || self.running.values().any(|r| {
                matches!(r.kind, RunningKind::Import { .. }) && &r.location_id == location_id
            })
    }

    fn validation_running(&self, location_id: &LocationId) -> bool {
        self.running.values().any(|r| {
            matches!(r.kind, RunningKind::Validation { .. }) && &r.location_id == location_id
        })
    }

    /// Signal running validations whose location has an import waiting
    fn preempt_validations(&mut self) {
        for running in self.running.values_mut() {
            let RunningKind::Validation { preempt } = &mut running.kind else {
                continue;
            };
            let wanted = self
                .imports
                .iter()
                .any(|j| j.batch.location_id == running.location_id);
            if wanted {
                if let Some(signal) = preempt.take() {
                    debug!(location = %running.location_id, "Preempting validation");
                    // The validation may have just finished on its own
                    let _ = signal.send(());
                }
            }
        }
    }

    fn start_import(&mut self, job: ImportJob) {
        let job_id = self.job_id();
        self.running.insert(
            job_id,
            Running {
                location_id: job.batch.location_id.clone(),
                kind: RunningKind::Import {
                    batch_id: job.batch.id,
                },
            },
        );

        let orchestrator = self.context.orchestrator.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = orchestrator.run(&job.batch, &job.sink, &job.cancel).await;
            if let Err(e) = &result {
                error!(batch_id = %job.batch.id, error = %e, "Import batch could not run");
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(result.map_err(|e| match e {
                    crate::core::ImportError::LocationNotFound(id) => {
                        SchedulerError::LocationNotFound(id)
                    }
                    other => SchedulerError::Failed(other.to_string()),
                }));
            }
            let _ = tx
                .send(Command::JobFinished {
                    job_id,
                    outcome: JobOutcome::Import,
                })
                .await;
        });
    }

    fn start_validation(&mut self, job: ValidationJob) {
        let job_id = self.job_id();
        let (preempt, preempted) = oneshot::channel();
        self.running.insert(
            job_id,
            Running {
                location_id: job.location_id.clone(),
                kind: RunningKind::Validation {
                    preempt: Some(preempt),
                },
            },
        );

        let context = self.context.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = run_validation(&context, job, preempted).await;
            let _ = tx.send(Command::JobFinished { job_id, outcome }).await;
        });
    }

    /// Locations whose last full check is older than the interval
    async fn enqueue_due(&mut self) {
        let due = match due_locations(self.context.catalog.as_ref(), self.interval).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Could not enumerate due locations");
                return;
            }
        };

        let mut queued = 0;
        for location in due {
            let already = self.validations.iter().any(|v| v.location_id == location.id)
                || self.validation_running(&location.id);
            if already {
                continue;
            }
            self.validations.push_back(ValidationJob {
                location_id: location.id,
                level: CheckLevel::Full,
                attempt: 1,
                not_before: None,
                reply: None,
            });
            queued += 1;
        }
        if queued > 0 {
            info!(queued, "Due validations queued");
        }
    }

    /// Ask for a dispatch pass once a retry delay has passed
    fn wake_after(&self, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Command::Tick).await;
        });
    }

    fn job_id(&mut self) -> u64 {
        self.next_job_id += 1;
        self.next_job_id
    }
}

async fn run_validation(
    context: &JobContext,
    job: ValidationJob,
    preempted: oneshot::Receiver<()>,
) -> JobOutcome {
    let location = match context.catalog.get_location(&job.location_id).await {
        Ok(Some(location)) => location,
        Ok(None) => {
            warn!(location = %job.location_id, "Validation for unknown location");
            if let Some(reply) = job.reply {
                let _ = reply.send(Err(SchedulerError::LocationNotFound(job.location_id)));
            }
            return JobOutcome::Validated;
        }
        Err(e) => return validation_failed(job, e.to_string()),
    };

    let validated = tokio::select! {
        result = context.validator.validate(&location, job.level) => result,
        Ok(()) = preempted => {
            return JobOutcome::Preempted {
                location_id: job.location_id,
                level: job.level,
                attempt: job.attempt,
                reply: job.reply,
            };
        }
    };

    match validated {
        Ok(result) => {
            if context
                .bus
                .send(ArchiveEvent::new(EventKind::ValidationComplete(result.clone())))
                .is_err()
            {
                debug!("No event subscribers");
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(Ok(result));
            }
            JobOutcome::Validated
        }
        Err(e) => validation_failed(job, e.to_string()),
    }
}

fn validation_failed(job: ValidationJob, error: String) -> JobOutcome {
    JobOutcome::ValidationFailed {
        location_id: job.location_id,
        level: job.level,
        attempt: job.attempt,
        error,
        reply: job.reply,
    }
}

/// Locations never fully checked, or last checked longer than `interval` ago
pub async fn due_locations(
    catalog: &dyn Catalog,
    interval: Duration,
) -> Result<Vec<Location>, CatalogError> {
    let now = Utc::now();
    let interval =
        chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::weeks(52_000));

    let mut due = Vec::new();
    for location in catalog.list_locations().await? {
        let last = catalog.last_full_check(&location.id).await?;
        let is_due = match last {
            None => true,
            Some(at) => now.signed_duration_since(at) >= interval,
        };
        if is_due {
            due.push(location);
        }
    }
    Ok(due)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteCatalog;
    use crate::core::LocationLocks;
    use crate::domain::IntegrityStatus;
    use crate::package::ManifestGenerator;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_due_locations() {
        let temp = TempDir::new().unwrap();
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let fresh = Location::new("Fresh", temp.path());
        let stale = Location::new("Stale", temp.path());
        catalog.insert_location(&fresh).await.unwrap();
        catalog.insert_location(&stale).await.unwrap();

        let checked =
            IntegrityCheckResult::new(fresh.id.clone(), IntegrityStatus::Valid, CheckLevel::Full);
        catalog.save_integrity(&checked).await.unwrap();

        let due = due_locations(&catalog, Duration::from_secs(3600)).await.unwrap();
        let ids: Vec<_> = due.iter().map(|l| l.id.clone()).collect();
        assert_eq!(ids, vec![stale.id.clone()]);

        let all = due_locations(&catalog, Duration::ZERO).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_validation_unknown_location_replies_error() {
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open_in_memory().unwrap());
        let (bus, _) = broadcast::channel(16);
        let context = JobContext {
            orchestrator: ImportOrchestrator::new(catalog.clone(), ManifestGenerator::default()),
            validator: IntegrityValidator::new(catalog.clone(), LocationLocks::new()),
            catalog,
            bus,
        };
        let settings = SchedulerSettings {
            validate_on_start: false,
            ..SchedulerSettings::default()
        };
        let (handle, join) = JobScheduler::spawn(context, settings);

        let rx = handle
            .submit_validation(LocationId::derive("Nowhere", None), CheckLevel::Quick)
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(SchedulerError::LocationNotFound(_))));

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }
}
