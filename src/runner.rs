//! Runs one job from start to terminal status
//!
//! The runner resolves the tenant clients, runs the requested workloads in
//! order, flushes progress while they run and writes the terminal status.
//! It performs only `RUNNING -> COMPLETED` and `RUNNING -> FAILED`. A run
//! stopped by pause or cancel writes counters but no status; the owner of
//! the job record decides what the stop means.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use crate::auth::CredentialResolver;
use crate::checkpoint::{CheckpointScope, CheckpointStore};
use crate::config::{ConcurrencyConfig, Config};
use crate::control::{RunControl, StopReason};
use crate::error::{MigrationError, Result};
use crate::graph::GraphClient;
use crate::job::{FailurePolicy, JobKind, JobMessage, JobOutcome, JobStatus, WorkloadSummary};
use crate::queue::JobQueue;
use crate::snapshot::{FsSnapshotStore, SnapshotStore, MANIFEST_FILE};
use crate::store::{self, JobCounters, JobStore};
use crate::transfer::ChunkedTransfer;
use crate::workload::{
    Destination, ProcessorRegistry, ProgressSnapshot, ProgressTracker, WorkloadContext, WorkloadKind,
    WorkloadProcessor, WorkloadResult,
};

/// Settings a runner takes from the configuration
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub failure_policy: FailurePolicy,
    pub progress_interval: Duration,
    pub teams_message_delay: Duration,
    pub transfer: ChunkedTransfer,
    /// Backups of job `x` are written to `{snapshots_root}/x`
    pub snapshots_root: PathBuf,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_policy: config.execution.failure_policy,
            progress_interval: Duration::from_secs(config.execution.progress_interval_secs),
            teams_message_delay: Duration::from_millis(config.execution.teams_message_delay_ms),
            transfer: ChunkedTransfer::from(&config.transfer),
            snapshots_root: config.state.snapshots_dir(),
        }
    }
}

/// Concurrent workload runs allowed per workload kind, shared by all runners
#[derive(Debug, Clone)]
pub struct WorkloadLimits {
    semaphores: HashMap<WorkloadKind, Arc<Semaphore>>,
}

impl WorkloadLimits {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            semaphores: WorkloadKind::ALL
                .iter()
                .map(|&kind| (kind, Arc::new(Semaphore::new(config.limit_for(kind).max(1)))))
                .collect(),
        }
    }

    pub fn available(&self, kind: WorkloadKind) -> usize {
        self.semaphores
            .get(&kind)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }

    async fn acquire(&self, kind: WorkloadKind) -> Result<OwnedSemaphorePermit> {
        let semaphore = self
            .semaphores
            .get(&kind)
            .cloned()
            .ok_or_else(|| MigrationError::StateError(format!("No concurrency limit for {}", kind)))?;
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| MigrationError::StateError(format!("Concurrency limit for {} closed", kind)))
    }
}

impl Default for WorkloadLimits {
    fn default() -> Self {
        Self::new(&ConcurrencyConfig::default())
    }
}

/// Receives live progress of a run, for display
pub trait RunObserver: Send + Sync {
    fn workload_started(&self, _kind: WorkloadKind) {}

    fn workload_progress(&self, _kind: WorkloadKind, _progress: &ProgressSnapshot) {}

    fn workload_finished(&self, _kind: WorkloadKind, _result: &WorkloadResult) {}
}

pub struct JobRunner {
    credentials: Arc<dyn CredentialResolver>,
    jobs: Arc<dyn JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    processors: ProcessorRegistry,
    limits: WorkloadLimits,
    settings: RunnerSettings,
    queue: Option<Arc<dyn JobQueue>>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl JobRunner {
    pub fn new(
        credentials: Arc<dyn CredentialResolver>,
        jobs: Arc<dyn JobStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            credentials,
            jobs,
            checkpoints,
            processors: ProcessorRegistry::standard(),
            limits: WorkloadLimits::default(),
            settings,
            queue: None,
            observer: None,
        }
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    pub fn with_limits(mut self, limits: WorkloadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Also report progress percent to the queue transport
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run a job whose record is RUNNING
    ///
    /// Returns `Err` only when the job could not be looked at: invalid
    /// message, unknown record, wrong status, or a store failure. Every other
    /// failure is part of the returned outcome.
    pub async fn run(&self, message: &JobMessage, control: &RunControl) -> Result<JobOutcome> {
        message.validate()?;
        let job_id = message.job_id.as_str();

        let record = store::require(&*self.jobs, job_id).await?;
        if record.status != JobStatus::Running {
            return Err(MigrationError::StateError(format!(
                "Job {} is {}, only RUNNING jobs are executed",
                job_id, record.status
            )));
        }

        let existing = self.checkpoints.list(job_id).await?.len();
        if existing > 0 {
            info!(job = job_id, "Resuming with {} checkpoints", existing);
        }

        let (source, destination) = match self.resolve_endpoints(message).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(job = job_id, "Credential resolution failed: {}", e);
                return self.finish_failed(message, e).await;
            }
        };

        let scope = CheckpointScope::new(Arc::clone(&self.checkpoints), job_id)
            .with_base(message.checkpoint_base());

        let mut summaries = Vec::new();
        let mut counters = JobCounters::default();
        let mut stopped: Option<StopReason> = None;
        let total = message.workloads.len();

        for (index, &kind) in message.workloads.iter().enumerate() {
            if control.is_stopped() {
                stopped = control.stop_reason();
                break;
            }

            let Some(processor) = self.processors.get(kind) else {
                let mut result = WorkloadResult::new();
                result.record_workload_error(
                    kind,
                    &MigrationError::UnsupportedItem(format!("No processor registered for {}", kind)),
                );
                summaries.push(WorkloadSummary {
                    workload: kind,
                    result,
                    setup_failed: true,
                });
                continue;
            };

            let permit = tokio::select! {
                permit = self.limits.acquire(kind) => permit?,
                _ = control.stopped() => {
                    stopped = control.stop_reason();
                    break;
                }
            };

            let ctx = WorkloadContext {
                job_id: job_id.to_string(),
                source: Arc::clone(&source),
                destination: destination.clone(),
                checkpoints: scope.clone(),
                control: control.clone(),
                transfer: self.settings.transfer,
                options: message.options.clone(),
                teams_message_delay: self.settings.teams_message_delay,
                progress: Arc::new(ProgressTracker::new()),
            };

            let summary = self
                .run_workload(processor, &ctx, message, counters, index, total)
                .await;
            drop(permit);

            counters.processed_items += summary.result.processed;
            counters.failed_items += summary.result.failed;
            counters.bytes_transferred += summary.result.bytes_transferred;
            self.flush_progress(job_id, counters, percent(index + 1, total, 0.0))
                .await;

            let workload_stopped = summary.result.stopped;
            summaries.push(summary);
            if workload_stopped.is_some() {
                stopped = workload_stopped;
                break;
            }
        }

        let mut outcome = JobOutcome {
            job_id: job_id.to_string(),
            status: None,
            stopped,
            processed_items: counters.processed_items,
            failed_items: counters.failed_items,
            bytes_transferred: counters.bytes_transferred,
            workloads: summaries,
            error: None,
        };

        if let Some(reason) = stopped {
            info!(job = job_id, "Run stopped ({:?}) after {} items", reason, outcome.processed_items);
            let mut record = store::require(&*self.jobs, job_id).await?;
            record.apply_outcome(&outcome);
            self.jobs.save(&record).await?;
            return Ok(outcome);
        }

        if let Destination::Snapshot(snapshot) = &destination {
            if let Err(e) = write_manifest(snapshot.as_ref(), message, &outcome).await {
                // A snapshot without a manifest is not restorable
                warn!(job = job_id, "Failed to write snapshot manifest: {}", e);
                outcome.error = Some(format!("Snapshot manifest not written: {}", e));
            }
        }

        let policy = message
            .options
            .failure_policy
            .unwrap_or(self.settings.failure_policy);
        let status = terminal_status(&outcome, policy);
        outcome.status = Some(status);

        let mut record = store::require(&*self.jobs, job_id).await?;
        record.apply_outcome(&outcome);
        record.transition(status)?;
        self.jobs.save(&record).await?;
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.update_progress(job_id, 100).await {
                warn!(job = job_id, "Failed to report progress: {}", e);
            }
        }

        info!(
            job = job_id,
            "Job {}: {} processed, {} failed, {} bytes",
            status,
            outcome.processed_items,
            outcome.failed_items,
            outcome.bytes_transferred
        );
        Ok(outcome)
    }

    async fn resolve_endpoints(&self, message: &JobMessage) -> Result<(Arc<GraphClient>, Destination)> {
        let source = self.credentials.client_for(&message.source_tenant).await?;

        let destination = match message.kind {
            JobKind::Migration => {
                let tenant = message.destination_tenant.as_deref().ok_or_else(|| {
                    MigrationError::StateError("Migration without destination tenant".to_string())
                })?;
                Destination::Tenant(self.credentials.client_for(tenant).await?)
            }
            JobKind::Backup { .. } => {
                let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(
                    self.settings.snapshots_root.join(&message.job_id),
                ));
                Destination::Snapshot(store)
            }
        };
        Ok((source, destination))
    }

    /// Job-level failure before any workload ran: FAILED, no partial result
    async fn finish_failed(&self, message: &JobMessage, cause: MigrationError) -> Result<JobOutcome> {
        let outcome = JobOutcome {
            job_id: message.job_id.clone(),
            status: Some(JobStatus::Failed),
            stopped: None,
            processed_items: 0,
            failed_items: 0,
            bytes_transferred: 0,
            workloads: Vec::new(),
            error: Some(cause.to_string()),
        };

        let mut record = store::require(&*self.jobs, &message.job_id).await?;
        record.apply_outcome(&outcome);
        record.transition(JobStatus::Failed)?;
        self.jobs.save(&record).await?;
        Ok(outcome)
    }

    /// Run one processor, flushing progress until it returns
    async fn run_workload(
        &self,
        processor: Arc<dyn WorkloadProcessor>,
        ctx: &WorkloadContext,
        message: &JobMessage,
        before: JobCounters,
        index: usize,
        total: usize,
    ) -> WorkloadSummary {
        let kind = processor.kind();
        info!(job = %ctx.job_id, workload = %kind, "Starting workload");
        if let Some(observer) = &self.observer {
            observer.workload_started(kind);
        }

        let work = processor.process(ctx, &message.scope);
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.settings.progress_interval);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = ticker.tick() => {
                    let progress = ctx.progress.snapshot();
                    let mut counters = before;
                    counters.add(&progress);
                    self.flush_progress(&ctx.job_id, counters, percent(index, total, progress.fraction()))
                        .await;
                    if let Some(observer) = &self.observer {
                        observer.workload_progress(kind, &progress);
                    }
                }
            }
        };

        let (result, setup_failed) = match outcome {
            Ok(result) => (result, false),
            Err(MigrationError::Cancelled) => {
                let mut result = WorkloadResult::new();
                result.stopped = ctx.control.stop_reason();
                (result, false)
            }
            Err(e) => {
                let mut result = WorkloadResult::new();
                result.record_workload_error(kind, &e);
                (result, true)
            }
        };

        debug!(
            job = %ctx.job_id,
            workload = %kind,
            processed = result.processed,
            failed = result.failed,
            "Workload finished"
        );
        if let Some(observer) = &self.observer {
            observer.workload_finished(kind, &result);
        }

        WorkloadSummary {
            workload: kind,
            result,
            setup_failed,
        }
    }

    /// Progress writes are best effort; a failed flush never fails the job
    async fn flush_progress(&self, job_id: &str, counters: JobCounters, percent: u8) {
        if let Err(e) = self.jobs.update_progress(job_id, counters, percent).await {
            warn!(job = job_id, "Failed to store progress: {}", e);
        }
        if let Some(queue) = &self.queue {
            if let Err(e) = queue.update_progress(job_id, percent).await {
                warn!(job = job_id, "Failed to report progress: {}", e);
            }
        }
    }
}

/// Percent of a job done: finished workloads plus the running one's fraction
fn percent(finished: usize, total: usize, fraction: f64) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = (finished as f64 + fraction) / total as f64;
    (done * 100.0).clamp(0.0, 100.0) as u8
}

/// COMPLETED or FAILED for a run that was not stopped
pub fn terminal_status(outcome: &JobOutcome, policy: FailurePolicy) -> JobStatus {
    let every_workload_failed =
        !outcome.workloads.is_empty() && outcome.workloads.iter().all(|w| w.setup_failed);
    if every_workload_failed {
        return JobStatus::Failed;
    }
    match policy {
        FailurePolicy::FailOnItemFailures if outcome.failed_items > 0 => JobStatus::Failed,
        _ => JobStatus::Completed,
    }
}

async fn write_manifest(snapshot: &dyn SnapshotStore, message: &JobMessage, outcome: &JobOutcome) -> Result<()> {
    let backup_type = match message.kind {
        JobKind::Backup { backup_type } => Some(backup_type),
        JobKind::Migration => None,
    };
    let manifest = json!({
        "snapshot_id": uuid::Uuid::new_v4().to_string(),
        "job_id": message.job_id,
        "organization_id": message.organization_id,
        "source_tenant": message.source_tenant,
        "backup_type": backup_type,
        "base_job_id": message.checkpoint_base(),
        "completed_at": Utc::now().to_rfc3339(),
        "processed_items": outcome.processed_items,
        "failed_items": outcome.failed_items,
        "bytes_transferred": outcome.bytes_transferred,
        "workloads": outcome.workloads,
    });
    snapshot.put_document(MANIFEST_FILE, &manifest).await
}
