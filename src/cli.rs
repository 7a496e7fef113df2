//! Command-line interface

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::auth::ConfigCredentialResolver;
use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::client::{RetryPolicy, RetryingClient};
use crate::config::Config;
use crate::control::{RunControl, StopReason};
use crate::error::{MigrationError, Result};
use crate::graph::{GraphTransport, HyperTransport};
use crate::job::{JobMessage, JobOutcome, JobStatus};
use crate::queue::{JobQueue, QueueSignal, SpoolQueue};
use crate::rate_limiter::TenantRateLimiter;
use crate::runner::{JobRunner, RunObserver, RunnerSettings, WorkloadLimits};
use crate::store::{self, JobRecord, JobStore, FileJobStore};
use crate::workload::{ProgressSnapshot, WorkloadKind, WorkloadResult};

#[derive(Parser, Debug)]
#[command(name = "tenant-migrator")]
#[command(version)]
#[command(about = "Migration and backup engine for cloud tenant workloads", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job in the foreground (Ctrl-C pauses it)
    Run {
        /// Job message as JSON
        job: PathBuf,
    },

    /// Consume the job queue until interrupted
    Worker {
        /// Jobs run at once (defaults to concurrency.worker_slots)
        #[arg(long)]
        slots: Option<usize>,
    },

    /// Queue a job for the workers
    Enqueue {
        /// Job message as JSON
        job: PathBuf,
    },

    /// Ask a running job to pause at its next page boundary
    Pause { job_id: String },

    /// Queue a paused job again
    Resume { job_id: String },

    /// Cancel a job
    Cancel { job_id: String },

    /// Show job status and counters
    Status {
        /// One job; all jobs when omitted
        job_id: Option<String>,

        /// Show per-workload results and errors
        #[arg(long)]
        detailed: bool,
    },

    /// List resume checkpoints of a job
    Checkpoints {
        job_id: String,

        /// Delete them, so the next run starts from scratch
        #[arg(long)]
        clear: bool,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bars: Mutex<HashMap<WorkloadKind, ProgressBar>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {prefix:>6} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    fn with_bar(&self, kind: WorkloadKind, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(&kind) {
                f(pb);
            }
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn progress_message(processed: u64, failed: u64, bytes: u64) -> String {
    format!(
        "{} items, {} failed, {:.1} MiB",
        processed,
        failed,
        bytes as f64 / (1024.0 * 1024.0)
    )
}

impl RunObserver for ProgressReporter {
    fn workload_started(&self, kind: WorkloadKind) {
        let pb = self.add_spinner("starting");
        pb.set_prefix(kind.to_string());
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(kind, pb);
        }
    }

    fn workload_progress(&self, kind: WorkloadKind, progress: &ProgressSnapshot) {
        self.with_bar(kind, |pb| {
            pb.set_message(format!(
                "{}/{} subjects, {}",
                progress.subjects_done,
                progress.subjects_total,
                progress_message(progress.processed, progress.failed, progress.bytes_transferred)
            ));
        });
    }

    fn workload_finished(&self, kind: WorkloadKind, result: &WorkloadResult) {
        self.with_bar(kind, |pb| {
            pb.finish_with_message(progress_message(
                result.processed,
                result.failed,
                result.bytes_transferred,
            ));
        });
    }
}

/// State stores and queue under the configured state directory
pub struct Services {
    pub config: Config,
    pub jobs: Arc<FileJobStore>,
    pub checkpoints: Arc<FileCheckpointStore>,
    pub queue: Arc<SpoolQueue>,
}

impl Services {
    pub fn new(config: Config) -> Self {
        Self {
            jobs: Arc::new(FileJobStore::new(config.state.jobs_dir())),
            checkpoints: Arc::new(FileCheckpointStore::new(config.state.checkpoints_dir())),
            queue: Arc::new(SpoolQueue::new(config.state.queue_dir())),
            config,
        }
    }

    /// Runner talking to the real API; also returns the shared limiter for stats
    pub fn runner(&self) -> Result<(JobRunner, TenantRateLimiter)> {
        let config = &self.config;
        let transport: Arc<dyn GraphTransport> =
            Arc::new(HyperTransport::https(config.api.request_timeout())?);
        let limiter = TenantRateLimiter::with_quotas(config.rate_limits.overrides());
        let retrying = RetryingClient::new(limiter.clone(), RetryPolicy::from(&config.retry));
        let resolver = ConfigCredentialResolver::new(
            config.api.clone(),
            config.tenants.clone(),
            transport,
            retrying,
        );

        let runner = JobRunner::new(
            Arc::new(resolver),
            self.jobs.clone(),
            self.checkpoints.clone(),
            RunnerSettings::from_config(config),
        )
        .with_limits(WorkloadLimits::new(&config.concurrency));
        Ok((runner, limiter))
    }
}

pub async fn load_message(path: &Path) -> Result<JobMessage> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        MigrationError::ConfigError(format!("Failed to read job file {:?}: {}", path, e))
    })?;
    let message: JobMessage = serde_json::from_str(&json)?;
    message.validate()?;
    Ok(message)
}

/// Run one job in the foreground, acting as the owner of its record
pub async fn run_job(services: &Services, message: JobMessage, reporter: Arc<ProgressReporter>) -> Result<JobOutcome> {
    let job_id = message.job_id.clone();
    match services.jobs.load(&job_id).await? {
        None => {
            services
                .jobs
                .save(&JobRecord::new(message.clone(), JobStatus::Pending))
                .await?;
            store::transition(&*services.jobs, &job_id, JobStatus::Running).await?;
        }
        Some(record) if record.status == JobStatus::Running => {
            info!(job = %job_id, "Resuming interrupted run");
        }
        Some(record) => {
            if record.status == JobStatus::Paused {
                store::transition(&*services.jobs, &job_id, JobStatus::Pending).await?;
            }
            store::transition(&*services.jobs, &job_id, JobStatus::Running).await?;
        }
    }

    let (runner, limiter) = services.runner()?;
    let runner = runner.with_observer(reporter);

    let control = RunControl::new();
    let interrupt = control.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, pausing at the next page boundary");
            interrupt.pause();
        }
    });

    let outcome = runner.run(&message, &control).await;
    ctrl_c.abort();
    let outcome = outcome?;

    if outcome.stopped == Some(StopReason::Paused) {
        store::transition(&*services.jobs, &job_id, JobStatus::Paused).await?;
    }

    let stats = limiter.stats();
    info!(
        acquisitions = stats.total_acquisitions,
        delayed = stats.delayed_acquisitions,
        wait_ms = stats.total_wait_ms,
        "Rate limiter usage"
    );
    Ok(outcome)
}

/// Record the job as PENDING and put it on the queue
pub async fn enqueue(services: &Services, message: JobMessage) -> Result<()> {
    let job_id = message.job_id.clone();
    match services.jobs.load(&job_id).await? {
        None => {
            services
                .jobs
                .save(&JobRecord::new(message.clone(), JobStatus::Pending))
                .await?;
        }
        Some(record) if record.status == JobStatus::Pending => {}
        Some(mut record) => {
            record.transition(JobStatus::Pending)?;
            record.message = message.clone();
            services.jobs.save(&record).await?;
        }
    }
    services.queue.enqueue(&message).await
}

pub async fn pause(services: &Services, job_id: &str) -> Result<()> {
    let record = store::require(&*services.jobs, job_id).await?;
    if record.status != JobStatus::Running {
        return Err(MigrationError::StateError(format!(
            "Job {} is {}, only RUNNING jobs can be paused",
            job_id, record.status
        )));
    }
    services.queue.request(job_id, QueueSignal::Pause).await
}

pub async fn resume(services: &Services, job_id: &str) -> Result<()> {
    let record = store::transition(&*services.jobs, job_id, JobStatus::Pending).await?;
    services.queue.enqueue(&record.message).await
}

/// Cancel a running job through the queue, or any other job directly
pub async fn cancel(services: &Services, job_id: &str) -> Result<JobStatus> {
    let record = store::require(&*services.jobs, job_id).await?;
    if record.status == JobStatus::Running {
        services.queue.request(job_id, QueueSignal::Cancel).await?;
        return Ok(JobStatus::Running);
    }
    let record = store::transition(&*services.jobs, job_id, JobStatus::Cancelled).await?;
    Ok(record.status)
}

pub async fn checkpoints(services: &Services, job_id: &str, clear: bool) -> Result<Vec<crate::checkpoint::Checkpoint>> {
    let checkpoints = services.checkpoints.list(job_id).await?;
    if clear {
        services.checkpoints.clear(job_id).await?;
    }
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobOptions, Scope};
    use tempfile::TempDir;

    fn services(dir: &TempDir) -> Services {
        let mut config = Config::default();
        config.state.directory = dir.path().to_path_buf();
        Services::new(config)
    }

    fn message(job_id: &str) -> JobMessage {
        JobMessage {
            job_id: job_id.to_string(),
            organization_id: "org".to_string(),
            source_tenant: "src".to_string(),
            destination_tenant: Some("dst".to_string()),
            kind: JobKind::Migration,
            workloads: vec![WorkloadKind::Files],
            scope: Scope::All,
            options: JobOptions::default(),
        }
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["tenant-migrator", "--log-json", "status", "job-1", "--detailed"]).unwrap();
        assert!(cli.log_json);
        match cli.command {
            Commands::Status { job_id, detailed } => {
                assert_eq!(job_id.as_deref(), Some("job-1"));
                assert!(detailed);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["tenant-migrator", "worker", "--slots", "8"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker { slots: Some(8) }));
    }

    #[tokio::test]
    async fn test_enqueue_pause_cancel_lifecycle() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);

        enqueue(&services, message("job-1")).await.unwrap();
        assert_eq!(
            services.jobs.load("job-1").await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(services.queue.pending().await.unwrap().len(), 1);

        // Only running jobs can be paused
        assert!(pause(&services, "job-1").await.is_err());

        store::transition(&*services.jobs, "job-1", JobStatus::Running)
            .await
            .unwrap();
        pause(&services, "job-1").await.unwrap();
        assert_eq!(services.queue.signal("job-1").await.unwrap(), QueueSignal::Pause);

        assert_eq!(cancel(&services, "job-1").await.unwrap(), JobStatus::Running);
        assert_eq!(services.queue.signal("job-1").await.unwrap(), QueueSignal::Cancel);
    }

    #[tokio::test]
    async fn test_resume_requeues_paused_job() {
        let dir = TempDir::new().unwrap();
        let services = services(&dir);
        services
            .jobs
            .save(&JobRecord::new(message("job-1"), JobStatus::Paused))
            .await
            .unwrap();

        resume(&services, "job-1").await.unwrap();
        assert_eq!(
            services.jobs.load("job-1").await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(services.queue.pending().await.unwrap()[0].job_id(), "job-1");

        assert_eq!(cancel(&services, "job-1").await.unwrap(), JobStatus::Cancelled);
        assert!(resume(&services, "job-1").await.is_err());
    }

    #[tokio::test]
    async fn test_load_message_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        let mut invalid = message("job-1");
        invalid.workloads.clear();
        tokio::fs::write(&path, serde_json::to_string(&invalid).unwrap())
            .await
            .unwrap();
        assert!(load_message(&path).await.is_err());

        tokio::fs::write(&path, serde_json::to_string(&message("job-1")).unwrap())
            .await
            .unwrap();
        assert_eq!(load_message(&path).await.unwrap().job_id, "job-1");
    }
}
