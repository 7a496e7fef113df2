//! Worker pool consuming the job queue
//!
//! Each slot claims one delivery at a time, moves the job record from
//! PENDING to RUNNING and hands it to the shared [`JobRunner`]. While the
//! job runs, the slot polls the queue's pause/cancel signal and forwards it
//! to the run's [`RunControl`].
//!
//! A delivery is acknowledged once the run reached a terminal status,
//! stopped on a queue signal, or was refused outright. A run stopped by
//! pool shutdown or by a store failure stays unacknowledged so the queue
//! delivers it again.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{RunControl, StopReason};
use crate::error::Result;
use crate::job::JobStatus;
use crate::queue::{Delivery, JobQueue, QueueSignal};
use crate::runner::JobRunner;
use crate::store::{self, JobRecord, JobStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// What a slot did with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Run finished with this status
    Finished(JobStatus),
    /// Run stopped on a queue signal; the record now has this status
    Stopped(JobStatus),
    /// Run stopped by shutdown, left for redelivery
    Interrupted,
    /// Duplicate or stale delivery, acknowledged without running
    Skipped,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    jobs: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    slots: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, jobs: Arc<dyn JobStore>, runner: Arc<JobRunner>, slots: usize) -> Self {
        Self {
            queue,
            jobs,
            runner,
            slots: slots.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run every slot until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("Starting {} worker slots", self.slots);

        let mut slots = JoinSet::new();
        for slot in 0..self.slots {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!("Worker slot panicked: {}", e);
            }
        }
        info!("All worker slots stopped");
        Ok(())
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.process_next(&shutdown).await {
                Ok(Some(handled)) => debug!(slot, "Delivery handled: {:?}", handled),
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(slot, "Queue error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(slot, "Worker slot stopped");
    }

    /// Claim and handle one delivery; `None` when the queue is empty
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<Option<Handled>> {
        match self.queue.receive().await? {
            Some(delivery) => self.handle(delivery, shutdown).await.map(Some),
            None => Ok(None),
        }
    }

    async fn handle(&self, delivery: Delivery, shutdown: &CancellationToken) -> Result<Handled> {
        let job_id = delivery.job_id().to_string();
        info!(job = %job_id, attempt = delivery.attempt, "Received job");

        let record = match self.jobs.load(&job_id).await? {
            Some(record) => record,
            None => {
                let record = JobRecord::new(delivery.message.clone(), JobStatus::Pending);
                self.jobs.save(&record).await?;
                record
            }
        };

        match record.status {
            JobStatus::Pending => {
                store::transition(&*self.jobs, &job_id, JobStatus::Running).await?;
            }
            // Redelivery after a crash or shutdown mid-run
            JobStatus::Running => info!(job = %job_id, "Resuming interrupted run"),
            other => {
                warn!(job = %job_id, "Skipping delivery of {} job", other);
                self.queue.ack(&job_id).await?;
                return Ok(Handled::Skipped);
            }
        }

        let control = RunControl::new();
        let watcher = tokio::spawn(watch_signals(
            Arc::clone(&self.queue),
            job_id.clone(),
            control.clone(),
            shutdown.clone(),
            self.poll_interval,
        ));

        let outcome = self.runner.run(&delivery.message, &control).await;
        watcher.abort();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if e.is_refusal() => {
                error!(job = %job_id, "Job refused: {}", e);
                self.queue.ack(&job_id).await?;
                return Err(e);
            }
            Err(e) => {
                error!(job = %job_id, "Job could not run, leaving delivery for redelivery: {}", e);
                return Err(e);
            }
        };

        if let Some(status) = outcome.status {
            self.queue.ack(&job_id).await?;
            return Ok(Handled::Finished(status));
        }

        // Stopped: by a queue signal, or by shutdown
        let next = match (outcome.stopped, self.queue.signal(&job_id).await?) {
            (_, QueueSignal::Cancel) => JobStatus::Cancelled,
            (Some(StopReason::Paused), QueueSignal::Pause) => JobStatus::Paused,
            _ => {
                info!(job = %job_id, "Run interrupted, leaving delivery for redelivery");
                return Ok(Handled::Interrupted);
            }
        };
        store::transition(&*self.jobs, &job_id, next).await?;
        self.queue.ack(&job_id).await?;
        Ok(Handled::Stopped(next))
    }
}

/// Forward queue signals and shutdown to a running job
async fn watch_signals(
    queue: Arc<dyn JobQueue>,
    job_id: String,
    control: RunControl,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => {
                control.pause();
                return;
            }
        }

        match queue.signal(&job_id).await {
            Ok(QueueSignal::Pause) => {
                info!(job = %job_id, "Pause requested");
                control.pause();
                return;
            }
            Ok(QueueSignal::Cancel) => {
                info!(job = %job_id, "Cancel requested");
                control.cancel();
                return;
            }
            Ok(QueueSignal::None) => {}
            Err(e) => warn!(job = %job_id, "Failed to poll signals: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialResolver;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::error::MigrationError;
    use crate::graph::GraphClient;
    use crate::job::{FailurePolicy, JobKind, JobMessage, JobOptions, Scope};
    use crate::queue::SpoolQueue;
    use crate::runner::RunnerSettings;
    use crate::store::{FileJobStore, JobCounters};
    use crate::transfer::ChunkedTransfer;
    use crate::workload::{ProcessorRegistry, WorkloadContext, WorkloadKind, WorkloadProcessor, WorkloadResult};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoCredentials;

    #[async_trait]
    impl CredentialResolver for NoCredentials {
        async fn client_for(&self, tenant_id: &str) -> Result<Arc<GraphClient>> {
            Err(MigrationError::CredentialError(format!("unknown tenant {}", tenant_id)))
        }
    }

    /// Processor that parks until the run is stopped
    struct ParkedProcessor;

    #[async_trait]
    impl WorkloadProcessor for ParkedProcessor {
        fn kind(&self) -> WorkloadKind {
            WorkloadKind::Mail
        }

        async fn process(&self, ctx: &WorkloadContext, _scope: &Scope) -> Result<WorkloadResult> {
            ctx.control.stopped().await;
            ctx.control.checkpoint()?;
            Ok(ctx.new_result())
        }
    }

    fn message(job_id: &str) -> JobMessage {
        JobMessage {
            job_id: job_id.to_string(),
            organization_id: "org".to_string(),
            source_tenant: "src".to_string(),
            destination_tenant: Some("dst".to_string()),
            kind: JobKind::Migration,
            workloads: vec![WorkloadKind::Mail],
            scope: Scope::All,
            options: JobOptions::default(),
        }
    }

    fn settings(dir: &TempDir) -> RunnerSettings {
        RunnerSettings {
            failure_policy: FailurePolicy::ReportFailures,
            progress_interval: Duration::from_secs(5),
            teams_message_delay: Duration::ZERO,
            transfer: ChunkedTransfer::default(),
            snapshots_root: dir.path().join("snapshots"),
        }
    }

    #[tokio::test]
    async fn test_claims_pending_job_and_acks_terminal_run() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SpoolQueue::new(dir.path().join("queue")));
        let jobs = Arc::new(FileJobStore::new(dir.path().join("jobs")));
        let runner = Arc::new(JobRunner::new(
            Arc::new(NoCredentials),
            jobs.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings(&dir),
        ));
        let pool = WorkerPool::new(queue.clone(), jobs.clone(), runner, 1);

        queue.enqueue(&message("job-1")).await.unwrap();
        let handled = pool.process_next(&CancellationToken::new()).await.unwrap();

        // No credentials: job-level failure
        assert_eq!(handled, Some(Handled::Finished(JobStatus::Failed)));
        assert_eq!(jobs.load("job-1").await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(queue.receive().await.unwrap().is_none());
        assert!(pool.process_next(&CancellationToken::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_skipped() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SpoolQueue::new(dir.path().join("queue")));
        let jobs = Arc::new(FileJobStore::new(dir.path().join("jobs")));
        let runner = Arc::new(JobRunner::new(
            Arc::new(NoCredentials),
            jobs.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings(&dir),
        ));
        let pool = WorkerPool::new(queue.clone(), jobs.clone(), runner, 1);

        jobs.save(&JobRecord::new(message("job-1"), JobStatus::Completed))
            .await
            .unwrap();
        queue.enqueue(&message("job-1")).await.unwrap();

        let handled = pool.process_next(&CancellationToken::new()).await.unwrap();
        assert_eq!(handled, Some(Handled::Skipped));
        assert_eq!(jobs.load("job-1").await.unwrap().unwrap().status, JobStatus::Completed);
    }

    /// Job store whose saves of terminal records fail
    struct TerminalSaveFails {
        inner: FileJobStore,
    }

    #[async_trait]
    impl JobStore for TerminalSaveFails {
        async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
            self.inner.load(job_id).await
        }

        async fn save(&self, record: &JobRecord) -> Result<()> {
            if record.status.is_terminal() {
                return Err(MigrationError::StorageError("disk full".to_string()));
            }
            self.inner.save(record).await
        }

        async fn list(&self) -> Result<Vec<JobRecord>> {
            self.inner.list().await
        }

        async fn update_progress(&self, job_id: &str, counters: JobCounters, percent: u8) -> Result<()> {
            self.inner.update_progress(job_id, counters, percent).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_delivery_for_redelivery() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SpoolQueue::new(dir.path().join("queue")));
        let jobs = Arc::new(TerminalSaveFails {
            inner: FileJobStore::new(dir.path().join("jobs")),
        });
        let runner = Arc::new(JobRunner::new(
            Arc::new(NoCredentials),
            jobs.clone(),
            Arc::new(MemoryCheckpointStore::new()),
            settings(&dir),
        ));
        let pool = WorkerPool::new(queue.clone(), jobs.clone(), runner, 1);

        queue.enqueue(&message("job-1")).await.unwrap();
        let err = pool.process_next(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, MigrationError::StorageError(_)));
        assert_eq!(jobs.load("job-1").await.unwrap().unwrap().status, JobStatus::Running);

        // Unacknowledged: a restarted worker gets the job again
        assert_eq!(queue.recover().await.unwrap(), 1);
        let redelivered = queue.receive().await.unwrap().unwrap();
        assert_eq!(redelivered.job_id(), "job-1");
    }

    #[tokio::test]
    async fn test_pause_signal_stops_run() {
        use crate::auth::StaticToken;
        use crate::client::{RetryPolicy, RetryingClient};
        use crate::graph::{GraphRequest, GraphResponse, GraphTransport};
        use crate::rate_limiter::TenantRateLimiter;

        struct NoTransport;

        #[async_trait]
        impl GraphTransport for NoTransport {
            async fn send(&self, _request: GraphRequest) -> Result<GraphResponse> {
                Err(MigrationError::NetworkError("offline".to_string()))
            }
        }

        struct OfflineCredentials;

        #[async_trait]
        impl CredentialResolver for OfflineCredentials {
            async fn client_for(&self, tenant_id: &str) -> Result<Arc<GraphClient>> {
                Ok(Arc::new(GraphClient::new(
                    tenant_id,
                    "https://graph.test/v1.0",
                    Arc::new(StaticToken::new("token")),
                    Arc::new(NoTransport),
                    RetryingClient::new(TenantRateLimiter::new(), RetryPolicy::default()),
                )))
            }
        }

        let dir = TempDir::new().unwrap();
        let queue = Arc::new(SpoolQueue::new(dir.path().join("queue")));
        let jobs = Arc::new(FileJobStore::new(dir.path().join("jobs")));
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(ParkedProcessor));
        let runner = Arc::new(
            JobRunner::new(
                Arc::new(OfflineCredentials),
                jobs.clone(),
                Arc::new(MemoryCheckpointStore::new()),
                settings(&dir),
            )
            .with_processors(registry),
        );
        let pool = Arc::new(
            WorkerPool::new(queue.clone(), jobs.clone(), runner, 1)
                .with_poll_interval(Duration::from_millis(20)),
        );

        queue.enqueue(&message("job-1")).await.unwrap();
        let worker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.process_next(&CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.request("job-1", QueueSignal::Pause).await.unwrap();

        let handled = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handled, Some(Handled::Stopped(JobStatus::Paused)));

        let record = jobs.load("job-1").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Paused);
        assert_eq!(record.stopped, Some(StopReason::Paused));
    }
}
