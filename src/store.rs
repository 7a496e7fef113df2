//! Job records: status and counters as the engine reports them
//!
//! The record is owned by the job management side. The engine reads the
//! message and writes counters, progress and the transitions
//! [`JobStatus::can_transition_to`] allows.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::validate_job_id;
use crate::control::StopReason;
use crate::error::{MigrationError, Result};
use crate::job::{JobMessage, JobOutcome, JobStatus, WorkloadSummary};
use crate::workload::ProgressSnapshot;

/// Aggregate counters of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub processed_items: u64,
    pub failed_items: u64,
    pub bytes_transferred: u64,
}

impl JobCounters {
    pub fn add(&mut self, progress: &ProgressSnapshot) {
        self.processed_items += progress.processed;
        self.failed_items += progress.failed;
        self.bytes_transferred += progress.bytes_transferred;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub message: JobMessage,
    pub status: JobStatus,
    #[serde(default)]
    pub counters: JobCounters,
    #[serde(default)]
    pub progress_percent: u8,
    /// Per-workload results of the last run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<WorkloadSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(message: JobMessage, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            message,
            status,
            counters: JobCounters::default(),
            progress_percent: 0,
            workloads: Vec::new(),
            stopped: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.message.job_id
    }

    /// Apply a state machine transition
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrationError::StateError(format!(
                "Job {} cannot move from {} to {}",
                self.message.job_id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold a finished run into the record
    pub fn apply_outcome(&mut self, outcome: &JobOutcome) {
        self.counters = JobCounters {
            processed_items: outcome.processed_items,
            failed_items: outcome.failed_items,
            bytes_transferred: outcome.bytes_transferred,
        };
        self.workloads = outcome.workloads.clone();
        self.stopped = outcome.stopped;
        if outcome.status.is_some() {
            self.progress_percent = 100;
        }
        self.updated_at = Utc::now();
    }
}

/// Persistent store for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>>;

    async fn save(&self, record: &JobRecord) -> Result<()>;

    async fn list(&self) -> Result<Vec<JobRecord>>;

    /// Counters and percent of a running job
    async fn update_progress(&self, job_id: &str, counters: JobCounters, percent: u8) -> Result<()>;
}

/// Load a record, failing when it does not exist
pub async fn require(store: &dyn JobStore, job_id: &str) -> Result<JobRecord> {
    store
        .load(job_id)
        .await?
        .ok_or_else(|| MigrationError::StateError(format!("Unknown job {}", job_id)))
}

/// Load, transition and save one record
pub async fn transition(store: &dyn JobStore, job_id: &str, next: JobStatus) -> Result<JobRecord> {
    let mut record = require(store, job_id).await?;
    let previous = record.status;
    record.transition(next)?;
    store.save(&record).await?;
    info!(job = job_id, "Job {} -> {}", previous, next);
    Ok(record)
}

/// One JSON file per job under `{root}/{job_id}.json`
#[derive(Debug, Clone)]
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.root.join(format!("{}.json", job_id)))
    }

    async fn read_file(path: &Path) -> Result<JobRecord> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let path = self.path_for(job_id)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_file(&path).await?))
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let path = self.path_for(record.job_id())?;
        tokio::fs::create_dir_all(&self.root).await?;

        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved job record to {:?}", path);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                records.push(Self::read_file(&path).await?);
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn update_progress(&self, job_id: &str, counters: JobCounters, percent: u8) -> Result<()> {
        let mut record = require(self, job_id).await?;
        record.counters = counters;
        record.progress_percent = percent.min(100);
        record.updated_at = Utc::now();
        self.save(&record).await
    }
}
