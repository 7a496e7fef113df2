//! Job delivery
//!
//! [`JobQueue`] is the transport seam: at-least-once delivery of job
//! messages, a progress percent per job, and pause/cancel signals the
//! worker polls while a job runs. [`SpoolQueue`] implements it on a local
//! directory:
//!
//! ```text
//! {root}/pending/{job_id}.json    waiting for a worker
//! {root}/inflight/{job_id}.json   claimed, not yet acknowledged
//! {root}/done/{job_id}.json       acknowledged
//! {root}/signals/{job_id}.pause   pause requested
//! {root}/signals/{job_id}.cancel  cancel requested
//! {root}/progress/{job_id}        last reported percent
//! ```
//!
//! A claim is a rename from `pending` to `inflight`, so two workers never
//! receive the same delivery. `recover` returns deliveries a crashed worker
//! left in `inflight` to `pending`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::validate_job_id;
use crate::error::{MigrationError, Result};
use crate::job::JobMessage;

/// Stop request observed for a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueSignal {
    #[default]
    None,
    Pause,
    Cancel,
}

/// A job handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub message: JobMessage,
    /// 1 on first delivery, incremented on every redelivery
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    pub fn job_id(&self) -> &str {
        &self.message.job_id
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: &JobMessage) -> Result<()>;

    /// Claim the oldest waiting delivery
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn update_progress(&self, job_id: &str, percent: u8) -> Result<()>;

    /// Pending stop request for a job; cancel wins over pause
    async fn signal(&self, job_id: &str) -> Result<QueueSignal>;

    /// Record a stop request for a job
    async fn request(&self, job_id: &str, signal: QueueSignal) -> Result<()>;

    /// The delivery was handled and must not be delivered again
    async fn ack(&self, job_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SpoolQueue {
    root: PathBuf,
}

impl SpoolQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn file(&self, dir: &str, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.dir(dir).join(format!("{}.json", job_id)))
    }

    fn marker(&self, job_id: &str, signal: QueueSignal) -> Result<Option<PathBuf>> {
        validate_job_id(job_id)?;
        let extension = match signal {
            QueueSignal::None => return Ok(None),
            QueueSignal::Pause => "pause",
            QueueSignal::Cancel => "cancel",
        };
        Ok(Some(self.dir("signals").join(format!("{}.{}", job_id, extension))))
    }

    async fn write_delivery(path: &Path, delivery: &Delivery) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(delivery)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_delivery(path: &Path) -> Result<Delivery> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Delivery files of one spool directory, oldest first
    async fn entries(&self, dir: &str) -> Result<Vec<PathBuf>> {
        let dir = self.dir(dir);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let modified = entry.metadata().await?.modified()?;
                files.push((modified, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Deliveries waiting for a worker
    pub async fn pending(&self) -> Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();
        for path in self.entries("pending").await? {
            deliveries.push(Self::read_delivery(&path).await?);
        }
        Ok(deliveries)
    }

    /// Return unacknowledged deliveries to `pending` for redelivery
    pub async fn recover(&self) -> Result<usize> {
        let inflight = self.entries("inflight").await?;
        for path in &inflight {
            let mut delivery = Self::read_delivery(path).await?;
            delivery.attempt += 1;
            let target = self.file("pending", delivery.job_id())?;
            Self::write_delivery(&target, &delivery).await?;
            tokio::fs::remove_file(path).await?;
            warn!(job = delivery.job_id(), attempt = delivery.attempt, "Redelivering unacknowledged job");
        }
        Ok(inflight.len())
    }

    /// Last percent reported for a job
    pub async fn progress(&self, job_id: &str) -> Result<Option<u8>> {
        validate_job_id(job_id)?;
        let path = self.dir("progress").join(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = tokio::fs::read_to_string(&path).await?;
        text.trim()
            .parse()
            .map(Some)
            .map_err(|_| MigrationError::StorageError(format!("Corrupt progress file {:?}", path)))
    }

    async fn clear_signals(&self, job_id: &str) -> Result<()> {
        for signal in [QueueSignal::Pause, QueueSignal::Cancel] {
            if let Some(path) = self.marker(job_id, signal)? {
                if path.exists() {
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SpoolQueue {
    async fn enqueue(&self, message: &JobMessage) -> Result<()> {
        message.validate()?;
        let job_id = &message.job_id;
        if self.file("inflight", job_id)?.exists() {
            return Err(MigrationError::StateError(format!(
                "Job {} is currently running",
                job_id
            )));
        }

        // A re-enqueued job starts without stale stop requests
        self.clear_signals(job_id).await?;
        let delivery = Delivery {
            message: message.clone(),
            attempt: 1,
            enqueued_at: Utc::now(),
        };
        Self::write_delivery(&self.file("pending", job_id)?, &delivery).await?;
        info!(job = %job_id, "Enqueued job");
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        tokio::fs::create_dir_all(self.dir("inflight")).await?;

        for path in self.entries("pending").await? {
            let Some(name) = path.file_name() else { continue };
            let claimed = self.dir("inflight").join(name);
            match tokio::fs::rename(&path, &claimed).await {
                Ok(()) => {
                    let delivery = Self::read_delivery(&claimed).await?;
                    debug!(job = delivery.job_id(), attempt = delivery.attempt, "Claimed delivery");
                    return Ok(Some(delivery));
                }
                // Claimed by another worker in the meantime
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn update_progress(&self, job_id: &str, percent: u8) -> Result<()> {
        validate_job_id(job_id)?;
        let dir = self.dir("progress");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(job_id), percent.min(100).to_string()).await?;
        Ok(())
    }

    async fn signal(&self, job_id: &str) -> Result<QueueSignal> {
        for signal in [QueueSignal::Cancel, QueueSignal::Pause] {
            if let Some(path) = self.marker(job_id, signal)? {
                if path.exists() {
                    return Ok(signal);
                }
            }
        }
        Ok(QueueSignal::None)
    }

    async fn request(&self, job_id: &str, signal: QueueSignal) -> Result<()> {
        if let Some(path) = self.marker(job_id, signal)? {
            tokio::fs::create_dir_all(self.dir("signals")).await?;
            tokio::fs::write(&path, Utc::now().to_rfc3339()).await?;
            info!(job = job_id, "Requested {:?}", signal);
        }
        Ok(())
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let inflight = self.file("inflight", job_id)?;
        if !inflight.exists() {
            return Err(MigrationError::StateError(format!(
                "Job {} has no unacknowledged delivery",
                job_id
            )));
        }
        let done = self.file("done", job_id)?;
        tokio::fs::create_dir_all(self.dir("done")).await?;
        tokio::fs::rename(&inflight, &done).await?;
        self.clear_signals(job_id).await?;
        debug!(job = job_id, "Acknowledged delivery");
        Ok(())
    }
}
