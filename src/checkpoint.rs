//! Resume cursors for workload traversals
//!
//! A checkpoint maps `(job, workload, subject)` to the point an enumeration
//! can resume from. Processors write one after every completed page, so a
//! redelivered job re-enumerates from the last finished page instead of
//! from page 1.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{MigrationError, Result};
use crate::workload::WorkloadKind;

static JOB_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid job id pattern"));

/// Reject job ids that cannot be used as a directory name
pub fn validate_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() || job_id == "." || job_id == ".." || !JOB_ID_PATTERN.is_match(job_id) {
        return Err(MigrationError::StateError(format!(
            "Invalid job id '{}': use letters, digits, '.', '_' or '-'",
            job_id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Job whose run wrote the checkpoint
    pub job_id: String,
    pub workload: WorkloadKind,
    /// Mailbox, drive, site, team, or a path below one
    pub subject_id: String,
}

impl CheckpointKey {
    pub fn new(job_id: impl Into<String>, workload: WorkloadKind, subject_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            workload,
            subject_id: subject_id.into(),
        }
    }
}

/// Where to resume an enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointCursor {
    /// Enumeration in progress; continue from this next-page link
    Page { next_link: String },
    /// Full pass finished; the next incremental pass starts here
    Delta { delta_link: String },
    /// Subject finished and has no delta support
    Complete,
    /// Pre-order folder walk in progress
    Walk {
        /// Open folders, outermost first
        frames: Vec<FolderFrame>,
        /// Cursor to store once the walk is done, taken before it started
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta_link: Option<String>,
    },
}

/// One open folder of an interrupted folder walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderFrame {
    pub folder_id: String,
    /// Destination folder id, or path prefix inside a snapshot
    pub target: String,
    /// Page being worked on; absent before the folder's first page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_link: Option<String>,
    /// Items of that page already handled
    #[serde(default)]
    pub handled: usize,
}

impl FolderFrame {
    pub fn new(folder_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            folder_id: folder_id.into(),
            target: target.into(),
            page_link: None,
            handled: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub cursor: CheckpointCursor,
    /// Pages finished in the enumeration the cursor belongs to
    pub pages_completed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(key: CheckpointKey, cursor: CheckpointCursor, pages_completed: u64) -> Self {
        Self {
            key,
            cursor,
            pages_completed,
            updated_at: Utc::now(),
        }
    }
}

/// Persistent store for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>>;

    /// Replace the checkpoint for `checkpoint.key`; the write is atomic
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// All checkpoints written by one job
    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>>;

    /// Remove all checkpoints of one job, returning how many were removed
    async fn clear(&self, job_id: &str) -> Result<usize>;
}

/// JSON files under `{root}/{job_id}/{workload}-{base64url(subject)}.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.root.join(job_id))
    }

    fn path_for(&self, key: &CheckpointKey) -> Result<PathBuf> {
        let file = format!(
            "{}-{}.json",
            key.workload.as_str(),
            URL_SAFE_NO_PAD.encode(key.subject_id.as_bytes())
        );
        Ok(self.job_dir(&key.job_id)?.join(file))
    }

    async fn read_file(path: &Path) -> Result<Checkpoint> {
        let json = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_file(&path).await?))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename, so a crash never leaves a torn checkpoint
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        trace!("Saved checkpoint to {:?}", path);
        Ok(())
    }

    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let dir = self.job_dir(job_id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                checkpoints.push(Self::read_file(&path).await?);
            }
        }
        checkpoints.sort_by(|a, b| {
            (a.key.workload.as_str(), &a.key.subject_id).cmp(&(b.key.workload.as_str(), &b.key.subject_id))
        });
        Ok(checkpoints)
    }

    async fn clear(&self, job_id: &str) -> Result<usize> {
        let count = self.list(job_id).await?.len();
        let dir = self.job_dir(job_id)?;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        debug!("Cleared {} checkpoints for job {}", count, job_id);
        Ok(count)
    }
}

/// In-memory store for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<CheckpointKey, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.lock().await.get(key).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .lock()
            .await
            .insert(checkpoint.key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .await
            .values()
            .filter(|c| c.key.job_id == job_id)
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| {
            (a.key.workload.as_str(), &a.key.subject_id).cmp(&(b.key.workload.as_str(), &b.key.subject_id))
        });
        Ok(checkpoints)
    }

    async fn clear(&self, job_id: &str) -> Result<usize> {
        let mut checkpoints = self.checkpoints.lock().await;
        let before = checkpoints.len();
        checkpoints.retain(|key, _| key.job_id != job_id);
        Ok(before - checkpoints.len())
    }
}

/// What a traversal should do for one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// No usable checkpoint: enumerate from the beginning
    Fresh,
    /// Continue an interrupted enumeration
    FromPage { next_link: String, pages_completed: u64 },
    /// Incremental pass from a delta link
    FromDelta { delta_link: String },
    /// Continue an interrupted folder walk
    FromWalk {
        frames: Vec<FolderFrame>,
        delta_link: Option<String>,
        pages_completed: u64,
    },
    /// Already finished by an earlier delivery of this job
    Skip,
}

/// Checkpoint access for one job run
///
/// Reads consult the job's own checkpoints first, then the base job's
/// (an earlier backup this one builds on). Only delta cursors are taken
/// from the base job. Writes always go to the job's own namespace, so a
/// base job's checkpoints are never advanced.
#[derive(Clone)]
pub struct CheckpointScope {
    store: Arc<dyn CheckpointStore>,
    job_id: String,
    base_job_id: Option<String>,
}

impl std::fmt::Debug for CheckpointScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScope")
            .field("job_id", &self.job_id)
            .field("base_job_id", &self.base_job_id)
            .finish()
    }
}

impl CheckpointScope {
    pub fn new(store: Arc<dyn CheckpointStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            base_job_id: None,
        }
    }

    /// Also resume from the delta cursors of `base_job_id`
    pub fn with_base(mut self, base_job_id: Option<String>) -> Self {
        self.base_job_id = base_job_id;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub async fn resume(&self, workload: WorkloadKind, subject_id: &str) -> Result<Resume> {
        let own = CheckpointKey::new(self.job_id.as_str(), workload, subject_id);
        if let Some(checkpoint) = self.store.load(&own).await? {
            trace!(job = %self.job_id, workload = %workload, subject = subject_id, "Resuming from own checkpoint");
            return Ok(match checkpoint.cursor {
                CheckpointCursor::Page { next_link } => Resume::FromPage {
                    next_link,
                    pages_completed: checkpoint.pages_completed,
                },
                CheckpointCursor::Delta { delta_link } => Resume::FromDelta { delta_link },
                CheckpointCursor::Complete => Resume::Skip,
                CheckpointCursor::Walk { frames, delta_link } => Resume::FromWalk {
                    frames,
                    delta_link,
                    pages_completed: checkpoint.pages_completed,
                },
            });
        }

        if let Some(base) = &self.base_job_id {
            let key = CheckpointKey::new(base.as_str(), workload, subject_id);
            if let Some(Checkpoint {
                cursor: CheckpointCursor::Delta { delta_link },
                ..
            }) = self.store.load(&key).await?
            {
                return Ok(Resume::FromDelta { delta_link });
            }
        }

        Ok(Resume::Fresh)
    }

    pub async fn save_page(
        &self,
        workload: WorkloadKind,
        subject_id: &str,
        next_link: &str,
        pages_completed: u64,
    ) -> Result<()> {
        self.save(
            workload,
            subject_id,
            CheckpointCursor::Page {
                next_link: next_link.to_string(),
            },
            pages_completed,
        )
        .await
    }

    pub async fn save_delta(
        &self,
        workload: WorkloadKind,
        subject_id: &str,
        delta_link: &str,
        pages_completed: u64,
    ) -> Result<()> {
        self.save(
            workload,
            subject_id,
            CheckpointCursor::Delta {
                delta_link: delta_link.to_string(),
            },
            pages_completed,
        )
        .await
    }

    pub async fn save_complete(&self, workload: WorkloadKind, subject_id: &str, pages_completed: u64) -> Result<()> {
        self.save(workload, subject_id, CheckpointCursor::Complete, pages_completed)
            .await
    }

    pub async fn save_walk(
        &self,
        workload: WorkloadKind,
        subject_id: &str,
        frames: Vec<FolderFrame>,
        delta_link: Option<&str>,
        pages_completed: u64,
    ) -> Result<()> {
        self.save(
            workload,
            subject_id,
            CheckpointCursor::Walk {
                frames,
                delta_link: delta_link.map(str::to_string),
            },
            pages_completed,
        )
        .await
    }

    async fn save(
        &self,
        workload: WorkloadKind,
        subject_id: &str,
        cursor: CheckpointCursor,
        pages_completed: u64,
    ) -> Result<()> {
        let key = CheckpointKey::new(self.job_id.as_str(), workload, subject_id);
        self.store
            .save(&Checkpoint::new(key, cursor, pages_completed))
            .await
    }
}
