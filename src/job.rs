//! Job messages, lifecycle states and outcomes

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::control::StopReason;
use crate::error::{MigrationError, Result};
use crate::workload::{ErrorDescriptor, WorkloadKind, WorkloadResult};

/// Lifecycle of a job record
///
/// The full state machine is owned by the job management API. The engine
/// performs only `Running -> Completed` and `Running -> Failed`; workers
/// claim deliveries with `Pending -> Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Draft, Cancelled)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Pending)
                | (Paused, Cancelled)
        )
    }

    /// Transitions the engine itself may perform
    pub fn engine_may_transition(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Running, JobStatus::Completed) | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "DRAFT",
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Paused => "PAUSED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Everything, ignoring earlier snapshots
    Full,
    /// Changes since the base job, which may itself be incremental
    Incremental,
    /// Changes since the base full backup
    Differential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Copy from the source tenant into the destination tenant
    Migration,
    /// Copy from the source tenant into a snapshot
    Backup { backup_type: BackupType },
}

impl JobKind {
    pub fn is_backup(&self) -> bool {
        matches!(self, JobKind::Backup { .. })
    }
}

/// What the caller makes of item failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// COMPLETED, with `failed_items > 0` visible in the counters
    #[default]
    #[serde(rename = "report")]
    ReportFailures,
    /// FAILED as soon as any item failed
    #[serde(rename = "fail_job")]
    FailOnItemFailures,
}

/// One mailbox, site or team, with its counterpart in the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
}

impl Subject {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: None,
        }
    }

    pub fn mapped(source_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: Some(destination_id.into()),
        }
    }
}

/// Which subjects a job covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Scope {
    /// Every user, site and team in the source tenant
    All,
    Explicit {
        #[serde(default)]
        users: Vec<Subject>,
        #[serde(default)]
        sites: Vec<Subject>,
        #[serde(default)]
        teams: Vec<Subject>,
    },
}

impl Default for Scope {
    fn default() -> Self {
        Scope::All
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Overrides the configured failure policy for this job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    /// Earlier backup whose delta cursors incremental/differential runs start from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_job_id: Option<String>,
    /// Source UPN domain -> destination UPN domain
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub domain_mappings: HashMap<String, String>,
    /// Skip planner plans when migrating teams
    #[serde(default)]
    pub skip_planner: bool,
}

/// A job as delivered by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    pub organization_id: String,
    pub source_tenant: String,
    /// Required for migrations, ignored for backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_tenant: Option<String>,
    pub kind: JobKind,
    pub workloads: Vec<WorkloadKind>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub options: JobOptions,
}

impl JobMessage {
    pub fn validate(&self) -> Result<()> {
        crate::checkpoint::validate_job_id(&self.job_id)?;

        if self.workloads.is_empty() {
            return Err(MigrationError::StateError(format!(
                "Job {} requests no workloads",
                self.job_id
            )));
        }

        match self.kind {
            JobKind::Migration if self.destination_tenant.is_none() => {
                Err(MigrationError::StateError(format!(
                    "Migration job {} has no destination tenant",
                    self.job_id
                )))
            }
            JobKind::Backup {
                backup_type: BackupType::Incremental | BackupType::Differential,
            } if self.options.base_job_id.is_none() => Err(MigrationError::StateError(format!(
                "Backup job {} needs options.base_job_id for an incremental or differential run",
                self.job_id
            ))),
            _ => Ok(()),
        }
    }

    /// Namespace whose delta cursors this run may start from
    pub fn checkpoint_base(&self) -> Option<String> {
        match self.kind {
            JobKind::Backup {
                backup_type: BackupType::Incremental | BackupType::Differential,
            } => self.options.base_job_id.clone(),
            _ => None,
        }
    }
}

/// Result of one workload within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub workload: WorkloadKind,
    pub result: WorkloadResult,
    /// The workload could not run at all
    pub setup_failed: bool,
}

/// What the runner reports for one run of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    /// Terminal status written by this run; `None` when the run was stopped
    pub status: Option<JobStatus>,
    pub stopped: Option<StopReason>,
    pub processed_items: u64,
    pub failed_items: u64,
    pub bytes_transferred: u64,
    pub workloads: Vec<WorkloadSummary>,
    /// Job-level failure that prevented any workload from running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &ErrorDescriptor> {
        self.workloads.iter().flat_map(|w| w.result.errors.iter())
    }
}
