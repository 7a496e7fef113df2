//! Workload processors and what they share
//!
//! A processor moves one category of tenant data (mail, files, sites,
//! teams) for every subject in a job's scope. It reads from the source
//! tenant and writes either to the destination tenant (migration) or to a
//! snapshot (backup), both reached through [`WorkloadContext`].
//!
//! Failure levels:
//! - Item: one message, file or list item failed. Recorded in the
//!   [`WorkloadResult`], the traversal continues.
//! - Subject: setup for one mailbox, site or team failed (for example the
//!   destination team does not exist). Recorded, the next subject runs.
//! - Workload: `process` returns `Err`, for example because the subjects
//!   could not be enumerated. The runner records it and moves on.
//!
//! [`RunControl`] is checked before every page fetch and between subjects.
//! `MigrationError::Cancelled` raised there unwinds to the subject loop,
//! which stops the workload with `stopped` set.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointScope, Resume};
use crate::control::{RunControl, StopReason};
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::job::{JobOptions, Scope, Subject};
use crate::paginator::{DeltaCursor, DeltaPaginator, Paginator};
use crate::rate_limiter::ServiceClass;
use crate::snapshot::SnapshotStore;
use crate::transfer::ChunkedTransfer;

pub mod drive;
pub mod files;
pub mod mail;
pub mod sites;
pub mod teams;

pub use files::FilesProcessor;
pub use mail::MailProcessor;
pub use sites::SitesProcessor;
pub use teams::TeamsProcessor;

/// Error descriptors kept per workload; later ones are only counted
pub const MAX_ERROR_DESCRIPTORS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadKind {
    Mail,
    Files,
    Sites,
    Teams,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 4] = [
        WorkloadKind::Mail,
        WorkloadKind::Files,
        WorkloadKind::Sites,
        WorkloadKind::Teams,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Mail => "mail",
            WorkloadKind::Files => "files",
            WorkloadKind::Sites => "sites",
            WorkloadKind::Teams => "teams",
        }
    }

    /// Quota the workload's reads and writes are charged to
    pub fn service_class(&self) -> ServiceClass {
        match self {
            WorkloadKind::Mail => ServiceClass::Mail,
            WorkloadKind::Files | WorkloadKind::Sites => ServiceClass::Files,
            WorkloadKind::Teams => ServiceClass::Teams,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    Item,
    Subject,
    Workload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub item_id: String,
    pub message: String,
    pub level: ErrorLevel,
}

/// Live counters a running workload publishes for progress reporting
#[derive(Debug, Default)]
pub struct ProgressTracker {
    processed: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    subjects_total: AtomicU64,
    subjects_done: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub subjects_total: u64,
    pub subjects_done: u64,
}

impl ProgressSnapshot {
    /// Fraction of subjects finished, 0.0 until the subjects are known
    pub fn fraction(&self) -> f64 {
        if self.subjects_total == 0 {
            0.0
        } else {
            (self.subjects_done as f64 / self.subjects_total as f64).min(1.0)
        }
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subjects(&self, count: usize) {
        self.subjects_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn subject_done(&self) {
        self.subjects_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            subjects_total: self.subjects_total.load(Ordering::Relaxed),
            subjects_done: self.subjects_done.load(Ordering::Relaxed),
        }
    }
}

/// Counts and errors of one processor run
///
/// Counters only grow. A result made with [`WorkloadResult::tracked`] also
/// feeds a [`ProgressTracker`] as it goes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub processed: u64,
    pub failed: u64,
    pub bytes_transferred: u64,
    pub errors: Vec<ErrorDescriptor>,
    /// Errors counted but not kept once the descriptor list was full
    #[serde(default)]
    pub errors_dropped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    #[serde(skip)]
    progress: Option<Arc<ProgressTracker>>,
}

impl WorkloadResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracked(progress: Arc<ProgressTracker>) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, bytes: u64) {
        self.processed += 1;
        self.bytes_transferred += bytes;
        if let Some(progress) = &self.progress {
            progress.processed.fetch_add(1, Ordering::Relaxed);
            progress.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// One item failed; the traversal goes on
    pub fn record_failure(&mut self, item_id: &str, error: &MigrationError) {
        warn!(item = item_id, "Item failed: {}", error);
        self.failed += 1;
        if let Some(progress) = &self.progress {
            progress.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.push_error(item_id, error.to_string(), ErrorLevel::Item);
    }

    /// A whole subject could not be processed; not counted as an item
    pub fn record_subject_error(&mut self, subject_id: &str, error: &MigrationError) {
        warn!(subject = subject_id, "Subject skipped: {}", error);
        self.push_error(subject_id, error.to_string(), ErrorLevel::Subject);
    }

    pub fn record_workload_error(&mut self, workload: WorkloadKind, error: &MigrationError) {
        warn!(workload = %workload, "Workload failed: {}", error);
        self.push_error(workload.as_str(), error.to_string(), ErrorLevel::Workload);
    }

    fn push_error(&mut self, item_id: &str, message: String, level: ErrorLevel) {
        if self.errors.len() < MAX_ERROR_DESCRIPTORS {
            self.errors.push(ErrorDescriptor {
                item_id: item_id.to_string(),
                message,
                level,
            });
        } else {
            self.errors_dropped += 1;
        }
    }

    /// Fold another result into this one
    pub fn merge(&mut self, other: WorkloadResult) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.bytes_transferred += other.bytes_transferred;
        self.errors_dropped += other.errors_dropped;
        for error in other.errors {
            if self.errors.len() < MAX_ERROR_DESCRIPTORS {
                self.errors.push(error);
            } else {
                self.errors_dropped += 1;
            }
        }
        if self.stopped.is_none() {
            self.stopped = other.stopped;
        }
    }

    pub fn has_subject_errors(&self) -> bool {
        self.errors.iter().any(|e| e.level != ErrorLevel::Item)
    }
}

/// Where a run writes
#[derive(Clone)]
pub enum Destination {
    /// Migration into a second tenant
    Tenant(Arc<GraphClient>),
    /// Backup into a snapshot
    Snapshot(Arc<dyn SnapshotStore>),
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Tenant(client) => f.debug_tuple("Tenant").field(&client.tenant_id()).finish(),
            Destination::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

/// Everything a processor needs for one job run
#[derive(Debug, Clone)]
pub struct WorkloadContext {
    pub job_id: String,
    pub source: Arc<GraphClient>,
    pub destination: Destination,
    pub checkpoints: CheckpointScope,
    pub control: RunControl,
    pub transfer: ChunkedTransfer,
    pub options: JobOptions,
    /// Pause after every channel message write
    pub teams_message_delay: Duration,
    pub progress: Arc<ProgressTracker>,
}

impl WorkloadContext {
    pub fn is_backup(&self) -> bool {
        matches!(self.destination, Destination::Snapshot(_))
    }

    pub fn destination_client(&self) -> Result<&Arc<GraphClient>> {
        match &self.destination {
            Destination::Tenant(client) => Ok(client),
            Destination::Snapshot(_) => Err(MigrationError::StateError(
                "Destination tenant requested during a backup".to_string(),
            )),
        }
    }

    /// A result that feeds this run's progress counters
    pub fn new_result(&self) -> WorkloadResult {
        WorkloadResult::tracked(self.progress.clone())
    }

    /// Destination UPN for a source user
    pub fn destination_user(&self, subject: &Subject) -> String {
        subject
            .destination_id
            .clone()
            .unwrap_or_else(|| map_upn(&subject.source_id, &self.options.domain_mappings))
    }
}

/// One workload kind's traversal and transfer logic
#[async_trait]
pub trait WorkloadProcessor: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    /// Process every subject of `scope`
    ///
    /// Item and subject failures are recorded in the returned result.
    /// `Err` means the workload could not run at all.
    async fn process(&self, ctx: &WorkloadContext, scope: &Scope) -> Result<WorkloadResult>;
}

/// Processor lookup by workload kind
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<WorkloadKind, Arc<dyn WorkloadProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mail, files, sites and teams
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MailProcessor::new()));
        registry.register(Arc::new(FilesProcessor::new()));
        registry.register(Arc::new(SitesProcessor::new()));
        registry.register(Arc::new(TeamsProcessor::new()));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn WorkloadProcessor>) {
        self.processors.insert(processor.kind(), processor);
    }

    pub fn get(&self, kind: WorkloadKind) -> Option<Arc<dyn WorkloadProcessor>> {
        self.processors.get(&kind).cloned()
    }
}

/// Stop check between subjects; sets `stopped` when a stop was requested
pub(crate) fn stop_requested(ctx: &WorkloadContext, result: &mut WorkloadResult) -> bool {
    if ctx.control.is_stopped() {
        result.stopped = ctx.control.stop_reason();
        true
    } else {
        false
    }
}

/// Fold one subject's outcome into the result; `false` when the run must stop
pub(crate) fn settle_subject(
    ctx: &WorkloadContext,
    result: &mut WorkloadResult,
    subject_id: &str,
    outcome: Result<()>,
) -> bool {
    match outcome {
        Ok(()) => {}
        Err(MigrationError::Cancelled) => {
            result.stopped = ctx.control.stop_reason();
            return false;
        }
        Err(e) => result.record_subject_error(subject_id, &e),
    }
    ctx.progress.subject_done();
    true
}

/// Page-link enumeration of one collection with a checkpoint per page
///
/// The checkpoint after the last page is `Complete`, so a redelivered job
/// skips the collection.
pub(crate) struct PageWalk<T> {
    paginator: Paginator<T>,
    workload: WorkloadKind,
    subject_key: String,
    pages_completed: u64,
}

impl<T: DeserializeOwned + Send + 'static> PageWalk<T> {
    /// `None` when the collection was already finished by this job
    pub async fn open(
        ctx: &WorkloadContext,
        client: Arc<GraphClient>,
        workload: WorkloadKind,
        subject_key: &str,
        url: &str,
    ) -> Result<Option<Self>> {
        let class = workload.service_class();
        let (paginator, pages_completed) = match ctx.checkpoints.resume(workload, subject_key).await? {
            Resume::Fresh => (Paginator::new(client, class, url), 0),
            Resume::FromPage {
                next_link,
                pages_completed,
            } => {
                debug!(subject = subject_key, pages_completed, "Resuming page walk");
                (Paginator::new(client, class, next_link), pages_completed)
            }
            // Cursors of another kind of walk
            Resume::FromDelta { .. } | Resume::FromWalk { .. } => (Paginator::new(client, class, url), 0),
            Resume::Skip => {
                debug!(subject = subject_key, "Already complete, skipping");
                return Ok(None);
            }
        };

        Ok(Some(Self {
            paginator,
            workload,
            subject_key: subject_key.to_string(),
            pages_completed,
        }))
    }

    /// Next page of items; the stop check happens here, before the fetch
    pub async fn next_page(&mut self, ctx: &WorkloadContext) -> Result<Option<Vec<T>>> {
        ctx.control.checkpoint()?;
        Ok(self.paginator.next_page().await?.map(|page| page.value))
    }

    /// Record that the page returned last was fully processed
    pub async fn commit(&mut self, ctx: &WorkloadContext) -> Result<()> {
        self.pages_completed += 1;
        match self.paginator.next_link() {
            Some(next) => {
                ctx.checkpoints
                    .save_page(self.workload, &self.subject_key, next, self.pages_completed)
                    .await
            }
            None => {
                ctx.checkpoints
                    .save_complete(self.workload, &self.subject_key, self.pages_completed)
                    .await
            }
        }
    }
}

/// Delta enumeration of one collection with a checkpoint per page
///
/// Mid-pass pages store the next link; the terminal page stores the delta
/// link, which later runs resume from.
pub(crate) struct DeltaWalk<T> {
    paginator: DeltaPaginator<T>,
    workload: WorkloadKind,
    subject_key: String,
    pages_completed: u64,
    cursor: Option<DeltaCursor>,
    incremental: bool,
}

impl<T: DeserializeOwned + Send + 'static> DeltaWalk<T> {
    pub async fn open(
        ctx: &WorkloadContext,
        client: Arc<GraphClient>,
        workload: WorkloadKind,
        subject_key: &str,
        delta_url: &str,
    ) -> Result<Option<Self>> {
        let class = workload.service_class();
        let (paginator, pages_completed, incremental) =
            match ctx.checkpoints.resume(workload, subject_key).await? {
                Resume::Fresh | Resume::FromWalk { .. } => (DeltaPaginator::start(client, class, delta_url), 0, false),
                Resume::FromPage {
                    next_link,
                    pages_completed,
                } => (DeltaPaginator::resume(client, class, next_link), pages_completed, false),
                Resume::FromDelta { delta_link } => {
                    debug!(subject = subject_key, "Incremental pass from delta link");
                    (DeltaPaginator::resume(client, class, delta_link), 0, true)
                }
                Resume::Skip => return Ok(None),
            };

        Ok(Some(Self {
            paginator,
            workload,
            subject_key: subject_key.to_string(),
            pages_completed,
            cursor: None,
            incremental,
        }))
    }

    /// Whether this pass started from a stored delta link
    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub async fn next_page(&mut self, ctx: &WorkloadContext) -> Result<Option<Vec<T>>> {
        ctx.control.checkpoint()?;
        Ok(self.paginator.next_page().await?.map(|page| {
            self.cursor = Some(page.cursor);
            page.items
        }))
    }

    pub async fn commit(&mut self, ctx: &WorkloadContext) -> Result<()> {
        self.pages_completed += 1;
        match &self.cursor {
            Some(DeltaCursor::Next(next)) => {
                ctx.checkpoints
                    .save_page(self.workload, &self.subject_key, next, self.pages_completed)
                    .await
            }
            Some(DeltaCursor::Delta(delta)) => {
                ctx.checkpoints
                    .save_delta(self.workload, &self.subject_key, delta, self.pages_completed)
                    .await
            }
            None => Ok(()),
        }
    }
}

/// Users in scope, identified by UPN
pub(crate) async fn resolve_users(ctx: &WorkloadContext, scope: &Scope) -> Result<Vec<Subject>> {
    match scope {
        Scope::Explicit { users, .. } => Ok(users.clone()),
        Scope::All => {
            let users: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::General,
                "/users?$select=id,userPrincipalName&$top=999",
            )
            .collect_all()
            .await?;
            Ok(users
                .iter()
                .filter_map(|u| u["userPrincipalName"].as_str())
                .map(Subject::new)
                .collect())
        }
    }
}

pub(crate) async fn resolve_sites(ctx: &WorkloadContext, scope: &Scope) -> Result<Vec<Subject>> {
    match scope {
        Scope::Explicit { sites, .. } => Ok(sites.clone()),
        Scope::All => {
            let sites: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::Files,
                "/sites/getAllSites?$select=id,webUrl,displayName&$top=999",
            )
            .collect_all()
            .await?;
            Ok(sites
                .iter()
                // Personal sites are covered by the files workload
                .filter(|s| !s["webUrl"].as_str().unwrap_or_default().contains("-my.sharepoint."))
                .filter_map(|s| s["id"].as_str())
                .map(Subject::new)
                .collect())
        }
    }
}

pub(crate) async fn resolve_teams(ctx: &WorkloadContext, scope: &Scope) -> Result<Vec<Subject>> {
    match scope {
        Scope::Explicit { teams, .. } => Ok(teams.clone()),
        Scope::All => {
            let filter = encode_segment("resourceProvisioningOptions/Any(x:x eq 'Team')");
            let groups: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::General,
                format!("/groups?$filter={}&$select=id,displayName", filter),
            )
            .collect_all()
            .await?;
            Ok(groups
                .iter()
                .filter_map(|g| g["id"].as_str())
                .map(Subject::new)
                .collect())
        }
    }
}

/// Rewrite the domain of a UPN with the job's domain mappings
pub fn map_upn(upn: &str, mappings: &HashMap<String, String>) -> String {
    match upn.rsplit_once('@') {
        Some((local, domain)) => match mappings.get(&domain.to_ascii_lowercase()) {
            Some(mapped) => format!("{}@{}", local, mapped),
            None => upn.to_string(),
        },
        None => upn.to_string(),
    }
}

/// Remove server-owned properties before recreating an object elsewhere
///
/// Drops the named keys and every `@odata.*` annotation.
pub fn strip_fields(value: &mut Value, fields: &[&str]) {
    if let Value::Object(map) = value {
        map.retain(|key, _| !key.starts_with("@odata.") && !fields.contains(&key.as_str()));
    }
}

/// Size of a JSON document as stored or posted
pub fn document_size(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0)
}

/// Write a JSON document to the snapshot, or fail if this is not a backup
pub(crate) async fn store_document(ctx: &WorkloadContext, path: &str, document: &Value) -> Result<u64> {
    match &ctx.destination {
        Destination::Snapshot(store) => {
            store.put_document(path, document).await?;
            Ok(document_size(document))
        }
        Destination::Tenant(_) => Err(MigrationError::StateError(
            "Snapshot write attempted during a migration".to_string(),
        )),
    }
}
