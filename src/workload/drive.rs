//! Drive copy shared by the files, sites and teams workloads
//!
//! A full pass walks the drive pre-order: each folder's children are paged,
//! a subfolder is created in the destination (migration only) and walked
//! before its later siblings, files go through
//! [`ChunkedTransfer`](crate::transfer::ChunkedTransfer). The walk's stack
//! of open folders is checkpointed page by page.
//!
//! For a whole drive the pass ends with a delta checkpoint taken with
//! `root/delta?token=latest` *before* the walk started, so the next
//! incremental run sees every change made since. Folder-scoped walks
//! (a channel's files folder) cannot use delta and end with `Complete`.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{WorkloadContext, WorkloadKind, WorkloadResult};
use crate::checkpoint::{FolderFrame, Resume};
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::paginator::{DeltaCursor, DeltaPaginator, Page};
use crate::rate_limiter::ServiceClass;
use crate::snapshot::{SnapshotSink, SnapshotStore};
use crate::transfer::{DriveItemSource, UploadSessionSink};

/// Characters SharePoint and OneDrive refuse in item names
static INVALID_NAME_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"["*:<>?/\\|]"#).expect("valid name pattern"));

/// Replace characters the destination rejects; trailing dots and spaces go too
pub fn sanitize_name(name: &str) -> String {
    let cleaned = INVALID_NAME_CHARS.replace_all(name, "_");
    let trimmed = cleaned.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParentReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "driveId", default)]
    pub drive_id: Option<String>,
}

/// A drive item as enumerated from the source
#[derive(Debug, Clone, Deserialize)]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub folder: Option<Value>,
    #[serde(default)]
    pub file: Option<Value>,
    #[serde(default)]
    pub package: Option<Value>,
    #[serde(default)]
    pub deleted: Option<Value>,
    #[serde(default)]
    pub root: Option<Value>,
    #[serde(rename = "parentReference", default)]
    pub parent_reference: Option<ParentReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Container,
    Leaf,
    /// OneNote notebooks and other packages
    Package,
    Other,
}

impl DriveItem {
    pub fn kind(&self) -> ItemKind {
        if self.package.is_some() {
            ItemKind::Package
        } else if self.folder.is_some() {
            ItemKind::Container
        } else if self.file.is_some() {
            ItemKind::Leaf
        } else {
            ItemKind::Other
        }
    }

    fn parent_id(&self) -> Option<&str> {
        self.parent_reference.as_ref().and_then(|p| p.id.as_deref())
    }
}

/// Where a drive copy reads from
#[derive(Debug, Clone)]
pub struct DriveSource {
    pub client: Arc<GraphClient>,
    pub drive_id: String,
    /// `root` for a whole drive
    pub folder_id: String,
}

impl DriveSource {
    pub fn whole_drive(client: Arc<GraphClient>, drive_id: impl Into<String>) -> Self {
        Self {
            client,
            drive_id: drive_id.into(),
            folder_id: "root".to_string(),
        }
    }

    fn is_whole_drive(&self) -> bool {
        self.folder_id == "root"
    }
}

/// Where a drive copy writes to
#[derive(Clone)]
pub enum DriveTarget {
    Tenant {
        client: Arc<GraphClient>,
        drive_id: String,
        folder_id: String,
    },
    Snapshot {
        store: Arc<dyn SnapshotStore>,
        prefix: String,
    },
}

impl std::fmt::Debug for DriveTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveTarget::Tenant {
                drive_id, folder_id, ..
            } => write!(f, "Tenant({}/{})", drive_id, folder_id),
            DriveTarget::Snapshot { prefix, .. } => write!(f, "Snapshot({})", prefix),
        }
    }
}

impl DriveTarget {
    /// Destination folder id, or the snapshot path prefix
    fn location(&self) -> &str {
        match self {
            DriveTarget::Tenant { folder_id, .. } => folder_id,
            DriveTarget::Snapshot { prefix, .. } => prefix,
        }
    }

    /// The same destination, positioned at a stored location
    fn at(&self, location: &str) -> DriveTarget {
        match self {
            DriveTarget::Tenant { client, drive_id, .. } => DriveTarget::Tenant {
                client: client.clone(),
                drive_id: drive_id.clone(),
                folder_id: location.to_string(),
            },
            DriveTarget::Snapshot { store, .. } => DriveTarget::Snapshot {
                store: store.clone(),
                prefix: location.to_string(),
            },
        }
    }

    /// Target for a subfolder, creating it in a destination tenant
    async fn child(&self, name: &str) -> Result<DriveTarget> {
        match self {
            DriveTarget::Tenant {
                client,
                drive_id,
                folder_id,
            } => {
                let id = ensure_folder(client, drive_id, folder_id, name).await?;
                Ok(DriveTarget::Tenant {
                    client: client.clone(),
                    drive_id: drive_id.clone(),
                    folder_id: id,
                })
            }
            DriveTarget::Snapshot { store, prefix } => Ok(DriveTarget::Snapshot {
                store: store.clone(),
                prefix: join_path(prefix, name),
            }),
        }
    }

    /// Target for a folder path below this one, created segment by segment
    async fn descend(&self, path: &str, created: &mut HashMap<String, DriveTarget>) -> Result<DriveTarget> {
        let mut current = self.clone();
        let mut walked = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            walked = join_path(&walked, segment);
            current = match created.get(&walked) {
                Some(target) => target.clone(),
                None => {
                    let target = current.child(segment).await?;
                    created.insert(walked.clone(), target.clone());
                    target
                }
            };
        }
        Ok(current)
    }
}

fn item_id(value: &Value) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MigrationError::InvalidResponse("Drive item without id".to_string()))
}

/// Create a folder, or reuse the one that already has this name
pub async fn ensure_folder(client: &GraphClient, drive_id: &str, parent_id: &str, name: &str) -> Result<String> {
    let body = json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": "fail",
    });
    let path = format!("/drives/{}/items/{}/children", drive_id, parent_id);

    match client.post_json::<_, Value>(ServiceClass::Files, &path, &body).await {
        Ok(created) => item_id(&created),
        Err(MigrationError::Conflict(_)) => {
            debug!("Folder {} exists, reusing it", name);
            let existing: Value = client
                .get_json(
                    ServiceClass::Files,
                    &format!("/drives/{}/items/{}:/{}", drive_id, parent_id, encode_segment(name)),
                )
                .await?;
            item_id(&existing)
        }
        Err(e) => Err(e),
    }
}

async fn copy_file(ctx: &WorkloadContext, source: &DriveSource, item: &DriveItem, target: &DriveTarget) -> Result<u64> {
    let reader = DriveItemSource::new(source.client.clone(), &source.drive_id, &item.id, item.size);
    let name = sanitize_name(&item.name);

    match target {
        DriveTarget::Tenant {
            client,
            drive_id,
            folder_id,
        } => {
            let mut sink = UploadSessionSink::new(client.clone(), drive_id, folder_id, &name);
            ctx.transfer.transfer(&reader, &mut sink).await
        }
        DriveTarget::Snapshot { store, prefix } => {
            let mut sink = SnapshotSink::new(store.clone(), join_path(prefix, &name));
            ctx.transfer.transfer(&reader, &mut sink).await
        }
    }
}

fn unsupported(item: &DriveItem) -> MigrationError {
    MigrationError::UnsupportedItem(format!("{} is a package (e.g. a OneNote notebook)", item.name))
}

/// Copy one drive, or one folder of it, resuming from the subject's checkpoint
pub async fn copy_drive(
    ctx: &WorkloadContext,
    workload: WorkloadKind,
    subject_key: &str,
    source: &DriveSource,
    target: &DriveTarget,
    result: &mut WorkloadResult,
) -> Result<()> {
    let resume = ctx.checkpoints.resume(workload, subject_key).await?;
    let mut walk = FolderWalk {
        ctx,
        source,
        workload,
        subject_key,
        delta_link: None,
        stack: Vec::new(),
        pages_completed: 0,
    };

    match resume {
        Resume::Skip => {
            debug!(subject = subject_key, "Drive already copied by this job");
            return Ok(());
        }
        Resume::FromDelta { delta_link } if source.is_whole_drive() => {
            return copy_changes(ctx, workload, subject_key, source, target, delta_link, 0, result).await;
        }
        Resume::FromPage {
            next_link,
            pages_completed,
        } if source.is_whole_drive() => {
            return copy_changes(ctx, workload, subject_key, source, target, next_link, pages_completed, result)
                .await;
        }
        Resume::FromWalk {
            frames,
            delta_link,
            pages_completed,
        } if !frames.is_empty() => {
            info!(subject = subject_key, drive = %source.drive_id, pages_completed, "Resuming drive walk");
            walk.stack = frames
                .into_iter()
                .map(|frame| OpenFolder {
                    target: target.at(&frame.target),
                    frame,
                    page: None,
                })
                .collect();
            walk.delta_link = delta_link;
            walk.pages_completed = pages_completed;
        }
        _ => {
            if source.is_whole_drive() {
                walk.delta_link = Some(latest_delta_link(source).await?);
            }
            info!(subject = subject_key, drive = %source.drive_id, "Full drive pass");
            walk.stack.push(OpenFolder::new(source.folder_id.clone(), target.clone()));
        }
    }

    walk.run(result).await?;

    match &walk.delta_link {
        Some(link) => {
            ctx.checkpoints
                .save_delta(workload, subject_key, link, walk.pages_completed)
                .await
        }
        None => {
            ctx.checkpoints
                .save_complete(workload, subject_key, walk.pages_completed)
                .await
        }
    }
}

async fn latest_delta_link(source: &DriveSource) -> Result<String> {
    let page: Page<Value> = source
        .client
        .get_json(
            ServiceClass::Files,
            &format!("/drives/{}/root/delta?token=latest", source.drive_id),
        )
        .await?;
    page.delta_link
        .ok_or_else(|| MigrationError::InvalidResponse("token=latest returned no deltaLink".to_string()))
}

fn children_url(drive_id: &str, folder_id: &str) -> String {
    format!("/drives/{}/items/{}/children?$top=200", drive_id, folder_id)
}

/// A folder on the walk stack
struct OpenFolder {
    frame: FolderFrame,
    target: DriveTarget,
    /// Page being worked on, once fetched
    page: Option<Page<DriveItem>>,
}

impl OpenFolder {
    fn new(folder_id: String, target: DriveTarget) -> Self {
        Self {
            frame: FolderFrame::new(folder_id, target.location()),
            target,
            page: None,
        }
    }
}

/// Pre-order walk with an explicit stack of open folders
///
/// The stack is checkpointed after every finished page and on every
/// descent, so an interrupted walk continues inside the page it was on.
struct FolderWalk<'a> {
    ctx: &'a WorkloadContext,
    source: &'a DriveSource,
    workload: WorkloadKind,
    subject_key: &'a str,
    delta_link: Option<String>,
    stack: Vec<OpenFolder>,
    pages_completed: u64,
}

impl FolderWalk<'_> {
    async fn run(&mut self, result: &mut WorkloadResult) -> Result<()> {
        loop {
            let depth = self.stack.len();
            let Some(open) = self.stack.last_mut() else {
                return Ok(());
            };

            if open.page.is_none() {
                self.ctx.control.checkpoint()?;
                let link = open
                    .frame
                    .page_link
                    .clone()
                    .unwrap_or_else(|| children_url(&self.source.drive_id, &open.frame.folder_id));
                match self.source.client.get_json(ServiceClass::Files, &link).await {
                    Ok(page) => open.page = Some(page),
                    // A subfolder that cannot be listed fails alone
                    Err(e) if depth > 1 => {
                        if let Some(failed) = self.stack.pop() {
                            result.record_failure(&failed.frame.folder_id, &e);
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            let next_item = open
                .page
                .as_ref()
                .and_then(|page| page.value.get(open.frame.handled))
                .cloned();

            match next_item {
                Some(item) => {
                    open.frame.handled += 1;
                    let target = open.target.clone();
                    self.visit(item, target, result).await?;
                }
                None => {
                    let next_link = open.page.take().and_then(|page| page.next_link);
                    self.pages_completed += 1;
                    match next_link {
                        Some(link) => {
                            open.frame.page_link = Some(link);
                            open.frame.handled = 0;
                        }
                        None => {
                            self.stack.pop();
                        }
                    }
                    if !self.stack.is_empty() {
                        self.save().await?;
                    }
                }
            }
        }
    }

    async fn visit(&mut self, item: DriveItem, target: DriveTarget, result: &mut WorkloadResult) -> Result<()> {
        match item.kind() {
            ItemKind::Container => match target.child(&sanitize_name(&item.name)).await {
                Ok(child) => {
                    result.record_success(0);
                    self.stack.push(OpenFolder::new(item.id, child));
                    self.save().await?;
                }
                Err(e) => result.record_failure(&item.id, &e),
            },
            ItemKind::Leaf => match copy_file(self.ctx, self.source, &item, &target).await {
                Ok(bytes) => result.record_success(bytes),
                Err(e) => result.record_failure(&item.id, &e),
            },
            ItemKind::Package => result.record_failure(&item.id, &unsupported(&item)),
            ItemKind::Other => debug!("Skipping {} without file or folder facet", item.id),
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let frames = self.stack.iter().map(|open| open.frame.clone()).collect();
        self.ctx
            .checkpoints
            .save_walk(
                self.workload,
                self.subject_key,
                frames,
                self.delta_link.as_deref(),
                self.pages_completed,
            )
            .await
    }
}

/// Relative paths of source folders, looked up through the parent chain
struct PathResolver<'a> {
    source: &'a DriveSource,
    folders: HashMap<String, String>,
}

impl<'a> PathResolver<'a> {
    fn new(source: &'a DriveSource) -> Self {
        Self {
            source,
            folders: HashMap::new(),
        }
    }

    async fn folder_path(&mut self, folder_id: &str) -> Result<String> {
        let mut chain = Vec::new();
        let mut current = folder_id.to_string();

        let base = loop {
            if let Some(path) = self.folders.get(&current) {
                break path.clone();
            }
            let folder: DriveItem = self
                .source
                .client
                .get_json(
                    ServiceClass::Files,
                    &format!(
                        "/drives/{}/items/{}?$select=id,name,root,parentReference",
                        self.source.drive_id, current
                    ),
                )
                .await?;
            if folder.root.is_some() {
                self.folders.insert(current, String::new());
                break String::new();
            }
            let parent = folder.parent_id().map(str::to_string).ok_or_else(|| {
                MigrationError::InvalidResponse(format!("Folder {} has no parent reference", folder.id))
            })?;
            chain.push((current, folder.name));
            current = parent;
        };

        let mut path = base;
        for (id, name) in chain.into_iter().rev() {
            path = join_path(&path, &sanitize_name(&name));
            self.folders.insert(id, path.clone());
        }
        Ok(path)
    }

    /// Path of the item's parent folder
    async fn parent_path(&mut self, item: &DriveItem) -> Result<String> {
        match item.parent_id() {
            Some(parent) => self.folder_path(parent).await,
            None => Ok(String::new()),
        }
    }

    fn remember(&mut self, folder_id: &str, path: &str) {
        self.folders.insert(folder_id.to_string(), path.to_string());
    }
}

/// Apply the changes of a delta pass
///
/// Deletions become tombstones in a snapshot and are not propagated to a
/// destination tenant.
#[allow(clippy::too_many_arguments)]
async fn copy_changes(
    ctx: &WorkloadContext,
    workload: WorkloadKind,
    subject_key: &str,
    source: &DriveSource,
    target: &DriveTarget,
    link: String,
    mut pages_completed: u64,
    result: &mut WorkloadResult,
) -> Result<()> {
    info!(subject = subject_key, drive = %source.drive_id, "Incremental drive pass");
    let mut pages: DeltaPaginator<DriveItem> = DeltaPaginator::resume(source.client.clone(), ServiceClass::Files, link);
    let mut paths = PathResolver::new(source);
    let mut created = HashMap::new();

    loop {
        ctx.control.checkpoint()?;
        let Some(page) = pages.next_page().await? else {
            break;
        };

        for item in &page.items {
            if item.root.is_some() {
                continue;
            }
            if let Err(e) = apply_change(ctx, source, target, item, &mut paths, &mut created, result).await {
                result.record_failure(&item.id, &e);
            }
        }

        pages_completed += 1;
        match &page.cursor {
            DeltaCursor::Next(next) => {
                ctx.checkpoints
                    .save_page(workload, subject_key, next, pages_completed)
                    .await?
            }
            DeltaCursor::Delta(delta) => {
                ctx.checkpoints
                    .save_delta(workload, subject_key, delta, pages_completed)
                    .await?
            }
        }
    }
    Ok(())
}

async fn apply_change(
    ctx: &WorkloadContext,
    source: &DriveSource,
    target: &DriveTarget,
    item: &DriveItem,
    paths: &mut PathResolver<'_>,
    created: &mut HashMap<String, DriveTarget>,
    result: &mut WorkloadResult,
) -> Result<()> {
    if item.deleted.is_some() {
        if let DriveTarget::Snapshot { store, prefix } = target {
            let path = match paths.parent_path(item).await {
                Ok(parent) if !item.name.is_empty() => join_path(&parent, &sanitize_name(&item.name)),
                _ => item.id.clone(),
            };
            store.record_tombstone(&join_path(prefix, &path)).await?;
        }
        return Ok(());
    }

    let parent = paths.parent_path(item).await?;
    match item.kind() {
        ItemKind::Container => {
            let path = join_path(&parent, &sanitize_name(&item.name));
            paths.remember(&item.id, &path);
            target.descend(&path, created).await?;
            result.record_success(0);
        }
        ItemKind::Leaf => {
            let folder = target.descend(&parent, created).await?;
            let bytes = copy_file(ctx, source, item, &folder).await?;
            result.record_success(bytes);
        }
        ItemKind::Package => return Err(unsupported(item)),
        ItemKind::Other => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("report.docx"), "report.docx");
        assert_eq!(sanitize_name("a:b*c?.txt"), "a_b_c_.txt");
        assert_eq!(sanitize_name("quote\"pipe|.md"), "quote_pipe_.md");
        assert_eq!(sanitize_name("trailing. "), "trailing");
        assert_eq!(sanitize_name("..."), "_");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
        assert_eq!(join_path("a", ""), "a");
    }

    #[test]
    fn test_item_kind() {
        let item: DriveItem = serde_json::from_value(json!({"id": "1", "name": "f", "folder": {"childCount": 2}})).unwrap();
        assert_eq!(item.kind(), ItemKind::Container);

        let item: DriveItem = serde_json::from_value(json!({"id": "2", "name": "f.txt", "size": 10, "file": {}})).unwrap();
        assert_eq!(item.kind(), ItemKind::Leaf);
        assert_eq!(item.size, 10);

        let item: DriveItem =
            serde_json::from_value(json!({"id": "3", "name": "Notebook", "package": {"type": "oneNote"}, "folder": {}}))
                .unwrap();
        assert_eq!(item.kind(), ItemKind::Package);

        let item: DriveItem = serde_json::from_value(json!({"id": "4", "deleted": {"state": "deleted"}})).unwrap();
        assert_eq!(item.kind(), ItemKind::Other);
        assert!(item.deleted.is_some());
    }
}
