//! SharePoint sites: document libraries and lists

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::drive::{copy_drive, DriveSource, DriveTarget};
use super::{
    document_size, resolve_sites, settle_subject, stop_requested, store_document, strip_fields, Destination,
    PageWalk, WorkloadContext, WorkloadKind, WorkloadProcessor, WorkloadResult,
};
use crate::error::{MigrationError, Result};
use crate::graph::GraphClient;
use crate::job::{Scope, Subject};
use crate::paginator::Paginator;
use crate::rate_limiter::ServiceClass;

/// List item fields SharePoint computes itself
const READ_ONLY_FIELDS: &[&str] = &[
    "id",
    "ContentType",
    "Created",
    "Modified",
    "Author",
    "Editor",
    "_UIVersionString",
    "Attachments",
    "Edit",
    "DocIcon",
    "ItemChildCount",
    "FolderChildCount",
    "AppAuthor",
    "AppEditor",
];

/// Whether a list item field can be written on create
pub fn is_writable_field(name: &str) -> bool {
    !(name.starts_with('_')
        || name.starts_with("@odata.")
        || name.starts_with("LinkTitle")
        || READ_ONLY_FIELDS.contains(&name))
}

/// Writable subset of a list item's fields
pub fn writable_fields(fields: &Value) -> Value {
    let map: Map<String, Value> = fields
        .as_object()
        .map(|m| {
            m.iter()
                .filter(|(name, _)| is_writable_field(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();
    Value::Object(map)
}

#[derive(Debug, Clone, Deserialize)]
struct Drive {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ListInfo {
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    template: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SiteList {
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(default)]
    list: Option<ListInfo>,
    #[serde(default)]
    system: Option<Value>,
}

impl SiteList {
    /// User-visible lists other than document libraries
    fn is_content_list(&self) -> bool {
        self.system.is_none()
            && self
                .list
                .as_ref()
                .map(|l| !l.hidden && l.template != "documentLibrary")
                .unwrap_or(false)
    }
}

fn id_of(value: &Value, what: &str) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MigrationError::InvalidResponse(format!("{} has no id", what)))
}

/// Server-relative path of a site URL, e.g. `/sites/hr`
fn server_relative_path(web_url: &str) -> &str {
    let without_scheme = web_url.split_once("://").map(|(_, rest)| rest).unwrap_or(web_url);
    match without_scheme.find('/') {
        Some(index) => &without_scheme[index..],
        None => "",
    }
}

#[derive(Debug, Default)]
pub struct SitesProcessor;

impl SitesProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Destination site for a source site: mapped id, else same path on the destination host
    async fn destination_site(&self, ctx: &WorkloadContext, client: &GraphClient, subject: &Subject) -> Result<String> {
        if let Some(id) = &subject.destination_id {
            return Ok(id.clone());
        }

        let source: Value = ctx
            .source
            .get_json(
                ServiceClass::Files,
                &format!("/sites/{}?$select=id,webUrl", subject.source_id),
            )
            .await?;
        let path = server_relative_path(source["webUrl"].as_str().unwrap_or_default()).to_string();

        let root: Value = client
            .get_json(ServiceClass::Files, "/sites/root?$select=siteCollection")
            .await?;
        let host = root["siteCollection"]["hostname"]
            .as_str()
            .ok_or_else(|| MigrationError::InvalidResponse("Root site without hostname".to_string()))?;

        let lookup = if path.is_empty() {
            format!("/sites/{}?$select=id", host)
        } else {
            format!("/sites/{}:{}?$select=id", host, path)
        };
        match client.get_json::<Value>(ServiceClass::Files, &lookup).await {
            Ok(site) => id_of(&site, "Destination site"),
            Err(MigrationError::NotFound(_)) => Err(MigrationError::DestinationNotFound(format!(
                "No site at {}{} in the destination tenant",
                host, path
            ))),
            Err(e) => Err(e),
        }
    }

    async fn site(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let destination_site = match &ctx.destination {
            Destination::Tenant(client) => Some(self.destination_site(ctx, client, subject).await?),
            Destination::Snapshot(_) => None,
        };

        self.libraries(ctx, subject, destination_site.as_deref(), result)
            .await?;
        self.lists(ctx, subject, destination_site.as_deref(), result)
            .await
    }

    async fn libraries(
        &self,
        ctx: &WorkloadContext,
        subject: &Subject,
        destination_site: Option<&str>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let drives: Vec<Drive> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Files,
            format!("/sites/{}/drives?$select=id,name", subject.source_id),
        )
        .collect_all()
        .await?;

        let destination_drives: Vec<Drive> = match (&ctx.destination, destination_site) {
            (Destination::Tenant(client), Some(site)) => {
                Paginator::new(
                    client.clone(),
                    ServiceClass::Files,
                    format!("/sites/{}/drives?$select=id,name", site),
                )
                .collect_all()
                .await?
            }
            _ => Vec::new(),
        };

        for drive in &drives {
            ctx.control.checkpoint()?;

            let target = match (&ctx.destination, destination_site) {
                (Destination::Tenant(client), Some(site)) => {
                    let drive_id = match destination_drives.iter().find(|d| d.name == drive.name) {
                        Some(existing) => existing.id.clone(),
                        None => match create_library(client, site, &drive.name).await {
                            Ok(id) => id,
                            Err(e) => {
                                result.record_failure(&drive.id, &e);
                                continue;
                            }
                        },
                    };
                    DriveTarget::Tenant {
                        client: client.clone(),
                        drive_id,
                        folder_id: "root".to_string(),
                    }
                }
                (Destination::Snapshot(store), _) => DriveTarget::Snapshot {
                    store: store.clone(),
                    prefix: format!("sites/{}/drives/{}", subject.source_id, drive.name),
                },
                (Destination::Tenant(_), None) => {
                    return Err(MigrationError::StateError("Destination site unresolved".to_string()))
                }
            };

            let source = DriveSource::whole_drive(ctx.source.clone(), drive.id.clone());
            let key = format!("{}/drives/{}", subject.source_id, drive.id);
            match copy_drive(ctx, WorkloadKind::Sites, &key, &source, &target, &mut *result).await {
                Ok(()) => {}
                Err(MigrationError::Cancelled) => return Err(MigrationError::Cancelled),
                Err(e) => result.record_failure(&drive.id, &e),
            }
        }
        Ok(())
    }

    async fn lists(
        &self,
        ctx: &WorkloadContext,
        subject: &Subject,
        destination_site: Option<&str>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let lists: Vec<SiteList> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Files,
            format!(
                "/sites/{}/lists?$select=id,displayName,name,list,system",
                subject.source_id
            ),
        )
        .collect_all()
        .await?;

        for list in lists.iter().filter(|l| l.is_content_list()) {
            ctx.control.checkpoint()?;

            let destination_list = match (&ctx.destination, destination_site) {
                (Destination::Tenant(client), Some(site)) => {
                    match ensure_list(ctx, client, &subject.source_id, site, list).await {
                        Ok(id) => Some((client, site, id)),
                        Err(e) => {
                            result.record_failure(&list.id, &e);
                            continue;
                        }
                    }
                }
                _ => None,
            };

            let key = format!("{}/lists/{}", subject.source_id, list.id);
            let url = format!(
                "/sites/{}/lists/{}/items?$expand=fields&$top=200",
                subject.source_id, list.id
            );
            let Some(mut walk) = PageWalk::<Value>::open(ctx, ctx.source.clone(), WorkloadKind::Sites, &key, &url).await?
            else {
                continue;
            };

            while let Some(items) = walk.next_page(ctx).await? {
                for item in items {
                    let item_id = item["id"].as_str().unwrap_or_default().to_string();
                    let outcome = match &destination_list {
                        Some((client, site, list_id)) => {
                            let body = json!({ "fields": writable_fields(&item["fields"]) });
                            client
                                .post(
                                    ServiceClass::Files,
                                    &format!("/sites/{}/lists/{}/items", site, list_id),
                                    &body,
                                )
                                .await
                                .map(|_| document_size(&body))
                        }
                        None => {
                            store_document(
                                ctx,
                                &format!("sites/{}/lists/{}/{}.json", subject.source_id, list.id, item_id),
                                &item,
                            )
                            .await
                        }
                    };
                    match outcome {
                        Ok(bytes) => result.record_success(bytes),
                        Err(e) => result.record_failure(&item_id, &e),
                    }
                }
                walk.commit(ctx).await?;
            }
        }
        Ok(())
    }
}

async fn create_library(client: &GraphClient, site: &str, name: &str) -> Result<String> {
    debug!("Creating document library {} in {}", name, site);
    let list: Value = client
        .post_json(
            ServiceClass::Files,
            &format!("/sites/{}/lists", site),
            &json!({ "displayName": name, "list": { "template": "documentLibrary" } }),
        )
        .await?;
    let list_id = id_of(&list, "Created library")?;
    let drive: Value = client
        .get_json(
            ServiceClass::Files,
            &format!("/sites/{}/lists/{}/drive?$select=id", site, list_id),
        )
        .await?;
    id_of(&drive, "Library drive")
}

/// Column properties the server assigns
const COLUMN_SERVER_FIELDS: &[&str] = &[
    "id",
    "isDeletable",
    "isReorderable",
    "isSealed",
    "propagateChanges",
    "sourceContentType",
];

/// Columns a list template does not bring along by itself
fn is_custom_column(column: &Value) -> bool {
    let flag = |name: &str| column[name].as_bool().unwrap_or(false);
    let name = column["name"].as_str().unwrap_or_default();
    !flag("readOnly")
        && !flag("hidden")
        && !flag("sealed")
        && name != "Title"
        && is_writable_field(name)
        && column["columnGroup"].as_str() != Some("_Hidden")
}

/// Destination list with the same display name, created with the source's custom columns if missing
async fn ensure_list(
    ctx: &WorkloadContext,
    client: &Arc<GraphClient>,
    source_site: &str,
    destination_site: &str,
    list: &SiteList,
) -> Result<String> {
    let existing: Vec<SiteList> = Paginator::new(
        client.clone(),
        ServiceClass::Files,
        format!("/sites/{}/lists?$select=id,displayName,list", destination_site),
    )
    .collect_all()
    .await?;
    if let Some(found) = existing.iter().find(|l| l.display_name == list.display_name) {
        return Ok(found.id.clone());
    }

    let columns: Vec<Value> = Paginator::new(
        ctx.source.clone(),
        ServiceClass::Files,
        format!("/sites/{}/lists/{}/columns", source_site, list.id),
    )
    .collect_all()
    .await?;
    let columns: Vec<Value> = columns
        .into_iter()
        .filter(is_custom_column)
        .map(|mut column| {
            strip_fields(&mut column, COLUMN_SERVER_FIELDS);
            column
        })
        .collect();

    let template = list
        .list
        .as_ref()
        .map(|l| l.template.clone())
        .unwrap_or_else(|| "genericList".to_string());
    debug!("Creating list {} with {} columns", list.display_name, columns.len());

    let created: Value = client
        .post_json(
            ServiceClass::Files,
            &format!("/sites/{}/lists", destination_site),
            &json!({
                "displayName": list.display_name,
                "columns": columns,
                "list": { "template": template },
            }),
        )
        .await?;
    id_of(&created, "Created list")
}

#[async_trait]
impl WorkloadProcessor for SitesProcessor {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Sites
    }

    async fn process(&self, ctx: &WorkloadContext, scope: &Scope) -> Result<WorkloadResult> {
        let sites = resolve_sites(ctx, scope).await?;
        info!(job = %ctx.job_id, "Processing {} sites", sites.len());

        let mut result = ctx.new_result();
        ctx.progress.add_subjects(sites.len());
        for subject in &sites {
            if stop_requested(ctx, &mut result) {
                break;
            }
            let outcome = self.site(ctx, subject, &mut result).await;
            if !settle_subject(ctx, &mut result, &subject.source_id, outcome) {
                break;
            }
        }
        Ok(result)
    }
}
