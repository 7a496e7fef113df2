//! Exchange mailboxes
//!
//! Per user: mail folders (recursively) with their messages paged by delta,
//! then calendar events and contacts paged by next link. Every page ends
//! with a checkpoint keyed by user and collection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    document_size, resolve_users, settle_subject, stop_requested, store_document, strip_fields, DeltaWalk,
    Destination, PageWalk, WorkloadContext, WorkloadKind, WorkloadProcessor, WorkloadResult,
};
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::job::{Scope, Subject};
use crate::paginator::Paginator;
use crate::rate_limiter::ServiceClass;

/// Properties the server owns; sending them back on create is rejected or ignored
const MESSAGE_SERVER_FIELDS: &[&str] = &[
    "id",
    "changeKey",
    "parentFolderId",
    "conversationId",
    "conversationIndex",
    "webLink",
    "createdDateTime",
    "lastModifiedDateTime",
    "isDraft",
    "hasAttachments",
    "bodyPreview",
    "uniqueBody",
    "attachments@odata.context",
];

const ATTACHMENT_SERVER_FIELDS: &[&str] = &["id", "lastModifiedDateTime", "size"];

const EVENT_SERVER_FIELDS: &[&str] = &[
    "id",
    "changeKey",
    "iCalUId",
    "uid",
    "webLink",
    "createdDateTime",
    "lastModifiedDateTime",
    "seriesMasterId",
    "type",
    "isOrganizer",
    "responseStatus",
    "onlineMeeting",
    "calendar@odata.associationLink",
    "calendar@odata.navigationLink",
];

const CONTACT_SERVER_FIELDS: &[&str] = &[
    "id",
    "changeKey",
    "parentFolderId",
    "createdDateTime",
    "lastModifiedDateTime",
];

// MAPI properties that make a created message a received, non-draft item
const PR_MESSAGE_FLAGS: &str = "Integer 0x0E07";
const PR_MESSAGE_DELIVERY_TIME: &str = "SystemTime 0x0E06";
const PR_CLIENT_SUBMIT_TIME: &str = "SystemTime 0x0039";
const MSGFLAG_READ: u32 = 0x1;

#[derive(Debug, Clone, Deserialize)]
struct MailFolderEntry {
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(rename = "childFolderCount", default)]
    child_folder_count: u32,
}

/// A source folder with its place in the hierarchy
#[derive(Debug, Clone)]
struct MailFolder {
    id: String,
    display_name: String,
    parent_id: Option<String>,
    /// Display names from the top, `/`-joined
    path: String,
}

/// Source folders, parents always before their children
async fn list_folders(client: &Arc<GraphClient>, user: &str) -> Result<Vec<MailFolder>> {
    let top: Vec<MailFolderEntry> = Paginator::new(
        client.clone(),
        ServiceClass::Mail,
        format!("/users/{}/mailFolders?$top=100", user),
    )
    .collect_all()
    .await?;

    let mut folders = Vec::new();
    let mut pending: Vec<(MailFolderEntry, Option<String>, String)> =
        top.into_iter().map(|f| (f, None, String::new())).collect();
    pending.reverse();

    while let Some((entry, parent_id, parent_path)) = pending.pop() {
        let path = super::drive::join_path(&parent_path, &entry.display_name);
        if entry.child_folder_count > 0 {
            let children: Vec<MailFolderEntry> = Paginator::new(
                client.clone(),
                ServiceClass::Mail,
                format!("/users/{}/mailFolders/{}/childFolders?$top=100", user, entry.id),
            )
            .collect_all()
            .await?;
            for child in children.into_iter().rev() {
                pending.push((child, Some(entry.id.clone()), path.clone()));
            }
        }
        folders.push(MailFolder {
            id: entry.id,
            display_name: entry.display_name,
            parent_id,
            path,
        });
    }
    Ok(folders)
}

/// Find a destination folder by display name under `parent`, or create it
///
/// Well-known folders (Inbox, Sent Items, ...) always exist and are matched.
async fn ensure_mail_folder(client: &GraphClient, user: &str, parent: Option<&str>, name: &str) -> Result<String> {
    let collection = match parent {
        Some(parent) => format!("/users/{}/mailFolders/{}/childFolders", user, parent),
        None => format!("/users/{}/mailFolders", user),
    };

    let mut url = Some(format!("{}?$top=100", collection));
    while let Some(next) = url.take() {
        let page: crate::paginator::Page<MailFolderEntry> = client.get_json(ServiceClass::Mail, &next).await?;
        if let Some(found) = page
            .value
            .into_iter()
            .find(|f| f.display_name.eq_ignore_ascii_case(name))
        {
            return Ok(found.id);
        }
        url = page.next_link;
    }

    let created: Value = client
        .post_json(ServiceClass::Mail, &collection, &json!({ "displayName": name }))
        .await?;
    created["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MigrationError::InvalidResponse(format!("Created folder {} has no id", name)))
}

/// Turn a source message into a create request for the destination mailbox
pub fn prepare_message(mut message: Value) -> Value {
    let is_read = message["isRead"].as_bool().unwrap_or(true);
    let received = message["receivedDateTime"].as_str().map(str::to_string);
    let sent = message["sentDateTime"].as_str().map(str::to_string);

    strip_fields(&mut message, MESSAGE_SERVER_FIELDS);
    if let Some(Value::Array(attachments)) = message.get_mut("attachments") {
        for attachment in attachments.iter_mut() {
            // Keep the type annotation, it selects file vs item attachment
            let kind = attachment.get("@odata.type").cloned();
            strip_fields(attachment, ATTACHMENT_SERVER_FIELDS);
            if let (Some(kind), Value::Object(map)) = (kind, attachment) {
                map.insert("@odata.type".to_string(), kind);
            }
        }
    }

    let flags = if is_read { MSGFLAG_READ } else { 0 };
    let mut properties = vec![json!({ "id": PR_MESSAGE_FLAGS, "value": flags.to_string() })];
    if let Some(received) = received {
        properties.push(json!({ "id": PR_MESSAGE_DELIVERY_TIME, "value": received }));
    }
    if let Some(sent) = sent {
        properties.push(json!({ "id": PR_CLIENT_SUBMIT_TIME, "value": sent }));
    }
    message["singleValueExtendedProperties"] = Value::Array(properties);
    message
}

fn id_of(item: &Value) -> String {
    item["id"].as_str().unwrap_or_default().to_string()
}

#[derive(Debug, Default)]
pub struct MailProcessor;

impl MailProcessor {
    pub fn new() -> Self {
        Self
    }

    async fn mailbox(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let user = encode_segment(&subject.source_id);
        let destination_user = encode_segment(&ctx.destination_user(subject));
        let folders = list_folders(&ctx.source, &user).await?;
        debug!(user = %subject.source_id, "{} mail folders", folders.len());

        let mut mapped: HashMap<String, String> = HashMap::new();
        for folder in &folders {
            ctx.control.checkpoint()?;

            let destination_folder = match &ctx.destination {
                Destination::Tenant(client) => {
                    let parent = folder.parent_id.as_ref().and_then(|p| mapped.get(p)).map(String::as_str);
                    if folder.parent_id.is_some() && parent.is_none() {
                        // Folders are listed parents first, so the parent failed to map
                        result.record_subject_error(
                            &format!("{}/{}", subject.source_id, folder.id),
                            &MigrationError::DestinationNotFound(format!(
                                "Parent of mail folder {} was not created",
                                folder.path
                            )),
                        );
                        continue;
                    }
                    match ensure_mail_folder(client, &destination_user, parent, &folder.display_name).await {
                        Ok(id) => {
                            mapped.insert(folder.id.clone(), id.clone());
                            Some(id)
                        }
                        Err(e) => {
                            result.record_failure(&folder.id, &e);
                            continue;
                        }
                    }
                }
                Destination::Snapshot(_) => None,
            };

            self.messages(ctx, subject, folder, destination_folder.as_deref(), result)
                .await?;
        }

        self.events(ctx, subject, result).await?;
        self.contacts(ctx, subject, result).await
    }

    async fn messages(
        &self,
        ctx: &WorkloadContext,
        subject: &Subject,
        folder: &MailFolder,
        destination_folder: Option<&str>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let user = encode_segment(&subject.source_id);
        let key = format!("{}/{}", subject.source_id, folder.id);
        let url = format!("/users/{}/mailFolders/{}/messages/delta", user, folder.id);

        let Some(mut walk) = DeltaWalk::<Value>::open(ctx, ctx.source.clone(), WorkloadKind::Mail, &key, &url).await?
        else {
            return Ok(());
        };

        while let Some(messages) = walk.next_page(ctx).await? {
            for message in messages {
                let id = id_of(&message);
                if message.get("@removed").is_some() {
                    if let Destination::Snapshot(store) = &ctx.destination {
                        store
                            .record_tombstone(&format!("mail/{}/{}/{}.json", subject.source_id, folder.path, id))
                            .await?;
                    }
                    continue;
                }

                match self
                    .copy_message(ctx, subject, folder, destination_folder, message)
                    .await
                {
                    Ok(bytes) => result.record_success(bytes),
                    Err(e) => result.record_failure(&id, &e),
                }
            }
            walk.commit(ctx).await?;
        }
        Ok(())
    }

    async fn copy_message(
        &self,
        ctx: &WorkloadContext,
        subject: &Subject,
        folder: &MailFolder,
        destination_folder: Option<&str>,
        message: Value,
    ) -> Result<u64> {
        let id = id_of(&message);
        let message = if message["hasAttachments"].as_bool() == Some(true) {
            ctx.source
                .get_json(
                    ServiceClass::Mail,
                    &format!(
                        "/users/{}/messages/{}?$expand=attachments",
                        encode_segment(&subject.source_id),
                        id
                    ),
                )
                .await?
        } else {
            message
        };

        match (&ctx.destination, destination_folder) {
            (Destination::Tenant(client), Some(destination_folder)) => {
                let body = prepare_message(message);
                let _: Value = client
                    .post_json(
                        ServiceClass::Mail,
                        &format!(
                            "/users/{}/mailFolders/{}/messages",
                            encode_segment(&ctx.destination_user(subject)),
                            destination_folder
                        ),
                        &body,
                    )
                    .await?;
                Ok(document_size(&body))
            }
            _ => {
                store_document(
                    ctx,
                    &format!("mail/{}/{}/{}.json", subject.source_id, folder.path, id),
                    &message,
                )
                .await
            }
        }
    }

    async fn events(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let user = encode_segment(&subject.source_id);
        let key = format!("{}/events", subject.source_id);
        let Some(mut walk) = PageWalk::<Value>::open(
            ctx,
            ctx.source.clone(),
            WorkloadKind::Mail,
            &key,
            &format!("/users/{}/events?$top=50", user),
        )
        .await?
        else {
            return Ok(());
        };

        while let Some(events) = walk.next_page(ctx).await? {
            for mut event in events {
                let id = id_of(&event);
                let outcome = match &ctx.destination {
                    Destination::Tenant(client) => {
                        strip_fields(&mut event, EVENT_SERVER_FIELDS);
                        // Exchange drops a second create with the same transaction id
                        event["transactionId"] = Value::String(id.clone());
                        let path = format!("/users/{}/events", encode_segment(&ctx.destination_user(subject)));
                        client
                            .post(ServiceClass::Mail, &path, &event)
                            .await
                            .map(|_| document_size(&event))
                    }
                    Destination::Snapshot(_) => {
                        store_document(ctx, &format!("mail/{}/events/{}.json", subject.source_id, id), &event).await
                    }
                };
                match outcome {
                    Ok(bytes) => result.record_success(bytes),
                    Err(e) => result.record_failure(&id, &e),
                }
            }
            walk.commit(ctx).await?;
        }
        Ok(())
    }

    async fn contacts(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let user = encode_segment(&subject.source_id);
        let key = format!("{}/contacts", subject.source_id);
        let Some(mut walk) = PageWalk::<Value>::open(
            ctx,
            ctx.source.clone(),
            WorkloadKind::Mail,
            &key,
            &format!("/users/{}/contacts?$top=100", user),
        )
        .await?
        else {
            return Ok(());
        };

        while let Some(contacts) = walk.next_page(ctx).await? {
            for mut contact in contacts {
                let id = id_of(&contact);
                let outcome = match &ctx.destination {
                    Destination::Tenant(client) => {
                        strip_fields(&mut contact, CONTACT_SERVER_FIELDS);
                        let path = format!("/users/{}/contacts", encode_segment(&ctx.destination_user(subject)));
                        client
                            .post(ServiceClass::Mail, &path, &contact)
                            .await
                            .map(|_| document_size(&contact))
                    }
                    Destination::Snapshot(_) => {
                        store_document(ctx, &format!("mail/{}/contacts/{}.json", subject.source_id, id), &contact)
                            .await
                    }
                };
                match outcome {
                    Ok(bytes) => result.record_success(bytes),
                    Err(e) => result.record_failure(&id, &e),
                }
            }
            walk.commit(ctx).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadProcessor for MailProcessor {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Mail
    }

    async fn process(&self, ctx: &WorkloadContext, scope: &Scope) -> Result<WorkloadResult> {
        let users = resolve_users(ctx, scope).await?;
        info!(job = %ctx.job_id, "Processing {} mailboxes", users.len());

        let mut result = ctx.new_result();
        ctx.progress.add_subjects(users.len());
        for subject in &users {
            if stop_requested(ctx, &mut result) {
                break;
            }
            let outcome = self.mailbox(ctx, subject, &mut result).await;
            if !settle_subject(ctx, &mut result, &subject.source_id, outcome) {
                break;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_message_strips_server_fields_and_marks_received() {
        let message = json!({
            "id": "AAMk1",
            "@odata.etag": "W/\"x\"",
            "changeKey": "ck",
            "parentFolderId": "inbox",
            "subject": "Quarterly numbers",
            "isRead": false,
            "isDraft": false,
            "receivedDateTime": "2024-03-01T10:00:00Z",
            "sentDateTime": "2024-03-01T09:59:00Z",
            "body": {"contentType": "html", "content": "<p>hi</p>"},
            "attachments": [{
                "@odata.type": "#microsoft.graph.fileAttachment",
                "id": "att1",
                "size": 12,
                "name": "a.txt",
                "contentBytes": "aGVsbG8="
            }]
        });

        let prepared = prepare_message(message);
        assert!(prepared.get("id").is_none());
        assert!(prepared.get("changeKey").is_none());
        assert!(prepared.get("@odata.etag").is_none());
        assert!(prepared.get("isDraft").is_none());
        assert_eq!(prepared["subject"], "Quarterly numbers");

        let attachment = &prepared["attachments"][0];
        assert!(attachment.get("id").is_none());
        assert_eq!(attachment["@odata.type"], "#microsoft.graph.fileAttachment");
        assert_eq!(attachment["contentBytes"], "aGVsbG8=");

        let properties = prepared["singleValueExtendedProperties"].as_array().unwrap();
        assert_eq!(properties[0], json!({"id": PR_MESSAGE_FLAGS, "value": "0"}));
        assert_eq!(properties[1]["value"], "2024-03-01T10:00:00Z");
        assert_eq!(properties[2]["id"], PR_CLIENT_SUBMIT_TIME);
    }

    #[test]
    fn test_prepare_message_defaults_to_read() {
        let prepared = prepare_message(json!({"subject": "x"}));
        let properties = prepared["singleValueExtendedProperties"].as_array().unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0]["value"], "1");
    }
}
