//! Microsoft Teams
//!
//! Per team: channels with their messages and replies, the channel files
//! folder and private channel members, then team members and the group's
//! planner plans. Channel message writes are charged to
//! [`ServiceClass::TeamsMessages`] and followed by the configured delay.
//!
//! The General channel always exists in the destination team and is
//! resolved through `primaryChannel`, never created.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::drive::{copy_drive, DriveSource, DriveTarget};
use super::{
    document_size, map_upn, resolve_teams, settle_subject, stop_requested, store_document, Destination,
    PageWalk, WorkloadContext, WorkloadKind, WorkloadProcessor, WorkloadResult,
};
use crate::checkpoint::Resume;
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::job::{Scope, Subject};
use crate::paginator::Paginator;
use crate::rate_limiter::ServiceClass;

const GRAPH_USERS_BIND: &str = "https://graph.microsoft.com/v1.0/users";
const GRAPH_GROUPS_URL: &str = "https://graph.microsoft.com/v1.0/groups";

fn str_field<'a>(value: &'a Value, name: &str) -> &'a str {
    value[name].as_str().unwrap_or_default()
}

fn id_of(value: &Value, what: &str) -> Result<String> {
    value["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MigrationError::InvalidResponse(format!("{} has no id", what)))
}

/// Regular, non-deleted chat messages; system events are not recreated
pub fn is_user_message(message: &Value) -> bool {
    str_field(message, "messageType") == "message" && message["deletedDateTime"].is_null()
}

/// Body for reposting a message, attributed to its original sender and time
pub fn repost_body(message: &Value) -> Value {
    let author = message["from"]["user"]["displayName"]
        .as_str()
        .or_else(|| message["from"]["application"]["displayName"].as_str())
        .unwrap_or("Unknown sender");
    let sent = str_field(message, "createdDateTime");
    let content = str_field(&message["body"], "content");

    let body = if str_field(&message["body"], "contentType") == "html" {
        json!({
            "contentType": "html",
            "content": format!("<p><b>{}</b> ({})</p>{}", author, sent, content),
        })
    } else {
        json!({
            "contentType": "text",
            "content": format!("{} ({}):\n{}", author, sent, content),
        })
    };

    let mut repost = json!({ "body": body });
    if let Some(subject) = message["subject"].as_str() {
        repost["subject"] = Value::String(subject.to_string());
    }
    repost
}

/// Membership request for a source member, with the UPN mapped to the destination
pub fn member_body(member: &Value, mappings: &HashMap<String, String>) -> Option<Value> {
    let email = member["email"].as_str().filter(|e| !e.is_empty())?;
    Some(json!({
        "@odata.type": "#microsoft.graph.aadUserConversationMember",
        "roles": member["roles"].clone(),
        "user@odata.bind": format!("{}('{}')", GRAPH_USERS_BIND, map_upn(email, mappings)),
    }))
}

/// Destination side of one team
struct TeamTarget<'a> {
    client: &'a Arc<GraphClient>,
    team_id: String,
    channels: Vec<Value>,
    primary_channel: String,
}

#[derive(Debug, Default)]
pub struct TeamsProcessor;

impl TeamsProcessor {
    pub fn new() -> Self {
        Self
    }

    async fn destination_team(&self, client: &GraphClient, subject: &Subject, display_name: &str) -> Result<String> {
        if let Some(id) = &subject.destination_id {
            return match client
                .get_json::<Value>(ServiceClass::Teams, &format!("/teams/{}?$select=id", id))
                .await
            {
                Ok(_) => Ok(id.clone()),
                Err(MigrationError::NotFound(_)) => {
                    Err(MigrationError::DestinationNotFound(format!("Team {}", id)))
                }
                Err(e) => Err(e),
            };
        }

        let filter = encode_segment(&format!("displayName eq '{}'", display_name.replace('\'', "''")));
        let page: crate::paginator::Page<Value> = client
            .get_json(
                ServiceClass::General,
                &format!(
                    "/groups?$filter={}&$select=id,displayName,resourceProvisioningOptions",
                    filter
                ),
            )
            .await?;
        page.value
            .iter()
            .find(|g| {
                g["resourceProvisioningOptions"]
                    .as_array()
                    .map(|options| options.iter().any(|o| o == "Team"))
                    .unwrap_or(false)
            })
            .map(|g| id_of(g, "Team group"))
            .unwrap_or_else(|| {
                Err(MigrationError::DestinationNotFound(format!(
                    "No team named {} in the destination tenant",
                    display_name
                )))
            })
    }

    async fn team(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let team_id = &subject.source_id;
        let team: Value = ctx
            .source
            .get_json(
                ServiceClass::General,
                &format!("/groups/{}?$select=id,displayName,description", team_id),
            )
            .await?;
        let display_name = str_field(&team, "displayName").to_string();

        let target = match &ctx.destination {
            Destination::Tenant(client) => {
                let destination_team = self.destination_team(client, subject, &display_name).await?;
                let channels: Vec<Value> = Paginator::new(
                    client.clone(),
                    ServiceClass::Teams,
                    format!("/teams/{}/channels", destination_team),
                )
                .collect_all()
                .await?;
                let primary: Value = client
                    .get_json(
                        ServiceClass::Teams,
                        &format!("/teams/{}/primaryChannel?$select=id", destination_team),
                    )
                    .await?;
                Some(TeamTarget {
                    client,
                    team_id: destination_team,
                    channels,
                    primary_channel: id_of(&primary, "Primary channel")?,
                })
            }
            Destination::Snapshot(_) => {
                store_document(ctx, &format!("teams/{}/team.json", team_id), &team).await?;
                None
            }
        };
        info!(team = %display_name, "Processing team");

        let channels: Vec<Value> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Teams,
            format!("/teams/{}/channels", team_id),
        )
        .collect_all()
        .await?;
        let primary: Value = ctx
            .source
            .get_json(
                ServiceClass::Teams,
                &format!("/teams/{}/primaryChannel?$select=id", team_id),
            )
            .await?;
        let primary_id = str_field(&primary, "id");

        for channel in &channels {
            ctx.control.checkpoint()?;
            let channel_id = str_field(channel, "id");

            let destination_channel = match &target {
                Some(target) => {
                    match self
                        .resolve_channel(ctx, team_id, target, channel, channel_id == primary_id)
                        .await
                    {
                        Ok(id) => Some(id),
                        Err(e) => {
                            result.record_failure(channel_id, &e);
                            continue;
                        }
                    }
                }
                None => {
                    store_document(
                        ctx,
                        &format!("teams/{}/channels/{}/channel.json", team_id, channel_id),
                        channel,
                    )
                    .await?;
                    None
                }
            };
            let destination = target.as_ref().zip(destination_channel.as_deref());

            self.channel_messages(ctx, team_id, channel_id, destination, result)
                .await?;
            self.channel_files(ctx, team_id, channel_id, destination, result)
                .await?;
            if str_field(channel, "membershipType") == "private" {
                self.channel_members(ctx, team_id, channel_id, destination, result)
                    .await?;
            }
        }

        self.team_members(ctx, team_id, target.as_ref(), result).await?;
        if !ctx.options.skip_planner {
            self.planner(ctx, team_id, target.as_ref(), result).await?;
        }
        Ok(())
    }

    /// Destination channel id: primary channel, same display name, or newly created
    async fn resolve_channel(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        target: &TeamTarget<'_>,
        channel: &Value,
        is_primary: bool,
    ) -> Result<String> {
        if is_primary {
            return Ok(target.primary_channel.clone());
        }

        let name = str_field(channel, "displayName");
        if let Some(existing) = target
            .channels
            .iter()
            .find(|c| str_field(c, "displayName").eq_ignore_ascii_case(name))
        {
            return id_of(existing, "Channel");
        }

        let membership = match str_field(channel, "membershipType") {
            "" => "standard",
            other => other,
        };
        let mut body = json!({
            "displayName": name,
            "description": channel["description"].clone(),
            "membershipType": membership,
        });

        if membership != "standard" {
            // Non-standard channels are created with at least one owner
            let members: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::Teams,
                format!("/teams/{}/channels/{}/members", team_id, str_field(channel, "id")),
            )
            .collect_all()
            .await?;
            let owners: Vec<Value> = members
                .iter()
                .filter(|m| {
                    m["roles"]
                        .as_array()
                        .map(|roles| roles.iter().any(|r| r == "owner"))
                        .unwrap_or(false)
                })
                .filter_map(|m| member_body(m, &ctx.options.domain_mappings))
                .collect();
            body["members"] = Value::Array(owners);
        }

        debug!("Creating channel {}", name);
        let created: Value = target
            .client
            .post_json(
                ServiceClass::Teams,
                &format!("/teams/{}/channels", target.team_id),
                &body,
            )
            .await?;
        id_of(&created, "Created channel")
    }

    async fn pace_message_writes(&self, ctx: &WorkloadContext) {
        if !ctx.teams_message_delay.is_zero() {
            tokio::time::sleep(ctx.teams_message_delay).await;
        }
    }

    async fn channel_messages(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        channel_id: &str,
        destination: Option<(&TeamTarget<'_>, &str)>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let key = format!("{}/{}/messages", team_id, channel_id);
        let url = format!("/teams/{}/channels/{}/messages?$top=50", team_id, channel_id);
        let Some(mut walk) = PageWalk::<Value>::open(ctx, ctx.source.clone(), WorkloadKind::Teams, &key, &url).await?
        else {
            return Ok(());
        };

        while let Some(messages) = walk.next_page(ctx).await? {
            for message in messages.iter().filter(|m| is_user_message(m)) {
                let message_id = str_field(message, "id");
                let replies: Vec<Value> = match Paginator::new(
                    ctx.source.clone(),
                    ServiceClass::Teams,
                    format!(
                        "/teams/{}/channels/{}/messages/{}/replies?$top=50",
                        team_id, channel_id, message_id
                    ),
                )
                .collect_all()
                .await
                {
                    Ok(replies) => replies,
                    Err(e) => {
                        result.record_failure(message_id, &e);
                        continue;
                    }
                };

                match destination {
                    Some((target, destination_channel)) => {
                        self.repost_thread(ctx, target, destination_channel, message, &replies, result)
                            .await
                    }
                    None => {
                        let thread = json!({ "message": message, "replies": replies });
                        match store_document(
                            ctx,
                            &format!(
                                "teams/{}/channels/{}/messages/{}.json",
                                team_id, channel_id, message_id
                            ),
                            &thread,
                        )
                        .await
                        {
                            Ok(bytes) => result.record_success(bytes),
                            Err(e) => result.record_failure(message_id, &e),
                        }
                    }
                }
            }
            walk.commit(ctx).await?;
        }
        Ok(())
    }

    async fn repost_thread(
        &self,
        ctx: &WorkloadContext,
        target: &TeamTarget<'_>,
        destination_channel: &str,
        message: &Value,
        replies: &[Value],
        result: &mut WorkloadResult,
    ) {
        let messages_path = format!(
            "/teams/{}/channels/{}/messages",
            target.team_id, destination_channel
        );
        let body = repost_body(message);
        let posted: Result<Value> = target
            .client
            .post_json(ServiceClass::TeamsMessages, &messages_path, &body)
            .await;
        self.pace_message_writes(ctx).await;

        let root_id = match posted.and_then(|p| id_of(&p, "Posted message")) {
            Ok(id) => {
                result.record_success(document_size(&body));
                id
            }
            Err(e) => {
                result.record_failure(str_field(message, "id"), &e);
                return;
            }
        };

        // Replies come newest first
        for reply in replies.iter().rev().filter(|r| is_user_message(r)) {
            let body = repost_body(reply);
            let outcome = target
                .client
                .post(
                    ServiceClass::TeamsMessages,
                    &format!("{}/{}/replies", messages_path, root_id),
                    &body,
                )
                .await;
            self.pace_message_writes(ctx).await;
            match outcome {
                Ok(()) => result.record_success(document_size(&body)),
                Err(e) => result.record_failure(str_field(reply, "id"), &e),
            }
        }
    }

    async fn channel_files(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        channel_id: &str,
        destination: Option<(&TeamTarget<'_>, &str)>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let item_id = format!("{}/files", channel_id);
        let (source_drive, source_folder) = match files_folder(&ctx.source, team_id, channel_id).await {
            Ok(folder) => folder,
            Err(MigrationError::NotFound(_)) => {
                debug!(channel = channel_id, "Channel has no files folder");
                return Ok(());
            }
            Err(e) => {
                result.record_failure(&item_id, &e);
                return Ok(());
            }
        };

        let outcome = async {
            let source = DriveSource {
                client: ctx.source.clone(),
                drive_id: source_drive,
                folder_id: source_folder,
            };
            let target = match destination {
                Some((target, destination_channel)) => {
                    let (drive_id, folder_id) =
                        files_folder(target.client, &target.team_id, destination_channel).await?;
                    DriveTarget::Tenant {
                        client: target.client.clone(),
                        drive_id,
                        folder_id,
                    }
                }
                None => match &ctx.destination {
                    Destination::Snapshot(store) => DriveTarget::Snapshot {
                        store: store.clone(),
                        prefix: format!("teams/{}/channels/{}/files", team_id, channel_id),
                    },
                    Destination::Tenant(_) => {
                        return Err(MigrationError::StateError("Destination channel unresolved".to_string()))
                    }
                },
            };
            let key = format!("{}/{}/files", team_id, channel_id);
            copy_drive(ctx, WorkloadKind::Teams, &key, &source, &target, &mut *result).await
        }
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(MigrationError::Cancelled) => Err(MigrationError::Cancelled),
            Err(e) => {
                result.record_failure(&item_id, &e);
                Ok(())
            }
        }
    }

    async fn channel_members(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        channel_id: &str,
        destination: Option<(&TeamTarget<'_>, &str)>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        let members: Vec<Value> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Teams,
            format!("/teams/{}/channels/{}/members", team_id, channel_id),
        )
        .collect_all()
        .await?;

        match destination {
            Some((target, destination_channel)) => {
                let path = format!(
                    "/teams/{}/channels/{}/members",
                    target.team_id, destination_channel
                );
                self.add_members(ctx, target.client, &path, &members, result).await;
                Ok(())
            }
            None => {
                let document = Value::Array(members);
                let bytes = store_document(
                    ctx,
                    &format!("teams/{}/channels/{}/members.json", team_id, channel_id),
                    &document,
                )
                .await?;
                result.record_success(bytes);
                Ok(())
            }
        }
    }

    async fn team_members(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        target: Option<&TeamTarget<'_>>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        ctx.control.checkpoint()?;
        let members: Vec<Value> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Teams,
            format!("/teams/{}/members", team_id),
        )
        .collect_all()
        .await?;

        match target {
            Some(target) => {
                let path = format!("/teams/{}/members", target.team_id);
                self.add_members(ctx, target.client, &path, &members, result).await;
            }
            None => {
                let document = Value::Array(members);
                let bytes = store_document(ctx, &format!("teams/{}/members.json", team_id), &document).await?;
                result.record_success(bytes);
            }
        }
        Ok(())
    }

    /// Add members one by one; an existing membership counts as done
    async fn add_members(
        &self,
        ctx: &WorkloadContext,
        client: &GraphClient,
        path: &str,
        members: &[Value],
        result: &mut WorkloadResult,
    ) {
        for member in members {
            let member_id = str_field(member, "id");
            let Some(body) = member_body(member, &ctx.options.domain_mappings) else {
                result.record_failure(
                    member_id,
                    &MigrationError::UnsupportedItem("Member without an email address".to_string()),
                );
                continue;
            };
            match client.post(ServiceClass::Teams, path, &body).await {
                Ok(()) | Err(MigrationError::Conflict(_)) => result.record_success(0),
                Err(e) => result.record_failure(member_id, &e),
            }
        }
    }

    async fn planner(
        &self,
        ctx: &WorkloadContext,
        team_id: &str,
        target: Option<&TeamTarget<'_>>,
        result: &mut WorkloadResult,
    ) -> Result<()> {
        ctx.control.checkpoint()?;
        let key = format!("{}/planner", team_id);
        if ctx.checkpoints.resume(WorkloadKind::Teams, &key).await? == Resume::Skip {
            return Ok(());
        }

        let plans: Vec<Value> = Paginator::new(
            ctx.source.clone(),
            ServiceClass::Teams,
            format!("/groups/{}/planner/plans", team_id),
        )
        .collect_all()
        .await?;

        for plan in &plans {
            let plan_id = str_field(plan, "id");
            let buckets: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::Teams,
                format!("/planner/plans/{}/buckets", plan_id),
            )
            .collect_all()
            .await?;
            let tasks: Vec<Value> = Paginator::new(
                ctx.source.clone(),
                ServiceClass::Teams,
                format!("/planner/plans/{}/tasks", plan_id),
            )
            .collect_all()
            .await?;

            match target {
                Some(target) => self.recreate_plan(target, plan, &buckets, &tasks, result).await,
                None => {
                    let document = json!({ "plan": plan, "buckets": buckets, "tasks": tasks });
                    match store_document(ctx, &format!("teams/{}/planner/{}.json", team_id, plan_id), &document)
                        .await
                    {
                        Ok(bytes) => result.record_success(bytes),
                        Err(e) => result.record_failure(plan_id, &e),
                    }
                }
            }
        }

        ctx.checkpoints
            .save_complete(WorkloadKind::Teams, &key, plans.len() as u64)
            .await
    }

    async fn recreate_plan(
        &self,
        target: &TeamTarget<'_>,
        plan: &Value,
        buckets: &[Value],
        tasks: &[Value],
        result: &mut WorkloadResult,
    ) {
        let plan_id = str_field(plan, "id");
        let created: Result<Value> = target
            .client
            .post_json(
                ServiceClass::Teams,
                "/planner/plans",
                &json!({
                    "container": { "url": format!("{}/{}", GRAPH_GROUPS_URL, target.team_id) },
                    "title": plan["title"].clone(),
                }),
            )
            .await;
        let new_plan = match created.and_then(|p| id_of(&p, "Created plan")) {
            Ok(id) => {
                result.record_success(0);
                id
            }
            Err(e) => {
                result.record_failure(plan_id, &e);
                return;
            }
        };

        let mut bucket_ids: HashMap<String, String> = HashMap::new();
        for bucket in buckets {
            let body = json!({
                "name": bucket["name"].clone(),
                "planId": new_plan,
                "orderHint": " !",
            });
            let created: Result<Value> = target
                .client
                .post_json(ServiceClass::Teams, "/planner/buckets", &body)
                .await;
            match created.and_then(|b| id_of(&b, "Created bucket")) {
                Ok(id) => {
                    bucket_ids.insert(str_field(bucket, "id").to_string(), id);
                    result.record_success(document_size(&body));
                }
                Err(e) => result.record_failure(str_field(bucket, "id"), &e),
            }
        }

        for task in tasks {
            let mut body = json!({
                "planId": new_plan,
                "title": task["title"].clone(),
            });
            if let Some(bucket) = bucket_ids.get(str_field(task, "bucketId")) {
                body["bucketId"] = Value::String(bucket.clone());
            }
            for field in ["dueDateTime", "startDateTime", "percentComplete", "priority"] {
                if !task[field].is_null() {
                    body[field] = task[field].clone();
                }
            }
            match target.client.post(ServiceClass::Teams, "/planner/tasks", &body).await {
                Ok(()) => result.record_success(document_size(&body)),
                Err(e) => result.record_failure(str_field(task, "id"), &e),
            }
        }
    }
}

/// Drive and folder behind a channel's Files tab
async fn files_folder(client: &GraphClient, team_id: &str, channel_id: &str) -> Result<(String, String)> {
    let folder: Value = client
        .get_json(
            ServiceClass::Teams,
            &format!("/teams/{}/channels/{}/filesFolder", team_id, channel_id),
        )
        .await?;
    let drive_id = folder["parentReference"]["driveId"]
        .as_str()
        .ok_or_else(|| MigrationError::InvalidResponse("Files folder without drive id".to_string()))?;
    Ok((drive_id.to_string(), id_of(&folder, "Files folder")?))
}

#[async_trait]
impl WorkloadProcessor for TeamsProcessor {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Teams
    }

    async fn process(&self, ctx: &WorkloadContext, scope: &Scope) -> Result<WorkloadResult> {
        let teams = resolve_teams(ctx, scope).await?;
        info!(job = %ctx.job_id, "Processing {} teams", teams.len());

        let mut result = ctx.new_result();
        ctx.progress.add_subjects(teams.len());
        for subject in &teams {
            if stop_requested(ctx, &mut result) {
                break;
            }
            let outcome = self.team(ctx, subject, &mut result).await;
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
    fn test_system_and_deleted_messages_are_skipped() {
        assert!(is_user_message(&json!({"messageType": "message", "deletedDateTime": null})));
        assert!(!is_user_message(&json!({"messageType": "systemEventMessage"})));
        assert!(!is_user_message(
            &json!({"messageType": "message", "deletedDateTime": "2024-01-01T00:00:00Z"})
        ));
    }

    #[test]
    fn test_repost_body_attributes_sender() {
        let message = json!({
            "id": "1",
            "createdDateTime": "2024-05-01T08:00:00Z",
            "from": {"user": {"displayName": "Alice"}},
            "subject": "Kickoff",
            "body": {"contentType": "html", "content": "<div>hello</div>"}
        });
        let body = repost_body(&message);
        assert_eq!(body["body"]["contentType"], "html");
        assert_eq!(
            body["body"]["content"],
            "<p><b>Alice</b> (2024-05-01T08:00:00Z)</p><div>hello</div>"
        );
        assert_eq!(body["subject"], "Kickoff");

        let text = repost_body(&json!({"body": {"contentType": "text", "content": "hi"}}));
        assert_eq!(text["body"]["content"], "Unknown sender ():\nhi");
        assert!(text.get("subject").is_none());
    }

    #[test]
    fn test_member_body_maps_domain() {
        let mut mappings = HashMap::new();
        mappings.insert("contoso.com".to_string(), "fabrikam.com".to_string());

        let member = json!({"id": "m1", "email": "alice@contoso.com", "roles": ["owner"]});
        let body = member_body(&member, &mappings).unwrap();
        assert_eq!(
            body["user@odata.bind"],
            "https://graph.microsoft.com/v1.0/users('alice@fabrikam.com')"
        );
        assert_eq!(body["roles"], json!(["owner"]));

        assert!(member_body(&json!({"id": "m2", "roles": []}), &mappings).is_none());
    }
}
