//! OneDrive for Business: one personal drive per user

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::drive::{copy_drive, DriveSource, DriveTarget};
use super::{
    resolve_users, settle_subject, stop_requested, Destination, WorkloadContext, WorkloadKind,
    WorkloadProcessor, WorkloadResult,
};
use crate::error::{MigrationError, Result};
use crate::graph::{encode_segment, GraphClient};
use crate::job::{Scope, Subject};
use crate::rate_limiter::ServiceClass;

#[derive(Debug, Default)]
pub struct FilesProcessor;

impl FilesProcessor {
    pub fn new() -> Self {
        Self
    }

    async fn user_drive(&self, ctx: &WorkloadContext, subject: &Subject, result: &mut WorkloadResult) -> Result<()> {
        let source_drive = drive_id(&ctx.source, &subject.source_id).await?;
        let source = DriveSource::whole_drive(ctx.source.clone(), source_drive);

        let target = match &ctx.destination {
            Destination::Tenant(client) => {
                let user = ctx.destination_user(subject);
                DriveTarget::Tenant {
                    client: client.clone(),
                    drive_id: drive_id(client, &user).await?,
                    folder_id: "root".to_string(),
                }
            }
            Destination::Snapshot(store) => DriveTarget::Snapshot {
                store: store.clone(),
                prefix: format!("files/{}", subject.source_id),
            },
        };

        copy_drive(ctx, WorkloadKind::Files, &subject.source_id, &source, &target, result).await
    }
}

/// Id of a user's OneDrive
async fn drive_id(client: &GraphClient, user: &str) -> Result<String> {
    let drive: Value = client
        .get_json(
            ServiceClass::Files,
            &format!("/users/{}/drive?$select=id", encode_segment(user)),
        )
        .await
        .map_err(|e| match e {
            MigrationError::NotFound(_) => {
                MigrationError::DestinationNotFound(format!("No OneDrive provisioned for {}", user))
            }
            other => other,
        })?;
    drive["id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MigrationError::InvalidResponse(format!("Drive of {} has no id", user)))
}

#[async_trait]
impl WorkloadProcessor for FilesProcessor {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Files
    }

    async fn process(&self, ctx: &WorkloadContext, scope: &Scope) -> Result<WorkloadResult> {
        let users = resolve_users(ctx, scope).await?;
        info!(job = %ctx.job_id, "Copying {} personal drives", users.len());

        let mut result = ctx.new_result();
        ctx.progress.add_subjects(users.len());
        for subject in &users {
            if stop_requested(ctx, &mut result) {
                break;
            }
            let outcome = self.user_drive(ctx, subject, &mut result).await;
            if !settle_subject(ctx, &mut result, &subject.source_id, outcome) {
                break;
            }
        }
        Ok(result)
    }
}
