//! Avatar pipeline plugin: download, convert, import, and the composite
//! download-and-import command.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::types::{CommandResult, Uid, UidKind};
use serde_json::{Value, json};

use super::{Capability, CommandOutcome, PluginHealth, PluginMetadata, ToolPlugin, Validation};
use crate::pipeline;
use crate::services::Services;

pub struct AvatarPipelinePlugin {
    services: Arc<Services>,
}

impl AvatarPipelinePlugin {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn validate_user_input(params: &Value, errors: &mut Vec<String>) {
        let Some(user_input) = params.get("user_input").and_then(Value::as_str) else {
            errors.push("user_input is required (platform user id or username)".to_string());
            return;
        };
        let cleaned = pipeline::scrub_user_input(user_input);
        if cleaned.is_empty() {
            errors.push("user_input cannot be empty".to_string());
        } else if cleaned.len() > 50 {
            errors.push("user_input is too long (max 50 characters)".to_string());
        } else if !cleaned
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            errors.push(
                "user_input must contain only letters, numbers, underscores, and hyphens"
                    .to_string(),
            );
        }
    }

    fn validate_uid(params: &Value, kinds: &[UidKind], errors: &mut Vec<String>) {
        let key = if params.get("obj_uid").is_some() {
            "obj_uid"
        } else {
            "uid"
        };
        match params.get(key).and_then(Value::as_str) {
            Some(uid) => match Uid::parse(uid) {
                Ok(parsed) if kinds.contains(&parsed.kind()) => {}
                Ok(parsed) => errors.push(format!(
                    "{key} has kind {}, expected one of {:?}",
                    parsed.kind(),
                    kinds.iter().map(|k| k.prefix()).collect::<Vec<_>>()
                )),
                Err(_) => errors.push(format!("{key} is not a valid UID")),
            },
            None => errors.push(format!("{key} is required")),
        }
    }

    fn status_payload(&self, uid: &Uid) -> HubResult<Value> {
        let job = self
            .services
            .jobs
            .get_by_target(uid)
            .ok_or_else(|| HubError::job_not_found(uid.as_str()))?;
        let mut payload = json!({
            "success": true,
            "uid": uid.as_str(),
            "status": job.status.to_string(),
            "progress": job.progress,
            "phase": job.phase,
            "elapsed_seconds": job.elapsed_seconds(Utc::now()),
        });
        if let Some(result) = &job.result {
            payload["result"] = result.clone();
        }
        if let Some(error) = &job.error {
            payload["error"] = serde_json::to_value(error)?;
        }
        Ok(payload)
    }
}

#[async_trait]
impl ToolPlugin for AvatarPipelinePlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            tool_id: "avatar_pipeline",
            display_name: "Avatar Pipeline",
            version: "1.7.0",
            capabilities: vec![Capability::Mesh3dCreation],
            requires_connection: true,
            pricing_tier: "free",
        }
    }

    fn supported_commands(&self) -> Vec<&'static str> {
        vec![
            "download_roblox_obj",
            "get_roblox_download_status",
            "cancel_roblox_download",
            "convert_roblox_obj_to_fbx",
            "import_object3d_by_uid",
            "download_and_import_roblox_avatar",
        ]
    }

    async fn health_check(&self) -> PluginHealth {
        // Downloads need no credentials; import availability is probed at
        // dispatch time against the editor.
        PluginHealth::Available
    }

    fn validate(&self, command_type: &str, params: &Value) -> Validation {
        let mut errors = Vec::new();
        match command_type {
            "download_roblox_obj" | "download_and_import_roblox_avatar" => {
                Self::validate_user_input(params, &mut errors);
            }
            "get_roblox_download_status" | "cancel_roblox_download" => {
                Self::validate_uid(params, &[UidKind::Object, UidKind::Video], &mut errors);
            }
            "convert_roblox_obj_to_fbx" => {
                Self::validate_uid(params, &[UidKind::Object], &mut errors);
            }
            "import_object3d_by_uid" => {
                Self::validate_uid(params, &[UidKind::Object, UidKind::Fbx], &mut errors);
            }
            other => errors.push(format!("unknown avatar command: {other}")),
        }
        Validation::from_errors(errors)
    }

    async fn preprocess(&self, command_type: &str, mut params: Value) -> HubResult<Value> {
        if matches!(
            command_type,
            "download_roblox_obj" | "download_and_import_roblox_avatar"
        ) {
            if let Some(user_input) = params.get("user_input").and_then(Value::as_str) {
                params["user_input"] = json!(pipeline::scrub_user_input(user_input));
            }
        }
        Ok(params)
    }

    async fn execute(&self, command_type: &str, params: Value) -> HubResult<CommandOutcome> {
        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        match command_type {
            "download_roblox_obj" => {
                let user_input = params["user_input"].as_str().unwrap_or_default();
                let start =
                    pipeline::start_download(&self.services, user_input, session_id).await?;
                Ok(CommandOutcome::Immediate(CommandResult::ok(json!({
                    "uid": start.uid.as_str(),
                    "status": "queued",
                    "message": format!("Avatar download queued for '{user_input}'"),
                    "estimated_time": "2-5 minutes",
                    "poll_url": format!("/api/roblox-status/{}", start.uid),
                    "cleanup_info": start.cleanup,
                    "job_id": start.job.job_id,
                }))))
            }
            "get_roblox_download_status" => {
                let uid = Uid::parse(params["uid"].as_str().unwrap_or_default())?;
                let payload = self.status_payload(&uid)?;
                Ok(CommandOutcome::Immediate(CommandResult::ok(payload)))
            }
            "cancel_roblox_download" => {
                let uid = Uid::parse(params["uid"].as_str().unwrap_or_default())?;
                match self.services.jobs.cancel_by_target(&uid) {
                    Some(job) => Ok(CommandOutcome::Immediate(CommandResult::ok(json!({
                        "uid": uid.as_str(),
                        "status": "cancelled",
                        "job_id": job.job_id,
                        "message": format!("download for {uid} has been cancelled"),
                    })))),
                    None => Err(HubError::job_not_found(uid.as_str())
                        .with_suggestion("the job may have already completed or been cleaned up")),
                }
            }
            "convert_roblox_obj_to_fbx" => {
                let obj_uid = Uid::parse(params["obj_uid"].as_str().unwrap_or_default())?;
                let outcome = pipeline::convert::convert_obj_to_fbx(&self.services, &obj_uid).await?;
                Ok(CommandOutcome::Immediate(CommandResult::ok(
                    serde_json::to_value(outcome)?,
                )))
            }
            "import_object3d_by_uid" => {
                let uid = Uid::parse(params["uid"].as_str().unwrap_or_default())?;
                let result = pipeline::import_by_uid(&self.services, &uid).await?;
                Ok(CommandOutcome::Immediate(CommandResult::ok(result)))
            }
            "download_and_import_roblox_avatar" => {
                let user_input = params["user_input"].as_str().unwrap_or_default();
                let result =
                    pipeline::run_full_pipeline(&self.services, user_input, session_id).await?;
                Ok(CommandOutcome::Immediate(CommandResult::ok(result)))
            }
            other => Err(HubError::new(
                ErrorCode::UnknownCommand,
                format!("unsupported avatar command: {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_input_rules() {
        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_user_input(&json!({"user_input": "Builderman"}), &mut errors);
        assert!(errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_user_input(&json!({"user_input": "@Builderman"}), &mut errors);
        assert!(errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_user_input(&json!({"user_input": ""}), &mut errors);
        assert!(!errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_user_input(
            &json!({"user_input": "has spaces!"}),
            &mut errors,
        );
        assert!(!errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_user_input(
            &json!({"user_input": "x".repeat(51)}),
            &mut errors,
        );
        assert!(!errors.is_empty());
    }

    #[test]
    fn uid_kind_rules() {
        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_uid(
            &json!({"obj_uid": "obj_001"}),
            &[UidKind::Object],
            &mut errors,
        );
        assert!(errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_uid(
            &json!({"obj_uid": "img_001"}),
            &[UidKind::Object],
            &mut errors,
        );
        assert!(!errors.is_empty());

        let mut errors = Vec::new();
        AvatarPipelinePlugin::validate_uid(&json!({}), &[UidKind::Object], &mut errors);
        assert!(!errors.is_empty());
    }
}
