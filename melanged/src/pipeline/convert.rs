//! OBJ -> FBX conversion through the external headless transcoder.
//!
//! The transcoder is a renderer script run against a bundled base scene;
//! it prints a single JSON summary object on its last stdout line. A hard
//! timeout bounds the subprocess, and a failed conversion leaves neither
//! files nor an advanced FBX counter behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::fsio;
use melange_common::types::{ResourceKind, Uid, UidKind};
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::services::Services;

/// Result payload of a successful conversion.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConvertOutcome {
    pub source_uid: String,
    pub fbx_uid: String,
    pub fbx_path: String,
}

/// Convert a downloaded OBJ record to FBX.
///
/// Preconditions: the OBJ record exists in the registry and its metadata
/// marks the avatar as `R6`. R15 and Unknown rigs are rejected because
/// the bundled base scene only carries an R6 armature.
pub async fn convert_obj_to_fbx(services: &Services, obj_uid: &Uid) -> HubResult<ConvertOutcome> {
    if obj_uid.kind() != UidKind::Object {
        return Err(HubError::new(
            ErrorCode::InvalidUserInput,
            format!("{obj_uid} is not an obj UID"),
        ));
    }
    let obj_record = services.registry.get(obj_uid)?;

    let obj_dir = services.paths.object_3d_dir(obj_uid.as_str())?;
    let obj_path = obj_dir.join("avatar.obj");
    if !obj_path.exists() {
        return Err(HubError::new(
            ErrorCode::AssetNotFound,
            format!("OBJ file not found for {obj_uid}"),
        )
        .with_suggestion("ensure the avatar download completed successfully"));
    }

    let metadata_path = obj_dir.join("metadata.json");
    let metadata: Value = fsio::load_json(&metadata_path)?.ok_or_else(|| {
        HubError::new(
            ErrorCode::MetadataUnavailable,
            format!("metadata file not found for {obj_uid}"),
        )
        .with_suggestion("re-download the avatar to regenerate its metadata")
    })?;

    let avatar_type = metadata
        .get("avatar_type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    if avatar_type != "R6" {
        let username = metadata
            .pointer("/user_info/name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        return Err(HubError::new(
            ErrorCode::AvatarProcessingFailed,
            format!("only R6 avatars can be converted; this avatar is {avatar_type}"),
        )
        .with_details(serde_json::json!({
            "obj_uid": obj_uid.as_str(),
            "username": username,
            "avatar_type": avatar_type,
            "supported_types": ["R6"],
        }))
        .with_suggestion(format!(
            "{avatar_type} rigs have no matching base armature; pick an R6 avatar"
        )));
    }

    // Allocate the FBX identifier only after the preconditions hold, so a
    // rejection never burns a counter value.
    let fbx_uid = services.uids.next(UidKind::Fbx)?;
    let fbx_dir = services.paths.object_3d_dir(fbx_uid.as_str())?;

    let conversion = run_transcoder(services, &obj_path, &fbx_dir).await;
    let fbx_path = match conversion {
        Ok(path) => path,
        Err(err) => {
            rollback_conversion(services, &fbx_uid, &fbx_dir);
            return Err(err);
        }
    };
    if !fbx_path.exists() {
        rollback_conversion(services, &fbx_uid, &fbx_dir);
        return Err(HubError::new(
            ErrorCode::AvatarProcessingFailed,
            "transcoder reported success but produced no FBX file",
        ));
    }

    let username = metadata
        .pointer("/user_info/name")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let user_id = metadata
        .pointer("/user_info/id")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let fbx_file = fbx_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "avatar.fbx".to_string());
    let sidecar = serde_json::json!({
        "uid": fbx_uid.as_str(),
        "type": "fbx_model",
        "source": "roblox_conversion",
        "source_obj_uid": obj_uid.as_str(),
        "username": username.clone(),
        "user_id": user_id,
        "converted_at": Utc::now().to_rfc3339(),
        "fbx_file": fbx_file.clone(),
        "session_id": obj_record.session_id.clone(),
    });
    fsio::write_json_atomic(&fbx_dir.join("metadata.json"), &sidecar)?;

    let mut record_metadata = serde_json::Map::new();
    record_metadata.insert(
        "file_path".to_string(),
        Value::String(fbx_path.display().to_string()),
    );
    record_metadata.insert(
        "source".to_string(),
        serde_json::json!({
            "conversion_type": "roblox_obj_to_fbx",
            "source_obj_uid": obj_uid.as_str(),
            "username": username,
            "user_id": user_id,
        }),
    );
    services.registry.add(
        fbx_uid.clone(),
        ResourceKind::Object3d,
        fbx_file,
        obj_record.session_id.clone(),
        Some(obj_uid.clone()),
        record_metadata,
    )?;

    info!("conversion completed: {obj_uid} -> {fbx_uid}");
    Ok(ConvertOutcome {
        source_uid: obj_uid.as_str().to_string(),
        fbx_uid: fbx_uid.as_str().to_string(),
        fbx_path: fbx_path.display().to_string(),
    })
}

/// The rollback path: no record was published, so the counter can move
/// back and the half-made directory disappears.
fn rollback_conversion(services: &Services, fbx_uid: &Uid, fbx_dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(fbx_dir) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove conversion directory {}: {err}", fbx_dir.display());
        }
    }
    if services.registry.contains(fbx_uid) {
        warn!("skipping counter rollback, record exists for {fbx_uid}");
        return;
    }
    if let Err(err) = services.uids.rollback(UidKind::Fbx) {
        warn!("fbx counter rollback failed: {err}");
    }
}

/// Invoke the external transcoder and parse its JSON summary.
async fn run_transcoder(
    services: &Services,
    obj_path: &Path,
    output_dir: &Path,
) -> HubResult<PathBuf> {
    let pipeline = &services.config.pipeline;
    let mut command = Command::new(&pipeline.transcoder_path);
    command.arg("-b");
    if let Some(base_scene) = &pipeline.base_scene {
        command.arg(base_scene);
    }
    if let Some(script) = &pipeline.transcoder_script {
        command.arg("-P").arg(script);
    }
    command
        .arg("--")
        .arg(obj_path)
        .arg(output_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    info!(
        "running transcoder: {} {} -> {}",
        pipeline.transcoder_path.display(),
        obj_path.display(),
        output_dir.display()
    );

    let timeout = Duration::from_secs(pipeline.transcoder_timeout_secs);
    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(HubError::new(
                ErrorCode::AvatarProcessingFailed,
                format!(
                    "transcoder executable not found: {}",
                    pipeline.transcoder_path.display()
                ),
            )
            .with_suggestion("install the transcoder or set pipeline.transcoder_path"));
        }
        Ok(Err(err)) => {
            return Err(HubError::new(
                ErrorCode::AvatarProcessingFailed,
                format!("transcoder failed to start: {err}"),
            ));
        }
        Err(_) => {
            return Err(HubError::new(
                ErrorCode::JobTimeout,
                format!("transcoder timed out after {}s", timeout.as_secs()),
            )
            .with_suggestion("try a simpler avatar or raise pipeline.transcoder_timeout_secs"));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let summary = parse_summary_line(&stdout).ok_or_else(|| {
        HubError::new(
            ErrorCode::AvatarProcessingFailed,
            "transcoder did not print a JSON summary",
        )
        .with_details(serde_json::json!({
            "exit_code": output.status.code(),
            "stderr": String::from_utf8_lossy(&output.stderr).chars().take(2000).collect::<String>(),
        }))
    })?;

    if !summary.get("success").and_then(Value::as_bool).unwrap_or(false) {
        let message = summary
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(HubError::new(
            ErrorCode::AvatarProcessingFailed,
            format!("conversion failed: {message}"),
        )
        .with_details(summary.clone()));
    }

    summary
        .get("fbx_path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| {
            HubError::new(
                ErrorCode::AvatarProcessingFailed,
                "transcoder summary is missing fbx_path",
            )
        })
}

/// The summary is the last stdout line that parses as a JSON object;
/// the renderer chats freely on earlier lines.
fn parse_summary_line(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}
