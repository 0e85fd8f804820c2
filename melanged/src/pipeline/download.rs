//! The phased avatar download worker.
//!
//! Phases and their progress ranges:
//!
//! | phase                | range     |
//! |----------------------|-----------|
//! | resolving_user       | 0 -> 10   |
//! | fetching_metadata    | 10 -> 25  |
//! | downloading_model    | 25 -> 70  |
//! | downloading_textures | 70 -> 85  |
//! | processing_files     | 85 -> 100 |
//!
//! Every phase boundary is a cancellation checkpoint. On cancellation or
//! failure the partially written download folder is removed and no
//! registry record is published; the orchestrator decides whether the
//! counter can be rolled back.

use std::path::Path;

use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::filename;
use melange_common::fsio;
use melange_common::types::{ResourceKind, Uid};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::jobs::JobHandle;
use crate::pipeline::obj::{analyze_obj, infer_rig};
use crate::providers::roblox::{Avatar3dMetadata, AvatarUser};
use crate::services::Services;

/// Execute the download job for `uid`. Returns the job result payload.
pub async fn run_download(
    services: &Services,
    handle: &JobHandle,
    uid: &Uid,
    user_input: &str,
    session_id: Option<&str>,
) -> HubResult<Value> {
    let download_dir = services.paths.object_3d_dir(uid.as_str())?;
    let result = download_phases(services, handle, uid, user_input, session_id, &download_dir).await;

    if result.is_err() {
        // Leave nothing half-written behind a failed or cancelled job.
        if let Err(err) = std::fs::remove_dir_all(&download_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to clean up download folder {}: {err}",
                    download_dir.display()
                );
            }
        }
    }
    result
}

async fn download_phases(
    services: &Services,
    handle: &JobHandle,
    uid: &Uid,
    user_input: &str,
    session_id: Option<&str>,
    download_dir: &Path,
) -> HubResult<Value> {
    // Phase 1: resolve the user id or handle.
    handle.check_cancelled()?;
    handle.set_progress("resolving_user", 0);
    let user = resolve_user(services, user_input).await?;
    handle.set_progress("resolving_user", 10);
    info!("resolved '{user_input}' to {} (id {})", user.name, user.id);

    // Phase 2: fetch the 3D metadata (the provider polls internally).
    handle.check_cancelled()?;
    handle.set_progress("fetching_metadata", 10);
    let metadata = services.avatars.avatar_3d_metadata(user.id).await?;
    let declared_type = services
        .avatars
        .avatar_type(user.id)
        .await
        .unwrap_or_else(|err| {
            warn!("avatar config unavailable for {}: {err}", user.id);
            "Unknown".to_string()
        });
    handle.set_progress("fetching_metadata", 25);

    // Phase 3: model files. The OBJ is mandatory; the MTL is not.
    handle.check_cancelled()?;
    handle.set_progress("downloading_model", 25);
    let obj_hash = metadata.obj.as_deref().ok_or_else(|| {
        HubError::new(
            ErrorCode::DownloadFailed,
            format!("no OBJ advertised for user {}", user.id),
        )
    })?;
    let obj_path = download_dir.join("avatar.obj");
    services.avatars.download_to_file(obj_hash, &obj_path).await?;
    handle.set_progress("downloading_model", 60);

    let mtl_path = download_dir.join("avatar.mtl");
    let mut mtl_downloaded = false;
    if let Some(mtl_hash) = metadata.mtl.as_deref() {
        handle.check_cancelled()?;
        match services.avatars.download_to_file(mtl_hash, &mtl_path).await {
            Ok(_) => mtl_downloaded = true,
            Err(err) => warn!("MTL download failed (non-fatal): {err}"),
        }
    }
    handle.set_progress("downloading_model", 70);

    // Phase 4: textures. Individual failures are non-fatal.
    handle.set_progress("downloading_textures", 70);
    let texture_files =
        download_textures(services, handle, &metadata, download_dir).await?;
    handle.set_progress("downloading_textures", 85);

    // Phase 5: analysis, documentation, registration.
    handle.check_cancelled()?;
    handle.set_progress("processing_files", 85);

    let obj_structure = match analyze_obj(&obj_path) {
        Ok(structure) => Some(structure),
        Err(err) => {
            warn!("OBJ analysis failed for {uid}: {err}");
            None
        }
    };
    let avatar_type = if declared_type == "Unknown" {
        obj_structure
            .as_ref()
            .map(infer_rig)
            .unwrap_or("Unknown")
            .to_string()
    } else {
        declared_type
    };

    let full_metadata = json!({
        "user_info": {"id": user.id, "name": user.name.clone(), "displayName": user.display_name.clone()},
        "avatar_3d_metadata": {
            "camera": metadata.camera.clone(),
            "aabb": metadata.aabb.clone(),
            "texture_count": metadata.textures.len(),
        },
        "avatar_type": avatar_type.clone(),
        "obj_structure": obj_structure,
        "download_timestamp": Utc::now().to_rfc3339(),
    });
    fsio::write_json_atomic(&download_dir.join("metadata.json"), &full_metadata)?;
    write_readme(download_dir, &user, &avatar_type, &metadata, texture_files.len())?;
    handle.set_progress("processing_files", 95);

    // The registry record is created only now, after every file is fully
    // written.
    let mut record_metadata = serde_json::Map::new();
    record_metadata.insert(
        "file_path".to_string(),
        Value::String(obj_path.display().to_string()),
    );
    record_metadata.insert("avatar_type".to_string(), Value::String(avatar_type.clone()));
    record_metadata.insert(
        "source".to_string(),
        json!({
            "download_type": "roblox_3d_avatar",
            "username": user.name.clone(),
            "user_id": user.id,
            "downloaded_at": Utc::now().to_rfc3339(),
        }),
    );
    services.registry.add(
        uid.clone(),
        ResourceKind::Object3d,
        "avatar.obj".to_string(),
        session_id.map(str::to_string),
        None,
        record_metadata,
    )?;
    handle.set_progress("processing_files", 100);

    let mut file_paths = json!({
        "folder": download_dir.display().to_string(),
        "obj": obj_path.display().to_string(),
        "metadata": download_dir.join("metadata.json").display().to_string(),
        "readme": download_dir.join("README.md").display().to_string(),
    });
    if mtl_downloaded {
        file_paths["mtl"] = Value::String(mtl_path.display().to_string());
    }
    if !texture_files.is_empty() {
        file_paths["textures_folder"] =
            Value::String(download_dir.join("textures").display().to_string());
        file_paths["textures"] = Value::Array(
            texture_files
                .iter()
                .map(|p| Value::String(p.clone()))
                .collect(),
        );
    }

    let model_files = if mtl_downloaded { 2 } else { 1 };
    Ok(json!({
        "success": true,
        "uid": uid.as_str(),
        "username": user.name,
        "user_id": user.id,
        "avatar_type": avatar_type,
        "file_paths": file_paths,
        "download_stats": {
            "model_files": model_files,
            "texture_files": texture_files.len(),
            "texture_total": metadata.textures.len(),
        },
    }))
}

async fn resolve_user(services: &Services, user_input: &str) -> HubResult<AvatarUser> {
    services
        .avatars
        .resolve_user(user_input)
        .await?
        .ok_or_else(|| {
            HubError::new(
                ErrorCode::UserNotFound,
                format!("no user matches '{user_input}'"),
            )
            .with_suggestion("check the spelling of the username or id")
        })
}

async fn download_textures(
    services: &Services,
    handle: &JobHandle,
    metadata: &Avatar3dMetadata,
    download_dir: &Path,
) -> HubResult<Vec<String>> {
    if metadata.textures.is_empty() {
        return Ok(Vec::new());
    }
    let textures_dir = download_dir.join("textures");
    std::fs::create_dir_all(&textures_dir)?;

    let total = metadata.textures.len();
    let mut downloaded = Vec::new();
    for (index, hash) in metadata.textures.iter().enumerate() {
        handle.check_cancelled()?;
        let path = textures_dir.join(filename::avatar_texture(index + 1));
        match services.avatars.download_to_file(hash, &path).await {
            Ok(_) => downloaded.push(path.display().to_string()),
            Err(err) => warn!("texture {}/{total} failed (non-fatal): {err}", index + 1),
        }
        let percent = 70 + (15 * (index + 1) / total) as u8;
        handle.set_progress("downloading_textures", percent);
    }
    info!("downloaded {}/{total} textures", downloaded.len());
    Ok(downloaded)
}

fn write_readme(
    download_dir: &Path,
    user: &AvatarUser,
    avatar_type: &str,
    metadata: &Avatar3dMetadata,
    texture_count: usize,
) -> HubResult<()> {
    let display_name = user.display_name.as_deref().unwrap_or(&user.name);
    let camera = serde_json::to_string(&metadata.camera).unwrap_or_else(|_| "null".into());
    let readme = format!(
        "# 3D Avatar Model\n\n\
         ## Files\n\
         - avatar.obj: 3D mesh (OBJ)\n\
         - avatar.mtl: material library (MTL)\n\
         - textures/: {texture_count} texture images\n\
         - metadata.json: full download metadata\n\n\
         ## User\n\
         - Name: {display_name} (@{name})\n\
         - User id: {id}\n\
         - Avatar type: {avatar_type}\n\n\
         ## Model\n\
         - Camera: {camera}\n\n\
         ## Usage\n\
         Import avatar.obj in any OBJ-capable tool; the MTL is applied\n\
         automatically when both files sit in the same directory. Link the\n\
         textures manually if your tool does not resolve them.\n",
        name = user.name,
        id = user.id,
    );
    std::fs::write(download_dir.join("README.md"), readme)?;
    Ok(())
}
