//! Asset pipeline orchestration: download -> convert -> import.
//!
//! The full pipeline composes the phased download job with the external
//! transcoder and the editor import, polling the download to completion
//! and observing cancellation between steps. Sub-steps remain invocable
//! on their own for advanced callers.

pub mod convert;
pub mod download;
pub mod obj;

use std::sync::Arc;
use std::time::Duration;

use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::fsio;
use melange_common::types::{JobRecord, JobStatus, Uid, UidKind};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::services::Services;

/// What duplicate cleanup did before a download started.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupInfo {
    pub existing_downloads_cleaned: usize,
    pub reused_uid: bool,
}

/// Handle returned when a download is queued.
#[derive(Debug, Clone)]
pub struct DownloadStart {
    pub uid: Uid,
    pub job: JobRecord,
    pub cleanup: CleanupInfo,
}

/// Strip decorations users paste in front of identifiers.
pub fn scrub_user_input(input: &str) -> String {
    let mut cleaned = input.trim();
    for prefix in ["@", "user:", "id:", "roblox:", "username:"] {
        if let Some(rest) = strip_prefix_ignore_case(cleaned, prefix) {
            cleaned = rest.trim();
            break;
        }
    }
    cleaned.to_string()
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Queue an avatar download, cleaning up prior downloads of the same user
/// within the session first. When exactly one prior download existed its
/// UID is reused so downstream references stay valid.
pub async fn start_download(
    services: &Arc<Services>,
    user_input: &str,
    session_id: Option<String>,
) -> HubResult<DownloadStart> {
    let user_input = scrub_user_input(user_input);
    if user_input.is_empty() {
        return Err(HubError::new(
            ErrorCode::InvalidUserInput,
            "user_input is required",
        ));
    }

    let existing = services
        .registry
        .find_avatar_downloads(&user_input, session_id.as_deref());
    let reusable = if existing.len() == 1 {
        Some(existing[0].uid.clone())
    } else {
        None
    };
    let cleaned = existing.len();
    for record in existing {
        if let Err(err) = services.registry.remove(&record.uid) {
            warn!("failed to drop stale record {}: {err}", record.uid);
        }
        if let Ok(dir) = services.paths.object_3d_dir(record.uid.as_str()) {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove stale download {}: {err}", dir.display());
                }
            }
        }
    }

    let (uid, fresh_allocation) = match reusable {
        Some(uid) => {
            info!("reusing {uid} for '{user_input}' ({cleaned} prior downloads cleaned)");
            (uid, false)
        }
        None => (services.uids.next(UidKind::Object)?, true),
    };

    let worker_services = Arc::clone(services);
    let worker_uid = uid.clone();
    let worker_input = user_input.clone();
    let worker_session = session_id.clone();
    let job = services.jobs.submit(
        "roblox_download",
        session_id.clone(),
        Some(uid.clone()),
        json!({"user_input": user_input, "uid": uid.as_str()}),
        move |handle| async move {
            let result = download::run_download(
                &worker_services,
                &handle,
                &worker_uid,
                &worker_input,
                worker_session.as_deref(),
            )
            .await;
            if result.is_err() && fresh_allocation {
                try_rollback_unpublished(&worker_services, &worker_uid);
            }
            result
        },
    )?;

    if let Some(session) = &session_id {
        services
            .sessions
            .record_job_update(
                session,
                &job.job_id,
                "pending",
                Some(&format!("Avatar download queued for '{user_input}'")),
                Some(0),
                None,
            )
            .await;
    }

    Ok(DownloadStart {
        uid,
        job,
        cleanup: CleanupInfo {
            existing_downloads_cleaned: cleaned,
            reused_uid: !fresh_allocation,
        },
    })
}

/// Roll the kind counter back when (and only when) the failed UID was the
/// most recent allocation and no record was ever published for it.
pub fn try_rollback_unpublished(services: &Services, uid: &Uid) {
    if services.registry.contains(uid) {
        return;
    }
    if services.uids.current(uid.kind()) != uid.number() {
        // A later allocation happened; rolling back would re-issue it.
        return;
    }
    if let Err(err) = services.uids.rollback(uid.kind()) {
        warn!("counter rollback for {uid} failed: {err}");
    }
}

/// Import a downloaded or converted 3D object into the editor.
///
/// Reads the blob's metadata sidecar for the user identity, prefers FBX
/// over OBJ when both exist, and opens a fresh editor connection for the
/// dispatch (the long-lived one may have aged out during polling).
pub async fn import_by_uid(services: &Services, uid: &Uid) -> HubResult<Value> {
    if !matches!(uid.kind(), UidKind::Object | UidKind::Fbx) {
        return Err(HubError::new(
            ErrorCode::InvalidUserInput,
            format!("{uid} is not a 3D object UID"),
        ));
    }
    services.registry.get(uid)?;

    let blob_dir = services.paths.object_3d_dir(uid.as_str())?;
    let sidecar: Value = fsio::load_json(&blob_dir.join("metadata.json"))?.ok_or_else(|| {
        HubError::new(
            ErrorCode::MetadataUnavailable,
            format!("metadata sidecar missing for {uid}"),
        )
    })?;

    let (username, user_id) = extract_identity(&sidecar);
    if username.is_empty() || username == "Unknown" || user_id == 0 {
        return Err(HubError::new(
            ErrorCode::MetadataUnavailable,
            format!("invalid identity in metadata for {uid}: '{username}' / {user_id}"),
        )
        .with_suggestion("re-download the avatar to regenerate its metadata"));
    }

    let (mesh_path, mesh_format) = select_mesh(&blob_dir)?;
    let mut params = json!({
        "uid": uid.as_str(),
        "mesh_file_path": mesh_path.display().to_string(),
        "mesh_format": mesh_format,
        "username": username,
        "user_id": user_id,
        "destination_path": format!("/UnrealMCP/Assets/Roblox/{username}_{user_id}/"),
    });
    if let Some(mtl) = first_with_extension(&blob_dir, "mtl") {
        params["mtl_file_path"] = Value::String(mtl.display().to_string());
    }
    let textures_dir = blob_dir.join("textures");
    if textures_dir.is_dir() {
        params["textures_directory"] = Value::String(textures_dir.display().to_string());
    }

    info!("importing {uid} as {mesh_format} for {username}_{user_id}");
    let connection = services.editor.fresh_connection();
    let response = connection.send_command("import_object3d_by_uid", &params).await?;

    let asset_path = response
        .get("asset_path")
        .or_else(|| response.pointer("/result/asset_path"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Ok(json!({
        "success": true,
        "uid": uid.as_str(),
        "username": username,
        "user_id": user_id,
        "asset_path": asset_path,
        "message": "Avatar imported to Content Browser",
    }))
}

fn extract_identity(sidecar: &Value) -> (String, u64) {
    if let Some(user_info) = sidecar.get("user_info") {
        let name = user_info
            .get("name")
            .or_else(|| user_info.get("displayName"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let id = user_info.get("id").and_then(Value::as_u64).unwrap_or(0);
        return (name.to_string(), id);
    }
    let name = sidecar
        .get("username")
        .and_then(Value::as_str)
        .unwrap_or("Unknown");
    let id = sidecar.get("user_id").and_then(Value::as_u64).unwrap_or(0);
    (name.to_string(), id)
}

fn select_mesh(blob_dir: &std::path::Path) -> HubResult<(std::path::PathBuf, &'static str)> {
    // FBX is the editor's native interchange; prefer it when both exist.
    if let Some(fbx) = first_with_extension(blob_dir, "fbx") {
        return Ok((fbx, "fbx"));
    }
    if let Some(obj) = first_with_extension(blob_dir, "obj") {
        return Ok((obj, "obj"));
    }
    Err(HubError::new(
        ErrorCode::AssetNotFound,
        format!("no mesh file (FBX or OBJ) in {}", blob_dir.display()),
    ))
}

fn first_with_extension(dir: &std::path::Path, ext: &str) -> Option<std::path::PathBuf> {
    let mut matches: Vec<std::path::PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext)))
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// The composite `download_and_import` flow.
pub async fn run_full_pipeline(
    services: &Arc<Services>,
    user_input: &str,
    session_id: Option<String>,
) -> HubResult<Value> {
    let start = start_download(services, user_input, session_id.clone()).await?;
    let obj_uid = start.uid.clone();

    // Poll the download job to completion.
    let poll_interval = Duration::from_secs(services.config.pipeline.poll_interval_secs.max(1));
    let deadline = Duration::from_secs(services.config.pipeline.download_timeout_secs);
    let mut waited = Duration::ZERO;
    loop {
        let Some(job) = services.jobs.get(&start.job.job_id) else {
            return Err(stage_error(
                HubError::job_not_found(&start.job.job_id),
                "download",
                &obj_uid,
                None,
            ));
        };
        match job.status {
            JobStatus::Completed => break,
            JobStatus::Failed | JobStatus::Cancelled => {
                let cause = job.error.unwrap_or_else(|| {
                    HubError::new(ErrorCode::DownloadFailed, "download did not complete")
                });
                return Err(stage_error(cause, "download", &obj_uid, None));
            }
            JobStatus::Pending | JobStatus::InProgress => {
                if waited >= deadline {
                    services.jobs.cancel(&start.job.job_id);
                    return Err(stage_error(
                        HubError::new(
                            ErrorCode::JobTimeout,
                            format!(
                                "avatar download exceeded {}s",
                                deadline.as_secs()
                            ),
                        )
                        .with_suggestion("try again or check the avatar complexity"),
                        "download",
                        &obj_uid,
                        None,
                    ));
                }
                tokio::time::sleep(poll_interval).await;
                waited += poll_interval;
            }
        }
    }

    // Convert, then import over a fresh connection.
    let conversion = convert::convert_obj_to_fbx(services, &obj_uid)
        .await
        .map_err(|err| stage_error(err, "conversion", &obj_uid, None))?;
    let fbx_uid = Uid::parse(&conversion.fbx_uid)?;

    let import = import_by_uid(services, &fbx_uid)
        .await
        .map_err(|err| stage_error(err, "import", &obj_uid, Some(&fbx_uid)))?;
    let asset_path = import
        .get("asset_path")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if let Some(session) = &session_id {
        services
            .sessions
            .record_job_update(
                session,
                &start.job.job_id,
                "completed",
                Some(&format!("Avatar pipeline finished: {asset_path}")),
                Some(100),
                None,
            )
            .await;
    }

    Ok(json!({
        "success": true,
        "obj_uid": obj_uid.as_str(),
        "fbx_uid": fbx_uid.as_str(),
        "asset_path": asset_path,
        "cleanup_info": start.cleanup,
        "message": format!("Successfully downloaded and imported avatar for '{user_input}'"),
        "pipeline_complete": true,
    }))
}

fn stage_error(mut err: HubError, stage: &str, obj_uid: &Uid, fbx_uid: Option<&Uid>) -> HubError {
    let mut details = err
        .details
        .take()
        .and_then(|d| d.as_object().cloned())
        .unwrap_or_default();
    details.insert("stage".to_string(), Value::String(stage.to_string()));
    details.insert(
        "obj_uid".to_string(),
        Value::String(obj_uid.as_str().to_string()),
    );
    if let Some(fbx) = fbx_uid {
        details.insert("fbx_uid".to_string(), Value::String(fbx.as_str().to_string()));
    }
    err.details = Some(Value::Object(details));
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::roblox::{Avatar3dMetadata, AvatarSource, AvatarUser};
    use crate::services::test_support::{ScriptedEditor, services_with};
    use async_trait::async_trait;
    use melange_common::HubConfig;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Avatar platform double serving one synthetic user.
    pub struct StubAvatars {
        pub avatar_type: String,
        pub fail_obj: AtomicBool,
        pub slow: AtomicBool,
    }

    impl Default for StubAvatars {
        fn default() -> Self {
            Self {
                avatar_type: "R6".to_string(),
                fail_obj: AtomicBool::new(false),
                slow: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AvatarSource for StubAvatars {
        async fn resolve_user(&self, input: &str) -> HubResult<Option<AvatarUser>> {
            if input.eq_ignore_ascii_case("builderman") || input == "156" {
                Ok(Some(AvatarUser {
                    id: 156,
                    name: "Builderman".to_string(),
                    display_name: Some("Builderman".to_string()),
                }))
            } else {
                Ok(None)
            }
        }

        async fn avatar_3d_metadata(&self, _user_id: u64) -> HubResult<Avatar3dMetadata> {
            if self.slow.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(Avatar3dMetadata {
                obj: Some("hash-obj".to_string()),
                mtl: Some("hash-mtl".to_string()),
                textures: vec!["hash-t1".to_string(), "hash-t2".to_string()],
                camera: serde_json::json!({"fov": 70}),
                aabb: serde_json::json!({"min": [0,0,0], "max": [1,1,1]}),
            })
        }

        async fn avatar_type(&self, _user_id: u64) -> HubResult<String> {
            Ok(self.avatar_type.clone())
        }

        async fn download_to_file(&self, hash: &str, dest: &Path) -> HubResult<u64> {
            if hash == "hash-obj" && self.fail_obj.load(Ordering::SeqCst) {
                return Err(HubError::new(ErrorCode::DownloadFailed, "all mirrors failed"));
            }
            let content = if hash == "hash-obj" {
                "v 0 0 0\nv 1 0 0\nv 0 1 0\ng Player1\nusemtl M\nf 1 2 3\n".to_string()
            } else {
                format!("payload-{hash}")
            };
            std::fs::write(dest, &content)?;
            Ok(content.len() as u64)
        }
    }

    async fn wait_for_terminal(services: &Services, job_id: &str) -> JobRecord {
        for _ in 0..400 {
            if let Some(job) = services.jobs.get(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not reach a terminal state");
    }

    fn fast_config() -> HubConfig {
        let mut config = HubConfig::default();
        config.pipeline.poll_interval_secs = 1;
        config
    }

    /// Install a fake transcoder: a shell script that copies the OBJ to
    /// an FBX and prints the JSON summary contract on its last line.
    fn install_fake_transcoder(dir: &Path, config: &mut HubConfig, succeed: bool) {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake_transcoder.sh");
        // Real invocations look like `<tool> -b <scene> -P <script> -- <obj>
        // <outdir>`; skip everything before the `--` separator.
        let body = if succeed {
            "#!/bin/sh\n\
             while [ $# -gt 0 ] && [ \"$1\" != \"--\" ]; do shift; done\n\
             shift\n\
             OBJ=\"$1\"\n\
             OUT=\"$2\"\n\
             cp \"$OBJ\" \"$OUT/avatar.fbx\"\n\
             echo loading\n\
             echo \"{\\\"success\\\": true, \\\"fbx_path\\\": \\\"$OUT/avatar.fbx\\\"}\"\n"
        } else {
            "#!/bin/sh\necho \"{\\\"success\\\": false, \\\"error_message\\\": \\\"rig mismatch\\\"}\"\n"
        };
        std::fs::write(&script, body).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        config.pipeline.transcoder_path = script;
    }

    #[test]
    fn user_input_scrubbing() {
        assert_eq!(scrub_user_input("  Builderman "), "Builderman");
        assert_eq!(scrub_user_input("@Builderman"), "Builderman");
        assert_eq!(scrub_user_input("user: Builderman"), "Builderman");
        assert_eq!(scrub_user_input("ID:156"), "156");
        assert_eq!(scrub_user_input("roblox:Builderman"), "Builderman");
    }

    #[tokio::test]
    async fn download_job_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(
            dir.path(),
            fast_config(),
            Arc::new(StubAvatars::default()),
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let start = start_download(&services, "Builderman", None).await.unwrap();
        assert_eq!(start.uid.as_str(), "obj_001");
        assert!(!start.cleanup.reused_uid);

        let job = wait_for_terminal(&services, &start.job.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        // Folder contents per the download contract.
        let blob = services.paths.object_3d_dir("obj_001").unwrap();
        assert!(blob.join("avatar.obj").exists());
        assert!(blob.join("avatar.mtl").exists());
        assert!(blob.join("metadata.json").exists());
        assert!(blob.join("README.md").exists());
        assert!(blob.join("textures").join("texture_001.png").exists());

        let record = services.registry.get(&start.uid).unwrap();
        assert_eq!(
            record.metadata["source"]["username"],
            serde_json::json!("Builderman")
        );
        assert_eq!(record.metadata["avatar_type"], serde_json::json!("R6"));
    }

    #[tokio::test]
    async fn unknown_user_fails_with_user_not_found_and_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(
            dir.path(),
            fast_config(),
            Arc::new(StubAvatars::default()),
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let start = start_download(&services, "nobody", None).await.unwrap();
        let job = wait_for_terminal(&services, &start.job.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().error_code, ErrorCode::UserNotFound);

        // No record was published, so the counter rolled back.
        assert!(!services.registry.contains(&start.uid));
        assert_eq!(services.uids.current(UidKind::Object), 0);
    }

    #[tokio::test]
    async fn fatal_obj_failure_cleans_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let avatars = Arc::new(StubAvatars::default());
        avatars.fail_obj.store(true, Ordering::SeqCst);
        let services = services_with(
            dir.path(),
            fast_config(),
            avatars,
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let start = start_download(&services, "Builderman", None).await.unwrap();
        let job = wait_for_terminal(&services, &start.job.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let blob = dir
            .path()
            .join("Saved/ObjectStore/object_3d/obj_001");
        assert!(!blob.exists() || std::fs::read_dir(&blob).unwrap().next().is_none());
        assert!(!services.registry.contains(&start.uid));
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let avatars = Arc::new(StubAvatars::default());
        avatars.slow.store(true, Ordering::SeqCst);
        let services = services_with(
            dir.path(),
            fast_config(),
            avatars,
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let start = start_download(&services, "Builderman", Some("sess_cancel01".into()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(services.jobs.cancel(&start.job.job_id));

        let job = wait_for_terminal(&services, &start.job.job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(!services.registry.contains(&start.uid));
    }

    #[tokio::test]
    async fn duplicate_download_reuses_the_single_prior_uid() {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(
            dir.path(),
            fast_config(),
            Arc::new(StubAvatars::default()),
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;
        let session = Some("sess_dup00001".to_string());

        let first = start_download(&services, "Builderman", session.clone())
            .await
            .unwrap();
        wait_for_terminal(&services, &first.job.job_id).await;

        let second = start_download(&services, "Builderman", session.clone())
            .await
            .unwrap();
        assert_eq!(second.uid, first.uid);
        assert!(second.cleanup.reused_uid);
        assert_eq!(second.cleanup.existing_downloads_cleaned, 1);
        wait_for_terminal(&services, &second.job.job_id).await;

        // At most one record for this user remains.
        let downloads = services
            .registry
            .find_avatar_downloads("Builderman", session.as_deref());
        assert_eq!(downloads.len(), 1);
    }

    #[tokio::test]
    async fn full_pipeline_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        install_fake_transcoder(dir.path(), &mut config, true);

        let editor = Arc::new(ScriptedEditor::default());
        editor.respond_to(
            "import_object3d_by_uid",
            serde_json::json!({
                "status": "ok",
                "asset_path": "/UnrealMCP/Assets/Roblox/Builderman_156/avatar",
            }),
        );

        let services = services_with(
            dir.path(),
            config,
            Arc::new(StubAvatars::default()),
            editor,
            None,
            None,
        )
        .await;

        let result = run_full_pipeline(&services, "Builderman", None).await.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["obj_uid"], "obj_001");
        assert_eq!(result["fbx_uid"], "fbx_001");
        assert_eq!(
            result["asset_path"],
            "/UnrealMCP/Assets/Roblox/Builderman_156/avatar"
        );

        // fbx record's parent is the obj record.
        let fbx = services
            .registry
            .get(&Uid::parse("fbx_001").unwrap())
            .unwrap();
        assert_eq!(fbx.parent_uid.unwrap().as_str(), "obj_001");
    }

    #[tokio::test]
    async fn non_r6_avatar_is_rejected_at_conversion_without_burning_fbx_uids() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        install_fake_transcoder(dir.path(), &mut config, true);

        let avatars = Arc::new(StubAvatars {
            avatar_type: "R15".to_string(),
            ..StubAvatars::default()
        });
        let services = services_with(
            dir.path(),
            config,
            avatars,
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let err = run_full_pipeline(&services, "Builderman", None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::AvatarProcessingFailed);
        assert!(err.message.contains("R15"));
        assert_eq!(err.details.unwrap()["stage"], "conversion");

        // The download itself completed and published obj_001.
        assert!(services.registry.contains(&Uid::parse("obj_001").unwrap()));
        // No fbx record, and the counter never stayed advanced.
        assert_eq!(services.uids.current(UidKind::Fbx), 0);
    }

    #[tokio::test]
    async fn transcoder_failure_rolls_back_the_fbx_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        install_fake_transcoder(dir.path(), &mut config, false);

        let services = services_with(
            dir.path(),
            config,
            Arc::new(StubAvatars::default()),
            Arc::new(ScriptedEditor::default()),
            None,
            None,
        )
        .await;

        let start = start_download(&services, "Builderman", None).await.unwrap();
        wait_for_terminal(&services, &start.job.job_id).await;

        let err = convert::convert_obj_to_fbx(&services, &start.uid)
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::AvatarProcessingFailed);
        assert!(err.message.contains("rig mismatch"));
        assert_eq!(services.uids.current(UidKind::Fbx), 0);
        // No half-written conversion directory survives.
        let fbx_dir = dir
            .path()
            .join("Saved/ObjectStore/object_3d/fbx_001");
        assert!(!fbx_dir.exists() || std::fs::read_dir(&fbx_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn import_prefers_fbx_and_derives_the_content_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        install_fake_transcoder(dir.path(), &mut config, true);

        let editor = Arc::new(ScriptedEditor::default());
        editor.respond_to(
            "import_object3d_by_uid",
            serde_json::json!({"status": "ok", "asset_path": "/UnrealMCP/Assets/Roblox/Builderman_156/avatar"}),
        );
        let services = services_with(
            dir.path(),
            config,
            Arc::new(StubAvatars::default()),
            Arc::clone(&editor) as Arc<dyn crate::providers::editor::EditorBridge>,
            None,
            None,
        )
        .await;

        run_full_pipeline(&services, "Builderman", None).await.unwrap();

        // The import went over a fresh connection; inspect the packet by
        // re-importing over the shared scripted editor.
        let import = import_by_uid(&services, &Uid::parse("fbx_001").unwrap())
            .await
            .unwrap();
        assert_eq!(import["username"], "Builderman");
        assert_eq!(import["user_id"], 156);
    }
}
