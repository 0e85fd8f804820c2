//! HTTP API for the creative hub.
//!
//! The transport contract only; the natural-language planner and the
//! frontend live elsewhere. This module is also the single place that
//! maps error categories to HTTP status codes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path as AxumPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError};
use melange_common::types::{Command, Uid};
use serde_json::{Value, json};
use tracing::info;

use crate::plugins::dispatch::Dispatcher;
use crate::services::Services;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub services: Arc<Services>,
    pub dispatcher: Arc<Dispatcher>,
    pub version: &'static str,
    pub started_at: Instant,
}

/// Create the router for the full API surface.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", post(root_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/api/sessions/{sid}/name", put(rename_session_handler))
        .route("/api/session/{sid}/latest-image", get(latest_image_handler))
        .route("/api/roblox-status/{uid}", get(job_status_handler))
        .route("/api/roblox-cancel/{uid}", get(job_cancel_handler))
        .route("/api/roblox-file/{uid}/{kind}", get(roblox_file_handler))
        .route("/api/roblox-cleanup", get(job_cleanup_handler))
        .route("/api/screenshot-file/{filename}", get(screenshot_file_handler))
        .route("/api/video-file/{filename}", get(video_file_handler))
        .route("/3d-object/{uid}", get(object_file_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// The single category -> status mapping.
fn error_response(err: HubError) -> Response {
    let status = StatusCode::from_u16(err.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "success": false,
        "error": err,
    });
    (status, Json(body)).into_response()
}

async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (primary, fallback) = state.services.sessions.health().await;
    Json(json!({
        "status": "healthy",
        "service": "melanged",
        "version": state.version,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "session_backends": {"primary": primary, "fallback": fallback},
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// POST `/` multiplexes session actions and the command-execution entry.
async fn root_handler(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<Value>,
) -> Response {
    match body.get("action").and_then(Value::as_str) {
        Some("create_session") => create_session(&state, &body).await,
        Some("get_context") => get_context(&state, &body).await,
        Some("delete_session") => delete_session(&state, &body).await,
        Some(other) => error_response(HubError::new(
            ErrorCode::InvalidUserInput,
            format!("unknown action: {other}"),
        )),
        None => execute_commands(&state, body).await,
    }
}

async fn create_session(state: &HttpState, body: &Value) -> Response {
    let session_name = body
        .get("session_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    match state.services.sessions.create_session(session_name).await {
        Ok(context) => Json(json!({
            "session_id": context.session_id,
            "session_name": context.session_name,
            "created_at": context.created_at.to_rfc3339(),
            "last_accessed": context.last_accessed.to_rfc3339(),
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_context(state: &HttpState, body: &Value) -> Response {
    let Some(session_id) = body.get("session_id").and_then(Value::as_str) else {
        return error_response(HubError::new(
            ErrorCode::InvalidUserInput,
            "session_id is required",
        ));
    };
    match state.services.sessions.get_session(session_id).await {
        Ok(context) => Json(json!({"context": context})).into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_session(state: &HttpState, body: &Value) -> Response {
    let Some(session_id) = body.get("session_id").and_then(Value::as_str) else {
        return error_response(HubError::new(
            ErrorCode::InvalidUserInput,
            "session_id is required",
        ));
    };
    match state.services.sessions.delete_session(session_id).await {
        Ok(true) => {
            // Session-scoped cleanup: registry records and reference blobs
            // follow the session.
            let _ = state.services.registry.delete_by_session(session_id);
            let _ = state.services.references.delete_by_session(session_id);
            Json(json!({
                "success": true,
                "message": format!("session {session_id} deleted"),
            }))
            .into_response()
        }
        Ok(false) => error_response(HubError::session_not_found(session_id)),
        Err(err) => error_response(err),
    }
}

/// Execute already-planned commands. The NL planner is an external
/// collaborator: requests carry a `commands` array; a bare prompt with
/// no commands cannot be planned here.
async fn execute_commands(state: &HttpState, body: Value) -> Response {
    let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or("");
    let session_id = body
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(commands) = body.get("commands").and_then(Value::as_array).cloned() else {
        return error_response(
            HubError::new(
                ErrorCode::ValidationFailed,
                "no commands supplied; the planner runs upstream of this service",
            )
            .with_suggestion("send {commands: [{type, params}]} produced by the planner"),
        );
    };

    let mut executed_commands = Vec::new();
    let mut execution_results = Vec::new();
    for raw in commands {
        let Ok(mut command) = serde_json::from_value::<Command>(raw.clone()) else {
            execution_results.push(json!({
                "success": false,
                "error": HubError::new(ErrorCode::ValidationFailed, "malformed command object"),
            }));
            executed_commands.push(raw);
            continue;
        };
        merge_request_context(&mut command, &body, session_id.as_deref());

        let outcome = state.dispatcher.dispatch(&command).await;
        let result = outcome.into_result();
        execution_results.push(serde_json::to_value(&result).unwrap_or_else(|_| json!({})));
        executed_commands.push(serde_json::to_value(&command).unwrap_or(raw));
    }

    // Fold the interaction into the session (scene state follows only
    // successful commands).
    let mut conversation_context = Value::Null;
    let mut debug_notes = Value::Null;
    if let Some(session_id) = &session_id {
        let summary = format!("Executed {} command(s)", executed_commands.len());
        let commands = executed_commands.clone();
        let results = execution_results.clone();
        let prompt = prompt.to_string();
        match state
            .services
            .sessions
            .modify_session(session_id, move |context| {
                context.add_interaction(&prompt, &summary, commands, results);
            })
            .await
        {
            Ok(context) => {
                conversation_context = json!({
                    "session_id": context.session_id,
                    "interaction_count": context.interaction_count(),
                });
                debug_notes = json!({
                    "conversation_summary": crate::session::conversation_summary(&context, 10),
                });
            }
            Err(err) => {
                conversation_context = json!({"warning": err.message});
            }
        }
    }

    Json(json!({
        "conversation_context": conversation_context,
        "ai_processing": {
            "generated_commands": executed_commands,
        },
        "execution_results": execution_results,
        "debug_notes": debug_notes,
    }))
    .into_response()
}

/// Transform-related fields arrive at the top level of the request and
/// flow into each command's params when the command itself is silent.
fn merge_request_context(command: &mut Command, body: &Value, session_id: Option<&str>) {
    if !command.params.is_object() {
        command.params = json!({});
    }
    let params = command.params.as_object_mut().expect("set to object above");
    if let Some(session_id) = session_id {
        params
            .entry("session_id")
            .or_insert_with(|| json!(session_id));
    }
    for key in [
        "main_prompt",
        "reference_prompts",
        "main_image_data",
        "target_image_uid",
        "reference_images",
    ] {
        if let Some(value) = body.get(key) {
            params.entry(key).or_insert_with(|| value.clone());
        }
    }
}

async fn list_sessions_handler(State(state): State<Arc<HttpState>>) -> Response {
    match state.services.sessions.list_sessions(100, 0).await {
        Ok(sessions) => {
            let rows: Vec<Value> = sessions
                .iter()
                .map(|context| {
                    json!({
                        "session_id": context.session_id,
                        "session_name": context.session_name,
                        "created_at": context.created_at.to_rfc3339(),
                        "last_accessed": context.last_accessed.to_rfc3339(),
                        "interaction_count": context.interaction_count(),
                    })
                })
                .collect();
            Json(json!({"sessions": rows})).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn rename_session_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(session_id): AxumPath<String>,
    Json(body): Json<Value>,
) -> Response {
    let Some(name) = body.get("session_name").and_then(Value::as_str) else {
        return error_response(HubError::new(
            ErrorCode::InvalidUserInput,
            "session_name is required",
        ));
    };
    let name = name.to_string();
    let rename = name.clone();
    match state
        .services
        .sessions
        .modify_session(&session_id, move |context| {
            context.session_name = Some(rename);
        })
        .await
    {
        Ok(_) => Json(json!({
            "success": true,
            "session_id": session_id,
            "session_name": name,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn latest_image_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(session_id): AxumPath<String>,
) -> Response {
    let latest = state
        .services
        .registry
        .latest_by_kind(&session_id, melange_common::types::ResourceKind::Image);
    match latest {
        Some(record) => Json(json!({
            "success": true,
            "latest_image": {
                "uid": record.uid.as_str(),
                "filename": record.filename,
                "thumbnail_url": format!("/api/screenshot-file/{}", record.filename),
                "available": true,
            },
        }))
        .into_response(),
        None => Json(json!({
            "success": true,
            "latest_image": {"available": false},
        }))
        .into_response(),
    }
}

async fn job_status_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(uid): AxumPath<String>,
) -> Response {
    let uid = match Uid::parse(&uid) {
        Ok(uid) => uid,
        Err(err) => return error_response(err),
    };
    let Some(job) = state.services.jobs.get_by_target(&uid) else {
        return error_response(HubError::job_not_found(uid.as_str()));
    };
    let mut payload = json!({
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
        payload["error"] = serde_json::to_value(error).unwrap_or(Value::Null);
    }
    Json(payload).into_response()
}

async fn job_cancel_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(uid): AxumPath<String>,
) -> Response {
    let uid = match Uid::parse(&uid) {
        Ok(uid) => uid,
        Err(err) => return error_response(err),
    };
    match state.services.jobs.cancel_by_target(&uid) {
        Some(_) => Json(json!({
            "success": true,
            "uid": uid.as_str(),
            "status": "cancelled",
        }))
        .into_response(),
        None => error_response(HubError::job_not_found(uid.as_str())),
    }
}

async fn job_cleanup_handler(State(state): State<Arc<HttpState>>) -> Response {
    let age_hours = state.services.config.jobs.http_cleanup_age_hours;
    let removed = state
        .services
        .jobs
        .cleanup_terminal(Duration::from_secs(age_hours * 3600))
        .await;
    Json(json!({
        "success": true,
        "message": format!("removed {removed} terminated jobs"),
        "cleanup_age_hours": age_hours,
    }))
    .into_response()
}

/// Stream a produced asset file for a pipeline UID.
async fn roblox_file_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath((uid, kind)): AxumPath<(String, String)>,
) -> Response {
    let uid = match Uid::parse(&uid) {
        Ok(uid) => uid,
        Err(err) => return error_response(err),
    };
    // A fixed whitelist keeps path traversal out of the blob directory.
    let file_name = match kind.as_str() {
        "obj" => "avatar.obj",
        "mtl" => "avatar.mtl",
        "fbx" => "avatar.fbx",
        "metadata" => "metadata.json",
        "readme" => "README.md",
        _ => {
            return error_response(HubError::new(
                ErrorCode::InvalidUserInput,
                format!("unknown file kind: {kind}"),
            ));
        }
    };
    let dir = match state.services.paths.object_3d_dir(uid.as_str()) {
        Ok(dir) => dir,
        Err(err) => return error_response(err),
    };
    stream_file(dir.join(file_name)).await
}

async fn screenshot_file_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(filename): AxumPath<String>,
) -> Response {
    serve_from_dirs(
        &filename,
        &[
            state.services.paths.screenshots_styled(),
            state.services.paths.screenshots_editor(),
        ],
    )
    .await
}

async fn video_file_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(filename): AxumPath<String>,
) -> Response {
    serve_from_dirs(&filename, &[state.services.paths.videos_generated()]).await
}

async fn object_file_handler(
    State(state): State<Arc<HttpState>>,
    AxumPath(uid): AxumPath<String>,
) -> Response {
    let uid = match Uid::parse(&uid) {
        Ok(uid) => uid,
        Err(err) => return error_response(err),
    };
    match state.services.registry.resolve_file(&uid) {
        Ok(path) => stream_file(path).await,
        Err(err) => error_response(err),
    }
}

async fn serve_from_dirs(
    filename: &str,
    dirs: &[melange_common::errors::HubResult<std::path::PathBuf>],
) -> Response {
    // Reject separators and parent references before touching the disk.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return error_response(HubError::new(
            ErrorCode::InvalidUserInput,
            "invalid filename",
        ));
    }
    for dir in dirs {
        if let Ok(dir) = dir {
            let candidate = dir.join(filename);
            if candidate.is_file() {
                return stream_file(candidate).await;
            }
        }
    }
    error_response(HubError::new(
        ErrorCode::AssetNotFound,
        format!("file not found: {filename}"),
    ))
}

async fn stream_file(path: std::path::PathBuf) -> Response {
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = mime_for(&path);
            info!("streaming {} ({} bytes)", path.display(), bytes.len());
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => error_response(
            HubError::new(ErrorCode::AssetNotFound, format!("{} not found", path.display())),
        ),
        Err(err) => error_response(HubError::storage("stream file", err)),
    }
}

fn mime_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
    {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "mp4" => "video/mp4",
        "json" => "application/json",
        "md" => "text/markdown",
        "obj" | "mtl" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins;
    use crate::services::test_support::{ScriptedEditor, services_with};
    use axum::body::Body;
    use axum::http::Request;
    use melange_common::HubConfig;
    use melange_common::errors::HubResult;
    use tower::ServiceExt;

    struct NoAvatars;

    #[async_trait::async_trait]
    impl crate::providers::roblox::AvatarSource for NoAvatars {
        async fn resolve_user(
            &self,
            _input: &str,
        ) -> HubResult<Option<crate::providers::roblox::AvatarUser>> {
            Ok(None)
        }
        async fn avatar_3d_metadata(
            &self,
            _user_id: u64,
        ) -> HubResult<crate::providers::roblox::Avatar3dMetadata> {
            Err(HubError::new(ErrorCode::ApiUnavailable, "unused"))
        }
        async fn avatar_type(&self, _user_id: u64) -> HubResult<String> {
            Ok("Unknown".to_string())
        }
        async fn download_to_file(&self, _hash: &str, _dest: &std::path::Path) -> HubResult<u64> {
            Err(HubError::new(ErrorCode::ApiUnavailable, "unused"))
        }
    }

    async fn test_router(editor: Arc<ScriptedEditor>) -> (Router, Arc<Services>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(
            dir.path(),
            HubConfig::default(),
            Arc::new(NoAvatars),
            editor,
            None,
            None,
        )
        .await;
        let dispatcher = Arc::new(Dispatcher::new(
            plugins::standard_registry(&services).unwrap(),
        ));
        let state = HttpState {
            services: Arc::clone(&services),
            dispatcher,
            version: "0.0.0-test",
            started_at: Instant::now(),
        };
        (create_router(state), services, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_service_and_version() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "melanged");
        assert_eq!(body["version"], "0.0.0-test");
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;

        let response = router
            .clone()
            .oneshot(post_json(
                "/",
                json!({"action": "create_session", "session_name": "demo"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let session_id = created["session_id"].as_str().unwrap().to_string();
        assert_eq!(created["session_name"], "demo");

        let response = router
            .clone()
            .oneshot(post_json(
                "/",
                json!({"action": "get_context", "session_id": session_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let context = body_json(response).await;
        assert_eq!(context["context"]["session_id"], session_id.as_str());

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/sessions/{session_id}/name"))
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"session_name": "renamed"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed["sessions"][0]["session_name"], "renamed");

        let response = router
            .clone()
            .oneshot(post_json(
                "/",
                json!({"action": "delete_session", "session_id": session_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(post_json(
                "/",
                json!({"action": "get_context", "session_id": session_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_job_uid_is_404() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/roblox-status/obj_999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["error_code"], "job_not_found");
    }

    #[tokio::test]
    async fn malformed_uid_is_400() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/roblox-status/not-a-uid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn file_streaming_rejects_traversal() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/screenshot-file/..%2F..%2Fetc%2Fpasswd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn screenshot_streaming_serves_styled_files() {
        let (router, services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let styled = services.paths.screenshots_styled().unwrap();
        std::fs::write(styled.join("img_001_20250101.png"), b"png-bytes").unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/screenshot-file/img_001_20250101.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/png"
        );
    }

    #[tokio::test]
    async fn command_execution_entry_runs_the_dispatcher() {
        // S4: a relative color-temperature description flows through the
        // dispatcher, reads the current value, and lands at +1000 K.
        let editor = Arc::new(ScriptedEditor::default());
        editor.respond_to(
            "get_ultra_dynamic_sky",
            json!({"result": {"color_temperature": 5000.0}}),
        );
        editor.respond_to("set_color_temperature", json!({"status": "ok"}));
        let (router, _services, _dir) = test_router(Arc::clone(&editor)).await;

        let response = router
            .oneshot(post_json(
                "/",
                json!({
                    "prompt": "make it cooler",
                    "commands": [
                        {"type": "set_color_temperature", "params": {"color_temperature": "cooler"}}
                    ],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["execution_results"][0]["success"], true);

        let sent = editor.sent.lock().unwrap();
        let (_, params) = sent
            .iter()
            .find(|(c, _)| c == "set_color_temperature")
            .unwrap();
        assert_eq!(params["color_temperature"], 6000.0);
    }

    #[tokio::test]
    async fn prompt_without_commands_is_a_planner_error() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(post_json("/", json!({"prompt": "paint the sky"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cleanup_endpoint_reports_the_configured_age() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/roblox-cleanup")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["cleanup_age_hours"], 24);
    }

    #[tokio::test]
    async fn latest_image_reports_unavailable_when_session_is_empty() {
        let (router, _services, _dir) = test_router(Arc::new(ScriptedEditor::default())).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/session/sess_none00001/latest-image")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["latest_image"]["available"], false);
    }
}
