//! Video generation worker: image-to-video synthesis through the
//! asynchronous provider API, run as a queued job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::filename;
use melange_common::types::{ResourceKind, Uid, UidKind};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Capability, CommandOutcome, PluginHealth, PluginMetadata, ToolPlugin, Validation};
use crate::pricing;
use crate::providers::genai::{ImagePart, VideoOperation, VideoOptions};
use crate::services::Services;

/// The provider produces fixed-length clips.
const VIDEO_DURATION_SECONDS: u32 = 8;

pub struct VideoGenerationPlugin {
    services: Arc<Services>,
}

impl VideoGenerationPlugin {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Resolve the source image: explicit UID, inline upload, or the
    /// session's latest image. Video UIDs are rejected outright.
    fn resolve_source(&self, params: &Value) -> HubResult<(ImagePart, Option<Uid>)> {
        if let Some(uid_str) = params.get("target_image_uid").and_then(Value::as_str) {
            let uid = Uid::parse(uid_str)?;
            if uid.kind() != UidKind::Image {
                return Err(HubError::new(
                    ErrorCode::InvalidUserInput,
                    format!("video generation needs an image source, got {uid}"),
                ));
            }
            let path = self.services.registry.resolve_file(&uid)?;
            let bytes = std::fs::read(&path)?;
            return Ok((
                ImagePart {
                    mime_type: "image/png".to_string(),
                    data: bytes,
                },
                Some(uid),
            ));
        }

        if let Some(inline) = params.get("main_image_data") {
            if let Some(data) = inline.get("data").and_then(Value::as_str) {
                if let Ok(bytes) = BASE64.decode(data) {
                    let mime_type = inline
                        .get("mime_type")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png")
                        .to_string();
                    return Ok((
                        ImagePart {
                            mime_type,
                            data: bytes,
                        },
                        None,
                    ));
                }
            }
        }

        if let Some(session_id) = params.get("session_id").and_then(Value::as_str) {
            if let Some(record) = self
                .services
                .registry
                .latest_by_kind(session_id, ResourceKind::Image)
            {
                let path = self.services.registry.resolve_file(&record.uid)?;
                let bytes = std::fs::read(&path)?;
                debug!("auto-resolved latest session image {} for video", record.uid);
                return Ok((
                    ImagePart {
                        mime_type: "image/png".to_string(),
                        data: bytes,
                    },
                    Some(record.uid),
                ));
            }
        }

        Err(HubError::new(
            ErrorCode::VideoImageRequired,
            "video generation requires a source image",
        )
        .with_suggestion("take a screenshot first or pass target_image_uid"))
    }

    fn output_dimensions(aspect_ratio: &str, resolution: &str) -> (u32, u32) {
        match (resolution, aspect_ratio) {
            ("1080p", "16:9") => (1920, 1080),
            ("1080p", _) => (1080, 1920),
            (_, "16:9") => (1280, 720),
            (_, _) => (720, 1280),
        }
    }
}

#[async_trait]
impl ToolPlugin for VideoGenerationPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            tool_id: "video_generation",
            display_name: "Video Generation",
            version: "1.4.0",
            capabilities: vec![Capability::VideoGeneration],
            requires_connection: false,
            pricing_tier: "metered",
        }
    }

    fn supported_commands(&self) -> Vec<&'static str> {
        vec!["generate_video_from_image"]
    }

    async fn health_check(&self) -> PluginHealth {
        if self.services.video_model.is_some() {
            PluginHealth::Available
        } else {
            PluginHealth::Unavailable
        }
    }

    fn validate(&self, _command_type: &str, params: &Value) -> Validation {
        let mut errors = Vec::new();

        if params
            .get("prompt")
            .and_then(Value::as_str)
            .is_none_or(|p| p.trim().is_empty())
        {
            errors.push("prompt is required".to_string());
        }

        if let Some(uid) = params.get("target_image_uid").and_then(Value::as_str) {
            match Uid::parse(uid) {
                Ok(parsed) if parsed.kind() == UidKind::Image => {}
                _ => errors.push("target_image_uid must be a valid image UID (img_XXX)".to_string()),
            }
        }

        if let Some(aspect_ratio) = params.get("aspect_ratio").and_then(Value::as_str) {
            if !["16:9", "9:16"].contains(&aspect_ratio) {
                errors.push("aspect_ratio must be '16:9' or '9:16'".to_string());
            }
        }
        if let Some(resolution) = params.get("resolution").and_then(Value::as_str) {
            if !["720p", "1080p"].contains(&resolution) {
                errors.push("resolution must be '720p' or '1080p'".to_string());
            }
        }

        Validation::from_errors(errors)
    }

    async fn preprocess(&self, _command_type: &str, mut params: Value) -> HubResult<Value> {
        if params.get("aspect_ratio").is_none() {
            params["aspect_ratio"] = json!("16:9");
        }
        if params.get("resolution").is_none() {
            params["resolution"] = json!("720p");
        }
        Ok(params)
    }

    async fn execute(&self, _command_type: &str, params: Value) -> HubResult<CommandOutcome> {
        let model = self
            .services
            .video_model
            .clone()
            .ok_or_else(|| {
                HubError::new(ErrorCode::VideoApiUnavailable, "video model is not configured")
            })?;

        // Resolve the source before allocating anything or queueing a job;
        // a request with no resolvable image fails fast.
        let (source_image, parent_uid) = self.resolve_source(&params)?;

        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let aspect_ratio = params
            .get("aspect_ratio")
            .and_then(Value::as_str)
            .unwrap_or("16:9")
            .to_string();
        let resolution = params
            .get("resolution")
            .and_then(Value::as_str)
            .unwrap_or("720p")
            .to_string();
        let negative_prompt = params
            .get("negative_prompt")
            .and_then(Value::as_str)
            .map(str::to_string);
        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        // The UID comes first so the output filename can embed it.
        let video_uid = self.services.uids.next(UidKind::Video)?;
        let (width, height) = Self::output_dimensions(&aspect_ratio, &resolution);

        let services = Arc::clone(&self.services);
        let worker_uid = video_uid.clone();
        let worker_parent = parent_uid.clone();
        let worker_session = session_id.clone();
        let job = self.services.jobs.submit(
            "generate_video_from_image",
            session_id.clone(),
            Some(video_uid.clone()),
            json!({
                "prompt": prompt,
                "aspect_ratio": aspect_ratio,
                "resolution": resolution,
                "parent_uid": worker_parent.as_ref().map(|u| u.as_str().to_string()),
            }),
            move |handle| async move {
                let options = VideoOptions {
                    aspect_ratio: aspect_ratio.clone(),
                    resolution: resolution.clone(),
                    negative_prompt,
                };

                handle.check_cancelled()?;
                handle.set_progress("starting", 5);
                let operation_id = model.start(&source_image, &prompt, &options).await?;
                info!("video operation started: {operation_id}");

                // Fixed-cadence polling with a hard ceiling.
                let poll_interval = Duration::from_secs(
                    services.config.providers.video_poll_interval_secs.max(1),
                );
                let deadline =
                    Duration::from_secs(services.config.providers.video_poll_timeout_secs);
                let mut waited = Duration::ZERO;
                let video_bytes = loop {
                    handle.check_cancelled()?;
                    match model.poll(&operation_id).await? {
                        VideoOperation::Done { video } => break video,
                        VideoOperation::Pending => {
                            if waited >= deadline {
                                return Err(HubError::new(
                                    ErrorCode::VideoGenerationTimeout,
                                    format!(
                                        "video generation exceeded {}s",
                                        deadline.as_secs()
                                    ),
                                )
                                .with_suggestion("try a simpler prompt"));
                            }
                            let percent =
                                10 + (80 * waited.as_secs() / deadline.as_secs().max(1)) as u8;
                            handle.set_progress("generating", percent);
                            tokio::time::sleep(poll_interval).await;
                            waited += poll_interval;
                        }
                    }
                };

                handle.check_cancelled()?;
                handle.set_progress("saving", 92);
                let name = filename::generated_video(&worker_uid, Utc::now());
                let path = services.paths.videos_generated()?.join(&name);
                std::fs::write(&path, &video_bytes)?;

                let cost = pricing::video_cost(VIDEO_DURATION_SECONDS);
                let mut metadata = serde_json::Map::new();
                metadata.insert("file_path".to_string(), json!(path.display().to_string()));
                metadata.insert("width".to_string(), json!(width));
                metadata.insert("height".to_string(), json!(height));
                metadata.insert(
                    "duration_seconds".to_string(),
                    json!(VIDEO_DURATION_SECONDS),
                );
                metadata.insert("prompt".to_string(), json!(prompt));
                metadata.insert("cost".to_string(), json!(cost));
                services.registry.add(
                    worker_uid.clone(),
                    ResourceKind::Video,
                    name.clone(),
                    worker_session.clone(),
                    worker_parent.clone(),
                    metadata,
                )?;

                if let Some(session) = &worker_session {
                    services
                        .sessions
                        .record_job_update(
                            session,
                            &handle.job_id,
                            "completed",
                            Some("Video generated"),
                            Some(100),
                            Some(format!("/api/video-file/{name}")),
                        )
                        .await;
                }

                Ok(json!({
                    "video_uid": worker_uid.as_str(),
                    "parent_uid": worker_parent.as_ref().map(|u| u.as_str().to_string()),
                    "filename": name,
                    "video_path": path.display().to_string(),
                    "video_url": format!("/api/video-file/{name}"),
                    "width": width,
                    "height": height,
                    "duration_seconds": VIDEO_DURATION_SECONDS,
                    "cost": cost,
                }))
            },
        )?;

        if let Some(session) = &session_id {
            self.services
                .sessions
                .record_job_update(
                    session,
                    &job.job_id,
                    "pending",
                    Some("Video generation queued"),
                    Some(0),
                    None,
                )
                .await;
        }

        Ok(CommandOutcome::Queued {
            poll_url: format!("/api/roblox-status/{}", video_uid),
            job,
        })
    }
}
