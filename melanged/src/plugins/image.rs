//! Image transform worker: request assembly, size guarding, reference
//! filtering, and UID-first output persistence.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::filename;
use melange_common::types::{CommandResult, ResourceKind, Uid, UidKind};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Capability, CommandOutcome, PluginHealth, PluginMetadata, ToolPlugin, Validation};
use crate::pricing;
use crate::providers::genai::{GeneratedImage, ImagePart};
use crate::services::Services;
use crate::plugins::prompt::compose_style_prompt;

/// Reference payloads smaller than this are sentinel/test artifacts and
/// are silently dropped.
const MIN_REFERENCE_BYTES: usize = 500;

/// The provider accepts at most this many reference images per request.
const MAX_REFERENCES: usize = 3;

pub struct ImageTransformPlugin {
    services: Arc<Services>,
}

impl ImageTransformPlugin {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn decode_inline(value: &Value) -> Option<ImagePart> {
        let data = value.get("data")?.as_str()?;
        let bytes = BASE64.decode(data).ok()?;
        let mime_type = value
            .get("mime_type")
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        Some(ImagePart {
            mime_type,
            data: bytes,
        })
    }

    /// Resolve the primary input: explicit UID first, then the inline
    /// upload, then the session's latest image. Returns the bytes and the
    /// parent UID for lineage (None for uploads).
    async fn resolve_source(&self, params: &Value) -> HubResult<(ImagePart, Option<Uid>)> {
        if let Some(uid_str) = params.get("target_image_uid").and_then(Value::as_str) {
            let uid = Uid::parse(uid_str)?;
            if uid.kind() != UidKind::Image {
                return Err(HubError::new(
                    ErrorCode::InvalidUserInput,
                    format!("{uid} is not an image UID"),
                ));
            }
            if params.get("main_image_data").is_some() {
                debug!("both target_image_uid and main_image_data supplied; the UID wins");
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
            if let Some(part) = Self::decode_inline(inline) {
                return Ok((part, None));
            }
            return Err(HubError::new(
                ErrorCode::InvalidUserInput,
                "main_image_data is not a decodable image payload",
            ));
        }

        if let Some(session_id) = params.get("session_id").and_then(Value::as_str) {
            if let Some(record) = self
                .services
                .registry
                .latest_by_kind(session_id, ResourceKind::Image)
            {
                let path = self.services.registry.resolve_file(&record.uid)?;
                let bytes = std::fs::read(&path)?;
                debug!("auto-resolved latest session image {}", record.uid);
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
            ErrorCode::ValidationFailed,
            "no image available to transform",
        )
        .with_suggestion("take a screenshot first, or provide target_image_uid or main_image_data"))
    }

    /// Pre-flight request-size guard: total payload bytes and a rough
    /// token estimate, both bounded before any provider call.
    fn check_request_size(
        &self,
        main: &ImagePart,
        references: &[ImagePart],
        prompt: &str,
    ) -> HubResult<()> {
        let providers = &self.services.config.providers;
        let total_bytes: usize =
            main.data.len() + references.iter().map(|r| r.data.len()).sum::<usize>();
        let total_mb = total_bytes as f64 / (1024.0 * 1024.0);

        // Rough token estimate: ~4 chars per text token plus a
        // conservative per-image charge.
        let estimated_tokens =
            (prompt.len() / 4) as u64 + ((1 + references.len()) as u64) * 1500;

        if total_mb >= providers.max_request_mb {
            return Err(HubError::new(
                ErrorCode::ImageSizeExceeded,
                format!(
                    "request payload {total_mb:.1} MB exceeds the {:.0} MB limit",
                    providers.max_request_mb
                ),
            )
            .with_suggestion("downscale the images or drop some references"));
        }
        if estimated_tokens >= providers.max_request_tokens {
            return Err(HubError::new(
                ErrorCode::ImageSizeExceeded,
                format!("estimated {estimated_tokens} tokens exceeds the request limit"),
            ));
        }
        Ok(())
    }

    fn build_instruction(
        style_prompt: &str,
        intensity: f64,
        dimensions: Option<(u32, u32)>,
        with_references: bool,
    ) -> String {
        let intensity_word = if intensity < 0.4 {
            "subtle"
        } else if intensity < 0.7 {
            "moderate"
        } else {
            "strong"
        };

        if with_references {
            let dimension_line = match dimensions {
                Some((width, height)) => format!(
                    "\n6. IMPORTANT: generate output with exact dimensions {width}x{height} \
                     pixels to match the main image aspect ratio"
                ),
                None => String::new(),
            };
            format!(
                "Transform the first image using the following instructions with a \
                 {intensity_word} intensity:\n\n{style_prompt}\n\n\
                 INSTRUCTIONS:\n\
                 1. Apply the transformation described above\n\
                 2. Use the reference images to guide the transformation\n\
                 3. Maintain the original subject and composition\n\
                 4. Create a harmonious result that preserves the main subject\n\
                 5. Incorporate elements from reference images as specified{dimension_line}\n\n\
                 Generate the transformed image."
            )
        } else {
            format!(
                "Modify ONLY the requested changes: {style_prompt}.\n\
                 Apply a {intensity_word} transformation that affects ONLY the elements \
                 mentioned in the request.\n\
                 Keep the background, environment, and all other elements completely \
                 unchanged.\nGenerate the image with minimal changes."
            )
        }
    }

    fn persist_output(
        &self,
        uid: &Uid,
        output: &GeneratedImage,
        parent_uid: Option<&Uid>,
        session_id: Option<&str>,
        style_prompt: &str,
        reference_count: usize,
    ) -> HubResult<(String, std::path::PathBuf, Option<(u32, u32)>)> {
        let name = filename::generated_image(uid, Utc::now());
        let path = self.services.paths.screenshots_styled()?.join(&name);
        std::fs::write(&path, &output.data)?;

        let dimensions = image::load_from_memory(&output.data)
            .map(|img| (img.width(), img.height()))
            .ok();

        // The record appears only after the file is fully written.
        let mut metadata = serde_json::Map::new();
        metadata.insert("file_path".to_string(), json!(path.display().to_string()));
        if let Some((width, height)) = dimensions {
            metadata.insert("width".to_string(), json!(width));
            metadata.insert("height".to_string(), json!(height));
        }
        metadata.insert("style_prompt".to_string(), json!(style_prompt));
        metadata.insert("reference_count".to_string(), json!(reference_count));
        metadata.insert(
            "source".to_string(),
            json!({
                "kind": if parent_uid.is_some() { "transform" } else { "user_upload" },
            }),
        );
        self.services.registry.add(
            uid.clone(),
            ResourceKind::Image,
            name.clone(),
            session_id.map(str::to_string),
            parent_uid.cloned(),
            metadata,
        )?;
        Ok((name, path, dimensions))
    }
}

#[async_trait]
impl ToolPlugin for ImageTransformPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            tool_id: "image_transform",
            display_name: "Image Transform",
            version: "2.1.0",
            capabilities: vec![Capability::ImageEditing],
            requires_connection: false,
            pricing_tier: "metered",
        }
    }

    fn supported_commands(&self) -> Vec<&'static str> {
        vec!["transform_image_style"]
    }

    async fn health_check(&self) -> PluginHealth {
        if self.services.image_model.is_some() {
            PluginHealth::Available
        } else {
            PluginHealth::Unavailable
        }
    }

    fn validate(&self, _command_type: &str, params: &Value) -> Validation {
        let mut errors = Vec::new();

        let has_prompt = ["style_prompt", "main_prompt"]
            .iter()
            .any(|key| {
                params
                    .get(key)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty())
            })
            || params
                .get("reference_prompts")
                .and_then(Value::as_array)
                .is_some_and(|prompts| {
                    prompts
                        .iter()
                        .any(|p| p.as_str().is_some_and(|s| !s.trim().is_empty()))
                });
        if !has_prompt {
            errors.push("style_prompt, main_prompt, or reference_prompts is required".to_string());
        }

        if let Some(uid) = params.get("target_image_uid").and_then(Value::as_str) {
            match Uid::parse(uid) {
                Ok(parsed) if parsed.kind() == UidKind::Image => {}
                Ok(parsed) => errors.push(format!(
                    "target_image_uid must be an image UID, got {}",
                    parsed.kind()
                )),
                Err(_) => {
                    errors.push("target_image_uid must look like img_177".to_string());
                }
            }
        }

        if let Some(intensity) = params.get("intensity") {
            match intensity.as_f64() {
                Some(value) if (0.1..=1.0).contains(&value) => {}
                _ => errors.push("intensity must be a number in 0.1..=1.0".to_string()),
            }
        }

        Validation::from_errors(errors)
    }

    async fn preprocess(&self, _command_type: &str, mut params: Value) -> HubResult<Value> {
        // Legacy alias.
        if params.get("target_image_uid").is_none() {
            if let Some(uid) = params.get("image_uid").cloned() {
                params["target_image_uid"] = uid;
            }
        }
        if params.get("intensity").is_none() {
            params["intensity"] = json!(0.8);
        }

        let main_prompt = params
            .get("main_prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                params
                    .get("style_prompt")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let reference_prompts: Vec<String> = params
            .get("reference_prompts")
            .and_then(Value::as_array)
            .map(|prompts| {
                prompts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let model = self.services.image_model.as_deref();
        let composed = compose_style_prompt(&main_prompt, &reference_prompts, model).await?;
        params["style_prompt"] = json!(composed);
        Ok(params)
    }

    async fn execute(&self, _command_type: &str, params: Value) -> HubResult<CommandOutcome> {
        let request_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();
        let model = self.services.image_model.as_deref().ok_or_else(|| {
            HubError::new(ErrorCode::ApiUnavailable, "image model is not configured")
        })?;

        let style_prompt = params
            .get("style_prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let intensity = params
            .get("intensity")
            .and_then(Value::as_f64)
            .unwrap_or(0.8);
        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (main_image, parent_uid) = self.resolve_source(&params).await?;

        // Reference filtering: tiny payloads are sentinels from tests and
        // broken uploads; when everything is filtered out the request
        // falls back to the single-image path.
        let supplied: Vec<ImagePart> = params
            .get("reference_images")
            .and_then(Value::as_array)
            .map(|refs| refs.iter().filter_map(Self::decode_inline).collect())
            .unwrap_or_default();
        let supplied_count = supplied.len();
        let references: Vec<ImagePart> = supplied
            .into_iter()
            .filter(|r| r.data.len() >= MIN_REFERENCE_BYTES)
            .take(MAX_REFERENCES)
            .collect();
        if supplied_count > 0 && references.is_empty() {
            warn!("all {supplied_count} reference images were dropped as too small");
        }

        // Persist surviving references into the session's reference store
        // so later requests can reuse them.
        if let Some(session) = session_id.as_deref() {
            for reference in &references {
                if let Err(err) = self.services.references.store(
                    session,
                    &reference.data,
                    "style",
                    &reference.mime_type,
                ) {
                    warn!("failed to persist reference image: {err}");
                }
            }
        }

        self.check_request_size(&main_image, &references, &style_prompt)?;

        let dimensions = image::load_from_memory(&main_image.data)
            .map(|img| (img.width(), img.height()))
            .ok();
        let instruction = Self::build_instruction(
            &style_prompt,
            intensity,
            dimensions,
            !references.is_empty(),
        );

        // UID before output file, so the filename can embed it.
        let new_uid = self.services.uids.next(UidKind::Image)?;

        let mut parts = Vec::with_capacity(1 + references.len());
        parts.push(main_image);
        parts.extend(references.iter().cloned());
        let output = match model.transform(&parts, &instruction).await {
            Ok(output) => output,
            Err(err) => {
                crate::pipeline::try_rollback_unpublished(&self.services, &new_uid);
                return Err(err);
            }
        };

        let (name, path, output_dimensions) = self.persist_output(
            &new_uid,
            &output,
            parent_uid.as_ref(),
            session_id.as_deref(),
            &style_prompt,
            references.len(),
        )?;

        let (width, height) = output_dimensions.unwrap_or((0, 0));
        let cost = pricing::image_cost(width, height, 1.0);
        let (original_width, original_height) = dimensions.unwrap_or((0, 0));
        info!(
            "transform {request_id}: {} -> {new_uid} ({width}x{height}, {} refs)",
            parent_uid
                .as_ref()
                .map(|u| u.as_str().to_string())
                .unwrap_or_else(|| "upload".to_string()),
            references.len(),
        );

        Ok(CommandOutcome::Immediate(CommandResult::ok(json!({
            "image_uid": new_uid.as_str(),
            "parent_uid": parent_uid.as_ref().map(|u| u.as_str().to_string()),
            "filename": name,
            "image_path": path.display().to_string(),
            "image_url": format!("/api/screenshot-file/{name}"),
            "original_width": original_width,
            "original_height": original_height,
            "processed_width": width,
            "processed_height": height,
            "style_prompt": style_prompt,
            "intensity": intensity,
            "tokens": cost.tokens,
            "estimated_cost": cost.estimated_cost,
            "reference_count": references.len(),
            "request_id": request_id,
            "processing_time_ms": started.elapsed().as_millis() as u64,
        }))))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Image model double: replies with the main image re-encoded, so
    /// dimensions survive the round trip.
    #[derive(Default)]
    pub struct EchoImageModel {
        pub instructions: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::providers::genai::ImageModel for EchoImageModel {
        async fn transform(
            &self,
            parts: &[ImagePart],
            instruction: &str,
        ) -> HubResult<GeneratedImage> {
            self.instructions
                .lock()
                .unwrap()
                .push(instruction.to_string());
            Ok(GeneratedImage {
                mime_type: parts[0].mime_type.clone(),
                data: parts[0].data.clone(),
            })
        }

        async fn generate_text(&self, _prompt: &str) -> HubResult<String> {
            Ok("combined prompt".to_string())
        }
    }

    /// A real PNG of the requested size, for dimension assertions.
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut buffer = std::io::Cursor::new(Vec::new());
        image::DynamicImage::new_rgba8(width, height)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{EchoImageModel, png_bytes};
    use super::*;
    use crate::providers::genai::ImageModel;
    use crate::services::test_support::{ScriptedEditor, services_with};
    use melange_common::HubConfig;

    struct NoAvatars;

    #[async_trait]
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

    async fn plugin(
        model: Arc<EchoImageModel>,
    ) -> (ImageTransformPlugin, Arc<Services>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let services = services_with(
            dir.path(),
            HubConfig::default(),
            Arc::new(NoAvatars),
            Arc::new(ScriptedEditor::default()),
            Some(model as Arc<dyn ImageModel>),
            None,
        )
        .await;
        (ImageTransformPlugin::new(Arc::clone(&services)), services, dir)
    }

    fn inline(bytes: &[u8]) -> Value {
        json!({"data": BASE64.encode(bytes), "mime_type": "image/png"})
    }

    #[tokio::test]
    async fn upload_transform_with_reference_prompts_only() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, services, _dir) = plugin(Arc::clone(&model)).await;

        let params = json!({
            "main_image_data": inline(&png_bytes(1024, 1024)),
            "reference_prompts": ["make it look like oil painting"],
        });
        let params = plugin.preprocess("transform_image_style", params).await.unwrap();
        assert!(
            params["style_prompt"]
                .as_str()
                .unwrap()
                .starts_with("Apply style transformation: make it look like oil painting")
        );

        let outcome = plugin.execute("transform_image_style", params).await.unwrap();
        let result = outcome.into_result();
        assert!(result.success);
        let payload = result.result.unwrap();

        // User upload: no parent lineage; dimensions survive.
        assert!(payload["parent_uid"].is_null());
        assert_eq!(payload["processed_width"], 1024);
        assert_eq!(payload["processed_height"], 1024);

        let uid = Uid::parse(payload["image_uid"].as_str().unwrap()).unwrap();
        let record = services.registry.get(&uid).unwrap();
        assert!(record.parent_uid.is_none());
        assert_eq!(record.metadata["width"], 1024);
    }

    #[tokio::test]
    async fn uid_transform_records_lineage() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, services, _dir) = plugin(Arc::clone(&model)).await;

        // Seed a source image record.
        let source_uid = services.uids.next(UidKind::Image).unwrap();
        let source_path = services
            .paths
            .screenshots_styled()
            .unwrap()
            .join("seed.png");
        std::fs::write(&source_path, png_bytes(512, 256)).unwrap();
        let mut metadata = serde_json::Map::new();
        metadata.insert("file_path".to_string(), json!(source_path.display().to_string()));
        services
            .registry
            .add(
                source_uid.clone(),
                ResourceKind::Image,
                "seed.png".to_string(),
                None,
                None,
                metadata,
            )
            .unwrap();

        let params = plugin
            .preprocess(
                "transform_image_style",
                json!({
                    "target_image_uid": source_uid.as_str(),
                    "style_prompt": "warmer colors",
                }),
            )
            .await
            .unwrap();
        let result = plugin
            .execute("transform_image_style", params)
            .await
            .unwrap()
            .into_result();
        assert!(result.success);
        let payload = result.result.unwrap();
        assert_eq!(payload["parent_uid"], source_uid.as_str());

        let new_uid = Uid::parse(payload["image_uid"].as_str().unwrap()).unwrap();
        let record = services.registry.get(&new_uid).unwrap();
        assert_eq!(record.parent_uid.unwrap(), source_uid);
        // Filename embeds the UID.
        assert!(record.filename.starts_with(new_uid.as_str()));
        assert!(record.filename.ends_with(".png"));
    }

    #[tokio::test]
    async fn tiny_references_are_dropped_with_single_image_fallback() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, _services, _dir) = plugin(Arc::clone(&model)).await;

        let params = plugin
            .preprocess(
                "transform_image_style",
                json!({
                    "main_image_data": inline(&png_bytes(256, 256)),
                    "style_prompt": "sketch style",
                    "reference_images": [inline(b"tiny"), inline(&[0u8; 100])],
                }),
            )
            .await
            .unwrap();
        let result = plugin
            .execute("transform_image_style", params)
            .await
            .unwrap()
            .into_result();
        assert!(result.success);
        assert_eq!(result.result.unwrap()["reference_count"], 0);

        // The single-image instruction path was used.
        let instructions = model.instructions.lock().unwrap();
        assert!(instructions[0].starts_with("Modify ONLY the requested changes"));
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_before_the_provider() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, services, _dir) = plugin(Arc::clone(&model)).await;

        // 20 MB of "image" payload trips the byte guard.
        let huge = vec![0u8; 20 * 1024 * 1024];
        let err = plugin
            .execute(
                "transform_image_style",
                json!({
                    "main_image_data": inline(&huge),
                    "style_prompt": "anything",
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code, ErrorCode::ImageSizeExceeded);
        // No provider call was made and no UID was allocated.
        assert!(model.instructions.lock().unwrap().is_empty());
        assert_eq!(services.uids.current(UidKind::Image), 0);
    }

    #[tokio::test]
    async fn video_uid_is_rejected_for_image_transforms() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, _services, _dir) = plugin(model).await;
        let validation = plugin.validate(
            "transform_image_style",
            &json!({"target_image_uid": "vid_001", "style_prompt": "x"}),
        );
        assert!(!validation.valid);
        assert!(validation.errors[0].contains("image UID"));
    }

    #[tokio::test]
    async fn multi_reference_requests_embed_main_dimensions() {
        let model = Arc::new(EchoImageModel::default());
        let (plugin, _services, _dir) = plugin(Arc::clone(&model)).await;

        let params = plugin
            .preprocess(
                "transform_image_style",
                json!({
                    "main_image_data": inline(&png_bytes(800, 600)),
                    "style_prompt": "oil painting",
                    "reference_images": [inline(&vec![7u8; 1000])],
                }),
            )
            .await
            .unwrap();
        plugin
            .execute("transform_image_style", params)
            .await
            .unwrap();

        let instructions = model.instructions.lock().unwrap();
        assert!(instructions[0].contains("800x600"));
        assert!(instructions[0].contains("reference images"));
    }
}
