//! Generative provider edge: image transformation and asynchronous video
//! synthesis.
//!
//! The provider SDKs stay outside the core; workers call these traits and
//! tests substitute doubles. The HTTP implementation is gated on the API
//! key, whose presence also drives plugin health.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use serde_json::Value;
use tracing::debug;

/// One inline image handed to a model.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// An image produced by a model.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Image-to-image transformation plus small text tasks (prompt
/// translation/combination).
#[async_trait]
pub trait ImageModel: Send + Sync {
    /// Transform the first part, guided by the remaining parts, following
    /// `instruction`.
    async fn transform(&self, parts: &[ImagePart], instruction: &str) -> HubResult<GeneratedImage>;

    /// Plain text generation, used for prompt translation/combination.
    async fn generate_text(&self, prompt: &str) -> HubResult<String>;
}

/// Options for a video generation request.
#[derive(Debug, Clone)]
pub struct VideoOptions {
    pub aspect_ratio: String,
    pub resolution: String,
    pub negative_prompt: Option<String>,
}

/// State of an asynchronous video operation.
#[derive(Debug, Clone)]
pub enum VideoOperation {
    Pending,
    Done { video: Vec<u8> },
}

/// Asynchronous image-to-video synthesis via an operation handle.
#[async_trait]
pub trait VideoModel: Send + Sync {
    /// Start generation; returns an operation id to poll.
    async fn start(
        &self,
        image: &ImagePart,
        prompt: &str,
        options: &VideoOptions,
    ) -> HubResult<String>;

    /// Poll an operation until it reports done.
    async fn poll(&self, operation_id: &str) -> HubResult<VideoOperation>;
}

/// REST client for the generative provider.
pub struct GenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    image_model: String,
    video_model: String,
}

impl GenAiClient {
    pub fn new(
        api_key: String,
        image_model: String,
        video_model: String,
        http_timeout: Duration,
    ) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|err| HubError::new(ErrorCode::ConnectionFailed, err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key,
            image_model,
            video_model,
        })
    }

    fn provider_error(context: &str, err: reqwest::Error) -> HubError {
        if err.is_timeout() || err.is_connect() {
            HubError::new(ErrorCode::NetworkError, format!("{context}: {err}"))
        } else {
            HubError::new(ErrorCode::ApiUnavailable, format!("{context}: {err}"))
        }
    }

    async fn post(&self, path: &str, body: &Value) -> HubResult<Value> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::provider_error(path, e))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(30);
            return Err(HubError::new(
                ErrorCode::ApiRateLimited,
                "provider rate limit reached",
            )
            .with_retry_after(retry_after));
        }
        if !response.status().is_success() {
            return Err(HubError::new(
                ErrorCode::ApiUnavailable,
                format!("provider returned {} for {path}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Self::provider_error(path, e))
    }

    async fn get(&self, path: &str) -> HubResult<Value> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| Self::provider_error(path, e))?;
        if !response.status().is_success() {
            return Err(HubError::new(
                ErrorCode::ApiUnavailable,
                format!("provider returned {} for {path}", response.status()),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Self::provider_error(path, e))
    }

    fn inline_part(part: &ImagePart) -> Value {
        serde_json::json!({
            "inline_data": {
                "mime_type": part.mime_type,
                "data": BASE64.encode(&part.data),
            }
        })
    }

    fn extract_inline_image(response: &Value) -> Option<GeneratedImage> {
        let candidates = response.get("candidates")?.as_array()?;
        for candidate in candidates {
            let parts = candidate.get("content")?.get("parts")?.as_array()?;
            for part in parts {
                let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data"))
                else {
                    continue;
                };
                let mime = inline.get("mimeType").or_else(|| inline.get("mime_type"));
                let Some(mime) = mime.and_then(Value::as_str) else {
                    continue;
                };
                if !mime.starts_with("image/") {
                    continue;
                }
                let data = inline.get("data").and_then(Value::as_str)?;
                let bytes = BASE64.decode(data).ok()?;
                return Some(GeneratedImage {
                    mime_type: mime.to_string(),
                    data: bytes,
                });
            }
        }
        None
    }
}

#[async_trait]
impl ImageModel for GenAiClient {
    async fn transform(&self, parts: &[ImagePart], instruction: &str) -> HubResult<GeneratedImage> {
        let mut request_parts: Vec<Value> = parts.iter().map(Self::inline_part).collect();
        request_parts.push(serde_json::json!({"text": instruction}));

        let body = serde_json::json!({
            "contents": [{"parts": request_parts}],
        });
        let path = format!("models/{}:generateContent", self.image_model);
        let response = self.post(&path, &body).await?;

        Self::extract_inline_image(&response).ok_or_else(|| {
            HubError::new(
                ErrorCode::TransformationFailed,
                "no image data in provider response",
            )
        })
    }

    async fn generate_text(&self, prompt: &str) -> HubResult<String> {
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}],
        });
        let path = format!("models/{}:generateContent", self.image_model);
        let response = self.post(&path, &body).await?;
        response
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                HubError::new(ErrorCode::ApiUnavailable, "no text in provider response")
            })
    }
}

#[async_trait]
impl VideoModel for GenAiClient {
    async fn start(
        &self,
        image: &ImagePart,
        prompt: &str,
        options: &VideoOptions,
    ) -> HubResult<String> {
        let mut parameters = serde_json::json!({
            "aspectRatio": options.aspect_ratio,
            "resolution": options.resolution,
        });
        if let Some(negative) = &options.negative_prompt {
            parameters["negativePrompt"] = Value::String(negative.clone());
        }
        let body = serde_json::json!({
            "instances": [{
                "prompt": prompt,
                "image": {
                    "bytesBase64Encoded": BASE64.encode(&image.data),
                    "mimeType": image.mime_type,
                },
            }],
            "parameters": parameters,
        });
        let path = format!("models/{}:predictLongRunning", self.video_model);
        let response = self.post(&path, &body).await?;
        response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                HubError::new(
                    ErrorCode::VideoGenerationFailed,
                    "provider did not return an operation handle",
                )
            })
    }

    async fn poll(&self, operation_id: &str) -> HubResult<VideoOperation> {
        let response = self.get(operation_id).await?;
        if !response.get("done").and_then(Value::as_bool).unwrap_or(false) {
            debug!("video operation {operation_id} still pending");
            return Ok(VideoOperation::Pending);
        }
        let encoded = response
            .pointer("/response/generateVideoResponse/generatedSamples/0/video/encodedVideo")
            .or_else(|| response.pointer("/response/generatedVideos/0/video/encodedVideo"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HubError::new(
                    ErrorCode::VideoGenerationFailed,
                    "no video data in completed operation",
                )
            })?;
        let video = BASE64.decode(encoded).map_err(|err| {
            HubError::new(
                ErrorCode::VideoGenerationFailed,
                format!("undecodable video payload: {err}"),
            )
        })?;
        Ok(VideoOperation::Done { video })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_image_extraction_handles_both_casings() {
        let png = vec![0x89, 0x50, 0x4e, 0x47];
        let camel = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"text": "some narration"},
                {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(&png)}},
            ]}}]
        });
        let snake = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"inline_data": {"mime_type": "image/png", "data": BASE64.encode(&png)}},
            ]}}]
        });
        for response in [camel, snake] {
            let image = GenAiClient::extract_inline_image(&response).unwrap();
            assert_eq!(image.mime_type, "image/png");
            assert_eq!(image.data, png);
        }
    }

    #[test]
    fn non_image_parts_are_ignored() {
        let response = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "audio/wav", "data": BASE64.encode(b"riff")}},
            ]}}]
        });
        assert!(GenAiClient::extract_inline_image(&response).is_none());
    }
}
