//! Avatar platform edge: user resolution, 3D metadata polling, and
//! multi-mirror CDN downloads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use serde_json::Value;
use tracing::{debug, info, warn};

/// A resolved platform user.
#[derive(Debug, Clone)]
pub struct AvatarUser {
    pub id: u64,
    pub name: String,
    pub display_name: Option<String>,
}

/// The 3D payload advertised for a user's avatar.
#[derive(Debug, Clone, Default)]
pub struct Avatar3dMetadata {
    /// Content hash of the OBJ mesh.
    pub obj: Option<String>,
    /// Content hash of the MTL material library.
    pub mtl: Option<String>,
    /// Content hashes of texture images.
    pub textures: Vec<String>,
    /// Camera block from the metadata document (position, fov).
    pub camera: Value,
    /// Axis-aligned bounding box from the metadata document.
    pub aabb: Value,
}

/// Everything the download pipeline needs from the avatar platform.
#[async_trait]
pub trait AvatarSource: Send + Sync {
    /// Resolve a numeric id or a handle; `Ok(None)` when no such user.
    async fn resolve_user(&self, input: &str) -> HubResult<Option<AvatarUser>>;

    /// Fetch 3D metadata, polling through the platform's processing
    /// states with bounded attempts and backoff on rate-limit signals.
    async fn avatar_3d_metadata(&self, user_id: u64) -> HubResult<Avatar3dMetadata>;

    /// The rig type of the user's avatar (`R6`, `R15`, or `Unknown`).
    async fn avatar_type(&self, user_id: u64) -> HubResult<String>;

    /// Download a content hash to `dest`, trying mirrors in order.
    /// Returns the byte count written.
    async fn download_to_file(&self, hash: &str, dest: &Path) -> HubResult<u64>;
}

/// Primary CDN host for a content hash.
///
/// The host index is a deterministic function of the hash: fold the first
/// 38 bytes into 31 with XOR and take the result mod 8.
pub fn primary_cdn_url(hash: &str) -> String {
    let mut i: u32 = 31;
    for byte in hash.bytes().take(38) {
        i ^= byte as u32;
    }
    format!("https://t{}.rbxcdn.com/{hash}", i % 8)
}

/// Ordered candidate URLs for a hash: the computed primary first, then
/// the remaining numbered mirrors, then the legacy hosts.
pub fn candidate_urls(hash: &str) -> Vec<String> {
    let mut candidates = vec![primary_cdn_url(hash)];
    for n in 0..8 {
        let url = format!("https://t{n}.rbxcdn.com/{hash}");
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }
    for host in ["tr", "c0", "c1"] {
        candidates.push(format!("https://{host}.rbxcdn.com/{hash}"));
    }
    candidates
}

/// HTTP implementation against the public platform APIs.
pub struct RobloxWeb {
    client: reqwest::Client,
    metadata_poll_attempts: u32,
}

impl RobloxWeb {
    pub fn new(http_timeout: Duration, metadata_poll_attempts: u32) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .build()
            .map_err(|err| HubError::new(ErrorCode::ConnectionFailed, err.to_string()))?;
        Ok(Self {
            client,
            metadata_poll_attempts,
        })
    }

    fn network(context: &str, err: reqwest::Error) -> HubError {
        HubError::new(ErrorCode::NetworkError, format!("{context}: {err}"))
    }

    async fn user_by_id(&self, user_id: u64) -> HubResult<Option<AvatarUser>> {
        let url = format!("https://users.roblox.com/v1/users/{user_id}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::network("user lookup", e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = response
            .error_for_status()
            .map_err(|e| Self::network("user lookup", e))?
            .json()
            .await
            .map_err(|e| Self::network("user lookup", e))?;
        Ok(parse_user(&body))
    }

    async fn user_by_name(&self, username: &str) -> HubResult<Option<AvatarUser>> {
        let body: Value = self
            .client
            .post("https://users.roblox.com/v1/usernames/users")
            .json(&serde_json::json!({"usernames": [username]}))
            .send()
            .await
            .map_err(|e| Self::network("username search", e))?
            .error_for_status()
            .map_err(|e| Self::network("username search", e))?
            .json()
            .await
            .map_err(|e| Self::network("username search", e))?;
        let user = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(parse_user_opt);
        Ok(user)
    }
}

fn parse_user(body: &Value) -> Option<AvatarUser> {
    Some(AvatarUser {
        id: body.get("id")?.as_u64()?,
        name: body.get("name")?.as_str()?.to_string(),
        display_name: body
            .get("displayName")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_user_opt(body: &Value) -> Option<AvatarUser> {
    parse_user(body)
}

/// Parse the metadata document served from the CDN `imageUrl`.
pub fn parse_metadata_document(document: &Value) -> Avatar3dMetadata {
    Avatar3dMetadata {
        obj: document
            .get("obj")
            .and_then(Value::as_str)
            .map(str::to_string),
        mtl: document
            .get("mtl")
            .and_then(Value::as_str)
            .map(str::to_string),
        textures: document
            .get("textures")
            .and_then(Value::as_array)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        camera: document.get("camera").cloned().unwrap_or(Value::Null),
        aabb: document.get("aabb").cloned().unwrap_or(Value::Null),
    }
}

#[async_trait]
impl AvatarSource for RobloxWeb {
    async fn resolve_user(&self, input: &str) -> HubResult<Option<AvatarUser>> {
        let input = input.trim();
        if input.chars().all(|c| c.is_ascii_digit()) && !input.is_empty() {
            let id: u64 = input.parse().map_err(|_| {
                HubError::new(ErrorCode::InvalidUserInput, format!("bad user id: {input}"))
            })?;
            debug!("resolving numeric user id {id}");
            return self.user_by_id(id).await;
        }
        debug!("resolving username '{input}'");
        self.user_by_name(input).await
    }

    async fn avatar_3d_metadata(&self, user_id: u64) -> HubResult<Avatar3dMetadata> {
        let url = "https://thumbnails.roblox.com/v1/users/avatar-3d";
        let base_delay = Duration::from_secs(1);

        for attempt in 1..=self.metadata_poll_attempts {
            let response = self
                .client
                .get(url)
                .query(&[("userId", user_id.to_string())])
                .send()
                .await
                .map_err(|e| Self::network("avatar-3d", e))?;

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let backoff = (base_delay * attempt).min(Duration::from_secs(5));
                info!(
                    "avatar-3d rate limited; retrying in {:?} ({attempt}/{})",
                    backoff, self.metadata_poll_attempts
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            let body: Value = response
                .error_for_status()
                .map_err(|e| Self::network("avatar-3d", e))?
                .json()
                .await
                .map_err(|e| Self::network("avatar-3d", e))?;

            match body.get("state").and_then(Value::as_str) {
                Some("Completed") => {
                    let Some(image_url) = body.get("imageUrl").and_then(Value::as_str) else {
                        return Err(avatar_unavailable(user_id, "no metadata url"));
                    };
                    let document: Value = self
                        .client
                        .get(image_url)
                        .send()
                        .await
                        .map_err(|e| Self::network("metadata document", e))?
                        .error_for_status()
                        .map_err(|e| Self::network("metadata document", e))?
                        .json()
                        .await
                        .map_err(|e| Self::network("metadata document", e))?;
                    return Ok(parse_metadata_document(&document));
                }
                Some("Pending") | Some("InProgress") | None => {
                    if attempt < self.metadata_poll_attempts {
                        tokio::time::sleep(base_delay).await;
                        continue;
                    }
                    return Err(avatar_unavailable(user_id, "processing did not complete"));
                }
                Some(state) => {
                    return Err(avatar_unavailable(user_id, state));
                }
            }
        }
        Err(avatar_unavailable(user_id, "rate limited on every attempt")
            .with_retry_after(30))
    }

    async fn avatar_type(&self, user_id: u64) -> HubResult<String> {
        let url = format!("https://avatar.roblox.com/v1/users/{user_id}/avatar");
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::network("avatar config", e))?
            .error_for_status()
            .map_err(|e| Self::network("avatar config", e))?
            .json()
            .await
            .map_err(|e| Self::network("avatar config", e))?;
        Ok(body
            .get("playerAvatarType")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string())
    }

    async fn download_to_file(&self, hash: &str, dest: &Path) -> HubResult<u64> {
        let candidates = candidate_urls(hash);
        for (index, url) in candidates.iter().enumerate() {
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) if !bytes.is_empty() => {
                            tokio::fs::write(dest, &bytes).await?;
                            debug!("downloaded {hash} from mirror #{index} ({} bytes)", bytes.len());
                            return Ok(bytes.len() as u64);
                        }
                        Ok(_) => {
                            debug!("mirror #{index} returned an empty body for {hash}");
                        }
                        Err(err) => {
                            debug!("mirror #{index} body read failed for {hash}: {err}");
                        }
                    }
                }
                Ok(response) => {
                    debug!("mirror #{index} returned {} for {hash}", response.status());
                }
                Err(err) => {
                    debug!("mirror #{index} failed for {hash}: {err}");
                }
            }
            if index + 1 < candidates.len() {
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
        }
        warn!("all mirrors exhausted for {hash}");
        Err(HubError::new(
            ErrorCode::DownloadFailed,
            format!("all CDN mirrors failed for hash {hash}"),
        ))
    }
}

fn avatar_unavailable(user_id: u64, reason: &str) -> HubError {
    HubError::new(
        ErrorCode::Avatar3dUnavailable,
        format!("3D avatar unavailable for user {user_id}: {reason}"),
    )
    .with_suggestion("the avatar may still be processing; try again shortly")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_cdn_host_is_deterministic() {
        let hash = "30acd4f9c6f0e51b91f9985432f8ed89";
        let a = primary_cdn_url(hash);
        let b = primary_cdn_url(hash);
        assert_eq!(a, b);
        assert!(a.starts_with("https://t"));
        assert!(a.ends_with(hash));
    }

    #[test]
    fn xor_selector_matches_reference_values() {
        // i = 31, folded over the hash bytes, mod 8.
        let hash = "abc";
        let mut i: u32 = 31;
        for b in hash.bytes() {
            i ^= b as u32;
        }
        let expected = format!("https://t{}.rbxcdn.com/{hash}", i % 8);
        assert_eq!(primary_cdn_url(hash), expected);
    }

    #[test]
    fn selector_only_folds_the_first_38_bytes() {
        let head = "x".repeat(38);
        let long = format!("{head}ignored-tail-1");
        let longer = format!("{head}completely-different-tail");
        let host = |url: &str| url.split('/').nth(2).unwrap().to_string();
        assert_eq!(
            host(&primary_cdn_url(&long)),
            host(&primary_cdn_url(&longer))
        );
    }

    #[test]
    fn candidates_cover_all_mirrors_without_duplicates() {
        let candidates = candidate_urls("somehash");
        // Primary + remaining 7 numbered mirrors + 3 legacy hosts.
        assert_eq!(candidates.len(), 11);
        let unique: std::collections::HashSet<&String> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
        assert_eq!(candidates[0], primary_cdn_url("somehash"));
        assert!(candidates.iter().any(|u| u.contains("tr.rbxcdn.com")));
    }

    #[test]
    fn metadata_document_parsing() {
        let document = serde_json::json!({
            "obj": "hash-obj",
            "mtl": "hash-mtl",
            "textures": ["t1", "t2"],
            "camera": {"fov": 70},
            "aabb": {"min": [0, 0, 0]},
        });
        let meta = parse_metadata_document(&document);
        assert_eq!(meta.obj.as_deref(), Some("hash-obj"));
        assert_eq!(meta.mtl.as_deref(), Some("hash-mtl"));
        assert_eq!(meta.textures, vec!["t1", "t2"]);
        assert_eq!(meta.camera["fov"], 70);
    }

    #[test]
    fn metadata_document_tolerates_missing_fields() {
        let meta = parse_metadata_document(&serde_json::json!({}));
        assert!(meta.obj.is_none());
        assert!(meta.textures.is_empty());
    }
}
