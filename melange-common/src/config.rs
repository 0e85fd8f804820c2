//! Configuration for the Melange daemon.
//!
//! Layering, most specific first: explicit TOML file -> environment
//! variables -> built-in defaults. Every section is serde-defaulted so a
//! partial file stays valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Explicit editor project root. When unset, `UNREAL_PROJECT_PATH`
    /// then `UE_PROJECT_PATH` are consulted, then a fallback under the
    /// working directory.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    /// Create intermediate directories on first use.
    #[serde(default = "default_true")]
    pub create_directories: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: None,
            create_directories: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Host:port of the editor's TCP command listener.
    #[serde(default = "default_editor_addr")]
    pub editor_addr: String,
    #[serde(default = "default_editor_timeout")]
    pub editor_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            editor_addr: default_editor_addr(),
            editor_timeout_secs: default_editor_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Age after which terminal jobs are discarded by the background sweep.
    #[serde(default = "default_retention_days")]
    pub terminal_retention_days: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// `in_progress` rows older than this at startup are marked failed.
    #[serde(default = "default_restart_abort")]
    pub restart_abort_timeout_secs: u64,
    /// Age used by the HTTP cleanup endpoint.
    #[serde(default = "default_cleanup_age_hours")]
    pub http_cleanup_age_hours: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            terminal_retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval(),
            restart_abort_timeout_secs: default_restart_abort(),
            http_cleanup_age_hours: default_cleanup_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Seconds between download-completion polls in the full pipeline.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Hard ceiling for the whole download phase.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
    /// Hard timeout for the external OBJ -> FBX transcoder.
    #[serde(default = "default_transcoder_timeout")]
    pub transcoder_timeout_secs: u64,
    /// Bounded attempts for the avatar metadata poll.
    #[serde(default = "default_metadata_attempts")]
    pub metadata_poll_attempts: u32,
    /// Path to the headless transcoder executable.
    #[serde(default = "default_transcoder_path")]
    pub transcoder_path: PathBuf,
    /// Conversion script handed to the transcoder.
    #[serde(default)]
    pub transcoder_script: Option<PathBuf>,
    /// Bundled base scene file loaded before the script runs.
    #[serde(default)]
    pub base_scene: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            download_timeout_secs: default_download_timeout(),
            transcoder_timeout_secs: default_transcoder_timeout(),
            metadata_poll_attempts: default_metadata_attempts(),
            transcoder_path: default_transcoder_path(),
            transcoder_script: None,
            base_scene: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// API key for the generative provider. Presence gates the health of
    /// the image and video plugins. Read from `GOOGLE_API_KEY` when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_video_poll_interval")]
    pub video_poll_interval_secs: u64,
    #[serde(default = "default_video_poll_timeout")]
    pub video_poll_timeout_secs: u64,
    /// Per-HTTP-attempt timeout for all provider calls.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Request-size guard: total payload bytes.
    #[serde(default = "default_max_request_mb")]
    pub max_request_mb: f64,
    /// Request-size guard: rough token estimate.
    #[serde(default = "default_max_request_tokens")]
    pub max_request_tokens: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            image_model: default_image_model(),
            video_model: default_video_model(),
            video_poll_interval_secs: default_video_poll_interval(),
            video_poll_timeout_secs: default_video_poll_timeout(),
            http_timeout_secs: default_http_timeout(),
            max_request_mb: default_max_request_mb(),
            max_request_tokens: default_max_request_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Base URL of the network record store. When unset, only the file
    /// backend runs and every operation goes straight to it.
    #[serde(default)]
    pub record_store_url: Option<String>,
    /// API key for the record store; read from `MELANGE_RECORD_STORE_KEY`
    /// when unset.
    #[serde(default)]
    pub record_store_key: Option<String>,
    /// Session files older than this are demoted to the archived tree.
    #[serde(default = "default_archive_days")]
    pub archive_after_days: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            record_store_url: None,
            record_store_key: None,
            archive_after_days: default_archive_days(),
        }
    }
}

impl HubConfig {
    /// Load configuration from an optional TOML file and apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str(&text) {
                    Ok(config) => config,
                    Err(err) => {
                        warn!("invalid config file {}: {err}", path.display());
                        Self::default()
                    }
                },
                Err(err) => {
                    warn!("cannot read config file {}: {err}", path.display());
                    Self::default()
                }
            },
            None => Self::default(),
        };
        config.apply_env();
        config
    }

    /// Environment overrides, applied after file parsing.
    pub fn apply_env(&mut self) {
        if self.paths.project_root.is_none() {
            for var in ["UNREAL_PROJECT_PATH", "UE_PROJECT_PATH"] {
                if let Ok(value) = std::env::var(var) {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        self.paths.project_root = Some(PathBuf::from(trimmed));
                        break;
                    }
                }
            }
        }
        if self.providers.api_key.is_none() {
            if let Ok(key) = std::env::var("GOOGLE_API_KEY") {
                if !key.trim().is_empty() {
                    self.providers.api_key = Some(key);
                }
            }
        }
        if self.sessions.record_store_url.is_none() {
            if let Ok(url) = std::env::var("MELANGE_RECORD_STORE_URL") {
                if !url.trim().is_empty() {
                    self.sessions.record_store_url = Some(url);
                }
            }
        }
        if self.sessions.record_store_key.is_none() {
            if let Ok(key) = std::env::var("MELANGE_RECORD_STORE_KEY") {
                if !key.trim().is_empty() {
                    self.sessions.record_store_key = Some(key);
                }
            }
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    8765
}

fn default_editor_addr() -> String {
    "127.0.0.1:55557".to_string()
}

fn default_editor_timeout() -> u64 {
    30
}

fn default_retention_days() -> u64 {
    7
}

fn default_archive_days() -> u64 {
    7
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_restart_abort() -> u64 {
    300
}

fn default_cleanup_age_hours() -> u64 {
    24
}

fn default_poll_interval() -> u64 {
    5
}

fn default_download_timeout() -> u64 {
    300
}

fn default_transcoder_timeout() -> u64 {
    300
}

fn default_metadata_attempts() -> u32 {
    10
}

fn default_transcoder_path() -> PathBuf {
    PathBuf::from("blender")
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_video_model() -> String {
    "veo-3.0-generate-001".to_string()
}

fn default_video_poll_interval() -> u64 {
    20
}

fn default_video_poll_timeout() -> u64 {
    360
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_request_mb() -> f64 {
    18.0
}

fn default_max_request_tokens() -> u64 {
    900_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HubConfig::default();
        assert!(config.paths.create_directories);
        assert_eq!(config.pipeline.poll_interval_secs, 5);
        assert_eq!(config.pipeline.download_timeout_secs, 300);
        assert_eq!(config.providers.video_poll_interval_secs, 20);
        assert_eq!(config.providers.video_poll_timeout_secs, 360);
        assert_eq!(config.jobs.terminal_retention_days, 7);
        assert_eq!(config.providers.video_model, "veo-3.0-generate-001");
    }

    #[test]
    fn partial_toml_parses_with_defaults() {
        let config: HubConfig = toml::from_str(
            r#"
            [pipeline]
            poll_interval_secs = 2

            [providers]
            video_model = "veo-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.poll_interval_secs, 2);
        assert_eq!(config.pipeline.download_timeout_secs, 300);
        assert_eq!(config.providers.video_model, "veo-test");
    }
}
