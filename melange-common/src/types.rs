//! Common types used across Melange components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorCode, HubError};

/// Maximum number of messages retained in a session's conversation ring.
pub const MAX_CONVERSATION_MESSAGES: usize = 50;

/// Maximum number of executed commands tracked in scene state.
pub const MAX_TRACKED_COMMANDS: usize = 10;

/// Content kind encoded in a UID prefix.
///
/// The prefix partitions the UID space: identifiers of different kinds can
/// never collide even though each kind has its own counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UidKind {
    /// Generated or captured images (`img_*`).
    Image,
    /// Generated videos (`vid_*`).
    Video,
    /// Downloaded 3D objects (`obj_*`).
    Object,
    /// Transcoded FBX models (`fbx_*`).
    Fbx,
    /// Reference images, allocated by the Reference Store only (`refer_*`).
    Reference,
}

impl UidKind {
    /// The textual prefix for this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Video => "vid",
            Self::Object => "obj",
            Self::Fbx => "fbx",
            Self::Reference => "refer",
        }
    }

    /// Parse a prefix back into a kind.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "img" => Some(Self::Image),
            "vid" => Some(Self::Video),
            "obj" => Some(Self::Object),
            "fbx" => Some(Self::Fbx),
            "refer" => Some(Self::Reference),
            _ => None,
        }
    }

    /// All kinds allocated by the main UID allocator (everything except
    /// the reference namespace, which has its own counter file).
    pub fn main_kinds() -> [UidKind; 4] {
        [Self::Image, Self::Video, Self::Object, Self::Fbx]
    }
}

impl std::fmt::Display for UidKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// A durable identifier of the form `<kind>_<zero-padded-integer>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(String);

impl Uid {
    /// Build a UID from a kind and counter value. Padding is at least
    /// three digits and never shrinks for larger counters.
    pub fn new(kind: UidKind, counter: u64) -> Self {
        Self(format!("{}_{:03}", kind.prefix(), counter))
    }

    /// Parse and validate a UID string.
    pub fn parse(s: &str) -> Result<Self, HubError> {
        let Some((prefix, digits)) = s.rsplit_once('_') else {
            return Err(invalid_uid(s));
        };
        if UidKind::from_prefix(prefix).is_none() {
            return Err(invalid_uid(s));
        }
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid_uid(s));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind encoded in the prefix. Valid by construction.
    pub fn kind(&self) -> UidKind {
        let prefix = self.0.rsplit_once('_').map(|(p, _)| p).unwrap_or("");
        UidKind::from_prefix(prefix).expect("uid constructed with a valid prefix")
    }

    /// The numeric counter portion.
    pub fn number(&self) -> u64 {
        self.0
            .rsplit_once('_')
            .and_then(|(_, n)| n.parse().ok())
            .expect("uid constructed with a numeric suffix")
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn invalid_uid(s: &str) -> HubError {
    HubError::new(
        ErrorCode::InvalidUidFormat,
        format!("not a valid UID: '{s}'"),
    )
    .with_suggestion("UIDs look like img_001, vid_042, obj_007, fbx_003, or refer_015")
}

/// Kind of a registered resource (the registry never holds references).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Video,
    Object3d,
}

impl ResourceKind {
    /// Whether `parent` is an acceptable parent kind for `self`.
    ///
    /// Images may descend from images or videos, videos must descend from
    /// images, and object3d records (FBX conversions) descend from other
    /// object3d records (the source OBJ).
    pub fn allows_parent(self, parent: ResourceKind) -> bool {
        match self {
            Self::Image => matches!(parent, Self::Image | Self::Video),
            Self::Video => matches!(parent, Self::Image),
            Self::Object3d => matches!(parent, Self::Object3d),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Object3d => write!(f, "object3d"),
        }
    }
}

/// One entry in the Resource Registry.
///
/// Created only after the underlying file is fully written; immutable
/// afterwards except through `update_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub uid: Uid,
    pub kind: ResourceKind,
    pub filename: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_uid: Option<Uid>,
    pub created_at: DateTime<Utc>,
    /// Bumped by `update_metadata`; equals `created_at` until then.
    pub updated_at: DateTime<Utc>,
    /// Free-form map: width/height/duration/file_path/source provenance.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ResourceRecord {
    /// The on-disk path recorded at registration time, if any.
    pub fn file_path(&self) -> Option<&str> {
        self.metadata.get("file_path").and_then(Value::as_str)
    }
}

/// Lifecycle state of an asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Durable record of an asynchronous unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// The UID this job produces or replaces. At most one active job may
    /// exist per target UID at any time.
    #[serde(default)]
    pub target_uid: Option<Uid>,
    pub status: JobStatus,
    /// Percentage in [0, 100], monotonically non-decreasing within a run.
    pub progress: u8,
    #[serde(default)]
    pub phase: Option<String>,
    pub params: Value,
    /// Present iff `status == Completed`.
    #[serde(default)]
    pub result: Option<Value>,
    /// Present iff the job failed or was cancelled with a reason.
    #[serde(default)]
    pub error: Option<HubError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Job,
}

/// Mutable status block attached to `role = job` messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobInfo {
    #[serde(default)]
    pub job_status: Option<String>,
    #[serde(default)]
    pub job_progress: Option<u8>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A single message in a session's conversation history.
///
/// Only `role = job` messages may be mutated after insertion, and only to
/// advance their progress/status/image_url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub commands: Vec<Value>,
    #[serde(default)]
    pub execution_results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_info: Option<JobInfo>,
}

/// A tracked point light in the editor scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightInfo {
    pub name: String,
    pub light_type: String,
    pub intensity: f64,
    pub color: serde_json::Map<String, Value>,
    #[serde(default)]
    pub location: Option<serde_json::Map<String, Value>>,
}

/// A tracked actor in the editor scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorInfo {
    pub name: String,
    pub actor_class: String,
    #[serde(default)]
    pub location: Option<serde_json::Map<String, Value>>,
}

/// Geographic anchor of the scene.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Latest known state of the editor scene, reconstructed from successfully
/// executed commands only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneState {
    #[serde(default)]
    pub actors: Vec<ActorInfo>,
    #[serde(default)]
    pub lights: Vec<LightInfo>,
    #[serde(default)]
    pub sky_settings: serde_json::Map<String, Value>,
    #[serde(default)]
    pub geolocation: Option<GeoLocation>,
    /// Bounded ring of the last executed commands, newest last.
    #[serde(default)]
    pub last_commands: Vec<Value>,
    pub last_updated: DateTime<Utc>,
}

impl Default for SceneState {
    fn default() -> Self {
        Self {
            actors: Vec::new(),
            lights: Vec::new(),
            sky_settings: serde_json::Map::new(),
            geolocation: None,
            last_commands: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl SceneState {
    /// Fold a successfully executed command into the scene state.
    pub fn apply_command_result(&mut self, command: &str, params: &Value, result: &Value) {
        self.last_updated = Utc::now();
        self.last_commands.push(serde_json::json!({
            "command": command,
            "params": params,
            "result": result,
            "timestamp": self.last_updated.to_rfc3339(),
        }));
        if self.last_commands.len() > MAX_TRACKED_COMMANDS {
            let overflow = self.last_commands.len() - MAX_TRACKED_COMMANDS;
            self.last_commands.drain(..overflow);
        }

        match command {
            "create_mm_control_light" => {
                let name = result
                    .get("actor_name")
                    .or_else(|| params.get("light_name"))
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string();
                let light = LightInfo {
                    name: name.clone(),
                    light_type: "PointLight".to_string(),
                    intensity: params
                        .get("intensity")
                        .and_then(Value::as_f64)
                        .unwrap_or(1000.0),
                    color: params
                        .get("color")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                    location: params.get("location").and_then(Value::as_object).cloned(),
                };
                self.lights.retain(|l| l.name != name);
                self.lights.push(light);
            }
            "delete_mm_control_light" => {
                if let Some(name) = params.get("light_name").and_then(Value::as_str) {
                    self.lights.retain(|l| l.name != name);
                }
            }
            "set_latitude_longitude" => {
                let lat = params.get("latitude").and_then(Value::as_f64);
                let lng = params.get("longitude").and_then(Value::as_f64);
                if let (Some(latitude), Some(longitude)) = (lat, lng) {
                    self.geolocation = Some(GeoLocation {
                        latitude,
                        longitude,
                    });
                }
            }
            "set_time_of_day" => {
                if let Some(v) = params.get("time_of_day") {
                    self.sky_settings.insert("time_of_day".to_string(), v.clone());
                }
            }
            "set_color_temperature" => {
                if let Some(v) = params.get("color_temperature") {
                    self.sky_settings
                        .insert("color_temperature".to_string(), v.clone());
                }
            }
            _ => {}
        }
    }
}

/// Complete session context: conversation plus scene state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub session_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    #[serde(default)]
    pub scene_state: SceneState,
    #[serde(default)]
    pub user_preferences: serde_json::Map<String, Value>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

fn default_llm_model() -> String {
    "gemini-2".to_string()
}

impl SessionContext {
    pub fn new(session_id: String, session_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            session_name,
            created_at: now,
            last_accessed: now,
            conversation_history: Vec::new(),
            scene_state: SceneState::default(),
            user_preferences: serde_json::Map::new(),
            llm_model: default_llm_model(),
        }
    }

    /// Append a message, truncating the ring oldest-first on overflow.
    pub fn add_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        commands: Vec<Value>,
        execution_results: Vec<Value>,
    ) {
        self.conversation_history.push(ChatMessage {
            timestamp: Utc::now(),
            role,
            content: content.into(),
            commands,
            execution_results,
            job_id: None,
            job_info: None,
        });
        self.truncate_history();
        self.last_accessed = Utc::now();
    }

    /// Append a `role = job` status message.
    pub fn add_job_message(
        &mut self,
        job_id: &str,
        job_status: &str,
        content: impl Into<String>,
        job_progress: Option<u8>,
        image_url: Option<String>,
    ) {
        self.conversation_history.push(ChatMessage {
            timestamp: Utc::now(),
            role: MessageRole::Job,
            content: content.into(),
            commands: Vec::new(),
            execution_results: Vec::new(),
            job_id: Some(job_id.to_string()),
            job_info: Some(JobInfo {
                job_status: Some(job_status.to_string()),
                job_progress,
                image_url,
            }),
        });
        self.truncate_history();
        self.last_accessed = Utc::now();
    }

    /// Update the most recent job message for `job_id` in place, or append
    /// a new one when none exists. Job messages are the only messages whose
    /// later state may change.
    pub fn update_job_message(
        &mut self,
        job_id: &str,
        job_status: &str,
        content: Option<&str>,
        job_progress: Option<u8>,
        image_url: Option<String>,
    ) {
        for message in self.conversation_history.iter_mut().rev() {
            if message.role == MessageRole::Job && message.job_id.as_deref() == Some(job_id) {
                let info = message.job_info.get_or_insert_with(JobInfo::default);
                info.job_status = Some(job_status.to_string());
                if job_progress.is_some() {
                    info.job_progress = job_progress;
                }
                if image_url.is_some() {
                    info.image_url = image_url;
                }
                if let Some(content) = content {
                    message.content = content.to_string();
                }
                message.timestamp = Utc::now();
                self.last_accessed = Utc::now();
                return;
            }
        }
        let content = content
            .map(str::to_string)
            .unwrap_or_else(|| format!("Job {job_id} status: {job_status}"));
        self.add_job_message(job_id, job_status, content, job_progress, image_url);
    }

    /// Record a full user/assistant interaction and fold successful command
    /// results into the scene state.
    pub fn add_interaction(
        &mut self,
        user_input: &str,
        assistant_content: &str,
        commands: Vec<Value>,
        execution_results: Vec<Value>,
    ) {
        self.add_message(MessageRole::User, user_input, Vec::new(), Vec::new());
        for (command, result) in commands.iter().zip(execution_results.iter()) {
            let succeeded = result.get("success").and_then(Value::as_bool).unwrap_or(false);
            if succeeded {
                let command_type = command.get("type").and_then(Value::as_str).unwrap_or("");
                let params = command.get("params").cloned().unwrap_or(Value::Null);
                let payload = result.get("result").cloned().unwrap_or(Value::Null);
                self.scene_state
                    .apply_command_result(command_type, &params, &payload);
            }
        }
        self.add_message(
            MessageRole::Assistant,
            assistant_content,
            commands,
            execution_results,
        );
    }

    pub fn interaction_count(&self) -> usize {
        self.conversation_history
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count()
    }

    fn truncate_history(&mut self) {
        if self.conversation_history.len() > MAX_CONVERSATION_MESSAGES {
            let overflow = self.conversation_history.len() - MAX_CONVERSATION_MESSAGES;
            self.conversation_history.drain(..overflow);
        }
    }
}

/// A structured request handed to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

/// Uniform result shape every plugin execution produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HubError>,
}

impl CommandResult {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: HubError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}
