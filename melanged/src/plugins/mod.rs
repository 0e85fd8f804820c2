//! Tool plugins and their registry.
//!
//! The hub is organized around tools: each plugin declares metadata and a
//! set of command types, validates and preprocesses parameters, and
//! executes commands either immediately or by queueing a job. The
//! registry owns the command-type -> plugin mapping and refuses duplicate
//! registrations and execution on unavailable plugins.

pub mod avatar;
pub mod dispatch;
pub mod editor;
pub mod image;
pub mod prompt;
pub mod video;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::types::{CommandResult, JobRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Capability tags a plugin can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Mesh3dCreation,
    SceneManagement,
    Rendering,
    VideoGeneration,
    ImageEditing,
    LightingControl,
    Geospatial,
}

/// Health of a plugin, probed before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginHealth {
    Available,
    Unavailable,
    Error,
}

/// Static facts about a plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub tool_id: &'static str,
    pub display_name: &'static str,
    pub version: &'static str,
    pub capabilities: Vec<Capability>,
    /// Whether the plugin needs a live external connection to execute.
    pub requires_connection: bool,
    pub pricing_tier: &'static str,
}

/// Outcome of parameter validation.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// How a command completed: synchronously with a result, or by queueing
/// a job whose handle the caller polls.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Immediate(CommandResult),
    Queued { job: JobRecord, poll_url: String },
}

impl CommandOutcome {
    /// Flatten into the uniform result shape for transport.
    pub fn into_result(self) -> CommandResult {
        match self {
            Self::Immediate(result) => result,
            Self::Queued { job, poll_url } => CommandResult::ok(serde_json::json!({
                "queued": true,
                "job_id": job.job_id,
                "status": job.status.to_string(),
                "target_uid": job.target_uid.as_ref().map(|u| u.as_str().to_string()),
                "poll_url": poll_url,
            })),
        }
    }
}

/// A unit of capability: declares commands, validates them, executes them.
#[async_trait]
pub trait ToolPlugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    fn supported_commands(&self) -> Vec<&'static str>;

    async fn initialize(&self) -> HubResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn health_check(&self) -> PluginHealth;

    /// Schema validation, including range checks. Must not touch external
    /// systems.
    fn validate(&self, command_type: &str, params: &Value) -> Validation;

    /// Defaults injection, translation, normalization. May consult
    /// external systems (e.g. prompt translation).
    async fn preprocess(&self, _command_type: &str, params: Value) -> HubResult<Value> {
        Ok(params)
    }

    async fn execute(&self, command_type: &str, params: Value) -> HubResult<CommandOutcome>;
}

/// Build the standard plugin set over a services handle.
pub fn standard_registry(services: &Arc<crate::services::Services>) -> HubResult<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(editor::EditorPlugin::new(Arc::clone(services))))?;
    registry.register(Arc::new(image::ImageTransformPlugin::new(Arc::clone(
        services,
    ))))?;
    registry.register(Arc::new(video::VideoGenerationPlugin::new(Arc::clone(
        services,
    ))))?;
    registry.register(Arc::new(avatar::AvatarPipelinePlugin::new(Arc::clone(
        services,
    ))))?;
    Ok(registry)
}

/// Command-type -> plugin routing table.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn ToolPlugin>>,
    by_command: HashMap<String, usize>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin; every declared command must be unowned.
    pub fn register(&mut self, plugin: Arc<dyn ToolPlugin>) -> HubResult<()> {
        let metadata = plugin.metadata();
        let index = self.plugins.len();
        for command in plugin.supported_commands() {
            if self.by_command.contains_key(command) {
                return Err(HubError::new(
                    ErrorCode::CommandFailed,
                    format!(
                        "command '{command}' is already registered; cannot add {}",
                        metadata.tool_id
                    ),
                ));
            }
        }
        for command in plugin.supported_commands() {
            self.by_command.insert(command.to_string(), index);
        }
        info!(
            "registered plugin {} v{} ({} commands)",
            metadata.tool_id,
            metadata.version,
            plugin.supported_commands().len()
        );
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn plugin_for(&self, command_type: &str) -> Option<Arc<dyn ToolPlugin>> {
        self.by_command
            .get(command_type)
            .map(|&index| Arc::clone(&self.plugins[index]))
    }

    pub fn plugins(&self) -> &[Arc<dyn ToolPlugin>] {
        &self.plugins
    }

    /// Health of the whole set, keyed by tool id.
    pub async fn health_status(&self) -> HashMap<&'static str, PluginHealth> {
        let mut statuses = HashMap::new();
        for plugin in &self.plugins {
            statuses.insert(plugin.metadata().tool_id, plugin.health_check().await);
        }
        statuses
    }

    pub async fn shutdown_all(&self) {
        for plugin in &self.plugins {
            plugin.shutdown().await;
        }
    }
}
