//! The single entry point for executing a command object.
//!
//! Pipeline: locate the owning plugin, check its health, validate,
//! preprocess, execute. Every thrown error is translated into the
//! uniform [`CommandResult`] shape; nothing escapes as a bare error.

use melange_common::errors::{ErrorCode, HubError};
use melange_common::types::{Command, CommandResult};
use tracing::{debug, warn};

use super::{CommandOutcome, PluginHealth, PluginRegistry};

pub struct Dispatcher {
    registry: PluginRegistry,
}

impl Dispatcher {
    pub fn new(registry: PluginRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Execute one command through the full pipeline.
    pub async fn dispatch(&self, command: &Command) -> CommandOutcome {
        let Some(plugin) = self.registry.plugin_for(&command.command_type) else {
            return CommandOutcome::Immediate(CommandResult::err(
                HubError::new(
                    ErrorCode::UnknownCommand,
                    format!("no plugin owns command '{}'", command.command_type),
                )
                .with_suggestion("check the command type for typos"),
            ));
        };

        let health = plugin.health_check().await;
        if health != PluginHealth::Available {
            let tool_id = plugin.metadata().tool_id;
            warn!(
                "refusing '{}' on {:?} plugin {tool_id}",
                command.command_type, health
            );
            return CommandOutcome::Immediate(CommandResult::err(
                HubError::new(
                    ErrorCode::PluginUnavailable,
                    format!("plugin '{tool_id}' is not available"),
                )
                .with_details(serde_json::json!({"health": health})),
            ));
        }

        let validation = plugin.validate(&command.command_type, &command.params);
        if !validation.valid {
            debug!(
                "validation failed for '{}': {}",
                command.command_type,
                validation.errors.join("; ")
            );
            return CommandOutcome::Immediate(CommandResult::err(
                HubError::new(
                    ErrorCode::ValidationFailed,
                    format!("invalid parameters for '{}'", command.command_type),
                )
                .with_details(serde_json::json!({"errors": validation.errors})),
            ));
        }

        let params = match plugin
            .preprocess(&command.command_type, command.params.clone())
            .await
        {
            Ok(params) => params,
            Err(err) => {
                warn!("preprocess failed for '{}': {err}", command.command_type);
                return CommandOutcome::Immediate(CommandResult::err(err));
            }
        };

        match plugin.execute(&command.command_type, params).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("'{}' failed: {err}", command.command_type);
                CommandOutcome::Immediate(CommandResult::err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Capability, PluginMetadata, ToolPlugin, Validation};
    use async_trait::async_trait;
    use melange_common::errors::HubResult;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Doubler {
        health: PluginHealth,
    }

    #[async_trait]
    impl ToolPlugin for Doubler {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata {
                tool_id: "doubler",
                display_name: "Doubler",
                version: "0.0.1",
                capabilities: vec![Capability::SceneManagement],
                requires_connection: false,
                pricing_tier: "free",
            }
        }

        fn supported_commands(&self) -> Vec<&'static str> {
            vec!["double"]
        }

        async fn health_check(&self) -> PluginHealth {
            self.health
        }

        fn validate(&self, _command_type: &str, params: &Value) -> Validation {
            match params.get("n").and_then(Value::as_i64) {
                Some(_) => Validation::ok(),
                None => Validation::from_errors(vec!["n is required".to_string()]),
            }
        }

        async fn preprocess(&self, _command_type: &str, mut params: Value) -> HubResult<Value> {
            // Defaults injection: a missing multiplier becomes 2.
            if params.get("multiplier").is_none() {
                params["multiplier"] = json!(2);
            }
            Ok(params)
        }

        async fn execute(&self, _command_type: &str, params: Value) -> HubResult<CommandOutcome> {
            let n = params["n"].as_i64().unwrap();
            let multiplier = params["multiplier"].as_i64().unwrap();
            Ok(CommandOutcome::Immediate(CommandResult::ok(
                json!({"value": n * multiplier}),
            )))
        }
    }

    fn dispatcher(health: PluginHealth) -> Dispatcher {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(Doubler { health })).unwrap();
        Dispatcher::new(registry)
    }

    fn command(command_type: &str, params: Value) -> Command {
        Command {
            command_type: command_type.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn happy_path_runs_validate_preprocess_execute() {
        let dispatcher = dispatcher(PluginHealth::Available);
        let outcome = dispatcher.dispatch(&command("double", json!({"n": 21}))).await;
        let result = outcome.into_result();
        assert!(result.success);
        assert_eq!(result.result.unwrap()["value"], 42);
    }

    #[tokio::test]
    async fn unknown_command_is_typed() {
        let dispatcher = dispatcher(PluginHealth::Available);
        let result = dispatcher
            .dispatch(&command("nonsense", json!({})))
            .await
            .into_result();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().error_code, ErrorCode::UnknownCommand);
    }

    #[tokio::test]
    async fn validation_errors_are_wrapped() {
        let dispatcher = dispatcher(PluginHealth::Available);
        let result = dispatcher
            .dispatch(&command("double", json!({})))
            .await
            .into_result();
        assert!(!result.success);
        let err = result.error.unwrap();
        assert_eq!(err.error_code, ErrorCode::ValidationFailed);
        assert_eq!(err.details.unwrap()["errors"][0], "n is required");
    }

    #[tokio::test]
    async fn unavailable_plugins_refuse_execution() {
        let dispatcher = dispatcher(PluginHealth::Unavailable);
        let result = dispatcher
            .dispatch(&command("double", json!({"n": 1})))
            .await
            .into_result();
        assert!(!result.success);
        assert_eq!(
            result.error.unwrap().error_code,
            ErrorCode::PluginUnavailable
        );
    }
}
