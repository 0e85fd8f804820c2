//! Editor bridge plugin: scene, lighting, sky, geospatial, and
//! screenshot commands dispatched to the running editor process.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::types::{CommandResult, ResourceKind, UidKind};
use serde_json::{Value, json};
use tracing::info;

use super::{Capability, CommandOutcome, PluginHealth, PluginMetadata, ToolPlugin, Validation};
use crate::services::Services;

const MIN_COLOR_TEMPERATURE: f64 = 1500.0;
const MAX_COLOR_TEMPERATURE: f64 = 15000.0;

/// Map a descriptive color temperature to Kelvin.
///
/// Relative descriptions (warmer, cooler, "more warm") shift the current
/// value by 1000 K with clamping; absolute descriptions map to fixed
/// points. Lower Kelvin is warmer.
pub fn map_temperature_description(description: &str, current: f64) -> HubResult<f64> {
    let desc = description.trim().to_lowercase();
    let relative = desc.contains("more") || desc.contains("er");

    let kelvin = if desc.contains("very warm") || desc.contains("extremely warm") {
        2700.0
    } else if desc.contains("warm") && relative {
        (current - 1000.0).max(MIN_COLOR_TEMPERATURE)
    } else if desc.contains("warm") {
        3200.0
    } else if desc.contains("very cold") || desc.contains("extremely cold") {
        10000.0
    } else if (desc.contains("cold") || desc.contains("cool")) && relative {
        (current + 1000.0).min(MAX_COLOR_TEMPERATURE)
    } else if desc.contains("cold") || desc.contains("cool") {
        8000.0
    } else if desc.contains("daylight") || desc.contains("neutral") {
        6500.0
    } else if desc.contains("sunset") || desc.contains("golden") {
        2200.0
    } else if desc.contains("noon") || desc.contains("bright") {
        5600.0
    } else {
        return Err(HubError::new(
            ErrorCode::ValidationFailed,
            format!("could not interpret color description: '{description}'"),
        )
        .with_suggestion("try 'warm', 'cold', 'warmer', 'cooler', 'daylight', 'sunset'"));
    };
    Ok(kelvin.clamp(MIN_COLOR_TEMPERATURE, MAX_COLOR_TEMPERATURE))
}

/// Fill light-creation defaults: location {0, 0, 100}, intensity 1000,
/// white color.
pub fn normalize_light_params(mut params: Value) -> Value {
    let Some(map) = params.as_object_mut() else {
        return params;
    };
    map.entry("location")
        .or_insert_with(|| json!({"x": 0.0, "y": 0.0, "z": 100.0}));
    map.entry("intensity").or_insert_with(|| json!(1000.0));
    map.entry("color")
        .or_insert_with(|| json!({"r": 255, "g": 255, "b": 255}));
    params
}

pub struct EditorPlugin {
    services: Arc<Services>,
}

impl EditorPlugin {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn validate_light(params: &Value, errors: &mut Vec<String>, require_name: bool) {
        if require_name {
            match params.get("light_name").and_then(Value::as_str) {
                Some(name) if !name.trim().is_empty() => {}
                _ => errors.push("light_name is required".to_string()),
            }
        }
        if let Some(intensity) = params.get("intensity") {
            match intensity.as_f64() {
                Some(value) if value >= 0.0 => {}
                _ => errors.push("intensity must be a non-negative number".to_string()),
            }
        }
        if let Some(color) = params.get("color") {
            for channel in ["r", "g", "b"] {
                match color.get(channel).and_then(Value::as_i64) {
                    Some(value) if (0..=255).contains(&value) => {}
                    _ => errors.push(format!("color.{channel} must be an integer in 0..=255")),
                }
            }
        }
    }

    fn validate_sky(command_type: &str, params: &Value, errors: &mut Vec<String>) {
        match command_type {
            "set_time_of_day" => match params.get("time_of_day").and_then(Value::as_f64) {
                Some(value) if (0.0..=2400.0).contains(&value) => {}
                _ => errors.push("time_of_day must be a number in 0..=2400".to_string()),
            },
            "set_color_temperature" => match params.get("color_temperature") {
                Some(Value::Number(n)) => {
                    let value = n.as_f64().unwrap_or(f64::NAN);
                    if !(MIN_COLOR_TEMPERATURE..=MAX_COLOR_TEMPERATURE).contains(&value) {
                        errors.push(format!(
                            "color_temperature must be in {MIN_COLOR_TEMPERATURE}..={MAX_COLOR_TEMPERATURE} K"
                        ));
                    }
                }
                Some(Value::String(description)) => {
                    // Interpretability check only; the actual mapping needs
                    // the current value and happens at execute time.
                    if map_temperature_description(description, 6500.0).is_err() {
                        errors.push(format!(
                            "unknown color temperature description '{description}'"
                        ));
                    }
                }
                _ => errors.push("color_temperature is required".to_string()),
            },
            _ => {}
        }
    }

    fn validate_geo(params: &Value, errors: &mut Vec<String>) {
        match params.get("latitude").and_then(Value::as_f64) {
            Some(value) if (-90.0..=90.0).contains(&value) => {}
            _ => errors.push("latitude must be a number in -90..=90".to_string()),
        }
        match params.get("longitude").and_then(Value::as_f64) {
            Some(value) if (-180.0..=180.0).contains(&value) => {}
            _ => errors.push("longitude must be a number in -180..=180".to_string()),
        }
    }

    fn validate_screenshot(params: &Value, errors: &mut Vec<String>) {
        if let Some(multiplier) = params.get("resolution_multiplier") {
            match multiplier.as_f64() {
                Some(value) if (1.0..=8.0).contains(&value) => {}
                _ => errors.push("resolution_multiplier must be in 1.0..=8.0".to_string()),
            }
        }
        if let Some(include_ui) = params.get("include_ui") {
            if !include_ui.is_boolean() {
                errors.push("include_ui must be a boolean".to_string());
            }
        }
    }

    /// Read the current sky color temperature for relative adjustments.
    async fn current_color_temperature(&self) -> f64 {
        let response = self
            .services
            .editor
            .send_command("get_ultra_dynamic_sky", &json!({}))
            .await;
        match response {
            Ok(body) => body
                .pointer("/result/color_temperature")
                .or_else(|| body.get("color_temperature"))
                .and_then(Value::as_f64)
                .unwrap_or(6500.0),
            Err(_) => 6500.0,
        }
    }

    /// Register an editor-captured screenshot so transforms can target it.
    async fn register_screenshot(&self, params: &Value, response: &Value) -> HubResult<Value> {
        let Some(file_path) = response
            .pointer("/result/file_path")
            .or_else(|| response.get("file_path"))
            .and_then(Value::as_str)
        else {
            return Ok(response.clone());
        };

        let dimensions = image::image_dimensions(file_path).ok();
        let uid = self.services.uids.next(UidKind::Image)?;
        let mut metadata = serde_json::Map::new();
        metadata.insert("file_path".to_string(), json!(file_path));
        if let Some((width, height)) = dimensions {
            metadata.insert("width".to_string(), json!(width));
            metadata.insert("height".to_string(), json!(height));
        }
        metadata.insert(
            "source".to_string(),
            json!({"kind": "editor_screenshot", "captured_at": Utc::now().to_rfc3339()}),
        );
        let filename = std::path::Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "screenshot.png".to_string());

        self.services.registry.add(
            uid.clone(),
            ResourceKind::Image,
            filename,
            params
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            None,
            metadata,
        )?;
        info!("registered screenshot {uid}");

        let mut enriched = response.clone();
        if let Some(map) = enriched.as_object_mut() {
            map.insert("image_uid".to_string(), json!(uid.as_str()));
        }
        Ok(enriched)
    }
}

#[async_trait]
impl ToolPlugin for EditorPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            tool_id: "editor_bridge",
            display_name: "Editor Bridge",
            version: "1.2.0",
            capabilities: vec![
                Capability::SceneManagement,
                Capability::LightingControl,
                Capability::Rendering,
                Capability::Geospatial,
            ],
            requires_connection: true,
            pricing_tier: "free",
        }
    }

    fn supported_commands(&self) -> Vec<&'static str> {
        vec![
            "create_mm_control_light",
            "get_mm_control_lights",
            "update_mm_control_light",
            "delete_mm_control_light",
            "get_ultra_dynamic_sky",
            "set_time_of_day",
            "set_color_temperature",
            "set_latitude_longitude",
            "take_screenshot",
        ]
    }

    async fn health_check(&self) -> PluginHealth {
        if self.services.editor.is_available().await {
            PluginHealth::Available
        } else {
            PluginHealth::Unavailable
        }
    }

    fn validate(&self, command_type: &str, params: &Value) -> Validation {
        let mut errors = Vec::new();
        match command_type {
            "create_mm_control_light" => Self::validate_light(params, &mut errors, true),
            "update_mm_control_light" | "delete_mm_control_light" => {
                Self::validate_light(params, &mut errors, true)
            }
            "get_mm_control_lights" | "get_ultra_dynamic_sky" => {}
            "set_time_of_day" | "set_color_temperature" => {
                Self::validate_sky(command_type, params, &mut errors)
            }
            "set_latitude_longitude" => Self::validate_geo(params, &mut errors),
            "take_screenshot" => Self::validate_screenshot(params, &mut errors),
            other => errors.push(format!("unknown editor command: {other}")),
        }
        Validation::from_errors(errors)
    }

    async fn preprocess(&self, command_type: &str, params: Value) -> HubResult<Value> {
        match command_type {
            "create_mm_control_light" => Ok(normalize_light_params(params)),
            _ => Ok(params),
        }
    }

    async fn execute(&self, command_type: &str, mut params: Value) -> HubResult<CommandOutcome> {
        // Relative temperature descriptions need the live value first.
        if command_type == "set_color_temperature" {
            if let Some(description) = params
                .get("color_temperature")
                .and_then(Value::as_str)
                .map(str::to_string)
            {
                let current = self.current_color_temperature().await;
                let kelvin = map_temperature_description(&description, current)?;
                info!("color temperature '{description}' -> {kelvin} K (from {current} K)");
                params["color_temperature"] = json!(kelvin);
            }
        }

        let response = self
            .services
            .editor
            .send_command(command_type, &params)
            .await?;

        let payload = if command_type == "take_screenshot" {
            self.register_screenshot(&params, &response).await?
        } else {
            response
        };
        Ok(CommandOutcome::Immediate(CommandResult::ok(payload)))
    }
}
