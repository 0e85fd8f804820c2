//! Error catalog for Melange.
//!
//! Codes are grouped by subsystem:
//!
//! | Family         | Codes                                                        |
//! |----------------|--------------------------------------------------------------|
//! | Input          | validation_failed, invalid_uid_format, ...                   |
//! | Not found      | uid_not_found, session_not_found, ...                        |
//! | Provider       | api_unavailable, api_rate_limited, ...                       |
//! | Pipeline       | user_not_found, AVATAR_PROCESSING_FAILED, JOB_TIMEOUT, ...   |
//! | Infrastructure | storage_error, connection_failed, ...                        |
//! | Control        | job_cancelled, job_queue_full                                |
//!
//! The wire code for each variant is fixed (`ErrorCode::as_str`); a few
//! pipeline codes are SCREAMING_CASE because frontends already match on
//! them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Coarse category used for HTTP status mapping and triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller supplied bad input.
    UserInput,
    /// The referenced resource does not exist.
    ResourceNotFound,
    /// An external provider failed or is unreachable.
    ExternalApi,
    /// An external provider asked us to slow down.
    RateLimited,
    /// Something went wrong inside the hub itself.
    InternalServer,
    /// Deliberate control-flow outcome (cancellation, queue limits).
    Control,
}

impl ErrorCategory {
    /// The single category -> HTTP status mapping.
    pub fn http_status(self) -> u16 {
        match self {
            Self::UserInput => 400,
            Self::ResourceNotFound => 404,
            Self::ExternalApi => 502,
            Self::RateLimited => 429,
            Self::InternalServer => 500,
            Self::Control => 409,
        }
    }
}

/// Machine-readable error code covering every failure the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    // -- Input --
    #[serde(rename = "validation_failed")]
    ValidationFailed,
    #[serde(rename = "invalid_uid_format")]
    InvalidUidFormat,
    #[serde(rename = "invalid_user_input")]
    InvalidUserInput,
    #[serde(rename = "invalid_video_duration")]
    InvalidVideoDuration,
    #[serde(rename = "image_size_exceeded")]
    ImageSizeExceeded,
    #[serde(rename = "uid_already_registered")]
    UidAlreadyRegistered,
    #[serde(rename = "invalid_parent")]
    InvalidParent,

    // -- Not found --
    #[serde(rename = "uid_not_found")]
    UidNotFound,
    #[serde(rename = "session_not_found")]
    SessionNotFound,
    #[serde(rename = "asset_not_found")]
    AssetNotFound,
    #[serde(rename = "job_not_found")]
    JobNotFound,
    #[serde(rename = "video_not_found")]
    VideoNotFound,

    // -- External provider --
    #[serde(rename = "api_unavailable")]
    ApiUnavailable,
    #[serde(rename = "video_api_unavailable")]
    VideoApiUnavailable,
    #[serde(rename = "api_rate_limited")]
    ApiRateLimited,
    #[serde(rename = "network_error")]
    NetworkError,
    #[serde(rename = "transformation_failed")]
    TransformationFailed,
    #[serde(rename = "video_generation_failed")]
    VideoGenerationFailed,
    #[serde(rename = "VIDEO_GENERATION_TIMEOUT")]
    VideoGenerationTimeout,
    #[serde(rename = "VIDEO_IMAGE_REQUIRED")]
    VideoImageRequired,

    // -- Pipeline --
    #[serde(rename = "user_not_found")]
    UserNotFound,
    #[serde(rename = "avatar_3d_unavailable")]
    Avatar3dUnavailable,
    #[serde(rename = "AVATAR_PROCESSING_FAILED")]
    AvatarProcessingFailed,
    #[serde(rename = "download_failed")]
    DownloadFailed,
    #[serde(rename = "metadata_unavailable")]
    MetadataUnavailable,
    #[serde(rename = "JOB_TIMEOUT")]
    JobTimeout,

    // -- Infrastructure --
    #[serde(rename = "storage_error")]
    StorageError,
    #[serde(rename = "permission_denied")]
    PermissionDenied,
    #[serde(rename = "uid_generation_failed")]
    UidGenerationFailed,
    #[serde(rename = "command_failed")]
    CommandFailed,
    #[serde(rename = "connection_failed")]
    ConnectionFailed,
    #[serde(rename = "command_timeout")]
    CommandTimeout,
    #[serde(rename = "unknown_command")]
    UnknownCommand,
    #[serde(rename = "plugin_unavailable")]
    PluginUnavailable,

    // -- Control --
    #[serde(rename = "job_cancelled")]
    JobCancelled,
    #[serde(rename = "job_queue_full")]
    JobQueueFull,
}

impl ErrorCode {
    /// The wire code exposed to frontends.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::InvalidUidFormat => "invalid_uid_format",
            Self::InvalidUserInput => "invalid_user_input",
            Self::InvalidVideoDuration => "invalid_video_duration",
            Self::ImageSizeExceeded => "image_size_exceeded",
            Self::UidAlreadyRegistered => "uid_already_registered",
            Self::InvalidParent => "invalid_parent",
            Self::UidNotFound => "uid_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::AssetNotFound => "asset_not_found",
            Self::JobNotFound => "job_not_found",
            Self::VideoNotFound => "video_not_found",
            Self::ApiUnavailable => "api_unavailable",
            Self::VideoApiUnavailable => "video_api_unavailable",
            Self::ApiRateLimited => "api_rate_limited",
            Self::NetworkError => "network_error",
            Self::TransformationFailed => "transformation_failed",
            Self::VideoGenerationFailed => "video_generation_failed",
            Self::VideoGenerationTimeout => "VIDEO_GENERATION_TIMEOUT",
            Self::VideoImageRequired => "VIDEO_IMAGE_REQUIRED",
            Self::UserNotFound => "user_not_found",
            Self::Avatar3dUnavailable => "avatar_3d_unavailable",
            Self::AvatarProcessingFailed => "AVATAR_PROCESSING_FAILED",
            Self::DownloadFailed => "download_failed",
            Self::MetadataUnavailable => "metadata_unavailable",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::StorageError => "storage_error",
            Self::PermissionDenied => "permission_denied",
            Self::UidGenerationFailed => "uid_generation_failed",
            Self::CommandFailed => "command_failed",
            Self::ConnectionFailed => "connection_failed",
            Self::CommandTimeout => "command_timeout",
            Self::UnknownCommand => "unknown_command",
            Self::PluginUnavailable => "plugin_unavailable",
            Self::JobCancelled => "job_cancelled",
            Self::JobQueueFull => "job_queue_full",
        }
    }

    /// The category every code belongs to.
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::ValidationFailed
            | Self::InvalidUidFormat
            | Self::InvalidUserInput
            | Self::InvalidVideoDuration
            | Self::ImageSizeExceeded
            | Self::UidAlreadyRegistered
            | Self::InvalidParent
            | Self::UserNotFound
            | Self::VideoImageRequired
            | Self::UnknownCommand => ErrorCategory::UserInput,

            Self::UidNotFound
            | Self::SessionNotFound
            | Self::AssetNotFound
            | Self::JobNotFound
            | Self::VideoNotFound
            | Self::MetadataUnavailable => ErrorCategory::ResourceNotFound,

            Self::ApiUnavailable
            | Self::VideoApiUnavailable
            | Self::NetworkError
            | Self::TransformationFailed
            | Self::VideoGenerationFailed
            | Self::VideoGenerationTimeout
            | Self::Avatar3dUnavailable
            | Self::DownloadFailed
            | Self::PluginUnavailable => ErrorCategory::ExternalApi,

            Self::ApiRateLimited => ErrorCategory::RateLimited,

            Self::AvatarProcessingFailed
            | Self::JobTimeout
            | Self::StorageError
            | Self::PermissionDenied
            | Self::UidGenerationFailed
            | Self::CommandFailed
            | Self::ConnectionFailed
            | Self::CommandTimeout => ErrorCategory::InternalServer,

            Self::JobCancelled | Self::JobQueueFull => ErrorCategory::Control,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The uniform error value every failing path produces.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{error_code}: {message}")]
pub struct HubError {
    pub error_code: ErrorCode,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl HubError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            category: error_code.category(),
            details: None,
            suggestion: None,
            retry_after_seconds: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_seconds = Some(seconds);
        self
    }

    pub fn http_status(&self) -> u16 {
        self.category.http_status()
    }

    // Frequently-constructed errors get shorthands so call sites stay
    // uniform across subsystems.

    pub fn uid_not_found(uid: &str) -> Self {
        Self::new(ErrorCode::UidNotFound, format!("UID not found: {uid}"))
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("session not found: {session_id}"),
        )
    }

    pub fn job_not_found(key: &str) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("job not found: {key}"))
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::StorageError, format!("{context}: {err}"))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::JobCancelled, "job was cancelled")
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Self::new(ErrorCode::PermissionDenied, err.to_string())
            }
            _ => Self::new(ErrorCode::StorageError, err.to_string()),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::StorageError, format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_serde_renames() {
        for code in [
            ErrorCode::ValidationFailed,
            ErrorCode::AvatarProcessingFailed,
            ErrorCode::JobTimeout,
            ErrorCode::VideoImageRequired,
            ErrorCode::VideoGenerationTimeout,
            ErrorCode::JobCancelled,
        ] {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, code.as_str());
        }
    }

    #[test]
    fn category_mapping_covers_scenarios() {
        assert_eq!(ErrorCode::ValidationFailed.category().http_status(), 400);
        assert_eq!(ErrorCode::UidNotFound.category().http_status(), 404);
        assert_eq!(ErrorCode::ApiUnavailable.category().http_status(), 502);
        assert_eq!(ErrorCode::ApiRateLimited.category().http_status(), 429);
        assert_eq!(ErrorCode::StorageError.category().http_status(), 500);
    }

    #[test]
    fn screaming_codes_kept_for_frontend_compat() {
        assert_eq!(
            ErrorCode::AvatarProcessingFailed.as_str(),
            "AVATAR_PROCESSING_FAILED"
        );
        assert_eq!(ErrorCode::JobTimeout.as_str(), "JOB_TIMEOUT");
        assert_eq!(ErrorCode::VideoImageRequired.as_str(), "VIDEO_IMAGE_REQUIRED");
    }

    #[test]
    fn error_round_trips_through_json() {
        let err = HubError::new(ErrorCode::ApiRateLimited, "slow down")
            .with_retry_after(30)
            .with_suggestion("retry later");
        let json = serde_json::to_string(&err).unwrap();
        let back: HubError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error_code, ErrorCode::ApiRateLimited);
        assert_eq!(back.retry_after_seconds, Some(30));
    }
}
