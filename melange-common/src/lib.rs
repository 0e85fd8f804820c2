//! Shared types and utilities for the Melange creative hub.
//!
//! This crate holds everything both the daemon and its tests agree on:
//! the UID/resource/job/session data model, the error catalog with its
//! single HTTP mapping, configuration, and the small filesystem helpers
//! that keep durable state crash-safe.

pub mod config;
pub mod errors;
pub mod filename;
pub mod fsio;
pub mod session_id;
pub mod types;

pub use config::HubConfig;
pub use errors::{ErrorCategory, ErrorCode, HubError, HubResult};
pub use types::{
    ChatMessage, Command, CommandResult, JobRecord, JobStatus, MessageRole, ResourceKind,
    ResourceRecord, SceneState, SessionContext, Uid, UidKind,
};
