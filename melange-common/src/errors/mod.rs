//! Error catalog and definitions for Melange.
//!
//! Every failing path in the core produces a [`HubError`]: a fixed
//! [`ErrorCode`] discriminant plus a human message, a category, and
//! optional details/suggestion/retry-after payload. The HTTP adapter is
//! the single place that maps a category to a status code.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, HubError};

/// Convenience alias for core results.
pub type HubResult<T> = Result<T, HubError>;
