//! Session identifier generation and validation.
//!
//! Session ids are opaque short identifiers minted by the hub and validated
//! on entry to every session-scoped operation.

use rand::RngExt;
use rand::distr::Alphanumeric;

const PREFIX: &str = "sess_";
const SUFFIX_LEN: usize = 12;
const MAX_LEN: usize = 64;

/// Mint a fresh session id, e.g. `sess_Ab3xK9tQw2Lm`.
pub fn generate() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{PREFIX}{suffix}")
}

/// Check whether a caller-supplied string is a plausible session id.
pub fn is_valid(id: &str) -> bool {
    if id.len() <= PREFIX.len() || id.len() > MAX_LEN {
        return false;
    }
    let Some(suffix) = id.strip_prefix(PREFIX) else {
        return false;
    };
    suffix.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}
