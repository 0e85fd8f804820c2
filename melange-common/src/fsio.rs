//! Crash-safe JSON persistence helpers.
//!
//! Every durable file in the hub (UID counters, registries, session
//! documents) is rewritten through [`write_json_atomic`]: marshal to a
//! sibling temp file, then rename over the target. A crash leaves either
//! the old or the new content on disk, never a partial write.

use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{HubError, HubResult};

/// Serialize `value` to pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> HubResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| HubError::storage("atomic write", "path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);

    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(tmp, &json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Load a JSON file, distinguishing "missing" from "corrupt".
pub fn load_json<T: DeserializeOwned>(path: &Path) -> HubResult<Option<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_str(&text)
        .map_err(|err| HubError::storage(&format!("parse {}", path.display()), err))?;
    Ok(Some(value))
}
