//! The Reference Store: an isolated UID namespace plus on-disk blobs for
//! reference images.
//!
//! Deliberately parallel to, but separate from, the main allocator and
//! registry: references have per-session retention, live under
//! session-segmented directories with `*_meta.json` sidecars, and are
//! never legal as a `parent_uid` in the main registry. The counter and
//! mapping table share one durable state file.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::filename;
use melange_common::fsio;
use melange_common::types::{Uid, UidKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::paths::PathResolver;

/// One stored reference image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub refer_uid: Uid,
    pub session_id: String,
    pub filename: String,
    /// `style`, `color`, `composition`, or free-form.
    pub purpose: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReferenceState {
    #[serde(default)]
    counter: u64,
    #[serde(default)]
    mappings: BTreeMap<String, ReferenceRecord>,
}

/// Session-scoped store for reference image blobs.
pub struct ReferenceStore {
    paths: Arc<PathResolver>,
    state_path: PathBuf,
    inner: Mutex<ReferenceState>,
}

impl ReferenceStore {
    pub fn load(paths: Arc<PathResolver>) -> HubResult<Self> {
        let state_path = paths.refer_uid_state_file()?;
        let state: ReferenceState = fsio::load_json(&state_path)?.unwrap_or_default();
        info!(
            "reference store loaded: counter={} mappings={}",
            state.counter,
            state.mappings.len()
        );
        Ok(Self {
            paths,
            state_path,
            inner: Mutex::new(state),
        })
    }

    /// Persist bytes as a new reference image and return its UID.
    pub fn store(
        &self,
        session_id: &str,
        bytes: &[u8],
        purpose: &str,
        mime_type: &str,
    ) -> HubResult<Uid> {
        if bytes.is_empty() {
            return Err(HubError::new(
                ErrorCode::InvalidUserInput,
                "reference image payload is empty",
            ));
        }

        let session_dir = self.paths.reference_session(session_id)?;

        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.counter += 1;
        let uid = Uid::new(UidKind::Reference, state.counter);

        let ext = extension_for(mime_type);
        let file_name = format!("{uid}.{ext}");
        let blob_path = session_dir.join(&file_name);

        if let Err(err) = std::fs::write(&blob_path, bytes) {
            state.counter -= 1;
            return Err(HubError::storage("write reference blob", err));
        }

        let record = ReferenceRecord {
            refer_uid: uid.clone(),
            session_id: session_id.to_string(),
            filename: file_name,
            purpose: purpose.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
            metadata: serde_json::Map::new(),
        };

        let sidecar = session_dir.join(filename::reference_meta(uid.as_str()));
        fsio::write_json_atomic(&sidecar, &record)?;

        state.mappings.insert(uid.as_str().to_string(), record);
        self.persist(&state)?;
        debug!("stored reference {uid} for session {session_id}");
        Ok(uid)
    }

    /// Load the blob bytes and record for a reference UID.
    pub fn load_reference(&self, refer_uid: &Uid) -> HubResult<(Vec<u8>, ReferenceRecord)> {
        let record = {
            let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            state
                .mappings
                .get(refer_uid.as_str())
                .cloned()
                .ok_or_else(|| HubError::uid_not_found(refer_uid.as_str()))?
        };
        let path = self
            .paths
            .reference_session(&record.session_id)?
            .join(&record.filename);
        let bytes = std::fs::read(&path).map_err(|err| {
            HubError::new(
                ErrorCode::AssetNotFound,
                format!("reference blob missing for {refer_uid}: {err}"),
            )
        })?;
        Ok((bytes, record))
    }

    pub fn list(&self, session_id: &str) -> Vec<ReferenceRecord> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state
            .mappings
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Remove all references for a session: blobs, sidecars, mappings.
    pub fn delete_by_session(&self, session_id: &str) -> HubResult<Vec<Uid>> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let removed: Vec<Uid> = state
            .mappings
            .values()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.refer_uid.clone())
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }
        state
            .mappings
            .retain(|_, r| r.session_id != session_id);
        self.persist(&state)?;
        drop(state);

        let session_dir = self.paths.reference_session(session_id)?;
        if let Err(err) = std::fs::remove_dir_all(&session_dir) {
            warn!(
                "failed to remove reference directory {}: {err}",
                session_dir.display()
            );
        }
        info!(
            "deleted {} references for session {session_id}",
            removed.len()
        );
        Ok(removed)
    }

    pub fn current_counter(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).counter
    }

    fn persist(&self, state: &ReferenceState) -> HubResult<()> {
        fsio::write_json_atomic(&self.state_path, state)
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &std::path::Path) -> ReferenceStore {
        let paths = Arc::new(PathResolver::for_test(dir));
        ReferenceStore::load(paths).unwrap()
    }

    #[test]
    fn store_and_load_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(dir.path());

        let bytes = vec![7u8; 1024];
        let uid = refs.store("sess_a", &bytes, "style", "image/png").unwrap();
        assert_eq!(uid.kind(), UidKind::Reference);

        let (loaded, record) = refs.load_reference(&uid).unwrap();
        assert_eq!(loaded, bytes);
        assert_eq!(record.purpose, "style");
        assert_eq!(record.size_bytes, 1024);
        assert_eq!(record.session_id, "sess_a");
    }

    #[test]
    fn sidecar_sits_next_to_blob() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(dir.path());
        let uid = refs.store("sess_a", b"data", "color", "image/jpeg").unwrap();

        let session_dir = dir.path().join("Saved").join("Reference").join("sess_a");
        assert!(session_dir.join(format!("{uid}.jpg")).exists());
        assert!(session_dir.join(format!("{uid}_meta.json")).exists());
    }

    #[test]
    fn counter_is_isolated_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        {
            let refs = store(dir.path());
            refs.store("sess_a", b"one", "style", "image/png").unwrap();
            refs.store("sess_a", b"two", "style", "image/png").unwrap();
        }
        let reloaded = store(dir.path());
        assert_eq!(reloaded.current_counter(), 2);
        let next = reloaded.store("sess_b", b"three", "style", "image/png").unwrap();
        assert_eq!(next.as_str(), "refer_003");
    }

    #[test]
    fn delete_by_session_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(dir.path());
        let a = refs.store("sess_a", b"one", "style", "image/png").unwrap();
        refs.store("sess_b", b"two", "style", "image/png").unwrap();

        let removed = refs.delete_by_session("sess_a").unwrap();
        assert_eq!(removed, vec![a.clone()]);
        assert!(refs.load_reference(&a).is_err());
        assert_eq!(refs.list("sess_b").len(), 1);
        assert!(!dir.path().join("Saved").join("Reference").join("sess_a").exists());
    }

    #[test]
    fn empty_payload_is_rejected_without_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let refs = store(dir.path());
        assert!(refs.store("sess_a", b"", "style", "image/png").is_err());
        assert_eq!(refs.current_counter(), 0);
    }
}
