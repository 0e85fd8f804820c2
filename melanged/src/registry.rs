//! The Resource Registry: single authoritative map from UID to record.
//!
//! Records are appended in allocation order and the whole file is
//! rewritten atomically on every mutation, with the writer lock held
//! across marshal-and-rename so readers never observe a partial write.
//! At the scale implied (thousands of records) the full rewrite is fine.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::Utc;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::fsio;
use melange_common::types::{ResourceKind, ResourceRecord, Uid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    #[serde(default)]
    records: Vec<ResourceRecord>,
}

/// Thread-safe registry with crash-safe JSON persistence.
pub struct ResourceRegistry {
    path: PathBuf,
    inner: RwLock<Vec<ResourceRecord>>,
}

impl ResourceRegistry {
    pub fn load(path: PathBuf) -> HubResult<Self> {
        let state: Option<RegistryState> = fsio::load_json(&path)?;
        let records = state.map(|s| s.records).unwrap_or_default();
        info!(
            "resource registry loaded: {} records from {}",
            records.len(),
            path.display()
        );
        Ok(Self {
            path,
            inner: RwLock::new(records),
        })
    }

    /// Register a new record. Fails when the UID is already present or the
    /// parent does not resolve to a record of a compatible kind.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        uid: Uid,
        kind: ResourceKind,
        filename: String,
        session_id: Option<String>,
        parent_uid: Option<Uid>,
        metadata: serde_json::Map<String, Value>,
    ) -> HubResult<ResourceRecord> {
        let mut records = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if records.iter().any(|r| r.uid == uid) {
            return Err(HubError::new(
                ErrorCode::UidAlreadyRegistered,
                format!("UID already registered: {uid}"),
            ));
        }

        if let Some(parent) = &parent_uid {
            let Some(parent_record) = records.iter().find(|r| &r.uid == parent) else {
                return Err(HubError::new(
                    ErrorCode::InvalidParent,
                    format!("parent UID does not resolve: {parent}"),
                ));
            };
            if !kind.allows_parent(parent_record.kind) {
                return Err(HubError::new(
                    ErrorCode::InvalidParent,
                    format!(
                        "{} record cannot have {} parent {parent}",
                        kind, parent_record.kind
                    ),
                ));
            }
        }

        let now = Utc::now();
        let record = ResourceRecord {
            uid,
            kind,
            filename,
            session_id,
            parent_uid,
            created_at: now,
            updated_at: now,
            metadata,
        };
        records.push(record.clone());
        self.persist(&records)?;
        debug!("registered {} ({kind})", record.uid);
        Ok(record)
    }

    pub fn get(&self, uid: &Uid) -> HubResult<ResourceRecord> {
        let records = self.inner.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .find(|r| &r.uid == uid)
            .cloned()
            .ok_or_else(|| HubError::uid_not_found(uid.as_str()))
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        let records = self.inner.read().unwrap_or_else(|e| e.into_inner());
        records.iter().any(|r| &r.uid == uid)
    }

    /// Records for a session, in allocation order.
    pub fn list_by_session(&self, session_id: &str) -> Vec<ResourceRecord> {
        let records = self.inner.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.session_id.as_deref() == Some(session_id))
            .cloned()
            .collect()
    }

    /// The most recently registered record of `kind` for a session.
    pub fn latest_by_kind(&self, session_id: &str, kind: ResourceKind) -> Option<ResourceRecord> {
        let records = self.inner.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .rev()
            .find(|r| r.kind == kind && r.session_id.as_deref() == Some(session_id))
            .cloned()
    }

    /// Merge a patch into a record's metadata. `parent_uid`, `kind`, and
    /// `session_id` cannot change through this path.
    pub fn update_metadata(
        &self,
        uid: &Uid,
        patch: serde_json::Map<String, Value>,
    ) -> HubResult<ResourceRecord> {
        let mut records = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .iter_mut()
            .find(|r| &r.uid == uid)
            .ok_or_else(|| HubError::uid_not_found(uid.as_str()))?;
        for (key, value) in patch {
            record.metadata.insert(key, value);
        }
        record.updated_at = Utc::now();
        let updated = record.clone();
        self.persist(&records)?;
        Ok(updated)
    }

    /// Remove every record owned by a session and return the removed UIDs.
    /// On-disk blobs are not touched; that is a higher-level policy.
    pub fn delete_by_session(&self, session_id: &str) -> HubResult<Vec<Uid>> {
        let mut records = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();
        records.retain(|r| {
            if r.session_id.as_deref() == Some(session_id) {
                removed.push(r.uid.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.persist(&records)?;
            info!("deleted {} records for session {session_id}", removed.len());
        }
        Ok(removed)
    }

    /// Remove a single record, returning it when it existed. Used by the
    /// duplicate-download cleanup before re-downloading the same user.
    pub fn remove(&self, uid: &Uid) -> HubResult<Option<ResourceRecord>> {
        let mut records = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let position = records.iter().position(|r| &r.uid == uid);
        let removed = position.map(|i| records.remove(i));
        if removed.is_some() {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    /// Find avatar downloads whose source username or user id matches
    /// `user_input`, scoped to `session_id` when given.
    pub fn find_avatar_downloads(
        &self,
        user_input: &str,
        session_id: Option<&str>,
    ) -> Vec<ResourceRecord> {
        let needle = user_input.trim().to_lowercase();
        let records = self.inner.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| {
                if r.kind != ResourceKind::Object3d {
                    return false;
                }
                if let Some(session) = session_id {
                    if r.session_id.as_deref() != Some(session) {
                        return false;
                    }
                }
                let Some(source) = r.metadata.get("source").and_then(Value::as_object) else {
                    return false;
                };
                if source.get("download_type").and_then(Value::as_str)
                    != Some("roblox_3d_avatar")
                {
                    return false;
                }
                let username = source
                    .get("username")
                    .and_then(Value::as_str)
                    .map(str::to_lowercase);
                let user_id = source.get("user_id").and_then(Value::as_u64);
                username.as_deref() == Some(needle.as_str())
                    || user_id.map(|id| id.to_string()) == Some(needle.clone())
            })
            .cloned()
            .collect()
    }

    /// The file path for a record, verifying the blob still exists on disk
    /// (external deletion yields a typed NotFound).
    pub fn resolve_file(&self, uid: &Uid) -> HubResult<PathBuf> {
        let record = self.get(uid)?;
        let Some(path) = record.file_path() else {
            return Err(HubError::new(
                ErrorCode::AssetNotFound,
                format!("no file path recorded for {uid}"),
            ));
        };
        let path = PathBuf::from(path);
        if !path.exists() {
            warn!("file for {uid} is gone from disk: {}", path.display());
            return Err(HubError::new(
                ErrorCode::AssetNotFound,
                format!("file for {uid} no longer exists"),
            )
            .with_details(serde_json::json!({"file_path": path.display().to_string()})));
        }
        Ok(path)
    }

    fn persist(&self, records: &[ResourceRecord]) -> HubResult<()> {
        fsio::write_json_atomic(
            &self.path,
            &RegistryState {
                records: records.to_vec(),
            },
        )
    }
}
