//! Filesystem session backend (the fallback store).
//!
//! Session documents live under `sessions/<yyyy-mm>/day-dd/` named
//! `session_<sid>.json`; documents older than the archive threshold are
//! demoted into `sessions/archived/<yyyy-mm>/`. All writes go through the
//! atomic temp-then-rename helper.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use melange_common::errors::{HubError, HubResult};
use melange_common::fsio;
use melange_common::types::SessionContext;
use tracing::{debug, info, warn};

use super::SessionStorage;

const ARCHIVED_DIR: &str = "archived";

/// File-based implementation of session storage.
pub struct FileSessionStore {
    base: PathBuf,
    archive_after: Duration,
}

impl FileSessionStore {
    pub fn new(base: PathBuf, archive_after_days: u64) -> HubResult<Self> {
        std::fs::create_dir_all(&base)?;
        std::fs::create_dir_all(base.join(ARCHIVED_DIR))?;
        info!("file session store at {}", base.display());
        Ok(Self {
            base,
            archive_after: Duration::from_secs(archive_after_days * 86_400),
        })
    }

    fn file_name(session_id: &str) -> String {
        format!("session_{session_id}.json")
    }

    /// Placement by age: active sessions get a month/day directory,
    /// older ones land straight in the archived tree.
    fn path_for(&self, session_id: &str, created_at: DateTime<Utc>) -> PathBuf {
        let age = Utc::now().signed_duration_since(created_at);
        let year_month = created_at.format("%Y-%m").to_string();
        if age.to_std().unwrap_or_default() > self.archive_after {
            self.base
                .join(ARCHIVED_DIR)
                .join(year_month)
                .join(Self::file_name(session_id))
        } else {
            let day = created_at.format("day-%d").to_string();
            self.base
                .join(year_month)
                .join(day)
                .join(Self::file_name(session_id))
        }
    }

    fn find(&self, session_id: &str) -> Option<PathBuf> {
        let needle = Self::file_name(session_id);
        walk_json_files(&self.base)
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == needle.as_str()))
    }

    /// Demote active files whose document creation date has passed the
    /// archive threshold. Returns how many files moved.
    pub fn archive_expired(&self) -> HubResult<usize> {
        let mut moved = 0;
        let archived_root = self.base.join(ARCHIVED_DIR);
        for path in walk_json_files(&self.base) {
            if path.starts_with(&archived_root) {
                continue;
            }
            let Ok(Some(context)) = fsio::load_json::<SessionContext>(&path) else {
                continue;
            };
            let target = self.path_for(&context.session_id, context.created_at);
            if target.starts_with(&archived_root) && target != path {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if let Err(err) = std::fs::rename(&path, &target) {
                    warn!("failed to archive {}: {err}", path.display());
                    continue;
                }
                moved += 1;
            }
        }
        if moved > 0 {
            info!("archived {moved} session files");
            prune_empty_dirs(&self.base, &[self.base.clone(), archived_root]);
        }
        Ok(moved)
    }
}

#[async_trait]
impl SessionStorage for FileSessionStore {
    async fn create(&self, context: &SessionContext) -> HubResult<()> {
        let path = self.path_for(&context.session_id, context.created_at);
        fsio::write_json_atomic(&path, context)?;
        debug!("created session file {}", path.display());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> HubResult<Option<SessionContext>> {
        let Some(path) = self.find(session_id) else {
            return Ok(None);
        };
        fsio::load_json(&path)
    }

    async fn update(&self, context: &SessionContext) -> HubResult<()> {
        // Rewrite in place when the file exists (it may be archived);
        // otherwise fall back to create semantics.
        match self.find(&context.session_id) {
            Some(path) => fsio::write_json_atomic(&path, context),
            None => self.create(context).await,
        }
    }

    async fn delete(&self, session_id: &str) -> HubResult<bool> {
        match self.find(session_id) {
            Some(path) => {
                std::fs::remove_file(&path)?;
                debug!("deleted session file {}", path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> HubResult<Vec<SessionContext>> {
        let mut sessions = Vec::new();
        for path in walk_json_files(&self.base) {
            match fsio::load_json::<SessionContext>(&path) {
                Ok(Some(context)) => sessions.push(context),
                Ok(None) => {}
                Err(err) => warn!("skipping unparsable session file {}: {err}", path.display()),
            }
        }
        sessions.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> HubResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|err| HubError::storage("cleanup cutoff", err))?;
        let mut deleted = 0;
        for path in walk_json_files(&self.base) {
            let Ok(Some(context)) = fsio::load_json::<SessionContext>(&path) else {
                continue;
            };
            if context.last_accessed < cutoff {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!("failed to delete expired session {}: {err}", path.display());
                    continue;
                }
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("cleaned up {deleted} expired session files");
            prune_empty_dirs(
                &self.base,
                &[self.base.clone(), self.base.join(ARCHIVED_DIR)],
            );
        }
        Ok(deleted)
    }

    async fn count(&self) -> HubResult<usize> {
        Ok(walk_json_files(&self.base).len())
    }

    async fn health_check(&self) -> bool {
        let probe = self.base.join(".health_check");
        let ok = std::fs::write(&probe, b"health_check").is_ok()
            && std::fs::read(&probe).is_ok_and(|c| c == b"health_check");
        let _ = std::fs::remove_file(&probe);
        ok
    }
}

fn walk_json_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files
}

fn prune_empty_dirs(root: &Path, keep: &[PathBuf]) {
    // Depth-first so children empty out before parents are examined.
    let mut dirs = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path.clone());
                stack.push(path);
            }
        }
    }
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        if keep.contains(&dir) {
            continue;
        }
        if std::fs::read_dir(&dir).map(|mut e| e.next().is_none()).unwrap_or(false) {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}
