//! Canonical directory layout under the editor project tree.
//!
//! Every other component derives paths from this one place. Accessors
//! return absolute paths whose parent directories exist; callers never
//! string-concatenate their own.
//!
//! Layout (relative to the project root):
//!
//! ```text
//! Saved/
//!   Screenshots/WindowsEditor/        editor-captured screenshots
//!   Screenshots/styled/               generated images
//!   Videos/generated/                 generated videos
//!   MegaMelange/sessions/             file session store
//!   MegaMelange/logs/
//!   Reference/<session_id>/           reference blobs + sidecars
//!   ObjectStore/                      uid/registry state, 3D blobs
//!     object_3d/<uid>/
//! ```

use std::path::{Path, PathBuf};

use melange_common::config::PathsConfig;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use tracing::{debug, info, warn};

/// Resolves and creates every directory the hub persists into.
#[derive(Debug, Clone)]
pub struct PathResolver {
    project_root: PathBuf,
    create_directories: bool,
}

impl PathResolver {
    /// Resolve the project root: explicit configuration first, then the
    /// named environment variables (already folded into the config), then
    /// a fallback under the current working directory. The presence of a
    /// `*.uproject` marker is validated; a missing marker only warns.
    pub fn from_config(config: &PathsConfig) -> HubResult<Self> {
        let root = match &config.project_root {
            Some(root) => {
                let root = std::path::absolute(root)?;
                if !has_project_marker(&root) {
                    warn!(
                        "no .uproject marker under {}; continuing anyway",
                        root.display()
                    );
                }
                root
            }
            None => {
                let fallback = std::path::absolute(Path::new("."))?;
                warn!(
                    "no project root configured; falling back to {}",
                    fallback.display()
                );
                fallback
            }
        };

        info!("project root resolved: {}", root.display());
        Ok(Self {
            project_root: root,
            create_directories: config.create_directories,
        })
    }

    #[cfg(test)]
    pub fn for_test(root: &Path) -> Self {
        Self {
            project_root: root.to_path_buf(),
            create_directories: true,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    fn base(&self) -> PathBuf {
        self.project_root.join("Saved")
    }

    fn dir(&self, relative: &[&str]) -> HubResult<PathBuf> {
        let mut path = self.base();
        for part in relative {
            path.push(part);
        }
        if self.create_directories {
            std::fs::create_dir_all(&path)?;
        }
        Ok(path)
    }

    fn file_in(&self, relative: &[&str], name: &str) -> HubResult<PathBuf> {
        Ok(self.dir(relative)?.join(name))
    }

    /// Editor-captured screenshots.
    pub fn screenshots_editor(&self) -> HubResult<PathBuf> {
        self.dir(&["Screenshots", "WindowsEditor"])
    }

    /// Generated (styled) images.
    pub fn screenshots_styled(&self) -> HubResult<PathBuf> {
        self.dir(&["Screenshots", "styled"])
    }

    /// Generated videos.
    pub fn videos_generated(&self) -> HubResult<PathBuf> {
        self.dir(&["Videos", "generated"])
    }

    /// Base directory for reference image blobs.
    pub fn reference_base(&self) -> HubResult<PathBuf> {
        self.dir(&["Reference"])
    }

    /// Session-segmented reference directory.
    pub fn reference_session(&self, session_id: &str) -> HubResult<PathBuf> {
        self.dir(&["Reference", session_id])
    }

    /// Root of the durable object store.
    pub fn object_store(&self) -> HubResult<PathBuf> {
        self.dir(&["ObjectStore"])
    }

    /// Blob directory for a 3D object, keyed by UID.
    pub fn object_3d_dir(&self, uid: &str) -> HubResult<PathBuf> {
        self.dir(&["ObjectStore", "object_3d", uid])
    }

    /// Durable counter state for the main UID allocator.
    pub fn uid_state_file(&self) -> HubResult<PathBuf> {
        self.file_in(&["ObjectStore"], "uid_state.json")
    }

    /// Durable state for the reference store (counter + mappings).
    pub fn refer_uid_state_file(&self) -> HubResult<PathBuf> {
        self.file_in(&["ObjectStore"], "refer_uid_state.json")
    }

    /// The resource registry map.
    pub fn registry_file(&self) -> HubResult<PathBuf> {
        self.file_in(&["ObjectStore"], "resource_registry.json")
    }

    /// Base directory for session management state.
    pub fn sessions_dir(&self) -> HubResult<PathBuf> {
        self.dir(&["MegaMelange", "sessions"])
    }

    /// Log directory.
    pub fn logs_dir(&self) -> HubResult<PathBuf> {
        self.dir(&["MegaMelange", "logs"])
    }

    /// Verify the base directory is writable.
    pub fn health_check(&self) -> HubResult<()> {
        let base = self.dir(&[])?;
        let probe = base.join(".health_check");
        std::fs::write(&probe, b"health check").map_err(|err| {
            HubError::new(
                ErrorCode::PermissionDenied,
                format!("base directory not writable: {err}"),
            )
            .with_details(serde_json::json!({"path": base.display().to_string()}))
        })?;
        std::fs::remove_file(&probe)?;
        debug!("path resolver health check passed: {}", base.display());
        Ok(())
    }
}

fn has_project_marker(root: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(root) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.path().extension().is_some_and(|ext| ext == "uproject"))
}
