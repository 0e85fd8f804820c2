//! Process-wide service construction.
//!
//! Every component that the original design kept as a global singleton is
//! constructed exactly once here and passed around by `Arc`. Construction
//! order follows the dependency chain: paths first, then durable state,
//! then the session policy, then the job coordinator, then provider
//! edges. Teardown is the reverse drop order; nothing holds OS resources
//! beyond file handles and sockets that close on drop.

use std::sync::Arc;
use std::time::Duration;

use melange_common::HubConfig;
use melange_common::errors::HubResult;
use tracing::{info, warn};

use crate::events::EventBus;
use crate::jobs::JobManager;
use crate::paths::PathResolver;
use crate::providers::editor::{EditorBridge, TcpEditorBridge};
use crate::providers::genai::{GenAiClient, ImageModel, VideoModel};
use crate::providers::roblox::{AvatarSource, RobloxWeb};
use crate::reference_store::ReferenceStore;
use crate::registry::ResourceRegistry;
use crate::session::file::FileSessionStore;
use crate::session::record::{HttpRecordStore, RecordSessionStore, RecordStore};
use crate::session::{SessionStore, SessionStorage};
use crate::uid::UidAllocator;

/// Everything a request handler or job worker needs, constructed once at
/// process start.
pub struct Services {
    pub config: HubConfig,
    pub paths: Arc<PathResolver>,
    pub uids: Arc<UidAllocator>,
    pub registry: Arc<ResourceRegistry>,
    pub references: Arc<ReferenceStore>,
    pub sessions: Arc<SessionStore>,
    pub session_files: Arc<FileSessionStore>,
    pub jobs: Arc<JobManager>,
    pub events: EventBus,
    pub avatars: Arc<dyn AvatarSource>,
    pub editor: Arc<dyn EditorBridge>,
    pub image_model: Option<Arc<dyn ImageModel>>,
    pub video_model: Option<Arc<dyn VideoModel>>,
}

impl Services {
    pub async fn from_config(config: HubConfig) -> HubResult<Arc<Self>> {
        let paths = Arc::new(PathResolver::from_config(&config.paths)?);
        paths.health_check()?;

        let uids = Arc::new(UidAllocator::load(paths.uid_state_file()?)?);
        let registry = Arc::new(ResourceRegistry::load(paths.registry_file()?)?);
        let references = Arc::new(ReferenceStore::load(Arc::clone(&paths))?);

        let session_files = Arc::new(FileSessionStore::new(
            paths.sessions_dir()?,
            config.sessions.archive_after_days,
        )?);

        let http_timeout = Duration::from_secs(config.providers.http_timeout_secs);
        let primary: Option<Arc<dyn SessionStorage>> = match &config.sessions.record_store_url {
            Some(url) => {
                info!("primary session backend: record store at {url}");
                let store = HttpRecordStore::new(
                    url.clone(),
                    "sessions",
                    config.sessions.record_store_key.clone(),
                    http_timeout,
                )?;
                Some(Arc::new(RecordSessionStore::new(Box::new(store))))
            }
            None => {
                info!("no record store configured; file backend only");
                None
            }
        };
        let sessions = Arc::new(SessionStore::new(
            primary,
            Arc::clone(&session_files) as Arc<dyn SessionStorage>,
        ));

        let events = EventBus::default();
        let job_mirror: Option<Arc<dyn RecordStore>> = match &config.sessions.record_store_url {
            Some(url) => Some(Arc::new(HttpRecordStore::new(
                url.clone(),
                "jobs",
                config.sessions.record_store_key.clone(),
                http_timeout,
            )?)),
            None => None,
        };
        let jobs = JobManager::new(
            events.clone(),
            job_mirror,
            Duration::from_secs(config.jobs.restart_abort_timeout_secs),
        );
        jobs.recover().await;

        let avatars: Arc<dyn AvatarSource> = Arc::new(RobloxWeb::new(
            http_timeout,
            config.pipeline.metadata_poll_attempts,
        )?);

        let editor: Arc<dyn EditorBridge> = Arc::new(TcpEditorBridge::new(
            config.server.editor_addr.clone(),
            Duration::from_secs(config.server.editor_timeout_secs),
        ));

        let (image_model, video_model) = match &config.providers.api_key {
            Some(key) => {
                let client = Arc::new(GenAiClient::new(
                    key.clone(),
                    config.providers.image_model.clone(),
                    config.providers.video_model.clone(),
                    http_timeout,
                )?);
                (
                    Some(Arc::clone(&client) as Arc<dyn ImageModel>),
                    Some(client as Arc<dyn VideoModel>),
                )
            }
            None => {
                warn!("no provider API key; image and video plugins will report unavailable");
                (None, None)
            }
        };

        Ok(Arc::new(Self {
            config,
            paths,
            uids,
            registry,
            references,
            sessions,
            session_files,
            jobs,
            events,
            avatars,
            editor,
            image_model,
            video_model,
        }))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use melange_common::errors::{ErrorCode, HubError};
    use serde_json::Value;
    use std::path::Path;

    /// Editor double that records commands and replies from a script.
    pub struct ScriptedEditor {
        pub sent: std::sync::Mutex<Vec<(String, Value)>>,
        pub responses: std::sync::Mutex<std::collections::HashMap<String, Value>>,
    }

    impl Default for ScriptedEditor {
        fn default() -> Self {
            Self {
                sent: std::sync::Mutex::new(Vec::new()),
                responses: std::sync::Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    impl ScriptedEditor {
        pub fn respond_to(&self, command: &str, response: Value) {
            self.responses
                .lock()
                .unwrap()
                .insert(command.to_string(), response);
        }
    }

    #[async_trait::async_trait]
    impl EditorBridge for ScriptedEditor {
        async fn send_command(&self, command_type: &str, params: &Value) -> HubResult<Value> {
            self.sent
                .lock()
                .unwrap()
                .push((command_type.to_string(), params.clone()));
            self.responses
                .lock()
                .unwrap()
                .get(command_type)
                .cloned()
                .ok_or_else(|| {
                    HubError::new(
                        ErrorCode::CommandFailed,
                        format!("no scripted response for {command_type}"),
                    )
                })
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn fresh_connection(&self) -> Arc<dyn EditorBridge> {
            // Share state so tests can observe import commands too.
            Arc::new(Self {
                sent: std::sync::Mutex::new(Vec::new()),
                responses: std::sync::Mutex::new(self.responses.lock().unwrap().clone()),
            })
        }
    }

    /// Build services over temp storage and injected provider doubles.
    pub async fn services_with(
        root: &Path,
        config: HubConfig,
        avatars: Arc<dyn AvatarSource>,
        editor: Arc<dyn EditorBridge>,
        image_model: Option<Arc<dyn ImageModel>>,
        video_model: Option<Arc<dyn VideoModel>>,
    ) -> Arc<Services> {
        let paths = Arc::new(PathResolver::for_test(root));
        let uids = Arc::new(UidAllocator::load(paths.uid_state_file().unwrap()).unwrap());
        let registry = Arc::new(ResourceRegistry::load(paths.registry_file().unwrap()).unwrap());
        let references = Arc::new(ReferenceStore::load(Arc::clone(&paths)).unwrap());
        let session_files =
            Arc::new(FileSessionStore::new(paths.sessions_dir().unwrap(), 7).unwrap());
        let sessions = Arc::new(SessionStore::new(
            None,
            Arc::clone(&session_files) as Arc<dyn SessionStorage>,
        ));
        let events = EventBus::default();
        let jobs = JobManager::new(events.clone(), None, Duration::from_secs(300));

        Arc::new(Services {
            config,
            paths,
            uids,
            registry,
            references,
            sessions,
            session_files,
            jobs,
            events,
            avatars,
            editor,
            image_model,
            video_model,
        })
    }
}
