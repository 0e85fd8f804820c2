//! Durable, queryable backing for session context.
//!
//! Two backends implement [`SessionStorage`]: a network record store
//! (primary) and the local filesystem (fallback). The [`SessionStore`]
//! policy layer in this module dual-homes writes (success when at least
//! one backend accepts), prefers the primary for reads, and falls back
//! on any failure surface or a primary miss. The miss case covers
//! sessions written while the primary was down.

pub mod file;
pub mod record;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use melange_common::errors::{HubError, HubResult};
use melange_common::types::SessionContext;
use melange_common::{session_id, types::MessageRole};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Contract every session backend satisfies.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn create(&self, context: &SessionContext) -> HubResult<()>;
    async fn get(&self, session_id: &str) -> HubResult<Option<SessionContext>>;
    /// Full-document replace.
    async fn update(&self, context: &SessionContext) -> HubResult<()>;
    async fn delete(&self, session_id: &str) -> HubResult<bool>;
    /// Ordered by `last_accessed` descending.
    async fn list(&self, limit: usize, offset: usize) -> HubResult<Vec<SessionContext>>;
    async fn cleanup_older_than(&self, max_age: Duration) -> HubResult<usize>;
    async fn count(&self) -> HubResult<usize>;
    async fn health_check(&self) -> bool;
}

/// Dual-homed policy over a primary and a fallback backend.
///
/// Each session document is the unit of contention: a per-session async
/// mutex serializes read-modify-write cycles from concurrent callers.
pub struct SessionStore {
    primary: Option<Arc<dyn SessionStorage>>,
    fallback: Arc<dyn SessionStorage>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(
        primary: Option<Arc<dyn SessionStorage>>,
        fallback: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            primary,
            fallback,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn validate(session_id: &str) -> HubResult<()> {
        if session_id::is_valid(session_id) {
            Ok(())
        } else {
            Err(HubError::new(
                melange_common::errors::ErrorCode::InvalidUserInput,
                format!("not a valid session id: '{session_id}'"),
            ))
        }
    }

    /// Mint a new session. The write is best-effort dual-homed: it
    /// succeeds when at least one backend accepts the document.
    pub async fn create_session(&self, session_name: Option<String>) -> HubResult<SessionContext> {
        let context = SessionContext::new(session_id::generate(), session_name);
        self.write_both("create", &context).await?;
        info!("created session {}", context.session_id);
        Ok(context)
    }

    /// Fetch a session. A successful read bumps `last_accessed` and writes
    /// the bump back (best-effort).
    pub async fn get_session(&self, session_id: &str) -> HubResult<SessionContext> {
        Self::validate(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut context = self
            .read_preferring_primary(session_id)
            .await?
            .ok_or_else(|| HubError::session_not_found(session_id))?;

        context.last_accessed = Utc::now();
        if let Err(err) = self.write_both("update", &context).await {
            warn!("failed to persist last_accessed bump for {session_id}: {err}");
        }
        Ok(context)
    }

    /// Replace a session document under its per-session lock.
    pub async fn update_session(&self, context: &SessionContext) -> HubResult<()> {
        Self::validate(&context.session_id)?;
        let lock = self.session_lock(&context.session_id).await;
        let _guard = lock.lock().await;
        let mut context = context.clone();
        context.last_accessed = Utc::now();
        self.write_both("update", &context).await
    }

    /// Run a read-modify-write cycle atomically with respect to other
    /// callers touching the same session.
    pub async fn modify_session<F>(&self, session_id: &str, mutate: F) -> HubResult<SessionContext>
    where
        F: FnOnce(&mut SessionContext) + Send,
    {
        Self::validate(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut context = self
            .read_preferring_primary(session_id)
            .await?
            .ok_or_else(|| HubError::session_not_found(session_id))?;
        mutate(&mut context);
        context.last_accessed = Utc::now();
        self.write_both("update", &context).await?;
        Ok(context)
    }

    pub async fn delete_session(&self, session_id: &str) -> HubResult<bool> {
        Self::validate(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut deleted = false;
        if let Some(primary) = &self.primary {
            match primary.delete(session_id).await {
                Ok(d) => deleted |= d,
                Err(err) => warn!("primary delete failed for {session_id}: {err}"),
            }
        }
        match self.fallback.delete(session_id).await {
            Ok(d) => deleted |= d,
            Err(err) => warn!("fallback delete failed for {session_id}: {err}"),
        }
        Ok(deleted)
    }

    /// Sessions ordered by `last_accessed` descending.
    pub async fn list_sessions(&self, limit: usize, offset: usize) -> HubResult<Vec<SessionContext>> {
        let mut sessions = match &self.primary {
            Some(primary) => match primary.list(limit, offset).await {
                Ok(sessions) => sessions,
                Err(err) => {
                    warn!("primary list failed, using fallback: {err}");
                    self.fallback.list(limit, offset).await?
                }
            },
            None => self.fallback.list(limit, offset).await?,
        };
        sessions.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        Ok(sessions)
    }

    pub async fn cleanup_older_than(&self, max_age: Duration) -> HubResult<usize> {
        let mut total = 0;
        if let Some(primary) = &self.primary {
            match primary.cleanup_older_than(max_age).await {
                Ok(n) => total += n,
                Err(err) => warn!("primary cleanup failed: {err}"),
            }
        }
        total += self.fallback.cleanup_older_than(max_age).await?;
        Ok(total)
    }

    pub async fn health(&self) -> (bool, bool) {
        let primary = match &self.primary {
            Some(primary) => primary.health_check().await,
            None => false,
        };
        let fallback = self.fallback.health_check().await;
        (primary, fallback)
    }

    /// Append or update a job-status message for a session, ignoring a
    /// missing session (jobs may outlive their session).
    pub async fn record_job_update(
        &self,
        session_id: &str,
        job_id: &str,
        job_status: &str,
        content: Option<&str>,
        progress: Option<u8>,
        image_url: Option<String>,
    ) {
        let result = self
            .modify_session(session_id, |context| {
                context.update_job_message(job_id, job_status, content, progress, image_url);
            })
            .await;
        if let Err(err) = result {
            debug!("job update not recorded for {session_id}: {err}");
        }
    }

    async fn read_preferring_primary(
        &self,
        session_id: &str,
    ) -> HubResult<Option<SessionContext>> {
        if let Some(primary) = &self.primary {
            match primary.get(session_id).await {
                Ok(Some(context)) => return Ok(Some(context)),
                Ok(None) => {
                    debug!("primary miss for {session_id}, consulting fallback");
                }
                Err(err) => {
                    warn!("primary read failed for {session_id}, consulting fallback: {err}");
                }
            }
        }
        self.fallback.get(session_id).await
    }

    async fn write_both(&self, op: &str, context: &SessionContext) -> HubResult<()> {
        let mut last_err = None;
        let mut accepted = false;

        if let Some(primary) = &self.primary {
            let result = match op {
                "create" => primary.create(context).await,
                _ => primary.update(context).await,
            };
            match result {
                Ok(()) => accepted = true,
                Err(err) => {
                    warn!("primary {op} failed for {}: {err}", context.session_id);
                    last_err = Some(err);
                }
            }
        }

        let result = match op {
            "create" => self.fallback.create(context).await,
            _ => self.fallback.update(context).await,
        };
        match result {
            Ok(()) => accepted = true,
            Err(err) => {
                warn!("fallback {op} failed for {}: {err}", context.session_id);
                last_err = Some(err);
            }
        }

        if accepted {
            Ok(())
        } else {
            Err(last_err.unwrap_or_else(|| HubError::storage(op, "no backend accepted the write")))
        }
    }
}

/// Render a short transcript of recent messages for planner context.
pub fn conversation_summary(context: &SessionContext, max_messages: usize) -> String {
    if context.conversation_history.is_empty() {
        return "No previous conversation history.".to_string();
    }
    let start = context
        .conversation_history
        .len()
        .saturating_sub(max_messages);
    let mut parts = Vec::new();
    for msg in &context.conversation_history[start..] {
        match msg.role {
            MessageRole::User => parts.push(format!("User: {}", msg.content)),
            MessageRole::Assistant => {
                if msg.commands.is_empty() {
                    parts.push(format!("Assistant: {}", msg.content));
                } else {
                    let commands: Vec<&str> = msg
                        .commands
                        .iter()
                        .filter_map(|c| c.get("type").and_then(serde_json::Value::as_str))
                        .collect();
                    parts.push(format!(
                        "Assistant: {} (Executed: {})",
                        msg.content,
                        commands.join(", ")
                    ));
                }
            }
            MessageRole::Job => {
                let status = msg
                    .job_info
                    .as_ref()
                    .and_then(|i| i.job_status.as_deref())
                    .unwrap_or("unknown");
                let progress = msg
                    .job_info
                    .as_ref()
                    .and_then(|i| i.job_progress)
                    .unwrap_or(0);
                parts.push(format!(
                    "Job {}: {status} ({progress}%)",
                    msg.job_id.as_deref().unwrap_or("?")
                ));
            }
            MessageRole::System => {}
        }
    }
    parts.join("\n")
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStorage;
    use super::*;
    use std::sync::atomic::Ordering;

    fn store_with(
        primary: Option<Arc<MemoryStorage>>,
        fallback: Arc<MemoryStorage>,
    ) -> SessionStore {
        SessionStore::new(
            primary.map(|p| p as Arc<dyn SessionStorage>),
            fallback as Arc<dyn SessionStorage>,
        )
    }

    #[tokio::test]
    async fn create_get_update_round_trip() {
        let fallback = Arc::new(MemoryStorage::default());
        let store = store_with(None, fallback);

        let created = store.create_session(Some("demo".into())).await.unwrap();
        let fetched = store.get_session(&created.session_id).await.unwrap();
        assert_eq!(fetched.session_name.as_deref(), Some("demo"));
        assert!(fetched.last_accessed >= created.last_accessed);

        let modified = store
            .modify_session(&created.session_id, |context| {
                context.add_message(MessageRole::User, "hello", vec![], vec![]);
            })
            .await
            .unwrap();
        assert_eq!(modified.conversation_history.len(), 1);

        let again = store.get_session(&created.session_id).await.unwrap();
        assert_eq!(again.conversation_history[0].content, "hello");
    }

    #[tokio::test]
    async fn all_operations_survive_primary_failure() {
        let primary = Arc::new(MemoryStorage::default());
        primary.fail_all.store(true, Ordering::SeqCst);
        let fallback = Arc::new(MemoryStorage::default());
        let store = store_with(Some(primary), fallback);

        let created = store.create_session(None).await.unwrap();
        let fetched = store.get_session(&created.session_id).await.unwrap();
        assert_eq!(fetched.session_id, created.session_id);

        store
            .modify_session(&created.session_id, |context| {
                context.add_message(MessageRole::User, "still works", vec![], vec![]);
            })
            .await
            .unwrap();

        let listed = store.list_sessions(10, 0).await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(store.delete_session(&created.session_id).await.unwrap());
        assert!(store.get_session(&created.session_id).await.is_err());
    }

    #[tokio::test]
    async fn read_falls_back_on_primary_miss() {
        // Simulates a session written while the primary was down: the
        // fallback has it, the (now healthy) primary does not.
        let primary = Arc::new(MemoryStorage::default());
        let fallback = Arc::new(MemoryStorage::default());
        let context = SessionContext::new("sess_fallbackonly".to_string(), None);
        SessionStorage::create(fallback.as_ref(), &context)
            .await
            .unwrap();

        let store = store_with(Some(primary), fallback);
        let fetched = store.get_session("sess_fallbackonly").await.unwrap();
        assert_eq!(fetched.session_id, "sess_fallbackonly");
    }

    #[tokio::test]
    async fn list_orders_by_last_accessed_desc() {
        let fallback = Arc::new(MemoryStorage::default());
        let store = store_with(None, fallback);

        let first = store.create_session(Some("first".into())).await.unwrap();
        let _second = store.create_session(Some("second".into())).await.unwrap();
        // Touch the first session so it becomes the most recent.
        store.get_session(&first.session_id).await.unwrap();

        let listed = store.list_sessions(10, 0).await.unwrap();
        assert_eq!(listed[0].session_id, first.session_id);
    }

    #[tokio::test]
    async fn invalid_session_ids_are_rejected_at_entry() {
        let fallback = Arc::new(MemoryStorage::default());
        let store = store_with(None, fallback);
        assert!(store.get_session("not-a-session").await.is_err());
        assert!(store.delete_session("").await.is_err());
    }
}
