//! Network record-store session backend (the primary).
//!
//! The backend treats session documents as typed rows keyed by
//! `session_id`. The wire protocol is hidden behind the narrow
//! [`RecordStore`] trait so tests can swap in an in-memory double and the
//! daemon stays ignorant of the hosted service's SDK.

use std::time::Duration;

use async_trait::async_trait;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use melange_common::types::SessionContext;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::SessionStorage;

/// Narrow client interface to the hosted record store.
///
/// Rows are keyed by an opaque id within a collection; sessions and the
/// job manager's durable mirror are two collections of the same store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, id: &str, document: &Value) -> HubResult<()>;
    async fn fetch(&self, id: &str) -> HubResult<Option<Value>>;
    async fn remove(&self, id: &str) -> HubResult<bool>;
    /// Rows ordered by `last_accessed` descending.
    async fn list(&self, limit: usize, offset: usize) -> HubResult<Vec<Value>>;
    async fn count(&self) -> HubResult<usize>;
    async fn ping(&self) -> bool;
}

/// Session storage over any [`RecordStore`].
pub struct RecordSessionStore {
    store: Box<dyn RecordStore>,
}

impl RecordSessionStore {
    pub fn new(store: Box<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionStorage for RecordSessionStore {
    async fn create(&self, context: &SessionContext) -> HubResult<()> {
        let document = serde_json::to_value(context)?;
        self.store.upsert(&context.session_id, &document).await
    }

    async fn get(&self, session_id: &str) -> HubResult<Option<SessionContext>> {
        match self.store.fetch(session_id).await? {
            Some(document) => Ok(Some(serde_json::from_value(document)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, context: &SessionContext) -> HubResult<()> {
        let document = serde_json::to_value(context)?;
        self.store.upsert(&context.session_id, &document).await
    }

    async fn delete(&self, session_id: &str) -> HubResult<bool> {
        self.store.remove(session_id).await
    }

    async fn list(&self, limit: usize, offset: usize) -> HubResult<Vec<SessionContext>> {
        let rows = self.store.list(limit, offset).await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value(row) {
                Ok(context) => sessions.push(context),
                Err(err) => debug!("skipping malformed session row: {err}"),
            }
        }
        Ok(sessions)
    }

    async fn cleanup_older_than(&self, max_age: Duration) -> HubResult<usize> {
        // Fetch-and-filter; the hosted store has no age predicate in the
        // narrow interface.
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|err| HubError::storage("cleanup cutoff", err))?;
        let rows = self.list(usize::MAX, 0).await?;
        let mut deleted = 0;
        for context in rows {
            if context.last_accessed < cutoff && self.delete(&context.session_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn count(&self) -> HubResult<usize> {
        self.store.count().await
    }

    async fn health_check(&self) -> bool {
        self.store.ping().await
    }
}

/// REST implementation of [`RecordStore`].
///
/// Row shape: `PUT {base}/{collection}/{id}` upserts, `GET` fetches,
/// `DELETE` removes, `GET {base}/{collection}?limit=&offset=` lists
/// ordered by `last_accessed` descending.
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
}

impl HttpRecordStore {
    pub fn new(
        base_url: String,
        collection: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> HubResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| HubError::new(ErrorCode::ConnectionFailed, err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn network(err: reqwest::Error) -> HubError {
        HubError::new(ErrorCode::NetworkError, format!("record store: {err}"))
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn upsert(&self, id: &str, document: &Value) -> HubResult<()> {
        let response = self
            .authorize(self.client.put(self.url(&format!("{}/{id}", self.collection))))
            .json(document)
            .send()
            .await
            .map_err(Self::network)?;
        if !response.status().is_success() {
            return Err(HubError::new(
                ErrorCode::StorageError,
                format!("record store upsert returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn fetch(&self, id: &str) -> HubResult<Option<Value>> {
        let response = self
            .authorize(self.client.get(self.url(&format!("{}/{id}", self.collection))))
            .send()
            .await
            .map_err(Self::network)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(HubError::new(
                ErrorCode::StorageError,
                format!("record store fetch returned {}", response.status()),
            ));
        }
        Ok(Some(response.json().await.map_err(Self::network)?))
    }

    async fn remove(&self, id: &str) -> HubResult<bool> {
        let response = self
            .authorize(self.client.delete(self.url(&format!("{}/{id}", self.collection))))
            .send()
            .await
            .map_err(Self::network)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(HubError::new(
                ErrorCode::StorageError,
                format!("record store delete returned {status}"),
            )),
        }
    }

    async fn list(&self, limit: usize, offset: usize) -> HubResult<Vec<Value>> {
        let response = self
            .authorize(self.client.get(self.url(&format!(
                "{}?limit={limit}&offset={offset}&order=last_accessed.desc",
                self.collection
            ))))
            .send()
            .await
            .map_err(Self::network)?;
        if !response.status().is_success() {
            return Err(HubError::new(
                ErrorCode::StorageError,
                format!("record store list returned {}", response.status()),
            ));
        }
        Ok(response.json().await.map_err(Self::network)?)
    }

    async fn count(&self) -> HubResult<usize> {
        Ok(self.list(usize::MAX.min(10_000), 0).await?.len())
    }

    async fn ping(&self) -> bool {
        self.authorize(self.client.get(self.url("health")))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}
