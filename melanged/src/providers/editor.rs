//! TCP command bridge to the running 3D editor process.
//!
//! The editor listens on a single TCP stream speaking newline-delimited
//! JSON. That stream is not safe to share across concurrent commands, so
//! the bridge serializes send/recv behind an async mutex. Long pipelines
//! construct a fresh bridge for their final import step because the
//! long-lived connection may have aged out during polling.

use std::time::Duration;

use async_trait::async_trait;
use melange_common::errors::{ErrorCode, HubError, HubResult};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Narrow edge every editor-facing component talks through.
#[async_trait]
pub trait EditorBridge: Send + Sync {
    /// Send one command and wait for its response payload.
    async fn send_command(&self, command_type: &str, params: &Value) -> HubResult<Value>;

    /// Whether the editor currently accepts connections.
    async fn is_available(&self) -> bool;

    /// A fresh, unconnected bridge to the same editor. The asset-import
    /// step uses this to avoid a pipeline connection that aged out while
    /// polling.
    fn fresh_connection(&self) -> std::sync::Arc<dyn EditorBridge>;
}

/// TCP implementation with one serialized connection.
pub struct TcpEditorBridge {
    addr: String,
    timeout: Duration,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpEditorBridge {
    pub fn new(addr: String, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            stream: Mutex::new(None),
        }
    }

    async fn connect(&self) -> HubResult<BufReader<TcpStream>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                HubError::new(
                    ErrorCode::ConnectionFailed,
                    format!("editor connect timed out after {:?}", self.timeout),
                )
            })?
            .map_err(|err| {
                HubError::new(
                    ErrorCode::ConnectionFailed,
                    format!("editor connect failed: {err}"),
                )
            })?;
        debug!("connected to editor at {}", self.addr);
        Ok(BufReader::new(stream))
    }

    async fn roundtrip(&self, payload: &Value) -> HubResult<Value> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let stream = guard.as_mut().expect("connection established above");

        let mut line = serde_json::to_string(payload)?;
        line.push('\n');

        let io = async {
            stream.get_mut().write_all(line.as_bytes()).await?;
            stream.get_mut().flush().await?;
            let mut response = String::new();
            let n = stream.read_line(&mut response).await?;
            Ok::<(usize, String), std::io::Error>((n, response))
        };

        let (n, response) = match tokio::time::timeout(self.timeout, io).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                // Drop the broken connection so the next call redials.
                *guard = None;
                return Err(HubError::new(
                    ErrorCode::ConnectionFailed,
                    format!("editor io failed: {err}"),
                ));
            }
            Err(_) => {
                *guard = None;
                return Err(HubError::new(
                    ErrorCode::CommandTimeout,
                    format!("editor command timed out after {:?}", self.timeout),
                ));
            }
        };

        if n == 0 {
            *guard = None;
            return Err(HubError::new(
                ErrorCode::ConnectionFailed,
                "editor closed the connection",
            ));
        }
        Ok(serde_json::from_str(response.trim())?)
    }
}

#[async_trait]
impl EditorBridge for TcpEditorBridge {
    async fn send_command(&self, command_type: &str, params: &Value) -> HubResult<Value> {
        let payload = serde_json::json!({
            "type": command_type,
            "params": params,
        });
        let response = self.roundtrip(&payload).await?;

        if response.get("status").and_then(Value::as_str) == Some("error") {
            let message = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown editor error");
            warn!("editor rejected {command_type}: {message}");
            return Err(
                HubError::new(ErrorCode::CommandFailed, message.to_string())
                    .with_details(serde_json::json!({"command_type": command_type})),
            );
        }
        Ok(response)
    }

    async fn is_available(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&self.addr))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    fn fresh_connection(&self) -> std::sync::Arc<dyn EditorBridge> {
        std::sync::Arc::new(Self::new(self.addr.clone(), self.timeout))
    }
}
