//! CDP client - the core communication layer.
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Request/response matching via ID, events fanned out to subscribers
//! 3. Fail fast - no retries, no queuing. Let the caller decide.
//! 4. Everything above this layer talks to the [`Transport`] trait, never
//!    to the concrete client.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::*;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Navigation blocked by security policy: {0}")]
    NavigationBlocked(String),

    #[error("No session for target {0}")]
    NoSession(String),
}

impl CDPError {
    /// A detach racing ahead of our command. Expected for short-lived
    /// targets (workers, transient iframes); callers downgrade it to a
    /// diagnostic.
    pub fn is_session_gone(&self) -> bool {
        matches!(
            self,
            CDPError::Protocol { code: -32001, .. } | CDPError::Closed
        )
    }
}

/// Result type for CDP operations.
pub type Result<T> = std::result::Result<T, CDPError>;

/// Event subscriber callback. Called on the reader task; spawn for
/// anything that suspends.
pub type EventCallback = Arc<dyn Fn(CDPEvent) + Send + Sync>;

/// The protocol surface the registry, watchdogs and extraction engine
/// depend on: request/response `send` plus fire-and-forget event
/// delivery. `CDPClient` is the production implementation; tests use a
/// recording mock.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value>;

    /// Register a handler for a protocol event by method name.
    fn on_event(&self, method: &str, callback: EventCallback);
}

/// CDP client - manages a single WebSocket connection to the browser.
pub struct CDPClient {
    /// Monotonic request ID counter.
    next_id: AtomicU64,

    /// Pending requests waiting for responses.
    pending: Arc<DashMap<RequestId, oneshot::Sender<CDPResponse>>>,

    /// Event subscribers, keyed by method name.
    subscribers: Arc<DashMap<String, Vec<EventCallback>>>,

    /// WebSocket write half.
    ws_sink: Arc<RwLock<WsSink>>,

    /// Cancels the reader task at shutdown.
    shutdown: CancellationToken,
}

impl CDPClient {
    /// Connect to a CDP endpoint and spawn the reader task.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();

        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            ws_sink: Arc::new(RwLock::new(sink)),
            shutdown: CancellationToken::new(),
        });

        let reader = client.clone();
        let shutdown = client.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = reader.handle_message(&text) {
                                    tracing::error!("[CDPClient] Failed to handle message: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("[CDPClient] WebSocket closed");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("[CDPClient] WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("[CDPClient] Reader shutdown requested");
                        break;
                    }
                }
            }

            // Fail all pending requests so callers see Closed, not a hang.
            reader.pending.clear();
        });

        Ok(client)
    }

    /// Send a CDP request and wait for the matching response.
    pub async fn send_request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<SessionId>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = CDPRequest {
            id,
            method: method.into(),
            params,
            session_id,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let json = serde_json::to_string(&request)?;
        {
            let mut sink = self.ws_sink.write().await;
            sink.send(Message::Text(json)).await.map_err(|e| {
                self.pending.remove(&id);
                CDPError::WebSocket(e)
            })?;
        }

        let response = rx.await.map_err(|_| CDPError::Closed)?;

        if let Some(error) = response.error {
            return Err(CDPError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Subscribe to CDP events by method name.
    pub fn subscribe(&self, method: impl Into<String>, callback: EventCallback) {
        self.subscribers
            .entry(method.into())
            .or_default()
            .push(callback);
    }

    fn handle_message(&self, text: &str) -> Result<()> {
        let msg: CDPMessage = serde_json::from_str(text)?;

        match msg {
            CDPMessage::Response(response) => {
                if let Some((_, tx)) = self.pending.remove(&response.id) {
                    let _ = tx.send(response);
                } else {
                    tracing::warn!(
                        "[CDPClient] Response for unknown request: {}",
                        response.id
                    );
                }
            }
            CDPMessage::Event(event) => {
                if let Some(subscribers) = self.subscribers.get(&event.method) {
                    for callback in subscribers.value() {
                        callback(event.clone());
                    }
                }
            }
        }

        Ok(())
    }

    /// Close the connection: stop the reader, close the sink.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for CDPClient {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value> {
        self.send_request(method, params, session_id.map(String::from))
            .await
    }

    fn on_event(&self, method: &str, callback: EventCallback) {
        self.subscribe(method, callback);
    }
}

/// Bounded send. Every externally-imposed wait in this crate goes through
/// an explicit upper bound; exceeding it degrades to `CDPError::Timeout`.
pub async fn send_with_timeout(
    transport: &dyn Transport,
    method: &str,
    params: Option<Value>,
    session_id: Option<&str>,
    bound: Duration,
) -> Result<Value> {
    tokio::time::timeout(bound, transport.send(method, params, session_id))
        .await
        .map_err(|_| CDPError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    // Real round-trip tests need a running browser; see the registry and
    // watchdog tests for mock-transport coverage.

    #[tokio::test]
    #[ignore]
    async fn test_connect() {
        let client = CDPClient::connect("ws://localhost:9222/devtools/browser")
            .await
            .unwrap();

        let result = client
            .send_request("Browser.getVersion", None, None)
            .await
            .unwrap();

        println!("Browser version: {:?}", result);
    }

    #[test]
    fn test_session_gone_classification() {
        let gone = CDPError::Protocol {
            code: -32001,
            message: "Session with given id not found".into(),
        };
        assert!(gone.is_session_gone());

        let other = CDPError::Protocol {
            code: -32000,
            message: "Some other failure".into(),
        };
        assert!(!other.is_session_gone());
    }
}
