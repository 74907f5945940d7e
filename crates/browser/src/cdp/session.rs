//! CDP session - the exposed wrapper for one attached target.
//!
//! Design: lightweight handle over the shared transport with
//! target-specific context. Sessions are created by the registry from
//! attach notifications, never by client-issued attach calls - those race
//! with the browser's own bookkeeping.
//!
//! The `{session_id, title, url}` triple sits behind a mutex so a
//! reattach updates the wrapper in place: external holders of the `Arc`
//! keep seeing live data instead of a stale snapshot.

use super::client::{Result, Transport};
use super::protocol::{SessionId, TargetId, TargetInfo};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct SessionState {
    session_id: SessionId,
    title: String,
    url: String,
}

/// A debugging session bound to one target.
pub struct CDPSession {
    transport: Arc<dyn Transport>,
    pub target_id: TargetId,
    state: Mutex<SessionState>,
}

impl CDPSession {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        target_id: TargetId,
        session_id: SessionId,
        title: String,
        url: String,
    ) -> Self {
        Self {
            transport,
            target_id,
            state: Mutex::new(SessionState {
                session_id,
                title,
                url,
            }),
        }
    }

    /// Current session id. Changes on reattach.
    pub fn session_id(&self) -> SessionId {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn title(&self) -> String {
        self.state.lock().unwrap().title.clone()
    }

    pub fn url(&self) -> String {
        self.state.lock().unwrap().url.clone()
    }

    /// In-place update on reattach. Registry-only.
    pub(crate) fn update(&self, session_id: SessionId, title: Option<String>, url: Option<String>) {
        let mut state = self.state.lock().unwrap();
        state.session_id = session_id;
        if let Some(title) = title {
            state.title = title;
        }
        if let Some(url) = url {
            state.url = url;
        }
    }

    /// Send a command within this session's context.
    pub async fn send(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        let session_id = self.session_id();
        self.transport
            .send(&method.into(), params, Some(&session_id))
            .await
    }

    /// Fetch fresh target info.
    pub async fn get_target_info(&self) -> Result<TargetInfo> {
        let result = self
            .transport
            .send(
                "Target.getTargetInfo",
                Some(json!({ "targetId": &self.target_id })),
                None,
            )
            .await?;

        serde_json::from_value(result["targetInfo"].clone()).map_err(Into::into)
    }

    /// Navigate this target.
    pub async fn navigate(&self, url: impl Into<String>) -> Result<Value> {
        self.send("Page.navigate", Some(json!({ "url": url.into() })))
            .await
    }

    /// Evaluate a JavaScript expression.
    pub async fn evaluate(&self, expression: impl Into<String>) -> Result<Value> {
        self.send(
            "Runtime.evaluate",
            Some(json!({
                "expression": expression.into(),
                "returnByValue": true,
            })),
        )
        .await
    }
}

impl std::fmt::Debug for CDPSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CDPSession")
            .field("target_id", &self.target_id)
            .field("session_id", &state.session_id)
            .field("url", &state.url)
            .finish()
    }
}
