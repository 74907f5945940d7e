//! Event-driven target/session registry.
//!
//! The single source of truth for "which sessions exist and which target
//! each belongs to", derived exclusively from Target.attachedToTarget and
//! Target.detachedFromTarget notifications - never from client-issued
//! close calls, since those race with the browser's own notifications.
//!
//! Concurrency discipline: both maps mutate as one atomic unit under a
//! single `std::sync::Mutex`, held only for the map edits. Protocol calls
//! triggered as a consequence (resume, auto-attach) run in spawned tasks
//! outside the lock, so a slow or failing call never blocks registry
//! consistency for unrelated targets.

use crate::cdp::client::Transport;
use crate::cdp::protocol::{
    AttachedToTargetEvent, DetachedFromTargetEvent, SessionId, TargetId,
};
use crate::cdp::session::CDPSession;
use crate::events::{BrowserEvent, EventBus};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RegistryState {
    /// Target -> set of sessions attached to it.
    target_sessions: HashMap<TargetId, HashSet<SessionId>>,

    /// Session -> target, for detach events without a target id.
    session_to_target: HashMap<SessionId, TargetId>,

    /// Target -> type cache (page, iframe, worker, ...). Immutable once
    /// set.
    target_types: HashMap<TargetId, String>,

    /// Exposed wrapper per target. Created on first attach, updated in
    /// place on reattach, released when the last session detaches.
    pool: HashMap<TargetId, Arc<CDPSession>>,
}

/// Event-driven session registry for one browser connection.
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    bus: EventBus,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            transport,
            bus,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Register the attach/detach handlers on the root connection. The
    /// registry reacts to notifications only; it never initiates
    /// attachment itself.
    pub fn install(self: &Arc<Self>, transport: &dyn Transport) {
        let registry = self.clone();
        transport.on_event(
            "Target.attachedToTarget",
            Arc::new(move |event| {
                let Some(params) = event.params else { return };
                match serde_json::from_value::<AttachedToTargetEvent>(params) {
                    Ok(attached) => {
                        let registry = registry.clone();
                        tokio::spawn(async move { registry.on_attached(attached).await });
                    }
                    Err(e) => {
                        tracing::warn!("[SessionRegistry] Bad attachedToTarget payload: {}", e)
                    }
                }
            }),
        );

        let registry = self.clone();
        transport.on_event(
            "Target.detachedFromTarget",
            Arc::new(move |event| {
                let Some(params) = event.params else { return };
                match serde_json::from_value::<DetachedFromTargetEvent>(params) {
                    Ok(detached) => {
                        let registry = registry.clone();
                        tokio::spawn(async move { registry.on_detached(detached).await });
                    }
                    Err(e) => {
                        tracing::warn!("[SessionRegistry] Bad detachedFromTarget payload: {}", e)
                    }
                }
            }),
        );

        tracing::info!("[SessionRegistry] Event monitoring started");
    }

    /// Reverse lookup: which target does a session belong to.
    pub fn target_for_session(&self, session_id: &str) -> Option<TargetId> {
        self.state
            .lock()
            .unwrap()
            .session_to_target
            .get(session_id)
            .cloned()
    }

    /// Handle Target.attachedToTarget. The only place sessions are added.
    pub async fn on_attached(&self, event: AttachedToTargetEvent) {
        let target_id = event.target_info.target_id.clone();
        let session_id = event.session_id.clone();
        let target_type = event.target_info.target_type.clone();

        tracing::debug!(
            "[SessionRegistry] Target attached: {} (session={}, type={}, waitingForDebugger={})",
            target_id,
            session_id,
            target_type,
            event.waiting_for_debugger
        );

        let first_session_for_target = {
            let mut state = self.state.lock().unwrap();

            state
                .target_sessions
                .entry(target_id.clone())
                .or_default()
                .insert(session_id.clone());
            state
                .session_to_target
                .insert(session_id.clone(), target_id.clone());
            state
                .target_types
                .entry(target_id.clone())
                .or_insert_with(|| target_type.clone());

            if let Some(existing) = state.pool.get(&target_id) {
                // Reattach: update the wrapper in place so external
                // holders keep seeing live data.
                existing.update(
                    session_id.clone(),
                    Some(event.target_info.title.clone()),
                    Some(event.target_info.url.clone()),
                );
                false
            } else {
                let session = Arc::new(CDPSession::new(
                    self.transport.clone(),
                    target_id.clone(),
                    session_id.clone(),
                    event.target_info.title.clone(),
                    event.target_info.url.clone(),
                ));
                state.pool.insert(target_id.clone(), session);
                true
            }
        };

        // Side effects after the lock is released.

        // Auto-attach for this session's children so nested frames and
        // workers are discovered automatically. Expected to fail for
        // short-lived targets that detach before the call lands.
        {
            let transport = self.transport.clone();
            let session_id = session_id.clone();
            let target_type = target_type.clone();
            tokio::spawn(async move {
                let result = transport
                    .send(
                        "Target.setAutoAttach",
                        Some(json!({
                            "autoAttach": true,
                            "waitForDebuggerOnStart": false,
                            "flatten": true,
                        })),
                        Some(&session_id),
                    )
                    .await;
                match result {
                    Ok(_) => tracing::debug!(
                        "[SessionRegistry] Auto-attach enabled for {} session {}",
                        target_type,
                        session_id
                    ),
                    Err(e) if e.is_session_gone() => tracing::debug!(
                        "[SessionRegistry] Auto-attach skipped for {} session {} \
                         (already detached - normal for short-lived targets)",
                        target_type,
                        session_id
                    ),
                    Err(e) => tracing::debug!(
                        "[SessionRegistry] Auto-attach failed for {}: {}",
                        target_type,
                        e
                    ),
                }
            });
        }

        // Resume execution if the target is paused waiting for a
        // debugger. Failure is logged, not fatal.
        if event.waiting_for_debugger {
            let result = self
                .transport
                .send("Runtime.runIfWaitingForDebugger", None, Some(&session_id))
                .await;
            match result {
                Ok(_) => tracing::debug!(
                    "[SessionRegistry] Resumed execution for session {}",
                    session_id
                ),
                Err(e) => tracing::warn!(
                    "[SessionRegistry] Failed to resume execution: {}",
                    e
                ),
            }
        }

        if first_session_for_target && is_page_type(&target_type) {
            self.bus.dispatch(BrowserEvent::TabCreated {
                target_id,
                url: event.target_info.url,
            });
        }
    }

    /// Handle Target.detachedFromTarget. The only place sessions are
    /// removed. A detach for an unknown session is a no-op, not an error
    /// - detach and close race.
    pub async fn on_detached(&self, event: DetachedFromTargetEvent) {
        let session_id = event.session_id;

        let (target_id, fully_removed, target_type) = {
            let mut state = self.state.lock().unwrap();

            let target_id = event
                .target_id
                .or_else(|| state.session_to_target.get(&session_id).cloned());

            let Some(target_id) = target_id else {
                state.session_to_target.remove(&session_id);
                tracing::debug!(
                    "[SessionRegistry] Session {} detached but target unknown",
                    session_id
                );
                return;
            };

            let mut fully_removed = false;
            if let Some(sessions) = state.target_sessions.get_mut(&target_id) {
                sessions.remove(&session_id);
                let remaining = sessions.len();
                tracing::debug!(
                    "[SessionRegistry] Session detached: target={} session={} (remaining={})",
                    target_id,
                    session_id,
                    remaining
                );

                // Only drop the target when no sessions remain.
                if remaining == 0 {
                    state.target_sessions.remove(&target_id);
                    state.pool.remove(&target_id);
                    fully_removed = true;
                }
            } else {
                tracing::debug!(
                    "[SessionRegistry] Detach for untracked target {} (already removed \
                     or attach event was missed)",
                    target_id
                );
            }

            let target_type = state.target_types.get(&target_id).cloned();
            if fully_removed {
                state.target_types.remove(&target_id);
            }

            // Reverse mapping goes unconditionally.
            state.session_to_target.remove(&session_id);

            (target_id, fully_removed, target_type)
        };

        if fully_removed {
            if target_type.as_deref().map(is_page_type).unwrap_or(false) {
                self.bus.dispatch(BrowserEvent::TabClosed { target_id });
            } else {
                tracing::debug!(
                    "[SessionRegistry] Target {} fully removed (type={:?})",
                    target_id,
                    target_type
                );
            }
        }
    }

    /// The canonical way other components resolve "I want to talk to
    /// target T" without caring about session churn.
    pub fn get_session_for_target(&self, target_id: &str) -> Option<Arc<CDPSession>> {
        self.state.lock().unwrap().pool.get(target_id).cloned()
    }

    /// True iff the target currently has at least one session.
    pub fn is_target_live(&self, target_id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .target_sessions
            .get(target_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Targets of page type currently tracked.
    pub fn page_targets(&self) -> Vec<TargetId> {
        let state = self.state.lock().unwrap();
        state
            .target_sessions
            .keys()
            .filter(|t| {
                state
                    .target_types
                    .get(*t)
                    .map(|ty| is_page_type(ty))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Number of tracked targets.
    pub fn target_count(&self) -> usize {
        self.state.lock().unwrap().target_sessions.len()
    }

    /// Empty both mappings. Full shutdown only.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.target_sessions.clear();
        state.session_to_target.clear();
        state.target_types.clear();
        state.pool.clear();
        tracing::info!("[SessionRegistry] Cleared all session tracking");
    }
}

fn is_page_type(target_type: &str) -> bool {
    matches!(target_type, "page" | "tab")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdp::client::{CDPError, EventCallback, Result as CdpResult};
    use crate::cdp::protocol::TargetInfo;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Records every command; succeeds with Null.
    struct MockTransport {
        calls: Mutex<Vec<(String, Option<String>)>>,
        fail_auto_attach: bool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_auto_attach: false,
            })
        }

        fn calls(&self) -> Vec<(String, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(
            &self,
            method: &str,
            _params: Option<Value>,
            session_id: Option<&str>,
        ) -> CdpResult<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), session_id.map(String::from)));
            if method == "Target.setAutoAttach" && self.fail_auto_attach {
                return Err(CDPError::Protocol {
                    code: -32001,
                    message: "Session with given id not found".into(),
                });
            }
            Ok(Value::Null)
        }

        fn on_event(&self, _method: &str, _callback: EventCallback) {}
    }

    fn attached(target: &str, session: &str, kind: &str, waiting: bool) -> AttachedToTargetEvent {
        AttachedToTargetEvent {
            session_id: session.to_string(),
            target_info: TargetInfo {
                target_id: target.to_string(),
                target_type: kind.to_string(),
                title: format!("{target} title"),
                url: format!("https://{target}.example/"),
                attached: true,
            },
            waiting_for_debugger: waiting,
        }
    }

    fn detached(target: Option<&str>, session: &str) -> DetachedFromTargetEvent {
        DetachedFromTargetEvent {
            session_id: session.to_string(),
            target_id: target.map(String::from),
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_attach_then_detach_lifecycle() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", false)).await;
        assert!(registry.is_target_live("t1"));
        assert!(registry.get_session_for_target("t1").is_some());

        registry.on_detached(detached(Some("t1"), "s1")).await;
        assert!(!registry.is_target_live("t1"));
        assert!(registry.get_session_for_target("t1").is_none());
        assert_eq!(registry.target_count(), 0);
    }

    #[tokio::test]
    async fn test_target_live_until_last_session_detaches() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        // Primary automation session plus a devtools-UI session.
        registry.on_attached(attached("t1", "s1", "page", false)).await;
        registry.on_attached(attached("t1", "s2", "page", false)).await;

        registry.on_detached(detached(Some("t1"), "s1")).await;
        assert!(registry.is_target_live("t1"), "one session remains");

        registry.on_detached(detached(Some("t1"), "s2")).await;
        assert!(!registry.is_target_live("t1"));
    }

    #[tokio::test]
    async fn test_detach_unknown_session_is_noop() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", false)).await;
        let before = registry.target_count();

        registry.on_detached(detached(None, "never-seen")).await;

        assert_eq!(registry.target_count(), before);
        assert!(registry.is_target_live("t1"));
    }

    #[tokio::test]
    async fn test_reattach_updates_wrapper_in_place() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", false)).await;
        let wrapper = registry.get_session_for_target("t1").unwrap();
        assert_eq!(wrapper.session_id(), "s1");

        registry.on_attached(attached("t1", "s2", "page", false)).await;
        let wrapper_after = registry.get_session_for_target("t1").unwrap();

        // Same wrapper object, fresh session id.
        assert!(Arc::ptr_eq(&wrapper, &wrapper_after));
        assert_eq!(wrapper.session_id(), "s2");
        assert_eq!(registry.target_count(), 1);
    }

    #[tokio::test]
    async fn test_detach_resolves_target_via_reverse_map() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", false)).await;

        // Detach event without a target id, as the browser often sends.
        registry.on_detached(detached(None, "s1")).await;
        assert!(!registry.is_target_live("t1"));
    }

    #[tokio::test]
    async fn test_waiting_for_debugger_triggers_resume() {
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", true)).await;
        settle().await;

        let calls = transport.calls();
        assert!(calls
            .iter()
            .any(|(m, s)| m == "Runtime.runIfWaitingForDebugger" && s.as_deref() == Some("s1")));
    }

    #[tokio::test]
    async fn test_auto_attach_enabled_per_session_and_failure_swallowed() {
        let transport = Arc::new(MockTransport {
            calls: Mutex::new(Vec::new()),
            fail_auto_attach: true,
        });
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        // Must not panic or surface the -32001.
        registry.on_attached(attached("t1", "s1", "iframe", false)).await;
        settle().await;

        let calls = transport.calls();
        assert!(calls
            .iter()
            .any(|(m, s)| m == "Target.setAutoAttach" && s.as_deref() == Some("s1")));
        assert!(registry.is_target_live("t1"));
    }

    #[tokio::test]
    async fn test_tab_events_only_for_page_targets() {
        let transport = MockTransport::new();
        let bus = EventBus::new();
        let mut rx = bus.watch();
        let registry = SessionRegistry::new(transport.clone(), bus);

        registry.on_attached(attached("w1", "s1", "worker", false)).await;
        registry.on_attached(attached("t1", "s2", "page", false)).await;
        registry.on_detached(detached(Some("w1"), "s1")).await;
        registry.on_detached(detached(Some("t1"), "s2")).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.kind.event_type());
        }
        assert_eq!(
            seen,
            vec![
                crate::events::EventType::TabCreated,
                crate::events::EventType::TabClosed
            ]
        );
    }

    #[tokio::test]
    async fn test_attach_detach_algebra() {
        // For any interleaving, a target is live iff its last unmatched
        // event was an attach.
        let transport = MockTransport::new();
        let registry = SessionRegistry::new(transport.clone(), EventBus::new());

        registry.on_attached(attached("t1", "s1", "page", false)).await;
        registry.on_attached(attached("t2", "s2", "page", false)).await;
        registry.on_detached(detached(Some("t1"), "s1")).await;
        registry.on_attached(attached("t1", "s3", "page", false)).await;
        registry.on_detached(detached(Some("t2"), "s2")).await;

        assert!(registry.is_target_live("t1"));
        assert!(!registry.is_target_live("t2"));

        registry.clear();
        assert_eq!(registry.target_count(), 0);
        assert!(!registry.is_target_live("t1"));
    }
}
