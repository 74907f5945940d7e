//! Popup watchdog - automatic JavaScript dialog resolution.
//!
//! An unhandled alert/confirm/prompt freezes every command on its target,
//! so dialogs are resolved the instant they open: accept for alert,
//! confirm and beforeunload (keeps automation moving), dismiss for prompt
//! (no mechanism exists to supply typed input).
//!
//! Resolution is attempted on the session that detected the dialog first
//! and falls back to the currently-focused session; both attempts are
//! sub-second bounded and a double failure is logged, never raised.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cdp::client::{send_with_timeout, Transport};
use crate::cdp::protocol::TargetId;
use crate::events::{BrowserEvent, Event, EventBus, EventType};
use crate::registry::SessionRegistry;
use crate::session::AgentFocus;
use crate::watchdog::{Watchdog, WatchdogError};

/// Bound on each dialog-resolution attempt.
const DIALOG_TIMEOUT: Duration = Duration::from_millis(500);

pub struct PopupsWatchdog {
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    focus: AgentFocus,

    /// Targets that already have the Page domain enabled. Idempotent by
    /// target id; entries removed on tab-closed.
    pages_enabled: Mutex<HashSet<TargetId>>,
}

impl PopupsWatchdog {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        _bus: EventBus,
        focus: AgentFocus,
    ) -> Self {
        Self {
            transport,
            registry,
            focus,
            pages_enabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn enabled_target_count(&self) -> usize {
        self.pages_enabled.lock().unwrap().len()
    }

    /// Pick the action for a dialog type.
    fn should_accept(dialog_type: &str) -> bool {
        matches!(dialog_type, "alert" | "confirm" | "beforeunload")
    }

    /// Resolve one dialog: detecting session first, focused session as
    /// fallback. Never fails - a stuck dialog must not take the watchdog
    /// loop down with it.
    async fn handle_dialog(
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        focus: AgentFocus,
        params: Value,
        detecting_session: Option<String>,
    ) {
        let dialog_type = params["type"].as_str().unwrap_or("alert").to_string();
        let message = params["message"].as_str().unwrap_or("").to_string();
        let accept = Self::should_accept(&dialog_type);

        tracing::info!(
            "[PopupsWatchdog] JavaScript {} dialog: '{}' - {}",
            dialog_type,
            message.chars().take(100).collect::<String>(),
            if accept { "accepting" } else { "dismissing" }
        );

        let handle_params = json!({ "accept": accept });

        // Attempt 1: the session that detected the dialog.
        if let Some(session_id) = detecting_session.as_deref() {
            match send_with_timeout(
                transport.as_ref(),
                "Page.handleJavaScriptDialog",
                Some(handle_params.clone()),
                Some(session_id),
                DIALOG_TIMEOUT,
            )
            .await
            {
                Ok(_) => {
                    tracing::debug!("[PopupsWatchdog] Dialog handled via detecting session");
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        "[PopupsWatchdog] Detecting-session attempt failed: {}",
                        e
                    );
                }
            }
        }

        // Attempt 2: the currently-focused session.
        let focused_session = focus
            .get()
            .and_then(|target_id| registry.get_session_for_target(&target_id))
            .map(|session| session.session_id());

        if let Some(session_id) = focused_session {
            if detecting_session.as_deref() != Some(session_id.as_str()) {
                match send_with_timeout(
                    transport.as_ref(),
                    "Page.handleJavaScriptDialog",
                    Some(handle_params),
                    Some(&session_id),
                    DIALOG_TIMEOUT,
                )
                .await
                {
                    Ok(_) => {
                        tracing::debug!("[PopupsWatchdog] Dialog handled via focused session");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(
                            "[PopupsWatchdog] Focused-session attempt failed: {}",
                            e
                        );
                    }
                }
            }
        }

        tracing::warn!(
            "[PopupsWatchdog] Could not resolve {} dialog ('{}')",
            dialog_type,
            message.chars().take(50).collect::<String>()
        );
    }

    /// Enable the Page domain on a target's session, once per target.
    async fn enable_dialogs_for(&self, target_id: &str) {
        {
            let mut enabled = self.pages_enabled.lock().unwrap();
            if !enabled.insert(target_id.to_string()) {
                tracing::debug!(
                    "[PopupsWatchdog] Dialog handling already set up for target {}",
                    target_id
                );
                return;
            }
        }

        let Some(session) = self.registry.get_session_for_target(target_id) else {
            tracing::debug!(
                "[PopupsWatchdog] No session for target {}, skipping Page.enable",
                target_id
            );
            return;
        };

        if let Err(e) = session.send("Page.enable", None).await {
            tracing::warn!(
                "[PopupsWatchdog] Failed to enable Page domain on target {}: {}",
                target_id,
                e
            );
        }
    }
}

#[async_trait]
impl Watchdog for PopupsWatchdog {
    fn name(&self) -> &'static str {
        "PopupsWatchdog"
    }

    fn interests(&self) -> &'static [EventType] {
        &[EventType::TabCreated, EventType::TabClosed]
    }

    async fn on_event(&self, event: &Event) -> Result<(), WatchdogError> {
        match &event.kind {
            BrowserEvent::TabCreated { target_id, .. } => {
                self.enable_dialogs_for(target_id).await;
            }
            BrowserEvent::TabClosed { target_id } => {
                self.pages_enabled.lock().unwrap().remove(target_id);
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_attach(&self) -> Result<(), WatchdogError> {
        // Enable Page on the root connection too, to catch dialogs
        // bubbling from frames not individually tracked.
        if let Err(e) = self.transport.send("Page.enable", None, None).await {
            tracing::debug!(
                "[PopupsWatchdog] Page.enable on root connection failed: {}",
                e
            );
        }

        // One root-level subscription serves every session; dialogs carry
        // the detecting session id.
        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let focus = self.focus.clone();
        self.transport.on_event(
            "Page.javascriptDialogOpening",
            Arc::new(move |event| {
                let Some(params) = event.params else { return };
                let transport = transport.clone();
                let registry = registry.clone();
                let focus = focus.clone();
                let session_id = event.session_id.clone();
                tokio::spawn(async move {
                    Self::handle_dialog(transport, registry, focus, params, session_id).await;
                });
            }),
        );

        tracing::debug!("[PopupsWatchdog] Attached");
        Ok(())
    }
}
