//! Browser session - the high-level API the agent layer consumes.
//!
//! Wires the transport, registry, event bus and the three built-in
//! watchdogs together. Everything is dependency-injected at construction
//! or start time; there are no ambient globals.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::cdp::client::{CDPClient, CDPError, Transport};
use crate::cdp::protocol::TargetId;
use crate::cdp::session::CDPSession;
use crate::events::{BrowserEvent, EventBus, SubscriberId};
use crate::registry::SessionRegistry;
use crate::watchdog::Watchdog;
use crate::watchdogs::{
    CrashWatchdog, CrashWatchdogConfig, PopupsWatchdog, SecurityPolicy, SecurityWatchdog,
};
use webpilot_dom::{CdpDriver, DomService, DomSnapshot};

/// Which target the agent is currently acting on. Shared with the
/// watchdogs so dialog fallback and the liveness probe know where to go.
#[derive(Clone, Default)]
pub struct AgentFocus {
    inner: Arc<RwLock<Option<TargetId>>>,
}

impl AgentFocus {
    pub fn get(&self) -> Option<TargetId> {
        self.inner.read().unwrap().clone()
    }

    pub fn set(&self, target_id: Option<TargetId>) {
        *self.inner.write().unwrap() = target_id;
    }
}

/// Plain-data configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    pub cdp_url: String,
    pub allowed_domains: Vec<String>,
    pub prohibited_domains: Vec<String>,
    pub block_ip_addresses: bool,
    pub network_stall_timeout_secs: f64,
    pub health_check_interval_secs: f64,
    pub browser_pid: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            cdp_url: "ws://localhost:9222".to_string(),
            allowed_domains: Vec::new(),
            prohibited_domains: Vec::new(),
            block_ip_addresses: false,
            network_stall_timeout_secs: 10.0,
            health_check_interval_secs: 5.0,
            browser_pid: None,
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Browser session - manages the connection, the registry and the
/// watchdog set for one browser.
pub struct BrowserSession {
    pub config: SessionConfig,
    event_bus: EventBus,
    policy: Arc<SecurityPolicy>,
    focus: AgentFocus,

    client: AsyncRwLock<Option<Arc<CDPClient>>>,
    registry: AsyncRwLock<Option<Arc<SessionRegistry>>>,
    watchdogs: AsyncMutex<Vec<(SubscriberId, Arc<dyn Watchdog>)>>,
}

impl BrowserSession {
    pub fn new(config: SessionConfig) -> Self {
        let policy = Arc::new(SecurityPolicy::new(
            config.allowed_domains.clone(),
            config.prohibited_domains.clone(),
            config.block_ip_addresses,
        ));
        Self {
            config,
            event_bus: EventBus::new(),
            policy,
            focus: AgentFocus::default(),
            client: AsyncRwLock::new(None),
            registry: AsyncRwLock::new(None),
            watchdogs: AsyncMutex::new(Vec::new()),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn focus(&self) -> &AgentFocus {
        &self.focus
    }

    /// Connect to the browser, install the registry and start the
    /// built-in watchdogs.
    pub async fn start(&self) -> Result<(), BoxError> {
        let client = CDPClient::connect(&self.config.cdp_url).await?;
        let transport: Arc<dyn Transport> = client.clone();

        let registry = SessionRegistry::new(transport.clone(), self.event_bus.clone());
        registry.install(transport.as_ref());

        *self.client.write().await = Some(client.clone());
        *self.registry.write().await = Some(registry.clone());

        let crash: Arc<dyn Watchdog> = Arc::new(CrashWatchdog::new(
            transport.clone(),
            registry.clone(),
            self.event_bus.clone(),
            self.focus.clone(),
            CrashWatchdogConfig {
                network_stall_timeout: Duration::from_secs_f64(
                    self.config.network_stall_timeout_secs,
                ),
                check_interval: Duration::from_secs_f64(self.config.health_check_interval_secs),
                browser_pid: self.config.browser_pid,
                ..Default::default()
            },
        ));
        let popups: Arc<dyn Watchdog> = Arc::new(PopupsWatchdog::new(
            transport.clone(),
            registry.clone(),
            self.event_bus.clone(),
            self.focus.clone(),
        ));
        let security: Arc<dyn Watchdog> = Arc::new(SecurityWatchdog::new(
            self.policy.clone(),
            transport.clone(),
            registry.clone(),
            self.event_bus.clone(),
        ));

        let mut watchdogs = self.watchdogs.lock().await;
        for watchdog in [crash, popups, security] {
            watchdog.on_attach().await?;
            let id = self.event_bus.register(watchdog.clone());
            watchdogs.push((id, watchdog));
        }
        drop(watchdogs);

        // Root-level auto-attach comes after the watchdogs are listening:
        // every existing and future target produces an attach
        // notification, paused until the registry resumes it.
        client
            .send_request(
                "Target.setAutoAttach",
                Some(json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": true,
                    "flatten": true,
                })),
                None,
            )
            .await?;

        self.event_bus.dispatch(BrowserEvent::BrowserConnected {
            cdp_url: self.config.cdp_url.clone(),
        });

        Ok(())
    }

    /// Tear everything down: watchdogs first (awaiting their background
    /// work), then the registry, then the transport.
    pub async fn stop(&self) -> Result<(), BoxError> {
        self.event_bus.dispatch(BrowserEvent::BrowserStopped);

        let watchdogs = std::mem::take(&mut *self.watchdogs.lock().await);
        for (id, watchdog) in watchdogs {
            watchdog.on_detach().await;
            self.event_bus.unregister(id);
        }

        if let Some(registry) = self.registry.write().await.take() {
            registry.clear();
        }
        self.focus.set(None);

        if let Some(client) = self.client.write().await.take() {
            client.close().await?;
        }

        Ok(())
    }

    /// Create a new tab and focus it. The registry learns about the
    /// target through the attach notification; we wait (bounded) for
    /// that to land rather than bookkeeping manually.
    pub async fn new_tab(&self, url: Option<String>) -> Result<TargetId, BoxError> {
        let url = url.unwrap_or_else(|| "about:blank".to_string());

        if !self.policy.is_url_allowed(&url) {
            return Err(Box::new(CDPError::NavigationBlocked(url)));
        }

        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or("Not connected")?;

        let result = client
            .send_request("Target.createTarget", Some(json!({ "url": url })), None)
            .await?;
        let target_id: TargetId = result["targetId"]
            .as_str()
            .ok_or("Invalid targetId in Target.createTarget result")?
            .to_string();

        let registry = self.registry.read().await.clone().ok_or("Not connected")?;
        for _ in 0..20 {
            if registry.get_session_for_target(&target_id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        self.focus.set(Some(target_id.clone()));
        Ok(target_id)
    }

    /// Move agent focus to an already-live target.
    pub async fn switch_tab(&self, target_id: TargetId) -> Result<(), BoxError> {
        let registry = self.registry.read().await.clone().ok_or("Not connected")?;
        if !registry.is_target_live(&target_id) {
            return Err("Target not found".into());
        }
        self.focus.set(Some(target_id));
        Ok(())
    }

    /// Ask the browser to close a tab. Registry state is NOT touched
    /// here - the detach notification is the single source of truth.
    pub async fn close_tab(&self, target_id: &str) -> Result<(), BoxError> {
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or("Not connected")?;
        client
            .send_request(
                "Target.closeTarget",
                Some(json!({ "targetId": target_id })),
                None,
            )
            .await?;

        if self.focus.get().as_deref() == Some(target_id) {
            self.focus.set(None);
        }
        Ok(())
    }

    /// The session the agent is currently focused on.
    pub async fn current_session(&self) -> Option<Arc<CDPSession>> {
        let target_id = self.focus.get()?;
        let registry = self.registry.read().await.clone()?;
        registry.get_session_for_target(&target_id)
    }

    /// Resolve a target to its live session, if any.
    pub async fn get_session_for_target(&self, target_id: &str) -> Option<Arc<CDPSession>> {
        let registry = self.registry.read().await.clone()?;
        registry.get_session_for_target(target_id)
    }

    /// True iff the target currently has at least one session.
    pub async fn is_target_live(&self, target_id: &str) -> bool {
        match self.registry.read().await.clone() {
            Some(registry) => registry.is_target_live(target_id),
            None => false,
        }
    }

    /// Navigate the focused tab, gated by the security policy.
    pub async fn navigate(&self, url: impl Into<String>) -> Result<(), BoxError> {
        let url = url.into();

        if !self.policy.is_url_allowed(&url) {
            tracing::warn!("[BrowserSession] Blocking navigation to disallowed URL: {}", url);
            self.event_bus.dispatch(BrowserEvent::BrowserError {
                error_type: "NavigationBlocked".to_string(),
                message: format!("Navigation blocked to disallowed URL: {url}"),
                details: json!({ "url": url }),
            });
            return Err(Box::new(CDPError::NavigationBlocked(url)));
        }

        let session = self.current_session().await.ok_or("No active session")?;
        let target_id = session.target_id.clone();

        self.event_bus.dispatch(BrowserEvent::NavigationStarted {
            target_id: target_id.clone(),
            url: url.clone(),
        });

        session.navigate(&url).await?;

        self.event_bus.dispatch(BrowserEvent::NavigationComplete {
            target_id,
            url,
        });

        Ok(())
    }

    /// Extract the DOM tree and interactive index for a page, spanning
    /// cross-origin frames through their own sessions.
    pub async fn extract_dom_tree(&self, target_id: &str) -> Result<DomSnapshot, BoxError> {
        let registry = self.registry.read().await.clone().ok_or("Not connected")?;
        let client = self
            .client
            .read()
            .await
            .clone()
            .ok_or("Not connected")?;

        let driver = RegistryDriver {
            registry,
            transport: client,
        };
        let service = DomService::new(driver);
        Ok(service.extract(target_id).await?)
    }
}

/// `CdpDriver` implementation backed by the live registry: sessions are
/// reused when the registry tracks the target and attached on demand for
/// frame targets whose auto-attach notification has not landed yet.
pub(crate) struct RegistryDriver {
    pub registry: Arc<SessionRegistry>,
    pub transport: Arc<dyn Transport>,
}

#[async_trait::async_trait]
impl CdpDriver for RegistryDriver {
    async fn send(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        session_id: Option<&str>,
    ) -> webpilot_dom::Result<serde_json::Value> {
        self.transport
            .send(method, params, session_id)
            .await
            .map_err(|e| webpilot_dom::DomError::Protocol(e.to_string()))
    }

    async fn session_for_target(&self, target_id: &str) -> Option<String> {
        if let Some(session) = self.registry.get_session_for_target(target_id) {
            return Some(session.session_id());
        }

        // Frame targets may not be auto-attached yet; attach directly.
        // The resulting notification keeps the registry consistent.
        let result = self
            .transport
            .send(
                "Target.attachToTarget",
                Some(json!({ "targetId": target_id, "flatten": true })),
                None,
            )
            .await
            .ok()?;
        result["sessionId"].as_str().map(String::from)
    }
}
