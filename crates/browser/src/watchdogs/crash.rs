//! Crash watchdog - browser health monitoring.
//!
//! State machine: Idle -> Monitoring -> Stopped. Monitoring starts on
//! browser-connected and runs a periodic loop that (a) surfaces stalled
//! network requests, (b) probes the focused session with a bounded
//! trivial evaluation, and (c) checks the OS process handle.
//!
//! The probe result is deliberately only a log line: the registry's own
//! detach notification is the authoritative crash signal and will evict
//! the target. Making the probe authoritative would cause false
//! evictions during ordinary slow-page conditions.

use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cdp::client::Transport;
use crate::cdp::protocol::TargetId;
use crate::events::{BrowserEvent, Event, EventBus, EventType};
use crate::registry::SessionRegistry;
use crate::session::AgentFocus;
use crate::watchdog::{Watchdog, WatchdogError};

const PHASE_IDLE: u8 = 0;
const PHASE_MONITORING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

/// Bound on the liveness probe round-trip.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CrashWatchdogConfig {
    /// Age after which an in-flight request is surfaced as stalled.
    pub network_stall_timeout: Duration,
    /// Tick interval of the monitoring loop.
    pub check_interval: Duration,
    /// First delay before monitoring starts, to let the browser settle.
    pub startup_delay: Duration,
    /// OS process to watch, if the browser is locally owned.
    pub browser_pid: Option<u32>,
}

impl Default for CrashWatchdogConfig {
    fn default() -> Self {
        Self {
            network_stall_timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(5),
            startup_delay: Duration::from_secs(10),
            browser_pid: None,
        }
    }
}

/// One in-flight network request.
#[derive(Clone, Debug)]
struct RequestTracker {
    url: String,
    method: String,
    started: Instant,
}

pub struct CrashWatchdog {
    config: CrashWatchdogConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    focus: AgentFocus,

    /// In-flight requests. Mutated only at well-defined checkpoints:
    /// enqueue on request-sent, dequeue on finished/failed/stall-emit.
    in_flight: Arc<AsyncMutex<HashMap<String, RequestTracker>>>,

    /// Running monitor loop, if any.
    monitor: AsyncMutex<Option<(CancellationToken, JoinHandle<()>)>>,

    /// Targets that already have crash/network tracking. Idempotent by
    /// target id; entries removed on tab-closed to bound growth.
    tracked_targets: Mutex<HashSet<TargetId>>,

    /// In-flight protocol event handler tasks, drained at teardown.
    handler_tasks: TaskTracker,

    phase: Arc<AtomicU8>,
}

impl CrashWatchdog {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        focus: AgentFocus,
        config: CrashWatchdogConfig,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
            bus,
            focus,
            in_flight: Arc::new(AsyncMutex::new(HashMap::new())),
            monitor: AsyncMutex::new(None),
            tracked_targets: Mutex::new(HashSet::new()),
            handler_tasks: TaskTracker::new(),
            phase: Arc::new(AtomicU8::new(PHASE_IDLE)),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == PHASE_MONITORING
    }

    pub fn is_stopped(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == PHASE_STOPPED
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    pub fn tracked_target_count(&self) -> usize {
        self.tracked_targets.lock().unwrap().len()
    }

    async fn start_monitoring(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            tracing::debug!("[CrashWatchdog] Monitoring already running");
            return;
        }

        self.phase.store(PHASE_MONITORING, Ordering::SeqCst);

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let in_flight = self.in_flight.clone();
        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let focus = self.focus.clone();
        let phase = self.phase.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            // Give the browser time to start up and load its first page.
            tokio::select! {
                _ = loop_token.cancelled() => return,
                _ = tokio::time::sleep(config.startup_delay) => {}
            }

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(config.check_interval) => {}
                }

                // (a) Surface stalled requests and stop tracking them.
                // The navigation layer owns retry policy; we only report.
                let stalled: Vec<(String, RequestTracker)> = {
                    let mut requests = in_flight.lock().await;
                    let now = Instant::now();
                    let ids: Vec<String> = requests
                        .iter()
                        .filter(|(_, t)| {
                            now.duration_since(t.started) >= config.network_stall_timeout
                        })
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter()
                        .filter_map(|id| requests.remove(&id).map(|t| (id, t)))
                        .collect()
                };
                for (request_id, tracker) in stalled {
                    tracing::warn!(
                        "[CrashWatchdog] Network request stalled after {:?}: {} {}",
                        config.network_stall_timeout,
                        tracker.method,
                        tracker.url
                    );
                    bus.dispatch(BrowserEvent::BrowserError {
                        error_type: "NetworkStall".to_string(),
                        message: format!(
                            "Network request stalled after {:?}",
                            config.network_stall_timeout
                        ),
                        details: json!({
                            "requestId": request_id,
                            "url": tracker.url,
                            "method": tracker.method,
                            "elapsedSeconds": tracker.started.elapsed().as_secs_f64(),
                        }),
                    });
                }

                // (b) Liveness probe on the focused session, bounded.
                // Failure is a crash *signal*, logged only - the detach
                // notification is what actually evicts state.
                if let Some(target_id) = focus.get() {
                    if let Some(session) = registry.get_session_for_target(&target_id) {
                        match tokio::time::timeout(PROBE_TIMEOUT, session.evaluate("1+1")).await {
                            Ok(Ok(_)) => {
                                tracing::trace!(
                                    "[CrashWatchdog] Health check passed for target {}",
                                    target_id
                                );
                            }
                            Ok(Err(e)) => {
                                tracing::error!(
                                    "[CrashWatchdog] Unresponsive session for target {}: {} \
                                     (detach event will evict it if it is really gone)",
                                    target_id,
                                    e
                                );
                            }
                            Err(_) => {
                                tracing::error!(
                                    "[CrashWatchdog] Health probe timed out for target {} \
                                     (detach event will evict it if it is really gone)",
                                    target_id
                                );
                            }
                        }
                    }
                }

                // (c) OS process check. A dead process is fatal.
                if let Some(pid) = config.browser_pid {
                    if process_is_dead(pid) {
                        tracing::error!("[CrashWatchdog] Browser process {} is dead", pid);
                        bus.dispatch(BrowserEvent::BrowserError {
                            error_type: "BrowserProcessCrashed".to_string(),
                            message: format!("Browser process {pid} has crashed"),
                            details: json!({ "pid": pid }),
                        });
                        phase.store(PHASE_STOPPED, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });

        *monitor = Some((token, handle));
    }

    /// Cancel the loop and wait for the current iteration plus any
    /// in-flight event handler tasks before declaring teardown done.
    async fn shutdown(&self) {
        if let Some((token, handle)) = self.monitor.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }

        self.handler_tasks.close();
        self.handler_tasks.wait().await;

        self.in_flight.lock().await.clear();
        self.tracked_targets.lock().unwrap().clear();
        self.phase.store(PHASE_STOPPED, Ordering::SeqCst);
        tracing::debug!("[CrashWatchdog] Monitoring stopped");
    }

    /// Set up crash tracking for one target. Idempotent by target id.
    async fn track_target(&self, target_id: &str) {
        {
            let mut tracked = self.tracked_targets.lock().unwrap();
            if !tracked.insert(target_id.to_string()) {
                tracing::debug!(
                    "[CrashWatchdog] Target {} already tracked",
                    target_id
                );
                return;
            }
        }

        // Network events for this target flow to the root subscriptions
        // once the domain is enabled on its session.
        let Some(session) = self.registry.get_session_for_target(target_id) else {
            tracing::debug!(
                "[CrashWatchdog] No session for new target {}, skipping enable",
                target_id
            );
            return;
        };
        if let Err(e) = session.send("Network.enable", None).await {
            tracing::warn!(
                "[CrashWatchdog] Failed to enable Network on target {}: {}",
                target_id,
                e
            );
        }
    }
}

#[async_trait]
impl Watchdog for CrashWatchdog {
    fn name(&self) -> &'static str {
        "CrashWatchdog"
    }

    fn interests(&self) -> &'static [EventType] {
        &[
            EventType::BrowserConnected,
            EventType::BrowserStopped,
            EventType::TabCreated,
            EventType::TabClosed,
        ]
    }

    async fn on_event(&self, event: &Event) -> Result<(), WatchdogError> {
        match &event.kind {
            BrowserEvent::BrowserConnected { .. } => {
                tracing::debug!("[CrashWatchdog] Browser connected, beginning monitoring");
                self.start_monitoring().await;
            }
            BrowserEvent::BrowserStopped => {
                tracing::debug!("[CrashWatchdog] Browser stopped, ending monitoring");
                self.shutdown().await;
            }
            BrowserEvent::TabCreated { target_id, .. } => {
                self.track_target(target_id).await;
            }
            BrowserEvent::TabClosed { target_id } => {
                if self.tracked_targets.lock().unwrap().remove(target_id) {
                    tracing::debug!(
                        "[CrashWatchdog] Removed target {} from monitoring",
                        target_id
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_attach(&self) -> Result<(), WatchdogError> {
        // Crash notifications. The detecting session resolves back to a
        // target through the registry's reverse map.
        {
            let bus = self.bus.clone();
            let registry = self.registry.clone();
            self.transport.on_event(
                "Inspector.targetCrashed",
                Arc::new(move |event| {
                    let target_id = event
                        .session_id
                        .as_deref()
                        .and_then(|s| registry.target_for_session(s));
                    tracing::warn!("[CrashWatchdog] Target crashed: {:?}", target_id);
                    bus.dispatch(BrowserEvent::BrowserError {
                        error_type: "TargetCrash".to_string(),
                        message: "Target crashed".to_string(),
                        details: json!({
                            "targetId": target_id,
                            "sessionId": event.session_id,
                        }),
                    });
                }),
            );
        }

        // Request lifecycle tracking. Handlers suspend, so each runs as a
        // tracked task; the map mutates only at these checkpoints.
        {
            let in_flight = self.in_flight.clone();
            let tasks = self.handler_tasks.clone();
            self.transport.on_event(
                "Network.requestWillBeSent",
                Arc::new(move |event| {
                    let Some(params) = event.params else { return };
                    let in_flight = in_flight.clone();
                    tasks.spawn(async move {
                        let request_id = params["requestId"].as_str().unwrap_or("").to_string();
                        if request_id.is_empty() {
                            return;
                        }
                        let tracker = RequestTracker {
                            url: params["request"]["url"].as_str().unwrap_or("").to_string(),
                            method: params["request"]["method"]
                                .as_str()
                                .unwrap_or("GET")
                                .to_string(),
                            started: Instant::now(),
                        };
                        in_flight.lock().await.insert(request_id, tracker);
                    });
                }),
            );
        }

        {
            let in_flight = self.in_flight.clone();
            let tasks = self.handler_tasks.clone();
            self.transport.on_event(
                "Network.loadingFinished",
                Arc::new(move |event| {
                    let Some(params) = event.params else { return };
                    let in_flight = in_flight.clone();
                    tasks.spawn(async move {
                        let request_id = params["requestId"].as_str().unwrap_or("");
                        if let Some(tracker) = in_flight.lock().await.remove(request_id) {
                            tracing::debug!(
                                "[CrashWatchdog] Request completed in {:?}: {}",
                                tracker.started.elapsed(),
                                tracker.url
                            );
                        }
                    });
                }),
            );
        }

        {
            let in_flight = self.in_flight.clone();
            let tasks = self.handler_tasks.clone();
            self.transport.on_event(
                "Network.loadingFailed",
                Arc::new(move |event| {
                    let Some(params) = event.params else { return };
                    let in_flight = in_flight.clone();
                    tasks.spawn(async move {
                        let request_id = params["requestId"].as_str().unwrap_or("");
                        if let Some(tracker) = in_flight.lock().await.remove(request_id) {
                            tracing::debug!(
                                "[CrashWatchdog] Request failed after {:?}: {}",
                                tracker.started.elapsed(),
                                tracker.url
                            );
                        }
                    });
                }),
            );
        }

        tracing::debug!("[CrashWatchdog] Attached to protocol events");
        Ok(())
    }

    async fn on_detach(&self) {
        self.shutdown().await;
    }
}

/// Cross-platform process liveness check.
fn process_is_dead(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) => matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;
    use serde_json::json;

    fn watchdog_with(
        transport: Arc<RecordingTransport>,
        config: CrashWatchdogConfig,
    ) -> (Arc<CrashWatchdog>, EventBus, Arc<SessionRegistry>) {
        let bus = EventBus::new();
        let registry = SessionRegistry::new(transport.clone(), bus.clone());
        let focus = AgentFocus::default();
        let watchdog = Arc::new(CrashWatchdog::new(
            transport,
            registry.clone(),
            bus.clone(),
            focus,
            config,
        ));
        (watchdog, bus, registry)
    }

    fn event(kind: BrowserEvent) -> Event {
        Event {
            at: std::time::SystemTime::now(),
            kind,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_request_checkpoints() {
        let transport = RecordingTransport::new();
        let (watchdog, _bus, _registry) =
            watchdog_with(transport.clone(), CrashWatchdogConfig::default());
        watchdog.on_attach().await.unwrap();

        transport.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "req-1",
                "request": { "url": "https://example.com/a", "method": "GET" }
            }),
            Some("s1"),
        );
        settle().await;
        assert_eq!(watchdog.in_flight_count().await, 1);

        transport.emit(
            "Network.loadingFinished",
            json!({ "requestId": "req-1" }),
            Some("s1"),
        );
        settle().await;
        assert_eq!(watchdog.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_stall_is_surfaced_and_dropped() {
        let transport = RecordingTransport::new();
        let config = CrashWatchdogConfig {
            network_stall_timeout: Duration::from_millis(50),
            check_interval: Duration::from_millis(25),
            startup_delay: Duration::from_millis(1),
            browser_pid: None,
        };
        let (watchdog, bus, _registry) = watchdog_with(transport.clone(), config);
        watchdog.on_attach().await.unwrap();
        let mut rx = bus.watch();

        watchdog
            .on_event(&event(BrowserEvent::BrowserConnected {
                cdp_url: "ws://x".into(),
            }))
            .await
            .unwrap();

        transport.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "slow-1",
                "request": { "url": "https://slow.example/", "method": "POST" }
            }),
            Some("s1"),
        );

        // Wait for the stall to be detected.
        let mut saw_stall = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            while let Ok(e) = rx.try_recv() {
                if let BrowserEvent::BrowserError { error_type, .. } = &e.kind {
                    if error_type == "NetworkStall" {
                        saw_stall = true;
                    }
                }
            }
            if saw_stall {
                break;
            }
        }
        assert!(saw_stall, "stalled request was not surfaced");
        // Surfaced once, then dropped from tracking.
        assert_eq!(watchdog.in_flight_count().await, 0);

        watchdog.on_detach().await;
        assert!(watchdog.is_stopped());
    }

    #[tokio::test]
    async fn test_tracked_targets_idempotent() {
        let transport = RecordingTransport::new();
        let (watchdog, _bus, registry) =
            watchdog_with(transport.clone(), CrashWatchdogConfig::default());

        // Make target t1 known so Network.enable can be issued.
        registry
            .on_attached(crate::cdp::protocol::AttachedToTargetEvent {
                session_id: "s1".into(),
                target_info: crate::cdp::protocol::TargetInfo {
                    target_id: "t1".into(),
                    target_type: "page".into(),
                    title: String::new(),
                    url: "about:blank".into(),
                    attached: true,
                },
                waiting_for_debugger: false,
            })
            .await;

        // Three rapid creates for the same target, then one close.
        for _ in 0..3 {
            watchdog
                .on_event(&event(BrowserEvent::TabCreated {
                    target_id: "t1".into(),
                    url: "about:blank".into(),
                }))
                .await
                .unwrap();
        }
        assert_eq!(watchdog.tracked_target_count(), 1);
        assert_eq!(transport.call_count("Network.enable"), 1);

        watchdog
            .on_event(&event(BrowserEvent::TabClosed {
                target_id: "t1".into(),
            }))
            .await
            .unwrap();
        assert_eq!(watchdog.tracked_target_count(), 0);
    }

    #[tokio::test]
    async fn test_target_crash_emits_browser_error() {
        let transport = RecordingTransport::new();
        let (watchdog, bus, registry) =
            watchdog_with(transport.clone(), CrashWatchdogConfig::default());
        watchdog.on_attach().await.unwrap();
        let mut rx = bus.watch();

        registry
            .on_attached(crate::cdp::protocol::AttachedToTargetEvent {
                session_id: "s9".into(),
                target_info: crate::cdp::protocol::TargetInfo {
                    target_id: "t9".into(),
                    target_type: "page".into(),
                    title: String::new(),
                    url: "https://example.com".into(),
                    attached: true,
                },
                waiting_for_debugger: false,
            })
            .await;
        // Drain the TabCreated event.
        let _ = rx.try_recv();

        transport.emit("Inspector.targetCrashed", json!({}), Some("s9"));
        settle().await;

        let crash = rx.try_recv().expect("crash error dispatched");
        match &crash.kind {
            BrowserEvent::BrowserError {
                error_type,
                details,
                ..
            } => {
                assert_eq!(error_type, "TargetCrash");
                assert_eq!(details["targetId"], "t9");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_clears_state_and_waits() {
        let transport = RecordingTransport::new();
        let config = CrashWatchdogConfig {
            startup_delay: Duration::from_millis(1),
            check_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let (watchdog, _bus, _registry) = watchdog_with(transport.clone(), config);
        watchdog.on_attach().await.unwrap();

        watchdog
            .on_event(&event(BrowserEvent::BrowserConnected {
                cdp_url: "ws://x".into(),
            }))
            .await
            .unwrap();
        assert!(watchdog.is_monitoring());

        transport.emit(
            "Network.requestWillBeSent",
            json!({
                "requestId": "r",
                "request": { "url": "https://example.com", "method": "GET" }
            }),
            Some("s1"),
        );

        watchdog
            .on_event(&event(BrowserEvent::BrowserStopped))
            .await
            .unwrap();

        assert!(watchdog.is_stopped());
        assert_eq!(watchdog.in_flight_count().await, 0);
        assert_eq!(watchdog.tracked_target_count(), 0);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(!process_is_dead(std::process::id()));
    }
}
