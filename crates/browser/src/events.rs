//! Event bus - typed publish/subscribe for browser lifecycle events.
//!
//! Design: enum events, no trait-object payloads. Dispatch fans out to
//! every watchdog that declared interest, each handler in its own task so
//! one failure can never stall or cancel the others. A broadcast channel
//! carries the same stream to passive external subscribers.

use crate::watchdog::Watchdog;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::sync::broadcast;

use crate::cdp::protocol::TargetId;

/// What happened. Produced by registry activity and by watchdogs;
/// consumed by watchdogs and by the surrounding product.
#[derive(Debug, Clone)]
pub enum BrowserEvent {
    BrowserConnected {
        cdp_url: String,
    },
    BrowserStopped,
    TabCreated {
        target_id: TargetId,
        url: String,
    },
    TabClosed {
        target_id: TargetId,
    },
    NavigationStarted {
        target_id: TargetId,
        url: String,
    },
    NavigationComplete {
        target_id: TargetId,
        url: String,
    },
    BrowserError {
        error_type: String,
        message: String,
        details: Value,
    },
}

impl BrowserEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            BrowserEvent::BrowserConnected { .. } => EventType::BrowserConnected,
            BrowserEvent::BrowserStopped => EventType::BrowserStopped,
            BrowserEvent::TabCreated { .. } => EventType::TabCreated,
            BrowserEvent::TabClosed { .. } => EventType::TabClosed,
            BrowserEvent::NavigationStarted { .. } => EventType::NavigationStarted,
            BrowserEvent::NavigationComplete { .. } => EventType::NavigationComplete,
            BrowserEvent::BrowserError { .. } => EventType::BrowserError,
        }
    }
}

/// Discriminant used for declared interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    BrowserConnected,
    BrowserStopped,
    TabCreated,
    TabClosed,
    NavigationStarted,
    NavigationComplete,
    BrowserError,
}

/// An immutable, timestamped record of one event. Never mutated after
/// dispatch; carries no back-reference into the registry.
#[derive(Debug, Clone)]
pub struct Event {
    pub at: SystemTime,
    pub kind: BrowserEvent,
}

/// Handle returned by `register`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

struct Registration {
    id: u64,
    watchdog: Arc<dyn Watchdog>,
}

struct BusInner {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
    broadcast: broadcast::Sender<Arc<Event>>,
}

/// Per-browser-connection event dispatcher.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                registrations: RwLock::new(Vec::new()),
                broadcast: tx,
            }),
        }
    }

    /// Register a watchdog. It will receive every event whose type is in
    /// its declared interests.
    pub fn register(&self, watchdog: Arc<dyn Watchdog>) -> SubscriberId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("[EventBus] Registered watchdog: {}", watchdog.name());
        self.inner
            .registrations
            .write()
            .unwrap()
            .push(Registration { id, watchdog });
        SubscriberId(id)
    }

    pub fn unregister(&self, id: SubscriberId) {
        self.inner
            .registrations
            .write()
            .unwrap()
            .retain(|r| r.id != id.0);
    }

    /// Deliver an event to every interested watchdog, each handler as an
    /// independent unit of concurrent work. A handler failure is caught
    /// and logged; it does not prevent delivery to others.
    pub fn dispatch(&self, kind: BrowserEvent) {
        let event = Arc::new(Event {
            at: SystemTime::now(),
            kind,
        });

        let interested: Vec<Arc<dyn Watchdog>> = {
            let registrations = self.inner.registrations.read().unwrap();
            registrations
                .iter()
                .filter(|r| r.watchdog.interests().contains(&event.kind.event_type()))
                .map(|r| r.watchdog.clone())
                .collect()
        };

        for watchdog in interested {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = watchdog.on_event(&event).await {
                    tracing::warn!(
                        "[EventBus] {} failed handling {:?}: {}",
                        watchdog.name(),
                        event.kind.event_type(),
                        e
                    );
                }
            });
        }

        // Passive subscribers; ignore error if none are listening.
        let _ = self.inner.broadcast.send(event);
    }

    /// Passive event stream for external consumers.
    pub fn watch(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.broadcast.subscribe()
    }

    /// Number of registered watchdogs.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registrations.read().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::WatchdogError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingWatchdog {
        interests: &'static [EventType],
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Watchdog for CountingWatchdog {
        fn name(&self) -> &'static str {
            "CountingWatchdog"
        }

        fn interests(&self) -> &'static [EventType] {
            self.interests
        }

        async fn on_event(&self, _event: &Event) -> Result<(), WatchdogError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(WatchdogError::Internal("boom".into()));
            }
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_dispatch_filters_by_interest() {
        let bus = EventBus::new();
        let tab_count = Arc::new(AtomicUsize::new(0));
        let nav_count = Arc::new(AtomicUsize::new(0));

        bus.register(Arc::new(CountingWatchdog {
            interests: &[EventType::TabCreated],
            count: tab_count.clone(),
            fail: false,
        }));
        bus.register(Arc::new(CountingWatchdog {
            interests: &[EventType::NavigationStarted],
            count: nav_count.clone(),
            fail: false,
        }));

        bus.dispatch(BrowserEvent::TabCreated {
            target_id: "t1".into(),
            url: "about:blank".into(),
        });
        settle().await;

        assert_eq!(tab_count.load(Ordering::SeqCst), 1);
        assert_eq!(nav_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let bus = EventBus::new();
        let failing = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));

        bus.register(Arc::new(CountingWatchdog {
            interests: &[EventType::BrowserStopped],
            count: failing.clone(),
            fail: true,
        }));
        bus.register(Arc::new(CountingWatchdog {
            interests: &[EventType::BrowserStopped],
            count: healthy.clone(),
            fail: false,
        }));

        bus.dispatch(BrowserEvent::BrowserStopped);
        settle().await;

        assert_eq!(failing.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = bus.register(Arc::new(CountingWatchdog {
            interests: &[EventType::TabClosed],
            count: count.clone(),
            fail: false,
        }));
        bus.unregister(id);

        bus.dispatch(BrowserEvent::TabClosed {
            target_id: "t1".into(),
        });
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_external_watch_stream() {
        let bus = EventBus::new();
        let mut rx = bus.watch();

        bus.dispatch(BrowserEvent::BrowserConnected {
            cdp_url: "ws://localhost:9222".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind.event_type(), EventType::BrowserConnected);
    }
}
