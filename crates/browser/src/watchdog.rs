//! Watchdog trait - independent reactive browser monitors.
//!
//! Each watchdog declares the event types it listens to, owns its private
//! bookkeeping, and is constructed with whatever shared handles it needs
//! (registry, transport, bus) - dependency injection, no ambient globals.
//!
//! Lifecycle is bound to the browser connection: constructed and attached
//! when a browser connects, detached (cancelling any background work)
//! when it disconnects.

use crate::cdp::client::CDPError;
use crate::events::{Event, EventType};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("Protocol call failed: {0}")]
    Cdp(#[from] CDPError),

    #[error("{0}")]
    Internal(String),
}

/// A stateful reactive component on the event bus.
///
/// `on_event` failures are caught and logged by the bus dispatch loop -
/// they never escape into other handlers or the caller (see the error
/// handling policy). Expected races inside a handler should be swallowed
/// with a diagnostic rather than returned.
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Event types this watchdog wants delivered.
    fn interests(&self) -> &'static [EventType];

    /// Handle one event. Called concurrently with other handlers.
    async fn on_event(&self, event: &Event) -> Result<(), WatchdogError>;

    /// Called once when the browser connection comes up, before any
    /// events are delivered.
    async fn on_attach(&self) -> Result<(), WatchdogError> {
        Ok(())
    }

    /// Called at browser disconnect. Must cancel background work and wait
    /// for in-flight handler tasks before returning; must not fail.
    async fn on_detach(&self) {}
}
