//! Browser control engine over the Chrome DevTools Protocol.
//!
//! Gives an agent layer a stable view of "what is on the page and where"
//! plus a way to act on it, while the browser process creates, destroys,
//! crashes and reattaches targets asynchronously and out of the caller's
//! control.
//!
//! # Architecture
//!
//! 1. **Transport** (`cdp`): one WebSocket, request/response matching by
//!    id, events fanned out to subscribers. Everything above depends on
//!    the `Transport` trait, not the concrete client.
//! 2. **Registry** (`registry`): the single source of truth for
//!    session/target lifecycle, driven purely by attach/detach
//!    notifications.
//! 3. **Event bus + watchdogs** (`events`, `watchdog`, `watchdogs`):
//!    independent reactive components - crash detection, dialog
//!    auto-resolution, navigation policy - that cannot break each other.
//! 4. **Session** (`session`): the wired-together high-level API,
//!    including DOM extraction via the `webpilot-dom` crate.

pub mod cdp;
pub mod events;
pub mod registry;
pub mod session;
pub mod watchdog;
pub mod watchdogs;

#[cfg(test)]
pub(crate) mod test_support;

pub use cdp::{CDPClient, CDPError, CDPSession, Transport};
pub use events::{BrowserEvent, Event, EventBus, EventType, SubscriberId};
pub use registry::SessionRegistry;
pub use session::{AgentFocus, BrowserSession, SessionConfig};
pub use watchdog::{Watchdog, WatchdogError};
pub use watchdogs::{
    CrashWatchdog, CrashWatchdogConfig, PopupsWatchdog, SecurityPolicy, SecurityWatchdog,
};
