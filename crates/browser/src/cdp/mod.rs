//! CDP (Chrome DevTools Protocol) communication layer.
//!
//! Core principle: single WebSocket connection, multiplexed sessions.
//! Everything above this module depends on the `Transport` trait, not the
//! concrete client.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{send_with_timeout, CDPClient, CDPError, Transport};
pub use protocol::{CDPEvent, CDPRequest, CDPResponse};
pub use session::CDPSession;
