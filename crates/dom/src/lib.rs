//! Multi-target DOM extraction and indexing.
//!
//! Walks the full render tree of a page - nested open and closed shadow
//! roots, same-origin and cross-origin iframes (each a separate protocol
//! target) - and produces a flattened, stably-indexed map of interactive
//! elements an agent can reference by integer.
//!
//! ## Core design
//!
//! ```text
//! CDP JSON -> Walker -> DomArena (flat Vec, u32 indices)
//!                          |
//!                          v
//!               bounds pass -> SelectorMap -> serialized text
//! ```
//!
//! The protocol is reached only through the [`CdpDriver`] trait; the
//! engine never owns a connection. Every extraction builds a fresh arena
//! and index - indices are not stable across passes.

pub mod arena;
pub mod error;
pub mod serializer;
pub mod service;
pub mod types;
pub mod utils;

pub use arena::DomArena;
pub use error::{DomError, Result};
pub use serializer::{build_selector_map, DomSerializer, SerializerConfig};
pub use service::{CdpDriver, DomService, DomServiceConfig, DomSnapshot};
pub use types::*;
