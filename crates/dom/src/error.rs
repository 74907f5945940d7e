//! Error types for DOM extraction.
//!
//! Simple, flat error hierarchy. No over-engineering.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DomError>;

#[derive(Debug, Error)]
pub enum DomError {
    #[error("Node not found: {0}")]
    NodeNotFound(u32),

    #[error("Invalid node type: {0}")]
    InvalidNodeType(u64),

    #[error("No session available for target {0}")]
    TargetUnavailable(String),

    /// Fatal: the primary document could not be fetched. Frame and
    /// shadow-root failures degrade to placeholders instead.
    #[error("Failed to fetch document for target {target_id}: {message}")]
    DocumentFetch { target_id: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Maximum iframe depth exceeded: {current} > {max}")]
    MaxIframeDepthExceeded { current: usize, max: usize },

    #[error("Maximum iframe count exceeded: {current} > {max}")]
    MaxIframeCountExceeded { current: usize, max: usize },
}
