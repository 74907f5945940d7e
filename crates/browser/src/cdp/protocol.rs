//! CDP protocol types.
//!
//! These are the fundamental types for CDP communication.
//! Keep them minimal - add domain-specific types only when needed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request ID - monotonically increasing.
pub type RequestId = u64;

/// Target ID from the browser.
pub type TargetId = String;

/// Session ID for attached targets.
pub type SessionId = String;

/// CDP request sent to the browser.
#[derive(Debug, Clone, Serialize)]
pub struct CDPRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// CDP response from the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct CDPResponse {
    pub id: RequestId,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

/// Wire-level error payload inside a response frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// CDP event from the browser (no request ID).
#[derive(Debug, Clone, Deserialize)]
pub struct CDPEvent {
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<SessionId>,
}

/// Unified CDP message (response or event).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CDPMessage {
    Response(CDPResponse),
    Event(CDPEvent),
}

/// Target info as carried by Target.getTargetInfo and attach events.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

/// Payload of Target.attachedToTarget.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachedToTargetEvent {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "targetInfo")]
    pub target_info: TargetInfo,
    #[serde(rename = "waitingForDebugger", default)]
    pub waiting_for_debugger: bool,
}

/// Payload of Target.detachedFromTarget. The target id may be absent;
/// the registry falls back to its reverse session map.
#[derive(Debug, Clone, Deserialize)]
pub struct DetachedFromTargetEvent {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "targetId", default)]
    pub target_id: Option<TargetId>,
}
