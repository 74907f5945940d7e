//! Core node and index types for the extraction engine.
//!
//! Key design principles:
//! 1. Use u32 indices into the arena instead of pointers
//! 2. Parent links are non-owning indices (the tree is rebuilt wholesale
//!    on every extraction, never mutated incrementally)
//! 3. Use SmallVec for child lists (most nodes have few children)

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};

/// Node identifier (index into arena).
pub type NodeId = u32;

/// Backend node identifier from the protocol. Stable for the lifetime of
/// the remote node; only unique within one target.
pub type BackendNodeId = u32;

/// Frame identifier from the protocol.
pub type FrameId = String;

/// Target identifier from the protocol.
pub type TargetId = String;

/// Session identifier from the protocol.
pub type SessionId = String;

/// Node type matching the DOM specification numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    Element = 1,
    Attribute = 2,
    Text = 3,
    CdataSection = 4,
    EntityReference = 5,
    Entity = 6,
    ProcessingInstruction = 7,
    Comment = 8,
    Document = 9,
    DocumentType = 10,
    DocumentFragment = 11,
    Notation = 12,
}

impl NodeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeType::Element),
            2 => Some(NodeType::Attribute),
            3 => Some(NodeType::Text),
            4 => Some(NodeType::CdataSection),
            5 => Some(NodeType::EntityReference),
            6 => Some(NodeType::Entity),
            7 => Some(NodeType::ProcessingInstruction),
            8 => Some(NodeType::Comment),
            9 => Some(NodeType::Document),
            10 => Some(NodeType::DocumentType),
            11 => Some(NodeType::DocumentFragment),
            12 => Some(NodeType::Notation),
            _ => None,
        }
    }
}

/// Shadow root kind reported by the protocol.
///
/// Closed roots are opaque to the standard child-enumeration call and are
/// fetched through the remote-object bridge instead; once inserted into
/// the arena the subtree shape is identical for all three kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShadowRootType {
    UserAgent,
    Open,
    Closed,
}

impl ShadowRootType {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user-agent" => Some(ShadowRootType::UserAgent),
            "open" => Some(ShadowRootType::Open),
            "closed" => Some(ShadowRootType::Closed),
            _ => None,
        }
    }
}

/// Rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DomRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Check if rectangle intersects with another.
    pub fn intersects(&self, other: &DomRect) -> bool {
        self.x < other.x + other.width
            && self.x + self.width > other.x
            && self.y < other.y + other.height
            && self.y + self.height > other.y
    }
}

/// One extracted DOM node.
///
/// Small fixed-size fields first, indices instead of pointers. The
/// `content_document_id` edge is how an iframe links to its embedded
/// document; for a cross-origin frame the linked subtree carries a
/// different `target_id` than its host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomNode {
    pub node_id: NodeId,
    pub backend_node_id: BackendNodeId,
    pub node_type: NodeType,

    pub parent_id: Option<NodeId>,
    pub children_ids: SmallVec<[NodeId; 4]>,

    pub node_name: String,
    pub node_value: String,
    pub attributes: HashMap<String, String>,

    pub frame_id: Option<FrameId>,
    pub target_id: TargetId,
    pub session_id: Option<SessionId>,

    pub content_document_id: Option<NodeId>,
    pub shadow_root_type: Option<ShadowRootType>,
    pub shadow_root_ids: SmallVec<[NodeId; 2]>,

    pub is_visible: Option<bool>,
    /// Absent when the node is off-screen or not rendered.
    pub bounds: Option<DomRect>,
}

impl DomNode {
    pub fn new(
        node_id: NodeId,
        backend_node_id: BackendNodeId,
        node_type: NodeType,
        node_name: String,
        target_id: TargetId,
    ) -> Self {
        Self {
            node_id,
            backend_node_id,
            node_type,
            parent_id: None,
            children_ids: SmallVec::new(),
            node_name,
            node_value: String::new(),
            attributes: HashMap::new(),
            frame_id: None,
            target_id,
            session_id: None,
            content_document_id: None,
            shadow_root_type: None,
            shadow_root_ids: SmallVec::new(),
            is_visible: None,
            bounds: None,
        }
    }

    pub fn tag_name(&self) -> Option<&str> {
        if self.node_type == NodeType::Element {
            Some(&self.node_name)
        } else {
            None
        }
    }

    pub fn is_element(&self) -> bool {
        self.node_type == NodeType::Element
    }

    pub fn is_text(&self) -> bool {
        self.node_type == NodeType::Text
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }
}

/// First interactive index handed out by an extraction pass.
pub const INDEX_OFFSET: u32 = 1;

/// One entry in the flattened interactive-element index.
///
/// Carries everything an action needs to route back to the right target:
/// the backend node id re-resolves the element, the target id picks the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorEntry {
    pub node_id: NodeId,
    pub backend_node_id: BackendNodeId,
    pub target_id: TargetId,
}

/// The flattened result of one extraction pass: dense integer indices to
/// interactive, visible nodes. Rebuilt from scratch on every extraction;
/// indices are not stable across passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorMap {
    entries: BTreeMap<u32, SelectorEntry>,
}

impl SelectorMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, index: u32, entry: SelectorEntry) {
        self.entries.insert(index, entry);
    }

    pub fn get(&self, index: u32) -> Option<&SelectorEntry> {
        self.entries.get(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &SelectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }
}

/// Tags considered interactive regardless of other signals.
pub const INTERACTIVE_TAGS: &[&str] = &[
    "A", "BUTTON", "INPUT", "SELECT", "TEXTAREA", "OPTION", "SUMMARY", "LABEL",
];

/// ARIA roles considered interactive.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "checkbox",
    "radio",
    "tab",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "switch",
    "slider",
    "spinbutton",
    "combobox",
    "textbox",
    "searchbox",
];

/// Attributes worth surfacing to the language model.
pub const DEFAULT_INCLUDE_ATTRIBUTES: &[&str] = &[
    "title",
    "type",
    "checked",
    "id",
    "name",
    "role",
    "value",
    "placeholder",
    "alt",
    "aria-label",
    "aria-expanded",
    "aria-checked",
    "href",
    "required",
    "disabled",
    "contenteditable",
    "selected",
    "multiple",
    "tabindex",
];
