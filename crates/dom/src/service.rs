//! DOM extraction engine.
//!
//! Produces, for one logical page, a single tree of nodes plus the
//! flattened interactive-element index - even when the page spans several
//! protocol targets because of cross-origin iframes.
//!
//! Design decisions:
//! 1. The protocol is reached only through the `CdpDriver` trait, so the
//!    whole engine runs against canned JSON in tests.
//! 2. Parsing is synchronous over fetched JSON; anything that needs
//!    another round-trip (cross-origin frame, closed shadow root) is
//!    queued and resolved between parse rounds.
//! 3. Every extraction builds a fresh arena. No incremental diffing -
//!    DOM mutation between calls is common and unbounded.

use crate::arena::DomArena;
use crate::error::{DomError, Result};
use crate::serializer::build_selector_map;
use crate::types::{
    BackendNodeId, DomNode, DomRect, NodeId, NodeType, SelectorMap, SessionId, ShadowRootType,
    TargetId,
};
use crate::utils::{intersects_viewport, is_interactive_candidate};
use async_trait::async_trait;
use serde_json::{json, Value};
use smallvec::SmallVec;
use std::collections::HashMap;

/// The protocol seam the extraction engine depends on.
///
/// `session_for_target` has open-or-reuse semantics: implementations
/// return an existing session when the registry already tracks the target
/// and may attach a fresh one otherwise.
#[async_trait]
pub trait CdpDriver: Send + Sync {
    async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value>;

    async fn session_for_target(&self, target_id: &str) -> Option<SessionId>;
}

/// Configuration for the extraction engine.
#[derive(Debug, Clone)]
pub struct DomServiceConfig {
    pub cross_origin_iframes: bool,
    pub closed_shadow_roots: bool,
    pub max_iframes: usize,
    pub max_iframe_depth: usize,
}

impl Default for DomServiceConfig {
    fn default() -> Self {
        Self {
            cross_origin_iframes: true,
            closed_shadow_roots: true,
            max_iframes: 100,
            max_iframe_depth: 5,
        }
    }
}

/// The result of one extraction pass.
#[derive(Debug)]
pub struct DomSnapshot {
    pub arena: DomArena,
    pub root: NodeId,
    pub selector_map: SelectorMap,
}

/// A cross-origin frame whose document lives in a separate target.
struct PendingFrame {
    host: NodeId,
    frame_target: TargetId,
    depth: usize,
}

/// A closed shadow root reachable only through the remote-object bridge.
struct PendingShadow {
    host: NodeId,
    backend_id: BackendNodeId,
    target_id: TargetId,
    session_id: SessionId,
    depth: usize,
}

/// Synchronous JSON-to-arena walker. Round-trip work is queued on the
/// pending lists and resolved by the service between rounds.
struct Walker<'a> {
    arena: DomArena,
    cfg: &'a DomServiceConfig,
    iframe_count: usize,
    pending_frames: Vec<PendingFrame>,
    pending_shadows: Vec<PendingShadow>,
}

impl<'a> Walker<'a> {
    fn new(cfg: &'a DomServiceConfig) -> Self {
        Self {
            arena: DomArena::new(),
            cfg,
            iframe_count: 0,
            pending_frames: Vec::new(),
            pending_shadows: Vec::new(),
        }
    }

    fn parse_node(
        &mut self,
        json: &Value,
        parent: Option<NodeId>,
        target_id: &str,
        session_id: &str,
        frame_depth: usize,
    ) -> Result<NodeId> {
        let node_type_raw = json["nodeType"]
            .as_u64()
            .ok_or(DomError::InvalidNodeType(0))?;
        let node_type = NodeType::from_u8(node_type_raw as u8)
            .ok_or(DomError::InvalidNodeType(node_type_raw))?;

        let backend_node_id = json["backendNodeId"].as_u64().unwrap_or(0) as BackendNodeId;
        let node_name = json["nodeName"].as_str().unwrap_or("").to_string();

        let mut node = DomNode::new(0, backend_node_id, node_type, node_name, target_id.to_string());
        node.node_value = json["nodeValue"].as_str().unwrap_or("").to_string();
        node.parent_id = parent;
        node.session_id = Some(session_id.to_string());
        node.frame_id = json["frameId"].as_str().map(String::from);
        node.shadow_root_type = json["shadowRootType"]
            .as_str()
            .and_then(ShadowRootType::from_str);

        // Attributes arrive as a flat [name, value, name, value, ...] list.
        if let Some(attrs) = json["attributes"].as_array() {
            let mut i = 0;
            while i + 1 < attrs.len() {
                if let (Some(key), Some(value)) = (attrs[i].as_str(), attrs[i + 1].as_str()) {
                    node.attributes.insert(key.to_string(), value.to_string());
                }
                i += 2;
            }
        }

        let is_frame_element =
            node_type == NodeType::Element && matches!(node.node_name.as_str(), "IFRAME" | "FRAME");
        let has_closed_shadow = node.shadow_root_type == Some(ShadowRootType::Closed);
        let frame_id = node.frame_id.clone();

        let current_id = self.arena.add_node(node);

        if let Some(children) = json["children"].as_array() {
            let mut child_ids = SmallVec::new();
            for child in children {
                child_ids.push(self.parse_node(
                    child,
                    Some(current_id),
                    target_id,
                    session_id,
                    frame_depth,
                )?);
            }
            self.arena.get_mut(current_id)?.children_ids = child_ids;
        }

        // Open (and user-agent) shadow roots are enumerated inline and
        // walked exactly like light-DOM children.
        let mut inlined_shadows = false;
        if let Some(shadow_roots) = json["shadowRoots"].as_array() {
            if !shadow_roots.is_empty() {
                inlined_shadows = true;
                let mut shadow_ids = SmallVec::new();
                for shadow in shadow_roots {
                    shadow_ids.push(self.parse_node(
                        shadow,
                        Some(current_id),
                        target_id,
                        session_id,
                        frame_depth,
                    )?);
                }
                self.arena.get_mut(current_id)?.shadow_root_ids = shadow_ids;
            }
        }

        // A closed root is opaque to the standard enumeration; it has to
        // go through the remote-object bridge in a later round.
        if has_closed_shadow && !inlined_shadows && self.cfg.closed_shadow_roots {
            self.pending_shadows.push(PendingShadow {
                host: current_id,
                backend_id: backend_node_id,
                target_id: target_id.to_string(),
                session_id: session_id.to_string(),
                depth: frame_depth,
            });
        }

        if let Some(content_doc) = json.get("contentDocument") {
            // Same-origin frame: the document is inlined in this target.
            let doc_id = self.parse_node(
                content_doc,
                Some(current_id),
                target_id,
                session_id,
                frame_depth + 1,
            )?;
            self.arena.get_mut(current_id)?.content_document_id = Some(doc_id);
        } else if is_frame_element && self.cfg.cross_origin_iframes {
            // Cross-origin frame: the browser backs it with a separate
            // target whose id equals the frame id.
            if let Some(frame_target) = frame_id {
                self.pending_frames.push(PendingFrame {
                    host: current_id,
                    frame_target,
                    depth: frame_depth + 1,
                });
            }
        }

        Ok(current_id)
    }

    /// Attach an empty placeholder document under a frame host whose
    /// backing target could not be walked.
    fn attach_placeholder(&mut self, host: NodeId, target_id: &str) -> Result<NodeId> {
        let mut doc = DomNode::new(
            0,
            0,
            NodeType::Document,
            "#document".to_string(),
            target_id.to_string(),
        );
        doc.parent_id = Some(host);
        let doc_id = self.arena.add_node(doc);
        self.arena.get_mut(host)?.content_document_id = Some(doc_id);
        Ok(doc_id)
    }
}

/// Main extraction service.
pub struct DomService<D: CdpDriver> {
    driver: D,
    config: DomServiceConfig,
}

impl<D: CdpDriver> DomService<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, DomServiceConfig::default())
    }

    pub fn with_config(driver: D, config: DomServiceConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &DomServiceConfig {
        &self.config
    }

    /// Extract the full tree for a page and build its Selector Map.
    ///
    /// A failure fetching the primary document is fatal; a failed frame
    /// or shadow resolution degrades to a placeholder subtree.
    pub async fn extract(&self, target_id: &str) -> Result<DomSnapshot> {
        let session_id = self
            .driver
            .session_for_target(target_id)
            .await
            .ok_or_else(|| DomError::TargetUnavailable(target_id.to_string()))?;

        let doc = self
            .driver
            .send(
                "DOM.getDocument",
                Some(json!({ "depth": -1, "pierce": true })),
                Some(&session_id),
            )
            .await
            .map_err(|e| DomError::DocumentFetch {
                target_id: target_id.to_string(),
                message: e.to_string(),
            })?;

        let root_json = doc.get("root").ok_or_else(|| DomError::DocumentFetch {
            target_id: target_id.to_string(),
            message: "missing 'root' in DOM.getDocument response".to_string(),
        })?;

        let mut walker = Walker::new(&self.config);
        let root = walker.parse_node(root_json, None, target_id, &session_id, 0)?;
        walker.arena.set_root(root)?;

        // Resolve queued round-trip work; each round may enqueue more
        // (nested frames, shadows inside frames).
        loop {
            let shadows = std::mem::take(&mut walker.pending_shadows);
            let frames = std::mem::take(&mut walker.pending_frames);
            if shadows.is_empty() && frames.is_empty() {
                break;
            }
            for pending in shadows {
                self.resolve_closed_shadow(&mut walker, pending).await?;
            }
            for pending in frames {
                self.resolve_frame(&mut walker, pending).await?;
            }
        }

        let mut arena = walker.arena;
        self.apply_bounds(&mut arena).await?;

        let selector_map = build_selector_map(&arena)?;

        Ok(DomSnapshot {
            arena,
            root,
            selector_map,
        })
    }

    /// Walk a cross-origin frame through its own target's session.
    async fn resolve_frame(&self, walker: &mut Walker<'_>, pending: PendingFrame) -> Result<()> {
        if pending.depth > self.config.max_iframe_depth {
            tracing::warn!(
                "[DomService] Frame depth {} exceeds cap {}, subtree truncated: {}",
                pending.depth,
                self.config.max_iframe_depth,
                pending.frame_target
            );
            walker.attach_placeholder(pending.host, &pending.frame_target)?;
            return Ok(());
        }
        if walker.iframe_count >= self.config.max_iframes {
            tracing::warn!(
                "[DomService] Frame count cap {} reached, subtree truncated: {}",
                self.config.max_iframes,
                pending.frame_target
            );
            walker.attach_placeholder(pending.host, &pending.frame_target)?;
            return Ok(());
        }
        walker.iframe_count += 1;

        let Some(session_id) = self.driver.session_for_target(&pending.frame_target).await else {
            tracing::debug!(
                "[DomService] No session for frame target {}, inserting placeholder",
                pending.frame_target
            );
            walker.attach_placeholder(pending.host, &pending.frame_target)?;
            return Ok(());
        };

        let doc = self
            .driver
            .send(
                "DOM.getDocument",
                Some(json!({ "depth": -1, "pierce": true })),
                Some(&session_id),
            )
            .await;

        match doc.ok().and_then(|d| d.get("root").cloned()) {
            Some(root_json) => {
                let doc_id = walker.parse_node(
                    &root_json,
                    Some(pending.host),
                    &pending.frame_target,
                    &session_id,
                    pending.depth,
                )?;
                walker.arena.get_mut(pending.host)?.content_document_id = Some(doc_id);
            }
            None => {
                tracing::debug!(
                    "[DomService] Document fetch failed for frame target {}, inserting placeholder",
                    pending.frame_target
                );
                walker.attach_placeholder(pending.host, &pending.frame_target)?;
            }
        }

        Ok(())
    }

    /// Walk a closed shadow root through the remote-object bridge:
    /// resolve the host to an object handle, evaluate a function on it
    /// that returns the shadow root, request a node for that handle and
    /// describe it. The resulting subtree has the same shape as open
    /// shadow content.
    async fn resolve_closed_shadow(
        &self,
        walker: &mut Walker<'_>,
        pending: PendingShadow,
    ) -> Result<()> {
        match self
            .fetch_closed_shadow(pending.backend_id, &pending.session_id)
            .await
        {
            Some(subtree) => {
                let shadow_id = walker.parse_node(
                    &subtree,
                    Some(pending.host),
                    &pending.target_id,
                    &pending.session_id,
                    pending.depth,
                )?;
                walker
                    .arena
                    .get_mut(pending.host)?
                    .shadow_root_ids
                    .push(shadow_id);
            }
            None => {
                tracing::debug!(
                    "[DomService] Closed shadow root unreachable for backend node {}",
                    pending.backend_id
                );
            }
        }
        Ok(())
    }

    async fn fetch_closed_shadow(
        &self,
        backend_id: BackendNodeId,
        session_id: &str,
    ) -> Option<Value> {
        let resolved = self
            .driver
            .send(
                "DOM.resolveNode",
                Some(json!({ "backendNodeId": backend_id })),
                Some(session_id),
            )
            .await
            .ok()?;
        let host_object = resolved["object"]["objectId"].as_str()?.to_string();

        let bridged = self
            .driver
            .send(
                "Runtime.callFunctionOn",
                Some(json!({
                    "objectId": host_object,
                    "functionDeclaration":
                        "function() { return this.openOrClosedShadowRoot || this.shadowRoot; }",
                    "returnByValue": false,
                })),
                Some(session_id),
            )
            .await
            .ok()?;
        let shadow_object = bridged["result"]["objectId"].as_str()?.to_string();

        let requested = self
            .driver
            .send(
                "DOM.requestNode",
                Some(json!({ "objectId": shadow_object })),
                Some(session_id),
            )
            .await
            .ok()?;
        let node_id = requested["nodeId"].as_u64()?;

        let described = self
            .driver
            .send(
                "DOM.describeNode",
                Some(json!({ "nodeId": node_id, "depth": -1, "pierce": true })),
                Some(session_id),
            )
            .await
            .ok()?;

        described.get("node").cloned()
    }

    /// Fetch bounding boxes for interactive candidates and mark
    /// visibility. A node without a box model is not rendered and stays
    /// `bounds: None`.
    async fn apply_bounds(&self, arena: &mut DomArena) -> Result<()> {
        let candidates = arena.find(is_interactive_candidate);
        let mut viewports: HashMap<TargetId, Option<DomRect>> = HashMap::new();

        for node_id in candidates {
            let (backend_id, target_id, session_id) = {
                let node = arena.get(node_id)?;
                (
                    node.backend_node_id,
                    node.target_id.clone(),
                    node.session_id.clone(),
                )
            };
            let Some(session_id) = session_id else { continue };
            if backend_id == 0 {
                continue;
            }

            if !viewports.contains_key(&target_id) {
                let viewport = self.fetch_viewport(&session_id).await;
                viewports.insert(target_id.clone(), viewport);
            }

            let bounds = self.fetch_box_model(backend_id, &session_id).await;
            let is_visible = match (&bounds, viewports.get(&target_id).and_then(|v| *v)) {
                (Some(b), Some(viewport)) => !b.is_empty() && intersects_viewport(b, &viewport),
                (Some(b), None) => !b.is_empty(),
                (None, _) => false,
            };

            let node = arena.get_mut(node_id)?;
            node.bounds = bounds;
            node.is_visible = Some(is_visible);
        }

        Ok(())
    }

    async fn fetch_box_model(&self, backend_id: BackendNodeId, session_id: &str) -> Option<DomRect> {
        let result = self
            .driver
            .send(
                "DOM.getBoxModel",
                Some(json!({ "backendNodeId": backend_id })),
                Some(session_id),
            )
            .await
            .ok()?;

        let quad = result["model"]["content"].as_array()?;
        if quad.len() < 8 {
            return None;
        }
        let coords: Vec<f64> = quad.iter().filter_map(|v| v.as_f64()).collect();
        if coords.len() < 8 {
            return None;
        }
        let xs = [coords[0], coords[2], coords[4], coords[6]];
        let ys = [coords[1], coords[3], coords[5], coords[7]];
        let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        Some(DomRect::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }

    async fn fetch_viewport(&self, session_id: &str) -> Option<DomRect> {
        let metrics = self
            .driver
            .send("Page.getLayoutMetrics", None, Some(session_id))
            .await
            .ok()?;

        let viewport = metrics
            .get("cssVisualViewport")
            .or_else(|| metrics.get("layoutViewport"))?;

        Some(DomRect::new(
            viewport["pageX"].as_f64().unwrap_or(0.0),
            viewport["pageY"].as_f64().unwrap_or(0.0),
            viewport["clientWidth"].as_f64()?,
            viewport["clientHeight"].as_f64()?,
        ))
    }
}
