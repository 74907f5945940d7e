//! Arena-based DOM tree storage.
//!
//! A single `Vec<DomNode>` holds every node of one extraction pass, across
//! however many targets the page spans. Links are 4-byte indices, parent
//! links are non-owning back-references, and traversal is iterative so a
//! deep tree cannot blow the stack.
//!
//! The backend-id lookup is keyed by `(target_id, backend_node_id)`:
//! backend ids are only unique within one target, and one arena may hold
//! nodes from several.

use crate::error::{DomError, Result};
use crate::types::{BackendNodeId, DomNode, NodeId, NodeType, TargetId};
use ahash::AHashMap;

#[derive(Debug, Default)]
pub struct DomArena {
    /// All nodes stored sequentially.
    nodes: Vec<DomNode>,

    /// (target, backend node id) -> NodeId lookup.
    backend_id_map: AHashMap<(TargetId, BackendNodeId), NodeId>,

    /// Root node ID (if set).
    root_id: Option<NodeId>,
}

impl DomArena {
    pub fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(1024),
            backend_id_map: AHashMap::with_capacity(1024),
            root_id: None,
        }
    }

    /// Add a node to the arena, returns its ID. The node's `node_id`
    /// field is overwritten with the arena index so the two never drift.
    pub fn add_node(&mut self, mut node: DomNode) -> NodeId {
        let node_id = self.nodes.len() as NodeId;
        node.node_id = node_id;
        if node.backend_node_id != 0 {
            self.backend_id_map
                .insert((node.target_id.clone(), node.backend_node_id), node_id);
        }
        self.nodes.push(node);
        node_id
    }

    pub fn get(&self, node_id: NodeId) -> Result<&DomNode> {
        self.nodes
            .get(node_id as usize)
            .ok_or(DomError::NodeNotFound(node_id))
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Result<&mut DomNode> {
        self.nodes
            .get_mut(node_id as usize)
            .ok_or(DomError::NodeNotFound(node_id))
    }

    /// Look up a node by its owning target and backend node id.
    pub fn get_by_backend_id(&self, target_id: &str, backend_id: BackendNodeId) -> Option<&DomNode> {
        self.backend_id_map
            .get(&(target_id.to_string(), backend_id))
            .and_then(|id| self.nodes.get(*id as usize))
    }

    pub fn set_root(&mut self, node_id: NodeId) -> Result<()> {
        self.get(node_id)?;
        self.root_id = Some(node_id);
        Ok(())
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomNode> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| i as NodeId)
    }

    pub fn parent(&self, node_id: NodeId) -> Result<Option<&DomNode>> {
        let node = self.get(node_id)?;
        match node.parent_id {
            Some(parent_id) => Ok(Some(self.get(parent_id)?)),
            None => Ok(None),
        }
    }

    /// Child edges of one node in document order: light children, then
    /// shadow roots, then the iframe content document.
    pub fn child_edges(&self, node: &DomNode) -> Vec<NodeId> {
        let mut edges: Vec<NodeId> = node.children_ids.iter().copied().collect();
        edges.extend(node.shadow_root_ids.iter().copied());
        if let Some(doc_id) = node.content_document_id {
            edges.push(doc_id);
        }
        edges
    }

    /// Traverse depth-first in document order (iterative, no recursion).
    pub fn traverse_df<F>(&self, start_id: NodeId, mut visit: F) -> Result<()>
    where
        F: FnMut(&DomNode) -> Result<()>,
    {
        let mut stack = vec![start_id];

        while let Some(node_id) = stack.pop() {
            let node = self.get(node_id)?;
            visit(node)?;

            // Push in reverse so edges are visited left-to-right.
            for child_id in self.child_edges(node).into_iter().rev() {
                stack.push(child_id);
            }
        }

        Ok(())
    }

    pub fn find<F>(&self, predicate: F) -> Vec<NodeId>
    where
        F: Fn(&DomNode) -> bool,
    {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(idx, node)| {
                if predicate(node) {
                    Some(idx as NodeId)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.find(|node| {
            node.node_type == NodeType::Element && node.node_name.eq_ignore_ascii_case(tag)
        })
    }

    pub fn find_visible(&self) -> Vec<NodeId> {
        self.find(|node| node.is_visible == Some(true))
    }

    /// Clear arena (reuse allocation).
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.backend_id_map.clear();
        self.root_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(node_id: NodeId, backend: BackendNodeId, name: &str, target: &str) -> DomNode {
        DomNode::new(
            node_id,
            backend,
            NodeType::Element,
            name.to_string(),
            target.to_string(),
        )
    }

    #[test]
    fn test_arena_basic() {
        let mut arena = DomArena::new();

        let id = arena.add_node(element(0, 100, "DIV", "t1"));
        assert_eq!(id, 0);

        let retrieved = arena.get(id).unwrap();
        assert_eq!(retrieved.node_name, "DIV");
        assert_eq!(retrieved.backend_node_id, 100);
    }

    #[test]
    fn test_backend_lookup_is_per_target() {
        let mut arena = DomArena::new();

        arena.add_node(element(0, 100, "DIV", "t1"));
        arena.add_node(element(1, 100, "SPAN", "t2"));

        assert_eq!(arena.get_by_backend_id("t1", 100).unwrap().node_name, "DIV");
        assert_eq!(arena.get_by_backend_id("t2", 100).unwrap().node_name, "SPAN");
        assert!(arena.get_by_backend_id("t3", 100).is_none());
    }

    #[test]
    fn test_traverse_df_document_order() {
        let mut arena = DomArena::new();

        let mut root = element(0, 100, "DIV", "t1");
        let child1 = element(1, 101, "SPAN", "t1");
        let child2 = element(2, 102, "P", "t1");

        let id1 = arena.add_node(child1);
        let id2 = arena.add_node(child2);

        root.children_ids.push(id1);
        root.children_ids.push(id2);

        let root_id = arena.add_node(root);

        let mut visited = Vec::new();
        arena
            .traverse_df(root_id, |node| {
                visited.push(node.node_name.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(visited, vec!["DIV", "SPAN", "P"]);
    }

    #[test]
    fn test_traverse_includes_shadow_and_content_document() {
        let mut arena = DomArena::new();

        let shadow_child = element(0, 201, "BUTTON", "t1");
        let shadow_id = arena.add_node(shadow_child);

        let frame_doc = DomNode::new(1, 301, NodeType::Document, "#document".into(), "t2".into());
        let doc_id = arena.add_node(frame_doc);

        let mut host = element(2, 100, "IFRAME", "t1");
        host.shadow_root_ids.push(shadow_id);
        host.content_document_id = Some(doc_id);
        let host_id = arena.add_node(host);

        let mut visited = Vec::new();
        arena
            .traverse_df(host_id, |node| {
                visited.push(node.node_name.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(visited, vec!["IFRAME", "BUTTON", "#document"]);
    }
}
