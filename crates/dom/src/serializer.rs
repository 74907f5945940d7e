//! Flattening and rendering of an extracted tree.
//!
//! Two consumers: the Selector Map (dense integer indices over
//! interactive, visible nodes - what actions are routed through) and the
//! bracketed-index text representation handed to the language model.

use crate::arena::DomArena;
use crate::error::Result;
use crate::types::{
    DomNode, NodeId, NodeType, SelectorEntry, SelectorMap, DEFAULT_INCLUDE_ATTRIBUTES,
    INDEX_OFFSET,
};
use crate::utils::{cap_text_length, is_interactive_candidate};
use std::collections::HashMap;

/// Flatten the tree in document order and assign consecutive indices to
/// every interactive, visible node. Indices start at a fixed offset and
/// are not stable across extractions.
pub fn build_selector_map(arena: &DomArena) -> Result<SelectorMap> {
    let mut map = SelectorMap::new();
    let Some(root_id) = arena.root_id() else {
        return Ok(map);
    };

    let mut next_index = INDEX_OFFSET;
    arena.traverse_df(root_id, |node| {
        if is_interactive_candidate(node) && node.is_visible == Some(true) {
            map.insert(
                next_index,
                SelectorEntry {
                    node_id: node.node_id,
                    backend_node_id: node.backend_node_id,
                    target_id: node.target_id.clone(),
                },
            );
            next_index += 1;
        }
        Ok(())
    })?;

    Ok(map)
}

/// Serializer configuration.
#[derive(Debug, Clone)]
pub struct SerializerConfig {
    pub include_attributes: Vec<String>,
    pub max_text_length: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            include_attributes: DEFAULT_INCLUDE_ATTRIBUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_text_length: 200,
        }
    }
}

/// Renders the indexed view of a tree:
///
/// ```text
/// [1]<button id="go">Go</button>
///     [2]<a href="/next">Next page</a>
/// ```
///
/// Indentation tracks nesting of *indexed* elements; plain text lines are
/// page content that is not interactive.
pub struct DomSerializer {
    config: SerializerConfig,
}

impl DomSerializer {
    pub fn new() -> Self {
        Self::with_config(SerializerConfig::default())
    }

    pub fn with_config(config: SerializerConfig) -> Self {
        Self { config }
    }

    pub fn serialize(&self, arena: &DomArena, selector_map: &SelectorMap) -> Result<String> {
        let mut output = String::with_capacity(4096);

        let index_of: HashMap<NodeId, u32> = selector_map
            .iter()
            .map(|(index, entry)| (entry.node_id, index))
            .collect();

        if let Some(root_id) = arena.root_id() {
            self.serialize_node(arena, root_id, 0, &index_of, &mut output)?;
        }

        Ok(output)
    }

    fn serialize_node(
        &self,
        arena: &DomArena,
        node_id: NodeId,
        depth: usize,
        index_of: &HashMap<NodeId, u32>,
        output: &mut String,
    ) -> Result<()> {
        let node = arena.get(node_id)?;

        match node.node_type {
            NodeType::Element => {
                if let Some(index) = index_of.get(&node_id) {
                    let indent = "\t".repeat(depth);
                    let tag = node.node_name.to_lowercase();

                    output.push_str(&indent);
                    output.push('[');
                    output.push_str(&index.to_string());
                    output.push_str("]<");
                    output.push_str(&tag);
                    for attr_name in &self.config.include_attributes {
                        if let Some(attr_value) = node.attr(attr_name) {
                            output.push(' ');
                            output.push_str(attr_name);
                            output.push_str("=\"");
                            output.push_str(attr_value);
                            output.push('"');
                        }
                    }
                    output.push('>');
                    output.push_str(&cap_text_length(
                        &self.immediate_text(arena, node),
                        self.config.max_text_length,
                    ));
                    output.push_str("</");
                    output.push_str(&tag);
                    output.push_str(">\n");

                    for child_id in arena.child_edges(node) {
                        self.serialize_node(arena, child_id, depth + 1, index_of, output)?;
                    }
                } else {
                    for child_id in arena.child_edges(node) {
                        self.serialize_node(arena, child_id, depth, index_of, output)?;
                    }
                }
            }
            NodeType::Text => {
                // Inline text of an indexed parent was already emitted.
                let parent_indexed = node
                    .parent_id
                    .map(|p| index_of.contains_key(&p))
                    .unwrap_or(false);
                let text = node.node_value.trim();
                if !parent_indexed && !text.is_empty() {
                    output.push_str(&"\t".repeat(depth));
                    output.push_str(&cap_text_length(text, self.config.max_text_length));
                    output.push('\n');
                }
            }
            NodeType::Document | NodeType::DocumentFragment => {
                for child_id in arena.child_edges(node) {
                    self.serialize_node(arena, child_id, depth, index_of, output)?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Text of the node's immediate text children, joined.
    fn immediate_text(&self, arena: &DomArena, node: &DomNode) -> String {
        let mut text = String::new();
        for &child_id in &node.children_ids {
            if let Ok(child) = arena.get(child_id) {
                if child.node_type == NodeType::Text {
                    let trimmed = child.node_value.trim();
                    if !trimmed.is_empty() {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(trimmed);
                    }
                }
            }
        }
        text
    }
}

impl Default for DomSerializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DomNode;
    use smallvec::smallvec;

    fn build_page() -> DomArena {
        let mut arena = DomArena::new();

        let mut text = DomNode::new(0, 0, NodeType::Text, "#text".into(), "t1".into());
        text.node_value = "Go".into();
        let text_id = arena.add_node(text);

        let mut button = DomNode::new(0, 3, NodeType::Element, "BUTTON".into(), "t1".into());
        button.attributes.insert("id".into(), "go".into());
        button.is_visible = Some(true);
        button.children_ids = smallvec![text_id];
        let button_id = arena.add_node(button);

        let mut loose_text = DomNode::new(0, 0, NodeType::Text, "#text".into(), "t1".into());
        loose_text.node_value = "  Welcome back  ".into();
        let loose_id = arena.add_node(loose_text);

        let mut hidden = DomNode::new(0, 4, NodeType::Element, "A".into(), "t1".into());
        hidden.is_visible = Some(false);
        let hidden_id = arena.add_node(hidden);

        let mut body = DomNode::new(0, 2, NodeType::Element, "BODY".into(), "t1".into());
        body.children_ids = smallvec![loose_id, button_id, hidden_id];
        let body_id = arena.add_node(body);

        let mut doc = DomNode::new(0, 1, NodeType::Document, "#document".into(), "t1".into());
        doc.children_ids = smallvec![body_id];
        let doc_id = arena.add_node(doc);

        // Fix parent links for the text-inline check.
        arena.get_mut(text_id).unwrap().parent_id = Some(button_id);
        arena.get_mut(loose_id).unwrap().parent_id = Some(body_id);
        arena.get_mut(button_id).unwrap().parent_id = Some(body_id);
        arena.get_mut(hidden_id).unwrap().parent_id = Some(body_id);
        arena.get_mut(body_id).unwrap().parent_id = Some(doc_id);

        arena.set_root(doc_id).unwrap();
        arena
    }

    #[test]
    fn test_selector_map_skips_invisible() {
        let arena = build_page();
        let map = build_selector_map(&arena).unwrap();

        // Only the visible button is indexed; the invisible anchor and
        // the non-interactive body are not.
        assert_eq!(map.len(), 1);
        let (index, entry) = map.iter().next().unwrap();
        assert_eq!(index, INDEX_OFFSET);
        assert_eq!(entry.backend_node_id, 3);
        assert_eq!(entry.target_id, "t1");
    }

    #[test]
    fn test_serialize_indexed_format() {
        let arena = build_page();
        let map = build_selector_map(&arena).unwrap();
        let output = DomSerializer::new().serialize(&arena, &map).unwrap();

        assert!(output.contains("[1]<button id=\"go\">Go</button>"), "{output}");
        assert!(output.contains("Welcome back"), "{output}");
        // Inline text of the indexed button is not duplicated as a line.
        assert_eq!(output.matches("Go").count(), 1, "{output}");
    }

    #[test]
    fn test_empty_arena_serializes_to_empty() {
        let arena = DomArena::new();
        let map = build_selector_map(&arena).unwrap();
        assert!(map.is_empty());
        let output = DomSerializer::new().serialize(&arena, &map).unwrap();
        assert!(output.is_empty());
    }
}
