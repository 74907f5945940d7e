//! Utility functions for DOM processing.

use crate::arena::DomArena;
use crate::error::Result;
use crate::types::{DomNode, DomRect, NodeType, INTERACTIVE_ROLES, INTERACTIVE_TAGS};

/// Cap text length to avoid token explosion.
pub fn cap_text_length(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let capped: String = text.chars().take(max_len).collect();
        format!("{}...", capped)
    }
}

/// Check if element bounds intersect the viewport.
///
/// Content up to 1000px below the fold is still counted so the index
/// covers elements one scroll away.
pub fn intersects_viewport(bounds: &DomRect, viewport: &DomRect) -> bool {
    bounds.x < viewport.x + viewport.width
        && bounds.x + bounds.width > viewport.x
        && bounds.y < viewport.y + viewport.height + 1000.0
        && bounds.y + bounds.height > viewport.y - 1000.0
}

/// Classify whether an element is an interactive candidate by tag, role
/// and attribute signals. Geometry is checked separately.
pub fn is_interactive_candidate(node: &DomNode) -> bool {
    if node.node_type != NodeType::Element {
        return false;
    }

    if INTERACTIVE_TAGS
        .iter()
        .any(|t| node.node_name.eq_ignore_ascii_case(t))
    {
        return true;
    }

    if let Some(role) = node.attr("role") {
        if INTERACTIVE_ROLES.iter().any(|r| role.eq_ignore_ascii_case(r)) {
            return true;
        }
    }

    if node.attr("onclick").is_some() {
        return true;
    }

    if let Some(editable) = node.attr("contenteditable") {
        if !editable.eq_ignore_ascii_case("false") {
            return true;
        }
    }

    if let Some(tabindex) = node.attr("tabindex") {
        if tabindex.parse::<i32>().map(|v| v >= 0).unwrap_or(false) {
            return true;
        }
    }

    false
}

/// Collect all text content from a node and its subtree.
pub fn get_text_content(arena: &DomArena, node_id: u32) -> Result<String> {
    let mut text = String::new();

    arena.traverse_df(node_id, |node| {
        if node.node_type == NodeType::Text {
            text.push_str(&node.node_value);
        }
        Ok(())
    })?;

    Ok(text.trim().to_string())
}
