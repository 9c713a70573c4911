//! Node model of the local editable tree.

use crate::id::LocalHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property key holding the content of text leaves.
pub const TEXT_KEY: &str = "text";

/// Properties with this prefix are local-only and never replicated.
pub const TRANSIENT_PREFIX: &str = "__";

/// Node properties. Ordered so two trees compare deterministically.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// Structural class of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Holds an ordered list of children.
    Container,
    /// Leaf with character content.
    Text,
    /// Leaf with no addressable content (images, embeds).
    Opaque,
    /// Leaf standing for a hard line break.
    LineBreak,
}

impl NodeKind {
    #[inline]
    pub fn is_container(self) -> bool {
        matches!(self, NodeKind::Container)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        !self.is_container()
    }

    /// Dispatch on the kind through a visitor.
    pub fn accept<V: NodeKindVisitor>(self, visitor: &mut V) -> V::Output {
        match self {
            NodeKind::Container => visitor.visit_container(),
            NodeKind::Text => visitor.visit_text(),
            NodeKind::Opaque => visitor.visit_opaque(),
            NodeKind::LineBreak => visitor.visit_line_break(),
        }
    }
}

/// Per-kind behavior selector.
///
/// Components that treat containers and leaves differently implement this
/// once instead of matching on node type names.
pub trait NodeKindVisitor {
    type Output;

    fn visit_container(&mut self) -> Self::Output;
    fn visit_text(&mut self) -> Self::Output;
    fn visit_opaque(&mut self) -> Self::Output;

    fn visit_line_break(&mut self) -> Self::Output {
        self.visit_opaque()
    }
}

/// A node of the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalNode {
    pub(crate) handle: LocalHandle,
    pub(crate) node_type: String,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<LocalHandle>,
    pub(crate) children: Vec<LocalHandle>,
    pub(crate) props: PropertyMap,
}

impl LocalNode {
    pub(crate) fn new(
        handle: LocalHandle,
        node_type: String,
        kind: NodeKind,
        parent: Option<LocalHandle>,
        props: PropertyMap,
    ) -> Self {
        Self {
            handle,
            node_type,
            kind,
            parent,
            children: Vec::new(),
            props,
        }
    }

    #[inline]
    pub fn handle(&self) -> LocalHandle {
        self.handle
    }

    #[inline]
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    #[inline]
    pub fn parent(&self) -> Option<LocalHandle> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[LocalHandle] {
        &self.children
    }

    #[inline]
    pub fn props(&self) -> &PropertyMap {
        &self.props
    }

    pub fn prop(&self, key: &str) -> Option<&serde_json::Value> {
        self.props.get(key)
    }

    /// Character content of a text leaf, empty for every other node.
    pub fn text(&self) -> &str {
        self.props
            .get(TEXT_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Length of [`text`](Self::text) in characters.
    pub fn text_len(&self) -> usize {
        self.text().chars().count()
    }

    /// Number of addressable offsets inside this node.
    pub fn extent(&self) -> usize {
        match self.kind {
            NodeKind::Container => self.children.len(),
            NodeKind::Text => self.text_len(),
            NodeKind::Opaque | NodeKind::LineBreak => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Label;

    impl NodeKindVisitor for Label {
        type Output = &'static str;

        fn visit_container(&mut self) -> &'static str {
            "container"
        }
        fn visit_text(&mut self) -> &'static str {
            "text"
        }
        fn visit_opaque(&mut self) -> &'static str {
            "opaque"
        }
    }

    #[test]
    fn test_visitor_dispatch() {
        assert_eq!(NodeKind::Container.accept(&mut Label), "container");
        assert_eq!(NodeKind::Text.accept(&mut Label), "text");
        // Line breaks fall back to the opaque arm unless overridden.
        assert_eq!(NodeKind::LineBreak.accept(&mut Label), "opaque");
    }

    #[test]
    fn test_text_helpers() {
        let mut props = PropertyMap::new();
        props.insert(TEXT_KEY.into(), json!("héllo"));
        let node = LocalNode::new(LocalHandle(3), "text".into(), NodeKind::Text, None, props);
        assert_eq!(node.text(), "héllo");
        assert_eq!(node.text_len(), 5);
        assert_eq!(node.extent(), 5);
    }
}
