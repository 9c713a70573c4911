//! Node type registry.
//!
//! Maps type names to their structural kind and to the functions that turn
//! a node's properties into their replicated form and back. The tree, the
//! propagator and the node factory all consult the same registry.

use crate::error::{Result, SyncError};
use crate::node::{LocalNode, NodeKind, PropertyMap, TEXT_KEY, TRANSIENT_PREFIX};
use rustc_hash::FxHashMap;

/// Converts a local node's properties into the map stored in the replica.
pub type SerializeFn = fn(&LocalNode) -> Result<PropertyMap>;

/// Validates (and may normalize) properties read back from the replica.
pub type DeserializeFn = fn(&str, PropertyMap) -> Result<PropertyMap>;

/// Registry entry for one node type.
#[derive(Clone, Copy)]
pub struct NodeSpec {
    pub kind: NodeKind,
    pub serialize: SerializeFn,
    pub deserialize: DeserializeFn,
}

impl NodeSpec {
    /// Spec with the default property codecs.
    pub fn of(kind: NodeKind) -> Self {
        Self {
            kind,
            serialize: replicated_props,
            deserialize: match kind {
                NodeKind::Text => text_props as DeserializeFn,
                _ => passthrough_props as DeserializeFn,
            },
        }
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec").field("kind", &self.kind).finish()
    }
}

/// Drops transient properties.
pub fn replicated_props(node: &LocalNode) -> Result<PropertyMap> {
    Ok(node
        .props()
        .iter()
        .filter(|(key, _)| !key.starts_with(TRANSIENT_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

fn passthrough_props(_node_type: &str, props: PropertyMap) -> Result<PropertyMap> {
    Ok(props)
}

fn text_props(node_type: &str, props: PropertyMap) -> Result<PropertyMap> {
    match props.get(TEXT_KEY) {
        Some(value) if !value.is_string() => Err(SyncError::MalformedDiff(format!(
            "{node_type}: `{TEXT_KEY}` must be a string"
        ))),
        _ => Ok(props),
    }
}

/// Registry of known node types.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    specs: FxHashMap<String, NodeSpec>,
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in rich-text node types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for name in ["root", "paragraph", "heading", "quote", "list", "listitem"] {
            registry.register(name, NodeSpec::of(NodeKind::Container));
        }
        registry.register("text", NodeSpec::of(NodeKind::Text));
        registry.register("image", NodeSpec::of(NodeKind::Opaque));
        registry.register("linebreak", NodeSpec::of(NodeKind::LineBreak));
        registry
    }

    /// Register (or replace) a node type.
    pub fn register(&mut self, name: impl Into<String>, spec: NodeSpec) -> Option<NodeSpec> {
        self.specs.insert(name.into(), spec)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&NodeSpec> {
        self.specs.get(name)
    }

    /// Like [`get`](Self::get) but fails with [`SyncError::UnknownNodeType`].
    pub fn require(&self, name: &str) -> Result<&NodeSpec> {
        self.specs
            .get(name)
            .ok_or_else(|| SyncError::UnknownNodeType(name.to_string()))
    }

    pub fn kind_of(&self, name: &str) -> Option<NodeKind> {
        self.get(name).map(|spec| spec.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::LocalHandle;
    use serde_json::json;

    #[test]
    fn test_builtin_kinds() {
        let registry = NodeRegistry::with_defaults();
        assert_eq!(registry.kind_of("paragraph"), Some(NodeKind::Container));
        assert_eq!(registry.kind_of("text"), Some(NodeKind::Text));
        assert_eq!(registry.kind_of("image"), Some(NodeKind::Opaque));
        assert_eq!(registry.kind_of("linebreak"), Some(NodeKind::LineBreak));
        assert_eq!(registry.kind_of("table"), None);
    }

    #[test]
    fn test_require_unknown() {
        let registry = NodeRegistry::with_defaults();
        let err = registry.require("table").unwrap_err();
        assert_eq!(err, SyncError::UnknownNodeType("table".into()));
    }

    #[test]
    fn test_transient_props_not_replicated() {
        let mut props = PropertyMap::new();
        props.insert("format".into(), json!(1));
        props.insert("__dirty".into(), json!(true));
        let node = LocalNode::new(LocalHandle(1), "text".into(), NodeKind::Text, None, props);
        let out = replicated_props(&node).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("format"));
    }

    #[test]
    fn test_text_props_validation() {
        let spec = NodeSpec::of(NodeKind::Text);
        let mut props = PropertyMap::new();
        props.insert(TEXT_KEY.into(), json!(12));
        assert!((spec.deserialize)("text", props).is_err());
    }

    #[test]
    fn test_custom_type() {
        fn reject(_: &LocalNode) -> Result<PropertyMap> {
            Err(SyncError::Serialization {
                node: "widget".into(),
                reason: "opaque payload".into(),
            })
        }
        let mut registry = NodeRegistry::new();
        registry.register(
            "widget",
            NodeSpec {
                serialize: reject,
                ..NodeSpec::of(NodeKind::Opaque)
            },
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.kind_of("widget"), Some(NodeKind::Opaque));
    }
}
