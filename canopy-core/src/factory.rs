//! Builds local nodes from replicated nodes.

use crate::error::{Result, SyncError};
use crate::id::LocalHandle;
use crate::node::{NodeKind, PropertyMap};
use crate::registry::NodeRegistry;
use crate::replica::{RawProperty, ReplicatedNode};
use crate::tree::TreeWriter;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Type and decoded properties of a node about to be materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBlueprint {
    pub node_type: String,
    pub kind: NodeKind,
    pub props: PropertyMap,
}

/// Decode a raw metadata map. Keys with unparsable values fail the whole map.
pub fn decode_props(raw: &BTreeMap<String, RawProperty>) -> Result<PropertyMap> {
    let mut props = PropertyMap::new();
    for (key, value) in raw {
        match value {
            RawProperty::Json(json) => {
                let value = serde_json::from_str(json).map_err(|e| {
                    SyncError::MalformedDiff(format!("property `{key}`: {e}"))
                })?;
                props.insert(key.clone(), value);
            }
            RawProperty::Removed => {}
            RawProperty::Unsupported => {
                return Err(SyncError::MalformedDiff(format!(
                    "property `{key}` is not JSON text"
                )));
            }
        }
    }
    Ok(props)
}

#[derive(Debug, Clone)]
pub struct NodeFactory {
    registry: Arc<NodeRegistry>,
}

impl NodeFactory {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve type and properties of `node` through the registry.
    pub fn blueprint(&self, node: &ReplicatedNode) -> Result<NodeBlueprint> {
        let node_type = node.node_type.as_deref().ok_or_else(|| {
            SyncError::MalformedDiff(format!("replicated node {} has no type", node.id))
        })?;
        let spec = self.registry.require(node_type)?;
        let props = (spec.deserialize)(node_type, decode_props(&node.props)?)?;
        Ok(NodeBlueprint {
            node_type: node_type.to_string(),
            kind: spec.kind,
            props,
        })
    }

    /// Insert a fresh local node built from `blueprint`.
    pub fn materialize(
        &self,
        writer: &mut TreeWriter<'_>,
        parent: LocalHandle,
        index: usize,
        blueprint: NodeBlueprint,
    ) -> Result<LocalHandle> {
        writer.insert(parent, index, &blueprint.node_type, blueprint.props)
    }
}
