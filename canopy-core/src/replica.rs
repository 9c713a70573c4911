//! The replicated tree.
//!
//! Wraps a Loro document holding one movable tree named `document`. Each
//! tree node carries a metadata map: the node type under [`TYPE_KEY`] and
//! every replicated property as a JSON-encoded string. String values under
//! [`TEXT_KEY`] live in a `LoroText` instead, so concurrent typing in one
//! leaf merges per character.
//!
//! ```text
//!   LoroDoc
//!     └── tree "document"
//!           ├── node 0@1  meta { __type: "\"paragraph\"", align: "\"left\"" }
//!           │     └── node 1@1  meta { __type: "\"text\"", text: LoroText("hi") }
//!           └── ...
//! ```
//!
//! All Loro event types are translated into [`DiffBatch`]es here so the
//! rest of the crate never touches them. Batches queue up in an inbox and
//! are drained with [`Replica::take_batches`].

use crate::error::{Result, SyncError};
use crate::id::{PeerId, StableId};
use crate::node::{PropertyMap, TEXT_KEY};
use loro::event::{Diff, DiffEvent};
use loro::{
    Container, ContainerID, ContainerType, ExportMode, LoroDoc, LoroMap, LoroText, LoroTree,
    Subscription, TreeExternalDiff, TreeID, TreeParentId, ValueOrContainer, VersionVector,
};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Name of the tree container inside the document.
pub const TREE_NAME: &str = "document";

/// Metadata key holding the node type name.
pub const TYPE_KEY: &str = "__type";

/// Commit origin of locally propagated edits. Events carrying it are not
/// integrated back into the local tree.
pub const LOCAL_ORIGIN: &str = "canopy:local";

/// Commit origin for housekeeping writes that must stay out of undo history.
pub const SYSTEM_ORIGIN: &str = "canopy:sys";

// ───────────────────────────────────────────────────────────────────
// Diff batches
// ───────────────────────────────────────────────────────────────────

/// Parent of a replicated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentRef {
    Root,
    Node(StableId),
}

impl ParentRef {
    pub fn from_option(parent: Option<StableId>) -> Self {
        parent.map_or(ParentRef::Root, ParentRef::Node)
    }

    pub fn node(self) -> Option<StableId> {
        match self {
            ParentRef::Root => None,
            ParentRef::Node(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeAction {
    Create,
    Move,
    Delete,
}

/// One structural change reported by the replica.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEvent {
    pub target: StableId,
    pub action: TreeAction,
    /// New parent for creates and moves. `None` for deletes, or when the
    /// replica reported a parent outside the live tree.
    pub parent: Option<ParentRef>,
    pub index: Option<usize>,
}

impl TreeEvent {
    pub fn create(target: StableId, parent: ParentRef, index: usize) -> Self {
        Self {
            target,
            action: TreeAction::Create,
            parent: Some(parent),
            index: Some(index),
        }
    }

    pub fn moved(target: StableId, parent: ParentRef, index: usize) -> Self {
        Self {
            target,
            action: TreeAction::Move,
            parent: Some(parent),
            index: Some(index),
        }
    }

    pub fn delete(target: StableId) -> Self {
        Self {
            target,
            action: TreeAction::Delete,
            parent: None,
            index: None,
        }
    }
}

/// A property value as found in a metadata map.
#[derive(Debug, Clone, PartialEq)]
pub enum RawProperty {
    /// JSON text, not yet parsed.
    Json(String),
    Removed,
    /// A value this crate never writes (non-string scalar or container).
    Unsupported,
}

/// Property changes on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEvent {
    pub target: StableId,
    pub updated: Vec<(String, RawProperty)>,
}

/// Everything one replica commit or import reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffBatch {
    pub origin: String,
    pub tree: Vec<TreeEvent>,
    pub props: Vec<PropertyEvent>,
}

impl DiffBatch {
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty() && self.props.is_empty()
    }

    pub fn is_local_echo(&self) -> bool {
        self.origin == LOCAL_ORIGIN
    }
}

/// A batch as queued by the subscription. Text containers cannot be read
/// from inside the event callback, so edited texts are only noted by owner
/// and read back in [`Replica::take_batches`].
struct Reported {
    batch: DiffBatch,
    texts: Vec<StableId>,
}

impl Reported {
    fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.texts.is_empty()
    }

    fn from_event(event: &DiffEvent<'_>) -> Self {
        let mut batch = DiffBatch {
            origin: event.origin.to_string(),
            ..Default::default()
        };
        let mut texts = Vec::new();
        for container in event.events.iter() {
            match &container.diff {
                Diff::Tree(tree) => {
                    for item in tree.diff.iter() {
                        let target = StableId::from(item.target);
                        let tree_event = match &item.action {
                            TreeExternalDiff::Create { parent, index, .. } => TreeEvent {
                                target,
                                action: TreeAction::Create,
                                parent: parent_ref(parent),
                                index: Some(*index as usize),
                            },
                            TreeExternalDiff::Move { parent, index, .. } => TreeEvent {
                                target,
                                action: TreeAction::Move,
                                parent: parent_ref(parent),
                                index: Some(*index as usize),
                            },
                            TreeExternalDiff::Delete { .. } => TreeEvent::delete(target),
                        };
                        batch.tree.push(tree_event);
                    }
                }
                Diff::Map(map) => {
                    let Some(owner) = meta_owner(container.target) else {
                        continue;
                    };
                    let mut updated = Vec::new();
                    for (key, value) in map.updated.iter() {
                        match value {
                            Some(ValueOrContainer::Container(Container::Text(_))) => {
                                texts.push(owner)
                            }
                            value => updated.push((key.to_string(), raw_property(value.as_ref()))),
                        }
                    }
                    if !updated.is_empty() {
                        batch.props.push(PropertyEvent {
                            target: owner,
                            updated,
                        });
                    }
                }
                Diff::Text(_) => {
                    // Nearest metadata map on the path owns the text.
                    let owner = container.path.iter().rev().find_map(|(id, _)| meta_owner(id));
                    match owner {
                        Some(owner) => texts.push(owner),
                        None => log::debug!("text edit outside node metadata ignored"),
                    }
                }
                _ => {}
            }
        }
        texts.dedup();
        Reported { batch, texts }
    }
}

fn parent_ref(parent: &TreeParentId) -> Option<ParentRef> {
    match parent {
        TreeParentId::Node(id) => Some(ParentRef::Node((*id).into())),
        TreeParentId::Root => Some(ParentRef::Root),
        _ => None,
    }
}

/// A tree node's metadata map is created by the node's own operation, so
/// its container id carries the node's (peer, counter).
fn meta_owner(target: &ContainerID) -> Option<StableId> {
    match target {
        ContainerID::Normal {
            peer,
            counter,
            container_type: ContainerType::Map,
        } => Some(StableId::new(*peer, *counter)),
        _ => None,
    }
}

fn raw_property(value: Option<&ValueOrContainer>) -> RawProperty {
    match value {
        None => RawProperty::Removed,
        Some(ValueOrContainer::Value(v)) => match v.as_string() {
            Some(s) => RawProperty::Json(s.to_string()),
            None => RawProperty::Unsupported,
        },
        Some(_) => RawProperty::Unsupported,
    }
}

/// Like [`raw_property`], but reads text containers. Not for event callbacks.
fn read_property(value: Option<&ValueOrContainer>) -> RawProperty {
    match value {
        Some(ValueOrContainer::Container(Container::Text(text))) => {
            RawProperty::Json(serde_json::Value::String(text.to_string()).to_string())
        }
        value => raw_property(value),
    }
}

// ───────────────────────────────────────────────────────────────────
// Replica
// ───────────────────────────────────────────────────────────────────

/// Snapshot of one live replicated node.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedNode {
    pub id: StableId,
    pub parent: ParentRef,
    pub index: usize,
    pub node_type: Option<String>,
    pub props: BTreeMap<String, RawProperty>,
}

/// A Loro document exposing the operations the sync engine needs.
pub struct Replica {
    doc: LoroDoc,
    tree: LoroTree,
    inbox: Arc<Mutex<Vec<Reported>>>,
    _subscription: Subscription,
}

impl Replica {
    pub fn new(peer: PeerId) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer)?;
        let tree = doc.get_tree(TREE_NAME);
        tree.enable_fractional_index(0);

        let inbox: Arc<Mutex<Vec<Reported>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        let subscription = doc.subscribe_root(Arc::new(move |event: DiffEvent| {
            let reported = Reported::from_event(&event);
            if reported.is_empty() {
                return;
            }
            if let Ok(mut queue) = sink.lock() {
                queue.push(reported);
            }
        }));

        Ok(Self {
            doc,
            tree,
            inbox,
            _subscription: subscription,
        })
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.doc.peer_id()
    }

    /// Underlying document, for the undo manager.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    // ── reads ───────────────────────────────────────────

    fn parent_id(parent: Option<StableId>) -> TreeParentId {
        match parent {
            Some(id) => TreeParentId::Node(id.into()),
            None => TreeParentId::Root,
        }
    }

    /// True if `id` exists and is not deleted.
    pub fn is_live(&self, id: StableId) -> bool {
        let target: TreeID = id.into();
        matches!(self.tree.is_node_deleted(&target), Ok(false))
    }

    /// Live children of `parent` (`None` = root) in sibling order.
    pub fn children(&self, parent: Option<StableId>) -> Vec<StableId> {
        self.tree
            .children(Self::parent_id(parent))
            .unwrap_or_default()
            .into_iter()
            .map(StableId::from)
            .collect()
    }

    pub fn parent(&self, id: StableId) -> Option<ParentRef> {
        if !self.is_live(id) {
            return None;
        }
        self.tree.parent(id.into()).as_ref().and_then(parent_ref)
    }

    pub fn index_of(&self, id: StableId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent.node()).iter().position(|c| *c == id)
    }

    /// Sibling immediately before `id`, if any.
    pub fn prev_sibling(&self, id: StableId) -> Option<StableId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent.node());
        let at = siblings.iter().position(|c| *c == id)?;
        at.checked_sub(1).map(|i| siblings[i])
    }

    fn meta(&self, id: StableId) -> Result<LoroMap> {
        self.tree
            .get_meta(id.into())
            .map_err(|e| SyncError::MappingNotFound(format!("replicated node {id}: {e}")))
    }

    fn raw_props(&self, meta: &LoroMap) -> BTreeMap<String, RawProperty> {
        let mut entries = Vec::new();
        meta.for_each(|key, value| entries.push((key.to_string(), value)));
        entries
            .into_iter()
            .map(|(key, value)| {
                let raw = read_property(Some(&value));
                (key, raw)
            })
            .collect()
    }

    /// Read a live node with its metadata. Property values are left encoded.
    pub fn node(&self, id: StableId) -> Option<ReplicatedNode> {
        let parent = self.parent(id)?;
        let index = self.index_of(id)?;
        let meta = self.meta(id).ok()?;
        let mut props = self.raw_props(&meta);
        let node_type = match props.remove(TYPE_KEY) {
            Some(RawProperty::Json(json)) => serde_json::from_str::<String>(&json).ok(),
            _ => None,
        };
        Some(ReplicatedNode {
            id,
            parent,
            index,
            node_type,
            props,
        })
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack = self.children(None);
        while let Some(id) = stack.pop() {
            count += 1;
            stack.extend(self.children(Some(id)));
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.children(None).is_empty()
    }

    // ── structural writes ───────────────────────────────

    /// Create a node under `parent` at `index` (clamped to the sibling count).
    pub fn create_node(&mut self, parent: Option<StableId>, index: usize) -> Result<StableId> {
        let len = self.children(parent).len();
        let id = self.tree.create_at(Self::parent_id(parent), index.min(len))?;
        Ok(id.into())
    }

    /// Move `id` under `parent`, directly after `after` or first if `None`.
    /// `after` must already be a child of `parent`.
    pub fn move_node(
        &mut self,
        id: StableId,
        parent: Option<StableId>,
        after: Option<StableId>,
    ) -> Result<()> {
        match after {
            Some(prev) => self.tree.mov_after(id.into(), prev.into())?,
            None => self.tree.mov_to(id.into(), Self::parent_id(parent), 0)?,
        }
        Ok(())
    }

    /// Delete `id` and its subtree. Returns `false` if it was already gone,
    /// which happens when a concurrent peer deleted it first.
    pub fn delete_node(&mut self, id: StableId) -> Result<bool> {
        let target: TreeID = id.into();
        match self.tree.is_node_deleted(&target) {
            Ok(false) => {
                self.tree.delete(target)?;
                Ok(true)
            }
            Ok(true) => {
                log::debug!(
                    "delete of {id} skipped: {}",
                    SyncError::ConcurrentDeleteRace(id)
                );
                Ok(false)
            }
            Err(e) => Err(SyncError::MappingNotFound(format!(
                "replicated node {id}: {e}"
            ))),
        }
    }

    // ── metadata writes ─────────────────────────────────

    /// Store the node type. No-op when unchanged.
    pub fn set_node_type(&mut self, id: StableId, node_type: &str) -> Result<bool> {
        let meta = self.meta(id)?;
        let encoded = serde_json::to_string(node_type).map_err(|e| SyncError::Serialization {
            node: id.to_string(),
            reason: e.to_string(),
        })?;
        let current = raw_property(meta.get(TYPE_KEY).as_ref());
        if current == RawProperty::Json(encoded.clone()) {
            return Ok(false);
        }
        meta.insert(TYPE_KEY, encoded)?;
        Ok(true)
    }

    /// Make the node's replicated properties equal to `props`, writing only
    /// keys whose encoded value changed and deleting keys no longer present.
    ///
    /// Every value is encoded before anything is written, so a failure
    /// leaves the stored properties untouched. Returns the number of keys
    /// written or deleted.
    pub fn write_props(
        &mut self,
        id: StableId,
        props: &PropertyMap,
        max_value_bytes: usize,
    ) -> Result<usize> {
        let mut encoded = Vec::with_capacity(props.len());
        for (key, value) in props {
            if key == TYPE_KEY {
                return Err(SyncError::Serialization {
                    node: id.to_string(),
                    reason: format!("`{TYPE_KEY}` is reserved"),
                });
            }
            let json = serde_json::to_string(value).map_err(|e| SyncError::Serialization {
                node: id.to_string(),
                reason: e.to_string(),
            })?;
            if json.len() > max_value_bytes {
                return Err(SyncError::Serialization {
                    node: id.to_string(),
                    reason: format!(
                        "`{key}` encodes to {} bytes (limit {max_value_bytes})",
                        json.len()
                    ),
                });
            }
            encoded.push((key.as_str(), json));
        }

        let meta = self.meta(id)?;
        let mut current = self.raw_props(&meta);
        current.remove(TYPE_KEY);

        let mut written = 0;
        for (key, json) in encoded {
            match current.remove(key) {
                Some(RawProperty::Json(existing)) if existing == json => {}
                _ => {
                    match props.get(key).and_then(|v| v.as_str()) {
                        Some(text) if key == TEXT_KEY => write_text(&meta, id, text)?,
                        _ => meta.insert(key, json)?,
                    }
                    written += 1;
                }
            }
        }
        for stale in current.keys() {
            meta.delete(stale)?;
            written += 1;
        }
        Ok(written)
    }

    // ── commits & sync ──────────────────────────────────

    /// Commit pending operations as one transaction tagged with `origin`.
    pub fn commit(&mut self, origin: &str) {
        self.doc.set_next_commit_origin(origin);
        self.doc.commit();
    }

    /// Import a remote update or snapshot.
    pub fn import(&mut self, bytes: &[u8]) -> Result<()> {
        self.doc
            .import(bytes)
            .map(|_| ())
            .map_err(|e| SyncError::Import(e.to_string()))
    }

    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| SyncError::Replica(e.to_string()))
    }

    /// Updates since `from`, or `None` if there are none.
    pub fn export_updates_since(&self, from: &VersionVector) -> Result<Option<Vec<u8>>> {
        let current = self.doc.oplog_vv();
        if *from == current {
            return Ok(None);
        }
        let bytes = self
            .doc
            .export(ExportMode::Updates {
                from: Cow::Owned(from.clone()),
            })
            .map_err(|e| SyncError::Replica(e.to_string()))?;
        Ok(Some(bytes))
    }

    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Drain every diff batch reported since the last call.
    pub fn take_batches(&self) -> Vec<DiffBatch> {
        let reported = self
            .inbox
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default();
        reported
            .into_iter()
            .map(|Reported { mut batch, texts }| {
                for owner in texts {
                    // Deleted nodes have no text worth reporting.
                    let Ok(meta) = self.meta(owner) else {
                        continue;
                    };
                    let raw = read_property(meta.get(TEXT_KEY).as_ref());
                    batch.props.push(PropertyEvent {
                        target: owner,
                        updated: vec![(TEXT_KEY.to_string(), raw)],
                    });
                }
                batch
            })
            .collect()
    }
}

/// Replace the node's text with `text`, diffed into character operations.
fn write_text(meta: &LoroMap, id: StableId, text: &str) -> Result<()> {
    let container = meta.get_or_create_container(TEXT_KEY, LoroText::new())?;
    container
        .update(text, Default::default())
        .map_err(|e| SyncError::Replica(format!("text update of {id} failed: {e:?}")))
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("peer", &self.peer())
            .field("nodes", &self.len())
            .finish()
    }
}
