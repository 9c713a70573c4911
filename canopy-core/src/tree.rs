//! Local editable tree.
//!
//! An arena of [`LocalNode`]s rooted at [`LocalHandle::ROOT`]. All edits run
//! inside [`LocalTree::update`], which is atomic: if the closure fails, the
//! tree and its selection are restored and nothing is reported.
//!
//! ```text
//!   update(tag, |writer| { ... })
//!         │
//!         ├── Ok  ──► (value, MutationBatch { tag, records, selection before/after })
//!         └── Err ──► tree restored, error returned
//! ```
//!
//! Mutations are coalesced per node within one update: a node created and
//! destroyed in the same update produces no record, and a node created and
//! then edited is reported once as created.

use crate::error::{Result, SyncError};
use crate::id::LocalHandle;
use crate::node::{LocalNode, NodeKind, PropertyMap, TEXT_KEY};
use crate::registry::NodeRegistry;
use crate::selection::{Point, PointType, Selection};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

// ───────────────────────────────────────────────────────────────────
// Mutation records
// ───────────────────────────────────────────────────────────────────

/// Who produced an update. Only [`UpdateTag::Local`] batches are
/// propagated to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateTag {
    /// A user edit.
    Local,
    /// Integration of remote replica changes.
    Collaboration,
    /// Restoration of an undo or redo step.
    Historic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Created,
    Updated,
    Destroyed,
}

/// One coalesced change to one node.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub handle: LocalHandle,
    pub kind: MutationKind,
    pub node_type: String,
    pub class: NodeKind,
    /// Distance from the root (root children have depth 1). For destroyed
    /// nodes this is the depth they had when removed.
    pub depth: usize,
}

/// Everything that changed during one [`LocalTree::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatch {
    pub tag: UpdateTag,
    pub records: Vec<MutationRecord>,
    pub selection_before: Option<Selection>,
    pub selection_after: Option<Selection>,
}

impl MutationBatch {
    pub fn selection_changed(&self) -> bool {
        self.selection_before != self.selection_after
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && !self.selection_changed()
    }
}

struct LogEntry {
    kind: MutationKind,
    node_type: String,
    class: NodeKind,
    depth: usize,
}

#[derive(Default)]
struct MutationLog {
    order: Vec<LocalHandle>,
    entries: FxHashMap<LocalHandle, LogEntry>,
}

impl MutationLog {
    fn created(&mut self, node: &LocalNode) {
        self.entries.insert(
            node.handle,
            LogEntry {
                kind: MutationKind::Created,
                node_type: node.node_type.clone(),
                class: node.kind,
                depth: 0,
            },
        );
        self.order.push(node.handle);
    }

    fn updated(&mut self, node: &LocalNode) {
        if self.entries.contains_key(&node.handle) {
            return;
        }
        self.entries.insert(
            node.handle,
            LogEntry {
                kind: MutationKind::Updated,
                node_type: node.node_type.clone(),
                class: node.kind,
                depth: 0,
            },
        );
        self.order.push(node.handle);
    }

    fn destroyed(&mut self, node: &LocalNode, depth: usize) {
        let handle = node.handle;
        match self.entries.get_mut(&handle) {
            Some(entry) if entry.kind == MutationKind::Created => {
                self.entries.remove(&handle);
                self.order.retain(|h| *h != handle);
            }
            Some(entry) => {
                entry.kind = MutationKind::Destroyed;
                entry.depth = depth;
            }
            None => {
                self.entries.insert(
                    handle,
                    LogEntry {
                        kind: MutationKind::Destroyed,
                        node_type: node.node_type.clone(),
                        class: node.kind,
                        depth,
                    },
                );
                self.order.push(handle);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tree
// ───────────────────────────────────────────────────────────────────

/// The local editable tree.
#[derive(Debug, Clone)]
pub struct LocalTree {
    registry: Arc<NodeRegistry>,
    nodes: FxHashMap<LocalHandle, LocalNode>,
    next_handle: u64,
    selection: Option<Selection>,
}

impl LocalTree {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(
            LocalHandle::ROOT,
            LocalNode::new(
                LocalHandle::ROOT,
                "root".to_string(),
                NodeKind::Container,
                None,
                PropertyMap::new(),
            ),
        );
        Self {
            registry,
            nodes,
            next_handle: 1,
            selection: None,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    #[inline]
    pub fn node(&self, handle: LocalHandle) -> Option<&LocalNode> {
        self.nodes.get(&handle)
    }

    #[inline]
    pub fn contains(&self, handle: LocalHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    pub fn root(&self) -> &LocalNode {
        &self.nodes[&LocalHandle::ROOT]
    }

    /// Children of `handle`; empty for leaves and unknown handles.
    pub fn children(&self, handle: LocalHandle) -> &[LocalHandle] {
        self.nodes
            .get(&handle)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn parent(&self, handle: LocalHandle) -> Option<LocalHandle> {
        self.nodes.get(&handle).and_then(|n| n.parent)
    }

    pub fn index_in_parent(&self, handle: LocalHandle) -> Option<usize> {
        let parent = self.parent(handle)?;
        self.children(parent).iter().position(|h| *h == handle)
    }

    /// Distance from the root, `None` for unknown handles.
    pub fn depth(&self, handle: LocalHandle) -> Option<usize> {
        let mut node = self.nodes.get(&handle)?;
        let mut depth = 0;
        while let Some(parent) = node.parent {
            depth += 1;
            node = self.nodes.get(&parent)?;
        }
        Some(depth)
    }

    /// True if `ancestor` is `node` or lies on its parent chain.
    pub fn is_ancestor(&self, ancestor: LocalHandle, node: LocalHandle) -> bool {
        let mut current = Some(node);
        while let Some(handle) = current {
            if handle == ancestor {
                return true;
            }
            current = self.parent(handle);
        }
        false
    }

    /// `handle` and all its descendants in pre-order.
    pub fn descendants(&self, handle: LocalHandle) -> Vec<LocalHandle> {
        let mut out = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if let Some(node) = self.nodes.get(&h) {
                out.push(h);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().children.is_empty()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Canonical JSON rendering used to compare trees across peers.
    /// Handles are not included.
    pub fn to_value(&self) -> Value {
        self.node_value(LocalHandle::ROOT)
    }

    fn node_value(&self, handle: LocalHandle) -> Value {
        let Some(node) = self.nodes.get(&handle) else {
            return Value::Null;
        };
        let props: serde_json::Map<String, Value> = node
            .props
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let children: Vec<Value> = node.children.iter().map(|c| self.node_value(*c)).collect();
        serde_json::json!({
            "type": node.node_type,
            "props": props,
            "children": children,
        })
    }

    pub(crate) fn point_is_valid(&self, point: &Point) -> bool {
        let Some(node) = self.nodes.get(&point.node) else {
            return false;
        };
        match (point.kind, node.kind) {
            (PointType::Text, NodeKind::Text) => point.offset <= node.text_len(),
            (PointType::Text, _) => false,
            (PointType::Element, NodeKind::Container) => point.offset <= node.children.len(),
            (PointType::Element, _) => point.offset <= 1,
        }
    }

    /// Run `f` as one atomic update.
    ///
    /// On success returns the closure's value and the coalesced batch of
    /// mutations. On failure the tree is restored to its prior state.
    pub fn update<R>(
        &mut self,
        tag: UpdateTag,
        f: impl FnOnce(&mut TreeWriter<'_>) -> Result<R>,
    ) -> Result<(R, MutationBatch)> {
        let saved_nodes = self.nodes.clone();
        let saved_next = self.next_handle;
        let selection_before = self.selection;

        let mut writer = TreeWriter {
            tree: self,
            log: MutationLog::default(),
        };
        let outcome = f(&mut writer);
        let log = writer.log;

        match outcome {
            Ok(value) => {
                self.normalize_selection();
                let records = self.seal(log);
                Ok((
                    value,
                    MutationBatch {
                        tag,
                        records,
                        selection_before,
                        selection_after: self.selection,
                    },
                ))
            }
            Err(err) => {
                self.nodes = saved_nodes;
                self.next_handle = saved_next;
                self.selection = selection_before;
                Err(err)
            }
        }
    }

    fn seal(&self, log: MutationLog) -> Vec<MutationRecord> {
        let MutationLog { order, mut entries } = log;
        let mut records = Vec::with_capacity(order.len());
        for handle in order {
            let Some(entry) = entries.remove(&handle) else {
                continue;
            };
            let depth = match entry.kind {
                MutationKind::Destroyed => entry.depth,
                _ => match self.depth(handle) {
                    Some(depth) => depth,
                    None => continue,
                },
            };
            records.push(MutationRecord {
                handle,
                kind: entry.kind,
                node_type: entry.node_type,
                class: entry.class,
                depth,
            });
        }
        records
    }

    fn normalize_selection(&mut self) {
        let Some(selection) = self.selection else {
            return;
        };
        let anchor = self.clamp_point(selection.anchor);
        let focus = self.clamp_point(selection.focus);
        self.selection = match (anchor, focus) {
            (Some(anchor), Some(focus)) => Some(Selection { anchor, focus }),
            _ => None,
        };
    }

    fn clamp_point(&self, point: Point) -> Option<Point> {
        let node = self.nodes.get(&point.node)?;
        let limit = match (point.kind, node.kind) {
            (PointType::Text, NodeKind::Text) => node.text_len(),
            (PointType::Text, _) => return None,
            (PointType::Element, NodeKind::Container) => node.children.len(),
            (PointType::Element, _) => 1,
        };
        Some(Point {
            offset: point.offset.min(limit),
            ..point
        })
    }

    fn allocate(&mut self) -> LocalHandle {
        let handle = LocalHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

// ───────────────────────────────────────────────────────────────────
// Writer
// ───────────────────────────────────────────────────────────────────

/// Mutable access to the tree inside [`LocalTree::update`].
pub struct TreeWriter<'a> {
    tree: &'a mut LocalTree,
    log: MutationLog,
}

impl<'a> TreeWriter<'a> {
    /// Read-only view of the tree as it currently stands.
    #[inline]
    pub fn tree(&self) -> &LocalTree {
        self.tree
    }

    fn node_mut(&mut self, handle: LocalHandle) -> Result<&mut LocalNode> {
        self.tree
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| SyncError::InvalidTreeOperation(format!("unknown node {handle}")))
    }

    fn container(&self, handle: LocalHandle) -> Result<&LocalNode> {
        match self.tree.nodes.get(&handle) {
            Some(node) if node.kind.is_container() => Ok(node),
            Some(node) => Err(SyncError::InvalidTreeOperation(format!(
                "{handle} ({}) cannot hold children",
                node.node_type
            ))),
            None => Err(SyncError::InvalidTreeOperation(format!("unknown node {handle}"))),
        }
    }

    /// Insert a new node of `node_type` at `index` under `parent`.
    /// Indices past the end append.
    pub fn insert(
        &mut self,
        parent: LocalHandle,
        index: usize,
        node_type: &str,
        props: PropertyMap,
    ) -> Result<LocalHandle> {
        let kind = self.tree.registry.require(node_type)?.kind;
        let len = self.container(parent)?.children.len();

        let handle = self.tree.allocate();
        let node = LocalNode::new(handle, node_type.to_string(), kind, Some(parent), props);
        self.log.created(&node);
        self.tree.nodes.insert(handle, node);
        self.node_mut(parent)?.children.insert(index.min(len), handle);
        Ok(handle)
    }

    /// Insert as the last child of `parent`.
    pub fn append(
        &mut self,
        parent: LocalHandle,
        node_type: &str,
        props: PropertyMap,
    ) -> Result<LocalHandle> {
        self.insert(parent, usize::MAX, node_type, props)
    }

    /// Remove `handle` together with its subtree.
    pub fn remove(&mut self, handle: LocalHandle) -> Result<()> {
        if handle.is_root() {
            return Err(SyncError::InvalidTreeOperation("cannot remove the root".into()));
        }
        let parent = self
            .tree
            .parent(handle)
            .ok_or_else(|| SyncError::InvalidTreeOperation(format!("unknown node {handle}")))?;
        let base_depth = self.tree.depth(handle).unwrap_or(1);

        let doomed = self.tree.descendants(handle);
        for h in &doomed {
            let depth = base_depth + self.relative_depth(*h, handle);
            if let Some(node) = self.tree.nodes.get(h) {
                self.log.destroyed(node, depth);
            }
        }
        for h in doomed {
            self.tree.nodes.remove(&h);
        }
        self.node_mut(parent)?.children.retain(|c| *c != handle);
        Ok(())
    }

    fn relative_depth(&self, node: LocalHandle, top: LocalHandle) -> usize {
        let mut depth = 0;
        let mut current = node;
        while current != top {
            match self.tree.parent(current) {
                Some(parent) => current = parent,
                None => break,
            }
            depth += 1;
        }
        depth
    }

    /// Move `handle` so that it ends up at `index` among `new_parent`'s children.
    pub fn move_node(
        &mut self,
        handle: LocalHandle,
        new_parent: LocalHandle,
        index: usize,
    ) -> Result<()> {
        if handle.is_root() {
            return Err(SyncError::InvalidTreeOperation("cannot move the root".into()));
        }
        self.container(new_parent)?;
        if self.tree.is_ancestor(handle, new_parent) {
            return Err(SyncError::InvalidTreeOperation(format!(
                "moving {handle} under {new_parent} would create a cycle"
            )));
        }
        let old_parent = self
            .tree
            .parent(handle)
            .ok_or_else(|| SyncError::InvalidTreeOperation(format!("unknown node {handle}")))?;

        self.node_mut(old_parent)?.children.retain(|c| *c != handle);
        let siblings = &mut self.node_mut(new_parent)?.children;
        let at = index.min(siblings.len());
        siblings.insert(at, handle);

        let node = self.node_mut(handle)?;
        node.parent = Some(new_parent);
        let node = node.clone();
        self.log.updated(&node);
        Ok(())
    }

    /// Replace the child order of `parent`. `order` must be a permutation of
    /// the current children.
    pub fn reorder_children(&mut self, parent: LocalHandle, order: Vec<LocalHandle>) -> Result<()> {
        let current = &self.container(parent)?.children;
        let mut a = current.clone();
        let mut b = order.clone();
        a.sort_unstable();
        b.sort_unstable();
        if a != b {
            return Err(SyncError::InvalidTreeOperation(format!(
                "reorder of {parent} is not a permutation of its children"
            )));
        }
        if *current == order {
            return Ok(());
        }
        self.node_mut(parent)?.children = order;
        let node = self.node_mut(parent)?.clone();
        self.log.updated(&node);
        Ok(())
    }

    pub fn set_prop(&mut self, handle: LocalHandle, key: &str, value: Value) -> Result<()> {
        let node = self.node_mut(handle)?;
        if node.props.get(key) == Some(&value) {
            return Ok(());
        }
        node.props.insert(key.to_string(), value);
        let node = node.clone();
        self.log.updated(&node);
        Ok(())
    }

    pub fn remove_prop(&mut self, handle: LocalHandle, key: &str) -> Result<()> {
        let node = self.node_mut(handle)?;
        if node.props.remove(key).is_none() {
            return Ok(());
        }
        let node = node.clone();
        self.log.updated(&node);
        Ok(())
    }

    fn text_node(&mut self, handle: LocalHandle) -> Result<&mut LocalNode> {
        let node = self.node_mut(handle)?;
        if node.kind != NodeKind::Text {
            return Err(SyncError::InvalidTreeOperation(format!(
                "{handle} ({}) has no text content",
                node.node_type
            )));
        }
        Ok(node)
    }

    /// Replace the content of a text leaf.
    pub fn set_text(&mut self, handle: LocalHandle, text: &str) -> Result<()> {
        self.text_node(handle)?;
        self.set_prop(handle, TEXT_KEY, Value::String(text.to_string()))
    }

    /// Insert `text` at character `offset` of a text leaf.
    pub fn insert_text(&mut self, handle: LocalHandle, offset: usize, text: &str) -> Result<()> {
        let node = self.text_node(handle)?;
        let mut content = node.text().to_string();
        let at = byte_index(&content, offset);
        content.insert_str(at, text);
        self.set_prop(handle, TEXT_KEY, Value::String(content))
    }

    /// Delete `len` characters starting at character `offset`.
    pub fn delete_text(&mut self, handle: LocalHandle, offset: usize, len: usize) -> Result<()> {
        let node = self.text_node(handle)?;
        let mut content = node.text().to_string();
        let start = byte_index(&content, offset);
        let end = byte_index(&content, offset.saturating_add(len));
        content.replace_range(start..end, "");
        self.set_prop(handle, TEXT_KEY, Value::String(content))
    }

    /// Set or clear the selection. Points must address existing nodes.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<()> {
        if let Some(sel) = &selection {
            for point in [&sel.anchor, &sel.focus] {
                if !self.tree.point_is_valid(point) {
                    return Err(SyncError::InvalidTreeOperation(format!(
                        "selection point {}:{} is out of range",
                        point.node, point.offset
                    )));
                }
            }
        }
        self.tree.selection = selection;
        Ok(())
    }
}

fn byte_index(s: &str, char_offset: usize) -> usize {
    s.char_indices()
        .nth(char_offset)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tree() -> LocalTree {
        LocalTree::new(Arc::new(NodeRegistry::with_defaults()))
    }

    fn text(s: &str) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert(TEXT_KEY.into(), json!(s));
        props
    }

    // ── update / rollback ───────────────────────────────

    #[test]
    fn test_insert_reports_created_with_depth() {
        let mut t = tree();
        let ((p, leaf), batch) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let leaf = w.append(p, "text", text("hi"))?;
                Ok((p, leaf))
            })
            .unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0].handle, p);
        assert_eq!(batch.records[0].depth, 1);
        assert_eq!(batch.records[1].handle, leaf);
        assert_eq!(batch.records[1].depth, 2);
        assert!(batch.records.iter().all(|r| r.kind == MutationKind::Created));
        assert_eq!(t.children(p), &[leaf]);
    }

    #[test]
    fn test_failed_update_rolls_back() {
        let mut t = tree();
        let result = t.update(UpdateTag::Local, |w| {
            w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
            w.append(LocalHandle::ROOT, "no-such-type", PropertyMap::new())
        });
        assert!(matches!(result, Err(SyncError::UnknownNodeType(_))));
        assert_eq!(t.len(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_create_then_destroy_coalesces_away() {
        let mut t = tree();
        let (_, batch) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                w.remove(p)
            })
            .unwrap();
        assert!(batch.records.is_empty());
    }

    #[test]
    fn test_created_then_edited_reports_once() {
        let mut t = tree();
        let (_, batch) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                w.set_prop(p, "align", json!("center"))
            })
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].kind, MutationKind::Created);
    }

    #[test]
    fn test_remove_subtree_records_depths() {
        let mut t = tree();
        let ((p, leaf), _) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let leaf = w.append(p, "text", text("x"))?;
                Ok((p, leaf))
            })
            .unwrap();

        let (_, batch) = t.update(UpdateTag::Local, |w| w.remove(p)).unwrap();
        assert_eq!(batch.records.len(), 2);
        let leaf_rec = batch.records.iter().find(|r| r.handle == leaf).unwrap();
        assert_eq!(leaf_rec.kind, MutationKind::Destroyed);
        assert_eq!(leaf_rec.depth, 2);
        assert!(!t.contains(leaf));
    }

    // ── structure ───────────────────────────────────────

    #[test]
    fn test_move_rejects_cycles() {
        let mut t = tree();
        let ((outer, inner), _) = t
            .update(UpdateTag::Local, |w| {
                let outer = w.append(LocalHandle::ROOT, "list", PropertyMap::new())?;
                let inner = w.append(outer, "listitem", PropertyMap::new())?;
                Ok((outer, inner))
            })
            .unwrap();
        let err = t.update(UpdateTag::Local, |w| w.move_node(outer, inner, 0));
        assert!(matches!(err, Err(SyncError::InvalidTreeOperation(_))));
        assert_eq!(t.parent(inner), Some(outer));
    }

    #[test]
    fn test_leaves_cannot_hold_children() {
        let mut t = tree();
        let err = t.update(UpdateTag::Local, |w| {
            let leaf = w.append(LocalHandle::ROOT, "image", PropertyMap::new())?;
            w.append(leaf, "text", text("x"))
        });
        assert!(matches!(err, Err(SyncError::InvalidTreeOperation(_))));
    }

    #[test]
    fn test_move_within_parent() {
        let mut t = tree();
        let ((a, b, c), _) = t
            .update(UpdateTag::Local, |w| {
                let a = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let b = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let c = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                Ok((a, b, c))
            })
            .unwrap();
        let (_, batch) = t
            .update(UpdateTag::Local, |w| w.move_node(a, LocalHandle::ROOT, 2))
            .unwrap();
        assert_eq!(t.children(LocalHandle::ROOT), &[b, c, a]);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].kind, MutationKind::Updated);
    }

    // ── text & selection ────────────────────────────────

    #[test]
    fn test_text_editing_uses_char_offsets() {
        let mut t = tree();
        let (leaf, _) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                w.append(p, "text", text("héllo"))
            })
            .unwrap();
        t.update(UpdateTag::Local, |w| {
            w.insert_text(leaf, 2, "XY")?;
            w.delete_text(leaf, 0, 1)
        })
        .unwrap();
        assert_eq!(t.node(leaf).unwrap().text(), "éXYllo");
    }

    #[test]
    fn test_selection_cleared_when_node_removed() {
        let mut t = tree();
        let (leaf, _) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let leaf = w.append(p, "text", text("abc"))?;
                w.set_selection(Some(Selection::collapsed(Point::text(leaf, 2))))?;
                Ok(leaf)
            })
            .unwrap();
        assert!(t.selection().is_some());

        let (_, batch) = t.update(UpdateTag::Local, |w| w.remove(leaf)).unwrap();
        assert!(t.selection().is_none());
        assert!(batch.selection_changed());
    }

    #[test]
    fn test_selection_clamped_after_text_shrinks() {
        let mut t = tree();
        let (leaf, _) = t
            .update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
                let leaf = w.append(p, "text", text("abcdef"))?;
                w.set_selection(Some(Selection::collapsed(Point::text(leaf, 6))))?;
                Ok(leaf)
            })
            .unwrap();
        t.update(UpdateTag::Local, |w| w.set_text(leaf, "ab")).unwrap();
        assert_eq!(t.selection().unwrap().focus.offset, 2);
    }

    #[test]
    fn test_invalid_selection_rejected() {
        let mut t = tree();
        let err = t.update(UpdateTag::Local, |w| {
            w.set_selection(Some(Selection::collapsed(Point::element(LocalHandle::ROOT, 3))))
        });
        assert!(err.is_err());
    }

    #[test]
    fn test_to_value_ignores_handles() {
        let mut a = tree();
        let mut b = tree();
        // Burn a handle on `b` so the two trees allocate differently.
        b.update(UpdateTag::Local, |w| {
            let p = w.append(LocalHandle::ROOT, "paragraph", PropertyMap::new())?;
            w.remove(p)
        })
        .unwrap();
        for t in [&mut a, &mut b] {
            t.update(UpdateTag::Local, |w| {
                let p = w.append(LocalHandle::ROOT, "heading", PropertyMap::new())?;
                w.append(p, "text", text("Title"))
            })
            .unwrap();
        }
        assert_eq!(a.to_value(), b.to_value());
    }
}
