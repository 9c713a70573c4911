//! Replica → local integration.
//!
//! Applies [`DiffBatch`]es reported by the replica to the local tree inside
//! one atomic update tagged [`UpdateTag::Collaboration`] (or
//! [`UpdateTag::Historic`] for undo/redo), so the propagator never echoes
//! them back.
//!
//! ```text
//!   for each batch:
//!     deletes ──► creates (parents first) ──► moves ──► properties
//!   then:
//!     reattach misplaced nodes ──► realign child order of touched parents
//! ```
//!
//! Replica events may name parents the local tree has not materialized
//! yet. A container with such a parent is placed under the root and moved
//! once the parent appears. A leaf cannot live under the root, so its
//! create is deferred and retried on every later pass.

use crate::cursor::{CursorTranslator, SelectionReference};
use crate::error::{Result, SyncError};
use crate::factory::NodeFactory;
use crate::id::{LocalHandle, StableId};
use crate::mapping::IdentityMapper;
use crate::node::{NodeKind, NodeKindVisitor, TEXT_KEY, TRANSIENT_PREFIX};
use crate::registry::NodeRegistry;
use crate::replica::{DiffBatch, ParentRef, PropertyEvent, RawProperty, Replica, TreeAction, TreeEvent};
use crate::tree::{LocalTree, TreeWriter, UpdateTag};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;

/// What one integration pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrationReport {
    pub created: usize,
    pub moved: usize,
    pub deleted: usize,
    pub props_updated: usize,
    /// Events that needed no work (duplicates, already-gone targets).
    pub skipped: usize,
    /// Leaf creates parked until their parent is materialized.
    pub deferred: usize,
    /// Events dropped as malformed or invalid.
    pub rejected: usize,
    /// Nodes moved from a fallback position to their real parent.
    pub reattached: usize,
    /// Parents whose child order was realigned with the replica.
    pub reordered: usize,
}

/// Order creates so that a node whose parent is created in the same set
/// comes after that parent. Relative order is otherwise preserved.
pub fn topological_order(ops: Vec<TreeEvent>) -> Vec<TreeEvent> {
    let parents: FxHashMap<StableId, Option<StableId>> = ops
        .iter()
        .map(|op| (op.target, op.parent.and_then(ParentRef::node)))
        .collect();

    let depth = |id: StableId| {
        let mut depth = 0;
        let mut current = parents.get(&id).copied().flatten();
        while let Some(parent) = current {
            // A cycle can only come from a malformed batch; cut it off.
            if depth > parents.len() {
                break;
            }
            match parents.get(&parent) {
                Some(next) => {
                    depth += 1;
                    current = *next;
                }
                None => break,
            }
        }
        depth
    };

    let mut keyed: Vec<(usize, TreeEvent)> =
        ops.into_iter().map(|op| (depth(op.target), op)).collect();
    keyed.sort_by_key(|(depth, _)| *depth);
    keyed.into_iter().map(|(_, op)| op).collect()
}

enum Fallback {
    /// Place under the root for now.
    Root,
    /// Wait for the parent.
    Defer,
}

struct UnresolvedParent;

impl NodeKindVisitor for UnresolvedParent {
    type Output = Fallback;

    fn visit_container(&mut self) -> Fallback {
        Fallback::Root
    }
    fn visit_text(&mut self) -> Fallback {
        Fallback::Defer
    }
    fn visit_opaque(&mut self) -> Fallback {
        Fallback::Defer
    }
}

pub struct Integrator {
    factory: NodeFactory,
    /// Leaf creates waiting for their parent.
    deferred: Vec<TreeEvent>,
    /// Nodes whose local parent differs from the replica parent.
    misplaced: FxHashSet<StableId>,
}

/// Borrowed state for one pass.
struct Pass<'w, 'a> {
    writer: &'w mut TreeWriter<'a>,
    mapping: &'w mut IdentityMapper,
    replica: &'w Replica,
    report: IntegrationReport,
    touched: FxHashSet<LocalHandle>,
}

impl Integrator {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            factory: NodeFactory::new(registry),
            deferred: Vec::new(),
            misplaced: FxHashSet::default(),
        }
    }

    /// Number of leaf creates still waiting for a parent.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Number of nodes sitting at a fallback position.
    pub fn misplaced_len(&self) -> usize {
        self.misplaced.len()
    }

    /// Integrate `batches` in order. Local echoes are ignored.
    pub fn integrate(
        &mut self,
        batches: &[DiffBatch],
        tree: &mut LocalTree,
        mapping: &mut IdentityMapper,
        replica: &Replica,
    ) -> Result<IntegrationReport> {
        self.run(UpdateTag::Collaboration, batches, tree, mapping, replica, None)
    }

    /// Integrate the batches produced by an undo or redo and restore the
    /// selection recorded with that step, in the same local update.
    pub fn integrate_history(
        &mut self,
        batches: &[DiffBatch],
        tree: &mut LocalTree,
        mapping: &mut IdentityMapper,
        replica: &Replica,
        restore: Option<&SelectionReference>,
    ) -> Result<IntegrationReport> {
        self.run(UpdateTag::Historic, batches, tree, mapping, replica, restore)
    }

    fn run(
        &mut self,
        tag: UpdateTag,
        batches: &[DiffBatch],
        tree: &mut LocalTree,
        mapping: &mut IdentityMapper,
        replica: &Replica,
        restore: Option<&SelectionReference>,
    ) -> Result<IntegrationReport> {
        let remote: Vec<&DiffBatch> = batches.iter().filter(|b| !b.is_local_echo()).collect();
        if remote.is_empty() && restore.is_none() {
            return Ok(IntegrationReport::default());
        }

        let (report, _) = tree.update(tag, |writer| {
            let mut pass = Pass {
                writer,
                mapping,
                replica,
                report: IntegrationReport::default(),
                touched: FxHashSet::default(),
            };
            for batch in &remote {
                self.apply_batch(batch, &mut pass);
            }
            self.reattach(&mut pass);
            let touched: Vec<LocalHandle> = pass.touched.iter().copied().collect();
            for parent in touched {
                align_children(parent, &mut pass);
            }
            if let Some(reference) = restore {
                let selection = CursorTranslator::new(pass.writer.tree(), pass.mapping)
                    .reference_to_selection(reference);
                if let Err(err) = pass.writer.set_selection(selection) {
                    log::debug!("selection not restored: {err}");
                }
            }
            Ok(pass.report)
        })?;

        if report != IntegrationReport::default() {
            log::debug!("integrated {} batch(es): {report:?}", remote.len());
        }
        Ok(report)
    }

    fn apply_batch(&mut self, batch: &DiffBatch, pass: &mut Pass<'_, '_>) {
        let mut creates = Vec::new();
        let mut moves = Vec::new();
        for event in &batch.tree {
            match event.action {
                TreeAction::Delete => self.apply_delete(event.target, pass),
                TreeAction::Create => creates.push(event.clone()),
                TreeAction::Move => moves.push(event.clone()),
            }
        }

        let mut retry = std::mem::take(&mut self.deferred);
        retry.retain_mut(|op| {
            if !pass.replica.is_live(op.target) {
                return false;
            }
            if let Some(parent) = pass.replica.parent(op.target) {
                op.parent = Some(parent);
            }
            true
        });
        retry.extend(creates);

        for op in topological_order(retry) {
            self.apply_create(&op, pass);
        }
        for op in &moves {
            self.apply_move(op, pass);
        }
        for event in &batch.props {
            apply_props(event, pass);
        }
    }

    fn apply_delete(&mut self, target: StableId, pass: &mut Pass<'_, '_>) {
        self.deferred.retain(|op| op.target != target);
        self.misplaced.remove(&target);

        let Some(handle) = pass.mapping.by_stable(target) else {
            log::debug!("delete of unmapped {target} ignored");
            pass.report.skipped += 1;
            return;
        };
        if !pass.writer.tree().contains(handle) {
            pass.mapping.remove_stable(target);
            pass.report.skipped += 1;
            return;
        }
        let doomed = pass.writer.tree().descendants(handle);
        match pass.writer.remove(handle) {
            Ok(()) => {
                for h in doomed {
                    if let Some(id) = pass.mapping.remove_local(h) {
                        self.misplaced.remove(&id);
                    }
                }
                pass.report.deleted += 1;
            }
            Err(err) => {
                log::warn!("cannot delete {handle} for {target}: {err}");
                pass.report.rejected += 1;
            }
        }
    }

    fn apply_create(&mut self, op: &TreeEvent, pass: &mut Pass<'_, '_>) {
        if pass.mapping.by_stable(op.target).is_some() {
            pass.report.skipped += 1;
            return;
        }
        let Some(node) = pass.replica.node(op.target) else {
            log::debug!("create of {} skipped: no longer live", op.target);
            pass.report.skipped += 1;
            return;
        };
        let blueprint = match self.factory.blueprint(&node) {
            Ok(blueprint) => blueprint,
            Err(err) => {
                log::warn!("rejecting create of {}: {err}", op.target);
                pass.report.rejected += 1;
                return;
            }
        };

        let parent_ref = op.parent.unwrap_or(node.parent);
        let parent = match resolve_parent(parent_ref, pass) {
            Resolved::Parent(parent) => parent,
            Resolved::Leaf(leaf) => match blueprint.kind.accept(&mut UnresolvedParent) {
                // Stays under the root unless a later move fixes it.
                Fallback::Root => {
                    log::warn!("{}; kept under root", leaf_parent(op.target, leaf));
                    LocalHandle::ROOT
                }
                Fallback::Defer => {
                    log::warn!("rejecting create: {}", leaf_parent(op.target, leaf));
                    pass.report.rejected += 1;
                    return;
                }
            },
            Resolved::Missing => match blueprint.kind.accept(&mut UnresolvedParent) {
                Fallback::Root => {
                    log::debug!("{} placed under root until {parent_ref:?} appears", op.target);
                    self.misplaced.insert(op.target);
                    LocalHandle::ROOT
                }
                Fallback::Defer => {
                    log::warn!(
                        "deferring create of {}: {}",
                        op.target,
                        SyncError::MappingNotFound(format!("parent {parent_ref:?}"))
                    );
                    self.deferred.push(op.clone());
                    pass.report.deferred += 1;
                    return;
                }
            },
        };

        let index = op.index.unwrap_or(node.index);
        match self.factory.materialize(pass.writer, parent, index, blueprint) {
            Ok(handle) => {
                pass.mapping.insert(handle, op.target);
                pass.touched.insert(parent);
                pass.report.created += 1;
            }
            Err(err) => {
                log::warn!("cannot materialize {}: {err}", op.target);
                pass.report.rejected += 1;
            }
        }
    }

    fn apply_move(&mut self, op: &TreeEvent, pass: &mut Pass<'_, '_>) {
        let Some(parent_ref) = op.parent else {
            log::warn!(
                "{}",
                SyncError::MalformedDiff(format!("move of {} has no live parent", op.target))
            );
            pass.report.rejected += 1;
            return;
        };
        let Some(handle) = pass.mapping.by_stable(op.target) else {
            if self.deferred.iter().any(|d| d.target == op.target) {
                return;
            }
            // Never materialized here; the move is as good as a create.
            let create = TreeEvent::create(op.target, parent_ref, op.index.unwrap_or(0));
            self.apply_create(&create, pass);
            return;
        };
        let Some(kind) = pass.writer.tree().node(handle).map(|n| n.kind()) else {
            pass.mapping.remove_stable(op.target);
            pass.report.skipped += 1;
            return;
        };

        let parent = match resolve_parent(parent_ref, pass) {
            Resolved::Parent(parent) => {
                self.misplaced.remove(&op.target);
                parent
            }
            Resolved::Leaf(leaf) => {
                self.misplaced.remove(&op.target);
                log::warn!("rejecting move: {}", leaf_parent(op.target, leaf));
                pass.report.rejected += 1;
                return;
            }
            Resolved::Missing => {
                self.misplaced.insert(op.target);
                match kind.accept(&mut UnresolvedParent) {
                    Fallback::Root => LocalHandle::ROOT,
                    Fallback::Defer => {
                        pass.report.deferred += 1;
                        return;
                    }
                }
            }
        };

        let index = op.index.unwrap_or(usize::MAX);
        if pass.writer.tree().parent(handle) == Some(parent)
            && pass.writer.tree().index_in_parent(handle) == Some(index)
        {
            return;
        }
        match pass.writer.move_node(handle, parent, index) {
            Ok(()) => {
                pass.touched.insert(parent);
                pass.report.moved += 1;
            }
            Err(err) => {
                log::warn!("cannot move {handle} for {}: {err}", op.target);
                pass.report.rejected += 1;
            }
        }
    }

    /// Move nodes from their fallback position once the replica parent is
    /// materialized.
    fn reattach(&mut self, pass: &mut Pass<'_, '_>) {
        let pending: Vec<StableId> = self.misplaced.iter().copied().collect();
        for id in pending {
            let Some(handle) = pass.mapping.by_stable(id) else {
                self.misplaced.remove(&id);
                continue;
            };
            let Some(parent_ref) = pass.replica.parent(id) else {
                self.misplaced.remove(&id);
                continue;
            };
            let parent = match resolve_parent(parent_ref, pass) {
                Resolved::Parent(parent) => parent,
                Resolved::Missing => continue,
                Resolved::Leaf(leaf) => {
                    log::warn!("{}; left in place", leaf_parent(id, leaf));
                    self.misplaced.remove(&id);
                    continue;
                }
            };
            let index = pass.replica.index_of(id).unwrap_or(usize::MAX);
            match pass.writer.move_node(handle, parent, index) {
                Ok(()) => {
                    self.misplaced.remove(&id);
                    pass.touched.insert(parent);
                    pass.report.reattached += 1;
                }
                Err(err) => log::warn!("cannot reattach {id}: {err}"),
            }
        }
    }
}

/// Where a replica parent lands in the local tree.
enum Resolved {
    Parent(LocalHandle),
    /// Not materialized yet.
    Missing,
    /// Materialized as a leaf, which can never hold children.
    Leaf(LocalHandle),
}

fn resolve_parent(parent: ParentRef, pass: &Pass<'_, '_>) -> Resolved {
    let id = match parent {
        ParentRef::Root => return Resolved::Parent(LocalHandle::ROOT),
        ParentRef::Node(id) => id,
    };
    let Some(handle) = pass.mapping.by_stable(id) else {
        return Resolved::Missing;
    };
    match pass.writer.tree().node(handle).map(|n| n.kind()) {
        Some(kind) if kind.is_container() => Resolved::Parent(handle),
        Some(_) => Resolved::Leaf(handle),
        None => Resolved::Missing,
    }
}

fn leaf_parent(target: StableId, leaf: LocalHandle) -> SyncError {
    SyncError::MalformedDiff(format!("{target} is placed under leaf {leaf}"))
}

/// Reorder `parent`'s children to match the replica's sibling order.
/// Local children unknown to the replica keep their relative order at the end.
fn align_children(parent: LocalHandle, pass: &mut Pass<'_, '_>) {
    let parent_id = if parent.is_root() {
        None
    } else {
        match pass.mapping.by_local(parent) {
            Some(id) => Some(id),
            None => return,
        }
    };
    let current = pass.writer.tree().children(parent).to_vec();
    let present: FxHashSet<LocalHandle> = current.iter().copied().collect();

    let mut order: Vec<LocalHandle> = pass
        .replica
        .children(parent_id)
        .into_iter()
        .filter_map(|id| pass.mapping.by_stable(id))
        .filter(|h| present.contains(h))
        .collect();
    let placed: FxHashSet<LocalHandle> = order.iter().copied().collect();
    order.extend(current.iter().copied().filter(|h| !placed.contains(h)));

    if order != current {
        match pass.writer.reorder_children(parent, order) {
            Ok(()) => pass.report.reordered += 1,
            Err(err) => log::warn!("cannot realign children of {parent}: {err}"),
        }
    }
}

fn apply_props(event: &PropertyEvent, pass: &mut Pass<'_, '_>) {
    let Some(handle) = pass.mapping.by_stable(event.target) else {
        log::debug!("property update for unmapped {} ignored", event.target);
        pass.report.skipped += 1;
        return;
    };
    let Some(kind) = pass.writer.tree().node(handle).map(|n| n.kind()) else {
        pass.report.skipped += 1;
        return;
    };

    let mut changed = false;
    for (key, raw) in &event.updated {
        if key.starts_with(TRANSIENT_PREFIX) {
            continue;
        }
        let result = match raw {
            RawProperty::Json(json) => match serde_json::from_str::<Value>(json) {
                Ok(value) if key == TEXT_KEY && kind == NodeKind::Text && !value.is_string() => {
                    Err(SyncError::MalformedDiff(format!(
                        "`{TEXT_KEY}` of {} is not a string",
                        event.target
                    )))
                }
                Ok(value) => pass.writer.set_prop(handle, key, value),
                Err(err) => Err(SyncError::MalformedDiff(format!(
                    "`{key}` of {}: {err}",
                    event.target
                ))),
            },
            RawProperty::Removed => pass.writer.remove_prop(handle, key),
            RawProperty::Unsupported => Err(SyncError::MalformedDiff(format!(
                "`{key}` of {} is not JSON text",
                event.target
            ))),
        };
        match result {
            Ok(()) => changed = true,
            Err(err) => {
                log::warn!("property update rejected: {err}");
                pass.report.rejected += 1;
            }
        }
    }
    if changed {
        pass.report.props_updated += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PropertyMap;
    use crate::replica::LOCAL_ORIGIN;
    use serde_json::json;

    /// Build a remote replica, then feed its nodes into a fresh local side
    /// through hand-ordered batches.
    struct Remote {
        replica: Replica,
    }

    impl Remote {
        fn new() -> Self {
            Self {
                replica: Replica::new(99).unwrap(),
            }
        }

        fn add(&mut self, parent: Option<StableId>, node_type: &str, props: PropertyMap) -> StableId {
            let index = self.replica.children(parent).len();
            let id = self.replica.create_node(parent, index).unwrap();
            self.replica.set_node_type(id, node_type).unwrap();
            self.replica.write_props(id, &props, 1 << 16).unwrap();
            id
        }
    }

    fn local() -> (LocalTree, IdentityMapper, Integrator) {
        let registry = Arc::new(NodeRegistry::with_defaults());
        (
            LocalTree::new(registry.clone()),
            IdentityMapper::new(),
            Integrator::new(registry),
        )
    }

    fn text(s: &str) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert(TEXT_KEY.into(), json!(s));
        props
    }

    fn batch(tree: Vec<TreeEvent>) -> DiffBatch {
        DiffBatch {
            origin: String::new(),
            tree,
            props: Vec::new(),
        }
    }

    // ── ordering ─────────────────────────────────────────

    #[test]
    fn test_topological_order_puts_parents_first() {
        let c = StableId::new(1, 0);
        let l1 = StableId::new(1, 1);
        let l2 = StableId::new(1, 2);
        let ops = vec![
            TreeEvent::create(l1, ParentRef::Node(c), 0),
            TreeEvent::create(l2, ParentRef::Node(c), 1),
            TreeEvent::create(c, ParentRef::Root, 0),
        ];
        let order: Vec<StableId> = topological_order(ops).iter().map(|op| op.target).collect();
        assert_eq!(order, vec![c, l1, l2]);
    }

    #[test]
    fn test_children_before_parent_are_integrated() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let l1 = remote.add(Some(c), "text", text("a"));
        let l2 = remote.add(Some(c), "text", text("b"));

        let (mut tree, mut mapping, mut integrator) = local();
        let b = batch(vec![
            TreeEvent::create(l1, ParentRef::Node(c), 0),
            TreeEvent::create(l2, ParentRef::Node(c), 1),
            TreeEvent::create(c, ParentRef::Root, 0),
        ]);
        let report = integrator
            .integrate(&[b], &mut tree, &mut mapping, &remote.replica)
            .unwrap();

        assert_eq!(report.created, 3);
        assert_eq!(report.deferred, 0);
        let ch = mapping.by_stable(c).unwrap();
        let kids: Vec<&str> = tree
            .children(ch)
            .iter()
            .map(|h| tree.node(*h).unwrap().text())
            .collect();
        assert_eq!(kids, vec!["a", "b"]);
    }

    // ── unresolved parents ───────────────────────────────

    #[test]
    fn test_leaf_with_missing_parent_is_deferred_then_retried() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let leaf = remote.add(Some(c), "text", text("late"));

        let (mut tree, mut mapping, mut integrator) = local();
        let first = batch(vec![TreeEvent::create(leaf, ParentRef::Node(c), 0)]);
        let report = integrator
            .integrate(&[first], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(integrator.deferred_len(), 1);
        assert!(tree.is_empty());

        let second = batch(vec![TreeEvent::create(c, ParentRef::Root, 0)]);
        let report = integrator
            .integrate(&[second], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(integrator.deferred_len(), 0);
        let ch = mapping.by_stable(c).unwrap();
        assert_eq!(tree.children(ch), &[mapping.by_stable(leaf).unwrap()]);
    }

    #[test]
    fn test_container_with_missing_parent_is_reattached() {
        let mut remote = Remote::new();
        let list = remote.add(None, "list", PropertyMap::new());
        let item = remote.add(Some(list), "listitem", PropertyMap::new());

        let (mut tree, mut mapping, mut integrator) = local();
        let first = batch(vec![TreeEvent::create(item, ParentRef::Node(list), 0)]);
        integrator
            .integrate(&[first], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        let ih = mapping.by_stable(item).unwrap();
        assert_eq!(tree.parent(ih), Some(LocalHandle::ROOT));
        assert_eq!(integrator.misplaced_len(), 1);

        let second = batch(vec![TreeEvent::create(list, ParentRef::Root, 0)]);
        let report = integrator
            .integrate(&[second], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.reattached, 1);
        let lh = mapping.by_stable(list).unwrap();
        assert_eq!(tree.parent(ih), Some(lh));
        assert_eq!(tree.children(LocalHandle::ROOT), &[lh]);
        assert_eq!(integrator.misplaced_len(), 0);
    }

    #[test]
    fn test_container_under_leaf_is_not_retried() {
        let mut remote = Remote::new();
        let leaf = remote.add(None, "text", text("x"));
        let block = remote.add(Some(leaf), "paragraph", PropertyMap::new());

        let (mut tree, mut mapping, mut integrator) = local();
        let create = batch(vec![
            TreeEvent::create(leaf, ParentRef::Root, 0),
            TreeEvent::create(block, ParentRef::Node(leaf), 0),
        ]);
        let report = integrator
            .integrate(&[create], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.created, 2);
        let bh = mapping.by_stable(block).unwrap();
        assert_eq!(tree.parent(bh), Some(LocalHandle::ROOT));
        assert_eq!(integrator.misplaced_len(), 0);

        // A container parked while the leaf was unknown is released once
        // the leaf shows up.
        let mut remote = Remote::new();
        let leaf = remote.add(None, "text", text("x"));
        let block = remote.add(Some(leaf), "paragraph", PropertyMap::new());
        let (mut tree, mut mapping, mut integrator) = local();
        let first = batch(vec![TreeEvent::create(block, ParentRef::Node(leaf), 0)]);
        integrator
            .integrate(&[first], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(integrator.misplaced_len(), 1);
        let second = batch(vec![TreeEvent::create(leaf, ParentRef::Root, 0)]);
        let report = integrator
            .integrate(&[second], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.reattached, 0);
        assert_eq!(integrator.misplaced_len(), 0);
        let bh = mapping.by_stable(block).unwrap();
        assert_eq!(tree.parent(bh), Some(LocalHandle::ROOT));
    }

    // ── deletes, duplicates, echoes ──────────────────────

    #[test]
    fn test_delete_removes_subtree_mappings() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let leaf = remote.add(Some(c), "text", text("x"));

        let (mut tree, mut mapping, mut integrator) = local();
        let create = batch(vec![
            TreeEvent::create(c, ParentRef::Root, 0),
            TreeEvent::create(leaf, ParentRef::Node(c), 0),
        ]);
        integrator
            .integrate(&[create], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(mapping.len(), 2);

        let delete = batch(vec![TreeEvent::delete(c)]);
        let report = integrator
            .integrate(&[delete], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(mapping.is_empty());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_delete_of_unknown_node_is_noop() {
        let remote = Remote::new();
        let (mut tree, mut mapping, mut integrator) = local();
        let report = integrator
            .integrate(
                &[batch(vec![TreeEvent::delete(StableId::new(5, 5))])],
                &mut tree,
                &mut mapping,
                &remote.replica,
            )
            .unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_duplicate_create_is_skipped() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let (mut tree, mut mapping, mut integrator) = local();
        let b = batch(vec![TreeEvent::create(c, ParentRef::Root, 0)]);
        integrator
            .integrate(&[b.clone(), b], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(tree.children(LocalHandle::ROOT).len(), 1);
    }

    #[test]
    fn test_local_echo_ignored() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let (mut tree, mut mapping, mut integrator) = local();
        let mut b = batch(vec![TreeEvent::create(c, ParentRef::Root, 0)]);
        b.origin = LOCAL_ORIGIN.to_string();
        let report = integrator
            .integrate(&[b], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report, IntegrationReport::default());
        assert!(tree.is_empty());
    }

    // ── properties ───────────────────────────────────────

    #[test]
    fn test_property_updates_and_malformed_values() {
        let mut remote = Remote::new();
        let c = remote.add(None, "paragraph", PropertyMap::new());
        let leaf = remote.add(Some(c), "text", text("old"));
        let (mut tree, mut mapping, mut integrator) = local();
        integrator
            .integrate(
                &[batch(vec![
                    TreeEvent::create(c, ParentRef::Root, 0),
                    TreeEvent::create(leaf, ParentRef::Node(c), 0),
                ])],
                &mut tree,
                &mut mapping,
                &remote.replica,
            )
            .unwrap();

        let props = DiffBatch {
            origin: String::new(),
            tree: Vec::new(),
            props: vec![PropertyEvent {
                target: leaf,
                updated: vec![
                    (TEXT_KEY.to_string(), RawProperty::Json("\"new\"".into())),
                    ("format".to_string(), RawProperty::Json("{broken".into())),
                ],
            }],
        };
        let report = integrator
            .integrate(&[props], &mut tree, &mut mapping, &remote.replica)
            .unwrap();
        assert_eq!(report.props_updated, 1);
        assert_eq!(report.rejected, 1);
        let lh = mapping.by_stable(leaf).unwrap();
        assert_eq!(tree.node(lh).unwrap().text(), "new");
        assert!(tree.node(lh).unwrap().prop("format").is_none());
    }

    #[test]
    fn test_child_order_follows_replica() {
        let mut remote = Remote::new();
        let a = remote.add(None, "paragraph", PropertyMap::new());
        let b = remote.add(None, "quote", PropertyMap::new());
        let (mut tree, mut mapping, mut integrator) = local();
        // Indices in the events disagree with the final replica order.
        integrator
            .integrate(
                &[batch(vec![
                    TreeEvent::create(b, ParentRef::Root, 0),
                    TreeEvent::create(a, ParentRef::Root, 0),
                ])],
                &mut tree,
                &mut mapping,
                &remote.replica,
            )
            .unwrap();
        let order: Vec<&str> = tree
            .children(LocalHandle::ROOT)
            .iter()
            .map(|h| tree.node(*h).unwrap().node_type())
            .collect();
        assert_eq!(order, vec!["paragraph", "quote"]);
    }
}
