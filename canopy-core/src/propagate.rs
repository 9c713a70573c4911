//! Local → replica propagation.
//!
//! Turns a [`MutationBatch`] from a local update into replica operations:
//!
//! ```text
//!   records ──► live containers (by depth) ──► live leaves ──► destroyed (by depth)
//!                   │                              │                 │
//!                   ▼                              ▼                 ▼
//!           create / move + write props    create / move + props   delete
//! ```
//!
//! Parents are always placed before their children, so a child's replica
//! parent exists by the time the child is created. Deletions run last so a
//! node moved out of a destroyed container in the same batch survives.
//!
//! Nothing is committed here; the session decides when.

use crate::error::{Result, SyncError};
use crate::id::{LocalHandle, StableId};
use crate::mapping::IdentityMapper;
use crate::node::NodeKindVisitor;
use crate::registry::NodeRegistry;
use crate::replica::{ParentRef, Replica};
use crate::tree::{LocalTree, MutationBatch, MutationKind, MutationRecord, UpdateTag};
use std::sync::Arc;

/// Counts of replica operations issued for one batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PropagationReport {
    pub created: usize,
    pub updated: usize,
    pub moved: usize,
    pub deleted: usize,
    /// Records that could not be propagated, with the reason.
    pub skipped: Vec<(LocalHandle, SyncError)>,
}

impl PropagationReport {
    /// True if anything was written to the replica.
    pub fn has_ops(&self) -> bool {
        self.created + self.updated + self.moved + self.deleted > 0
    }
}

#[derive(PartialEq, Eq)]
enum Phase {
    Structure,
    Content,
}

struct PhaseOf;

impl NodeKindVisitor for PhaseOf {
    type Output = Phase;

    fn visit_container(&mut self) -> Phase {
        Phase::Structure
    }
    fn visit_text(&mut self) -> Phase {
        Phase::Content
    }
    fn visit_opaque(&mut self) -> Phase {
        Phase::Content
    }
}

pub struct Propagator {
    registry: Arc<NodeRegistry>,
    max_property_bytes: usize,
}

impl Propagator {
    pub fn new(registry: Arc<NodeRegistry>, max_property_bytes: usize) -> Self {
        Self {
            registry,
            max_property_bytes,
        }
    }

    /// Apply `batch` to the replica. Only local batches are propagated.
    ///
    /// Per-record failures are logged and listed in the report; they never
    /// abort the rest of the batch.
    pub fn propagate(
        &self,
        batch: &MutationBatch,
        tree: &LocalTree,
        mapping: &mut IdentityMapper,
        replica: &mut Replica,
    ) -> PropagationReport {
        let mut report = PropagationReport::default();
        if batch.tag != UpdateTag::Local {
            return report;
        }

        let (destroyed, live): (Vec<&MutationRecord>, Vec<&MutationRecord>) = batch
            .records
            .iter()
            .partition(|r| r.kind == MutationKind::Destroyed);
        let (mut containers, leaves): (Vec<&MutationRecord>, Vec<&MutationRecord>) = live
            .into_iter()
            .partition(|r| r.class.accept(&mut PhaseOf) == Phase::Structure);
        containers.sort_by_key(|r| r.depth);
        let mut destroyed = destroyed;
        destroyed.sort_by_key(|r| (r.class.accept(&mut PhaseOf) == Phase::Content, r.depth));

        for record in containers.into_iter().chain(leaves).chain(destroyed) {
            if let Err(err) = self.apply_record(record, tree, mapping, replica, &mut report) {
                if err.is_soft() {
                    log::warn!("skipping {} ({}): {err}", record.handle, record.node_type);
                } else {
                    log::error!("failed to propagate {} ({}): {err}", record.handle, record.node_type);
                }
                report.skipped.push((record.handle, err));
            }
        }

        log::trace!(
            "propagated {} record(s): +{} ~{} >{} -{}",
            batch.records.len(),
            report.created,
            report.updated,
            report.moved,
            report.deleted
        );
        report
    }

    fn apply_record(
        &self,
        record: &MutationRecord,
        tree: &LocalTree,
        mapping: &mut IdentityMapper,
        replica: &mut Replica,
        report: &mut PropagationReport,
    ) -> Result<()> {
        match record.kind {
            MutationKind::Destroyed => {
                if let Some(id) = mapping.remove_local(record.handle) {
                    if replica.delete_node(id)? {
                        report.deleted += 1;
                    }
                }
                Ok(())
            }
            MutationKind::Created | MutationKind::Updated => {
                if !tree.contains(record.handle) {
                    return Ok(());
                }
                let (id, fresh) = self.ensure_mapped(record.handle, tree, mapping, replica, report)?;
                if !fresh {
                    if self.reposition(record.handle, id, tree, mapping, replica, report)? {
                        report.moved += 1;
                    }
                    if self.write_data(record.handle, id, tree, replica)? > 0 {
                        report.updated += 1;
                    }
                }
                Ok(())
            }
        }
    }

    /// Id of `handle`, creating it (and any unmapped ancestors) in the
    /// replica first. The flag is `true` when the node was just created.
    fn ensure_mapped(
        &self,
        handle: LocalHandle,
        tree: &LocalTree,
        mapping: &mut IdentityMapper,
        replica: &mut Replica,
        report: &mut PropagationReport,
    ) -> Result<(StableId, bool)> {
        if let Some(id) = mapping.by_local(handle) {
            if !replica.is_live(id) {
                return Err(SyncError::ConcurrentDeleteRace(id));
            }
            return Ok((id, false));
        }

        let parent = self.replica_parent(handle, tree, mapping, replica, report)?;
        let after = anchor(handle, parent, tree, mapping, replica);
        let index = match after {
            Some(prev) => replica.index_of(prev).map_or(0, |i| i + 1),
            None => 0,
        };
        let id = mapping.get_or_create(handle, parent, index, replica)?;
        report.created += 1;

        if let Err(err) = self.write_data(handle, id, tree, replica) {
            if !err.is_soft() {
                return Err(err);
            }
            log::warn!("{handle} created without properties: {err}");
            report.skipped.push((handle, err));
        }
        Ok((id, true))
    }

    fn replica_parent(
        &self,
        handle: LocalHandle,
        tree: &LocalTree,
        mapping: &mut IdentityMapper,
        replica: &mut Replica,
        report: &mut PropagationReport,
    ) -> Result<Option<StableId>> {
        match tree.parent(handle) {
            Some(parent) if parent.is_root() => Ok(None),
            Some(parent) => Ok(Some(
                self.ensure_mapped(parent, tree, mapping, replica, report)?.0,
            )),
            None => Err(SyncError::InvalidTreeOperation(format!(
                "{handle} is detached from the tree"
            ))),
        }
    }

    /// Move `id` if its replica parent or predecessor differs from the
    /// local tree. Returns `true` if a move was issued.
    fn reposition(
        &self,
        handle: LocalHandle,
        id: StableId,
        tree: &LocalTree,
        mapping: &mut IdentityMapper,
        replica: &mut Replica,
        report: &mut PropagationReport,
    ) -> Result<bool> {
        let parent = self.replica_parent(handle, tree, mapping, replica, report)?;
        let after = anchor(handle, parent, tree, mapping, replica);
        if replica.parent(id) == Some(ParentRef::from_option(parent))
            && replica.prev_sibling(id) == after
        {
            return Ok(false);
        }
        replica.move_node(id, parent, after)?;
        Ok(true)
    }

    /// Write type and properties. Returns the number of keys written.
    fn write_data(
        &self,
        handle: LocalHandle,
        id: StableId,
        tree: &LocalTree,
        replica: &mut Replica,
    ) -> Result<usize> {
        let node = tree
            .node(handle)
            .ok_or_else(|| SyncError::MappingNotFound(handle.to_string()))?;
        let spec = self.registry.require(node.node_type())?;
        let mut written = usize::from(replica.set_node_type(id, node.node_type())?);
        let props = (spec.serialize)(node)?;
        written += replica.write_props(id, &props, self.max_property_bytes)?;
        Ok(written)
    }
}

/// Closest preceding local sibling that already sits under `parent` in the
/// replica.
fn anchor(
    handle: LocalHandle,
    parent: Option<StableId>,
    tree: &LocalTree,
    mapping: &IdentityMapper,
    replica: &Replica,
) -> Option<StableId> {
    let local_parent = tree.parent(handle)?;
    let siblings = tree.children(local_parent);
    let pos = siblings.iter().position(|h| *h == handle)?;
    let expected = Some(ParentRef::from_option(parent));
    siblings[..pos]
        .iter()
        .rev()
        .filter_map(|h| mapping.by_local(*h))
        .find(|id| replica.parent(*id) == expected)
}
