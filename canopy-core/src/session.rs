//! A collaboration session: one local tree bound to one replica.
//!
//! ```text
//!   edit(|w| ..) ──► LocalTree::update ──► Propagator ──► Replica (pending)
//!                                                            │ commit (scheduler)
//!                                                            ▼
//!   flush() / tick(now) ─────────────────────────────► outbound update bytes
//!
//!   apply_remote_update(bytes) ──► Replica::import ──► DiffBatch ──► Integrator ──► LocalTree
//! ```
//!
//! The session is synchronous and owns every piece of state; transports
//! call into it from a single task.

use crate::config::SyncConfig;
use crate::cursor::{CursorTranslator, SelectionReference};
use crate::error::{Result, SyncError};
use crate::id::{LocalHandle, PeerId};
use crate::integrate::{IntegrationReport, Integrator};
use crate::mapping::IdentityMapper;
use crate::presence::{peer_key, CursorColor, PeerPresence, PresenceEvent, PresenceStore};
use crate::propagate::Propagator;
use crate::registry::NodeRegistry;
use crate::replica::{Replica, LOCAL_ORIGIN};
use crate::scheduler::{CommitDecision, CommitScheduler};
use crate::selection::Selection;
use crate::tree::{LocalTree, TreeWriter, UpdateTag};
use crate::undo::{StepMeta, UndoCoordinator};
use loro::VersionVector;
use std::sync::Arc;
use std::time::Instant;

/// A remote peer's cursor resolved against the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub key: String,
    pub name: String,
    pub color: CursorColor,
    /// `None` when the peer has no selection or it cannot be resolved yet.
    pub selection: Option<Selection>,
    /// The peer has a selection that names nodes not integrated here yet.
    pub pending: bool,
}

pub struct CollabSession {
    config: SyncConfig,
    tree: LocalTree,
    replica: Replica,
    mapping: IdentityMapper,
    propagator: Propagator,
    integrator: Integrator,
    presence: PresenceStore,
    undo: UndoCoordinator,
    scheduler: CommitScheduler,
    /// Version last handed out by `flush`.
    exported: VersionVector,
    pending_step: Option<StepMeta>,
    user_name: String,
}

impl CollabSession {
    pub fn new(peer: PeerId, registry: Arc<NodeRegistry>, config: SyncConfig) -> Result<Self> {
        let replica = Replica::new(peer)?;
        let undo = UndoCoordinator::new(&replica, &config);
        let exported = replica.version();
        let mut session = Self {
            tree: LocalTree::new(registry.clone()),
            mapping: IdentityMapper::new(),
            propagator: Propagator::new(registry.clone(), config.max_property_bytes),
            integrator: Integrator::new(registry),
            presence: PresenceStore::new(peer, config.presence_timeout),
            scheduler: CommitScheduler::new(config.commit_idle, config.commit_max_latency),
            undo,
            replica,
            exported,
            pending_step: None,
            user_name: format!("peer-{peer}"),
            config,
        };
        session.publish_presence();
        log::debug!("session started for peer {peer}");
        Ok(session)
    }

    /// Session with the built-in node types and default configuration.
    pub fn with_defaults(peer: PeerId) -> Result<Self> {
        Self::new(peer, Arc::new(NodeRegistry::with_defaults()), SyncConfig::default())
    }

    #[inline]
    pub fn peer(&self) -> PeerId {
        self.replica.peer()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tree(&self) -> &LocalTree {
        &self.tree
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn mapping(&self) -> &IdentityMapper {
        &self.mapping
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceStore {
        &mut self.presence
    }

    /// Leaf creates still waiting for their parent to arrive.
    pub fn deferred_ops(&self) -> usize {
        self.integrator.deferred_len()
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending_step.is_some()
    }

    /// When the scheduler wants [`tick`](Self::tick) to run next.
    pub fn next_commit_deadline(&self) -> Option<Instant> {
        self.scheduler.deadline()
    }

    fn selection_reference(&self) -> Option<SelectionReference> {
        let selection = self.tree.selection()?;
        CursorTranslator::new(&self.tree, &self.mapping).selection_to_reference(selection)
    }

    // ── local edits ─────────────────────────────────────

    /// Run a local edit and propagate it to the replica.
    pub fn edit<R>(&mut self, f: impl FnOnce(&mut TreeWriter<'_>) -> Result<R>) -> Result<R> {
        let before = self.selection_reference();
        let (value, batch) = self.tree.update(UpdateTag::Local, f)?;
        let report = self
            .propagator
            .propagate(&batch, &self.tree, &mut self.mapping, &mut self.replica);
        let after = self.selection_reference();

        if report.has_ops() {
            match &mut self.pending_step {
                Some(step) => step.after = after,
                None => self.pending_step = Some(StepMeta { before, after }),
            }
            if self.scheduler.is_immediate() {
                self.commit_pending()?;
            } else {
                self.scheduler.note_pending(Instant::now());
            }
        }
        if report.has_ops() || batch.selection_changed() {
            self.publish_presence();
        }
        Ok(value)
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<()> {
        self.edit(|w| w.set_selection(selection))
    }

    fn commit_pending(&mut self) -> Result<()> {
        let Some(step) = self.pending_step.take() else {
            return Ok(());
        };
        self.replica.commit(LOCAL_ORIGIN);
        self.scheduler.cancel();
        self.undo.record(step.before, step.after, Instant::now());
        self.pump()?;
        Ok(())
    }

    /// Commit pending ops and return everything the peers have not been sent.
    pub fn flush(&mut self) -> Result<Option<Vec<u8>>> {
        self.commit_pending()?;
        let update = self.replica.export_updates_since(&self.exported)?;
        self.exported = self.replica.version();
        Ok(update)
    }

    /// Commit pending ops and return the whole history as one update.
    ///
    /// Sent after every (re)connect so a relay that lost or never saw
    /// earlier updates can catch up. `None` for an empty document.
    pub fn full_update(&mut self) -> Result<Option<Vec<u8>>> {
        self.commit_pending()?;
        let update = self
            .replica
            .export_updates_since(&VersionVector::default())?;
        self.exported = self.replica.version();
        Ok(update)
    }

    /// Drive debounced commits. Returns an outbound update when one is due.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        match self.scheduler.poll(now) {
            CommitDecision::Now => self.flush(),
            CommitDecision::Idle if self.replica.version() != self.exported => self.flush(),
            CommitDecision::Idle | CommitDecision::Wait(_) => Ok(None),
        }
    }

    // ── remote updates ──────────────────────────────────

    /// Drain replica batches and integrate everything not produced locally.
    fn pump(&mut self) -> Result<IntegrationReport> {
        let batches = self.replica.take_batches();
        let report = self
            .integrator
            .integrate(&batches, &mut self.tree, &mut self.mapping, &self.replica)?;
        self.publish_presence();
        Ok(report)
    }

    /// Import a remote update (or snapshot) and integrate it.
    ///
    /// A rejected payload leaves the session untouched.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<IntegrationReport> {
        self.commit_pending()?;
        let caught_up = self.replica.version() == self.exported;
        if let Err(err) = self.replica.import(bytes) {
            log::warn!("remote update rejected: {err}");
            return Err(err);
        }
        if caught_up {
            self.exported = self.replica.version();
        }
        self.pump()
    }

    /// Load the document state of a peer or server.
    pub fn bootstrap(&mut self, snapshot: &[u8]) -> Result<IntegrationReport> {
        self.apply_remote_update(snapshot)
    }

    pub fn snapshot(&mut self) -> Result<Vec<u8>> {
        self.commit_pending()?;
        self.replica.export_snapshot()
    }

    // ── history ─────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        self.pending_step.is_some() || self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Undo the latest local step. Remote changes are never undone.
    pub fn undo(&mut self) -> Result<bool> {
        self.commit_pending()?;
        let Some(step) = self.undo.undo()? else {
            return Ok(false);
        };
        self.restore(step.before)?;
        Ok(true)
    }

    pub fn redo(&mut self) -> Result<bool> {
        self.commit_pending()?;
        let Some(step) = self.undo.redo()? else {
            return Ok(false);
        };
        self.restore(step.after)?;
        Ok(true)
    }

    fn restore(&mut self, selection: Option<SelectionReference>) -> Result<()> {
        let batches = self.replica.take_batches();
        self.integrator.integrate_history(
            &batches,
            &mut self.tree,
            &mut self.mapping,
            &self.replica,
            selection.as_ref(),
        )?;
        self.publish_presence();
        Ok(())
    }

    // ── presence ────────────────────────────────────────

    pub fn set_user(&mut self, name: impl Into<String>) {
        self.user_name = name.into();
        self.publish_presence();
    }

    /// Write the local cursor into the presence store. Returns `false` when
    /// nothing changed.
    fn publish_presence(&mut self) -> bool {
        let presence = PeerPresence {
            name: self.user_name.clone(),
            color: CursorColor::from_peer(self.peer()),
            selection: self.selection_reference(),
        };
        match serde_json::to_value(&presence) {
            Ok(value) => self.presence.set(&peer_key(self.peer()), value),
            Err(err) => {
                log::warn!("cannot encode local presence: {err}");
                false
            }
        }
    }

    pub fn encode_presence(&self) -> Result<Vec<u8>> {
        self.presence.encode()
    }

    pub fn apply_remote_presence(&mut self, bytes: &[u8]) -> Result<PresenceEvent> {
        self.presence.apply(bytes)
    }

    /// Drop remote presence that went quiet.
    pub fn expire_presence(&mut self, now: Instant) -> Vec<String> {
        self.presence.remove_outdated(now)
    }

    /// Remote cursors resolved against the current tree, ordered by key.
    /// References that cannot be resolved yet are reported as pending and
    /// resolve on a later call once their nodes are integrated.
    pub fn remote_cursors(&self) -> Vec<RemoteCursor> {
        let translator = CursorTranslator::new(&self.tree, &self.mapping);
        let local_key = peer_key(self.peer());
        let mut cursors: Vec<RemoteCursor> = self
            .presence
            .keys()
            .filter(|key| *key != local_key)
            .filter_map(|key| {
                let value = self.presence.get(key)?;
                let presence: PeerPresence = match serde_json::from_value(value.clone()) {
                    Ok(presence) => presence,
                    Err(err) => {
                        log::debug!("ignoring presence entry {key}: {err}");
                        return None;
                    }
                };
                let selection = presence
                    .selection
                    .as_ref()
                    .and_then(|r| translator.reference_to_selection(r));
                Some(RemoteCursor {
                    key: key.to_string(),
                    name: presence.name,
                    color: presence.color,
                    pending: presence.selection.is_some() && selection.is_none(),
                    selection,
                })
            })
            .collect();
        cursors.sort_by(|a, b| a.key.cmp(&b.key));
        cursors
    }

    // ── invariants ──────────────────────────────────────

    /// Every node reachable from the root is mapped exactly once, to a live
    /// replicated node.
    pub fn check_invariants(&self) -> Result<()> {
        self.mapping.check_bijection()?;
        for handle in self.tree.descendants(LocalHandle::ROOT) {
            if handle.is_root() {
                continue;
            }
            let id = self.mapping.require_local(handle)?;
            if !self.replica.is_live(id) {
                return Err(SyncError::MappingNotFound(format!(
                    "{handle} maps to deleted node {id}"
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("peer", &self.peer())
            .field("nodes", &self.tree.len())
            .field("mapped", &self.mapping.len())
            .field("pending_commit", &self.pending_step.is_some())
            .finish()
    }
}
