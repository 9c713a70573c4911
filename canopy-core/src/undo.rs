//! Undo/redo on top of the replica's undo manager.
//!
//! The replica undo manager reverts document operations; this coordinator
//! keeps a parallel stack of selection metadata so the local caret lands
//! where it was before (undo) or after (redo) each step. Only commits made
//! through [`UndoCoordinator::record`] create steps, so remote changes and
//! integration never enter local history.

use crate::config::SyncConfig;
use crate::cursor::SelectionReference;
use crate::error::Result;
use crate::replica::{Replica, SYSTEM_ORIGIN};
use loro::UndoManager;
use std::time::{Duration, Instant};

/// Selection around one undo step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMeta {
    pub before: Option<SelectionReference>,
    pub after: Option<SelectionReference>,
}

pub struct UndoCoordinator {
    manager: UndoManager,
    merge_interval: Duration,
    max_steps: usize,
    undo_meta: Vec<StepMeta>,
    redo_meta: Vec<StepMeta>,
    last_record: Option<Instant>,
}

impl UndoCoordinator {
    pub fn new(replica: &Replica, config: &SyncConfig) -> Self {
        let mut manager = UndoManager::new(replica.doc());
        manager.set_merge_interval(config.undo_merge_interval.as_millis() as i64);
        manager.set_max_undo_steps(config.undo_max_steps);
        manager.add_exclude_origin_prefix(SYSTEM_ORIGIN);
        Self {
            manager,
            merge_interval: config.undo_merge_interval,
            max_steps: config.undo_max_steps,
            undo_meta: Vec::new(),
            redo_meta: Vec::new(),
            last_record: None,
        }
    }

    /// Note a local commit made at `now`. Commits closer together than the
    /// merge interval extend the previous step, mirroring the replica's
    /// own grouping.
    pub fn record(
        &mut self,
        before: Option<SelectionReference>,
        after: Option<SelectionReference>,
        now: Instant,
    ) {
        self.redo_meta.clear();
        let merge = self
            .last_record
            .is_some_and(|last| now.saturating_duration_since(last) < self.merge_interval);
        self.last_record = Some(now);

        if merge {
            if let Some(top) = self.undo_meta.last_mut() {
                top.after = after;
                return;
            }
        }
        self.undo_meta.push(StepMeta { before, after });
        if self.undo_meta.len() > self.max_steps {
            self.undo_meta.remove(0);
        }
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Revert the latest step in the replica. Returns its metadata, or
    /// `None` if there was nothing to undo.
    pub fn undo(&mut self) -> Result<Option<StepMeta>> {
        if !self.manager.undo()? {
            return Ok(None);
        }
        self.last_record = None;
        let meta = self.undo_meta.pop().unwrap_or(StepMeta {
            before: None,
            after: None,
        });
        self.redo_meta.push(meta);
        Ok(Some(meta))
    }

    pub fn redo(&mut self) -> Result<Option<StepMeta>> {
        if !self.manager.redo()? {
            return Ok(None);
        }
        self.last_record = None;
        let meta = self.redo_meta.pop().unwrap_or(StepMeta {
            before: None,
            after: None,
        });
        self.undo_meta.push(meta);
        Ok(Some(meta))
    }

    /// Number of recorded steps available to undo.
    pub fn depth(&self) -> usize {
        self.undo_meta.len()
    }
}
