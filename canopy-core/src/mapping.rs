//! Identity mapping between local handles and replicated node ids.

use crate::error::{Result, SyncError};
use crate::id::{LocalHandle, StableId};
use crate::replica::Replica;
use rustc_hash::FxHashMap;

/// Bijection between [`LocalHandle`]s and [`StableId`]s.
///
/// The document root is implicit on both sides and never stored.
#[derive(Debug, Default, Clone)]
pub struct IdentityMapper {
    by_local: FxHashMap<LocalHandle, StableId>,
    by_stable: FxHashMap<StableId, LocalHandle>,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn by_local(&self, handle: LocalHandle) -> Option<StableId> {
        self.by_local.get(&handle).copied()
    }

    #[inline]
    pub fn by_stable(&self, id: StableId) -> Option<LocalHandle> {
        self.by_stable.get(&id).copied()
    }

    pub fn require_local(&self, handle: LocalHandle) -> Result<StableId> {
        self.by_local(handle)
            .ok_or_else(|| SyncError::MappingNotFound(handle.to_string()))
    }

    pub fn require_stable(&self, id: StableId) -> Result<LocalHandle> {
        self.by_stable(id)
            .ok_or_else(|| SyncError::MappingNotFound(id.to_string()))
    }

    /// Return the id mapped to `handle`, creating a replicated node under
    /// `parent` at `index` when there is none yet.
    pub fn get_or_create(
        &mut self,
        handle: LocalHandle,
        parent: Option<StableId>,
        index: usize,
        replica: &mut Replica,
    ) -> Result<StableId> {
        if let Some(id) = self.by_local(handle) {
            return Ok(id);
        }
        let id = replica.create_node(parent, index)?;
        self.insert(handle, id);
        Ok(id)
    }

    /// Record `handle ↔ id`. Any previous pairing of either side is dropped
    /// so the mapping stays one-to-one.
    pub fn insert(&mut self, handle: LocalHandle, id: StableId) {
        if let Some(old_id) = self.by_local.insert(handle, id) {
            if old_id != id {
                log::warn!("{handle} remapped from {old_id} to {id}");
                self.by_stable.remove(&old_id);
            }
        }
        if let Some(old_handle) = self.by_stable.insert(id, handle) {
            if old_handle != handle {
                log::warn!("{id} remapped from {old_handle} to {handle}");
                self.by_local.remove(&old_handle);
            }
        }
    }

    pub fn remove_local(&mut self, handle: LocalHandle) -> Option<StableId> {
        let id = self.by_local.remove(&handle)?;
        self.by_stable.remove(&id);
        Some(id)
    }

    pub fn remove_stable(&mut self, id: StableId) -> Option<LocalHandle> {
        let handle = self.by_stable.remove(&id)?;
        self.by_local.remove(&handle);
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LocalHandle, StableId)> + '_ {
        self.by_local.iter().map(|(h, id)| (*h, *id))
    }

    /// Verify both directions agree.
    pub fn check_bijection(&self) -> Result<()> {
        if self.by_local.len() != self.by_stable.len() {
            return Err(SyncError::MappingNotFound(format!(
                "mapping sides differ in size: {} local, {} stable",
                self.by_local.len(),
                self.by_stable.len()
            )));
        }
        for (handle, id) in &self.by_local {
            if self.by_stable.get(id) != Some(handle) {
                return Err(SyncError::MappingNotFound(format!(
                    "{handle} -> {id} has no inverse"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_stable() {
        let mut replica = Replica::new(1).unwrap();
        let mut mapping = IdentityMapper::new();
        let h = LocalHandle(5);

        let first = mapping.get_or_create(h, None, 0, &mut replica).unwrap();
        let second = mapping.get_or_create(h, None, 0, &mut replica).unwrap();
        assert_eq!(first, second);
        assert_eq!(replica.children(None).len(), 1);
        assert_eq!(mapping.by_stable(first), Some(h));
    }

    #[test]
    fn test_insert_keeps_bijection() {
        let mut mapping = IdentityMapper::new();
        let a = StableId::new(1, 0);
        let b = StableId::new(1, 1);
        mapping.insert(LocalHandle(1), a);
        mapping.insert(LocalHandle(2), a);
        assert_eq!(mapping.by_local(LocalHandle(1)), None);
        assert_eq!(mapping.by_stable(a), Some(LocalHandle(2)));

        mapping.insert(LocalHandle(2), b);
        assert_eq!(mapping.by_stable(a), None);
        assert_eq!(mapping.len(), 1);
        mapping.check_bijection().unwrap();
    }

    #[test]
    fn test_remove_both_sides() {
        let mut mapping = IdentityMapper::new();
        let id = StableId::new(3, 7);
        mapping.insert(LocalHandle(9), id);
        assert_eq!(mapping.remove_stable(id), Some(LocalHandle(9)));
        assert!(mapping.by_local(LocalHandle(9)).is_none());
        assert!(mapping.is_empty());
        assert!(matches!(
            mapping.require_stable(id),
            Err(SyncError::MappingNotFound(_))
        ));
    }
}
