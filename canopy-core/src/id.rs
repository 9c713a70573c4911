//! Identifiers on both sides of the binding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replica peer identifier.
pub type PeerId = u64;

/// Session-local handle of a node in the editable tree.
///
/// Handles are allocated by [`LocalTree`](crate::tree::LocalTree) and are
/// never sent over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalHandle(pub(crate) u64);

impl LocalHandle {
    /// The document root. Always present, never mapped.
    pub const ROOT: LocalHandle = LocalHandle(0);

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for LocalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stable identifier of a replicated node: the creating peer plus that
/// peer's operation counter. Identical on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StableId {
    pub peer: PeerId,
    pub counter: i32,
}

impl StableId {
    /// Placeholder standing for the document root inside cursor references.
    /// The root has no replicated node of its own.
    pub const DOCUMENT_ROOT: StableId = StableId {
        peer: PeerId::MAX,
        counter: -1,
    };

    #[inline]
    pub const fn new(peer: PeerId, counter: i32) -> Self {
        Self { peer, counter }
    }

    #[inline]
    pub fn is_document_root(self) -> bool {
        self == Self::DOCUMENT_ROOT
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer)
    }
}

impl From<loro::TreeID> for StableId {
    fn from(id: loro::TreeID) -> Self {
        StableId::new(id.peer, id.counter)
    }
}

impl From<StableId> for loro::TreeID {
    fn from(id: StableId) -> Self {
        loro::TreeID::new(id.peer, id.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_handle() {
        assert!(LocalHandle::ROOT.is_root());
        assert!(!LocalHandle(7).is_root());
        assert_eq!(LocalHandle(7).to_string(), "#7");
    }

    #[test]
    fn test_stable_id_display_and_order() {
        let a = StableId::new(1, 4);
        let b = StableId::new(2, 0);
        assert_eq!(a.to_string(), "4@1");
        assert!(a < b);
        assert!(StableId::DOCUMENT_ROOT.is_document_root());
    }

    #[test]
    fn test_tree_id_conversion() {
        let id = StableId::new(42, 9);
        let tree_id: loro::TreeID = id.into();
        assert_eq!(StableId::from(tree_id), id);
    }
}
