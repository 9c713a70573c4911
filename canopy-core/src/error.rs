//! Error types for the sync engine.
//!
//! Soft errors describe a single event or node that could not be handled.
//! They are logged and skipped by the propagation and integration passes
//! so one bad record never aborts a whole batch. Hard errors abort the
//! current operation and leave the session unchanged.

use crate::id::StableId;
use thiserror::Error;

/// Errors raised while binding a local tree to its replica.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A lookup in the identity mapping came back empty.
    #[error("no mapping for {0}")]
    MappingNotFound(String),

    /// A replica event (or its payload) could not be interpreted.
    #[error("malformed diff event: {0}")]
    MalformedDiff(String),

    /// A remote update or snapshot was rejected by the replica.
    #[error("failed to import remote update: {0}")]
    Import(String),

    /// A delete targeted a replicated node that is already gone.
    #[error("replicated node {0} was already deleted")]
    ConcurrentDeleteRace(StableId),

    /// A node's properties could not be encoded for replication.
    #[error("failed to serialize properties of {node}: {reason}")]
    Serialization { node: String, reason: String },

    /// A structural edit on the local tree was rejected.
    #[error("invalid tree operation: {0}")]
    InvalidTreeOperation(String),

    /// No registry entry exists for a node type name.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// The replicated document failed an operation.
    #[error("replica error: {0}")]
    Replica(String),
}

impl SyncError {
    /// Soft errors are recoverable per record; the enclosing pass continues.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SyncError::MappingNotFound(_)
                | SyncError::MalformedDiff(_)
                | SyncError::ConcurrentDeleteRace(_)
                | SyncError::Serialization { .. }
                | SyncError::UnknownNodeType(_)
        )
    }
}

impl From<loro::LoroError> for SyncError {
    fn from(err: loro::LoroError) -> Self {
        SyncError::Replica(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_classification() {
        assert!(SyncError::MappingNotFound("#3".into()).is_soft());
        assert!(SyncError::MalformedDiff("bad".into()).is_soft());
        assert!(SyncError::ConcurrentDeleteRace(StableId::new(1, 0)).is_soft());
        assert!(!SyncError::Import("truncated".into()).is_soft());
        assert!(!SyncError::InvalidTreeOperation("cycle".into()).is_soft());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SyncError::Serialization {
            node: "#4".into(),
            reason: "too large".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to serialize properties of #4: too large"
        );
    }
}
