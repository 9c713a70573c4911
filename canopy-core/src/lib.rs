//! # canopy-core
//!
//! Keeps a local editable tree and a replicated tree in lock-step.
//!
//! ```text
//!            ┌──────────────┐   MutationBatch   ┌────────────┐
//!  edits ──► │  LocalTree   │ ────────────────► │ Propagator │ ──┐
//!            └──────────────┘                   └────────────┘   │
//!                   ▲                                             ▼
//!                   │            ┌────────────────┐        ┌───────────┐
//!                   └─────────── │   Integrator   │ ◄───── │  Replica  │ ◄── remote updates
//!                                └────────────────┘  Diff  └───────────┘
//!                                         │ IdentityMapper │
//! ```
//!
//! Local changes flow right through the [`Propagator`]; replicated changes
//! flow back through the [`Integrator`]. The [`IdentityMapper`] pairs
//! every local handle with its replicated id. [`CollabSession`] wires the
//! pieces together with undo, presence and commit scheduling.

pub mod config;
pub mod cursor;
pub mod error;
pub mod factory;
pub mod id;
pub mod integrate;
pub mod mapping;
pub mod node;
pub mod presence;
pub mod propagate;
pub mod registry;
pub mod replica;
pub mod scheduler;
pub mod selection;
pub mod session;
pub mod tree;
pub mod undo;

pub use config::SyncConfig;
pub use cursor::{CursorReference, CursorTranslator, ReferenceKind, SelectionReference};
pub use error::{Result, SyncError};
pub use factory::{NodeBlueprint, NodeFactory};
pub use id::{LocalHandle, PeerId, StableId};
pub use integrate::{topological_order, IntegrationReport, Integrator};
pub use mapping::IdentityMapper;
pub use node::{LocalNode, NodeKind, NodeKindVisitor, PropertyMap, TEXT_KEY};
pub use presence::{ChangeSource, CursorColor, PeerPresence, PresenceEvent, PresenceStore};
pub use propagate::{PropagationReport, Propagator};
pub use registry::{NodeRegistry, NodeSpec};
pub use replica::{DiffBatch, ParentRef, Replica, ReplicatedNode, TreeAction, TreeEvent};
pub use scheduler::{CommitDecision, CommitScheduler};
pub use selection::{Point, PointType, Selection};
pub use session::{CollabSession, RemoteCursor};
pub use tree::{LocalTree, MutationBatch, MutationKind, MutationRecord, TreeWriter, UpdateTag};
pub use undo::{StepMeta, UndoCoordinator};
