//! Cursor translation between local points and replica-stable references.
//!
//! A local [`Point`] names a node by [`LocalHandle`], which means nothing to
//! other peers. A [`CursorReference`] names it by [`StableId`] instead:
//!
//! | local point               | reference                          |
//! |---------------------------|------------------------------------|
//! | inside a leaf at `n`      | `InsideLeaf(leaf, n)`              |
//! | container at child `i`    | `BeforeNode(child_i, 0)`           |
//! | container past last child | `AtPosition(container, i)`         |
//!
//! Pointing at the child rather than the index keeps a remote caret in
//! place when siblings are inserted ahead of it.

use crate::id::{LocalHandle, StableId};
use crate::mapping::IdentityMapper;
use crate::node::{NodeKind, NodeKindVisitor};
use crate::selection::{Point, Selection};
use crate::tree::LocalTree;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceKind {
    /// Offset inside a leaf.
    InsideLeaf,
    /// Container position just before the referenced child.
    BeforeNode,
    /// Raw child offset inside the referenced container.
    AtPosition,
}

/// A position expressed with replica-stable identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorReference {
    pub id: StableId,
    pub offset: usize,
    pub kind: ReferenceKind,
}

/// Anchor/focus pair of [`CursorReference`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionReference {
    pub anchor: CursorReference,
    pub focus: CursorReference,
}

enum Strategy {
    ThroughChild,
    InsideLeaf,
}

struct PointStrategy;

impl NodeKindVisitor for PointStrategy {
    type Output = Strategy;

    fn visit_container(&mut self) -> Strategy {
        Strategy::ThroughChild
    }
    fn visit_text(&mut self) -> Strategy {
        Strategy::InsideLeaf
    }
    fn visit_opaque(&mut self) -> Strategy {
        Strategy::InsideLeaf
    }
}

/// Translates points and selections for one tree and its mapping.
pub struct CursorTranslator<'a> {
    tree: &'a LocalTree,
    mapping: &'a IdentityMapper,
}

impl<'a> CursorTranslator<'a> {
    pub fn new(tree: &'a LocalTree, mapping: &'a IdentityMapper) -> Self {
        Self { tree, mapping }
    }

    fn stable_of(&self, handle: LocalHandle) -> Option<StableId> {
        if handle.is_root() {
            Some(StableId::DOCUMENT_ROOT)
        } else {
            self.mapping.by_local(handle)
        }
    }

    fn local_of(&self, id: StableId) -> Option<LocalHandle> {
        if id.is_document_root() {
            Some(LocalHandle::ROOT)
        } else {
            self.mapping.by_stable(id)
        }
    }

    /// `None` when the point's node has not been propagated yet.
    pub fn to_reference(&self, point: &Point) -> Option<CursorReference> {
        let node = self.tree.node(point.node)?;
        match node.kind().accept(&mut PointStrategy) {
            Strategy::InsideLeaf => Some(CursorReference {
                id: self.stable_of(point.node)?,
                offset: point.offset,
                kind: ReferenceKind::InsideLeaf,
            }),
            Strategy::ThroughChild => {
                let child = node
                    .children()
                    .get(point.offset)
                    .and_then(|c| self.mapping.by_local(*c));
                match child {
                    Some(child) => Some(CursorReference {
                        id: child,
                        offset: 0,
                        kind: ReferenceKind::BeforeNode,
                    }),
                    None => Some(CursorReference {
                        id: self.stable_of(point.node)?,
                        offset: point.offset,
                        kind: ReferenceKind::AtPosition,
                    }),
                }
            }
        }
    }

    /// `None` when the referenced node is unknown here (not yet integrated,
    /// or deleted). Offsets are clamped to the node's current extent.
    pub fn to_point(&self, reference: &CursorReference) -> Option<Point> {
        let handle = self.local_of(reference.id)?;
        let node = self.tree.node(handle)?;
        match reference.kind {
            ReferenceKind::BeforeNode => {
                let parent = node.parent()?;
                let index = self.tree.index_in_parent(handle)?;
                Some(Point::element(parent, index))
            }
            ReferenceKind::InsideLeaf | ReferenceKind::AtPosition => Some(match node.kind() {
                NodeKind::Text => Point::text(handle, reference.offset.min(node.text_len())),
                NodeKind::Container => {
                    Point::element(handle, reference.offset.min(node.children().len()))
                }
                NodeKind::Opaque | NodeKind::LineBreak => {
                    Point::element(handle, reference.offset.min(1))
                }
            }),
        }
    }

    pub fn selection_to_reference(&self, selection: &Selection) -> Option<SelectionReference> {
        Some(SelectionReference {
            anchor: self.to_reference(&selection.anchor)?,
            focus: self.to_reference(&selection.focus)?,
        })
    }

    pub fn reference_to_selection(&self, reference: &SelectionReference) -> Option<Selection> {
        Some(Selection {
            anchor: self.to_point(&reference.anchor)?,
            focus: self.to_point(&reference.focus)?,
        })
    }
}
