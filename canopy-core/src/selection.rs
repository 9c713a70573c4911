//! Selections over the local tree.

use crate::id::LocalHandle;

/// Whether a point's offset counts characters or children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointType {
    /// Character offset inside a text leaf.
    Text,
    /// Child index inside a container, or 0/1 around an opaque leaf.
    Element,
}

/// A position in the local tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub node: LocalHandle,
    pub offset: usize,
    pub kind: PointType,
}

impl Point {
    pub fn text(node: LocalHandle, offset: usize) -> Self {
        Self {
            node,
            offset,
            kind: PointType::Text,
        }
    }

    pub fn element(node: LocalHandle, offset: usize) -> Self {
        Self {
            node,
            offset,
            kind: PointType::Element,
        }
    }
}

/// Anchor/focus pair. The anchor is where the selection started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Selection {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point,
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }
}
