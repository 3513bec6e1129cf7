//! The vocabulary of the connection graph.

use crate::entity::entity_impl;
use crate::ir::{Node, Offset};
use bitflags::bitflags;
use core::fmt;

/// How far a value may travel out of the method being compiled.
///
/// The states form a chain; analysis only ever moves a node up it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EscapeState {
    /// Not analyzed yet.
    Unknown,
    /// Confined to the method activation that created it.
    NoEscape,
    /// Passed to a callee, which does not retain it.
    ArgEscape,
    /// May be reached from outside the method.
    GlobalEscape,
}

impl fmt::Display for EscapeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            EscapeState::Unknown => "UnknownEscape",
            EscapeState::NoEscape => "NoEscape",
            EscapeState::ArgEscape => "ArgEscape",
            EscapeState::GlobalEscape => "GlobalEscape",
        })
    }
}

/// A reference to a node of the connection graph.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PtIdx(u32);
entity_impl!(PtIdx, "pt");

/// The role an IR value plays in the connection graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PtKind {
    /// An object: an allocation, a call result, a constant or one of the two sentinels.
    JavaObject,
    /// A value defined once (except through Phis) that refers to objects.
    LocalVar,
    /// A field or array element, keyed by its address computation.
    Field,
    /// The effect of a bulk copy from one object into another.
    Arraycopy,
}

bitflags! {
    /// Per-node flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PtFlags: u8 {
        /// The object may be replaced by its fields.
        const SCALAR_REPLACEABLE = 1 << 0;
        /// The object is the source of a bulk copy.
        const ARRAYCOPY_SRC = 1 << 1;
        /// The object (or local) is the destination of a bulk copy.
        const ARRAYCOPY_DST = 1 << 2;
        /// The field holds a reference.
        const IS_OOP = 1 << 3;
        /// The object is created by an allocation in this method.
        const ALLOCATION = 1 << 4;
    }
}

/// An entry in a node's use list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PtUse {
    /// The node has an edge to us.
    Edge(PtIdx),
    /// The field node lists us as a base.
    Base(PtIdx),
}

impl PtUse {
    /// The node behind this use.
    pub fn node(self) -> PtIdx {
        match self {
            PtUse::Edge(p) | PtUse::Base(p) => p,
        }
    }
}

/// A connection graph node.
#[derive(Clone, Debug)]
pub struct PointsToNode {
    /// The IR node this stands for.
    pub node: Node,
    /// Role.
    pub kind: PtKind,
    /// Escape state of the value itself.
    pub es: EscapeState,
    /// Escape state of everything reachable through the value's fields.
    pub fields_es: EscapeState,
    /// Flags.
    pub flags: PtFlags,
    /// Byte offset of a field; [`Offset::Bot`] for unknown array elements.
    pub offset: Offset,
    /// Outgoing edges: the objects a local refers to, or the values stored into a field. An
    /// object's edges are its fields and the bulk copies it is the destination of.
    pub edges: Vec<PtIdx>,
    /// Nodes that have an edge to this one, or list it as a base.
    pub uses: Vec<PtUse>,
    /// Objects (or locals) a field may belong to.
    pub bases: Vec<PtIdx>,
}

impl PointsToNode {
    pub(super) fn new(node: Node, kind: PtKind, es: EscapeState) -> Self {
        let mut flags = PtFlags::SCALAR_REPLACEABLE;
        if kind == PtKind::JavaObject && es > EscapeState::NoEscape {
            flags.remove(PtFlags::SCALAR_REPLACEABLE);
        }
        Self {
            node,
            kind,
            es,
            fields_es: es,
            flags,
            offset: Offset::Bot,
            edges: Vec::new(),
            uses: Vec::new(),
            bases: Vec::new(),
        }
    }

    /// Is this an object?
    pub fn is_java_object(&self) -> bool {
        self.kind == PtKind::JavaObject
    }

    /// Is this an object allocated in this method?
    pub fn is_allocation(&self) -> bool {
        self.flags.contains(PtFlags::ALLOCATION)
    }

    /// Is this a local value?
    pub fn is_local_var(&self) -> bool {
        self.kind == PtKind::LocalVar
    }

    /// Is this a field?
    pub fn is_field(&self) -> bool {
        self.kind == PtKind::Field
    }

    /// Is this a bulk copy?
    pub fn is_arraycopy(&self) -> bool {
        self.kind == PtKind::Arraycopy
    }

    /// Does the field hold references?
    pub fn is_oop(&self) -> bool {
        self.flags.contains(PtFlags::IS_OOP)
    }

    /// May the object be replaced by its fields?
    pub fn scalar_replaceable(&self) -> bool {
        self.flags.contains(PtFlags::SCALAR_REPLACEABLE)
    }

    /// Is the object the source of a bulk copy?
    pub fn arraycopy_src(&self) -> bool {
        self.flags.contains(PtFlags::ARRAYCOPY_SRC)
    }

    /// Is the object the destination of a bulk copy?
    pub fn arraycopy_dst(&self) -> bool {
        self.flags.contains(PtFlags::ARRAYCOPY_DST)
    }

    /// Does this node have an edge to `p`? An object "points to" only itself.
    pub fn has_edge(&self, p: PtIdx) -> bool {
        self.edges.contains(&p)
    }

    /// Number of bases of a field.
    pub fn base_count(&self) -> usize {
        self.bases.len()
    }
}

impl fmt::Display for PointsToNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({}) {}({})", self.kind, self.node, self.es, self.fields_es)?;
        if self.is_java_object() && !self.scalar_replaceable() {
            f.write_str(" NSR")?;
        }
        if self.is_field() {
            if self.is_oop() {
                f.write_str(" oop")?;
            }
            if let Offset::Known(o) = self.offset {
                write!(f, " +{o}")?;
            }
            write!(f, " bases{:?}", self.bases)?;
        }
        write!(f, " edges{:?}", self.edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn escape_states_are_ordered() {
        assert!(EscapeState::Unknown < EscapeState::NoEscape);
        assert!(EscapeState::NoEscape < EscapeState::ArgEscape);
        assert!(EscapeState::ArgEscape < EscapeState::GlobalEscape);
        assert_eq!(EscapeState::ArgEscape.to_string(), "ArgEscape");
    }

    #[test]
    fn escaping_object_starts_not_scalar_replaceable() {
        let n = Node::new(7);
        let local = PointsToNode::new(n, PtKind::JavaObject, EscapeState::NoEscape);
        assert!(local.scalar_replaceable());
        let global = PointsToNode::new(n, PtKind::JavaObject, EscapeState::GlobalEscape);
        assert!(!global.scalar_replaceable());
        // Only objects lose the flag up front.
        let var = PointsToNode::new(n, PtKind::LocalVar, EscapeState::GlobalEscape);
        assert!(var.scalar_replaceable());
        assert_eq!(var.fields_es, EscapeState::GlobalEscape);
    }

    #[test]
    fn display() {
        let mut f = PointsToNode::new(Node::new(3), PtKind::Field, EscapeState::NoEscape);
        f.flags.insert(PtFlags::IS_OOP);
        f.offset = Offset::Known(12);
        f.bases.push(PtIdx::new(1));
        let s = f.to_string();
        assert!(s.starts_with("Field("), "{s}");
        assert!(s.contains(" oop +12"), "{s}");
    }
}
