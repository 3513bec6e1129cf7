//! Sea-of-nodes intermediate representation.
//!
//! Control, memory and data dependencies are all plain input edges of [`NodeData`]. Nodes live in
//! an arena owned by [`Graph`] and are referenced by the dense [`Node`] index; per-pass metadata is
//! kept in side tables keyed by the same index.

mod alias;
mod entities;
mod graph;
pub mod klass;
mod mergemem;
mod node;
pub mod types;

pub use crate::ir::alias::{AliasTable, AliasType};
pub use crate::ir::entities::{AliasIdx, Klass, Node};
pub use crate::ir::graph::Graph;
pub use crate::ir::klass::{FieldInfo, KlassData, KlassFlags, KlassKind, KlassTable};
pub use crate::ir::node::{
    AllocInfo, ArrayCopyInfo, BoolTest, CallInfo, CallSummary, ArgSummary, JvmState, LockInfo,
    MemBarInfo, MemInfo, MemOrder, NodeData, NodeInfo, Opcode, PhiInfo, ScalarMergeInfo,
    ScalarObjectInfo, slot,
};
pub use crate::ir::types::{BasicType, Offset, PtrKind, PtrNull, Type, TypePtr};
