//! IR entity references.
//!
//! Nodes, classes and alias classes are referenced by `u32` indexes into tables owned by the
//! [`Graph`](super::Graph), the [`KlassTable`](super::KlassTable) and the
//! [`AliasTable`](super::AliasTable). A separate index type per table keeps them apart.

use crate::entity::entity_impl;
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// An opaque reference to a node of the sea-of-nodes graph.
///
/// Node numbers are allocated in creation order and never reused, so a number larger than any
/// that existed when an analysis ran identifies a node the analysis has not seen.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Node(u32);
entity_impl!(Node, "n");

/// An opaque reference to a loaded class or array class.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Klass(u32);
entity_impl!(Klass, "klass");

/// An alias class ("memory slice").
///
/// Memory operations whose addresses fall into different alias classes never interfere. Index 0
/// is unused; the next three are the fixed sentinels.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct AliasIdx(u32);
entity_impl!(AliasIdx, "alias");

impl AliasIdx {
    /// The empty slice: no memory at all.
    pub const TOP: AliasIdx = AliasIdx(1);
    /// All of memory.
    pub const BOT: AliasIdx = AliasIdx(2);
    /// Raw (untyped) memory, such as an object under initialization.
    pub const RAW: AliasIdx = AliasIdx(3);
    /// First index handed out for typed slices.
    pub const FIRST_GENERAL: AliasIdx = AliasIdx(4);
}
