//! Merged memory states.
//!
//! A `MergeMem` node holds one memory state per alias class. Input `i` is the state of slice `i`;
//! the input at [`AliasIdx::BOT`] is the base memory used for every slice without an entry of
//! its own. Slices without an entry hold the top node ("empty memory").

use crate::entity::EntityRef;
use crate::ir::entities::{AliasIdx, Node};
use crate::ir::graph::Graph;
use crate::ir::node::{NodeInfo, Opcode};
use crate::ir::types::Type;

impl Graph {
    /// A new `MergeMem` whose every slice is `base`.
    pub fn merge_mem(&mut self, base: Node) -> Node {
        let top = self.top();
        self.add(
            Opcode::MergeMem,
            &[None, Some(top), Some(base)],
            Type::Memory,
            NodeInfo::None,
        )
    }

    /// The placeholder for a slice that has no entry.
    pub fn empty_memory(&self) -> Node {
        self.top()
    }

    /// Is `n` the empty-memory placeholder?
    pub fn is_empty_memory(&self, n: Node) -> bool {
        n == self.top()
    }

    /// State of all of memory not given a slice of its own.
    pub fn base_memory(&self, mm: Node) -> Node {
        debug_assert_eq!(self.op(mm), Opcode::MergeMem);
        self.input(mm, AliasIdx::BOT.index())
            .unwrap_or_else(|| self.empty_memory())
    }

    /// State of slice `idx`.
    pub fn memory_at(&self, mm: Node, idx: AliasIdx) -> Node {
        debug_assert_eq!(self.op(mm), Opcode::MergeMem);
        match self.input(mm, idx.index()) {
            Some(n) if !self.is_empty_memory(n) => n,
            _ => self.base_memory(mm),
        }
    }

    /// Set the state of slice `idx`. Setting it to the base memory removes the entry.
    pub fn set_memory_at(&mut self, mm: Node, idx: AliasIdx, mem: Node) {
        debug_assert_eq!(self.op(mm), Opcode::MergeMem);
        debug_assert!(idx != AliasIdx::TOP);
        let empty = self.empty_memory();
        if idx == AliasIdx::BOT {
            self.set_req(mm, idx.index(), Some(mem));
            return;
        }
        let mem = if mem == self.base_memory(mm) {
            empty
        } else {
            mem
        };
        while self.req(mm) <= idx.index() {
            self.add_req(mm, Some(empty));
        }
        self.set_req(mm, idx.index(), Some(mem));
    }

    /// Slices with an entry of their own, as `(index, state)` pairs, base memory excluded.
    pub fn memory_slices(&self, mm: Node) -> Vec<(AliasIdx, Node)> {
        (AliasIdx::RAW.index()..self.req(mm))
            .filter_map(|i| {
                let n = self.input(mm, i)?;
                if self.is_empty_memory(n) {
                    None
                } else {
                    Some((AliasIdx::from_u32(i as u32), n))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices() {
        let mut g = Graph::new();
        let base = g.start_mem().unwrap();
        let mm = g.merge_mem(base);
        let idx = AliasIdx::from_u32(6);
        assert_eq!(g.memory_at(mm, idx), base);

        let other = g.add(Opcode::Phi, &[None], Type::Memory, NodeInfo::None);
        g.set_memory_at(mm, idx, other);
        assert_eq!(g.memory_at(mm, idx), other);
        assert_eq!(g.memory_slices(mm), vec![(idx, other)]);

        g.set_memory_at(mm, idx, base);
        assert!(g.is_empty_memory(g.input(mm, 6).unwrap()));
        assert!(g.memory_slices(mm).is_empty());
    }
}
