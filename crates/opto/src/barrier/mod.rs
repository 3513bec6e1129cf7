//! Collector barrier policies.
//!
//! Every heap access made while building IR goes through a [`BarrierSetC2`]: the policy wraps the
//! raw memory operation with the fences the decorators ask for and with whatever its collector
//! needs (card marks, snapshot logging). The same policy is consulted again by escape analysis,
//! which must see through the policy's own nodes, and by macro expansion, which removes barriers
//! on objects that turned out not to escape and lowers the remaining ones.
//!
//! The set of policies is closed: [`BarrierSet`] selects one of them from the settings.

use crate::compile::Compile;
use crate::escape::ConnectionGraph;
use crate::ir::{BasicType, Node, Type};
use crate::kit::GraphKit;
use crate::result::OptoResult;
use crate::settings::{Flags, GcKind};

mod access;
mod card_table;
pub mod decorators;
mod no_op;
mod satb;

pub use self::access::{
    C2Access, C2AtomicAccess, atomic_add_at_resolved, atomic_cmpxchg_bool_at_resolved,
    atomic_cmpxchg_val_at_resolved, atomic_op, atomic_xchg_at_resolved, clone_payload_base_offset,
    fenced, fenced_atomic, load_at_resolved, pin_atomic_op, store_at_resolved,
};
pub use self::card_table::CardTableBarrierSetC2;
pub use self::decorators::{Decorators, FencePlan};
pub use self::no_op::NoOpBarrierSetC2;
pub use self::satb::SatbBarrierSetC2;

/// Barrier nodes a policy registered while the IR was built.
#[derive(Clone, Debug, Default)]
pub struct BarrierState {
    nodes: Vec<Node>,
}

impl BarrierState {
    /// Registered nodes, in registration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Is nothing registered?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn add(&mut self, n: Node) {
        if !self.nodes.contains(&n) {
            self.nodes.push(n);
        }
    }

    pub(crate) fn remove(&mut self, n: Node) {
        self.nodes.retain(|&m| m != n);
    }
}

/// The compiler side of a collector.
///
/// The provided methods implement a collector that needs no barriers at all; policies override
/// the `*_resolved` methods to add barriers and the hooks to teach the optimizer about the nodes
/// they emit.
pub trait BarrierSetC2 {
    /// Policy name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Store `val` through `access`. Returns the store.
    fn store_at(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val: Node) -> Node {
        self.resolve_address(kit, access);
        fenced(kit, access, |kit, access| {
            self.store_at_resolved(kit, access, val)
        })
    }

    /// Load through `access` a value of type `val_type`. Returns the value.
    fn load_at(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val_type: &Type) -> Node {
        self.resolve_address(kit, access);
        fenced(kit, access, |kit, access| {
            self.load_at_resolved(kit, access, val_type)
        })
    }

    /// Compare-and-exchange. Returns the previous value.
    fn atomic_cmpxchg_val_at(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        self.resolve_address(kit, &mut access.access);
        fenced_atomic(kit, access, |kit, access| {
            self.atomic_cmpxchg_val_at_resolved(kit, access, expected, new_val, val_type)
        })
    }

    /// Compare-and-swap. Returns the success flag.
    fn atomic_cmpxchg_bool_at(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
    ) -> Node {
        self.resolve_address(kit, &mut access.access);
        fenced_atomic(kit, access, |kit, access| {
            self.atomic_cmpxchg_bool_at_resolved(kit, access, expected, new_val)
        })
    }

    /// Atomic exchange. Returns the previous value.
    fn atomic_xchg_at(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        self.resolve_address(kit, &mut access.access);
        fenced_atomic(kit, access, |kit, access| {
            self.atomic_xchg_at_resolved(kit, access, new_val, val_type)
        })
    }

    /// Atomic add. Returns the previous value.
    fn atomic_add_at(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        delta: Node,
        val_type: &Type,
    ) -> Node {
        self.resolve_address(kit, &mut access.access);
        fenced_atomic(kit, access, |kit, access| {
            self.atomic_add_at_resolved(kit, access, delta, val_type)
        })
    }

    /// Rewrite the base or address of `access` before any fence is emitted. Runs once per
    /// access.
    fn resolve_address(&self, _kit: &mut GraphKit<'_>, _access: &mut C2Access) {}

    /// Emit the store proper.
    fn store_at_resolved(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val: Node) -> Node {
        store_at_resolved(kit, access, val)
    }

    /// Emit the load proper.
    fn load_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2Access,
        val_type: &Type,
    ) -> Node {
        load_at_resolved(kit, access, val_type)
    }

    /// Emit the compare-and-exchange proper.
    fn atomic_cmpxchg_val_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        atomic_cmpxchg_val_at_resolved(kit, access, expected, new_val, val_type)
    }

    /// Emit the compare-and-swap proper.
    fn atomic_cmpxchg_bool_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
    ) -> Node {
        atomic_cmpxchg_bool_at_resolved(kit, access, expected, new_val)
    }

    /// Emit the exchange proper.
    fn atomic_xchg_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        atomic_xchg_at_resolved(kit, access, new_val, val_type)
    }

    /// Emit the add proper.
    fn atomic_add_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        delta: Node,
        val_type: &Type,
    ) -> Node {
        atomic_add_at_resolved(kit, access, delta, val_type)
    }

    /// Copy the contents of `src` into the fresh object `dst` of `size` bytes.
    fn clone(&self, kit: &mut GraphKit<'_>, src: Node, dst: Node, size: Node, is_array: bool) {
        access::clone(kit, src, dst, size, is_array);
    }

    /// Lower a basic clone that could not be turned into loads and stores.
    fn clone_at_expansion(&self, c: &mut Compile, ac: Node) {
        access::clone_at_expansion(c, ac);
    }

    /// Does copying elements of type `bt` need collector barriers, or may the copy be done with
    /// plain loads and stores?
    fn array_copy_requires_gc_barriers(
        &self,
        _tightly_coupled_alloc: bool,
        _bt: BasicType,
        _is_clone: bool,
    ) -> bool {
        false
    }

    /// Add `n` to the connection graph if it is one of the policy's nodes. Returns whether `n`
    /// was handled.
    fn escape_add_to_con_graph(
        &self,
        _cg: &mut ConnectionGraph,
        _c: &Compile,
        _n: Node,
        _delayed: &mut Vec<Node>,
    ) -> bool {
        false
    }

    /// Add the edges of `n` that needed every node to exist first. Returns whether `n` was
    /// handled.
    fn escape_add_final_edges(&self, _cg: &mut ConnectionGraph, _c: &Compile, _n: Node) -> bool {
        false
    }

    /// Does `n` pass a pointer through unchanged?
    fn escape_is_barrier_node(&self, _c: &Compile, _n: Node) -> bool {
        false
    }

    /// Is `n` a policy node that accesses its object in a way scalar replacement cannot model?
    fn escape_has_out_with_unsafe_object(&self, _c: &Compile, _n: Node) -> bool {
        false
    }

    /// Is `n` part of a barrier this policy emitted?
    fn is_gc_barrier_node(&self, _c: &Compile, _n: Node) -> bool {
        false
    }

    /// The value `n` passes through, if `n` is a barrier; `n` otherwise.
    fn step_over_gc_barrier(&self, _c: &Compile, n: Node) -> Node {
        n
    }

    /// Remove the barrier rooted at `n` on an object that turned out not to escape.
    fn eliminate_gc_barrier(&self, _c: &mut Compile, _n: Node) {}

    /// Remember a barrier node for expansion.
    fn register_potential_barrier_node(&self, c: &mut Compile, n: Node) {
        c.barrier_state.add(n);
    }

    /// Forget a barrier node that was removed.
    fn unregister_potential_barrier_node(&self, c: &mut Compile, n: Node) {
        c.barrier_state.remove(n);
    }

    /// Lower the remaining barrier nodes into their final shape.
    fn expand_macro_nodes(&self, _c: &mut Compile) -> OptoResult<()> {
        Ok(())
    }

    /// Fresh per-compilation state.
    fn create_barrier_state(&self) -> BarrierState {
        BarrierState::default()
    }
}

/// The active collector's policy.
#[derive(Clone, Copy, Debug)]
pub enum BarrierSet {
    /// No barriers.
    NoOp(NoOpBarrierSetC2),
    /// Card marking after reference stores.
    CardTable(CardTableBarrierSetC2),
    /// Snapshot-at-the-beginning logging before reference stores.
    Satb(SatbBarrierSetC2),
}

impl BarrierSet {
    /// The policy selected by `flags`.
    pub fn new(flags: &Flags) -> Self {
        match flags.gc() {
            GcKind::NoOp => BarrierSet::NoOp(NoOpBarrierSetC2),
            GcKind::CardTable => BarrierSet::CardTable(CardTableBarrierSetC2::new(flags)),
            GcKind::Satb => BarrierSet::Satb(SatbBarrierSetC2::new(flags)),
        }
    }

    /// The policy's compiler interface.
    pub fn c2(&self) -> &dyn BarrierSetC2 {
        match self {
            BarrierSet::NoOp(b) => b,
            BarrierSet::CardTable(b) => b,
            BarrierSet::Satb(b) => b,
        }
    }

    /// Which collector this is.
    pub fn kind(&self) -> GcKind {
        match self {
            BarrierSet::NoOp(_) => GcKind::NoOp,
            BarrierSet::CardTable(_) => GcKind::CardTable,
            BarrierSet::Satb(_) => GcKind::Satb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;
    use crate::settings::builder;

    #[test]
    fn selected_by_flags() {
        for (gc, name) in [
            (GcKind::NoOp, "no-op"),
            (GcKind::CardTable, "card-table"),
            (GcKind::Satb, "satb"),
        ] {
            let mut b = builder();
            b.gc(gc);
            let bs = BarrierSet::new(&Flags::new(b));
            assert_eq!(bs.kind(), gc);
            assert_eq!(bs.c2().name(), name);
        }
    }

    #[test]
    fn state_deduplicates() {
        let mut s = BarrierState::default();
        let n = Node::from_u32(7);
        s.add(n);
        s.add(n);
        assert_eq!(s.len(), 1);
        s.remove(n);
        assert!(s.is_empty());
    }
}
