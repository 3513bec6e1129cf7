//! Snapshot-at-the-beginning logging.
//!
//! While concurrent marking runs, the value a reference store overwrites must be recorded so that
//! the marker still sees every object reachable at the start of marking. The policy emits the
//! pre-write barrier as an opaque [`Opcode::WriteBarrier`] node and the optional post-write
//! (storeval) barrier as an [`Opcode::EnqueueBarrier`]. Both are multi nodes with control and
//! raw memory projections, and the enqueue barrier forwards its value through a third one:
//!
//! ```text
//!   WriteBarrier(ctrl, raw mem, adr, pre_val, field mem) -> (ctrl, raw mem)
//!   EnqueueBarrier(ctrl, raw mem, top, val)              -> (ctrl, raw mem, val)
//! ```
//!
//! Keeping them opaque lets escape analysis see through them and lets allocation elimination
//! remove them whole. Whatever survives is deduplicated and then lowered into the marking-active
//! test, the null test and the log buffer update.

use crate::barrier::access::{self, C2Access, C2AtomicAccess};
use crate::barrier::{BarrierSetC2, Decorators};
use crate::compile::Compile;
use crate::escape::{ConnectionGraph, EscapeState};
use crate::ir::{
    AliasIdx, BasicType, BoolTest, Graph, MemBarInfo, MemOrder, Node, NodeInfo, Offset, Opcode,
    PtrNull, Type, TypePtr, slot,
};
use crate::kit::GraphKit;
use crate::result::OptoResult;
use crate::settings::Flags;
use crate::trace;

/// Thread-local offset of the flag telling whether concurrent marking is active.
const SATB_QUEUE_ACTIVE_OFFSET: i64 = 40;
/// Thread-local offset of the byte index of the last free log slot.
const SATB_QUEUE_INDEX_OFFSET: i64 = 48;
/// Thread-local offset of the log buffer.
const SATB_QUEUE_BUFFER_OFFSET: i64 = 56;
/// Runtime entry taking over when the log buffer is full.
const PRE_BARRIER_SLOW_PATH: &str = "write_ref_field_pre_entry";
/// Copy stub for clones that may contain references.
const CLONE_STUB: &str = "satb_clone";

/// Branch probabilities of the lowered barrier.
const PROB_MARKING: f32 = 0.001;
const PROB_NOT_NULL: f32 = 0.9;
const PROB_BUFFER_FULL: f32 = 0.01;

/// Longest run of barriers searched for a duplicate.
const DUPLICATE_SEARCH_LIMIT: usize = 16;
/// Nodes one lowered barrier may add.
const NODES_PER_EXPANSION: usize = 40;

/// Snapshot-at-the-beginning policy.
#[derive(Clone, Copy, Debug)]
pub struct SatbBarrierSetC2 {
    _private: (),
}

impl SatbBarrierSetC2 {
    /// The policy configured by `flags`.
    pub fn new(_flags: &Flags) -> Self {
        Self { _private: () }
    }

    /// Log the value `adr` holds in slice `field_idx`, or `pre_val` if known, before it is
    /// overwritten.
    fn pre_barrier(
        &self,
        kit: &mut GraphKit<'_>,
        obj: Option<Node>,
        adr: Option<Node>,
        field_idx: AliasIdx,
        pre_val: Option<Node>,
    ) {
        let field_mem = adr.map(|_| kit.memory(field_idx));
        if pre_val.is_none() {
            if let (Some(obj), Some(adr), Some(mem)) = (obj, adr, field_mem) {
                if self.can_remove_pre_barrier(kit, obj, adr, mem) {
                    trace!("pre-barrier on fresh {} elided", obj);
                    return;
                }
            }
        }
        let ctl = kit.control();
        let raw = kit.memory(AliasIdx::RAW);
        let top = kit.c.graph.top();
        let wb = kit.c.graph.add(
            Opcode::WriteBarrier,
            &[
                Some(ctl),
                None,
                Some(raw),
                None,
                None,
                Some(adr.unwrap_or(top)),
                pre_val,
                field_mem,
            ],
            Type::Tuple,
            NodeInfo::MemBar(MemBarInfo {
                adr_type: Some(TypePtr::raw(PtrNull::Maybe, Offset::Bot)),
            }),
        );
        self.finish_barrier(kit, wb);
    }

    /// A field of an object allocated since the last safepoint that nothing stored to yet still
    /// holds null: there is nothing to log.
    fn can_remove_pre_barrier(&self, kit: &GraphKit<'_>, obj: Node, adr: Node, field_mem: Node) -> bool {
        let g = &kit.c.graph;
        if kit.just_allocated_object(kit.control()) != Some(obj) || g.op(field_mem) != Opcode::Proj {
            return false;
        }
        let Some(init) = g.input(field_mem, 0).filter(|&i| g.op(i) == Opcode::Initialize) else {
            return false;
        };
        let Some(offset) = g.ty(adr).isa_ptr().and_then(|tp| tp.offset.known()) else {
            return true;
        };
        // The initialization may already have stored something else.
        match g.find_captured_store(init, offset) {
            None => true,
            Some(st) => g
                .input(st, slot::mem::VALUE)
                .is_some_and(|v| g.ty(v).make_ptr().is_some_and(TypePtr::is_null)),
        }
    }

    /// Forward `val` through an enqueue barrier. Returns the value to store.
    fn enqueue_barrier(&self, kit: &mut GraphKit<'_>, val: Node) -> Node {
        if kit.c.graph.ty(val).make_ptr().is_some_and(TypePtr::is_null) {
            return val;
        }
        let ctl = kit.control();
        let raw = kit.memory(AliasIdx::RAW);
        let top = kit.c.graph.top();
        let ty = kit.c.graph.ty(val).clone();
        let eb = kit.c.graph.add(
            Opcode::EnqueueBarrier,
            &[Some(ctl), None, Some(raw), None, None, Some(top), Some(val)],
            Type::Tuple,
            NodeInfo::MemBar(MemBarInfo {
                adr_type: Some(TypePtr::raw(PtrNull::Maybe, Offset::Bot)),
            }),
        );
        self.finish_barrier(kit, eb);
        kit.c.graph.make_proj(eb, slot::PARMS, ty)
    }

    fn finish_barrier(&self, kit: &mut GraphKit<'_>, n: Node) {
        let ctrl = kit.c.graph.make_proj(n, slot::CONTROL, Type::Control);
        let mem = kit.c.graph.make_proj(n, slot::MEMORY, Type::Memory);
        kit.set_control(ctrl);
        kit.set_memory(AliasIdx::RAW, mem);
        self.register_potential_barrier_node(kit.c, n);
    }

    fn needs_barriers(access: &C2Access) -> bool {
        access.is_oop() && access.in_heap() && !access.is_raw()
    }

    /// Pre-barrier and enqueue barrier of an atomic access. `pre_val` is the value known to be
    /// overwritten, if any. Returns the value to write.
    fn atomic_barriers(
        &self,
        kit: &mut GraphKit<'_>,
        access: &C2AtomicAccess,
        pre_val: Option<Node>,
        new_val: Node,
    ) -> Node {
        let a = &access.access;
        let (base, addr, idx) = (a.base, a.addr, a.alias_idx);
        match pre_val {
            Some(v) => self.pre_barrier(kit, None, None, AliasIdx::RAW, Some(v)),
            None => self.pre_barrier(kit, Some(base), Some(addr), idx, None),
        }
        self.enqueue_barrier(kit, new_val)
    }

    /// Bypass `n`: its control and memory projections are replaced by its inputs, its value
    /// projection by `value`.
    fn bypass(&self, c: &mut Compile, n: Node, value: Option<Node>) {
        let g = &mut c.graph;
        let top = g.top();
        for con in [slot::CONTROL, slot::MEMORY] {
            if let Some(p) = g.proj_out(n, con) {
                let to = g.input(n, con).unwrap_or(top);
                g.replace_node(p, to);
            }
        }
        if let Some(p) = g.proj_out(n, slot::PARMS) {
            let to = value
                .or_else(|| g.input(n, slot::gc_barrier::VALUE))
                .unwrap_or(top);
            g.replace_node(p, to);
        }
        if !g.is_dead(n) {
            g.remove_dead_node(n);
        }
        self.unregister_potential_barrier_node(c, n);
    }

    /// An earlier barrier, reachable from `n` through a straight run of barriers, that logs the
    /// same value.
    fn find_duplicate(g: &Graph, n: Node) -> Option<Node> {
        let same = |p: Node| {
            g.op(p) == g.op(n)
                && [
                    slot::gc_barrier::ADDRESS,
                    slot::gc_barrier::VALUE,
                    slot::gc_barrier::FIELD_MEMORY,
                ]
                .iter()
                .all(|&i| g.input(p, i) == g.input(n, i))
        };
        let mut cur = n;
        for _ in 0..DUPLICATE_SEARCH_LIMIT {
            let ctrl = g.input(cur, slot::CONTROL)?;
            let mem = g.input(cur, slot::MEMORY)?;
            if g.op(ctrl) != Opcode::Proj || g.op(mem) != Opcode::Proj {
                return None;
            }
            let prev = g.input(ctrl, 0)?;
            if g.input(mem, 0) != Some(prev) || !g.op(prev).is_gc_barrier() {
                return None;
            }
            if same(prev) {
                return Some(prev);
            }
            cur = prev;
        }
        None
    }

    /// Remove barriers made redundant by an identical barrier just before them. Returns how
    /// many were removed.
    fn eliminate_duplicates(&self, c: &mut Compile) -> usize {
        let mut removed = 0;
        for n in c.barrier_state.nodes().to_vec() {
            if c.graph.is_dead(n) {
                continue;
            }
            if let Some(prev) = Self::find_duplicate(&c.graph, n) {
                let value = c.graph.proj_out(prev, slot::PARMS);
                trace!("barrier {} duplicates {}", n, prev);
                self.bypass(c, n, value);
                removed += 1;
            }
        }
        removed
    }

    /// Lower barrier `n` into the marking test and the log buffer update.
    fn expand_barrier(&self, c: &mut Compile, n: Node) {
        let g = &c.graph;
        let top = g.top();
        let root = g.root();
        let ctrl = g.input(n, slot::CONTROL).unwrap_or(top);
        let raw_mem = g.input(n, slot::MEMORY).unwrap_or(top);
        let adr = g.input(n, slot::gc_barrier::ADDRESS).filter(|&a| a != top);
        let known = g.input(n, slot::gc_barrier::VALUE);
        let field_mem = g.input(n, slot::gc_barrier::FIELD_MEMORY);
        let is_enqueue = g.op(n) == Opcode::EnqueueBarrier;
        trace!("expand {} {}", if is_enqueue { "enqueue" } else { "pre" }, n);

        let mut kit = GraphKit::at(c, ctrl, top, raw_mem);
        let thread = kit.c.graph.add(
            Opcode::ThreadLocal,
            &[Some(root)],
            Type::Ptr(TypePtr::raw(PtrNull::NotNull, Offset::Known(0))),
            NodeInfo::None,
        );
        let active_adr = kit.basic_plus_adr(top, thread, SATB_QUEUE_ACTIVE_OFFSET);
        let active = kit.raw_load(active_adr, BasicType::Byte, Type::Int(None));
        let zero = kit.c.graph.intcon(0);
        let cmp = kit.cmp_i(active, zero);
        let marking = kit.bool(cmp, BoolTest::Ne);
        let (marking, idle) = kit.make_if(marking, PROB_MARKING);
        let mut idle_state = kit.state();
        idle_state.ctrl = idle;
        kit.set_control(marking);

        let pre_val = match (known, adr, field_mem) {
            (Some(v), _, _) => v,
            (None, Some(adr), Some(field_mem)) => {
                let saved = kit.state();
                let tp = kit
                    .c
                    .graph
                    .ty(adr)
                    .isa_ptr()
                    .cloned()
                    .unwrap_or_else(TypePtr::bottom);
                let idx = kit.c.alias_index(&tp);
                kit.set_memory(idx, field_mem);
                let ty = Type::Ptr(TypePtr::inst(kit.c.klasses.object(), false, PtrNull::Maybe));
                let v = kit.raw_load(adr, BasicType::Object, ty);
                kit.set_state(saved);
                v
            }
            _ => top,
        };

        let null = kit.c.graph.null();
        let cmp = kit.cmp_p(pre_val, null);
        let not_null = kit.bool(cmp, BoolTest::Ne);
        let (not_null, is_null) = kit.make_if(not_null, PROB_NOT_NULL);
        let mut null_state = kit.state();
        null_state.ctrl = is_null;
        kit.set_control(not_null);

        let index_adr = kit.basic_plus_adr(top, thread, SATB_QUEUE_INDEX_OFFSET);
        let index = kit.raw_load(index_adr, BasicType::Long, Type::Long(None));
        let lzero = kit.c.graph.longcon(0);
        let cmp = kit.c.graph.add_simple(Opcode::CmpL, &[top, index, lzero], Type::Int(None));
        let full = kit.bool(cmp, BoolTest::Eq);
        let (full, room) = kit.make_if(full, PROB_BUFFER_FULL);
        let mut full_state = kit.state();
        full_state.ctrl = full;

        kit.set_control(room);
        let word = kit.c.graph.longcon(8);
        let next = kit
            .c
            .graph
            .add_simple(Opcode::SubL, &[top, index, word], Type::Long(None));
        let buffer_adr = kit.basic_plus_adr(top, thread, SATB_QUEUE_BUFFER_OFFSET);
        let buffer = kit.raw_load(
            buffer_adr,
            BasicType::Address,
            Type::Ptr(TypePtr::raw(PtrNull::NotNull, Offset::Known(0))),
        );
        let slot_adr = kit.addp(top, buffer, next);
        kit.raw_store(slot_adr, BasicType::Address, pre_val, MemOrder::Unordered);
        kit.raw_store(index_adr, BasicType::Long, next, MemOrder::Unordered);
        let room_state = kit.state();

        kit.set_state(full_state);
        kit.make_leaf_call(PRE_BARRIER_SLOW_PATH, &[pre_val, thread]);
        let full_state = kit.state();

        let merged = kit.merge_states(&[idle_state, null_state, room_state, full_state]);
        let out_mem = merged.mem.at(AliasIdx::RAW);
        let base = merged.mem.base();
        let value = known.filter(|_| is_enqueue);

        let g = &mut c.graph;
        if let Some(p) = g.proj_out(n, slot::CONTROL) {
            g.replace_node(p, merged.ctrl);
        }
        if let Some(p) = g.proj_out(n, slot::MEMORY) {
            g.replace_node(p, out_mem);
        }
        if let (Some(p), Some(v)) = (g.proj_out(n, slot::PARMS), value) {
            g.replace_node(p, v);
        }
        if base != out_mem && g.outcnt(base) == 0 && g.op(base) == Opcode::Phi {
            g.remove_dead_node(base);
        }
        if !g.is_dead(n) {
            g.remove_dead_node(n);
        }
        self.unregister_potential_barrier_node(c, n);
    }

    /// Is `n` the value projection of an enqueue barrier?
    fn is_enqueue_value(c: &Compile, n: Node) -> bool {
        let g = &c.graph;
        g.op(n) == Opcode::Proj
            && g.proj_con(n) == Some(slot::PARMS)
            && g.input(n, 0).is_some_and(|b| g.op(b) == Opcode::EnqueueBarrier)
    }
}

impl BarrierSetC2 for SatbBarrierSetC2 {
    fn name(&self) -> &'static str {
        "satb"
    }

    fn store_at_resolved(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val: Node) -> Node {
        if !Self::needs_barriers(access) {
            return access::store_at_resolved(kit, access, val);
        }
        if !access.decorators.contains(Decorators::IS_DEST_UNINITIALIZED) {
            self.pre_barrier(kit, Some(access.base), Some(access.addr), access.alias_idx, None);
        }
        let val = self.enqueue_barrier(kit, val);
        access::store_at_resolved(kit, access, val)
    }

    fn load_at_resolved(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val_type: &Type) -> Node {
        let load = access::load_at_resolved(kit, access, val_type);
        let reference_strength = Decorators::ON_WEAK_OOP_REF
            | Decorators::ON_PHANTOM_OOP_REF
            | Decorators::ON_UNKNOWN_OOP_REF;
        if Self::needs_barriers(access) && access.decorators.intersects(reference_strength) {
            // A referent read while marking must be kept alive as if it had been overwritten.
            self.pre_barrier(kit, None, None, AliasIdx::RAW, Some(load));
            kit.insert_mem_bar(Opcode::MemBarCPUOrder, None);
        }
        load
    }

    fn atomic_cmpxchg_val_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        if !Self::needs_barriers(&access.access) {
            return access::atomic_cmpxchg_val_at_resolved(kit, access, expected, new_val, val_type);
        }
        let new_val = self.atomic_barriers(kit, access, Some(expected), new_val);
        access::atomic_op(
            kit,
            access,
            Opcode::GcCompareAndExchange,
            Some(expected),
            new_val,
            val_type,
        )
    }

    fn atomic_cmpxchg_bool_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
    ) -> Node {
        if !Self::needs_barriers(&access.access) {
            return access::atomic_cmpxchg_bool_at_resolved(kit, access, expected, new_val);
        }
        let new_val = self.atomic_barriers(kit, access, Some(expected), new_val);
        let op = if access.access.decorators.contains(Decorators::C2_WEAK_CMPXCHG) {
            Opcode::GcWeakCompareAndSwap
        } else {
            Opcode::GcCompareAndSwap
        };
        access::atomic_op(kit, access, op, Some(expected), new_val, &Type::Int(None))
    }

    fn atomic_xchg_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        if !Self::needs_barriers(&access.access) {
            return access::atomic_xchg_at_resolved(kit, access, new_val, val_type);
        }
        let new_val = self.enqueue_barrier(kit, new_val);
        let result = access::atomic_xchg_at_resolved(kit, access, new_val, val_type);
        // The old value escapes to the caller, which the marker cannot see.
        self.pre_barrier(kit, None, None, AliasIdx::RAW, Some(result));
        result
    }

    fn clone_at_expansion(&self, c: &mut Compile, ac: Node) {
        let src = c.graph.input(ac, slot::arraycopy::SRC);
        let primitive_array = src
            .and_then(|s| c.graph.ty(s).isa_ptr())
            .filter(|tp| tp.is_aryptr())
            .and_then(|tp| tp.elem)
            .is_some_and(|bt| !bt.is_reference());
        if primitive_array {
            access::clone_at_expansion(c, ac);
        } else {
            access::clone_at_expansion_with(c, ac, CLONE_STUB);
        }
    }

    fn array_copy_requires_gc_barriers(
        &self,
        tightly_coupled_alloc: bool,
        bt: BasicType,
        _is_clone: bool,
    ) -> bool {
        bt.is_reference() && !tightly_coupled_alloc
    }

    fn escape_add_to_con_graph(
        &self,
        cg: &mut ConnectionGraph,
        c: &Compile,
        n: Node,
        delayed: &mut Vec<Node>,
    ) -> bool {
        match c.graph.op(n) {
            Opcode::GcCompareAndExchange => {
                cg.add_objload_to_connection_graph(c, n, Some(&mut *delayed));
                cg.add_to_congraph_unsafe_access(c, n, Some(delayed))
            }
            Opcode::GcCompareAndSwap | Opcode::GcWeakCompareAndSwap => {
                cg.add_to_congraph_unsafe_access(c, n, Some(delayed))
            }
            Opcode::WriteBarrier | Opcode::EnqueueBarrier => true,
            _ if Self::is_enqueue_value(c, n) => {
                let eb = c.graph.input(n, 0);
                if let Some(val) = eb.and_then(|b| c.graph.input(b, slot::gc_barrier::VALUE)) {
                    cg.add_local_var_and_edge(c, n, EscapeState::NoEscape, val, Some(delayed));
                }
                true
            }
            _ => false,
        }
    }

    fn escape_add_final_edges(&self, cg: &mut ConnectionGraph, c: &Compile, n: Node) -> bool {
        match c.graph.op(n) {
            Opcode::GcCompareAndExchange
            | Opcode::GcCompareAndSwap
            | Opcode::GcWeakCompareAndSwap => cg.add_final_edges_unsafe_access(c, n),
            Opcode::WriteBarrier | Opcode::EnqueueBarrier => true,
            _ if Self::is_enqueue_value(c, n) => {
                let eb = c.graph.input(n, 0);
                if let Some(val) = eb.and_then(|b| c.graph.input(b, slot::gc_barrier::VALUE)) {
                    cg.add_local_var_and_edge(c, n, EscapeState::NoEscape, val, None);
                }
                true
            }
            _ => false,
        }
    }

    fn escape_is_barrier_node(&self, c: &Compile, n: Node) -> bool {
        Self::is_enqueue_value(c, n)
    }

    fn escape_has_out_with_unsafe_object(&self, c: &Compile, n: Node) -> bool {
        c.graph.outs(n).iter().any(|&u| c.graph.op(u).is_gc_cas())
    }

    fn is_gc_barrier_node(&self, c: &Compile, n: Node) -> bool {
        let g = &c.graph;
        g.op(n).is_gc_barrier()
            || (g.op(n) == Opcode::Proj && g.input(n, 0).is_some_and(|b| g.op(b).is_gc_barrier()))
            || (g.op(n).is_call_leaf()
                && matches!(g.info(n), NodeInfo::Call(ci) if ci.name == PRE_BARRIER_SLOW_PATH))
    }

    fn step_over_gc_barrier(&self, c: &Compile, n: Node) -> Node {
        let g = &c.graph;
        if g.op(n) != Opcode::Proj {
            return n;
        }
        let Some(b) = g.input(n, 0).filter(|&b| g.op(b).is_gc_barrier()) else {
            return n;
        };
        let input = match g.proj_con(n) {
            Some(slot::CONTROL) => slot::CONTROL,
            Some(slot::MEMORY) => slot::MEMORY,
            _ => slot::gc_barrier::VALUE,
        };
        g.input(b, input).unwrap_or(n)
    }

    fn eliminate_gc_barrier(&self, c: &mut Compile, n: Node) {
        let b = if c.graph.op(n) == Opcode::Proj {
            c.graph.input(n, 0).unwrap_or(n)
        } else {
            n
        };
        if c.graph.op(b).is_gc_barrier() && !c.graph.is_dead(b) {
            trace!("barrier {} on non-escaping object removed", b);
            self.bypass(c, b, None);
        }
    }

    fn expand_macro_nodes(&self, c: &mut Compile) -> OptoResult<()> {
        let removed = self.eliminate_duplicates(c);
        if removed > 0 {
            log::debug!("satb: {removed} duplicate barriers removed");
        }
        for n in c.barrier_state.nodes().to_vec() {
            if c.graph.is_dead(n) {
                self.unregister_potential_barrier_node(c, n);
                continue;
            }
            c.check_node_count(NODES_PER_EXPANSION)?;
            self.expand_barrier(c, n);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::BarrierSet;
    use crate::ir::{Klass, KlassFlags, KlassTable};
    use crate::settings::{GcKind, builder};

    fn setup() -> (Compile, Klass) {
        let mut kt = KlassTable::new(false);
        let k = kt.define_instance(
            "Pair",
            None,
            &[("a", BasicType::Object), ("b", BasicType::Object)],
            KlassFlags::empty(),
        );
        let mut b = builder();
        b.gc(GcKind::Satb);
        (Compile::new(Flags::new(b), kt), k)
    }

    fn count(c: &Compile, op: Opcode) -> usize {
        c.graph.live_node_iter().filter(|&n| c.graph.op(n) == op).count()
    }

    #[test]
    fn store_emits_both_barriers() {
        let (mut c, k) = setup();
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull));
        let p = kit.parameter(0, ty.clone());
        let v = kit.parameter(1, ty);
        let st = kit.store_field(p, "a", v);
        assert_eq!(count(kit.c, Opcode::WriteBarrier), 1);
        assert_eq!(count(kit.c, Opcode::EnqueueBarrier), 1);
        let stored = kit.c.graph.input(st, slot::mem::VALUE).unwrap();
        assert!(SatbBarrierSetC2::is_enqueue_value(kit.c, stored));
        assert_eq!(kit.c.barrier_state().len(), 2);
    }

    #[test]
    fn fresh_object_needs_no_pre_barrier() {
        let (mut c, k) = setup();
        let mut kit = GraphKit::new(&mut c);
        let o = kit.new_instance(k);
        let null = kit.c.graph.null();
        kit.store_field(o, "a", null);
        assert_eq!(count(kit.c, Opcode::WriteBarrier), 0);
        assert_eq!(count(kit.c, Opcode::EnqueueBarrier), 0);
    }

    #[test]
    fn field_initialized_to_null_needs_no_pre_barrier() {
        let (mut c, k) = setup();
        let mut kit = GraphKit::new(&mut c);
        let o = kit.new_instance(k);
        let init = kit.c.graph.initialization(kit.c.graph.ideal_allocation(o).unwrap()).unwrap();
        let null = kit.c.graph.null();
        let st = kit.store_field(o, "a", null);
        assert_eq!(kit.c.graph.find_captured_store(init, 16), Some(st));
        // The old value is the captured null.
        kit.store_field(o, "a", null);
        assert_eq!(count(kit.c, Opcode::WriteBarrier), 0);
    }

    #[test]
    fn repeated_enqueue_is_removed() {
        let (mut c, k) = setup();
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull));
        let p = kit.parameter(0, ty.clone());
        let v = kit.parameter(1, ty);
        let st_a = kit.store_field(p, "a", v);
        let st_b = kit.store_field(p, "b", v);
        let BarrierSet::Satb(satb) = c.barrier_set() else {
            panic!("satb policy expected");
        };
        assert_eq!(satb.eliminate_duplicates(&mut c), 1);
        assert_eq!(count(&c, Opcode::EnqueueBarrier), 1);
        // Both stores now forward the value through the surviving barrier.
        let va = c.graph.input(st_a, slot::mem::VALUE);
        let vb = c.graph.input(st_b, slot::mem::VALUE);
        assert_eq!(va, vb);
    }

    #[test]
    fn lowering_removes_every_barrier() {
        let (mut c, k) = setup();
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull));
        let p = kit.parameter(0, ty.clone());
        let v = kit.parameter(1, ty);
        let st = kit.store_field(p, "a", v);
        kit.return_value(None);
        let bs = c.barrier_set();
        bs.c2().expand_macro_nodes(&mut c).unwrap();
        assert_eq!(count(&c, Opcode::WriteBarrier), 0);
        assert_eq!(count(&c, Opcode::EnqueueBarrier), 0);
        assert!(c.barrier_state().is_empty());
        // Two slow paths, one per barrier.
        let calls: Vec<_> = c
            .graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::CallLeaf)
            .collect();
        assert_eq!(calls.len(), 2);
        // The store keeps its value, now taken straight from the argument.
        assert_eq!(c.graph.input(st, slot::mem::VALUE), Some(v));
        assert_eq!(count(&c, Opcode::ThreadLocal), 2);
    }
}
