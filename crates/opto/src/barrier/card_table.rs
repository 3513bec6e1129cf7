//! Card marking after reference stores.
//!
//! After every store of a reference into the heap the card covering the written location (or,
//! for plain field stores, the start of the object) is dirtied. The card address is always
//! computed as `AddP(top, byte_map_base, URShiftL(CastP2X(adr), card_shift))`; elimination of the
//! barrier on a non-escaping object relies on exactly that shape.

use crate::barrier::access::{self, C2Access, C2AtomicAccess};
use crate::barrier::{BarrierSetC2, Decorators};
use crate::compile::Compile;
use crate::ir::{
    AliasIdx, BasicType, BoolTest, MemInfo, Node, NodeInfo, Offset, Opcode, PtrNull, Type, TypePtr,
    slot,
};
use crate::kit::GraphKit;
use crate::settings::Flags;
use crate::trace;

/// Value of a dirty card.
const DIRTY_CARD: i32 = 0;

/// Card marking policy.
#[derive(Clone, Copy, Debug)]
pub struct CardTableBarrierSetC2 {
    card_shift: u32,
    use_cond_card_mark: bool,
    reduce_initial_card_marks: bool,
}

impl CardTableBarrierSetC2 {
    /// The policy configured by `flags`.
    pub fn new(flags: &Flags) -> Self {
        Self {
            card_shift: flags.card_shift(),
            use_cond_card_mark: flags.use_cond_card_mark(),
            reduce_initial_card_marks: flags.reduce_initial_card_marks(),
        }
    }

    fn byte_map_base(&self, kit: &mut GraphKit<'_>) -> Node {
        kit.c
            .graph
            .makecon(TypePtr::raw(PtrNull::Constant, Offset::Known(0)))
    }

    /// Dirty the card of `adr` (or of `obj` when not `use_precise`) after `oop_store` wrote
    /// `val`. Stores of null need no mark, nor do stores into an object allocated since the
    /// last safepoint when `allow_elide` is set and initial card marks are reduced.
    #[allow(clippy::too_many_arguments, reason = "one argument per barrier input")]
    fn post_barrier(
        &self,
        kit: &mut GraphKit<'_>,
        obj: Node,
        adr: Node,
        val: Option<Node>,
        use_precise: bool,
        allow_elide: bool,
        oop_store: Option<Node>,
    ) {
        if let Some(v) = val {
            if kit.c.graph.ty(v).make_ptr().is_some_and(TypePtr::is_null) {
                return;
            }
        }
        if allow_elide
            && self.reduce_initial_card_marks
            && kit.just_allocated_object(kit.control()) == Some(obj)
        {
            trace!("card mark for {} elided: fresh allocation", obj);
            return;
        }
        let adr = if use_precise { adr } else { obj };

        let ctl = kit.control();
        let g = &mut kit.c.graph;
        let top = g.top();
        let cast = g.add(
            Opcode::CastP2X,
            &[Some(ctl), Some(adr)],
            Type::Long(None),
            NodeInfo::None,
        );
        let shift = g.intcon(self.card_shift as i32);
        let card_offset = g.add_simple(Opcode::URShiftL, &[top, cast, shift], Type::Long(None));
        let base = self.byte_map_base(kit);
        let card_adr = kit.addp(top, base, card_offset);
        let dirty = kit.c.graph.intcon(DIRTY_CARD);

        if self.use_cond_card_mark {
            let card_val = kit.raw_load(card_adr, BasicType::Byte, Type::Int(None));
            let cmp = kit.cmp_i(card_val, dirty);
            let bol = kit.bool(cmp, BoolTest::Ne);
            let (clean, already_dirty) = kit.make_if(bol, 0.1);
            let skip = kit.state();
            kit.set_control(clean);
            self.mark_card(kit, card_adr, dirty, oop_store);
            let marked = kit.state();
            let mut skip = skip;
            skip.ctrl = already_dirty;
            kit.merge_states(&[marked, skip]);
        } else {
            self.mark_card(kit, card_adr, dirty, oop_store);
        }
        trace!("card mark for store into {}", obj);
    }

    fn mark_card(&self, kit: &mut GraphKit<'_>, card_adr: Node, dirty: Node, oop_store: Option<Node>) {
        let ctl = kit.control();
        let mem = kit.memory(AliasIdx::RAW);
        let cm = kit.c.graph.add(
            Opcode::StoreCM,
            &[Some(ctl), Some(mem), Some(card_adr), Some(dirty), oop_store],
            Type::Memory,
            NodeInfo::Mem(MemInfo::plain(BasicType::Byte)),
        );
        kit.set_memory(AliasIdx::RAW, cm);
    }

    fn atomic_post_barrier(&self, kit: &mut GraphKit<'_>, access: &C2AtomicAccess, new_val: Node) {
        let a = &access.access;
        if a.is_oop() && a.in_heap() && !a.is_raw() {
            self.post_barrier(kit, a.base, a.addr, Some(new_val), true, false, a.raw_access);
        }
    }
}

impl BarrierSetC2 for CardTableBarrierSetC2 {
    fn name(&self) -> &'static str {
        "card-table"
    }

    fn store_at_resolved(&self, kit: &mut GraphKit<'_>, access: &mut C2Access, val: Node) -> Node {
        let st = access::store_at_resolved(kit, access, val);
        if access.is_oop() && access.in_heap() && !access.is_raw() {
            let use_precise = access
                .decorators
                .intersects(Decorators::IS_ARRAY | Decorators::ON_UNKNOWN_OOP_REF);
            self.post_barrier(kit, access.base, access.addr, Some(val), use_precise, true, Some(st));
        }
        st
    }

    fn atomic_cmpxchg_val_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        let r = access::atomic_cmpxchg_val_at_resolved(kit, access, expected, new_val, val_type);
        self.atomic_post_barrier(kit, access, new_val);
        r
    }

    fn atomic_cmpxchg_bool_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        expected: Node,
        new_val: Node,
    ) -> Node {
        let r = access::atomic_cmpxchg_bool_at_resolved(kit, access, expected, new_val);
        self.atomic_post_barrier(kit, access, new_val);
        r
    }

    fn atomic_xchg_at_resolved(
        &self,
        kit: &mut GraphKit<'_>,
        access: &mut C2AtomicAccess,
        new_val: Node,
        val_type: &Type,
    ) -> Node {
        let r = access::atomic_xchg_at_resolved(kit, access, new_val, val_type);
        self.atomic_post_barrier(kit, access, new_val);
        r
    }

    fn clone(&self, kit: &mut GraphKit<'_>, src: Node, dst: Node, size: Node, is_array: bool) {
        access::clone(kit, src, dst, size, is_array);
        // Arrays are marked by the copy stub; instances get one imprecise mark.
        if !is_array {
            self.post_barrier(kit, dst, dst, None, false, false, None);
        }
    }

    fn array_copy_requires_gc_barriers(
        &self,
        tightly_coupled_alloc: bool,
        bt: BasicType,
        _is_clone: bool,
    ) -> bool {
        bt.is_reference() && (!tightly_coupled_alloc || !self.reduce_initial_card_marks)
    }

    fn is_gc_barrier_node(&self, c: &Compile, n: Node) -> bool {
        c.graph.op(n) == Opcode::StoreCM
    }

    fn eliminate_gc_barrier(&self, c: &mut Compile, n: Node) {
        debug_assert_eq!(c.graph.op(n), Opcode::CastP2X, "card address must start at a cast");
        for shift in c.graph.uses(n) {
            debug_assert_eq!(c.graph.op(shift), Opcode::URShiftL);
            for addp in c.graph.uses(shift) {
                debug_assert_eq!(c.graph.op(addp), Opcode::AddP);
                for mem in c.graph.uses(addp) {
                    match c.graph.op(mem) {
                        // The conditional mark reads the card first; a dirty reading folds the
                        // test and the mark under it goes away with the store below.
                        Opcode::Load => {
                            let zero = c.graph.intcon(DIRTY_CARD);
                            c.graph.replace_node(mem, zero);
                        }
                        op => {
                            debug_assert!(op.is_store(), "unexpected card mark shape at {mem}");
                            let prev = c
                                .graph
                                .input(mem, slot::mem::MEMORY)
                                .unwrap_or_else(|| c.graph.top());
                            trace!("card mark {} removed", mem);
                            c.graph.replace_node(mem, prev);
                        }
                    }
                }
            }
        }
        if !c.graph.is_dead(n) && c.graph.outcnt(n) == 0 {
            c.graph.remove_dead_node(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{KlassFlags, KlassTable};
    use crate::settings::{GcKind, builder};

    fn setup(cond: bool) -> (Compile, crate::ir::Klass) {
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance(
            "Pair",
            None,
            &[("a", BasicType::Object), ("b", BasicType::Object)],
            KlassFlags::empty(),
        );
        let mut b = builder();
        b.gc(GcKind::CardTable);
        b.set("use_cond_card_mark", if cond { "true" } else { "false" })
            .unwrap();
        (Compile::new(Flags::new(b), kt), k)
    }

    fn card_marks(c: &Compile) -> Vec<Node> {
        c.graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::StoreCM)
            .collect()
    }

    #[test]
    fn mark_shape() {
        let (mut c, k) = setup(false);
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull));
        let p = kit.parameter(0, ty.clone());
        let v = kit.parameter(1, ty);
        let st = kit.store_field(p, "a", v);
        let marks = card_marks(kit.c);
        assert_eq!(marks.len(), 1);
        let g = &kit.c.graph;
        let cm = marks[0];
        assert_eq!(g.input(cm, slot::mem::OOP_STORE), Some(st));
        let card_adr = g.input(cm, slot::mem::ADDRESS).unwrap();
        let shift = g.input(card_adr, slot::addp::OFFSET).unwrap();
        assert_eq!(g.op(shift), Opcode::URShiftL);
        let cast = g.input(shift, 1).unwrap();
        assert_eq!(g.op(cast), Opcode::CastP2X);
        // Imprecise: the card of the object start.
        assert_eq!(g.input(cast, 1), Some(p));
    }

    #[test]
    fn null_stores_are_not_marked() {
        let (mut c, k) = setup(false);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.parameter(0, Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull)));
        let null = kit.c.graph.null();
        kit.store_field(p, "a", null);
        assert!(card_marks(kit.c).is_empty());
    }

    #[test]
    fn eliminate_conditional_mark() {
        let (mut c, k) = setup(true);
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(k, false, PtrNull::NotNull));
        let p = kit.parameter(0, ty.clone());
        let v = kit.parameter(1, ty);
        kit.store_field(p, "b", v);
        let cast = kit
            .c
            .graph
            .live_node_iter()
            .find(|&n| kit.c.graph.op(n) == Opcode::CastP2X)
            .unwrap();
        let bs = kit.c.barrier_set();
        assert_eq!(card_marks(kit.c).len(), 1);
        bs.c2().eliminate_gc_barrier(kit.c, cast);
        assert!(card_marks(kit.c).is_empty());
        assert!(kit.c.graph.is_dead(cast));
    }
}
