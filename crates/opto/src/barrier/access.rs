//! Access descriptors and the collector independent part of every access.
//!
//! A [`C2Access`] lives for the duration of one load or store request; it carries the
//! decorators, the address and, once emitted, the raw memory node. [`C2AtomicAccess`] adds the
//! memory state captured after the leading fences.
//!
//! The `*_resolved` functions here emit the access itself with no collector barrier. Policies
//! call them from their own `*_resolved` overrides and add barriers around the result.

use crate::barrier::decorators::{Decorators, FencePlan, mem_node_mo, needs_cpu_membar};
use crate::compile::Compile;
use crate::ir::klass::{ARRAY_LENGTH_OFFSET, HEADER_SIZE, KLASS_OFFSET};
use crate::ir::{
    AliasIdx, BasicType, CallInfo, Graph, MemInfo, Node, NodeInfo, Offset, Opcode, Type, TypePtr,
    slot,
};
use crate::kit::GraphKit;
use crate::arraycopy::ArrayCopyKind;
use crate::trace;

/// One load or store request.
#[derive(Clone, Debug)]
pub struct C2Access {
    /// Decorators, completed by [`Decorators::fixup`].
    pub decorators: Decorators,
    /// Type of the value in memory.
    pub bt: BasicType,
    /// The object accessed; top for off-heap accesses.
    pub base: Node,
    /// The address accessed.
    pub addr: Node,
    /// Type of `addr`.
    pub adr_type: TypePtr,
    /// Alias class of `addr`.
    pub alias_idx: AliasIdx,
    /// The memory node emitted for the access.
    pub raw_access: Option<Node>,
}

impl C2Access {
    /// Describe an access to `addr` inside `base`.
    pub fn new(
        kit: &mut GraphKit<'_>,
        decorators: Decorators,
        bt: BasicType,
        base: Node,
        addr: Node,
    ) -> Self {
        let adr_type = kit
            .c
            .graph
            .ty(addr)
            .isa_ptr()
            .cloned()
            .unwrap_or_else(TypePtr::bottom);
        let known_field = is_known_field(kit.c, &adr_type);
        let decorators = decorators.fixup(bt, known_field);
        let alias_idx = kit.c.alias_index(&adr_type);
        Self {
            decorators,
            bt,
            base,
            addr,
            adr_type,
            alias_idx,
            raw_access: None,
        }
    }

    /// Is a heap reference accessed?
    pub fn is_oop(&self) -> bool {
        self.bt.is_reference()
    }

    /// Must collector barriers be skipped?
    pub fn is_raw(&self) -> bool {
        self.decorators.contains(Decorators::AS_RAW)
    }

    /// Is the location in the heap, as far as barriers are concerned?
    pub fn in_heap(&self) -> bool {
        self.decorators.contains(Decorators::IN_HEAP)
    }

    /// Must the access be bracketed by CPU order barriers?
    pub fn needs_cpu_membar(&self) -> bool {
        needs_cpu_membar(self.decorators, self.adr_type.is_aryptr())
    }

    /// The fences emitted around the access.
    pub fn fence_plan(&self, iriw: bool) -> FencePlan {
        FencePlan::for_access(self.decorators, self.adr_type.is_aryptr(), iriw)
    }

    /// Payload of the memory node.
    pub fn mem_info(&self) -> MemInfo {
        MemInfo {
            bt: self.bt,
            order: mem_node_mo(self.decorators, self.bt),
            mismatched: self.decorators.contains(Decorators::C2_MISMATCHED),
            unsafe_access: self.decorators.contains(Decorators::C2_UNSAFE_ACCESS),
        }
    }
}

/// A read-modify-write request.
#[derive(Clone, Debug)]
pub struct C2AtomicAccess {
    /// The access proper.
    pub access: C2Access,
    /// Memory state of the slice, captured after the leading fences.
    pub memory: Option<Node>,
    /// Whether the memory effect is published through an `SCMemProj`.
    pub needs_pinning: bool,
}

impl C2AtomicAccess {
    /// Describe an atomic access to `addr` inside `base`.
    pub fn new(
        kit: &mut GraphKit<'_>,
        decorators: Decorators,
        bt: BasicType,
        base: Node,
        addr: Node,
    ) -> Self {
        let decorators = decorators | Decorators::C2_READ_ACCESS | Decorators::C2_WRITE_ACCESS;
        Self {
            access: C2Access::new(kit, decorators, bt, base, addr),
            memory: None,
            needs_pinning: true,
        }
    }

    /// Alias class of the accessed location.
    pub fn alias_idx(&self) -> AliasIdx {
        self.access.alias_idx
    }
}

/// Does `adr_type` name a declared field of an instance, so that an unsafe access through it can
/// be treated like a field access?
fn is_known_field(c: &Compile, adr_type: &TypePtr) -> bool {
    if !adr_type.is_instptr() {
        return false;
    }
    match (adr_type.klass, adr_type.offset) {
        (Some(k), Offset::Known(off)) if off >= HEADER_SIZE => c.klasses.field_at(k, off).is_some(),
        _ => false,
    }
}

fn leading_fences(kit: &mut GraphKit<'_>, plan: &FencePlan) {
    if let Some(op) = plan.leading {
        kit.insert_mem_bar(op, None);
    }
    if plan.cpu_order {
        kit.insert_mem_bar(Opcode::MemBarCPUOrder, None);
    }
}

fn trailing_fences(kit: &mut GraphKit<'_>, plan: &FencePlan, raw_access: Option<Node>) {
    if plan.cpu_order {
        kit.insert_mem_bar(Opcode::MemBarCPUOrder, None);
    }
    match plan.trailing {
        // The full fence after a volatile store orders it against everything that follows,
        // not just against one access.
        Some(Opcode::MemBarVolatile) => {
            kit.insert_mem_bar(Opcode::MemBarVolatile, None);
        }
        Some(op) => {
            kit.insert_mem_bar(op, raw_access);
        }
        None => {}
    }
}

/// Run `body` between the fences `access` needs.
pub fn fenced<'c, T>(
    kit: &mut GraphKit<'c>,
    access: &mut C2Access,
    body: impl FnOnce(&mut GraphKit<'c>, &mut C2Access) -> T,
) -> T {
    let plan = access.fence_plan(kit.c.flags().support_iriw());
    trace!("access {} {:?}: fences {}", access.addr, access.decorators, plan);
    leading_fences(kit, &plan);
    let result = body(kit, access);
    trailing_fences(kit, &plan, access.raw_access);
    result
}

/// Run `body` between the fences an atomic access needs. The memory state of the slice is
/// captured after the leading fences.
pub fn fenced_atomic<'c, T>(
    kit: &mut GraphKit<'c>,
    access: &mut C2AtomicAccess,
    body: impl FnOnce(&mut GraphKit<'c>, &mut C2AtomicAccess) -> T,
) -> T {
    let plan = access.access.fence_plan(kit.c.flags().support_iriw());
    trace!("atomic {} {:?}: fences {}", access.access.addr, access.access.decorators, plan);
    leading_fences(kit, &plan);
    access.memory = Some(kit.memory(access.alias_idx()));
    let result = body(kit, access);
    trailing_fences(kit, &plan, access.access.raw_access);
    result
}

/// Emit a store with no barrier.
pub fn store_at_resolved(kit: &mut GraphKit<'_>, access: &mut C2Access, val: Node) -> Node {
    let ctl = kit.control();
    let st = kit.store_to_memory(Some(ctl), access.addr, val, access.mem_info());
    access.raw_access = Some(st);
    st
}

/// Emit a load with no barrier.
pub fn load_at_resolved(kit: &mut GraphKit<'_>, access: &mut C2Access, val_type: &Type) -> Node {
    let ctl = access
        .decorators
        .contains(Decorators::C2_CONTROL_DEPENDENT_LOAD)
        .then(|| kit.control());
    let ld = kit.make_load(ctl, access.addr, val_type.clone(), access.mem_info());
    access.raw_access = Some(ld);
    ld
}

/// Publish the memory effect of the atomic just emitted on its slice.
pub fn pin_atomic_op(kit: &mut GraphKit<'_>, access: &C2AtomicAccess) {
    let Some(load_store) = access.access.raw_access else {
        return;
    };
    let proj = kit
        .c
        .graph
        .add_simple(Opcode::SCMemProj, &[load_store], Type::Memory);
    kit.set_memory(access.alias_idx(), proj);
}

/// Emit the read-modify-write node `op`. `expected` is only given for compare-and-swap
/// flavours. Compressed references are encoded on the way in and decoded on the way out.
pub fn atomic_op(
    kit: &mut GraphKit<'_>,
    access: &mut C2AtomicAccess,
    op: Opcode,
    expected: Option<Node>,
    new_val: Node,
    val_type: &Type,
) -> Node {
    let narrow = access.access.is_oop()
        && kit.c.klasses.compressed_oops()
        && !access.access.adr_type.is_raw();
    let returns_flag = matches!(
        op,
        Opcode::CompareAndSwap
            | Opcode::WeakCompareAndSwap
            | Opcode::GcCompareAndSwap
            | Opcode::GcWeakCompareAndSwap
    );
    let mut info = access.access.mem_info();
    let (new_val, expected, result_ty) = if narrow {
        info.bt = BasicType::NarrowOop;
        let g = &mut kit.c.graph;
        let top = g.top();
        let encode = |g: &mut Graph, v: Node| {
            let tp = g
                .ty(v)
                .make_ptr()
                .cloned()
                .unwrap_or_else(TypePtr::null_ptr);
            g.add_simple(Opcode::EncodeP, &[top, v], Type::NarrowOop(tp))
        };
        let new_val = encode(g, new_val);
        let expected = expected.map(|e| encode(g, e));
        let ty = match val_type.make_ptr() {
            Some(tp) if !returns_flag => Type::NarrowOop(tp.clone()),
            _ => val_type.clone(),
        };
        (new_val, expected, ty)
    } else {
        (new_val, expected, val_type.clone())
    };
    let result_ty = if returns_flag {
        Type::Int(None)
    } else {
        result_ty
    };
    let mem = access
        .memory
        .unwrap_or_else(|| kit.memory(access.alias_idx()));
    let ctl = kit.control();
    let load_store = kit.c.graph.add(
        op,
        &[Some(ctl), Some(mem), Some(access.access.addr), Some(new_val), expected],
        result_ty,
        NodeInfo::Mem(info),
    );
    access.access.raw_access = Some(load_store);
    if access.needs_pinning {
        pin_atomic_op(kit, access);
    }
    if narrow && !returns_flag {
        let top = kit.c.graph.top();
        kit.c
            .graph
            .add_simple(Opcode::DecodeN, &[top, load_store], val_type.clone())
    } else {
        load_store
    }
}

/// Compare-and-exchange with no barrier. Returns the previous value.
pub fn atomic_cmpxchg_val_at_resolved(
    kit: &mut GraphKit<'_>,
    access: &mut C2AtomicAccess,
    expected: Node,
    new_val: Node,
    val_type: &Type,
) -> Node {
    atomic_op(kit, access, Opcode::CompareAndExchange, Some(expected), new_val, val_type)
}

/// Compare-and-swap with no barrier. Returns 1 on success.
pub fn atomic_cmpxchg_bool_at_resolved(
    kit: &mut GraphKit<'_>,
    access: &mut C2AtomicAccess,
    expected: Node,
    new_val: Node,
) -> Node {
    let op = if access.access.decorators.contains(Decorators::C2_WEAK_CMPXCHG) {
        Opcode::WeakCompareAndSwap
    } else {
        Opcode::CompareAndSwap
    };
    atomic_op(kit, access, op, Some(expected), new_val, &Type::Int(None))
}

/// Atomic exchange with no barrier. Returns the previous value.
pub fn atomic_xchg_at_resolved(
    kit: &mut GraphKit<'_>,
    access: &mut C2AtomicAccess,
    new_val: Node,
    val_type: &Type,
) -> Node {
    atomic_op(kit, access, Opcode::GetAndSet, None, new_val, val_type)
}

/// Atomic add with no barrier. Returns the previous value.
pub fn atomic_add_at_resolved(
    kit: &mut GraphKit<'_>,
    access: &mut C2AtomicAccess,
    delta: Node,
    val_type: &Type,
) -> Node {
    atomic_op(kit, access, Opcode::GetAndAdd, None, delta, val_type)
}

/// Offset where a word-wise clone starts copying: the header word after the mark, rounded to a
/// word boundary so that the copy can proceed in 8 byte units.
pub fn clone_payload_base_offset(is_array: bool) -> i32 {
    let first = if is_array {
        ARRAY_LENGTH_OFFSET
    } else {
        HEADER_SIZE
    };
    let aligned = first & !7;
    debug_assert_eq!(aligned, KLASS_OFFSET);
    aligned
}

/// Copy every word of `src` after the mark into `dst`, which has `size` bytes, as a basic clone.
pub fn clone(kit: &mut GraphKit<'_>, src: Node, dst: Node, size: Node, is_array: bool) -> Node {
    let base_off = i64::from(clone_payload_base_offset(is_array));
    let words = match kit.c.graph.find_int_con(size) {
        Some(s) => kit.c.graph.intptrcon((s - base_off) >> 3),
        None => {
            let g = &mut kit.c.graph;
            let top = g.top();
            let base = g.longcon(base_off);
            let payload = g.add_simple(Opcode::SubL, &[top, size, base], Type::Long(None));
            let shift = g.intcon(3);
            g.add_simple(Opcode::URShiftL, &[top, payload, shift], Type::Long(None))
        }
    };
    let pos = kit.c.graph.intptrcon(base_off);
    let tightly_coupled = kit.just_allocated_object(kit.control()) == Some(dst);
    kit.make_arraycopy(
        ArrayCopyKind::CloneBasic,
        src,
        pos,
        dst,
        pos,
        words,
        true,
        tightly_coupled,
    )
}

/// Replace the basic clone `ac` by a call to the copy stub `stub`.
pub fn clone_at_expansion_with(c: &mut Compile, ac: Node, stub: &str) {
    let g = &c.graph;
    let input = |i| g.input(ac, i).unwrap_or_else(|| g.top());
    let (ctl, io, mem) = (input(slot::CONTROL), input(slot::I_O), input(slot::MEMORY));
    let src = input(slot::arraycopy::SRC);
    let src_off = input(slot::arraycopy::SRC_POS);
    let dst = input(slot::arraycopy::DEST);
    let dst_off = input(slot::arraycopy::DEST_POS);
    let len = input(slot::arraycopy::LENGTH);
    trace!("clone {} lowered to a call to {}", ac, stub);

    let mut kit = GraphKit::at(c, ctl, io, mem);
    let src_adr = kit.addp(src, src, src_off);
    let dst_adr = kit.addp(dst, dst, dst_off);
    let info = CallInfo {
        name: stub.to_string(),
        arraycopy_stub: true,
        ..CallInfo::default()
    };
    let call = kit.make_call_node(Opcode::CallLeafNoFP, info, &[src_adr, dst_adr, len]);
    c.graph.replace_node(ac, call);
    c.graph.remove_macro_node(ac);
}

/// Replace the basic clone `ac` by a call to the plain word copy stub.
pub fn clone_at_expansion(c: &mut Compile, ac: Node) {
    clone_at_expansion_with(c, ac, "arraycopy");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Klass, KlassFlags, KlassTable, PtrNull};
    use crate::settings::{Flags, GcKind, builder};

    fn compile() -> (Compile, Klass) {
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance(
            "Holder",
            None,
            &[("i", BasicType::Int), ("o", BasicType::Object)],
            KlassFlags::empty(),
        );
        let mut b = builder();
        b.gc(GcKind::NoOp);
        (Compile::new(Flags::new(b), kt), k)
    }

    #[test]
    fn atomic_on_compressed_reference() {
        let (mut c, k) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(k);
        let adr = kit.basic_plus_adr(h, h, 16);
        let null = kit.c.graph.null();
        let ty = Type::Ptr(TypePtr::inst(kit.c.klasses.object(), false, PtrNull::Maybe));
        let old = kit.access_atomic_xchg_at(h, adr, BasicType::Object, null, ty, Decorators::MO_SEQ_CST);
        assert_eq!(kit.c.graph.op(old), Opcode::DecodeN);
        let xchg = kit.c.graph.input(old, 1).unwrap();
        assert_eq!(kit.c.graph.op(xchg), Opcode::GetAndSet);
        let enc = kit.c.graph.input(xchg, slot::mem::VALUE).unwrap();
        assert_eq!(kit.c.graph.op(enc), Opcode::EncodeP);
        match kit.c.graph.info(xchg) {
            NodeInfo::Mem(m) => assert_eq!(m.bt, BasicType::NarrowOop),
            other => panic!("unexpected payload {other:?}"),
        }
        // The slice's memory now comes from the pinned projection.
        let idx = kit.c.alias_index(&kit.c.graph.ty(adr).isa_ptr().unwrap().clone());
        let before_fence = kit
            .c
            .graph
            .find_out_with(xchg, Opcode::SCMemProj)
            .unwrap();
        assert_eq!(kit.c.graph.op(before_fence), Opcode::SCMemProj);
        assert_ne!(kit.memory(idx), before_fence, "trailing fence publishes a new state");
    }

    #[test]
    fn cas_returns_flag() {
        let (mut c, k) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(k);
        let adr = kit.basic_plus_adr(h, h, 12);
        let zero = kit.c.graph.intcon(0);
        let one = kit.c.graph.intcon(1);
        let ok = kit.access_atomic_cmpxchg_bool_at(h, adr, BasicType::Int, zero, one, Decorators::MO_SEQ_CST);
        assert_eq!(kit.c.graph.op(ok), Opcode::CompareAndSwap);
        assert_eq!(*kit.c.graph.ty(ok), Type::Int(None));
        assert_eq!(kit.c.graph.input(ok, slot::mem::EXPECTED), Some(zero));
    }

    #[test]
    fn basic_clone_copies_words() {
        let (mut c, k) = compile();
        let size = i64::from(c.klasses.instance_size(k));
        let mut kit = GraphKit::new(&mut c);
        let src = kit.parameter(0, Type::Ptr(TypePtr::inst(k, true, PtrNull::NotNull)));
        let dst = kit.new_instance(k);
        let size = kit.c.graph.intptrcon(size);
        let ac = clone(&mut kit, src, dst, size, false);
        let len = kit.c.graph.input(ac, slot::arraycopy::LENGTH).unwrap();
        assert_eq!(kit.c.graph.find_int_con(len), Some((24 - 8) >> 3));
        match kit.c.graph.info(ac) {
            NodeInfo::ArrayCopy(info) => {
                assert_eq!(info.kind, ArrayCopyKind::CloneBasic);
                assert!(info.alloc_tightly_coupled);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
