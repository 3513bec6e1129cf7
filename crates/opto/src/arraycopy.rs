//! Bulk copies: `System.arraycopy`, `Object.clone` and `Arrays.copyOf`.
//!
//! An `ArrayCopy` node is a call-like node carrying the copy's operands. It either stays a call
//! to a copy stub, or, when the element count is a small constant and the arguments were
//! validated, it is lowered to one load and one store per element.
//!
//! Escape analysis and scalar replacement also need to know which memory a copy can write; the
//! `may_modify` and `modifies` queries answer that.

use crate::compile::Compile;
use crate::ir::klass::{ARRAY_BASE_OFFSET, KlassFlags};
use crate::ir::{
    ArrayCopyInfo, BasicType, BoolTest, CallInfo, Graph, MemInfo, Node, NodeInfo, Opcode, PtrNull,
    Type, TypePtr, slot,
};
use crate::kit::GraphKit;
use crate::timing::{self, Pass};
use crate::trace;
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// Flavour of a bulk copy. Fixed when the node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum ArrayCopyKind {
    /// `System.arraycopy`.
    ArrayCopy,
    /// Word-wise copy of a whole object or array for `Object.clone`.
    CloneBasic,
    /// Clone of an array of references, element by element.
    CloneOop,
    /// `Arrays.copyOf`.
    CopyOf,
    /// `Arrays.copyOfRange`.
    CopyOfRange,
}

/// Probability of the backward path when the copy direction is tested at run time.
const PROB_FAIR: f32 = 0.5;

fn info(g: &Graph, ac: Node) -> Option<&ArrayCopyInfo> {
    match g.info(ac) {
        NodeInfo::ArrayCopy(i) => Some(i),
        other => {
            debug_assert!(false, "{ac} is not an array copy: {other:?}");
            None
        }
    }
}

fn input(g: &Graph, ac: Node, i: usize) -> Node {
    g.input(ac, i).unwrap_or_else(|| g.top())
}

/// Flavour of the copy `ac`, or `None` if `ac` is not a copy.
pub fn kind(g: &Graph, ac: Node) -> Option<ArrayCopyKind> {
    info(g, ac).map(|i| i.kind)
}

/// Is `ac` a word-wise clone?
pub fn is_clonebasic(g: &Graph, ac: Node) -> bool {
    kind(g, ac) == Some(ArrayCopyKind::CloneBasic)
}

/// Is `ac` an `arraycopy` whose bounds and types were checked up front?
pub fn is_arraycopy_validated(g: &Graph, ac: Node) -> bool {
    info(g, ac).is_some_and(|i| i.kind == ArrayCopyKind::ArrayCopy && i.arguments_validated)
}

/// Is `ac` a validated `copyOf`?
pub fn is_copyof_validated(g: &Graph, ac: Node) -> bool {
    info(g, ac).is_some_and(|i| i.kind == ArrayCopyKind::CopyOf && i.arguments_validated)
}

/// Is `ac` a validated `copyOfRange`?
pub fn is_copyofrange_validated(g: &Graph, ac: Node) -> bool {
    info(g, ac).is_some_and(|i| i.kind == ArrayCopyKind::CopyOfRange && i.arguments_validated)
}

/// Is the destination of `ac` a fresh allocation with no safepoint in between?
pub fn is_alloc_tightly_coupled(g: &Graph, ac: Node) -> bool {
    info(g, ac).is_some_and(|i| i.alloc_tightly_coupled)
}

/// Normalized element type of an array type: every kind of reference is `Object`.
fn array_elem(tp: &TypePtr) -> Option<BasicType> {
    let e = tp.elem?;
    Some(if e.is_reference() { BasicType::Object } else { e })
}

/// Can a copy into objects of type `dest_t` write memory of type `t_oop`?
fn may_modify_arraycopy_helper(c: &Compile, dest_t: &TypePtr, t_oop: &TypePtr) -> bool {
    if dest_t.is_known_instance() && t_oop.is_known_instance() {
        return dest_t.instance_id == t_oop.instance_id;
    }
    if dest_t.is_instptr() && dest_t.klass != Some(c.klasses.object()) {
        // A clone.
        if t_oop.is_aryptr() {
            return false;
        }
        if !t_oop.is_instptr() {
            return true;
        }
        return dest_t.maybe_subtype_of(t_oop, &c.klasses)
            || t_oop.maybe_subtype_of(dest_t, &c.klasses);
    }
    if dest_t.is_aryptr() {
        if t_oop.is_instptr() {
            return false;
        }
        if !t_oop.is_aryptr() {
            return true;
        }
        return match (array_elem(dest_t), array_elem(t_oop)) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
    }
    true
}

/// Can the call `call`, an array copy or a copy stub, write memory of type `t_oop`?
pub fn call_may_modify(c: &Compile, call: Node, t_oop: &TypePtr) -> bool {
    let g = &c.graph;
    if g.op(call) == Opcode::ArrayCopy {
        let dest = input(g, call, slot::arraycopy::DEST);
        if g.is_top(dest) {
            return false;
        }
        let Some(i) = info(g, call) else {
            return true;
        };
        if i.dest_type.is_some() || t_oop.is_known_instance() {
            let dest_id = i.dest_type.as_ref().and_then(|t| t.instance_id);
            return dest_id.is_some() && t_oop.instance_id == dest_id;
        }
        return match g.ty(dest).isa_oopptr() {
            Some(dest_t) => may_modify_arraycopy_helper(c, dest_t, t_oop),
            None => true,
        };
    }
    let is_stub = matches!(g.info(call), NodeInfo::Call(ci) if ci.arraycopy_stub);
    if !is_stub {
        return true;
    }
    (slot::PARMS..g.req(call)).any(|i| {
        let mut arg = input(g, call, i);
        if g.op(arg) == Opcode::AddP {
            arg = input(g, arg, slot::addp::BASE);
        }
        g.ty(arg)
            .isa_oopptr()
            .is_some_and(|t| may_modify_arraycopy_helper(c, t, t_oop))
    })
}

/// Can `call` write memory of type `t_oop`, a known instance?
///
/// Scalar replaceable objects are never passed to ordinary calls, so only copies need a closer
/// look.
pub fn may_modify_instance(c: &Compile, call: Node, t_oop: &TypePtr) -> bool {
    let g = &c.graph;
    let is_copy = g.op(call) == Opcode::ArrayCopy
        || matches!(g.info(call), NodeInfo::Call(ci) if ci.arraycopy_stub);
    if !t_oop.is_known_instance() {
        return !is_copy || call_may_modify(c, call, t_oop);
    }
    is_copy && call_may_modify(c, call, t_oop)
}

fn may_modify_helper(c: &Compile, t_oop: &TypePtr, n: Option<Node>) -> Option<Node> {
    let n = n?;
    let g = &c.graph;
    let op = g.op(n);
    let is_copy = op == Opcode::ArrayCopy
        || matches!(g.info(n), NodeInfo::Call(ci) if ci.arraycopy_stub);
    (op.is_call() && is_copy && call_may_modify(c, n, t_oop)).then_some(n)
}

/// The copy right before memory barrier `mb` that may write memory of type `t_oop`, if any.
///
/// Clones publish only their raw memory effect and rely on the barrier after them; memory chain
/// walks that reach such a barrier use this to decide whether they may step over it.
pub fn may_modify(c: &Compile, t_oop: &TypePtr, mb: Node) -> Option<Node> {
    let g = &c.graph;
    let ctl = g.input(mb, slot::CONTROL)?;
    let ctl = c.barrier_set().c2().step_over_gc_barrier(c, ctl);
    if g.op(ctl) == Opcode::Region {
        (1..g.req(ctl)).find_map(|i| {
            let pred = g.input(ctl, i)?;
            may_modify_helper(c, t_oop, g.input(pred, 0))
        })
    } else {
        may_modify_helper(c, t_oop, g.input(ctl, 0))
    }
}

/// Does the array copy `ac` write bytes `offset_lo..=offset_hi` of its destination?
///
/// With `must_modify` the answer is yes only if every possible execution writes them;
/// otherwise it is yes if any execution may. Unknown positions or lengths give the
/// conservative answer.
pub fn modifies(c: &Compile, ac: Node, offset_lo: i64, offset_hi: i64, must_modify: bool) -> bool {
    let g = &c.graph;
    debug_assert!(
        !matches!(kind(g, ac), Some(ArrayCopyKind::CloneBasic)),
        "only for real array copies"
    );
    let dest = input(g, ac, slot::arraycopy::DEST);
    let dest_pos = g.find_int_con(input(g, ac, slot::arraycopy::DEST_POS));
    let len = g.find_int_con(input(g, ac, slot::arraycopy::LENGTH));
    let elem = g.ty(dest).isa_ptr().and_then(array_elem);
    let (Some(dest_pos), Some(len), Some(elem)) = (dest_pos, len, elem) else {
        return !must_modify;
    };
    let esize = i64::from(elem.size_in_bytes(c.klasses.compressed_oops()));
    let header = i64::from(ARRAY_BASE_OFFSET);
    let lo = dest_pos * esize + header;
    let end = (dest_pos + len) * esize + header;
    if must_modify {
        offset_lo >= lo && offset_hi < end
    } else {
        offset_hi >= lo && offset_lo < end
    }
}

/// Number of elements (or fields) `ac` copies, when known.
fn get_count(c: &Compile, ac: Node) -> Option<i64> {
    let g = &c.graph;
    if is_clonebasic(g, ac) {
        let src = input(g, ac, slot::arraycopy::SRC);
        let tp = g.ty(src).isa_oopptr()?;
        if tp.is_instptr() {
            let k = tp.klass?;
            let flags = c.klasses.flags(k);
            if !tp.exact && flags.intersects(KlassFlags::HAS_SUBKLASS | KlassFlags::NOT_INSTANTIABLE) {
                return None;
            }
            // Injected fields are not in the field list.
            if flags.contains(KlassFlags::HAS_INJECTED_FIELDS) {
                return None;
            }
            return Some(c.klasses.nonstatic_fields(k).len() as i64);
        }
        // Arrays are cloned element by element.
        return tp.len.map(i64::from);
    }
    g.find_int_con(input(g, ac, slot::arraycopy::LENGTH))
}

/// What an element-wise copy of an array needs.
struct CopyPlan {
    src: Node,
    dest: Node,
    src_pos: Node,
    dest_pos: Node,
    elem: BasicType,
    value_type: Type,
    disjoint_bases: bool,
}

fn value_type_of(c: &Compile, elem: BasicType) -> Type {
    if elem.is_reference() {
        Type::Ptr(TypePtr::inst(c.klasses.object(), false, PtrNull::Maybe))
    } else {
        Type::of_basic_type(elem)
    }
}

fn prepare_array_copy(c: &mut Compile, ac: Node) -> Option<CopyPlan> {
    let g = &c.graph;
    let src = input(g, ac, slot::arraycopy::SRC);
    let dest = input(g, ac, slot::arraycopy::DEST);
    let src_t = g.ty(src).isa_ptr().filter(|t| t.is_aryptr())?;
    let dest_t = g.ty(dest).isa_ptr().filter(|t| t.is_aryptr())?;
    let src_elem = array_elem(src_t)?;
    let dest_elem = array_elem(dest_t)?;
    let tightly_coupled = is_alloc_tightly_coupled(g, ac);
    let clone = is_clonebasic(g, ac);
    if src_elem != dest_elem || dest_elem == BasicType::Void {
        trace!("{} not lowered: element types {} and {}", ac, src_elem, dest_elem);
        return None;
    }
    let bs = c.barrier_set();
    if bs
        .c2()
        .array_copy_requires_gc_barriers(tightly_coupled, dest_elem, clone)
    {
        trace!("{} not lowered: copy needs collector barriers", ac);
        return None;
    }
    let (src_pos, dest_pos, disjoint_bases) = if clone {
        let zero = c.graph.intcon(0);
        (zero, zero, true)
    } else {
        let g = &c.graph;
        let src_pos = input(g, ac, slot::arraycopy::SRC_POS);
        let dest_pos = input(g, ac, slot::arraycopy::DEST_POS);
        let fresh_dest = tightly_coupled
            || matches!(
                kind(g, ac),
                Some(ArrayCopyKind::CopyOf | ArrayCopyKind::CopyOfRange)
            );
        let distinct_allocs = match (g.ideal_allocation(src), g.ideal_allocation(dest)) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };
        (src_pos, dest_pos, fresh_dest || distinct_allocs)
    };
    Some(CopyPlan {
        src,
        dest,
        src_pos,
        dest_pos,
        elem: dest_elem,
        value_type: value_type_of(c, dest_elem),
        disjoint_bases,
    })
}

/// Element `pos + i`. Constant positions were checked by [`lower`] to stay in `int` range.
fn index_plus(kit: &mut GraphKit<'_>, pos: Node, i: i64) -> Node {
    let g = &mut kit.c.graph;
    if let Some(p) = g.find_int_con(pos) {
        let sum = i32::try_from(p + i);
        debug_assert!(sum.is_ok(), "element {p} + {i} out of range");
        if let Ok(sum) = sum {
            return g.intcon(sum);
        }
    }
    if i == 0 {
        return pos;
    }
    let Ok(delta) = i32::try_from(i) else {
        debug_assert!(false, "element offset {i} out of range");
        return pos;
    };
    let top = g.top();
    let off = g.intcon(delta);
    g.add_simple(Opcode::AddI, &[top, pos, off], Type::Int(None))
}

/// Copy `count` elements in increasing (or, if `backward`, decreasing) index order, each load
/// reading the memory left by the previous store.
fn copy_elements(kit: &mut GraphKit<'_>, plan: &CopyPlan, count: i64, backward: bool) {
    let ctl = kit.control();
    let mut order: Vec<i64> = (0..count).collect();
    if backward {
        order.reverse();
    }
    for i in order {
        let si = index_plus(kit, plan.src_pos, i);
        let di = index_plus(kit, plan.dest_pos, i);
        let src_adr = kit.array_element_address(plan.src, si, plan.elem);
        let v = kit.make_load(
            Some(ctl),
            src_adr,
            plan.value_type.clone(),
            MemInfo::plain(plan.elem),
        );
        let dest_adr = kit.array_element_address(plan.dest, di, plan.elem);
        kit.store_to_memory(Some(ctl), dest_adr, v, MemInfo::plain(plan.elem));
    }
}

/// Replace the outputs of `ac` and remove it. For clones, whose memory projection only feeds the
/// barrier's merged memory, `mem_user` is that `MergeMem`.
fn finish_transform(c: &mut Compile, ac: Node, ctl: Node, mem: Node, mem_user: Option<Node>) {
    let g = &mut c.graph;
    let io_in = input(g, ac, slot::I_O);
    match mem_user {
        Some(mm) => g.replace_node(mm, mem),
        None => {
            if let Some(p) = g.proj_out(ac, slot::MEMORY) {
                g.replace_node(p, mem);
            }
        }
    }
    if let Some(p) = g.proj_out(ac, slot::I_O) {
        g.replace_node(p, io_in);
    }
    if let Some(p) = g.proj_out(ac, slot::CONTROL) {
        g.replace_node(p, ctl);
    }
    if !g.is_dead(ac) {
        debug_assert_eq!(g.outcnt(ac), 0, "{ac} still has users");
        g.remove_dead_node(ac);
    }
}

/// The `MergeMem` a clone's memory projection feeds, when the clone has the expected shape: one
/// `MergeMem` used only by the barrier after the clone. Card marks on the copy hang off the
/// projection as well and prevent lowering.
fn clone_memory_user(g: &Graph, ac: Node) -> Option<Node> {
    let mem = g.proj_out(ac, slot::MEMORY)?;
    let mm = g.unique_out(mem).filter(|&m| g.op(m) == Opcode::MergeMem)?;
    let bar = g.unique_out(mm)?;
    g.op(bar).is_membar().then_some(mm)
}

/// Lower a clone of an instance into one load and store per field.
fn clone_instance(c: &mut Compile, ac: Node, count: i64) -> bool {
    let g = &c.graph;
    let src = input(g, ac, slot::arraycopy::SRC);
    let dest = input(g, ac, slot::arraycopy::DEST);
    let Some(k) = g.ty(src).isa_oopptr().and_then(|t| t.klass) else {
        return false;
    };
    let Some(mm) = clone_memory_user(g, ac) else {
        trace!("{} not lowered: clone memory is used by card marks", ac);
        return false;
    };
    let fields: Vec<(i32, BasicType)> = c
        .klasses
        .nonstatic_fields(k)
        .iter()
        .map(|f| (f.offset, f.bt))
        .collect();
    debug_assert_eq!(fields.len() as i64, count);
    let bs = c.barrier_set();
    if fields.iter().any(|&(_, bt)| bt.is_reference())
        && bs
            .c2()
            .array_copy_requires_gc_barriers(is_alloc_tightly_coupled(g, ac), BasicType::Object, true)
    {
        trace!("{} not lowered: reference fields need collector barriers", ac);
        return false;
    }

    let (ctl, io, mem) = (
        input(g, ac, slot::CONTROL),
        input(g, ac, slot::I_O),
        input(g, ac, slot::MEMORY),
    );
    let mut kit = GraphKit::at(c, ctl, io, mem);
    for (offset, bt) in fields {
        let value_type = value_type_of(kit.c, bt);
        let src_adr = kit.basic_plus_adr(src, src, i64::from(offset));
        let v = kit.make_load(Some(ctl), src_adr, value_type, MemInfo::plain(bt));
        let dest_adr = kit.basic_plus_adr(dest, dest, i64::from(offset));
        kit.store_to_memory(Some(ctl), dest_adr, v, MemInfo::plain(bt));
    }
    let mem = kit.merged_memory();
    trace!("clone {} lowered to {} field copies", ac, count);
    finish_transform(c, ac, ctl, mem, Some(mm));
    true
}

/// Try to replace `ac` by loads and stores. Returns whether it was lowered; if not, the graph is
/// unchanged and the copy stays a call.
pub fn lower(c: &mut Compile, ac: Node) -> bool {
    let _tt = timing::start(Pass::ArraycopyLower);
    let g = &c.graph;
    if !is_clonebasic(g, ac)
        && !is_arraycopy_validated(g, ac)
        && !is_copyof_validated(g, ac)
        && !is_copyofrange_validated(g, ac)
    {
        return false;
    }
    let max = i64::from(c.flags().array_copy_load_store_max_elem());
    let count = match get_count(c, ac) {
        Some(n) if (0..=max).contains(&n) => n,
        other => {
            trace!("{} not lowered: count {:?}", ac, other);
            return false;
        }
    };
    let g = &c.graph;
    if is_clonebasic(g, ac)
        && g
            .ty(input(g, ac, slot::arraycopy::SRC))
            .isa_oopptr()
            .is_some_and(TypePtr::is_instptr)
    {
        return clone_instance(c, ac, count);
    }
    let mem_user = if is_clonebasic(g, ac) {
        match clone_memory_user(g, ac) {
            Some(mm) => Some(mm),
            None => return false,
        }
    } else {
        None
    };
    let Some(plan) = prepare_array_copy(c, ac) else {
        return false;
    };

    let g = &c.graph;
    let (ctl, io, mem) = (
        input(g, ac, slot::CONTROL),
        input(g, ac, slot::I_O),
        input(g, ac, slot::MEMORY),
    );
    let src_pos_con = g.find_int_con(plan.src_pos);
    let dest_pos_con = g.find_int_con(plan.dest_pos);
    let in_range = |p: Option<i64>| p.is_none_or(|p| i32::try_from(p + count).is_ok());
    if !in_range(src_pos_con) || !in_range(dest_pos_con) {
        trace!("{} not lowered: positions {:?} {:?} overflow", ac, src_pos_con, dest_pos_con);
        return false;
    }
    let mut kit = GraphKit::at(c, ctl, io, mem);

    let (ctl, mem) = if plan.disjoint_bases || count <= 1 {
        copy_elements(&mut kit, &plan, count, false);
        (kit.control(), kit.merged_memory())
    } else if let (Some(s), Some(d)) = (src_pos_con, dest_pos_con) {
        // The overlap test folds: copying down to a higher index must start from the top.
        let backward = s < d;
        trace!("{} copies {}", ac, if backward { "backward" } else { "forward" });
        copy_elements(&mut kit, &plan, count, backward);
        (kit.control(), kit.merged_memory())
    } else {
        let cmp = kit.cmp_i(plan.src_pos, plan.dest_pos);
        let bol = kit.bool(cmp, BoolTest::Lt);
        let (backward_ctl, forward_ctl) = kit.make_if(bol, PROB_FAIR);
        let entry = kit.state();

        kit.set_control(forward_ctl);
        copy_elements(&mut kit, &plan, count, false);
        let forward = kit.state();

        kit.set_state(entry);
        kit.set_control(backward_ctl);
        copy_elements(&mut kit, &plan, count, true);
        let backward = kit.state();

        kit.merge_states(&[forward, backward]);
        (kit.control(), kit.merged_memory())
    };
    trace!("{} lowered to {} element copies", ac, count);
    finish_transform(c, ac, ctl, mem, mem_user);
    true
}

/// Replace `ac` by a call to a copy stub. Basic clones are left to the barrier policy, which
/// may need its own stub for objects holding references.
pub fn expand_to_stub(c: &mut Compile, ac: Node) {
    if is_clonebasic(&c.graph, ac) {
        let bs = c.barrier_set();
        bs.c2().clone_at_expansion(c, ac);
        return;
    }
    let g = &c.graph;
    let validated = info(g, ac).is_some_and(|i| i.arguments_validated);
    let src = input(g, ac, slot::arraycopy::SRC);
    let dest = input(g, ac, slot::arraycopy::DEST);
    let src_pos = input(g, ac, slot::arraycopy::SRC_POS);
    let dest_pos = input(g, ac, slot::arraycopy::DEST_POS);
    let len = input(g, ac, slot::arraycopy::LENGTH);
    let elem = g.ty(dest).isa_ptr().and_then(array_elem);
    let (ctl, io, mem) = (
        input(g, ac, slot::CONTROL),
        input(g, ac, slot::I_O),
        input(g, ac, slot::MEMORY),
    );

    let mut kit = GraphKit::at(c, ctl, io, mem);
    let (stub, args) = match elem {
        Some(elem) if validated => {
            let src_adr = kit.array_element_address(src, src_pos, elem);
            let dest_adr = kit.array_element_address(dest, dest_pos, elem);
            let stub = if elem.is_reference() {
                "oop_arraycopy"
            } else {
                "arraycopy"
            };
            (stub, vec![src_adr, dest_adr, len])
        }
        // The generic stub checks bounds and element types itself.
        _ => ("generic_arraycopy", vec![src, src_pos, dest, dest_pos, len]),
    };
    trace!("{} lowered to a call to {}", ac, stub);
    let info = CallInfo {
        name: stub.to_string(),
        arraycopy_stub: true,
        ..CallInfo::default()
    };
    let call = kit.make_call_node(Opcode::CallLeafNoFP, info, &args);
    c.graph.replace_node(ac, call);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::KlassTable;
    use crate::settings::{Flags, GcKind, builder};

    fn compile(gc: GcKind) -> Compile {
        let mut b = builder();
        b.gc(gc);
        Compile::new(Flags::new(b), KlassTable::new(true))
    }

    fn int_array(kit: &mut GraphKit<'_>, i: usize, len: i32) -> Node {
        let k = kit.c.klasses.array_of(BasicType::Int);
        let ty = TypePtr::ary(k, BasicType::Int, Some(len), true, PtrNull::NotNull);
        kit.parameter(i, Type::Ptr(ty))
    }

    fn stores(c: &Compile) -> Vec<Node> {
        c.graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::Store)
            .collect()
    }

    #[test]
    fn modifies_ranges() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 10);
        let b = int_array(&mut kit, 1, 10);
        let two = kit.c.graph.intcon(2);
        let three = kit.c.graph.intcon(3);
        let zero = kit.c.graph.intcon(0);
        let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, zero, b, two, three, true, false);
        let base = i64::from(ARRAY_BASE_OFFSET);
        // Elements 2, 3 and 4 are written.
        assert!(modifies(&c, ac, base + 8, base + 11, true));
        assert!(modifies(&c, ac, base + 16, base + 19, true));
        assert!(!modifies(&c, ac, base + 20, base + 23, false));
        assert!(!modifies(&c, ac, base, base + 3, false));
    }

    #[test]
    fn unvalidated_copy_is_not_lowered() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 10);
        let b = int_array(&mut kit, 1, 10);
        let zero = kit.c.graph.intcon(0);
        let two = kit.c.graph.intcon(2);
        let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, zero, b, zero, two, false, false);
        assert!(!lower(&mut c, ac));
        expand_to_stub(&mut c, ac);
        assert!(c.graph.is_dead(ac));
        let call = c
            .graph
            .live_node_iter()
            .find(|&n| c.graph.op(n) == Opcode::CallLeafNoFP)
            .unwrap();
        match c.graph.info(call) {
            NodeInfo::Call(ci) => assert_eq!(ci.name, "generic_arraycopy"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_direction_tests_at_run_time() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 10);
        let sp = kit.parameter(1, Type::Int(None));
        let dp = kit.parameter(2, Type::Int(None));
        let two = kit.c.graph.intcon(2);
        let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, sp, a, dp, two, true, false);
        let ret = kit.return_value(None);
        assert!(lower(&mut c, ac));
        assert_eq!(stores(&c).len(), 4);
        let mem = c.graph.input(ret, slot::MEMORY).unwrap();
        let g = &c.graph;
        let phi = if g.op(mem) == Opcode::MergeMem {
            g.memory_slices(mem)
                .into_iter()
                .map(|(_, m)| m)
                .find(|&m| g.op(m) == Opcode::Phi)
                .unwrap()
        } else {
            mem
        };
        assert_eq!(g.op(phi), Opcode::Phi);
        let region = g.input(phi, 0).unwrap();
        assert_eq!(g.op(region), Opcode::Region);
        assert_eq!(g.input(ret, slot::CONTROL), Some(region));
    }

    #[test]
    fn too_many_elements_stay_a_call() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 100);
        let b = int_array(&mut kit, 1, 100);
        let zero = kit.c.graph.intcon(0);
        let n = kit.c.graph.intcon(50);
        let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, zero, b, zero, n, true, false);
        let live = c.graph.live_nodes();
        assert!(!lower(&mut c, ac));
        assert_eq!(c.graph.live_nodes(), live);
        assert!(!c.graph.is_dead(ac));
    }

    #[test]
    fn positions_past_int_range_stay_a_call() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 10);
        let b = int_array(&mut kit, 1, 10);
        let zero = kit.c.graph.intcon(0);
        let far = kit.c.graph.intcon(i32::MAX - 1);
        let n = kit.c.graph.intcon(4);
        let ac = kit.make_arraycopy(ArrayCopyKind::ArrayCopy, a, far, b, zero, n, true, false);
        let live = c.graph.live_nodes();
        assert!(!lower(&mut c, ac));
        assert_eq!(c.graph.live_nodes(), live);
        assert!(stores(&c).is_empty());
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "is not an array copy"))]
    fn queries_on_other_nodes_answer_no() {
        let mut c = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let a = int_array(&mut kit, 0, 10);
        assert_eq!(kind(&c.graph, a), None);
        assert!(!is_clonebasic(&c.graph, a));
        assert!(!is_alloc_tightly_coupled(&c.graph, a));
    }
}
