//! Macro node elimination and expansion.
//!
//! Allocations, locks, boxing calls and array copies stay single opaque nodes while the graph is
//! analyzed. Once escape analysis is done, [`eliminate_macro_nodes`] removes those it proved
//! unnecessary: the fields of scalar replaceable objects become plain values recorded in the
//! debug info of every safepoint that referenced them. [`expand_macro_nodes`] then lowers whatever
//! survived.

use crate::arraycopy;
use crate::compile::Compile;
use crate::ir::klass::{ARRAY_BASE_OFFSET, HEADER_SIZE};
use crate::ir::{
    AliasIdx, BasicType, CallInfo, Graph, Node, NodeInfo, Opcode, PhiInfo, PtrNull, ScalarObjectInfo,
    Type, TypePtr, slot,
};
use crate::result::OptoResult;
use crate::timing::{self, Pass};
use crate::{FxHashMap, trace};

/// Nodes expanding one macro node may add.
const NODES_PER_EXPANSION: usize = 50;

/// Nesting of memory Phis a field value search follows.
const MAX_PHI_DEPTH: u32 = 16;

/// The cast publishing the object allocated by `alloc`, if anything uses the object.
pub fn result_cast(g: &Graph, alloc: Node) -> Option<Node> {
    let rawoop = g.proj_out(alloc, slot::PARMS)?;
    g.find_out_with(rawoop, Opcode::CheckCastPP)
}

/// Offsets and types of every field of the object allocated by `alloc`, in offset order. Array
/// elements count as fields; their number has to be a constant.
fn object_fields(c: &Compile, alloc: Node) -> Option<Vec<(i32, BasicType)>> {
    let g = &c.graph;
    let NodeInfo::Alloc(info) = g.info(alloc) else {
        return None;
    };
    let klass = info.klass;
    if g.op(alloc) == Opcode::AllocateArray {
        let len = g.find_int_con(g.input(alloc, slot::alloc::LENGTH)?)?;
        let elem = c.klasses.element_type(klass)?;
        let esize = elem.size_in_bytes(c.klasses.compressed_oops());
        let len = i32::try_from(len).ok()?;
        return Some((0..len).map(|i| (ARRAY_BASE_OFFSET + i * esize, elem)).collect());
    }
    let mut fields: Vec<(i32, BasicType)> = c
        .klasses
        .nonstatic_fields(klass)
        .iter()
        .map(|f| (f.offset, f.bt))
        .collect();
    fields.sort_by_key(|&(off, _)| off);
    Some(fields)
}

/// The type of the object allocated by `alloc`: its instance type once memory was split for it.
fn object_type(c: &Compile, alloc: Node) -> Option<TypePtr> {
    let g = &c.graph;
    if let Some(tp) = result_cast(g, alloc).and_then(|res| g.ty(res).isa_oopptr()) {
        return Some(tp.clone());
    }
    let NodeInfo::Alloc(info) = g.info(alloc) else {
        return None;
    };
    let klass = info.klass;
    if g.op(alloc) == Opcode::AllocateArray {
        let elem = c.klasses.element_type(klass)?;
        let len = g
            .input(alloc, slot::alloc::LENGTH)
            .and_then(|l| g.find_int_con(l))
            .and_then(|l| i32::try_from(l).ok());
        Some(TypePtr::ary(klass, elem, len, true, PtrNull::NotNull))
    } else {
        Some(TypePtr::inst(klass, true, PtrNull::NotNull))
    }
}

/// Type of a field value of basic type `bt` as recorded in debug info.
fn field_value_type(c: &Compile, bt: BasicType) -> Type {
    if bt.is_reference() {
        Type::Ptr(TypePtr::inst(c.klasses.object(), false, PtrNull::Maybe))
    } else {
        Type::of_basic_type(bt)
    }
}

/// Is every user of the field address `adr` an access we can do without?
fn address_users_ok(c: &Compile, res: Node, adr: Node) -> bool {
    let g = &c.graph;
    let bs = c.barrier_set();
    if g.ty(adr).isa_ptr().and_then(|t| t.offset.known()).is_none() {
        trace!("can't eliminate: {} has an unknown offset", adr);
        return false;
    }
    for u in g.uses(adr) {
        let op = g.op(u);
        let ok = match op {
            Opcode::Store => {
                g.input(u, slot::mem::ADDRESS) == Some(adr)
                    && g.input(u, slot::mem::VALUE) != Some(res)
            }
            Opcode::Load | Opcode::CastP2X => true,
            Opcode::AddP => address_users_ok(c, res, u),
            _ if op.is_load_store() => {
                debug_assert!(false, "atomic access {u} to a field of a non-escaping object");
                false
            }
            _ => op == Opcode::WriteBarrier && bs.c2().is_gc_barrier_node(c, u),
        };
        if !ok {
            trace!("can't eliminate: field address {} used by {} ({:?})", adr, u, op);
            return false;
        }
    }
    true
}

/// Can the allocation `alloc` be removed, its fields moved into the debug info of the
/// safepoints referencing it?
///
/// Safepoints referencing the object are added to `safepoints`. Without a list the object may
/// still be merged by a Phi: that is how reducible merges check their inputs.
pub fn can_eliminate_allocation(c: &Compile, alloc: Node, mut safepoints: Option<&mut Vec<Node>>) -> bool {
    let g = &c.graph;
    if g.op(alloc) == Opcode::AllocateArray {
        let len = g.input(alloc, slot::alloc::LENGTH).and_then(|l| g.find_int_con(l));
        let limit = i64::from(c.flags().eliminate_allocation_array_size_limit());
        if !len.is_some_and(|l| (0..=limit).contains(&l)) {
            trace!("can't eliminate {}: array length {:?}", alloc, len);
            return false;
        }
    }
    let Some(res) = result_cast(g, alloc) else {
        return true;
    };
    for u in g.uses(res) {
        let op = g.op(u);
        let ok = if op == Opcode::AddP {
            address_users_ok(c, res, u)
        } else if op.is_abstract_lock() {
            matches!(g.info(u), NodeInfo::Lock(l) if l.eliminated)
        } else if op == Opcode::ArrayCopy {
            false
        } else if op.is_safepoint() {
            let debug_start = g.data(u).jvms().map_or(g.req(u), |j| j.debug_start());
            let argument = op.is_call() && (0..debug_start).any(|i| g.input(u, i) == Some(res));
            let mem = g.input(u, slot::MEMORY).filter(|&m| !g.is_top(m));
            if argument || mem.is_none() {
                false
            } else {
                if let Some(list) = safepoints.as_deref_mut() {
                    if !list.contains(&u) {
                        list.push(u);
                    }
                }
                true
            }
        } else if op == Opcode::CastP2X {
            true
        } else if op == Opcode::Phi {
            safepoints.is_none()
        } else {
            false
        };
        if !ok {
            trace!("can't eliminate {}: result used by {} ({:?})", alloc, u, op);
            return false;
        }
    }
    true
}

/// Search for the value a field holds at some memory state.
struct FieldSearch {
    alloc: Node,
    adr_t: TypePtr,
    alias: AliasIdx,
    offset: i32,
    bt: BasicType,
    /// Value Phis made for memory Phis already visited.
    value_phis: FxHashMap<Node, Node>,
}

impl FieldSearch {
    fn new(c: &mut Compile, alloc: Node, obj_t: &TypePtr, offset: i32, bt: BasicType) -> Self {
        let adr_t = obj_t.add_offset(offset);
        let alias = c.alias_index(&adr_t);
        Self {
            alloc,
            adr_t,
            alias,
            offset,
            bt,
            value_phis: FxHashMap::default(),
        }
    }

    /// Does memory state `mem` mean the field still holds its default value?
    fn is_initial_state(&self, c: &Compile, mem: Node) -> bool {
        let g = &c.graph;
        if Some(mem) == g.start_mem() || Some(mem) == g.proj_out(self.alloc, slot::MEMORY) {
            return true;
        }
        match g.op(mem) {
            Opcode::Proj => g
                .input(mem, 0)
                .is_some_and(|init| Some(init) == g.initialization(self.alloc)),
            Opcode::ClearArray => g
                .input(mem, slot::mem::ADDRESS)
                .and_then(|adr| g.ideal_allocation_with_offset(adr))
                .is_some_and(|(a, _)| a == self.alloc),
            _ => false,
        }
    }

    /// Walk up the memory chain from `mem` to the state that last wrote the field: its initial
    /// state, a store, a Phi, or something we can't see through. `None` when the walk runs past
    /// its budget.
    fn scan_mem_chain(&self, c: &mut Compile, mut mem: Node) -> Option<Node> {
        let limit = c.flags().value_search_limit();
        for _ in 0..limit {
            if self.is_initial_state(c, mem) {
                return Some(mem);
            }
            let g = &c.graph;
            let op = g.op(mem);
            let next = match op {
                Opcode::MergeMem => Some(g.memory_at(mem, self.alias)),
                Opcode::Proj => {
                    let src = g.input(mem, 0)?;
                    let sop = g.op(src);
                    if sop == Opcode::Initialize {
                        // Another object's initialization.
                        g.input(src, slot::MEMORY)
                    } else if sop.is_allocate() || sop.is_gc_barrier() {
                        g.input(src, slot::MEMORY)
                    } else if sop.is_call() {
                        if arraycopy::may_modify_instance(c, src, &self.adr_t) {
                            return Some(mem);
                        }
                        g.input(src, slot::MEMORY)
                    } else if sop.is_membar() {
                        if arraycopy::may_modify(c, &self.adr_t, src).is_some() {
                            return Some(mem);
                        }
                        g.input(src, slot::MEMORY)
                    } else {
                        return Some(mem);
                    }
                }
                _ if op.is_mem() || op == Opcode::ClearArray || op == Opcode::SCMemProj => {
                    let mem_op = if op == Opcode::SCMemProj { g.input(mem, 0)? } else { mem };
                    let idx = c.mem_alias_index(mem_op);
                    if idx != self.alias {
                        c.graph.input(mem_op, slot::mem::MEMORY)
                    } else if c.graph.op(mem_op) != Opcode::Store {
                        return Some(mem);
                    } else {
                        match c.adr_type(mem_op).and_then(|t| t.offset.known()) {
                            Some(off) if off == self.offset => return Some(mem),
                            Some(_) => c.graph.input(mem_op, slot::mem::MEMORY),
                            None => return Some(mem),
                        }
                    }
                }
                _ => return Some(mem),
            };
            mem = next?;
        }
        trace!("field search from {} ran out of steps", mem);
        None
    }

    /// The value of the field at memory state `mem`, or `None` when it can't be determined.
    fn value_from_mem(&mut self, c: &mut Compile, mem: Node, created: &mut Vec<Node>) -> Option<Node> {
        let found = self.scan_mem_chain(c, mem)?;
        self.value_at(c, found, MAX_PHI_DEPTH, created)
    }

    /// The store to the field captured by the object's initialization, when `mem` is the state
    /// right after it.
    fn captured_store(&self, g: &Graph, mem: Node) -> Option<Node> {
        let init = g.initialization(self.alloc)?;
        if g.op(mem) != Opcode::Proj || g.input(mem, 0) != Some(init) {
            return None;
        }
        g.find_captured_store(init, self.offset)
    }

    fn value_at(&mut self, c: &mut Compile, mem: Node, level: u32, created: &mut Vec<Node>) -> Option<Node> {
        if let Some(st) = self.captured_store(&c.graph, mem) {
            let v = c.graph.input(st, slot::mem::VALUE)?;
            return Some(widen(c, v, created));
        }
        if self.is_initial_state(c, mem) {
            return Some(c.graph.zerocon(self.bt));
        }
        match c.graph.op(mem) {
            Opcode::Store => {
                let g = &c.graph;
                if !self.adr_t.is_known_instance() {
                    // On a shared slice the store must be to our object.
                    let base = g
                        .input(mem, slot::mem::ADDRESS)
                        .and_then(|adr| g.input(adr, slot::addp::BASE));
                    if base.and_then(|b| g.ideal_allocation(b)) != Some(self.alloc) {
                        trace!("{} may store to another object", mem);
                        return None;
                    }
                }
                let v = g.input(mem, slot::mem::VALUE)?;
                Some(widen(c, v, created))
            }
            Opcode::Phi => self.value_from_mem_phi(c, mem, level, created),
            op => {
                trace!("no field value through {} ({:?})", mem, op);
                None
            }
        }
    }

    /// A Phi of the field's values on each path into the memory Phi `mem`.
    fn value_from_mem_phi(&mut self, c: &mut Compile, mem: Node, level: u32, created: &mut Vec<Node>) -> Option<Node> {
        if let Some(&v) = self.value_phis.get(&mem) {
            return Some(v);
        }
        if level == 0 {
            trace!("Phi nesting too deep at {}", mem);
            return None;
        }
        let region = c.graph.input(mem, 0);
        let ty = field_value_type(c, self.bt);
        let phi = c.graph.add(Opcode::Phi, &[region], ty, NodeInfo::Phi(PhiInfo::default()));
        created.push(phi);
        self.value_phis.insert(mem, phi);
        let top = c.graph.top();
        for j in 1..c.graph.req(mem) {
            let v = match c.graph.input(mem, j) {
                None => top,
                Some(m) if c.graph.is_top(m) => top,
                Some(m) => {
                    let found = self.scan_mem_chain(c, m)?;
                    self.value_at(c, found, level - 1, created)?
                }
            };
            c.graph.set_req(phi, j, Some(v));
        }
        Some(phi)
    }
}

/// `v` as a full width reference, when it is a compressed one.
fn widen(c: &mut Compile, v: Node, created: &mut Vec<Node>) -> Node {
    let g = &mut c.graph;
    if g.op(v) == Opcode::EncodeP {
        return g.input(v, 1).unwrap_or(v);
    }
    match g.ty(v) {
        Type::NarrowOop(tp) => {
            let ty = Type::Ptr(tp.clone());
            let top = g.top();
            let d = g.add_simple(Opcode::DecodeN, &[top, v], ty);
            created.push(d);
            d
        }
        _ => v,
    }
}

/// `v` as a compressed reference.
fn narrow(c: &mut Compile, v: Node) -> Node {
    let g = &mut c.graph;
    if g.op(v) == Opcode::DecodeN {
        return g.input(v, 1).unwrap_or(v);
    }
    match g.ty(v) {
        Type::NarrowOop(_) => v,
        ty => {
            let tp = ty.make_ptr().cloned().unwrap_or_else(TypePtr::null_ptr);
            let top = g.top();
            g.add_simple(Opcode::EncodeP, &[top, v], Type::NarrowOop(tp))
        }
    }
}

/// Remove the nodes a failed field search made.
fn rollback(c: &mut Compile, created: &[Node]) {
    let g = &mut c.graph;
    // Value Phis may refer to each other: cut every edge first.
    for &n in created {
        if g.is_dead(n) {
            continue;
        }
        for i in 0..g.req(n) {
            g.set_req(n, i, None);
        }
    }
    for &n in created {
        if !g.is_dead(n) {
            g.remove_dead_node(n);
        }
    }
}

/// Values of all `fields` of the object allocated by `alloc` at memory state `mem`.
fn field_values(
    c: &mut Compile,
    alloc: Node,
    obj_t: &TypePtr,
    fields: &[(i32, BasicType)],
    mem: Node,
    created: &mut Vec<Node>,
) -> Option<Vec<Node>> {
    let mut values = Vec::with_capacity(fields.len());
    for &(offset, bt) in fields {
        let mut search = FieldSearch::new(c, alloc, obj_t, offset, bt);
        let v = search.value_from_mem(c, mem, created);
        let Some(v) = v else {
            trace!("no value for field {} of {} at {}", offset, alloc, mem);
            return None;
        };
        values.push(v);
    }
    Some(values)
}

/// Append `values` to the debug info of `sfpt` and return the node describing them as the
/// object allocated by `alloc`.
fn append_description(c: &mut Compile, alloc: Node, obj_t: &TypePtr, sfpt: Node, values: &[Node]) -> Node {
    let g = &mut c.graph;
    let scloff = g.data(sfpt).jvms().map_or(g.req(sfpt), |j| j.scloff);
    let first_index = g.req(sfpt) - scloff;
    for &v in values {
        g.add_req(sfpt, Some(v));
    }
    let end = g.req(sfpt);
    if let Some(j) = g.data_mut(sfpt).jvms_mut() {
        j.endoff = end;
    }
    let root = g.root();
    let sobj = g.add(
        Opcode::SafePointScalarObject,
        &[Some(root)],
        Type::Ptr(obj_t.clone()),
        NodeInfo::ScalarObject(ScalarObjectInfo {
            ty: obj_t.clone(),
            alloc: Some(alloc),
            first_index,
            n_fields: values.len(),
        }),
    );
    trace!("{} describes {} at {}", sobj, alloc, sfpt);
    sobj
}

/// Describe the object allocated by `alloc` in the debug info of `sfpt`: the value of each of
/// its fields is appended to `sfpt`. Returns the description, or `None` with the graph
/// unchanged when a field's value can't be found.
pub fn create_scalarized_object_description(c: &mut Compile, alloc: Node, sfpt: Node) -> Option<Node> {
    let fields = object_fields(c, alloc)?;
    let obj_t = object_type(c, alloc)?;
    let mem = c.graph.input(sfpt, slot::MEMORY)?;
    let mut created = Vec::new();
    match field_values(c, alloc, &obj_t, &fields, mem, &mut created) {
        Some(values) => Some(append_description(c, alloc, &obj_t, sfpt, &values)),
        None => {
            rollback(c, &created);
            None
        }
    }
}

/// Loads of fields of `res`, through any chain of addresses.
fn field_loads(g: &Graph, res: Node) -> Vec<Node> {
    let mut loads = Vec::new();
    let mut addrs: Vec<Node> = g.uses(res).into_iter().filter(|&u| g.op(u) == Opcode::AddP).collect();
    while let Some(adr) = addrs.pop() {
        for u in g.uses(adr) {
            match g.op(u) {
                Opcode::Load if g.input(u, slot::mem::ADDRESS) == Some(adr) => loads.push(u),
                Opcode::AddP => addrs.push(u),
                _ => {}
            }
        }
    }
    loads
}

/// Replace every load of a field of the object and every debug reference to it by field
/// values. Either everything is rewritten or nothing is.
fn scalar_replacement(c: &mut Compile, alloc: Node, safepoints: &[Node]) -> bool {
    let Some(fields) = object_fields(c, alloc) else {
        return false;
    };
    if fields.len() > c.flags().eliminate_allocation_fields_limit() as usize {
        return false;
    }
    let Some(obj_t) = object_type(c, alloc) else {
        return false;
    };
    let res = result_cast(&c.graph, alloc);
    let mut created = Vec::new();

    // Find every value before changing anything.
    let mut load_values: Vec<(Node, Node)> = Vec::new();
    let loads = res.map(|r| field_loads(&c.graph, r)).unwrap_or_default();
    for load in loads {
        let offset = c.adr_type(load).and_then(|t| t.offset.known());
        let field = offset.and_then(|off| fields.iter().copied().find(|&(o, _)| o == off));
        let mem = c.graph.input(load, slot::mem::MEMORY);
        let value = match (field, mem) {
            (Some((off, bt)), Some(mem)) => {
                let mut search = FieldSearch::new(c, alloc, &obj_t, off, bt);
                search.value_from_mem(c, mem, &mut created)
            }
            _ => None,
        };
        match value {
            Some(v) => load_values.push((load, v)),
            None => {
                trace!("can't eliminate {}: no value for {}", alloc, load);
                rollback(c, &created);
                return false;
            }
        }
    }
    let mut sfpt_values: Vec<(Node, Vec<Node>)> = Vec::with_capacity(safepoints.len());
    for &sfpt in safepoints {
        let values = c
            .graph
            .input(sfpt, slot::MEMORY)
            .and_then(|mem| field_values(c, alloc, &obj_t, &fields, mem, &mut created));
        match values {
            Some(v) => sfpt_values.push((sfpt, v)),
            None => {
                trace!("can't eliminate {}: fields unknown at {}", alloc, sfpt);
                rollback(c, &created);
                return false;
            }
        }
    }

    // Commit. Values we hold may themselves be loads replaced on the way.
    let mut replaced: FxHashMap<Node, Node> = FxHashMap::default();
    let resolve = |replaced: &FxHashMap<Node, Node>, mut v: Node| {
        while let Some(&r) = replaced.get(&v) {
            v = r;
        }
        v
    };
    for (load, v) in load_values {
        let v = resolve(&replaced, v);
        if c.graph.is_dead(load) {
            continue;
        }
        let narrow_load = matches!(c.graph.info(load), NodeInfo::Mem(m) if m.bt == BasicType::NarrowOop);
        if narrow_load {
            for u in c.graph.uses(load) {
                if c.graph.op(u) == Opcode::DecodeN && !c.graph.is_dead(u) {
                    replaced.insert(u, v);
                    c.graph.replace_node(u, v);
                }
            }
            if c.graph.is_dead(load) {
                continue;
            }
            let nv = narrow(c, v);
            replaced.insert(load, nv);
            c.graph.replace_node(load, nv);
        } else {
            replaced.insert(load, v);
            c.graph.replace_node(load, v);
        }
        trace!("load {} of eliminated {} replaced", load, alloc);
    }
    for (sfpt, values) in sfpt_values {
        let values: Vec<Node> = values.into_iter().map(|v| resolve(&replaced, v)).collect();
        let sobj = append_description(c, alloc, &obj_t, sfpt, &values);
        if let Some(res) = result_cast(&c.graph, alloc) {
            let g = &mut c.graph;
            let (start, end) = g
                .data(sfpt)
                .jvms()
                .map_or((0, 0), |j| (j.debug_start(), j.debug_end()));
            g.replace_edges_in_range(sfpt, res, Some(sobj), start, end);
        }
        c.graph.record_for_igvn(sfpt);
    }
    true
}

/// Replace the projection `con` of `n` by `to`.
fn replace_proj(c: &mut Compile, n: Node, con: usize, to: Option<Node>) {
    let g = &mut c.graph;
    if let Some(p) = g.proj_out(n, con) {
        let to = to.unwrap_or_else(|| g.top());
        g.replace_node(p, to);
    }
}

/// Bypass the multi node `n`: its control, I/O and memory projections are replaced by the
/// matching inputs, any other projection by top.
fn bypass(c: &mut Compile, n: Node) {
    for con in [slot::CONTROL, slot::I_O, slot::MEMORY] {
        let to = c.graph.input(n, con);
        replace_proj(c, n, con, to);
    }
    replace_proj(c, n, slot::PARMS, None);
    if !c.graph.is_dead(n) {
        debug_assert_eq!(c.graph.outcnt(n), 0, "{n} still used");
        c.graph.remove_dead_node(n);
    }
}

/// Remove the allocation `alloc` and what is left of the uses of its result once loads and
/// debug references are gone.
fn process_users_of_allocation(c: &mut Compile, alloc: Node) {
    let bs = c.barrier_set();
    if let Some(res) = result_cast(&c.graph, alloc) {
        let mut addrs: Vec<Node> = Vec::new();
        for u in c.graph.uses(res) {
            if c.graph.is_dead(u) {
                continue;
            }
            match c.graph.op(u) {
                Opcode::AddP => addrs.push(u),
                Opcode::CastP2X => bs.c2().eliminate_gc_barrier(c, u),
                op => debug_assert!(false, "unexpected use {u} ({op:?}) of eliminated {alloc}"),
            }
        }
        while let Some(adr) = addrs.pop() {
            for u in c.graph.uses(adr) {
                if c.graph.is_dead(u) {
                    continue;
                }
                match c.graph.op(u) {
                    Opcode::Store => {
                        let mem = c.graph.input(u, slot::mem::MEMORY).unwrap_or_else(|| c.graph.top());
                        c.graph.replace_node(u, mem);
                    }
                    Opcode::AddP => addrs.push(u),
                    Opcode::CastP2X | Opcode::WriteBarrier => bs.c2().eliminate_gc_barrier(c, u),
                    op => debug_assert!(false, "unexpected use {u} ({op:?}) of a field address"),
                }
            }
        }
        if !c.graph.is_dead(res) {
            debug_assert_eq!(c.graph.outcnt(res), 0, "{res} still used");
            c.graph.remove_dead_node(res);
        }
    }
    if let Some(init) = c.graph.initialization(alloc) {
        // Captured stores go with the initialization.
        for i in (slot::init::RAW_STORES..c.graph.req(init)).rev() {
            if let Some(st) = c.graph.input(init, i) {
                let mem = c.graph.input(st, slot::mem::MEMORY).unwrap_or_else(|| c.graph.top());
                c.graph.replace_node(st, mem);
            }
        }
        bypass(c, init);
    }
    if !c.graph.is_dead(alloc) {
        bypass(c, alloc);
    }
}

/// Remove the scalar replaceable allocation `alloc`. Returns false with the graph unchanged if
/// some use of the object is in the way or a field value can't be found.
fn eliminate_allocate_node(c: &mut Compile, alloc: Node) -> bool {
    if !c.is_scalar_replaceable(alloc) {
        return false;
    }
    let mut safepoints = Vec::new();
    if !can_eliminate_allocation(c, alloc, Some(&mut safepoints)) {
        return false;
    }
    if !scalar_replacement(c, alloc, &safepoints) {
        return false;
    }
    process_users_of_allocation(c, alloc);
    trace!("allocation {} eliminated, described at {} safepoints", alloc, safepoints.len());
    true
}

/// Remove the lock or unlock `lock` of an object no other thread can see, together with the
/// memory barrier pairing with it.
fn eliminate_locking_node(c: &mut Compile, lock: Node) {
    let g = &c.graph;
    let barrier = if g.op(lock) == Opcode::Lock {
        g.proj_out(lock, slot::CONTROL)
            .and_then(|ctrl| g.find_out_with(ctrl, Opcode::MemBarAcquireLock))
    } else {
        g.input(lock, slot::CONTROL)
            .filter(|&ctrl| g.op(ctrl) == Opcode::Proj)
            .and_then(|ctrl| g.input(ctrl, 0))
            .filter(|&mb| g.op(mb) == Opcode::MemBarReleaseLock)
    };
    if let Some(mb) = barrier {
        bypass(c, mb);
    }
    trace!("{:?} {} eliminated", c.graph.op(lock), lock);
    if !c.graph.is_dead(lock) {
        bypass(c, lock);
    }
}

/// Remove the boxing call `call` if its result is only referenced from debug info.
fn eliminate_boxing_node(c: &mut Compile, call: Node) -> bool {
    let g = &c.graph;
    if !matches!(g.info(call), NodeInfo::Call(ci) if ci.boxing && ci.eliminated_boxing) {
        return false;
    }
    let res = g.proj_out(call, slot::PARMS);
    let mut safepoints = Vec::new();
    if let Some(res) = res {
        for u in g.uses(res) {
            let debug_only = g.op(u).is_safepoint()
                && g.data(u).jvms().is_some_and(|j| {
                    (0..j.debug_start()).all(|i| g.input(u, i) != Some(res))
                });
            if !debug_only {
                trace!("boxing {} kept: result used by {}", call, u);
                return false;
            }
            safepoints.push(u);
        }
    }
    if !safepoints.is_empty() {
        let Some(obj_t) = res.and_then(|r| g.ty(r).isa_oopptr()).cloned() else {
            return false;
        };
        let Some(klass) = obj_t.klass else {
            return false;
        };
        let fields = c.klasses.nonstatic_fields(klass);
        let Some(arg) = g.input(call, slot::PARMS) else {
            return false;
        };
        if fields.len() != 1 || fields[0].offset < HEADER_SIZE {
            return false;
        }
        let obj_t = obj_t.cast_to_exactness(true).cast_to_null(PtrNull::NotNull);
        for sfpt in safepoints {
            let sobj = append_description(c, call, &obj_t, sfpt, &[arg]);
            if let Some(res) = res {
                let g = &mut c.graph;
                let (start, end) = g
                    .data(sfpt)
                    .jvms()
                    .map_or((0, 0), |j| (j.debug_start(), j.debug_end()));
                g.replace_edges_in_range(sfpt, res, Some(sobj), start, end);
            }
        }
    }
    trace!("boxing call {} eliminated", call);
    bypass(c, call);
    true
}

/// Remove the allocations, locks and boxing calls escape analysis proved unnecessary.
pub fn eliminate_macro_nodes(c: &mut Compile) -> OptoResult<()> {
    let _tt = timing::start(Pass::MacroEliminate);
    let before = c.graph.macro_nodes().len();

    // Locks first: they are uses of the objects they lock.
    if c.flags().eliminate_locks() {
        for n in c.graph.macro_nodes().to_vec() {
            if c.graph.is_dead(n) || !c.graph.op(n).is_abstract_lock() {
                continue;
            }
            if matches!(c.graph.info(n), NodeInfo::Lock(l) if l.eliminated) {
                eliminate_locking_node(c, n);
            }
        }
    }

    // Removing one object may remove the last use of another stored into it.
    let mut progress = true;
    while progress {
        progress = false;
        for n in c.graph.macro_nodes().to_vec().into_iter().rev() {
            if c.graph.is_dead(n) {
                continue;
            }
            let removed = match c.graph.op(n) {
                Opcode::Allocate | Opcode::AllocateArray if c.flags().eliminate_allocations() => {
                    eliminate_allocate_node(c, n)
                }
                Opcode::CallStaticJava if c.flags().eliminate_autobox() => eliminate_boxing_node(c, n),
                _ => false,
            };
            progress |= removed;
        }
        c.check_failing()?;
    }
    log::debug!(
        "macro elimination: {} of {} macro nodes removed",
        before - c.graph.macro_nodes().len(),
        before
    );
    Ok(())
}

/// Turn macro node `n` into a call to runtime routine `name`, keeping its inputs and
/// projections.
fn expand_to_runtime_call(c: &mut Compile, n: Node, name: &str) {
    let jvms = c.graph.data(n).jvms().cloned();
    let data = c.graph.data_mut(n);
    data.op = Opcode::CallRuntime;
    data.info = NodeInfo::Call(Box::new(CallInfo {
        name: name.to_string(),
        jvms,
        ..CallInfo::default()
    }));
    c.graph.remove_macro_node(n);
    c.graph.record_for_igvn(n);
    trace!("{} expanded to a call to {}", n, name);
}

/// Lower every remaining macro node, then the barrier policy's own nodes.
pub fn expand_macro_nodes(c: &mut Compile) -> OptoResult<()> {
    {
        let _tt = timing::start(Pass::MacroExpand);
        // Boxing calls that survived are ordinary calls.
        for n in c.graph.macro_nodes().to_vec() {
            if c.graph.op(n) == Opcode::CallStaticJava {
                c.graph.remove_macro_node(n);
            }
        }
        // Copies first: lowering them may expose nothing new, but a stub call needs the
        // allocation it copies into to still be a macro node for tight coupling checks.
        let nodes = c.graph.macro_nodes().to_vec();
        let (copies, rest): (Vec<Node>, Vec<Node>) = nodes
            .into_iter()
            .partition(|&n| c.graph.op(n) == Opcode::ArrayCopy);
        for n in copies.into_iter().chain(rest) {
            if c.graph.is_dead(n) {
                continue;
            }
            c.check_node_count(NODES_PER_EXPANSION)?;
            match c.graph.op(n) {
                Opcode::ArrayCopy => {
                    if !arraycopy::lower(c, n) {
                        arraycopy::expand_to_stub(c, n);
                    }
                }
                Opcode::Allocate => expand_to_runtime_call(c, n, "new_instance"),
                Opcode::AllocateArray => expand_to_runtime_call(c, n, "new_array"),
                Opcode::Lock => expand_to_runtime_call(c, n, "complete_monitor_locking"),
                Opcode::Unlock => expand_to_runtime_call(c, n, "complete_monitor_unlocking"),
                op => {
                    debug_assert!(false, "unexpected macro node {n} ({op:?})");
                    c.graph.remove_macro_node(n);
                }
            }
            if !c.graph.is_dead(n) {
                c.graph.remove_macro_node(n);
            }
        }
        debug_assert!(c.graph.macro_nodes().is_empty());
    }
    let _tt = timing::start(Pass::BarrierExpand);
    let bs = c.barrier_set();
    bs.c2().expand_macro_nodes(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::ConnectionGraph;
    use crate::ir::{Klass, KlassFlags, KlassTable};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, GcKind, builder};

    fn compile_with(kt: KlassTable, b: crate::settings::Builder) -> Compile {
        let _ = env_logger::try_init();
        Compile::new(Flags::new(b), kt)
    }

    fn point() -> (Compile, Klass) {
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        (compile_with(kt, builder()), k)
    }

    fn live(c: &Compile, op: Opcode) -> usize {
        c.graph.live_node_iter().filter(|&n| c.graph.op(n) == op).count()
    }

    /// The scalarized description `sfpt` holds and its field values.
    fn description(c: &Compile, sfpt: Node) -> (Node, Vec<Node>) {
        let g = &c.graph;
        let jvms = g.data(sfpt).jvms().unwrap();
        let sobj = (jvms.debug_start()..jvms.debug_end())
            .filter_map(|i| g.input(sfpt, i))
            .find(|&d| g.op(d) == Opcode::SafePointScalarObject)
            .unwrap();
        let NodeInfo::ScalarObject(info) = g.info(sobj) else {
            panic!("not a scalar object");
        };
        let first = jvms.scloff + info.first_index;
        let values = (first..first + info.n_fields)
            .map(|i| g.input(sfpt, i).unwrap())
            .collect();
        (sobj, values)
    }

    #[test]
    fn point_is_scalar_replaced() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let three = kit.c.graph.intcon(3);
        let four = kit.c.graph.intcon(4);
        kit.store_field(p, "x", three);
        kit.store_field(p, "y", four);
        let sfpt = kit.safepoint(&[p]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(p).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(alloc));
        assert_eq!(live(&c, Opcode::Store), 0);
        assert_eq!(live(&c, Opcode::Initialize), 0);
        let (_, values) = description(&c, sfpt);
        let consts: Vec<_> = values.iter().map(|&v| c.graph.find_int_con(v)).collect();
        assert_eq!(consts, [Some(3), Some(4)]);
    }

    #[test]
    fn unset_field_is_zero() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let seven = kit.c.graph.intcon(7);
        kit.store_field(p, "y", seven);
        let sfpt = kit.safepoint(&[p]);
        kit.return_value(None);

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        let (_, values) = description(&c, sfpt);
        let consts: Vec<_> = values.iter().map(|&v| c.graph.find_int_con(v)).collect();
        assert_eq!(consts, [Some(0), Some(7)]);
    }

    #[test]
    fn load_takes_stored_value() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let v = kit.parameter(0, Type::Int(None));
        kit.store_field(p, "x", v);
        let load = kit.load_field(p, "x");
        let ret = kit.return_value(Some(load));
        let alloc = c.graph.ideal_allocation(p).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(alloc));
        assert!(c.graph.is_dead(load));
        assert_eq!(c.graph.input(ret, slot::PARMS), Some(v));
    }

    #[test]
    fn merged_stores_become_value_phi() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let cond = kit.parameter(0, Type::Int(None));
        let zero = kit.c.graph.intcon(0);
        let cmp = kit.cmp_i(cond, zero);
        let bol = kit.bool(cmp, crate::ir::BoolTest::Ne);
        let (t, f) = kit.make_if(bol, 0.5);
        let entry = kit.state();
        kit.set_control(t);
        let one = kit.c.graph.intcon(1);
        kit.store_field(p, "x", one);
        let taken = kit.state();
        let mut other = entry;
        other.ctrl = f;
        let merged = kit.merge_states(&[taken, other]);
        kit.set_state(merged);
        let sfpt = kit.safepoint(&[p]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(p).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(alloc));
        let (_, values) = description(&c, sfpt);
        let x = values[0];
        assert_eq!(c.graph.op(x), Opcode::Phi);
        let inputs: Vec<_> = (1..c.graph.req(x))
            .map(|i| c.graph.input(x, i).and_then(|n| c.graph.find_int_con(n)))
            .collect();
        assert!(inputs.contains(&Some(1)));
        assert!(inputs.contains(&Some(0)));
    }

    #[test]
    fn escaping_allocation_is_kept() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        kit.call_static("sink", &[p], None, None, &[]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(p).unwrap();

        c.optimize().unwrap();
        assert!(!c.graph.is_dead(alloc));
        assert_eq!(c.graph.op(alloc), Opcode::CallRuntime);
        assert!(c.graph.macro_nodes().is_empty());
    }

    #[test]
    fn field_search_budget_keeps_allocation() {
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance("Point", None, &[("x", BasicType::Int)], KlassFlags::empty());
        let mut b = builder();
        b.set("value_search_limit", "1").unwrap();
        let mut c = compile_with(kt, b);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let three = kit.c.graph.intcon(3);
        kit.store_field(p, "x", three);
        let sfpt = kit.safepoint(&[p]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(p).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.is_scalar_replaceable(alloc));
        let live_before = c.graph.live_nodes();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(!c.graph.is_dead(alloc));
        assert_eq!(c.graph.live_nodes(), live_before);
        assert_eq!(live(&c, Opcode::SafePointScalarObject), 0);
        let jvms = c.graph.data(sfpt).jvms().unwrap();
        assert!((jvms.debug_start()..jvms.debug_end()).any(|i| c.graph.input(sfpt, i) == Some(p)));
    }

    #[test]
    fn object_stored_in_object_is_eliminated_too() {
        let mut kt = KlassTable::new(true);
        let inner = kt.define_instance("Inner", None, &[("v", BasicType::Int)], KlassFlags::empty());
        let outer = kt.define_instance("Outer", None, &[("f", BasicType::Object)], KlassFlags::empty());
        let mut b = builder();
        b.gc(GcKind::NoOp);
        let mut c = compile_with(kt, b);
        let mut kit = GraphKit::new(&mut c);
        let i = kit.new_instance(inner);
        let o = kit.new_instance(outer);
        kit.store_field(o, "f", i);
        let sfpt = kit.safepoint(&[o]);
        kit.return_value(None);
        let ialloc = c.graph.ideal_allocation(i).unwrap();
        let oalloc = c.graph.ideal_allocation(o).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(oalloc));
        assert!(c.graph.is_dead(ialloc));
        assert_eq!(live(&c, Opcode::SafePointScalarObject), 2);
        // The outer object's field refers to the inner one's description.
        let (_, values) = description(&c, sfpt);
        assert_eq!(c.graph.op(values[0]), Opcode::SafePointScalarObject);
    }

    #[test]
    fn locks_on_local_object_are_removed() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let bx = kit.lock(p, &[]);
        let one = kit.c.graph.intcon(1);
        kit.store_field(p, "x", one);
        kit.unlock(p, bx);
        kit.return_value(None);

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        for op in [
            Opcode::Lock,
            Opcode::Unlock,
            Opcode::MemBarAcquireLock,
            Opcode::MemBarReleaseLock,
            Opcode::BoxLock,
            Opcode::Allocate,
        ] {
            assert_eq!(live(&c, op), 0, "{op:?} left");
        }
    }

    #[test]
    fn debug_only_box_is_removed() {
        let mut kt = KlassTable::new(true);
        let dbl = kt.define_instance("Double", None, &[("value", BasicType::Double)], KlassFlags::IS_BOX);
        let mut c = compile_with(kt, builder());
        let mut kit = GraphKit::new(&mut c);
        let d = kit.parameter(0, Type::Double);
        let b = kit.box_value(dbl, d, &[]);
        let sfpt = kit.safepoint(&[b]);
        kit.return_value(None);
        let call = c.graph.input(b, 0).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(call));
        let (_, values) = description(&c, sfpt);
        assert_eq!(values, [d]);
    }

    #[test]
    fn returned_box_is_kept() {
        let mut kt = KlassTable::new(true);
        let dbl = kt.define_instance("Double", None, &[("value", BasicType::Double)], KlassFlags::IS_BOX);
        let mut c = compile_with(kt, builder());
        let mut kit = GraphKit::new(&mut c);
        let d = kit.parameter(0, Type::Double);
        let b = kit.box_value(dbl, d, &[]);
        kit.return_value(Some(b));
        let call = c.graph.input(b, 0).unwrap();

        c.optimize().unwrap();
        assert!(!c.graph.is_dead(call));
        assert_eq!(c.graph.op(call), Opcode::CallStaticJava);
    }

    #[test]
    fn array_elements_are_scalarized() {
        let mut b = builder();
        b.gc(GcKind::NoOp);
        let mut c = compile_with(KlassTable::new(true), b);
        let mut kit = GraphKit::new(&mut c);
        let two = kit.c.graph.intcon(2);
        let a = kit.new_array(BasicType::Int, two);
        let one = kit.c.graph.intcon(1);
        let nine = kit.c.graph.intcon(9);
        kit.store_array(a, one, BasicType::Int, nine);
        let sfpt = kit.safepoint(&[a]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(a).unwrap();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        eliminate_macro_nodes(&mut c).unwrap();
        assert!(c.graph.is_dead(alloc));
        let (_, values) = description(&c, sfpt);
        let consts: Vec<_> = values.iter().map(|&v| c.graph.find_int_con(v)).collect();
        assert_eq!(consts, [Some(0), Some(9)]);
    }
}
