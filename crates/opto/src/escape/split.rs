//! Memory slices of their own for scalar replaceable allocations.
//!
//! Every pointer derived from such an allocation is retyped with the allocation as its instance
//! id, so its field accesses fall into new alias classes. The memory graph is then rewired so
//! each instance slice only threads through the stores of that instance:
//!
//! 1. retype the allocation result and everything derived from it,
//! 2. find the new memory input of each memory operation on those addresses,
//! 3. spread the instance slices through every `MergeMem`,
//! 4. commit the new memory edges and move the remaining users of instance stores back to the
//!    general slice.

use super::ConnectionGraph;
use super::build::{address_offset, find_second_addp, get_addp_base};
use crate::arraycopy;
use crate::compile::Compile;
use crate::entity::EntityRef;
use crate::ir::klass::{ARRAY_BASE_OFFSET, ARRAY_LENGTH_OFFSET, KLASS_OFFSET};
use crate::ir::{AliasIdx, Node, NodeInfo, Offset, Opcode, PhiInfo, Type, TypePtr, slot};
use crate::macro_expand;
use crate::result::RetryReason;
use crate::timing::{self, Pass};
use crate::{FxHashMap, FxHashSet, trace};

/// Bookkeeping shared by the memory walks.
struct Splitter {
    invocation: u32,
    /// Memory Phis whose inputs must be revisited once all instance slices exist.
    orig_phis: Vec<Node>,
    /// Instance Phis created for `(original Phi, slice)`.
    split_phis: FxHashMap<(Node, AliasIdx), Node>,
}

impl Splitter {
    fn push_orig_phi(&mut self, phi: Node) {
        if !self.orig_phis.contains(&phi) {
            self.orig_phis.push(phi);
        }
    }

    /// The only input of `phi` other than itself and top, if it has one.
    fn unique_input(c: &Compile, phi: Node) -> Option<Node> {
        let g = &c.graph;
        let mut found = None;
        for i in 1..g.req(phi) {
            let Some(inp) = g.input(phi, i) else {
                continue;
            };
            if inp == phi || g.is_top(inp) {
                continue;
            }
            match found {
                None => found = Some(inp),
                Some(f) if f != inp => return None,
                _ => {}
            }
        }
        found
    }

    /// Walk up the memory chain from `orig` to the closest state of slice `alias`.
    ///
    /// For an instance slice the walk steps over everything that cannot touch the instance:
    /// stores to other slices, calls, other allocations, barriers and Phis of other slices,
    /// which get a split instance copy. For a general slice only stores to known instances are
    /// skipped. Returns `None` once the compilation is failing.
    fn find_inst_mem(&mut self, c: &mut Compile, orig: Option<Node>, alias: AliasIdx) -> Option<Node> {
        let orig = orig?;
        let toop = c.alias.adr_type(alias).clone();
        let is_instance = toop.is_known_instance();
        let start_mem = c.graph.start_mem();
        let mut prev = None;
        let mut result = orig;
        while prev != Some(result) {
            prev = Some(result);
            if Some(result) == start_mem {
                break;
            }
            if c.graph.op(result).is_mem() {
                let adr_top = c
                    .graph
                    .input(result, slot::mem::ADDRESS)
                    .is_none_or(|a| c.graph.is_top(a));
                if adr_top {
                    break;
                }
                if c.mem_alias_index(result) == alias {
                    break;
                }
                let instance_store = c.adr_type(result).is_some_and(|t| t.is_known_instance());
                if !is_instance && !instance_store {
                    // Stores to the general slice stay where they are.
                    break;
                }
                match c.graph.input(result, slot::mem::MEMORY) {
                    Some(m) => result = m,
                    None => break,
                }
            }
            if !is_instance {
                continue;
            }
            match c.graph.op(result) {
                Opcode::Proj if c.graph.proj_con(result) == Some(slot::MEMORY) => {
                    let g = &c.graph;
                    let Some(pin) = g.input(result, 0) else {
                        break;
                    };
                    let op = g.op(pin);
                    let next = g.input(pin, slot::MEMORY).unwrap_or(result);
                    if op.is_allocate() {
                        if Some(pin) == toop.instance_id {
                            break;
                        }
                        result = next;
                    } else if op == Opcode::Initialize {
                        let alloc = g
                            .input(pin, slot::init::RAW_ADDRESS)
                            .and_then(|raw| g.input(raw, 0));
                        if alloc.is_some() && alloc == toop.instance_id {
                            break;
                        }
                        result = next;
                    } else if op.is_call() {
                        if !arraycopy::may_modify_instance(c, pin, &toop) {
                            result = next;
                        }
                    } else if op.is_membar() || op.is_gc_barrier() {
                        // A clone publishes its stores through the barrier after it.
                        let bs = c.barrier_set();
                        let ctl = g
                            .input(pin, slot::CONTROL)
                            .map(|ctl| bs.c2().step_over_gc_barrier(c, ctl));
                        let clone = ctl
                            .filter(|&p| g.op(p) == Opcode::Proj)
                            .and_then(|p| g.input(p, 0))
                            .filter(|&ac| g.op(ac) == Opcode::ArrayCopy);
                        if clone.is_some_and(|ac| arraycopy::call_may_modify(c, ac, &toop)) {
                            break;
                        }
                        result = next;
                    }
                }
                Opcode::MergeMem => {
                    let mm = result;
                    result = c.graph.memory_at(mm, alias);
                    if result == c.graph.base_memory(mm) {
                        // Nothing recorded for the instance: search the general slice.
                        let general = c.alias.general_index(alias);
                        let gen_mem = c.graph.memory_at(mm, general);
                        let found = self.find_inst_mem(c, Some(gen_mem), alias);
                        if c.failing().is_some() {
                            return None;
                        }
                        let found = found?;
                        c.graph.set_memory_at(mm, alias, found);
                        result = found;
                    }
                }
                Opcode::Phi => {
                    if c.mem_alias_index(result) != alias {
                        match Self::unique_input(c, result) {
                            Some(un) => {
                                self.push_orig_phi(result);
                                result = un;
                            }
                            None => break,
                        }
                    }
                }
                Opcode::SCMemProj => {
                    let Some(ls) = c.graph.input(result, 0) else {
                        break;
                    };
                    let adr_top = c
                        .graph
                        .input(ls, slot::mem::ADDRESS)
                        .is_none_or(|a| c.graph.is_top(a));
                    if !adr_top && c.mem_alias_index(ls) == alias {
                        debug_assert!(false, "atomic access to a scalar replaceable object");
                        break;
                    }
                    result = c.graph.input(ls, slot::mem::MEMORY).unwrap_or(result);
                }
                _ => {}
            }
        }
        if c.graph.op(result) == Opcode::Phi {
            debug_assert_eq!(*c.graph.ty(result), Type::Memory, "memory Phi required");
            if !is_instance {
                self.push_orig_phi(result);
            } else if c.mem_alias_index(result) != alias {
                return self.split_memory_phi(c, result, alias);
            }
        }
        Some(result)
    }

    /// A Phi of slice `alias` at the region of `orig`, whose inputs are the instance states
    /// reaching each of `orig`'s inputs.
    fn split_memory_phi(&mut self, c: &mut Compile, orig: Node, alias: AliasIdx) -> Option<Node> {
        if let Some(&phi) = self.split_phis.get(&(orig, alias)) {
            return Some(phi);
        }
        let fudge = c.flags().node_limit_fudge_factor() as usize;
        if c.graph.live_nodes() + 2 * fudge > c.flags().max_node_limit() as usize {
            log::debug!("escape analysis #{}: out of nodes splitting {orig}", self.invocation);
            c.record_failure(RetryReason::for_invocation(self.invocation));
            return None;
        }
        self.push_orig_phi(orig);
        let region = c.graph.input(orig, 0);
        let adr_type = c.alias.adr_type(alias).clone();
        let phi = c.graph.add(
            Opcode::Phi,
            &[region],
            Type::Memory,
            NodeInfo::Phi(PhiInfo {
                adr_type: Some(adr_type),
            }),
        );
        // Registered before the inputs are searched: loops lead back here.
        self.split_phis.insert((orig, alias), phi);
        trace!("split memory {} for {} into {}", orig, alias, phi);
        for i in 1..c.graph.req(orig) {
            let inp = c.graph.input(orig, i);
            let mem = self.find_inst_mem(c, inp, alias);
            if c.failing().is_some() {
                return None;
            }
            c.graph.set_req(phi, i, mem);
        }
        c.graph.record_for_igvn(phi);
        Some(phi)
    }

    /// Users of the instance store `n` that are not specific to its instance move down to the
    /// general slice below it.
    fn move_inst_mem(&mut self, c: &mut Compile, n: Node) {
        let alias = c.mem_alias_index(n);
        let general = c.alias.general_index(alias);
        if general == alias {
            return;
        }
        for u in c.graph.uses(n) {
            match c.graph.op(u) {
                Opcode::MergeMem => {
                    if c.graph.memory_at(u, general) != n {
                        continue;
                    }
                    if let Some(m) = self.find_inst_mem(c, Some(n), general) {
                        c.graph.set_memory_at(u, general, m);
                    }
                }
                op if op.is_membar() && op != Opcode::Initialize => {
                    if c.graph.input(u, slot::membar::PRECEDENT) == Some(n) {
                        continue;
                    }
                    if c.graph.input(u, slot::MEMORY) != Some(n) {
                        continue;
                    }
                    if let Some(m) = self.find_inst_mem(c, Some(n), general) {
                        c.graph.set_req(u, slot::MEMORY, Some(m));
                    }
                }
                _ => {}
            }
        }
    }
}

fn push_unique(list: &mut Vec<Node>, n: Node) {
    if !list.contains(&n) {
        list.push(n);
    }
}

/// The instance type of the scalar replaceable object `n` refers to, if the object was already
/// given one.
fn instance_type(cg: &ConnectionGraph, c: &Compile, n: Node) -> Option<TypePtr> {
    let jobj = cg.unique_java_object(n).filter(|&p| p != cg.phantom)?;
    if !cg.nodes[jobj].scalar_replaceable() {
        return None;
    }
    let alloc = cg.nodes[jobj].node;
    let res = macro_expand::result_cast(&c.graph, alloc)?;
    c.graph
        .ty(res)
        .isa_oopptr()
        .filter(|t| t.is_known_instance())
        .cloned()
}

/// Queue the users of `n`, a pointer into a scalar replaceable object.
fn push_pointer_users(
    c: &Compile,
    n: Node,
    alloc_worklist: &mut Vec<Node>,
    memnode_worklist: &mut Vec<Node>,
    reducible_merges: &[Node],
) {
    let g = &c.graph;
    for u in g.uses(n) {
        let op = g.op(u);
        if op.is_mem() && g.input(u, slot::mem::ADDRESS) == Some(n) {
            push_unique(memnode_worklist, u);
        } else if op.is_membar() {
            if g.input(u, slot::MEMORY) == Some(n) {
                push_unique(memnode_worklist, u);
            }
        } else if op == Opcode::AddP {
            if g.outcnt(u) == 0 {
                continue;
            }
            if let Some(addp2) = find_second_addp(g, u, n) {
                push_unique(alloc_worklist, addp2);
            }
            push_unique(alloc_worklist, u);
        } else if op == Opcode::Phi {
            // Reducible merges are reduced last, once all their inputs are retyped.
            if g.ty(u).make_ptr().is_some() && !reducible_merges.contains(&u) {
                push_unique(alloc_worklist, u);
            }
        } else if matches!(
            op,
            Opcode::CheckCastPP | Opcode::CastPP | Opcode::EncodeP | Opcode::DecodeN
        ) {
            push_unique(alloc_worklist, u);
        }
    }
}

/// Retype `n` to `tinst`, keeping it narrow if it was narrow.
fn retype(c: &mut Compile, n: Node, tinst: &TypePtr) {
    let ty = match c.graph.ty(n) {
        Type::NarrowOop(_) => Type::NarrowOop(tinst.clone()),
        _ => Type::Ptr(tinst.clone()),
    };
    c.graph.set_type(n, ty);
    c.graph.record_for_igvn(n);
}

/// Give the scalar replaceable allocations in `alloc_worklist` memory slices of their own.
///
/// The worklist also holds the reducible merges, which are reduced once their inputs have
/// instance types. Failures (running out of nodes) are recorded on `c`.
pub(super) fn split_unique_types(
    cg: &mut ConnectionGraph,
    c: &mut Compile,
    mut alloc_worklist: Vec<Node>,
    arraycopy_worklist: &[Node],
    mergemem_worklist: &[Node],
    reducible_merges: &[Node],
) {
    let _tt = timing::start(Pass::SplitUniqueTypes);
    let new_index_start = c.alias.len();
    let mut sp = Splitter {
        invocation: cg.invocation,
        orig_phis: Vec::new(),
        split_phis: FxHashMap::default(),
    };
    let mut memnode_worklist: Vec<Node> = Vec::new();
    let mut visited: FxHashSet<Node> = FxHashSet::default();

    // Phase 1: instance types.
    while let Some(n) = alloc_worklist.pop() {
        if c.graph.is_dead(n) || !visited.insert(n) {
            continue;
        }
        let op = c.graph.op(n);
        if op.is_allocate() {
            if let NodeInfo::Alloc(a) = c.graph.info_mut(n) {
                a.is_scalar_replaceable = true;
            }
            let Some(res) = macro_expand::result_cast(&c.graph, n) else {
                // Only the initialization uses it.
                continue;
            };
            let Some(t) = c.graph.ty(res).isa_oopptr().cloned() else {
                continue;
            };
            if !t.exact {
                continue;
            }
            let tinst = t.cast_to_instance_id(Some(n));
            trace!("{} gets instance type {}", res, tinst);
            retype(c, res, &tinst);
            c.alias_index(&tinst.with_offset(Offset::Known(0)));
            c.alias_index(&tinst.with_offset(Offset::Known(KLASS_OFFSET)));
            if tinst.is_aryptr() {
                c.alias_index(&tinst.with_offset(Offset::Known(ARRAY_LENGTH_OFFSET)));
                c.alias_index(&tinst.with_offset(Offset::Known(ARRAY_BASE_OFFSET)));
            } else if let Some(k) = tinst.klass {
                let offsets: Vec<i32> = c.klasses.nonstatic_fields(k).iter().map(|f| f.offset).collect();
                for off in offsets {
                    c.alias_index(&tinst.with_offset(Offset::Known(off)));
                }
            }
            // The initialization captures the raw stores of the new object.
            if let Some(raw) = c.graph.proj_out(n, slot::PARMS) {
                for u in c.graph.uses(raw) {
                    let uop = c.graph.op(u);
                    if uop == Opcode::AddP && c.graph.outcnt(u) > 0 {
                        if let Some(addp2) = find_second_addp(&c.graph, u, raw) {
                            push_unique(&mut alloc_worklist, addp2);
                        }
                        push_unique(&mut alloc_worklist, u);
                    } else if uop.is_membar() {
                        push_unique(&mut memnode_worklist, u);
                    }
                }
            }
            push_pointer_users(c, res, &mut alloc_worklist, &mut memnode_worklist, reducible_merges);
            continue;
        }

        match op {
            Opcode::AddP => {
                if cg.has_reducible_merge_base(&c.graph, n, reducible_merges) {
                    continue;
                }
                let base = get_addp_base(&c.graph, n);
                let Some(tinst) = instance_type(cg, c, base) else {
                    continue;
                };
                let offset = address_offset(&c.graph, n);
                let t = tinst.with_offset(offset);
                retype(c, n, &t);
                c.alias_index(&t);
            }
            Opcode::CheckCastPP | Opcode::CastPP | Opcode::EncodeP | Opcode::DecodeN => {
                let Some(tinst) = instance_type(cg, c, n) else {
                    continue;
                };
                retype(c, n, &tinst);
            }
            Opcode::Phi => {
                if reducible_merges.contains(&n) {
                    cg.reduce_phi(c, n, &mut alloc_worklist);
                    continue;
                }
                let Some(tinst) = instance_type(cg, c, n) else {
                    continue;
                };
                retype(c, n, &tinst);
            }
            _ => continue,
        }
        push_pointer_users(c, n, &mut alloc_worklist, &mut memnode_worklist, reducible_merges);
    }

    // Copies record the instances they read and write.
    for &ac in arraycopy_worklist {
        if c.graph.is_dead(ac) {
            continue;
        }
        let end_type = |cg: &ConnectionGraph, c: &Compile, i: usize| {
            let mut x = c.graph.input(ac, i)?;
            if c.graph.op(x) == Opcode::AddP {
                x = get_addp_base(&c.graph, x);
            }
            instance_type(cg, c, x)
        };
        let dest_type = end_type(cg, c, slot::arraycopy::DEST);
        let src_type = end_type(cg, c, slot::arraycopy::SRC);
        if let NodeInfo::ArrayCopy(info) = c.graph.info_mut(ac) {
            if dest_type.is_some() {
                info.dest_type = dest_type;
            }
            if src_type.is_some() {
                info.src_type = src_type;
            }
        }
    }

    // Phase 2: new memory inputs, applied in phase 4 since phase 3 needs the old ones.
    let mut new_mem: Vec<(Node, Node)> = Vec::new();
    let mut processed: Vec<Node> = Vec::new();
    let mut i = 0;
    while i < memnode_worklist.len() {
        let n = memnode_worklist[i];
        i += 1;
        if c.graph.is_dead(n) || processed.contains(&n) {
            continue;
        }
        processed.push(n);
        let op = c.graph.op(n);
        let mut out = n;
        if op.is_mem() {
            let alias = c.mem_alias_index(n);
            let old = c.graph.input(n, slot::mem::MEMORY);
            let mem = sp.find_inst_mem(c, old, alias);
            if c.failing().is_some() {
                return;
            }
            if let Some(mem) = mem.filter(|&m| Some(m) != old) {
                new_mem.push((n, mem));
            }
            if op.is_load() {
                continue;
            }
            if op.is_load_store() {
                match c.graph.find_out_with(n, Opcode::SCMemProj) {
                    Some(p) => out = p,
                    None => continue,
                }
            }
        } else if op.is_membar() || op.is_call_leaf() {
            match c.graph.proj_out(n, slot::MEMORY) {
                Some(p) => out = p,
                None => continue,
            }
        } else if op != Opcode::Phi {
            continue;
        }
        for u in c.graph.uses(out) {
            let uop = c.graph.op(u);
            if uop == Opcode::Phi {
                push_unique(&mut memnode_worklist, u);
            } else if uop.is_mem() {
                if c.graph.input(u, slot::mem::MEMORY) == Some(out) {
                    push_unique(&mut memnode_worklist, u);
                }
            } else if uop.is_membar() || uop.is_call_leaf() {
                if c.graph.input(u, slot::MEMORY) == Some(out) {
                    push_unique(&mut memnode_worklist, u);
                }
            }
        }
    }

    // Phase 3: instance slices of every merged memory state.
    let new_index_end = c.alias.len();
    for &mm in mergemem_worklist {
        if c.graph.is_dead(mm) || c.graph.op(mm) != Opcode::MergeMem {
            continue;
        }
        let nslices = c.graph.req(mm);
        for i in (AliasIdx::RAW.index() + 1)..nslices {
            let Some(mut mem) = c.graph.input(mm, i) else {
                continue;
            };
            if c.graph.is_top(mem) {
                continue;
            }
            // Stores whose type became more precise move to their own slice.
            let mut cur = None;
            while c.graph.op(mem).is_mem() {
                let adr_top = c
                    .graph
                    .input(mem, slot::mem::ADDRESS)
                    .is_none_or(|a| c.graph.is_top(a));
                if !adr_top {
                    let idx = c.mem_alias_index(mem);
                    if idx.index() == i {
                        cur.get_or_insert(mem);
                    } else if idx > AliasIdx::RAW {
                        let slot_mem = c.graph.input(mm, idx.index());
                        if slot_mem.is_none_or(|m| c.graph.is_empty_memory(m)) {
                            c.graph.set_memory_at(mm, idx, mem);
                        }
                    }
                }
                match c.graph.input(mem, slot::mem::MEMORY) {
                    Some(m) => mem = m,
                    None => break,
                }
            }
            let slice = AliasIdx::new(i);
            c.graph.set_memory_at(mm, slice, cur.unwrap_or(mem));
            for ni in new_index_start..new_index_end {
                let ni = AliasIdx::new(ni);
                if c.alias.general_index(ni) != slice {
                    continue;
                }
                let m = c.graph.input(mm, ni.index());
                if m.is_none_or(|m| c.graph.is_empty_memory(m)) {
                    let found = sp.find_inst_mem(c, Some(mem), ni);
                    if c.failing().is_some() {
                        return;
                    }
                    if let Some(found) = found {
                        c.graph.set_memory_at(mm, ni, found);
                    }
                }
            }
        }
        for ni in new_index_start..new_index_end {
            let ni = AliasIdx::new(ni);
            if c.graph.memory_at(mm, ni) != c.graph.base_memory(mm) {
                continue;
            }
            let general = c.alias.general_index(ni);
            let gen_mem = c.graph.memory_at(mm, general);
            let found = sp.find_inst_mem(c, Some(gen_mem), ni);
            if c.failing().is_some() {
                return;
            }
            if let Some(found) = found {
                c.graph.set_memory_at(mm, ni, found);
            }
        }
        c.graph.record_for_igvn(mm);
    }

    // Phase 4: commit. Phis we split from may still reach instance stores through their inputs.
    let mut j = 0;
    while j < sp.orig_phis.len() {
        let phi = sp.orig_phis[j];
        j += 1;
        if c.graph.is_dead(phi) {
            continue;
        }
        let alias = c.mem_alias_index(phi);
        for k in 1..c.graph.req(phi) {
            let mem = c.graph.input(phi, k);
            let found = sp.find_inst_mem(c, mem, alias);
            if c.failing().is_some() {
                return;
            }
            if found != mem {
                c.graph.set_req(phi, k, found);
            }
        }
        c.graph.record_for_igvn(phi);
    }
    for &(n, mem) in &new_mem {
        if c.graph.is_dead(n) {
            continue;
        }
        c.graph.set_req(n, slot::mem::MEMORY, Some(mem));
        c.graph.record_for_igvn(n);
    }
    for &n in &processed {
        if !c.graph.is_dead(n) && c.graph.op(n).is_store() {
            sp.move_inst_mem(c, n);
        }
    }
    log::debug!(
        "escape analysis #{}: {} instance slices, {} memory Phis split",
        cg.invocation,
        c.alias.len() - new_index_start,
        sp.split_phis.len()
    );
}

#[cfg(test)]
mod tests {
    use super::super::ConnectionGraph;
    use crate::compile::Compile;
    use crate::entity::EntityRef;
    use crate::ir::{AliasIdx, BasicType, Klass, KlassFlags, KlassTable, Node, Opcode, slot};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, builder};

    fn point() -> (Compile, Klass) {
        let _ = env_logger::try_init();
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        (Compile::new(Flags::new(builder()), kt), k)
    }

    fn stores_of(c: &Compile) -> Vec<Node> {
        c.graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::Store)
            .collect()
    }

    #[test]
    fn fields_get_instance_slices() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        // A safepoint first keeps the stores out of the initialization.
        kit.safepoint(&[p]);
        let three = kit.c.graph.intcon(3);
        let four = kit.c.graph.intcon(4);
        kit.store_field(p, "x", three);
        kit.store_field(p, "y", four);
        let sfpt = kit.safepoint(&[p]);
        kit.return_value(None);
        let general = c.alias.len();

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.graph.ty(p).isa_oopptr().unwrap().is_known_instance());
        let stores = stores_of(&c);
        assert_eq!(stores.len(), 2);
        let mm = c.graph.input(sfpt, slot::MEMORY).unwrap();
        for st in stores {
            let idx = c.mem_alias_index(st);
            assert!(idx.index() >= general, "{st} still on a general slice");
            assert_ne!(c.alias.general_index(idx), idx);
            assert_eq!(c.graph.memory_at(mm, idx), st);
            // The general slice no longer goes through the instance store.
            let r#gen = c.alias.general_index(idx);
            assert_ne!(c.graph.memory_at(mm, r#gen), st);
        }
    }

    #[test]
    fn call_is_stepped_over() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let minit = kit.memory(AliasIdx::RAW);
        let three = kit.c.graph.intcon(3);
        let st = kit.store_field(p, "x", three);
        kit.make_leaf_call("unrelated", &[]);
        let load = kit.load_field(p, "x");
        kit.safepoint(&[p, load]);
        kit.return_value(None);

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        // The store was captured: the load reads the state the initialization left.
        assert_eq!(c.graph.input(load, slot::mem::MEMORY), Some(minit));
        let init = c.graph.input(minit, 0).unwrap();
        assert_eq!(c.graph.find_captured_store(init, 12), Some(st));
    }

    #[test]
    fn diamond_splits_memory_phi() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(k);
        let cond = kit.parameter(0, crate::ir::Type::Int(None));
        let zero = kit.c.graph.intcon(0);
        let cmp = kit.cmp_i(cond, zero);
        let bol = kit.bool(cmp, crate::ir::BoolTest::Ne);
        let (t, f) = kit.make_if(bol, 0.5);
        let base = kit.state();
        kit.set_control(t);
        let one = kit.c.graph.intcon(1);
        kit.store_field(p, "x", one);
        let taken = kit.state();
        let mut other = base;
        other.ctrl = f;
        let merged = kit.merge_states(&[taken, other]);
        kit.set_state(merged);
        let load = kit.load_field(p, "x");
        kit.safepoint(&[p, load]);
        kit.return_value(None);

        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        let mem = c.graph.input(load, slot::mem::MEMORY).unwrap();
        assert_eq!(c.graph.op(mem), Opcode::Phi);
        let idx = c.mem_alias_index(mem);
        assert!(c.alias.adr_type(idx).is_known_instance());
        assert_eq!(idx, c.mem_alias_index(load));
        assert_ne!(idx, AliasIdx::BOT);
    }
}
