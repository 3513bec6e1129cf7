//! Untangling Phis that merge scalar replaceable allocations.
//!
//! A merge blocks scalar replacement of its inputs. When the merged pointer is only used for
//! field loads and as debug info, the loads are split through the Phi (each path reads its own
//! object) and the debug info describes every candidate object, plus a selector telling which
//! path was taken.

use super::{ConnectionGraph, EscapeState, PtFlags, PtIdx, PtKind};
use crate::compile::Compile;
use crate::ir::{Graph, Node, NodeInfo, Opcode, PhiInfo, PtrKind, PtrNull, ScalarMergeInfo, Type, slot};
use crate::macro_expand;
use crate::trace;

impl ConnectionGraph {
    /// The one object `n` may refer to, if there is exactly one.
    ///
    /// Nodes created after the graph was built are not known.
    pub(super) fn unique_java_object(&self, n: Node) -> Option<PtIdx> {
        let p = self.ptnode(n)?;
        let ptn = &self.nodes[p];
        if ptn.is_java_object() {
            return Some(p);
        }
        let mut found = None;
        for &e in &ptn.edges {
            if self.nodes[e].is_java_object() {
                match found {
                    None => found = Some(e),
                    Some(f) if f != e => return None,
                    _ => {}
                }
            }
        }
        found
    }

    /// Does the Phi `phi` merge at least one scalar replaceable allocation that could be
    /// eliminated? Inputs that turn out not to be eliminable lose their replaceability.
    fn can_reduce_phi_check_inputs(&mut self, c: &Compile, phi: Node) -> bool {
        let g = &c.graph;
        let mut found = false;
        for i in 1..g.req(phi) {
            let Some(inp) = g.input(phi, i) else {
                continue;
            };
            let Some(p) = self.unique_java_object(inp) else {
                continue;
            };
            if !self.nodes[p].scalar_replaceable() {
                continue;
            }
            let alloc = self.nodes[p].node;
            // Arrays are not handled.
            if g.op(alloc) != Opcode::Allocate {
                continue;
            }
            if macro_expand::can_eliminate_allocation(c, alloc, None) {
                found = true;
            } else {
                self.set_not_scalar_replaceable(p, "merged input that can't be eliminated");
            }
        }
        if !found {
            trace!("can not reduce {}: no scalar replaceable allocation as input", phi);
        }
        found
    }

    /// Has the merge `phi` already been described in the debug info of `sfpt`?
    fn has_been_reduced(g: &Graph, phi: Node, sfpt: Node) -> bool {
        let Some(jvms) = g.data(sfpt).jvms() else {
            return false;
        };
        (jvms.debug_start()..jvms.debug_end().min(g.req(sfpt))).any(|i| {
            let Some(d) = g.input(sfpt, i) else {
                return false;
            };
            match g.info(d) {
                NodeInfo::ScalarMerge(m) => g.input(sfpt, jvms.scloff + m.merge_pointer_idx) == Some(phi),
                _ => false,
            }
        })
    }

    /// Is every use of `phi` one we can rewrite: debug info of a safepoint, or an address
    /// whose only users are loads?
    fn can_reduce_check_users(&self, g: &Graph, phi: Node) -> bool {
        for &u in g.outs(phi) {
            let op = g.op(u);
            if op.is_safepoint() {
                let debug_start = g.data(u).jvms().map_or(g.req(u), |j| j.debug_start());
                let non_debug_use =
                    op.is_call() && (0..debug_start).any(|i| g.input(u, i) == Some(phi));
                if non_debug_use {
                    trace!("can not reduce {}: passed to call {}", phi, u);
                    return false;
                }
                if Self::has_been_reduced(g, phi, u) {
                    trace!("can not reduce {}: already reduced at {}", phi, u);
                    return false;
                }
            } else if op == Opcode::AddP {
                for &l in g.outs(u) {
                    let klass_load = g.ty(l).make_ptr().is_some_and(|t| t.kind == PtrKind::Klass);
                    if g.op(l) != Opcode::Load || klass_load {
                        trace!("can not reduce {}: address used by {}", phi, l);
                        return false;
                    }
                }
            } else {
                trace!("can not reduce {}: used by {} ({:?})", phi, u, op);
                return false;
            }
        }
        true
    }

    /// Can the merge `phi` be removed? It must merge exact instances, none of them null, with
    /// at least one eliminable allocation among them, and be used only in ways we can rewrite.
    pub(super) fn can_reduce_phi(&mut self, c: &Compile, phi: Node) -> bool {
        let g = &c.graph;
        if !c.flags().reduce_allocation_merges() {
            return false;
        }
        let region_ok = g.input(phi, 0).is_some_and(|r| g.op(r) == Opcode::Region);
        let exact_instance = g
            .ty(phi)
            .make_ptr()
            .is_some_and(|t| t.is_instptr() && t.exact);
        if !region_ok || !exact_instance {
            return false;
        }
        let nullable_input = (1..g.req(phi)).any(|i| {
            g.input(phi, i)
                .is_none_or(|inp| g.ty(inp).make_ptr().is_none_or(|t| t.maybe_null()))
        });
        if nullable_input {
            return false;
        }
        if !self.can_reduce_phi_check_inputs(c, phi) || !self.can_reduce_check_users(g, phi) {
            return false;
        }
        trace!("can reduce {} during invocation {}", phi, self.invocation);
        true
    }

    /// Does the address `addp` have a reducible merge among its bases?
    pub(super) fn has_reducible_merge_base(&self, g: &Graph, addp: Node, reducible_merges: &[Node]) -> bool {
        let Some(p) = self.ptnode(addp) else {
            return false;
        };
        let ptn = &self.nodes[p];
        if !ptn.is_field() || ptn.base_count() < 2 {
            return false;
        }
        ptn.bases.iter().any(|&b| {
            let base = self.nodes[b].node;
            if reducible_merges.contains(&base) {
                return true;
            }
            g.op(base).is_constraint_cast()
                && g.input(base, 1).is_some_and(|i| reducible_merges.contains(&i))
        })
    }

    /// Rewrite the field loads of the reducible merge `phi` to read from each merged object.
    pub(super) fn reduce_phi(&mut self, c: &mut Compile, phi: Node, alloc_worklist: &mut Vec<Node>) {
        let mut addps: Vec<Node> = c
            .graph
            .outs(phi)
            .iter()
            .copied()
            .filter(|&u| c.graph.op(u) == Opcode::AddP)
            .collect();
        addps.sort();
        addps.dedup();
        for addp in addps {
            self.reduce_phi_on_field_access(c, phi, addp, alloc_worklist);
        }
    }

    /// Split every load through `addp` into one load per merged object, joined by a Phi.
    fn reduce_phi_on_field_access(&mut self, c: &mut Compile, phi: Node, addp: Node, alloc_worklist: &mut Vec<Node>) {
        let Some(field) = self.ptnode(addp) else {
            return;
        };
        let loads: Vec<Node> = c
            .graph
            .outs(addp)
            .iter()
            .copied()
            .filter(|&l| c.graph.op(l) == Opcode::Load)
            .collect();
        for load in loads {
            let Some(data_phi) = split_load_through_phi(c, phi, addp, load) else {
                return;
            };
            self.updates_after_load_split(c, field, load, data_phi, alloc_worklist);
            c.graph.replace_node(load, data_phi);
        }
        debug_assert!(c.graph.is_dead(addp) || c.graph.outcnt(addp) == 0, "address still used");
        alloc_worklist.retain(|&n| n != addp);
    }

    /// Register the loads created by splitting `load` in the connection graph.
    fn updates_after_load_split(
        &mut self,
        c: &Compile,
        field: PtIdx,
        load: Node,
        data_phi: Node,
        alloc_worklist: &mut Vec<Node>,
    ) {
        let g = &c.graph;
        let load_ptn = self.ptnode(load);
        for i in 1..g.req(data_phi) {
            let Some(new_load) = g.input(data_phi, i) else {
                continue;
            };
            if g.op(new_load) != Opcode::Load {
                continue;
            }
            let Some(new_addp) = g.input(new_load, slot::mem::ADDRESS) else {
                continue;
            };
            let base = super::build::get_addp_base(g, new_addp);
            // Only bases that get an instance type of their own matter.
            let Some(jobj) = self.unique_java_object(base) else {
                continue;
            };
            if !self.nodes[jobj].scalar_replaceable() {
                continue;
            }
            if !alloc_worklist.contains(&new_addp) {
                alloc_worklist.push(new_addp);
            }
            let es = self.nodes[field].es;
            let f = self.push_field_like(new_addp, field, es);
            if let Some(b) = self.ptnode(base) {
                self.add_base(f, b);
            }
            if let Some(lp) = load_ptn {
                let les = self.nodes[lp].es;
                let l = self.add_local_var(new_load, les);
                self.add_edge(l, f);
            }
        }
    }

    /// A new field node for `n` with the offset and flags of `like`.
    fn push_field_like(&mut self, n: Node, like: PtIdx, es: EscapeState) -> PtIdx {
        if let Some(p) = self.ptnode(n) {
            return p;
        }
        let p = self.nodes.push(super::PointsToNode::new(n, PtKind::Field, es));
        self.nodes[p].offset = self.nodes[like].offset;
        if self.nodes[like].is_oop() {
            self.nodes[p].flags.insert(PtFlags::IS_OOP);
        }
        self.map[n] = p.into();
        p
    }

    /// A Phi telling which input of `phi` was taken: the index of the scalar replaced object
    /// describing it, or -1 for inputs that were not replaced.
    fn create_selector(&self, c: &mut Compile, phi: Node) -> Node {
        let g = &mut c.graph;
        let region = g.input(phi, 0);
        let minus_one = g.intcon(-1);
        let mut inputs = vec![region];
        let mut n_sr = 0;
        for i in 1..g.req(phi) {
            let sr = g
                .input(phi, i)
                .and_then(|b| self.unique_java_object(b))
                .is_some_and(|p| self.nodes[p].scalar_replaceable());
            if sr {
                inputs.push(Some(g.intcon(n_sr)));
                n_sr += 1;
            } else {
                inputs.push(Some(minus_one));
            }
        }
        g.add(Opcode::Phi, &inputs, Type::Int(None), NodeInfo::Phi(PhiInfo::default()))
    }

    /// Replace the debug info references to `phi` with a description of every object it merges.
    /// Returns false if some object could not be described.
    pub(super) fn reduce_phi_on_safepoints(&mut self, c: &mut Compile, phi: Node) -> bool {
        let mut safepoints: Vec<Node> = c
            .graph
            .outs(phi)
            .iter()
            .copied()
            .filter(|&u| c.graph.op(u).is_safepoint())
            .collect();
        safepoints.sort();
        safepoints.dedup();
        if safepoints.is_empty() {
            return true;
        }
        let selector = self.create_selector(c, phi);
        let Some(merge_t) = c.graph.ty(phi).make_ptr().cloned() else {
            return false;
        };
        let root = c.graph.root();
        for sfpt in safepoints {
            let Some(jvms) = c.graph.data(sfpt).jvms().cloned() else {
                continue;
            };
            let merge_idx = c.graph.req(sfpt) - jvms.scloff;
            let smerge = c.graph.add(
                Opcode::SafePointScalarMerge,
                &[Some(root)],
                Type::Ptr(merge_t.clone()),
                NodeInfo::ScalarMerge(ScalarMergeInfo { merge_pointer_idx: merge_idx }),
            );
            // The pointer for inputs that were not replaced, then the selector.
            c.graph.add_req(sfpt, Some(phi));
            c.graph.add_req(sfpt, Some(selector));
            self.set_debug_end(c, sfpt);

            for i in 1..c.graph.req(phi) {
                let Some(base) = c.graph.input(phi, i) else {
                    continue;
                };
                let Some(p) = self.unique_java_object(base) else {
                    continue;
                };
                if !self.nodes[p].scalar_replaceable() {
                    continue;
                }
                let alloc = self.nodes[p].node;
                let Some(sobj) = macro_expand::create_scalarized_object_description(c, alloc, sfpt) else {
                    return false;
                };
                let debug_start = jvms.debug_start();
                let debug_end = self.debug_end(c, sfpt);
                if let Some(res) = macro_expand::result_cast(&c.graph, alloc) {
                    c.graph.replace_edges_in_range(sfpt, res, Some(sobj), debug_start, debug_end);
                }
                c.graph.add_req(smerge, Some(sobj));
            }
            let debug_end = self.debug_end(c, sfpt);
            c.graph.replace_edges_in_range(sfpt, phi, Some(smerge), jvms.debug_start(), debug_end);
            // The replacement above also hit the merge pointer.
            c.graph.set_req(sfpt, jvms.scloff + merge_idx, Some(phi));
            c.graph.record_for_igvn(sfpt);
        }
        true
    }

    fn debug_end(&self, c: &Compile, sfpt: Node) -> usize {
        c.graph.data(sfpt).jvms().map_or(c.graph.req(sfpt), |j| j.debug_end())
    }

    fn set_debug_end(&self, c: &mut Compile, sfpt: Node) {
        let req = c.graph.req(sfpt);
        if let Some(j) = c.graph.data_mut(sfpt).jvms_mut() {
            j.endoff = req;
        }
    }

    /// Replace `phi` by a Phi that is null on every scalar replaced path, the last use keeping
    /// those allocations alive.
    pub(super) fn reset_scalar_replaceable_entries(&mut self, c: &mut Compile, phi: Node) {
        let g = &mut c.graph;
        let null = g.null();
        let Some(merge_t) = g.ty(phi).make_ptr().cloned() else {
            return;
        };
        let new_t = merge_t.cast_to_null(PtrNull::Maybe);
        let mut inputs = vec![g.input(phi, 0)];
        for i in 1..g.req(phi) {
            let inp = g.input(phi, i);
            let sr = inp
                .and_then(|b| self.unique_java_object(b))
                .is_some_and(|p| self.nodes[p].scalar_replaceable());
            inputs.push(if sr { Some(null) } else { inp });
        }
        let info = g.info(phi).clone();
        let new_phi = g.add(Opcode::Phi, &inputs, Type::Ptr(new_t), info);
        g.record_for_igvn(new_phi);
        if let Some(p) = self.ptnode(phi) {
            self.map[new_phi] = p.into();
        }
        g.replace_node(phi, new_phi);
    }
}

/// One load per merged object in place of `load` through `addp`, joined by a Phi on the
/// region of `phi`.
fn split_load_through_phi(c: &mut Compile, phi: Node, addp: Node, load: Node) -> Option<Node> {
    let g = &mut c.graph;
    let Some(region) = g.input(phi, 0) else {
        debug_assert!(false, "Phi {phi} without region");
        return None;
    };
    let offset = g.input(addp, slot::addp::OFFSET);
    let mem = g.input(load, slot::mem::MEMORY);
    let load_ty = g.ty(load).clone();
    let info = g.info(load).clone();
    let mut values = Vec::with_capacity(g.req(phi));
    values.push(Some(region));
    for i in 1..g.req(phi) {
        let base = g.input(phi, i).unwrap_or_else(|| g.top());
        let ctl = g.input(region, i);
        let m = match mem {
            Some(m) if g.op(m) == Opcode::Phi && g.input(m, 0) == Some(region) => g.input(m, i),
            other => other,
        };
        let off = offset
            .and_then(|o| g.find_int_con(o))
            .and_then(|o| i32::try_from(o).ok());
        let adr_ty = match (g.ty(base).make_ptr(), off) {
            (Some(tp), Some(off)) => Type::Ptr(tp.add_offset(off)),
            _ => g.ty(addp).clone(),
        };
        let new_addp = g.add(Opcode::AddP, &[None, Some(base), Some(base), offset], adr_ty, NodeInfo::None);
        let new_load = g.add(Opcode::Load, &[ctl, m, Some(new_addp)], load_ty.clone(), info.clone());
        values.push(Some(new_load));
    }
    let data_phi = g.add(Opcode::Phi, &values, load_ty, NodeInfo::Phi(PhiInfo::default()));
    g.record_for_igvn(data_phi);
    trace!("split {} through {} into {}", load, phi, data_phi);
    Some(data_phi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicType, Klass, KlassFlags, KlassTable};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, builder};

    fn point() -> (Compile, Klass) {
        let mut kt = KlassTable::new(true);
        let point = kt.define_instance("Point", None, &[("x", BasicType::Int), ("y", BasicType::Int)], KlassFlags::empty());
        (Compile::new(Flags::new(builder()), kt), point)
    }

    /// `p = cond ? new Point(1) : new Point(2)`, then whatever `uses` does with `p`.
    fn diamond(c: &mut Compile, point: Klass, uses: impl FnOnce(&mut GraphKit, Node)) -> (Node, Node, Node) {
        let mut kit = GraphKit::new(c);
        let cond = kit.parameter(0, Type::Int(None));
        let zero = kit.c.graph.intcon(0);
        let cmp = kit.cmp_i(cond, zero);
        let bol = kit.bool(cmp, crate::ir::BoolTest::Ne);
        let (t, f) = kit.make_if(bol, 0.5);
        let entry = kit.state();

        kit.set_control(t);
        let a = kit.new_instance(point);
        let one = kit.c.graph.intcon(1);
        kit.store_field(a, "x", one);
        let sa = kit.state();

        kit.set_state(entry);
        kit.set_control(f);
        let b = kit.new_instance(point);
        let two = kit.c.graph.intcon(2);
        kit.store_field(b, "x", two);
        let sb = kit.state();

        let merged = kit.merge_states(&[sa, sb]);
        kit.set_state(merged);
        let region = kit.control();
        let ty = Type::Ptr(crate::ir::TypePtr::inst(point, true, PtrNull::NotNull));
        let phi = kit.make_phi(region, &[a, b], ty, None);
        uses(&mut kit, phi);
        kit.return_value(None);
        (a, b, phi)
    }

    #[test]
    fn phi_used_by_safepoint_and_load_is_reducible() {
        let (mut c, point) = point();
        let (_, _, phi) = diamond(&mut c, point, |kit, phi| {
            kit.load_field(phi, "x");
            kit.safepoint(&[phi]);
        });
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.congraph().is_some());
        // The merge was replaced.
        assert!(c.graph.is_dead(phi));
        let merges = c
            .graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::SafePointScalarMerge)
            .count();
        assert_eq!(merges, 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "without region"))]
    fn load_through_phi_without_region_is_left_alone() {
        let (mut c, point) = point();
        let mut load = None;
        let (_, _, phi) = diamond(&mut c, point, |kit, phi| {
            load = Some(kit.load_field(phi, "x"));
        });
        let load = load.unwrap();
        let addp = c.graph.input(load, slot::mem::ADDRESS).unwrap();
        c.graph.set_req(phi, 0, None);
        let live = c.graph.live_nodes();
        assert_eq!(split_load_through_phi(&mut c, phi, addp, load), None);
        assert_eq!(c.graph.live_nodes(), live);
    }

    #[test]
    fn phi_passed_to_call_is_not_reducible() {
        let (mut c, point) = point();
        let (a, b, phi) = diamond(&mut c, point, |kit, phi| {
            kit.call_static("consume", &[phi], None, None, &[]);
        });
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(!c.graph.is_dead(phi));
        let g = &c.graph;
        assert!(!c.is_scalar_replaceable(g.ideal_allocation(a).unwrap()));
        assert!(!c.is_scalar_replaceable(g.ideal_allocation(b).unwrap()));
    }
}
