//! Escape analysis.
//!
//! The analysis builds a *connection graph* over the pointer-valued nodes of the IR:
//!
//! - a `JavaObject` node for every allocation site, call result and constant,
//! - a `LocalVar` node for every pointer value (casts, Phis, loads, projections),
//! - a `Field` node for every address computation (`AddP`) of a field or array element,
//! - an `Arraycopy` node for every bulk copy between two objects.
//!
//! Edges say what a local or a field may point to. Two sentinels complete the picture: the
//! *phantom* object stands for everything allocated outside the method, and the *null* object
//! for the null constant. Escape states are then pushed along the edges to a fixed point, after
//! which every allocation is classified `NoEscape`, `ArgEscape` or `GlobalEscape`, and the
//! non-escaping ones are checked for scalar replaceability.
//!
//! Scalar replaceable allocations then get memory slices of their own (see `split`), which is
//! what lets macro elimination find the value of each field.

mod build;
mod optimize;
mod points_to;
mod propagate;
mod reduce;
mod scalar;
mod split;

pub use self::points_to::{EscapeState, PointsToNode, PtFlags, PtIdx, PtKind, PtUse};

use crate::compile::Compile;
use crate::entity::packed_option::PackedOption;
use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::{Node, NodeInfo, Opcode, slot};
use crate::result::{OptoError, OptoResult, RetryReason};
use crate::timing::{self, Pass};
use crate::{FxHashSet, trace, trace_log_enabled};
use core::ops::Index;
use std::time::Instant;

/// Points-to information for one method.
pub struct ConnectionGraph {
    nodes: PrimaryMap<PtIdx, PointsToNode>,
    map: SecondaryMap<Node, PackedOption<PtIdx>>,
    phantom: PtIdx,
    null_obj: PtIdx,
    invocation: u32,
    /// Number of IR nodes when the graph was built. Later nodes are only mapped if the
    /// analysis registers them itself.
    map_size: usize,
    worklist: Vec<PtUse>,
    in_worklist: FxHashSet<PtUse>,
    started: Instant,
}

/// Nodes gathered while building the graph, consumed by the later phases.
#[derive(Default)]
struct Worklists {
    ptnodes: Vec<PtIdx>,
    java_objects: Vec<PtIdx>,
    non_escaped: Vec<PtIdx>,
    oop_fields: Vec<PtIdx>,
    mergemem: Vec<Node>,
    ptr_cmp: Vec<Node>,
    storestore: Vec<Node>,
    arraycopy: Vec<Node>,
    safepoints: Vec<Node>,
}

impl ConnectionGraph {
    /// Is there anything for escape analysis to do?
    ///
    /// That is an allocation, a lock on something other than a parameter or constant, or a
    /// boxing call.
    pub fn has_candidates(c: &Compile) -> bool {
        let g = &c.graph;
        g.macro_nodes().iter().any(|&n| match g.op(n) {
            Opcode::Allocate | Opcode::AllocateArray => true,
            Opcode::Lock => g
                .input(n, slot::lock::OBJECT)
                .map(|obj| build::uncast(g, obj))
                .is_some_and(|obj| !matches!(g.op(obj), Opcode::Parm | Opcode::ConP)),
            Opcode::CallStaticJava => {
                matches!(g.info(n), NodeInfo::Call(ci) if ci.boxing)
            }
            _ => false,
        })
    }

    /// Run escape analysis on `c`.
    ///
    /// When at least one object does not escape, the connection graph is attached to `c` for
    /// later queries and the memory graph of every scalar replaceable allocation has been
    /// split off. Otherwise `c` keeps no connection graph.
    ///
    /// Running out of iterations or time while propagating escape states returns a retry
    /// error before anything in the IR has been changed.
    pub fn do_analysis(c: &mut Compile, invocation: u32) -> OptoResult<()> {
        let _tt = timing::start(Pass::EscapeAnalysis);
        c.set_congraph(None);
        let mut cg = ConnectionGraph::new(c, invocation);
        let found = cg.compute_escape(c);
        match found {
            Ok(true) if c.failing().is_none() => {
                log::debug!(
                    "escape analysis #{}: {} connection graph nodes",
                    invocation,
                    cg.nodes.len()
                );
                c.set_congraph(Some(cg));
            }
            Ok(_) => {}
            Err(e) => return Err(e),
        }
        c.check_failing()
    }

    fn compute_escape(&mut self, c: &mut Compile) -> OptoResult<bool> {
        let mut w = Worklists::default();
        let mut delayed: Vec<Node> = Vec::new();
        {
            let _tt = timing::start(Pass::ConnectionGraph);
            // The sentinels may have several IR nodes mapped to them; list them once.
            w.ptnodes.push(self.phantom);
            w.java_objects.push(self.phantom);
            let ideal: Vec<Node> = c.graph.live_node_iter().collect();
            for n in ideal {
                self.add_node_to_connection_graph(c, n, &mut delayed);
                self.collect(c, n, &mut w);
            }
            if w.non_escaped.is_empty() {
                trace!("escape analysis: no allocations to analyze");
                return Ok(false);
            }
            let mut done = FxHashSet::default();
            while let Some(n) = delayed.pop() {
                if done.insert(n) {
                    self.add_final_edges(c, n);
                }
            }
            if c.flags().verify_connection_graph() {
                self.verify_edges();
            }
        }

        {
            let _tt = timing::start(Pass::PropagateEscape);
            if !self.complete_connection_graph(c, &w.ptnodes, &mut w.non_escaped, &w.java_objects, &w.oop_fields)? {
                return Ok(false);
            }
        }
        if trace_log_enabled!() {
            for (p, ptn) in self.nodes.iter() {
                trace!("  {p}: {ptn}");
            }
        }

        // Settle scalar replaceability of the objects that did not escape.
        let mut reducible_merges: Vec<Node> = Vec::new();
        let mut jobj_worklist: Vec<PtIdx> = Vec::new();
        let mut found_nsr = false;
        for &p in &w.non_escaped {
            let es = self.nodes[p].es;
            debug_assert!(es <= EscapeState::ArgEscape);
            let n = self.nodes[p].node;
            if let NodeInfo::Alloc(a) = c.graph.info_mut(n) {
                a.is_non_escaping = es == EscapeState::NoEscape;
            }
            if es == EscapeState::NoEscape && self.nodes[p].scalar_replaceable() {
                self.adjust_scalar_replaceable_state(c, p, &mut reducible_merges);
                if self.nodes[p].scalar_replaceable() {
                    jobj_worklist.push(p);
                } else {
                    found_nsr = true;
                }
            }
        }
        if found_nsr {
            self.find_scalar_replaceable_allocs(&mut jobj_worklist);
        }

        // Processed from the end: the reducible Phis come last, once their inputs have unique
        // instance types.
        let mut alloc_worklist: Vec<Node> = reducible_merges.clone();
        for &p in &jobj_worklist {
            if self.nodes[p].scalar_replaceable() {
                trace!("{} is scalar replaceable", self.nodes[p].node);
                alloc_worklist.push(self.nodes[p].node);
            }
        }

        let has_non_escaping_obj = !w.non_escaped.is_empty();
        if has_non_escaping_obj {
            self.optimize_ideal_graph(c, &w.ptr_cmp, &w.storestore);
        }

        if !alloc_worklist.is_empty() && c.flags().eliminate_allocations() {
            split::split_unique_types(
                self,
                c,
                alloc_worklist,
                &w.arraycopy,
                &w.mergemem,
                &reducible_merges,
            );
            if c.failing().is_some() {
                return Ok(false);
            }
            if c.flags().reduce_allocation_merges() {
                let _tt = timing::start(Pass::ReduceMerges);
                for &phi in &reducible_merges {
                    if c.graph.is_dead(phi) || c.graph.outcnt(phi) == 0 {
                        continue;
                    }
                    if !self.reduce_phi_on_safepoints(c, phi) {
                        log::debug!("could not reduce merge {phi} on its safepoints");
                        c.record_failure(RetryReason::NoReduceAllocationMerges);
                        return Ok(false);
                    }
                    self.reset_scalar_replaceable_entries(c, phi);
                }
            }
        }

        if has_non_escaping_obj {
            for &sfn in &w.safepoints {
                if c.graph.is_dead(sfn) {
                    continue;
                }
                let local = self.has_ea_local_in_scope(c, sfn);
                let arg = c.graph.op(sfn).is_call_java() && self.has_arg_escape(c, sfn);
                if let NodeInfo::Call(ci) = c.graph.info_mut(sfn) {
                    ci.ea_local_in_scope = local;
                    ci.arg_escape = arg;
                }
            }
        }

        Ok(has_non_escaping_obj)
    }

    /// Sort the connection graph node of `n`, if any, into the phase worklists.
    fn collect(&self, c: &Compile, n: Node, w: &mut Worklists) {
        let g = &c.graph;
        if let Some(p) = self.ptnode(n).filter(|&p| p != self.phantom) {
            w.ptnodes.push(p);
            let ptn = &self.nodes[p];
            if ptn.is_java_object() {
                w.java_objects.push(p);
                let interesting = g.op(n).is_allocate() || g.op(n) == Opcode::CallStaticJava;
                if interesting && ptn.es < EscapeState::GlobalEscape {
                    w.non_escaped.push(p);
                }
            } else if ptn.is_field() && ptn.is_oop() {
                w.oop_fields.push(p);
            }
        }
        match g.op(n) {
            Opcode::MergeMem => w.mergemem.push(n),
            Opcode::CmpP if c.flags().optimize_ptr_compare() => w.ptr_cmp.push(n),
            Opcode::MemBarStoreStore if g.input(n, slot::membar::PRECEDENT).is_some() => {
                w.storestore.push(n)
            }
            Opcode::ArrayCopy => w.arraycopy.push(n),
            op if op.is_safepoint() && g.data(n).jvms().is_some() => w.safepoints.push(n),
            _ => {}
        }
    }

    /// Give up: the graph did not converge within the configured budget.
    fn bailout(&self, c: &mut Compile, why: &str) -> OptoError {
        let reason = RetryReason::for_invocation(self.invocation);
        log::debug!("escape analysis #{} bailed out: {}", self.invocation, why);
        c.record_failure(reason);
        OptoError::Retry(reason)
    }

    /// Has the analysis used up its wall clock budget?
    fn timed_out(&self, c: &Compile) -> bool {
        let budget = u128::from(c.flags().escape_analysis_timeout_ms());
        self.started.elapsed().as_millis() > budget
    }

    /// Debug check: edges and uses mirror each other.
    fn verify_edges(&self) {
        for (p, ptn) in self.nodes.iter() {
            for &e in &ptn.edges {
                // Object to field edges are mirrored by the field's bases instead.
                let linked = if ptn.is_java_object() && self.nodes[e].is_field() {
                    self.nodes[e].bases.contains(&p)
                } else {
                    self.nodes[e].uses.contains(&PtUse::Edge(p))
                };
                debug_assert!(linked, "missing use {p} on {e}");
            }
            for &b in &ptn.bases {
                let linked = if b == self.null_obj {
                    true
                } else if self.nodes[b].is_java_object() {
                    self.nodes[b].edges.contains(&p)
                } else {
                    self.nodes[b].uses.contains(&PtUse::Base(p))
                };
                debug_assert!(linked, "missing base use {p} on {b}");
            }
        }
    }

    /// The connection graph node of `n`.
    pub fn ptnode(&self, n: Node) -> Option<PtIdx> {
        self.map[n].expand()
    }

    /// The connection graph node of `n`, by reference.
    pub fn lookup(&self, n: Node) -> Option<&PointsToNode> {
        self.ptnode(n).map(|p| &self.nodes[p])
    }

    /// Every node of the graph.
    pub fn iter(&self) -> impl Iterator<Item = (PtIdx, &PointsToNode)> {
        self.nodes.iter()
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Is the graph empty? It never is once built: the sentinels always exist.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The object standing for everything allocated outside the method.
    pub fn phantom_obj(&self) -> PtIdx {
        self.phantom
    }

    /// The object standing for the null constant.
    pub fn null_obj(&self) -> PtIdx {
        self.null_obj
    }

    /// Which run of the analysis built this graph.
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    /// The escape state of `n`; `None` for nodes the analysis did not see.
    pub fn escape_state(&self, n: Node) -> Option<EscapeState> {
        self.lookup(n).map(|ptn| ptn.es)
    }

    /// May `n` refer to an object some opaque code also holds?
    pub fn hidden_alias(&self, n: Node) -> bool {
        let Some(p) = self.ptnode(n) else {
            return true;
        };
        let ptn = &self.nodes[p];
        if ptn.es >= EscapeState::GlobalEscape {
            return true;
        }
        if ptn.is_java_object() {
            return p == self.phantom;
        }
        ptn.edges
            .iter()
            .any(|&e| e == self.phantom || self.nodes[e].es >= EscapeState::GlobalEscape)
    }

    /// Do all objects `n` may refer to stay invisible to other threads?
    pub fn not_global_escape(&self, n: Node) -> bool {
        let Some(p) = self.ptnode(n) else {
            return false;
        };
        let ptn = &self.nodes[p];
        if ptn.es >= EscapeState::GlobalEscape {
            return false;
        }
        if ptn.is_java_object() {
            return true;
        }
        ptn.edges
            .iter()
            .all(|&e| self.nodes[e].es < EscapeState::GlobalEscape)
    }

    /// Does the Java call `call` pass an object that does not escape globally?
    pub fn has_arg_escape(&self, c: &Compile, call: Node) -> bool {
        let g = &c.graph;
        let NodeInfo::Call(ci) = g.info(call) else {
            return false;
        };
        if ci.boxing {
            // The argument is a primitive.
            return false;
        }
        let nargs = ci.params.len();
        (slot::PARMS..(slot::PARMS + nargs).min(g.req(call))).any(|i| {
            let Some(arg) = g.input(call, i) else {
                return false;
            };
            let arg = if g.op(arg) == Opcode::AddP {
                build::get_addp_base(g, arg)
            } else {
                arg
            };
            g.ty(arg).isa_oopptr().is_some() && self.not_global_escape(arg)
        })
    }

    /// Does safepoint `sfn` keep an object that does not escape globally in its locals or
    /// monitors?
    pub fn has_ea_local_in_scope(&self, c: &Compile, sfn: Node) -> bool {
        let g = &c.graph;
        let Some(jvms) = g.data(sfn).jvms() else {
            return false;
        };
        (jvms.debug_start()..jvms.scloff.min(g.req(sfn)))
            .filter_map(|i| g.input(sfn, i))
            .any(|v| self.not_global_escape(v))
    }
}

impl Index<PtIdx> for ConnectionGraph {
    type Output = PointsToNode;

    fn index(&self, p: PtIdx) -> &PointsToNode {
        &self.nodes[p]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BasicType, Klass, KlassFlags, KlassTable, PtrNull, Type, TypePtr};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, builder};

    fn compile() -> (Compile, Klass) {
        let mut klasses = KlassTable::new(true);
        let point = klasses.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        (Compile::new(Flags::new(builder()), klasses), point)
    }

    #[test]
    fn no_candidates_in_empty_method() {
        let (mut c, _) = compile();
        let mut kit = GraphKit::new(&mut c);
        kit.return_value(None);
        assert!(!ConnectionGraph::has_candidates(&c));
    }

    #[test]
    fn lock_on_parameter_is_no_candidate() {
        let (mut c, k) = compile();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.parameter(0, Type::Ptr(TypePtr::inst(k, false, PtrNull::Maybe)));
        let bx = kit.lock(p, &[]);
        kit.unlock(p, bx);
        kit.return_value(None);
        assert!(!ConnectionGraph::has_candidates(&c));
    }

    #[test]
    fn returned_allocation_escapes() {
        let _ = env_logger::try_init();
        let (mut c, k) = compile();
        let mut kit = GraphKit::new(&mut c);
        let obj = kit.new_instance(k);
        kit.return_value(Some(obj));
        assert!(ConnectionGraph::has_candidates(&c));
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        // Nothing stays local, so no graph is kept.
        assert!(c.congraph().is_none());
        assert_eq!(c.escape_state(obj), None);
    }

    #[test]
    fn local_allocation_is_kept_with_graph() {
        let _ = env_logger::try_init();
        let (mut c, k) = compile();
        let mut kit = GraphKit::new(&mut c);
        let obj = kit.new_instance(k);
        let three = kit.c.graph.intcon(3);
        kit.store_field(obj, "x", three);
        let sfpt = kit.safepoint(&[obj]);
        kit.return_value(None);
        let alloc = c.graph.ideal_allocation(obj).unwrap();
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        let cg = c.congraph().expect("graph kept");
        assert_eq!(cg.escape_state(alloc), Some(EscapeState::NoEscape));
        assert!(cg.not_global_escape(obj));
        assert!(!cg.hidden_alias(obj));
        assert!(cg.hidden_alias(c.graph.top()));
        assert!(c.is_scalar_replaceable(alloc));
        assert!(c.has_ea_local_in_scope(sfpt));
        let NodeInfo::Call(ci) = c.graph.info(sfpt) else {
            unreachable!()
        };
        assert!(ci.ea_local_in_scope);
    }
}
