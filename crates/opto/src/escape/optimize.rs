//! Graph simplifications that only need escape states: no memory is split here.

use super::{ConnectionGraph, EscapeState, PtIdx};
use crate::compile::Compile;
use crate::ir::{MemBarInfo, Node, NodeInfo, Opcode, Type, slot};
use crate::trace;

/// Outcome of comparing two pointers using their points-to sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PtrCmp {
    Eq,
    Ne,
    Unknown,
}

impl ConnectionGraph {
    /// Mark locks on objects no other thread can see as eliminated, fold pointer compares,
    /// relax StoreStore barriers after local allocations and flag boxing calls whose result
    /// stays local.
    pub(super) fn optimize_ideal_graph(&mut self, c: &mut Compile, ptr_cmp: &[Node], storestore: &[Node]) {
        let macro_nodes = c.graph.macro_nodes().to_vec();
        for n in macro_nodes {
            match c.graph.op(n) {
                Opcode::Lock | Opcode::Unlock if c.flags().eliminate_locks() => {
                    self.mark_lock_eliminated(c, n);
                }
                Opcode::CallStaticJava if c.flags().eliminate_autobox() => {
                    self.mark_boxing_eliminated(c, n);
                }
                _ => {}
            }
        }

        for &cmp in ptr_cmp {
            if c.graph.is_dead(cmp) {
                continue;
            }
            let (Some(left), Some(right)) = (c.graph.input(cmp, 1), c.graph.input(cmp, 2)) else {
                continue;
            };
            let folded = match self.optimize_ptr_compare(c, left, right) {
                PtrCmp::Eq => c.graph.intcon(0),
                PtrCmp::Ne => c.graph.intcon(1),
                PtrCmp::Unknown => continue,
            };
            trace!("pointer compare {} folded to {}", cmp, folded);
            c.graph.replace_node(cmp, folded);
        }

        for &mb in storestore {
            if c.graph.is_dead(mb) {
                continue;
            }
            let g = &c.graph;
            let alloc = g
                .input(mb, slot::membar::PRECEDENT)
                .and_then(|p| g.input(p, 0))
                .filter(|&a| g.op(a).is_allocate());
            let Some(alloc) = alloc else {
                continue;
            };
            if !self.not_global_escape(alloc) {
                continue;
            }
            let ctrl = g.input(mb, slot::CONTROL);
            let mem = g.input(mb, slot::MEMORY);
            let cpu = c.graph.add(
                Opcode::MemBarCPUOrder,
                &[ctrl, None, mem],
                Type::Tuple,
                NodeInfo::MemBar(MemBarInfo::default()),
            );
            trace!("StoreStore barrier {} after local {} relaxed to {}", mb, alloc, cpu);
            c.graph.replace_node(mb, cpu);
        }
    }

    fn mark_lock_eliminated(&self, c: &mut Compile, lock: Node) {
        let g = &c.graph;
        let Some(obj) = g.input(lock, slot::lock::OBJECT) else {
            return;
        };
        let already = matches!(g.info(lock), NodeInfo::Lock(l) if l.eliminated);
        if already || !self.not_global_escape(obj) {
            return;
        }
        let alloc = self
            .unique_java_object(obj)
            .map(|p| self.nodes[p].node)
            .filter(|&a| g.op(a).is_allocate());
        trace!("{:?} {} on local {} marked eliminated", g.op(lock), lock, obj);
        if let NodeInfo::Lock(l) = c.graph.info_mut(lock) {
            l.eliminated = true;
        }
        if let Some(alloc) = alloc {
            if let NodeInfo::Alloc(a) = c.graph.info_mut(alloc) {
                a.has_eliminated_locks = true;
            }
        }
    }

    fn mark_boxing_eliminated(&self, c: &mut Compile, call: Node) {
        let boxing = matches!(c.graph.info(call), NodeInfo::Call(ci) if ci.boxing);
        if !boxing || self.escape_state(call) != Some(EscapeState::NoEscape) {
            return;
        }
        trace!("boxing call {} does not escape", call);
        if let NodeInfo::Call(ci) = c.graph.info_mut(call) {
            ci.eliminated_boxing = true;
        }
    }

    /// Does `p` (or, for a local or field, something it points to) include `jobj`?
    fn points_to(&self, p: PtIdx, jobj: PtIdx) -> bool {
        if self.nodes[p].is_java_object() {
            p == jobj
        } else {
            self.nodes[p].edges.contains(&jobj)
        }
    }

    /// The objects `p` may refer to.
    fn pointees(&self, p: PtIdx) -> Vec<PtIdx> {
        if self.nodes[p].is_java_object() {
            vec![p]
        } else {
            self.nodes[p]
                .edges
                .iter()
                .copied()
                .filter(|&e| self.nodes[e].is_java_object())
                .collect()
        }
    }

    /// Is `jobj` an allocation (or boxing call) that does not escape?
    fn is_local_allocation(&self, c: &Compile, jobj: PtIdx) -> bool {
        let n = self.nodes[jobj].node;
        self.nodes[jobj].es == EscapeState::NoEscape
            && (c.graph.op(n).is_allocate() || c.graph.op(n) == Opcode::CallStaticJava)
    }

    /// Does `p` only refer to local allocations?
    fn non_escaping_allocation(&self, c: &Compile, p: PtIdx) -> bool {
        let objs = self.pointees(p);
        !objs.is_empty() && objs.iter().all(|&o| self.is_local_allocation(c, o))
    }

    fn optimize_ptr_compare(&self, c: &Compile, left: Node, right: Node) -> PtrCmp {
        let (Some(p1), Some(p2)) = (self.ptnode(left), self.ptnode(right)) else {
            return PtrCmp::Unknown;
        };
        let jobj1 = self.unique_java_object(left);
        let jobj2 = self.unique_java_object(right);

        if let Some(j1) = jobj1.filter(|&j| self.nodes[j].es == EscapeState::NoEscape) {
            if jobj2 == Some(j1) {
                return PtrCmp::Eq;
            }
            if self.is_local_allocation(c, j1) && !self.points_to(p2, j1) {
                return PtrCmp::Ne;
            }
        }
        if let Some(j2) = jobj2.filter(|&j| self.nodes[j].es == EscapeState::NoEscape) {
            if self.is_local_allocation(c, j2) && !self.points_to(p1, j2) {
                return PtrCmp::Ne;
            }
        }

        let set1 = self.pointees(p1);
        let set2 = self.pointees(p2);
        if set1.iter().any(|o| set2.contains(o)) {
            return PtrCmp::Unknown;
        }
        // Disjoint, but an unknown object may still be null.
        let unknown1 = set1.contains(&self.phantom);
        let unknown2 = set2.contains(&self.phantom);
        let null1 = set1.contains(&self.null_obj);
        let null2 = set2.contains(&self.null_obj);
        if (unknown1 && null2) || (unknown2 && null1) {
            return PtrCmp::Unknown;
        }
        // Alias information is incomplete for escaped objects.
        if !unknown1 && !null1 && self.non_escaping_allocation(c, p1) {
            return PtrCmp::Ne;
        }
        if !unknown2 && !null2 && self.non_escaping_allocation(c, p2) {
            return PtrCmp::Ne;
        }
        PtrCmp::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::super::ConnectionGraph;
    use crate::compile::Compile;
    use crate::ir::{BasicType, BoolTest, Klass, KlassFlags, KlassTable, NodeInfo, Opcode, PtrNull, Type, TypePtr};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, builder};

    fn point() -> (Compile, Klass) {
        let _ = env_logger::try_init();
        let mut kt = KlassTable::new(true);
        let k = kt.define_instance("Point", None, &[("x", BasicType::Int)], KlassFlags::empty());
        (Compile::new(Flags::new(builder()), kt), k)
    }

    #[test]
    fn compare_of_two_local_objects_folds() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let a = kit.new_instance(k);
        let b = kit.new_instance(k);
        let cmp = kit.cmp_p(a, b);
        let bol = kit.bool(cmp, BoolTest::Eq);
        let (t, _) = kit.make_if(bol, 0.5);
        kit.set_control(t);
        kit.return_value(None);
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.graph.is_dead(cmp));
        let folded = c.graph.input(bol, 1).unwrap();
        assert_eq!(c.graph.find_int_con(folded), Some(1));
    }

    #[test]
    fn compare_with_parameter_folds_to_not_equal() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let p = kit.parameter(0, Type::Ptr(TypePtr::inst(k, false, PtrNull::Maybe)));
        let a = kit.new_instance(k);
        let cmp = kit.cmp_p(a, p);
        kit.bool(cmp, BoolTest::Ne);
        kit.return_value(None);
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.graph.is_dead(cmp));
    }

    #[test]
    fn compare_with_escaping_object_is_kept() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let a = kit.new_instance(k);
        let b = kit.new_instance(k);
        kit.call_static("sink", &[a], None, None, &[]);
        kit.call_static("sink", &[b], None, None, &[]);
        let cmp = kit.cmp_p(a, b);
        kit.bool(cmp, BoolTest::Eq);
        kit.return_value(None);
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(!c.graph.is_dead(cmp));
    }

    #[test]
    fn lock_on_local_object_is_marked() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let a = kit.new_instance(k);
        let bx = kit.lock(a, &[]);
        let unlock = kit.unlock(a, bx);
        kit.return_value(None);
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(matches!(c.graph.info(unlock), NodeInfo::Lock(l) if l.eliminated));
        let lock = c
            .graph
            .macro_nodes()
            .iter()
            .copied()
            .find(|&n| c.graph.op(n) == Opcode::Lock)
            .unwrap();
        assert!(matches!(c.graph.info(lock), NodeInfo::Lock(l) if l.eliminated));
    }

    #[test]
    fn storestore_after_local_allocation_is_relaxed() {
        let (mut c, k) = point();
        let mut kit = GraphKit::new(&mut c);
        let a = kit.new_instance(k);
        let (alloc, rawoop) = {
            let g = &kit.c.graph;
            let alloc = g.ideal_allocation(a).unwrap();
            (alloc, g.input(a, 1).unwrap())
        };
        let mb = kit.insert_mem_bar(Opcode::MemBarStoreStore, Some(rawoop));
        kit.safepoint(&[a]);
        kit.return_value(None);
        ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        assert!(c.not_global_escape(alloc));
        assert!(c.graph.is_dead(mb));
        let relaxed = c
            .graph
            .live_node_iter()
            .filter(|&n| c.graph.op(n) == Opcode::MemBarCPUOrder)
            .count();
        assert_eq!(relaxed, 1);
    }
}
