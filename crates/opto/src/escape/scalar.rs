//! Which non-escaping objects can be replaced by their fields.

use super::{ConnectionGraph, PtIdx};
use crate::compile::Compile;
use crate::ir::{Node, Offset, Opcode, slot};

impl ConnectionGraph {
    fn not_scalar_replaceable(&self, p: PtIdx) -> bool {
        !self.nodes[p].scalar_replaceable()
    }

    /// Rule out scalar replacement of the non-escaping object `jobj` if it is stored where
    /// the analysis loses track of it, merged with other objects, or accessed in ways its
    /// fields cannot describe.
    ///
    /// Merges that can be untangled are recorded in `reducible_merges` instead.
    pub(super) fn adjust_scalar_replaceable_state(
        &mut self,
        c: &mut Compile,
        jobj: PtIdx,
        reducible_merges: &mut Vec<Node>,
    ) {
        let mut candidates: Vec<Node> = Vec::new();

        let uses: Vec<PtIdx> = self.nodes[jobj].uses.iter().map(|u| u.node()).collect();
        for u in uses {
            if self.nodes[u].is_arraycopy() {
                continue;
            }
            if self.nodes[u].is_field() {
                // Stored into an unknown array element.
                if self.nodes[u].offset == Offset::Bot {
                    self.set_not_scalar_replaceable(jobj, "is stored at unknown offset");
                    return;
                }
                let bases = self.nodes[u].bases.clone();
                for base in bases {
                    if base == self.null_obj {
                        if self.nodes[u].base_count() > 1 {
                            self.set_not_scalar_replaceable(jobj, "is stored into field with potentially null base");
                            return;
                        }
                        continue;
                    }
                    if self.not_scalar_replaceable(base) {
                        self.set_not_scalar_replaceable(jobj, "is stored into field with NSR base");
                        return;
                    }
                }
            }
            debug_assert!(self.nodes[u].is_field() || self.nodes[u].is_local_var());
            // Merged with other objects.
            let others: Vec<PtIdx> = self.nodes[u]
                .edges
                .iter()
                .copied()
                .filter(|&e| e != jobj && self.nodes[e].is_java_object())
                .collect();
            for other in others {
                let g = &c.graph;
                let mut use_n = self.nodes[u].node;
                if g.op(use_n).is_constraint_cast() {
                    use_n = g.input(use_n, 1).unwrap_or(use_n);
                }
                if candidates.contains(&use_n) || reducible_merges.contains(&use_n) {
                    continue;
                }
                if g.op(use_n) == Opcode::Phi && self.can_reduce_phi(c, use_n) {
                    candidates.push(use_n);
                } else {
                    self.set_not_scalar_replaceable(jobj, "is merged with another object");
                    self.set_not_scalar_replaceable(other, "is merged with another object");
                }
            }
            if self.not_scalar_replaceable(jobj) {
                return;
            }
        }

        let g = &c.graph;
        let fields: Vec<PtIdx> = self.nodes[jobj]
            .edges
            .iter()
            .copied()
            .filter(|&f| !self.nodes[f].is_arraycopy())
            .collect();
        for field in fields {
            debug_assert!(self.nodes[field].is_field());
            // An array element accessed with a variable index.
            if self.nodes[field].offset == Offset::Bot {
                self.set_not_scalar_replaceable(jobj, "has field with unknown offset");
                return;
            }
            let n = self.nodes[field].node;
            let base_is_top = g.input(n, slot::addp::BASE).is_none_or(|b| g.is_top(b));
            let raw_cast = g
                .input(n, slot::addp::ADDRESS)
                .is_some_and(|a| g.op(a) == Opcode::CheckCastPP);
            if base_is_top && raw_cast {
                self.set_not_scalar_replaceable(jobj, "is used as base of mixed unsafe access");
                return;
            }
            // The value of a field is unknown after an atomic update.
            let unknown_access = g.outs(n).iter().any(|&u| {
                g.op(u).is_load_store()
                    || (g.op(u).is_mem()
                        && matches!(g.info(u), crate::ir::NodeInfo::Mem(m) if m.mismatched))
            });
            if unknown_access {
                self.set_not_scalar_replaceable(jobj, "is used in LoadStore or mismatched access");
                return;
            }
            // Flow insensitivity: the address may point to more than one object, and the
            // stores on different paths cannot be told apart.
            if self.nodes[field].base_count() > 1
                && candidates.is_empty()
                && self.has_non_reducible_merge(c, field, reducible_merges)
            {
                let bases = self.nodes[field].bases.clone();
                for base in bases {
                    if base != jobj && self.nodes[base].is_java_object() {
                        self.set_not_scalar_replaceable(jobj, "may point to more than one object");
                        self.set_not_scalar_replaceable(base, "may point to more than one object");
                    }
                }
                if self.not_scalar_replaceable(jobj) {
                    return;
                }
            }
        }

        // Only merges of objects that are still scalar replaceable are worth reducing.
        for cand in candidates {
            if !reducible_merges.contains(&cand) {
                reducible_merges.push(cand);
            }
        }
    }

    fn has_non_reducible_merge(&self, c: &Compile, field: PtIdx, reducible_merges: &[Node]) -> bool {
        self.nodes[field].bases.iter().any(|&b| {
            let n = self.nodes[b].node;
            c.graph.op(n) == Opcode::Phi && !reducible_merges.contains(&n)
        })
    }

    /// Propagate non-replaceability: an object stored into a field of an object that cannot
    /// be replaced cannot be replaced either.
    pub(super) fn find_scalar_replaceable_allocs(&mut self, jobj_worklist: &mut Vec<PtIdx>) {
        let mut found_nsr = true;
        while found_nsr {
            found_nsr = false;
            for k in 0..jobj_worklist.len() {
                let jobj = jobj_worklist[k];
                if self.not_scalar_replaceable(jobj) {
                    continue;
                }
                let fields: Vec<PtIdx> = self.nodes[jobj]
                    .uses
                    .iter()
                    .map(|u| u.node())
                    .filter(|&u| self.nodes[u].is_field())
                    .collect();
                for field in fields {
                    let nsr_base = self.nodes[field]
                        .bases
                        .iter()
                        .any(|&b| b != self.null_obj && self.not_scalar_replaceable(b));
                    if nsr_base {
                        self.set_not_scalar_replaceable(jobj, "is stored into field with NSR base");
                        found_nsr = true;
                        break;
                    }
                }
            }
        }
        jobj_worklist.retain(|&p| self.nodes[p].scalar_replaceable());
    }
}

#[cfg(test)]
mod tests {
    use super::super::EscapeState;
    use crate::compile::Compile;
    use crate::ir::{BasicType, KlassFlags, KlassTable, Node, slot};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, builder};

    fn analyze(build: impl FnOnce(&mut GraphKit, crate::ir::Klass) -> Vec<Node>) -> (Compile, Vec<Node>) {
        let _ = env_logger::try_init();
        let mut kt = KlassTable::new(true);
        let holder = kt.define_instance(
            "Holder",
            None,
            &[("f", BasicType::Object), ("i", BasicType::Int)],
            KlassFlags::empty(),
        );
        let mut c = Compile::new(Flags::new(builder()), kt);
        let mut kit = GraphKit::new(&mut c);
        let objs = build(&mut kit, holder);
        kit.return_value(None);
        super::ConnectionGraph::do_analysis(&mut c, 0).unwrap();
        (c, objs)
    }

    #[test]
    fn stored_into_escaping_object() {
        let (c, objs) = analyze(|kit, holder| {
            let outer = kit.new_instance(holder);
            let inner = kit.new_instance(holder);
            kit.store_field(outer, "f", inner);
            kit.call_static("sink", &[outer], None, None, &[]);
            vec![outer, inner]
        });
        assert!(c.congraph().is_none());
        let g = &c.graph;
        for o in objs {
            let alloc = g.ideal_allocation(o).unwrap();
            assert!(!c.is_scalar_replaceable(alloc));
        }
    }

    #[test]
    fn nested_local_objects() {
        let (c, objs) = analyze(|kit, holder| {
            let inner = kit.new_instance(holder);
            let outer = kit.new_instance(holder);
            kit.store_field(outer, "f", inner);
            let one = kit.c.graph.intcon(1);
            kit.store_field(outer, "i", one);
            kit.safepoint(&[outer]);
            vec![outer, inner]
        });
        let g = &c.graph;
        let outer = g.ideal_allocation(objs[0]).unwrap();
        let inner = g.ideal_allocation(objs[1]).unwrap();
        let init = g.initialization(outer).unwrap();
        assert_eq!(g.req(init) - slot::init::RAW_STORES, 2, "both stores captured");
        assert_eq!(c.escape_state(outer), Some(EscapeState::NoEscape));
        assert_eq!(c.escape_state(inner), Some(EscapeState::NoEscape));
        assert!(c.is_scalar_replaceable(outer));
        // The initialization stored `inner`: the field never holds null.
        assert!(c.is_scalar_replaceable(inner));
    }

    #[test]
    fn store_after_later_allocation_keeps_null() {
        let (c, objs) = analyze(|kit, holder| {
            let outer = kit.new_instance(holder);
            let inner = kit.new_instance(holder);
            kit.store_field(outer, "f", inner);
            kit.safepoint(&[outer]);
            vec![outer, inner]
        });
        let g = &c.graph;
        let outer = g.ideal_allocation(objs[0]).unwrap();
        let inner = g.ideal_allocation(objs[1]).unwrap();
        assert!(c.is_scalar_replaceable(outer));
        // The field holds either the initial null or `inner`.
        assert!(!c.is_scalar_replaceable(inner));
    }
}
