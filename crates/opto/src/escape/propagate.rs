//! Propagation of escape states and points-to sets to a fixed point.

use super::{ConnectionGraph, EscapeState, PtFlags, PtIdx, PtUse};
use crate::compile::Compile;
use crate::ir::Offset;
use crate::result::OptoResult;
use crate::trace;

impl ConnectionGraph {
    /// Complete the graph: every local and field learns which objects it may point to, and
    /// escape states flow along the edges.
    ///
    /// Returns `Ok(false)` if every candidate object escapes, and a retry error if the graph
    /// does not converge within the iteration or time budget. The IR is not touched either way.
    pub(super) fn complete_connection_graph(
        &mut self,
        c: &mut Compile,
        ptnodes: &[PtIdx],
        non_escaped: &mut Vec<PtIdx>,
        java_objects: &[PtIdx],
        oop_fields: &[PtIdx],
    ) -> OptoResult<bool> {
        if !self.find_non_escaped_objects(ptnodes, non_escaped) {
            return Ok(false);
        }
        let limit = c.flags().escape_analysis_max_iterations();
        let mut iterations = 0;
        let mut new_edges = 1;
        let mut timeout = false;
        loop {
            while new_edges > 0 && {
                iterations += 1;
                iterations <= limit
            } {
                new_edges = 0;
                // Fields found to hold unknown values point to the phantom object.
                new_edges += self.add_java_object_edges(self.phantom, false);
                for &jobj in java_objects {
                    new_edges += self.add_java_object_edges(jobj, true);
                }
                if new_edges > 0 && !self.find_non_escaped_objects(ptnodes, non_escaped) {
                    return Ok(false);
                }
                if self.timed_out(c) {
                    timeout = true;
                    break;
                }
            }
            if iterations > limit || timeout {
                break;
            }
            // Fields nothing was stored into may hold anything.
            for &field in oop_fields {
                if self.nodes[field].edges.is_empty() {
                    new_edges += self.find_field_value(field);
                }
            }
            if self.timed_out(c) {
                timeout = true;
                break;
            }
            if new_edges == 0 {
                break;
            }
        }
        if timeout {
            return Err(self.bailout(c, "connection graph build timed out"));
        }
        if iterations > limit {
            return Err(self.bailout(c, "connection graph build did not converge"));
        }
        trace!("escape analysis: graph complete after {} iterations", iterations);

        // Fields of fresh objects start out null.
        for &p in non_escaped.iter() {
            if self.nodes[p].es == EscapeState::NoEscape && self.find_init_values_null(c, p) > 0 {
                self.add_java_object_edges(self.null_obj, false);
            }
        }
        Ok(true)
    }

    /// Push escape states along the edges. Drops escaped objects from `non_escaped` and
    /// returns whether any remain.
    pub(super) fn find_non_escaped_objects(&mut self, ptnodes: &[PtIdx], non_escaped: &mut Vec<PtIdx>) -> bool {
        let mut escape_worklist: Vec<PtIdx> = ptnodes
            .iter()
            .copied()
            .filter(|&p| {
                self.nodes[p].es >= EscapeState::ArgEscape
                    || self.nodes[p].fields_es >= EscapeState::ArgEscape
            })
            .collect();
        while let Some(p) = escape_worklist.pop() {
            let es = self.nodes[p].es;
            let field_es = self.nodes[p].fields_es;
            if self.nodes[p].is_field() && self.nodes[p].is_oop() && es >= EscapeState::ArgEscape {
                // An escaped field may hold anything.
                if self.add_edge(p, self.phantom) {
                    self.add_field_uses_to_worklist(p);
                }
            }
            for k in 0..self.nodes[p].edges.len() {
                let e = self.nodes[p].edges[k];
                if self.nodes[e].is_arraycopy() {
                    debug_assert!(self.nodes[p].arraycopy_dst());
                    // Only the fields escape through a copy.
                    if self.nodes[e].fields_es < field_es {
                        self.set_fields_escape_state(e, field_es, "copied into escaping object");
                        escape_worklist.push(e);
                    }
                } else if es >= field_es {
                    if self.nodes[e].es < es {
                        self.set_escape_state(e, es, "referenced by escaping node");
                        escape_worklist.push(e);
                    }
                } else {
                    let mut changed = false;
                    if self.nodes[e].fields_es < field_es {
                        self.set_fields_escape_state(e, field_es, "fields of escaping node");
                        changed = true;
                    }
                    if self.nodes[e].es < field_es
                        && self.nodes[e].is_field()
                        && self.nodes[p].is_java_object()
                        && self.nodes[e].is_oop()
                    {
                        self.set_escape_state(e, field_es, "field of object whose fields escape");
                        changed = true;
                    } else if self.nodes[e].es < es {
                        self.set_escape_state(e, es, "referenced by escaping node");
                        changed = true;
                    }
                    if changed {
                        escape_worklist.push(e);
                    }
                }
            }
        }
        non_escaped.retain(|&p| self.nodes[p].es < EscapeState::GlobalEscape);
        for k in 0..non_escaped.len() {
            let p = non_escaped[k];
            if self.nodes[p].es == EscapeState::NoEscape {
                self.find_init_values_phantom(p);
            }
        }
        !non_escaped.is_empty()
    }

    fn add_to_worklist(&mut self, u: PtUse) {
        if self.in_worklist.insert(u) {
            self.worklist.push(u);
        }
    }

    fn add_uses_to_worklist(&mut self, p: PtIdx) {
        for k in 0..self.nodes[p].uses.len() {
            let u = self.nodes[p].uses[k];
            self.add_to_worklist(u);
        }
    }

    /// Queue the loads of `field` and the fields that may alias it.
    pub(super) fn add_field_uses_to_worklist(&mut self, field: PtIdx) {
        debug_assert!(self.nodes[field].is_oop());
        self.add_uses_to_worklist(field);
        let bases = self.nodes[field].bases.clone();
        for base in bases {
            self.add_fields_to_worklist(field, base);
            // Values stored into a copy source are visible through the destinations.
            if self.nodes[base].arraycopy_src() {
                let copies: Vec<PtIdx> = self.nodes[base]
                    .uses
                    .iter()
                    .map(|u| u.node())
                    .filter(|&u| self.nodes[u].is_arraycopy())
                    .collect();
                for ac in copies {
                    let dsts: Vec<PtIdx> = self.nodes[ac]
                        .uses
                        .iter()
                        .map(|u| u.node())
                        .filter(|&d| d != base && self.nodes[d].arraycopy_dst())
                        .collect();
                    for d in dsts {
                        self.add_fields_to_worklist(field, d);
                    }
                }
            }
        }
    }

    /// Queue the oop fields of `base` that may overlap `field`.
    fn add_fields_to_worklist(&mut self, field: PtIdx, base: PtIdx) {
        let offset = self.nodes[field].offset;
        let overlaps = |offs: Offset| offs == offset || offset == Offset::Bot || offs == Offset::Bot;
        let mut found = Vec::new();
        if self.nodes[base].is_local_var() {
            for u in &self.nodes[base].uses {
                if let PtUse::Base(f) = *u {
                    if f != field && self.nodes[f].is_oop() && overlaps(self.nodes[f].offset) {
                        found.push(f);
                    }
                }
            }
        } else if base != self.phantom && base != self.null_obj {
            for &f in &self.nodes[base].edges {
                if self.nodes[f].is_arraycopy() {
                    continue;
                }
                if f != field && self.nodes[f].is_oop() && overlaps(self.nodes[f].offset) {
                    found.push(f);
                }
            }
        }
        for f in found {
            self.add_to_worklist(PtUse::Edge(f));
        }
    }

    /// Make everything queued point to `jobj`. With `populate`, first queue the nodes that
    /// reach `jobj` through one more step. Returns the number of new edges.
    pub(super) fn add_java_object_edges(&mut self, jobj: PtIdx, populate: bool) -> u32 {
        let mut new_edges = 0;
        if populate {
            for k in 0..self.nodes[jobj].uses.len() {
                let u = self.nodes[jobj].uses[k].node();
                if self.nodes[u].is_arraycopy() {
                    continue;
                }
                self.add_uses_to_worklist(u);
                if self.nodes[u].is_field() && self.nodes[u].is_oop() {
                    self.add_field_uses_to_worklist(u);
                }
            }
        }
        let mut l = 0;
        while l < self.worklist.len() {
            let item = self.worklist[l];
            l += 1;
            let u = match item {
                PtUse::Base(field) => {
                    // The object is one more base of the field.
                    if self.add_base(field, jobj) {
                        new_edges += 1;
                    }
                    continue;
                }
                PtUse::Edge(u) => u,
            };
            debug_assert!(!self.nodes[u].is_java_object());
            if self.nodes[u].is_arraycopy() {
                if jobj != self.null_obj && self.add_edge(u, jobj) {
                    self.nodes[jobj].flags.insert(PtFlags::ARRAYCOPY_SRC);
                    new_edges += 1;
                }
                continue;
            }
            if !self.add_edge(u, jobj) {
                continue;
            }
            new_edges += 1;
            if self.nodes[u].is_local_var() {
                self.add_uses_to_worklist(u);
                if self.nodes[u].arraycopy_dst() && jobj != self.null_obj {
                    let copies: Vec<PtIdx> = self.nodes[u]
                        .edges
                        .iter()
                        .copied()
                        .filter(|&e| self.nodes[e].is_arraycopy())
                        .collect();
                    for ac in copies {
                        if self.add_edge(jobj, ac) {
                            new_edges += 1;
                            self.nodes[jobj].flags.insert(PtFlags::ARRAYCOPY_DST);
                        }
                    }
                }
            } else {
                self.add_field_uses_to_worklist(u);
            }
        }
        self.worklist.clear();
        self.in_worklist.clear();
        new_edges
    }

    /// A field no store reaches holds an unknown value, unless it belongs to an allocation
    /// whose initial values are filled in later.
    fn find_field_value(&mut self, field: PtIdx) -> u32 {
        if self.nodes[field].bases.iter().any(|&b| self.nodes[b].is_allocation()) {
            return 0;
        }
        if self.add_edge(field, self.phantom) {
            self.add_field_uses_to_worklist(field);
            return 1;
        }
        0
    }

    /// Oop fields of an object filled by a copy or returned by a call hold unknown values.
    fn find_init_values_phantom(&mut self, p: PtIdx) -> u32 {
        if self.nodes[p].is_allocation() && !self.nodes[p].arraycopy_dst() {
            return 0;
        }
        let mut new_edges = 0;
        for k in 0..self.nodes[p].edges.len() {
            let f = self.nodes[p].edges[k];
            if self.nodes[f].is_field() && self.nodes[f].is_oop() && self.add_edge(f, self.phantom) {
                new_edges += 1;
                self.add_field_uses_to_worklist(f);
            }
        }
        new_edges
    }

    /// Oop fields of a fresh allocation may still hold their initial null, unless the
    /// initialization captured a store to them.
    fn find_init_values_null(&mut self, c: &Compile, p: PtIdx) -> u32 {
        if !self.nodes[p].is_allocation() {
            return 0;
        }
        let init = c.graph.initialization(self.nodes[p].node);
        let mut new_edges = 0;
        let mut visited_bottom = false;
        let mut offsets: Vec<i32> = Vec::new();
        for k in 0..self.nodes[p].edges.len() {
            let f = self.nodes[p].edges[k];
            if !self.nodes[f].is_field() || !self.nodes[f].is_oop() {
                continue;
            }
            match self.nodes[f].offset {
                Offset::Known(off) => {
                    if c.graph.ty(self.nodes[f].node).isa_ptr().is_some_and(|t| t.is_raw()) {
                        continue;
                    }
                    if offsets.contains(&off) {
                        continue;
                    }
                    offsets.push(off);
                    if init.is_some_and(|i| c.graph.find_captured_store(i, off).is_some()) {
                        trace!("cg: field {} of {} set at initialization", off, self.nodes[p].node);
                        continue;
                    }
                }
                _ => {
                    // Any element of an array may be read.
                    if visited_bottom {
                        continue;
                    }
                }
            }
            if self.add_edge(f, self.null_obj) {
                new_edges += 1;
                self.add_field_uses_to_worklist(f);
                if self.nodes[f].offset == Offset::Bot {
                    visited_bottom = true;
                }
            }
        }
        new_edges
    }
}
