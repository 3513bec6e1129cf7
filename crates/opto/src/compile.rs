//! The compilation context.
//!
//! A [`Compile`] owns everything one method's optimization needs: the node graph, the class and
//! alias tables, the settings and the active barrier policy. Passes receive it explicitly.

use crate::barrier::{BarrierSet, BarrierState};
use crate::escape::{ConnectionGraph, EscapeState};
use crate::ir::{
    AliasIdx, AliasTable, Graph, KlassTable, Node, NodeInfo, Offset, Opcode, PtrNull, TypePtr,
    slot,
};
use crate::macro_expand;
use crate::result::{OptoError, OptoResult, RetryReason};
use crate::settings::Flags;
use crate::timing::{self, Pass};
use crate::trace;

/// Per-method compilation state.
pub struct Compile {
    /// The method's IR.
    pub graph: Graph,
    /// Every class the method refers to.
    pub klasses: KlassTable,
    /// Memory slices.
    pub alias: AliasTable,
    flags: Flags,
    barrier_set: BarrierSet,
    pub(crate) barrier_state: BarrierState,
    congraph: Option<ConnectionGraph>,
    failure: Option<RetryReason>,
    recent_alloc: Option<(Node, Node)>,
}

impl Compile {
    /// A context for an empty method.
    pub fn new(flags: Flags, klasses: KlassTable) -> Self {
        let mut graph = Graph::new();
        // The null constant is shared by every pass; create it up front so analyses that give
        // up leave the node count untouched.
        graph.null();
        let barrier_set = BarrierSet::new(&flags);
        let barrier_state = barrier_set.c2().create_barrier_state();
        Self {
            graph,
            klasses,
            alias: AliasTable::new(),
            flags,
            barrier_set,
            barrier_state,
            congraph: None,
            failure: None,
            recent_alloc: None,
        }
    }

    /// Optimizer settings.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// The barrier policy of the active collector.
    pub fn barrier_set(&self) -> BarrierSet {
        self.barrier_set
    }

    /// Barrier nodes waiting for expansion.
    pub fn barrier_state(&self) -> &BarrierState {
        &self.barrier_state
    }

    /// The alias class of `tp`, created on first use.
    pub fn alias_index(&mut self, tp: &TypePtr) -> AliasIdx {
        self.alias.index_of(tp, &self.klasses)
    }

    /// The address type of a memory node: the slice it reads or writes.
    ///
    /// `None` for nodes that touch all of memory.
    pub fn adr_type(&self, n: Node) -> Option<TypePtr> {
        let g = &self.graph;
        let op = g.op(n);
        if op.is_mem() || op == Opcode::ClearArray {
            let adr = g.input(n, slot::mem::ADDRESS)?;
            return g.ty(adr).isa_ptr().cloned();
        }
        match (op, g.info(n)) {
            (Opcode::Phi, NodeInfo::Phi(p)) => p.adr_type.clone(),
            (_, NodeInfo::MemBar(m)) => m.adr_type.clone(),
            (Opcode::SCMemProj, _) => g.input(n, 0).and_then(|a| self.adr_type(a)),
            (Opcode::WriteBarrier | Opcode::EnqueueBarrier, _) => {
                Some(TypePtr::raw(PtrNull::Maybe, Offset::Bot))
            }
            _ => None,
        }
    }

    /// The alias class of a memory node, [`AliasIdx::BOT`] when it touches all of memory.
    pub fn mem_alias_index(&mut self, n: Node) -> AliasIdx {
        match self.adr_type(n) {
            Some(tp) => self.alias_index(&tp),
            None => AliasIdx::BOT,
        }
    }

    /// Record a failure that forces the compilation to be retried. The first failure wins.
    pub fn record_failure(&mut self, reason: RetryReason) {
        trace!("compilation failure: {}", reason);
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }

    /// The recorded failure, if any.
    pub fn failing(&self) -> Option<RetryReason> {
        self.failure
    }

    /// Turn a recorded failure into an error.
    pub fn check_failing(&self) -> OptoResult<()> {
        match self.failure {
            Some(reason) => Err(OptoError::Retry(reason)),
            None => Ok(()),
        }
    }

    /// Fail if adding `extra` nodes would run past the live node ceiling.
    pub fn check_node_count(&self, extra: usize) -> OptoResult<()> {
        let limit = self.flags.max_node_limit() as usize;
        let headroom = self.flags.node_limit_fudge_factor() as usize;
        if self.graph.live_nodes() + extra > limit.saturating_sub(headroom) {
            trace!(
                "node limit: {} live + {} > {} - {}",
                self.graph.live_nodes(),
                extra,
                limit,
                headroom
            );
            return Err(OptoError::NodeLimit);
        }
        Ok(())
    }

    /// The most recent allocation, as `(control after it, new object)`.
    pub fn recent_alloc(&self) -> Option<(Node, Node)> {
        self.recent_alloc
    }

    /// Remember the allocation that produced `obj` at control `ctl`.
    pub fn set_recent_alloc(&mut self, ctl: Node, obj: Node) {
        self.recent_alloc = Some((ctl, obj));
    }

    /// The connection graph of the last successful escape analysis.
    pub fn congraph(&self) -> Option<&ConnectionGraph> {
        self.congraph.as_ref()
    }

    pub(crate) fn set_congraph(&mut self, cg: Option<ConnectionGraph>) {
        self.congraph = cg;
    }

    /// Escape state of the object(s) `n` may refer to; `None` when not analyzed.
    pub fn escape_state(&self, n: Node) -> Option<EscapeState> {
        self.congraph.as_ref().and_then(|cg| cg.escape_state(n))
    }

    /// Was the allocation `n` found scalar replaceable?
    pub fn is_scalar_replaceable(&self, n: Node) -> bool {
        match self.graph.info(n) {
            NodeInfo::Alloc(a) => a.is_scalar_replaceable,
            _ => false,
        }
    }

    /// May `n` refer to an object other code can also reach?
    ///
    /// Conservatively true without analysis results.
    pub fn hidden_alias(&self, n: Node) -> bool {
        match &self.congraph {
            Some(cg) => cg.hidden_alias(n),
            None => true,
        }
    }

    /// Is every object `n` may refer to confined to this method and its callees?
    pub fn not_global_escape(&self, n: Node) -> bool {
        self.congraph
            .as_ref()
            .is_some_and(|cg| cg.not_global_escape(n))
    }

    /// Does call `n` receive an argument that only escapes into it?
    pub fn has_arg_escape(&self, n: Node) -> bool {
        self.congraph
            .as_ref()
            .is_some_and(|cg| cg.has_arg_escape(self, n))
    }

    /// Does safepoint `n` reference a non-escaping or arg-escaping object in its debug info?
    pub fn has_ea_local_in_scope(&self, n: Node) -> bool {
        self.congraph
            .as_ref()
            .is_some_and(|cg| cg.has_ea_local_in_scope(self, n))
    }

    /// Run escape analysis and macro elimination until no more progress is made, then expand
    /// the remaining macro nodes and the collector's barriers.
    ///
    /// On error the graph may be partly rewritten and has to be discarded; the retry reason
    /// tells the driver which optimization to disable.
    pub fn optimize(&mut self) -> OptoResult<()> {
        let _tt = timing::start(Pass::Optimize);
        self.check_node_count(0)?;
        if self.flags.do_escape_analysis() {
            let mut invocation = 0;
            while ConnectionGraph::has_candidates(self) {
                let macro_count = self.graph.macro_nodes().len();
                ConnectionGraph::do_analysis(self, invocation)?;
                self.check_failing()?;
                if self.congraph.is_some() && !self.graph.macro_nodes().is_empty() {
                    macro_expand::eliminate_macro_nodes(self)?;
                }
                invocation += 1;
                let progress = self.flags.iterative_escape_analysis()
                    && self.graph.macro_nodes().len() < macro_count;
                if !progress {
                    break;
                }
            }
        }
        macro_expand::expand_macro_nodes(self)?;
        self.check_failing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::builder;

    #[test]
    fn sticky_failure() {
        let mut c = Compile::new(Flags::new(builder()), KlassTable::new(true));
        assert!(c.check_failing().is_ok());
        c.record_failure(RetryReason::NoReduceAllocationMerges);
        c.record_failure(RetryReason::NoEscapeAnalysis);
        assert_eq!(c.failing(), Some(RetryReason::NoReduceAllocationMerges));
        assert_eq!(
            c.check_failing(),
            Err(OptoError::Retry(RetryReason::NoReduceAllocationMerges))
        );
    }

    #[test]
    fn node_limit() {
        let mut b = builder();
        b.set("max_node_limit", "40").unwrap();
        b.set("node_limit_fudge_factor", "10").unwrap();
        let c = Compile::new(Flags::new(b), KlassTable::new(true));
        assert!(c.check_node_count(0).is_ok());
        assert_eq!(c.check_node_count(30), Err(OptoError::NodeLimit));
    }

    #[test]
    fn queries_without_analysis() {
        let c = Compile::new(Flags::new(builder()), KlassTable::new(true));
        let n = c.graph.top();
        assert_eq!(c.escape_state(n), None);
        assert!(c.hidden_alias(n));
        assert!(!c.not_global_escape(n));
        assert!(!c.is_scalar_replaceable(n));
    }
}
