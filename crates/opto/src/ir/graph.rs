//! The node graph.
//!
//! Nodes are stored in an arena and never move; a removed node stays in the arena marked dead so
//! that side tables indexed by [`Node`] remain valid. Every input edge has a matching entry in the
//! input's `outs` list, kept up to date by the edge editing methods here.

use crate::entity::{EntitySet, PrimaryMap};
use crate::ir::entities::Node;
use crate::ir::node::{NodeData, NodeInfo, Opcode, slot};
use crate::ir::types::{BasicType, Offset, PtrNull, Type, TypePtr};
use crate::{FxHashMap, trace};
use core::fmt;
use smallvec::SmallVec;

/// A sea-of-nodes graph for one method.
pub struct Graph {
    nodes: PrimaryMap<Node, NodeData>,
    root: Node,
    top: Node,
    start: Node,
    int_cons: FxHashMap<i32, Node>,
    long_cons: FxHashMap<i64, Node>,
    ptr_cons: FxHashMap<TypePtr, Node>,
    worklist: Vec<Node>,
    in_worklist: EntitySet<Node>,
    macro_nodes: Vec<Node>,
    live: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create a graph holding the root, the top constant and a start node with its control, I/O,
    /// memory, frame pointer and return address projections.
    pub fn new() -> Self {
        let mut g = Self {
            nodes: PrimaryMap::new(),
            root: Node::from_u32(0),
            top: Node::from_u32(0),
            start: Node::from_u32(0),
            int_cons: FxHashMap::default(),
            long_cons: FxHashMap::default(),
            ptr_cons: FxHashMap::default(),
            worklist: Vec::new(),
            in_worklist: EntitySet::new(),
            macro_nodes: Vec::new(),
            live: 0,
        };
        g.root = g.add(Opcode::Root, &[None], Type::Bottom, NodeInfo::None);
        g.top = g.add(Opcode::Top, &[Some(g.root)], Type::Top, NodeInfo::None);
        g.start = g.add(Opcode::Start, &[None, Some(g.root)], Type::Tuple, NodeInfo::None);
        let start = g.start;
        g.add(Opcode::Parm, &[Some(start)], Type::Control, NodeInfo::Proj(slot::CONTROL));
        g.add(Opcode::Parm, &[Some(start)], Type::Io, NodeInfo::Proj(slot::I_O));
        g.add(Opcode::Parm, &[Some(start)], Type::Memory, NodeInfo::Proj(slot::MEMORY));
        let raw = Type::Ptr(TypePtr::raw(PtrNull::NotNull, Offset::Known(0)));
        g.add(Opcode::Parm, &[Some(start)], raw.clone(), NodeInfo::Proj(slot::FRAME_PTR));
        g.add(Opcode::Parm, &[Some(start)], raw, NodeInfo::Proj(slot::RETURN_ADR));
        g
    }

    /// The root node. Its inputs are the method exits.
    pub fn root(&self) -> Node {
        self.root
    }

    /// The start node.
    pub fn start(&self) -> Node {
        self.start
    }

    /// The top constant, used for dead or absent values.
    pub fn top(&self) -> Node {
        self.top
    }

    /// The initial memory state.
    pub fn start_mem(&self) -> Option<Node> {
        self.proj_out(self.start, slot::MEMORY)
    }

    /// Add a node with the given inputs. Returns its reference.
    pub fn add(&mut self, op: Opcode, inputs: &[Option<Node>], ty: Type, info: NodeInfo) -> Node {
        let n = self.nodes.push(NodeData {
            op,
            inputs: inputs.iter().copied().collect(),
            outs: SmallVec::new(),
            ty,
            info,
            dead: false,
        });
        for &inp in inputs.iter().flatten() {
            self.nodes[inp].outs.push(n);
        }
        self.live += 1;
        n
    }

    /// Add a node with no payload and all inputs present.
    pub fn add_simple(&mut self, op: Opcode, inputs: &[Node], ty: Type) -> Node {
        let inputs: SmallVec<[Option<Node>; 4]> = inputs.iter().map(|&n| Some(n)).collect();
        self.add(op, &inputs, ty, NodeInfo::None)
    }

    /// Copy `n` with its inputs, type and payload; the copy has no users.
    pub fn clone_node(&mut self, n: Node) -> Node {
        let d = &self.nodes[n];
        let (op, inputs, ty, info) = (d.op, d.inputs.clone(), d.ty.clone(), d.info.clone());
        self.add(op, &inputs, ty, info)
    }

    /// Node data.
    pub fn data(&self, n: Node) -> &NodeData {
        &self.nodes[n]
    }

    /// Mutable node data. Edges must be edited through the graph methods.
    pub fn data_mut(&mut self, n: Node) -> &mut NodeData {
        &mut self.nodes[n]
    }

    /// Operation of `n`.
    pub fn op(&self, n: Node) -> Opcode {
        self.nodes[n].op
    }

    /// Type of `n`.
    pub fn ty(&self, n: Node) -> &Type {
        &self.nodes[n].ty
    }

    /// Change the type of `n` and queue it for re-optimization.
    pub fn set_type(&mut self, n: Node, ty: Type) {
        self.nodes[n].ty = ty;
        self.record_for_igvn(n);
    }

    /// Payload of `n`.
    pub fn info(&self, n: Node) -> &NodeInfo {
        &self.nodes[n].info
    }

    /// Mutable payload of `n`.
    pub fn info_mut(&mut self, n: Node) -> &mut NodeInfo {
        &mut self.nodes[n].info
    }

    /// Input `i` of `n`, if present.
    pub fn input(&self, n: Node, i: usize) -> Option<Node> {
        self.nodes[n].inputs.get(i).copied().flatten()
    }

    /// Number of input slots of `n`.
    pub fn req(&self, n: Node) -> usize {
        self.nodes[n].inputs.len()
    }

    /// Users of `n`, one entry per edge.
    pub fn outs(&self, n: Node) -> &[Node] {
        &self.nodes[n].outs
    }

    /// Distinct users of `n` in first-use order, copied so the graph may be edited meanwhile.
    pub fn uses(&self, n: Node) -> Vec<Node> {
        let mut v: Vec<Node> = Vec::with_capacity(self.nodes[n].outs.len());
        for &u in self.nodes[n].outs.iter() {
            if !v.contains(&u) {
                v.push(u);
            }
        }
        v
    }

    /// Number of use edges of `n`.
    pub fn outcnt(&self, n: Node) -> usize {
        self.nodes[n].outs.len()
    }

    /// The only user of `n`.
    pub fn unique_out(&self, n: Node) -> Option<Node> {
        match self.nodes[n].outs.as_slice() {
            [u] => Some(*u),
            _ => None,
        }
    }

    /// First user of `n` with opcode `op`.
    pub fn find_out_with(&self, n: Node, op: Opcode) -> Option<Node> {
        self.nodes[n].outs.iter().copied().find(|&u| self.op(u) == op)
    }

    fn unlink(&mut self, def: Node, user: Node) {
        let outs = &mut self.nodes[def].outs;
        if let Some(pos) = outs.iter().position(|&u| u == user) {
            outs.swap_remove(pos);
        }
    }

    /// Set input `i` of `n`, growing the input list if needed.
    pub fn set_req(&mut self, n: Node, i: usize, v: Option<Node>) {
        if self.nodes[n].inputs.len() <= i {
            self.nodes[n].inputs.resize(i + 1, None);
        }
        let old = self.nodes[n].inputs[i];
        if old == v {
            return;
        }
        if let Some(o) = old {
            self.unlink(o, n);
        }
        self.nodes[n].inputs[i] = v;
        if let Some(v) = v {
            self.nodes[v].outs.push(n);
        }
        self.record_for_igvn(n);
    }

    /// Append an input to `n`.
    pub fn add_req(&mut self, n: Node, v: Option<Node>) {
        let i = self.nodes[n].inputs.len();
        self.set_req(n, i, None);
        self.set_req(n, i, v);
    }

    /// Insert an input at `i`, shifting later inputs up.
    pub fn ins_req(&mut self, n: Node, i: usize, v: Option<Node>) {
        self.nodes[n].inputs.insert(i, v);
        if let Some(v) = v {
            self.nodes[v].outs.push(n);
        }
        self.record_for_igvn(n);
    }

    /// Remove input `i`, moving the last input into its place.
    pub fn del_req(&mut self, n: Node, i: usize) {
        if let Some(o) = self.nodes[n].inputs.swap_remove(i) {
            self.unlink(o, n);
        }
        self.record_for_igvn(n);
    }

    /// Remove input `i`, keeping the order of the other inputs.
    pub fn del_req_ordered(&mut self, n: Node, i: usize) {
        if let Some(o) = self.nodes[n].inputs.remove(i) {
            self.unlink(o, n);
        }
        self.record_for_igvn(n);
    }

    /// Replace every input edge of `user` that points at `old` with `new`. Returns the number
    /// of edges replaced.
    pub fn replace_edge(&mut self, user: Node, old: Node, new: Option<Node>) -> usize {
        let len = self.req(user);
        self.replace_edges_in_range(user, old, new, 0, len)
    }

    /// Like [`Graph::replace_edge`] but only for inputs in `start..end`.
    pub fn replace_edges_in_range(
        &mut self,
        user: Node,
        old: Node,
        new: Option<Node>,
        start: usize,
        end: usize,
    ) -> usize {
        let end = end.min(self.req(user));
        let mut count = 0;
        for i in start..end {
            if self.nodes[user].inputs[i] == Some(old) {
                self.set_req(user, i, new);
                count += 1;
            }
        }
        count
    }

    /// Redirect all users of `old` to `new` and remove `old`.
    pub fn replace_node(&mut self, old: Node, new: Node) {
        trace!("replace {} with {}", old, new);
        for u in self.uses(old) {
            self.replace_edge(u, old, Some(new));
        }
        self.remove_dead_node(old);
    }

    fn is_permanent(&self, n: Node) -> bool {
        n == self.root
            || n == self.top
            || n == self.start
            || self.op(n).is_con()
            || (self.op(n) == Opcode::Parm && self.input(n, 0) == Some(self.start))
    }

    /// Remove `n`, and then every input left without users.
    ///
    /// Users `n` still has are pointed at top.
    pub fn remove_dead_node(&mut self, n: Node) {
        let mut stack = vec![n];
        while let Some(d) = stack.pop() {
            if self.nodes[d].dead || self.is_permanent(d) {
                continue;
            }
            for u in self.uses(d) {
                debug_assert!(self.nodes[u].dead || u == d, "removing {d} still used by {u}");
                let top = self.top;
                self.replace_edge(u, d, Some(top));
            }
            let inputs = core::mem::take(&mut self.nodes[d].inputs);
            for inp in inputs.into_iter().flatten() {
                self.unlink(inp, d);
                if self.nodes[inp].outs.is_empty() {
                    stack.push(inp);
                } else {
                    self.record_for_igvn(inp);
                }
            }
            self.nodes[d].dead = true;
            self.live -= 1;
            self.remove_macro_node(d);
        }
    }

    /// Has `n` been removed?
    pub fn is_dead(&self, n: Node) -> bool {
        self.nodes[n].dead
    }

    /// Is `n` the top constant?
    pub fn is_top(&self, n: Node) -> bool {
        n == self.top
    }

    /// The projection of multi-output node `n` numbered `con`.
    pub fn proj_out(&self, n: Node, con: usize) -> Option<Node> {
        self.nodes[n].outs.iter().copied().find(|&u| {
            self.op(u).is_proj()
                && self.input(u, 0) == Some(n)
                && match (self.op(u), self.info(u)) {
                    (Opcode::IfTrue, _) => con == 1,
                    (Opcode::IfFalse, _) => con == 0,
                    (_, NodeInfo::Proj(c)) => *c == con,
                    _ => false,
                }
        })
    }

    /// The projection numbered `con`, created if missing.
    pub fn make_proj(&mut self, n: Node, con: usize, ty: Type) -> Node {
        match self.proj_out(n, con) {
            Some(p) => p,
            None => self.add(Opcode::Proj, &[Some(n)], ty, NodeInfo::Proj(con)),
        }
    }

    /// Projection number of a projection node.
    pub fn proj_con(&self, n: Node) -> Option<usize> {
        match (self.op(n), self.info(n)) {
            (Opcode::IfTrue, _) => Some(1),
            (Opcode::IfFalse, _) => Some(0),
            (_, NodeInfo::Proj(c)) => Some(*c),
            _ => None,
        }
    }

    /// An `int` constant.
    pub fn intcon(&mut self, v: i32) -> Node {
        if let Some(&n) = self.int_cons.get(&v) {
            return n;
        }
        let root = self.root;
        let n = self.add(Opcode::ConI, &[Some(root)], Type::Int(Some(v)), NodeInfo::None);
        self.int_cons.insert(v, n);
        n
    }

    /// A `long` constant.
    pub fn longcon(&mut self, v: i64) -> Node {
        if let Some(&n) = self.long_cons.get(&v) {
            return n;
        }
        let root = self.root;
        let n = self.add(Opcode::ConL, &[Some(root)], Type::Long(Some(v)), NodeInfo::None);
        self.long_cons.insert(v, n);
        n
    }

    /// A machine word constant.
    pub fn intptrcon(&mut self, v: i64) -> Node {
        self.longcon(v)
    }

    /// A pointer constant.
    pub fn makecon(&mut self, tp: TypePtr) -> Node {
        if let Some(&n) = self.ptr_cons.get(&tp) {
            return n;
        }
        let root = self.root;
        let n = self.add(
            Opcode::ConP,
            &[Some(root)],
            Type::Ptr(tp.clone()),
            NodeInfo::None,
        );
        self.ptr_cons.insert(tp, n);
        n
    }

    /// The null constant.
    pub fn null(&mut self) -> Node {
        self.makecon(TypePtr::null_ptr())
    }

    /// The pointer constant of type `tp`, if one was made.
    pub fn find_ptr_con(&self, tp: &TypePtr) -> Option<Node> {
        self.ptr_cons.get(tp).copied()
    }

    /// The default value of a field of type `bt`.
    ///
    /// Floating point zeros share the integer constants: their bit pattern is zero as well.
    pub fn zerocon(&mut self, bt: BasicType) -> Node {
        match bt {
            BasicType::Long | BasicType::Double => self.longcon(0),
            b if b.is_reference() => self.null(),
            BasicType::Address => self.longcon(0),
            _ => self.intcon(0),
        }
    }

    /// Constant value of an integer node.
    pub fn find_int_con(&self, n: Node) -> Option<i64> {
        self.ty(n).int_con()
    }

    /// Queue `n` for re-optimization by the surrounding optimizer.
    pub fn record_for_igvn(&mut self, n: Node) {
        if !self.in_worklist.contains(n) {
            self.in_worklist.insert(n);
            self.worklist.push(n);
        }
    }

    /// Take the re-optimization worklist.
    pub fn take_worklist(&mut self) -> Vec<Node> {
        self.in_worklist.clear();
        core::mem::take(&mut self.worklist)
    }

    /// Register a node that macro expansion has to process.
    pub fn add_macro_node(&mut self, n: Node) {
        if !self.macro_nodes.contains(&n) {
            self.macro_nodes.push(n);
        }
    }

    /// Forget a macro node.
    pub fn remove_macro_node(&mut self, n: Node) {
        self.macro_nodes.retain(|&m| m != n);
    }

    /// Nodes macro expansion has to process, in registration order.
    pub fn macro_nodes(&self) -> &[Node] {
        &self.macro_nodes
    }

    /// Number of nodes not removed.
    pub fn live_nodes(&self) -> usize {
        self.live
    }

    /// Number of nodes ever created. Every node reference is below this.
    pub fn unique(&self) -> usize {
        self.nodes.len()
    }

    /// All live nodes in creation order.
    pub fn live_node_iter(&self) -> impl Iterator<Item = Node> + '_ {
        self.nodes.iter().filter(|(_, d)| !d.dead).map(|(n, _)| n)
    }

    /// Walk input edges from `n` up to the first node with opcode `op`, following input 0.
    pub fn control_up_to(&self, mut n: Node, op: Opcode, limit: usize) -> Option<Node> {
        for _ in 0..limit {
            if self.op(n) == op {
                return Some(n);
            }
            n = self.input(n, 0)?;
        }
        None
    }

    /// The allocation that produced the object `ptr`, looking through the cast that publishes
    /// the raw result of an allocation.
    pub fn ideal_allocation(&self, ptr: Node) -> Option<Node> {
        let mut p = ptr;
        if self.op(p) == Opcode::CheckCastPP {
            p = self.input(p, 1)?;
        }
        if self.op(p) != Opcode::Proj || self.proj_con(p) != Some(slot::PARMS) {
            return None;
        }
        let alloc = self.input(p, 0)?;
        self.op(alloc).is_allocate().then_some(alloc)
    }

    /// The allocation `ptr` points into, for an address `AddP(base, .., off)` of a field of a
    /// fresh object. Returns the allocation and the constant offset.
    pub fn ideal_allocation_with_offset(&self, ptr: Node) -> Option<(Node, Option<i64>)> {
        if self.op(ptr) != Opcode::AddP {
            return self.ideal_allocation(ptr).map(|a| (a, Some(0)));
        }
        let base = self.input(ptr, slot::addp::BASE)?;
        let alloc = self.ideal_allocation(base)?;
        let off = self
            .ty(ptr)
            .isa_ptr()
            .and_then(|tp| tp.offset.known())
            .map(i64::from);
        Some((alloc, off))
    }

    /// The `Initialize` barrier following the allocation `alloc`.
    pub fn initialization(&self, alloc: Node) -> Option<Node> {
        let rawoop = self.proj_out(alloc, slot::PARMS)?;
        self.find_out_with(rawoop, Opcode::Initialize)
    }

    /// The store into byte `offset` of the new object that the initialization `init` captured.
    pub fn find_captured_store(&self, init: Node, offset: i32) -> Option<Node> {
        debug_assert_eq!(self.op(init), Opcode::Initialize);
        (slot::init::RAW_STORES..self.req(init))
            .filter_map(|i| self.input(init, i))
            .find(|&st| self.captured_store_offset(st) == Some(offset))
    }

    fn captured_store_offset(&self, st: Node) -> Option<i32> {
        let adr = self.input(st, slot::mem::ADDRESS)?;
        let off = self.input(adr, slot::addp::OFFSET)?;
        i32::try_from(self.find_int_con(off)?).ok()
    }

    /// Display a single node.
    pub fn display_node(&self, n: Node) -> DisplayNode<'_> {
        DisplayNode { graph: self, node: n }
    }
}

/// Displays one node as `n12 = AddP n3 n3 n7 : inst:klass1+12`.
pub struct DisplayNode<'a> {
    graph: &'a Graph,
    node: Node,
}

impl fmt::Display for DisplayNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let d = self.graph.data(self.node);
        write!(f, "{} = {:?}", self.node, d.op)?;
        if let Some(c) = self.graph.proj_con(self.node) {
            write!(f, "#{c}")?;
        }
        for i in &d.inputs {
            match i {
                Some(i) => write!(f, " {i}")?,
                None => f.write_str(" _")?,
            }
        }
        write!(f, " : {}", d.ty)?;
        if d.dead {
            f.write_str(" (dead)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges() {
        let mut g = Graph::new();
        let a = g.intcon(1);
        let b = g.intcon(2);
        assert_eq!(g.intcon(1), a);
        let add = g.add_simple(Opcode::AddI, &[g.top(), a, b], Type::Int(None));
        assert_eq!(g.input(add, 1), Some(a));
        assert!(g.outs(a).contains(&add));

        assert_eq!(g.replace_edge(add, a, Some(b)), 1);
        assert_eq!(g.input(add, 1), Some(b));
        assert!(!g.outs(a).contains(&add));
        assert_eq!(g.outcnt(b), 2);
        assert_eq!(g.uses(b), vec![add]);

        g.del_req(add, 1);
        assert_eq!(g.req(add), 2);
        assert_eq!(g.input(add, 1), Some(b));
    }

    #[test]
    fn dead_nodes_cascade() {
        let mut g = Graph::new();
        let live = g.live_nodes();
        let a = g.intcon(1);
        let neg = g.add_simple(Opcode::SubI, &[g.top(), a, a], Type::Int(None));
        let add = g.add_simple(Opcode::AddI, &[g.top(), neg, a], Type::Int(None));
        g.remove_dead_node(add);
        assert!(g.is_dead(add));
        assert!(g.is_dead(neg));
        assert!(!g.is_dead(a));
        assert_eq!(g.live_nodes(), live + 1);
    }

    #[test]
    fn start_projections() {
        let g = Graph::new();
        let mem = g.start_mem().unwrap();
        assert_eq!(*g.ty(mem), Type::Memory);
        assert_eq!(g.proj_con(mem), Some(slot::MEMORY));
    }
}
