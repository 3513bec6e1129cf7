//! Building the connection graph from the IR.
//!
//! Every IR node is visited once. Nodes whose inputs may not have a connection graph node yet
//! are queued and get their edges in a second pass ([`ConnectionGraph::add_final_edges`]), once
//! everything is registered.

use super::{ConnectionGraph, EscapeState, PointsToNode, PtFlags, PtIdx, PtKind, PtUse};
use crate::arraycopy;
use crate::compile::Compile;
use crate::entity::packed_option::PackedOption;
use crate::entity::{EntityRef, PrimaryMap, SecondaryMap};
use crate::ir::klass::{ARRAY_LENGTH_OFFSET, KLASS_OFFSET};
use crate::ir::{
    ArgSummary, BasicType, Graph, KlassFlags, Node, NodeInfo, Offset, Opcode, PtrNull, TypePtr,
    slot,
};
use crate::{FxHashSet, trace};
use std::time::Instant;

/// Runtime stubs reached through leaf calls whose pointer arguments are only read or written
/// during the call.
const KNOWN_LEAF_STUBS: &[&str] = &[
    "updateBytesCRC32",
    "updateBytesCRC32C",
    "updateBytesAdler32",
    "aescrypt_encryptBlock",
    "aescrypt_decryptBlock",
    "cipherBlockChaining_encryptAESCrypt",
    "cipherBlockChaining_decryptAESCrypt",
    "electronicCodeBook_encryptAESCrypt",
    "electronicCodeBook_decryptAESCrypt",
    "counterMode_AESCrypt",
    "galoisCounterMode_AESCrypt",
    "poly1305_processBlocks",
    "ghash_processBlocks",
    "chacha20Block",
    "encodeBlock",
    "decodeBlock",
    "md5_implCompress",
    "md5_implCompressMB",
    "sha1_implCompress",
    "sha1_implCompressMB",
    "sha256_implCompress",
    "sha256_implCompressMB",
    "sha512_implCompress",
    "sha512_implCompressMB",
    "sha3_implCompress",
    "sha3_implCompressMB",
    "multiplyToLen",
    "squareToLen",
    "mulAdd",
    "montgomery_multiply",
    "montgomery_square",
    "bigIntegerRightShiftWorker",
    "bigIntegerLeftShiftWorker",
    "vectorizedMismatch",
    "arraysort_stub",
    "array_partition_stub",
    "get_class_id_intrinsic",
];

/// Is `call` a leaf call to one of [`KNOWN_LEAF_STUBS`]?
fn is_known_leaf_stub(g: &Graph, call: Node) -> bool {
    matches!(g.info(call), NodeInfo::Call(ci) if KNOWN_LEAF_STUBS.contains(&ci.name.as_str()))
}

/// `n` with pointer casts stripped.
pub(crate) fn uncast(g: &Graph, n: Node) -> Node {
    let mut n = n;
    while g.op(n).is_constraint_cast() {
        match g.input(n, 1) {
            Some(i) => n = i,
            None => break,
        }
    }
    n
}

/// The object an address computation points into.
///
/// Raw addresses (top base) are followed through their chain of `AddP`s to the pointer they
/// start from.
pub(crate) fn get_addp_base(g: &Graph, addp: Node) -> Node {
    debug_assert_eq!(g.op(addp), Opcode::AddP);
    let top = g.top();
    let base = g.input(addp, slot::addp::BASE).unwrap_or(top);
    if !g.is_top(uncast(g, base)) {
        return base;
    }
    let mut base = g.input(addp, slot::addp::ADDRESS).unwrap_or(top);
    while g.op(base) == Opcode::AddP {
        base = g.input(base, slot::addp::ADDRESS).unwrap_or(top);
    }
    if g.op(base) == Opcode::CheckCastPP
        && g.ty(base).isa_ptr().is_some_and(|t| t.is_raw())
    {
        if let Some(inner) = g.input(base, 1).filter(|&i| g.ty(i).isa_oopptr().is_some()) {
            return inner;
        }
    }
    base
}

/// The `AddP` computing an element address from the partial address `addp` of array `n`, if
/// `addp` is the first half of such a pair.
pub(crate) fn find_second_addp(g: &Graph, addp: Node, n: Node) -> Option<Node> {
    let addp2 = g.unique_out(addp)?;
    (g.op(addp2) == Opcode::AddP
        && g.input(addp2, slot::addp::BASE) == Some(n)
        && g.input(addp2, slot::addp::ADDRESS) == Some(addp))
    .then_some(addp2)
}

/// Is `addp` the raw address of a store into a fresh object, captured by its initialization?
pub(crate) fn is_captured_store_address(g: &Graph, addp: Node) -> bool {
    let Some(adr) = g.input(addp, slot::addp::ADDRESS) else {
        return false;
    };
    match g.op(adr) {
        Opcode::Proj => g.input(adr, 0).is_some_and(|a| g.op(a).is_allocate()),
        Opcode::Phi => g.outs(addp).iter().any(|&u| {
            g.op(u).is_store() && g.outs(u).iter().any(|&s| g.op(s) == Opcode::Initialize)
        }),
        _ => false,
    }
}

/// Byte offset addressed by `adr`.
pub(crate) fn address_offset(g: &Graph, adr: Node) -> Offset {
    let ty = g.ty(adr);
    if g.op(adr) == Opcode::AddP
        && ty.isa_oopptr().is_none()
        && is_captured_store_address(g, adr)
    {
        let off = g
            .input(adr, slot::addp::OFFSET)
            .and_then(|o| g.find_int_con(o));
        return match off {
            Some(o) => Offset::Known(o as i32),
            None => Offset::Bot,
        };
    }
    ty.isa_ptr().map_or(Offset::Bot, |t| t.offset)
}

/// Does `call` produce a pointer through its `PARMS` projection?
pub(crate) fn returns_pointer(g: &Graph, call: Node) -> bool {
    match g.info(call) {
        NodeInfo::Alloc(_) => true,
        NodeInfo::Call(ci) => ci.ret.is_some_and(|bt| bt.is_reference()),
        _ => false,
    }
}

/// Is `call` a boxing method escape analysis may remove?
pub(crate) fn is_boxing_call(c: &Compile, call: Node) -> bool {
    c.graph.op(call) == Opcode::CallStaticJava
        && c.flags().eliminate_autobox()
        && matches!(c.graph.info(call), NodeInfo::Call(ci) if ci.boxing)
}

/// Does memory node `u` move a pointer?
fn is_ptr_access(g: &Graph, u: Node) -> bool {
    match g.op(u) {
        Opcode::Load | Opcode::GetAndSet | Opcode::CompareAndExchange => {
            g.ty(u).make_ptr().is_some()
        }
        Opcode::Store | Opcode::CompareAndSwap | Opcode::WeakCompareAndSwap => g
            .input(u, slot::mem::VALUE)
            .is_some_and(|v| g.ty(v).make_ptr().is_some()),
        _ => false,
    }
}

/// Does the address `n` hold a reference? The second value tells whether the access is one
/// the class layout does not know about.
fn is_oop_field(c: &Compile, n: Node, offset: Offset) -> (bool, bool) {
    let g = &c.graph;
    let Some(adr_type) = g.ty(n).isa_ptr() else {
        return (false, false);
    };
    let base = g.input(n, slot::addp::BASE).unwrap_or_else(|| g.top());
    let unknown_ptr_access = || {
        g.outs(n).iter().any(|&u| is_ptr_access(g, u))
            || c.barrier_set().c2().escape_has_out_with_unsafe_object(c, n)
    };
    let mut bt = BasicType::Int;
    let mut unsafe_access = false;
    match offset {
        Offset::Bot => {
            let elem_is_ref = adr_type.elem.is_none_or(|e| e.is_reference());
            // Element addresses are computed in two steps; only the second one is the field.
            if (!adr_type.is_aryptr() || elem_is_ref)
                && find_second_addp(g, n, base).is_none()
            {
                bt = BasicType::Object;
            }
        }
        Offset::Known(KLASS_OFFSET) | Offset::Top => {}
        Offset::Known(off) => {
            if adr_type.is_instptr() {
                let field = adr_type.klass.and_then(|k| c.klasses.field_at(k, off));
                match field {
                    Some(f) => bt = f.bt,
                    None => {
                        if unknown_ptr_access() {
                            bt = BasicType::Object;
                            unsafe_access = true;
                        }
                    }
                }
            } else if adr_type.is_aryptr() {
                if off != ARRAY_LENGTH_OFFSET && find_second_addp(g, n, base).is_none() {
                    bt = adr_type.elem.unwrap_or(BasicType::Object);
                }
            } else if (adr_type.is_raw() || adr_type.kind == crate::ir::PtrKind::Klass)
                && unknown_ptr_access()
            {
                bt = BasicType::Object;
            }
        }
    }
    (bt.is_reference(), unsafe_access)
}

impl ConnectionGraph {
    /// An empty graph holding the two sentinel objects.
    pub(super) fn new(c: &Compile, invocation: u32) -> Self {
        let g = &c.graph;
        let mut nodes: PrimaryMap<PtIdx, PointsToNode> = PrimaryMap::new();
        let mut map: SecondaryMap<Node, PackedOption<PtIdx>> = SecondaryMap::new();
        let top = g.top();
        let phantom = nodes.push(PointsToNode::new(top, PtKind::JavaObject, EscapeState::GlobalEscape));
        map[top] = phantom.into();
        let null = g.find_ptr_con(&TypePtr::null_ptr());
        debug_assert!(null.is_some(), "the null constant is created with the compilation");
        let null_obj = nodes.push(PointsToNode::new(
            null.unwrap_or(top),
            PtKind::JavaObject,
            EscapeState::NoEscape,
        ));
        nodes[null_obj].flags.remove(PtFlags::SCALAR_REPLACEABLE);
        if let Some(null) = null {
            map[null] = null_obj.into();
        }
        Self {
            nodes,
            map,
            phantom,
            null_obj,
            invocation,
            map_size: g.unique(),
            worklist: Vec::new(),
            in_worklist: FxHashSet::default(),
            started: Instant::now(),
        }
    }

    fn map_ideal_node(&mut self, n: Node, p: PtIdx) {
        self.map[n] = p.into();
    }

    /// Was `n` created after the graph was built?
    pub(super) fn is_new_node(&self, n: Node) -> bool {
        n.index() >= self.map_size
    }

    fn push_node(&mut self, n: Node, kind: PtKind, es: EscapeState) -> PtIdx {
        let p = self.nodes.push(PointsToNode::new(n, kind, es));
        self.map_ideal_node(n, p);
        trace!("cg: {} {:?} {} for {}", p, kind, es, n);
        p
    }

    /// Register `n` as a local value.
    pub(super) fn add_local_var(&mut self, n: Node, es: EscapeState) -> PtIdx {
        if let Some(p) = self.ptnode(n) {
            debug_assert!(self.nodes[p].is_local_var(), "{n} is already mapped");
            return p;
        }
        self.push_node(n, PtKind::LocalVar, es)
    }

    /// Register `n` as an object.
    pub(super) fn add_java_object(&mut self, n: Node, es: EscapeState) -> PtIdx {
        if let Some(p) = self.ptnode(n) {
            debug_assert!(self.nodes[p].is_java_object(), "{n} is already mapped");
            return p;
        }
        self.push_node(n, PtKind::JavaObject, es)
    }

    /// Register the address `n` as a field at `offset`.
    pub(super) fn add_field(&mut self, c: &Compile, n: Node, es: EscapeState, offset: Offset) -> PtIdx {
        if let Some(p) = self.ptnode(n) {
            debug_assert!(self.nodes[p].is_field(), "{n} is already mapped");
            return p;
        }
        let (is_oop, unsafe_access) = is_oop_field(c, n, offset);
        let es = if unsafe_access {
            EscapeState::GlobalEscape
        } else {
            es
        };
        let p = self.push_node(n, PtKind::Field, es);
        self.nodes[p].offset = offset;
        if is_oop {
            self.nodes[p].flags.insert(PtFlags::IS_OOP);
        }
        p
    }

    /// Record the bulk copy `n` from `src` into `dst`.
    ///
    /// The destination points to the copy and the copy to the source: values reachable from
    /// the source's fields become reachable from the destination's, but not the other way.
    pub(super) fn add_arraycopy(&mut self, n: Node, es: EscapeState, src: PtIdx, dst: PtIdx) {
        debug_assert!(!self.nodes[src].is_field() && !self.nodes[dst].is_field());
        if src == self.null_obj || dst == self.null_obj || self.ptnode(n).is_some() {
            return;
        }
        let ac = self.push_node(n, PtKind::Arraycopy, es);
        self.add_edge(ac, src);
        self.nodes[src].flags.insert(PtFlags::ARRAYCOPY_SRC);
        self.add_edge(dst, ac);
        self.nodes[dst].flags.insert(PtFlags::ARRAYCOPY_DST);
    }

    /// Add an edge `from -> to`. Returns whether it is new.
    pub(super) fn add_edge(&mut self, from: PtIdx, to: PtIdx) -> bool {
        debug_assert!(
            !self.nodes[from].is_field() || self.nodes[from].is_oop(),
            "edges only start at oop fields"
        );
        if self.nodes[from].has_edge(to) {
            return false;
        }
        self.nodes[from].edges.push(to);
        self.nodes[to].uses.push(PtUse::Edge(from));
        true
    }

    /// Add `base` to the bases of `field`. Returns whether it is new.
    ///
    /// An object base also gets an edge to the field: the edges of an object are its fields.
    pub(super) fn add_base(&mut self, field: PtIdx, base: PtIdx) -> bool {
        debug_assert!(!self.nodes[base].is_arraycopy());
        if self.nodes[field].bases.contains(&base) {
            return false;
        }
        self.nodes[field].bases.push(base);
        if base == self.null_obj {
            // The null object has no fields.
            return true;
        }
        if self.nodes[base].is_java_object() {
            self.nodes[base].edges.push(field);
        } else {
            self.nodes[base].uses.push(PtUse::Base(field));
        }
        true
    }

    /// Raise the escape state of `p` to `es`. States never go down.
    pub(super) fn set_escape_state(&mut self, p: PtIdx, es: EscapeState, reason: &str) {
        let ptn = &mut self.nodes[p];
        if es > ptn.es {
            trace!("cg: {} {} -> {}: {}", ptn.node, ptn.es, es, reason);
            ptn.es = es;
            if ptn.fields_es < es {
                ptn.fields_es = es;
            }
            if ptn.is_java_object() && es > EscapeState::NoEscape {
                ptn.flags.remove(PtFlags::SCALAR_REPLACEABLE);
            }
        }
    }

    /// Raise the escape state of everything reachable through the fields of `p`.
    pub(super) fn set_fields_escape_state(&mut self, p: PtIdx, es: EscapeState, reason: &str) {
        let ptn = &mut self.nodes[p];
        if es > ptn.fields_es {
            trace!("cg: {} fields {} -> {}: {}", ptn.node, ptn.fields_es, es, reason);
            ptn.fields_es = es;
        }
    }

    /// Rule out scalar replacement of the object `p`.
    pub(super) fn set_not_scalar_replaceable(&mut self, p: PtIdx, reason: &str) {
        let ptn = &mut self.nodes[p];
        if ptn.scalar_replaceable() {
            trace!("cg: {} not scalar replaceable: {}", ptn.node, reason);
            ptn.flags.remove(PtFlags::SCALAR_REPLACEABLE);
        }
    }

    /// Create the connection graph node of `n`, if it is interesting to escape analysis.
    ///
    /// Nodes whose edges need nodes that may not exist yet are pushed on `delayed`.
    pub(super) fn add_node_to_connection_graph(&mut self, c: &Compile, n: Node, delayed: &mut Vec<Node>) {
        if self.ptnode(n).is_some() {
            return;
        }
        let bs = c.barrier_set();
        if bs.c2().escape_add_to_con_graph(self, c, n, delayed) {
            return;
        }
        let g = &c.graph;
        let op = g.op(n);
        if op.is_call() {
            // Arguments of allocations and locks do not escape.
            if op.is_abstract_lock() {
                return;
            }
            if op.is_allocate() {
                self.add_call_node(c, n);
                return;
            }
            if matches!(g.info(n), NodeInfo::Call(ci) if ci.name == "uncommon_trap") {
                return;
            }
            // Arguments are processed once every node exists.
            delayed.push(n);
            let result_used = returns_pointer(g, n) && g.proj_out(n, slot::PARMS).is_some();
            if result_used || is_boxing_call(c, n) {
                self.add_call_node(c, n);
            }
            return;
        }
        match op {
            Opcode::AddP => {
                let base = get_addp_base(g, n);
                let offset = address_offset(g, n);
                let field = self.add_field(c, n, EscapeState::NoEscape, offset);
                match self.ptnode(base) {
                    Some(b) => {
                        self.add_base(field, b);
                    }
                    None => delayed.push(n),
                }
            }
            Opcode::CastX2P | Opcode::Parm => {
                // Pointers made from integers and incoming values point to unknown objects.
                self.map_ideal_node(n, self.phantom);
            }
            Opcode::CastPP | Opcode::CheckCastPP | Opcode::EncodeP | Opcode::DecodeN => {
                if let Some(inp) = g.input(n, 1) {
                    self.add_local_var_and_edge(c, n, EscapeState::NoEscape, inp, Some(delayed));
                }
            }
            Opcode::ConP => {
                let es = if g.ty(n).make_ptr().is_some_and(|t| t.is_null()) {
                    EscapeState::NoEscape
                } else {
                    EscapeState::GlobalEscape
                };
                let p = self.add_java_object(n, es);
                self.set_not_scalar_replaceable(p, "constant pointer");
            }
            Opcode::Load => {
                self.add_objload_to_connection_graph(c, n, Some(delayed));
            }
            Opcode::Phi => {
                if g.ty(n).make_ptr().is_some() {
                    self.add_local_var(n, EscapeState::NoEscape);
                    // Inputs may not be registered yet.
                    delayed.push(n);
                }
            }
            Opcode::Proj => {
                let call = g.input(n, 0);
                if g.proj_con(n) == Some(slot::PARMS)
                    && call.is_some_and(|call| g.op(call).is_call() && returns_pointer(g, call))
                {
                    if let Some(call) = call {
                        self.add_local_var_and_edge(c, n, EscapeState::NoEscape, call, Some(delayed));
                    }
                }
            }
            Opcode::Return => {
                if let Some(val) = g.input(n, slot::PARMS) {
                    if g.ty(val).isa_oopptr().is_some() {
                        // The returned value is a local that escapes globally.
                        self.add_local_var_and_edge(c, n, EscapeState::GlobalEscape, val, Some(delayed));
                    }
                }
            }
            Opcode::CompareAndExchange | Opcode::GetAndSet => {
                if g.ty(n).make_ptr().is_some() {
                    self.add_objload_to_connection_graph(c, n, Some(&mut *delayed));
                    self.add_to_congraph_unsafe_access(c, n, Some(delayed));
                }
            }
            Opcode::Store | Opcode::CompareAndSwap | Opcode::WeakCompareAndSwap => {
                if is_ptr_access(g, n) {
                    self.add_to_congraph_unsafe_access(c, n, Some(delayed));
                }
            }
            Opcode::ThreadLocal => {
                let p = self.add_java_object(n, EscapeState::ArgEscape);
                self.set_not_scalar_replaceable(p, "thread local");
            }
            _ => {}
        }
    }

    /// Add the edges of the queued node `n`, now that every node is registered.
    pub(super) fn add_final_edges(&mut self, c: &Compile, n: Node) {
        let g = &c.graph;
        if g.op(n).is_call() {
            self.process_call_arguments(c, n);
            return;
        }
        let bs = c.barrier_set();
        if bs.c2().escape_add_final_edges(self, c, n) {
            return;
        }
        match g.op(n) {
            Opcode::AddP => {
                let base = get_addp_base(g, n);
                let base_ptn = self.ptnode(base).unwrap_or(self.phantom);
                if let Some(field) = self.ptnode(n) {
                    self.add_base(field, base_ptn);
                }
            }
            Opcode::CastPP | Opcode::CheckCastPP | Opcode::EncodeP | Opcode::DecodeN => {
                if let Some(inp) = g.input(n, 1) {
                    self.add_local_var_and_edge(c, n, EscapeState::NoEscape, inp, None);
                }
            }
            Opcode::Load => {
                self.add_objload_to_connection_graph(c, n, None);
            }
            Opcode::Phi => {
                let Some(phi) = self.ptnode(n) else {
                    return;
                };
                for i in 1..g.req(n) {
                    let Some(inp) = g.input(n, i) else {
                        continue;
                    };
                    let u = uncast(g, inp);
                    if g.is_top(u) || u == n {
                        continue;
                    }
                    let to = self.ptnode(inp).unwrap_or(self.phantom);
                    self.add_edge(phi, to);
                }
            }
            Opcode::Proj => {
                if let Some(call) = g.input(n, 0) {
                    self.add_local_var_and_edge(c, n, EscapeState::NoEscape, call, None);
                }
            }
            Opcode::Return => {
                if let Some(val) = g.input(n, slot::PARMS) {
                    self.add_local_var_and_edge(c, n, EscapeState::GlobalEscape, val, None);
                }
            }
            Opcode::CompareAndExchange | Opcode::GetAndSet => {
                self.add_objload_to_connection_graph(c, n, None);
                self.add_final_edges_unsafe_access(c, n);
            }
            Opcode::Store | Opcode::CompareAndSwap | Opcode::WeakCompareAndSwap => {
                self.add_final_edges_unsafe_access(c, n);
            }
            op => debug_assert!(false, "unexpected delayed node {n} ({op:?})"),
        }
    }

    /// Register the pointer value `n` as a local pointing to whatever `to` points to.
    ///
    /// With `delayed`, this is the first pass: the edge is added later if `to` is not
    /// registered yet. Without it, an unregistered `to` stands for an unknown object.
    pub fn add_local_var_and_edge(
        &mut self,
        _c: &Compile,
        n: Node,
        es: EscapeState,
        to: Node,
        delayed: Option<&mut Vec<Node>>,
    ) {
        let to_ptn = self.ptnode(to);
        let local = match delayed {
            Some(delayed) => {
                let local = self.add_local_var(n, es);
                if to_ptn.is_none() {
                    delayed.push(n);
                    return;
                }
                local
            }
            None => match self.ptnode(n) {
                Some(p) => p,
                None => self.add_local_var(n, es),
            },
        };
        let to_ptn = to_ptn.unwrap_or(self.phantom);
        self.add_edge(local, to_ptn);
    }

    /// Register a pointer load (or the result of an atomic exchange) `n`: a local pointing to
    /// whatever the field it reads holds.
    pub fn add_objload_to_connection_graph(
        &mut self,
        c: &Compile,
        n: Node,
        delayed: Option<&mut Vec<Node>>,
    ) {
        let g = &c.graph;
        if g.ty(n).make_ptr().is_none() {
            return;
        }
        if let Some(adr) = g.input(n, slot::mem::ADDRESS) {
            self.add_local_var_and_edge(c, n, EscapeState::NoEscape, adr, delayed);
        }
    }

    /// First pass over a pointer store or atomic `n`. Returns whether `n` is handled.
    pub fn add_to_congraph_unsafe_access(
        &mut self,
        c: &Compile,
        n: Node,
        delayed: Option<&mut Vec<Node>>,
    ) -> bool {
        let g = &c.graph;
        let Some(adr) = g.input(n, slot::mem::ADDRESS) else {
            return false;
        };
        let Some(adr_type) = g.ty(adr).make_ptr() else {
            // Dead.
            return false;
        };
        let is_store = g.op(n) == Opcode::Store;
        let captured = is_store
            && adr_type.is_raw()
            && adr_type.null == PtrNull::NotNull
            && g.op(adr) == Opcode::AddP
            && is_captured_store_address(g, adr);
        if adr_type.is_oopptr() || captured {
            if let Some(d) = delayed {
                d.push(n);
            }
            return true;
        }
        if g.op(adr) == Opcode::BoxLock {
            // The displaced header stored into a lock slot.
            return true;
        }
        if is_store && adr_type.is_raw() {
            // A pointer stored to raw memory escapes.
            if let Some(d) = delayed {
                d.push(n);
            }
            return true;
        }
        false
    }

    /// Second pass over a pointer store or atomic `n`: the field now points to the value.
    /// Returns whether `n` is handled.
    pub fn add_final_edges_unsafe_access(&mut self, c: &Compile, n: Node) -> bool {
        let g = &c.graph;
        let (Some(adr), Some(val)) = (g.input(n, slot::mem::ADDRESS), g.input(n, slot::mem::VALUE)) else {
            return false;
        };
        let Some(adr_type) = g.ty(adr).make_ptr() else {
            debug_assert!(false, "dead node {n} should not be queued");
            return true;
        };
        let is_store = g.op(n) == Opcode::Store;
        let captured = is_store
            && adr_type.is_raw()
            && adr_type.null == PtrNull::NotNull
            && g.op(adr) == Opcode::AddP
            && is_captured_store_address(g, adr);
        let val_ptn = self.ptnode(val).unwrap_or(self.phantom);
        if adr_type.is_oopptr() || captured {
            match self.ptnode(adr) {
                Some(f) if self.nodes[f].is_field() && self.nodes[f].is_oop() => {
                    self.add_edge(f, val_ptn);
                }
                _ => {
                    // The layout does not say this is a reference field: the value is stored
                    // where the analysis cannot follow it.
                    self.set_escape_state(val_ptn, EscapeState::GlobalEscape, "stored at unknown address");
                }
            }
            return true;
        }
        if is_store && adr_type.is_raw() {
            self.set_escape_state(val_ptn, EscapeState::GlobalEscape, "stored at raw address");
            if let Some(f) = self.ptnode(adr).filter(|&f| self.nodes[f].is_field() && self.nodes[f].is_oop()) {
                self.add_edge(f, val_ptn);
            }
            return true;
        }
        false
    }

    /// Register the call `call`, which returns a pointer.
    fn add_call_node(&mut self, c: &Compile, call: Node) {
        let g = &c.graph;
        match g.info(call) {
            NodeInfo::Alloc(a) => {
                let flags = c.klasses.flags(a.klass);
                let mut es = EscapeState::NoEscape;
                let mut nsr: Option<&str> = None;
                if flags.intersects(
                    KlassFlags::HAS_FINALIZER | KlassFlags::IS_REFERENCE | KlassFlags::NOT_INSTANTIABLE,
                ) {
                    es = EscapeState::GlobalEscape;
                } else if g.op(call) == Opcode::AllocateArray {
                    let len = g
                        .input(call, slot::alloc::LENGTH)
                        .and_then(|l| g.find_int_con(l));
                    match len {
                        Some(l) if l < 0 => nsr = Some("has a negative length"),
                        None => nsr = Some("has a non-constant length"),
                        Some(l) if l > i64::from(c.flags().eliminate_allocation_array_size_limit()) => {
                            nsr = Some("has a length that is too big")
                        }
                        _ => {}
                    }
                } else {
                    let nfields = c.klasses.nonstatic_fields(a.klass).len();
                    if nfields > c.flags().eliminate_allocation_fields_limit() as usize {
                        nsr = Some("has too many fields");
                    }
                }
                let p = self.add_java_object(call, es);
                self.nodes[p].flags.insert(PtFlags::ALLOCATION);
                if let Some(reason) = nsr {
                    self.set_not_scalar_replaceable(p, reason);
                }
            }
            NodeInfo::Call(ci) if g.op(call) == Opcode::CallStaticJava => {
                if ci.boxing && c.flags().eliminate_autobox() {
                    // Floating point boxes are always fresh; the others may come from a cache.
                    let fresh = matches!(ci.params.first(), Some(BasicType::Float | BasicType::Double));
                    if fresh {
                        self.add_java_object(call, EscapeState::NoEscape);
                    } else {
                        let p = self.add_java_object(call, EscapeState::GlobalEscape);
                        self.set_not_scalar_replaceable(p, "object can be loaded from boxing cache");
                    }
                    return;
                }
                let Some(summary) = &ci.summary else {
                    self.map_ideal_node(call, self.phantom);
                    return;
                };
                if summary.return_allocated {
                    // A fresh object that did not escape the callee; what its fields point to
                    // stays local as well.
                    let p = self.add_java_object(call, EscapeState::NoEscape);
                    self.set_not_scalar_replaceable(p, "is result of call");
                    return;
                }
                let returns_arg = ci.params.iter().enumerate().any(|(k, bt)| {
                    bt.is_reference()
                        && summary
                            .args
                            .get(k)
                            .is_some_and(|a| a.contains(ArgSummary::RETURNED))
                });
                if returns_arg {
                    self.add_local_var(call, EscapeState::ArgEscape);
                } else {
                    self.map_ideal_node(call, self.phantom);
                }
            }
            _ => {
                // Nothing is known about what other calls return.
                self.map_ideal_node(call, self.phantom);
            }
        }
    }

    /// Is argument `i` of `call` a pointer, by declaration if the call has one?
    fn is_ptr_arg(g: &Graph, call: Node, i: usize, oop_only: bool) -> bool {
        let declared = match g.info(call) {
            NodeInfo::Call(ci) if !ci.params.is_empty() => {
                ci.params.get(i - slot::PARMS).map(|bt| bt.is_reference())
            }
            _ => None,
        };
        let actual = g.input(call, i).is_some_and(|a| {
            let t = g.ty(a);
            if oop_only {
                t.isa_oopptr().is_some()
            } else {
                t.isa_ptr().is_some()
            }
        });
        declared.unwrap_or(true) && actual
    }

    /// Number of arguments of `call`.
    fn arg_end(g: &Graph, call: Node) -> usize {
        match g.info(call) {
            NodeInfo::Call(ci) if !ci.params.is_empty() => (slot::PARMS + ci.params.len()).min(g.req(call)),
            NodeInfo::ArrayCopy(_) => slot::arraycopy::LENGTH + 1,
            NodeInfo::Call(ci) if ci.jvms.is_some() => ci
                .jvms
                .as_ref()
                .map_or(g.req(call), |j| j.debug_start().min(g.req(call))),
            _ => g.req(call),
        }
    }

    /// The connection graph node of the object `arg` (or the address inside it) refers to.
    fn arg_ptnode(&self, g: &Graph, arg: Node) -> Option<PtIdx> {
        let arg = if g.op(arg) == Opcode::AddP {
            get_addp_base(g, arg)
        } else {
            arg
        };
        self.ptnode(arg)
    }

    /// Apply what `call` does to its arguments.
    fn process_call_arguments(&mut self, c: &Compile, call: Node) {
        let g = &c.graph;
        let op = g.op(call);
        debug_assert!(
            !op.is_allocate() && !op.is_abstract_lock(),
            "{call} is handled when registered"
        );
        let stub = matches!(g.info(call), NodeInfo::Call(ci) if ci.arraycopy_stub);
        let end = Self::arg_end(g, call);
        match op {
            Opcode::ArrayCopy | Opcode::CallLeaf | Opcode::CallLeafNoFP => {
                // Runtime stubs do not let objects escape, but the objects are not scalar
                // replaceable either.
                let is_arraycopy = op == Opcode::ArrayCopy || stub;
                let validated = op == Opcode::ArrayCopy
                    && (arraycopy::is_clonebasic(g, call)
                        || arraycopy::is_arraycopy_validated(g, call)
                        || arraycopy::is_copyof_validated(g, call)
                        || arraycopy::is_copyofrange_validated(g, call));
                let mut src_has_oops = false;
                for i in slot::PARMS..end {
                    let Some(arg) = g.input(call, i) else {
                        continue;
                    };
                    if g.is_top(arg) || !Self::is_ptr_arg(g, call, i, false) {
                        continue;
                    }
                    let Some(arg_ptn) = self.arg_ptnode(g, arg) else {
                        continue;
                    };
                    let arg_es = self.nodes[arg_ptn].es;
                    if !is_arraycopy && arg_es >= EscapeState::ArgEscape {
                        continue;
                    }
                    let has_oops = g.ty(arg).isa_oopptr().is_some_and(|t| {
                        t.is_instptr() || t.elem.is_none_or(|e| e.is_reference())
                    });
                    if i == slot::PARMS {
                        src_has_oops = has_oops;
                    }
                    // Copies between a primitive array and an Object typed value get no edges.
                    let is_dest = src_has_oops && is_arraycopy && has_oops && i > slot::PARMS;
                    debug_assert!(
                        is_arraycopy
                            || is_known_leaf_stub(g, call)
                            || c.barrier_set().c2().is_gc_barrier_node(c, call),
                        "unexpected leaf call {call} with a pointer argument"
                    );
                    if arg_es >= EscapeState::ArgEscape && !is_dest {
                        continue;
                    }
                    let es = if validated {
                        EscapeState::NoEscape
                    } else {
                        EscapeState::ArgEscape
                    };
                    self.set_escape_state(arg_ptn, es, "argument of a runtime stub");
                    if is_dest {
                        let src_ptn = g
                            .input(call, slot::PARMS)
                            .and_then(|src| self.arg_ptnode(g, src));
                        if let Some(src_ptn) = src_ptn.filter(|&s| s != arg_ptn) {
                            self.add_arraycopy(call, es, src_ptn, arg_ptn);
                        }
                    }
                }
            }
            Opcode::CallStaticJava => {
                let NodeInfo::Call(ci) = g.info(call) else {
                    return;
                };
                if ci.boxing && c.flags().eliminate_autobox() {
                    // Boxing methods do not touch any object.
                    return;
                }
                match &ci.summary {
                    Some(summary) => {
                        let call_ptn = self.ptnode(call).filter(|&p| p != self.phantom);
                        for i in slot::PARMS..end {
                            let k = i - slot::PARMS;
                            let Some(arg) = g.input(call, i) else {
                                continue;
                            };
                            let arg_summary = summary.args.get(k).copied().unwrap_or_default();
                            let Some(arg_ptn) = self.ptnode(arg) else {
                                continue;
                            };
                            if Self::is_ptr_arg(g, call, i, false)
                                && arg_summary.contains(ArgSummary::RETURNED)
                            {
                                if let Some(cp) = call_ptn.filter(|&p| self.nodes[p].is_local_var()) {
                                    self.add_edge(cp, arg_ptn);
                                }
                            }
                            if Self::is_ptr_arg(g, call, i, true)
                                && self.nodes[arg_ptn].es < EscapeState::GlobalEscape
                            {
                                if !arg_summary.contains(ArgSummary::STACK) {
                                    self.set_escape_state(arg_ptn, EscapeState::GlobalEscape, "escapes in callee");
                                } else {
                                    self.set_escape_state(arg_ptn, EscapeState::ArgEscape, "argument of callee");
                                    if !arg_summary.contains(ArgSummary::LOCAL) {
                                        self.set_fields_escape_state(
                                            arg_ptn,
                                            EscapeState::GlobalEscape,
                                            "fields escape in callee",
                                        );
                                    }
                                }
                            }
                        }
                        if let Some(cp) = call_ptn.filter(|&p| self.nodes[p].is_local_var()) {
                            if !summary.return_local {
                                // May also return an unknown object.
                                self.add_edge(cp, self.phantom);
                            }
                        }
                    }
                    None => self.arguments_escape(c, call, end),
                }
            }
            _ => self.arguments_escape(c, call, end),
        }
    }

    /// Nothing is known about `call`: every object argument escapes.
    fn arguments_escape(&mut self, c: &Compile, call: Node, end: usize) {
        let g = &c.graph;
        for i in slot::PARMS..end {
            if !Self::is_ptr_arg(g, call, i, true) {
                continue;
            }
            let Some(arg) = g.input(call, i) else {
                continue;
            };
            if let Some(p) = self.arg_ptnode(g, arg) {
                self.set_escape_state(p, EscapeState::GlobalEscape, "argument of unknown call");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{KlassTable, Type};
    use crate::kit::GraphKit;
    use crate::settings::{Flags, GcKind, builder};

    fn compile() -> (Compile, crate::ir::Klass) {
        let mut kt = KlassTable::new(true);
        let holder = kt.define_instance(
            "Holder",
            None,
            &[("f", BasicType::Object), ("i", BasicType::Int)],
            KlassFlags::empty(),
        );
        let mut b = builder();
        b.gc(GcKind::NoOp);
        (Compile::new(Flags::new(b), kt), holder)
    }

    fn build(c: &Compile) -> ConnectionGraph {
        let mut cg = ConnectionGraph::new(c, 0);
        let mut delayed = Vec::new();
        let nodes: Vec<Node> = c.graph.live_node_iter().collect();
        for n in nodes {
            cg.add_node_to_connection_graph(c, n, &mut delayed);
        }
        while let Some(n) = delayed.pop() {
            cg.add_final_edges(c, n);
        }
        cg
    }

    #[test]
    fn sentinels() {
        let (c, _) = compile();
        let cg = ConnectionGraph::new(&c, 0);
        assert_eq!(cg[cg.phantom_obj()].es, EscapeState::GlobalEscape);
        assert_eq!(cg[cg.null_obj()].es, EscapeState::NoEscape);
        assert!(!cg[cg.null_obj()].scalar_replaceable());
        assert_eq!(cg.len(), 2);
    }

    #[test]
    fn null_constant_maps_to_null_object() {
        let (c, _) = compile();
        let cg = ConnectionGraph::new(&c, 0);
        let null = c.graph.find_ptr_con(&TypePtr::null_ptr()).unwrap();
        assert_eq!(cg.ptnode(null), Some(cg.null_obj()));
        assert_eq!(cg[cg.null_obj()].node, null);
    }

    #[test]
    fn field_store_links_field_to_value() {
        let (mut c, holder) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(holder);
        let v = kit.new_instance(holder);
        let st = kit.store_field(h, "f", v);
        let i = kit.c.graph.intcon(1);
        let st_i = kit.store_field(h, "i", i);
        kit.return_value(None);
        let cg = build(&c);
        let g = &c.graph;
        let adr = g.input(st, slot::mem::ADDRESS).unwrap();
        let field = cg.ptnode(adr).unwrap();
        assert!(cg[field].is_field() && cg[field].is_oop());
        assert_eq!(cg[field].offset, Offset::Known(12));
        let base = cg[field].bases[0];
        assert_eq!(cg[base].node, h);
        // The stored value is the narrow encoding of `v`.
        let val = g.input(st, slot::mem::VALUE).unwrap();
        assert!(cg[field].has_edge(cg.ptnode(val).unwrap()));
        let int_field = cg.ptnode(g.input(st_i, slot::mem::ADDRESS).unwrap()).unwrap();
        assert!(!cg[int_field].is_oop());
        assert!(cg[int_field].edges.is_empty());
    }

    #[test]
    fn parameters_and_unknown_calls() {
        let (mut c, holder) = compile();
        let mut kit = GraphKit::new(&mut c);
        let ty = Type::Ptr(TypePtr::inst(holder, false, PtrNull::Maybe));
        let p = kit.parameter(0, ty.clone());
        let obj = kit.new_instance(holder);
        let call = kit.call_static("sink", &[obj], None, None, &[]);
        kit.return_value(None);
        let cg = build(&c);
        assert_eq!(cg.ptnode(p), Some(cg.phantom_obj()));
        let alloc = c.graph.ideal_allocation(obj).unwrap();
        assert_eq!(cg[cg.ptnode(alloc).unwrap()].es, EscapeState::NoEscape);
        // Escape through the call is recorded on the cast, not yet propagated.
        assert_eq!(cg.escape_state(obj), Some(EscapeState::GlobalEscape));
        assert_eq!(cg.ptnode(call), None);
    }

    #[test]
    fn finalizable_and_large_allocations() {
        let mut kt = KlassTable::new(true);
        let fin = kt.define_instance("Fin", None, &[], KlassFlags::HAS_FINALIZER);
        let mut c = Compile::new(Flags::new(builder()), kt);
        let mut kit = GraphKit::new(&mut c);
        let f = kit.new_instance(fin);
        let len = kit.c.graph.intcon(1000);
        let big = kit.new_array(BasicType::Int, len);
        let n = kit.parameter(0, Type::Int(None));
        let var = kit.new_array(BasicType::Int, n);
        kit.return_value(None);
        let cg = build(&c);
        let g = &c.graph;
        let pt = |o: Node| &cg[cg.ptnode(g.ideal_allocation(o).unwrap()).unwrap()];
        assert_eq!(pt(f).es, EscapeState::GlobalEscape);
        assert!(!pt(f).scalar_replaceable());
        assert_eq!(pt(big).es, EscapeState::NoEscape);
        assert!(!pt(big).scalar_replaceable());
        assert!(!pt(var).scalar_replaceable());
    }

    #[test]
    fn boxing_results() {
        let mut kt = KlassTable::new(true);
        let integer = kt.define_instance("Integer", None, &[("value", BasicType::Int)], KlassFlags::IS_BOX);
        let dbl = kt.define_instance("Double", None, &[("value", BasicType::Double)], KlassFlags::IS_BOX);
        let mut c = Compile::new(Flags::new(builder()), kt);
        let mut kit = GraphKit::new(&mut c);
        let i = kit.parameter(0, Type::Int(None));
        let d = kit.parameter(1, Type::Double);
        let bi = kit.box_value(integer, i, &[]);
        let bd = kit.box_value(dbl, d, &[]);
        kit.return_value(None);
        let cg = build(&c);
        let g = &c.graph;
        let call_of = |proj: Node| g.input(proj, 0).unwrap();
        assert_eq!(cg.escape_state(call_of(bi)), Some(EscapeState::GlobalEscape));
        assert_eq!(cg.escape_state(call_of(bd)), Some(EscapeState::NoEscape));
        assert!(cg[cg.ptnode(call_of(bd)).unwrap()].scalar_replaceable());
    }

    #[test]
    fn addp_base_through_raw_chain() {
        let (mut c, holder) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(holder);
        let top = kit.c.graph.top();
        let raw = kit.basic_plus_adr(top, h, 12);
        let raw2 = kit.basic_plus_adr(top, raw, 4);
        assert_eq!(get_addp_base(&c.graph, raw2), h);
        assert_eq!(uncast(&c.graph, h), c.graph.input(h, 1).unwrap());
    }

    #[test]
    fn known_leaf_stub_argument_escapes_to_the_call() {
        let (mut c, holder) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(holder);
        kit.make_leaf_call("updateBytesCRC32C", &[h]);
        kit.return_value(None);
        let cg = build(&c);
        assert_eq!(cg.escape_state(h), Some(EscapeState::ArgEscape));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unexpected leaf call")]
    fn unknown_leaf_stub_is_rejected() {
        let (mut c, holder) = compile();
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(holder);
        kit.make_leaf_call("mystery_stub", &[h]);
        kit.return_value(None);
        build(&c);
    }
}
