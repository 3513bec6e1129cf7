//! Building IR in program order.
//!
//! [`GraphKit`] plays the role of a bytecode parser's state: it tracks the current control,
//! I/O and memory, and appends nodes after them. Memory is tracked per alias class so that a
//! store only changes its own slice; a `MergeMem` is materialized when a node needs all of
//! memory (calls, barriers, safepoints, returns).
//!
//! Every heap access made through the `access_*` methods is routed to the active barrier
//! policy.

use crate::barrier::{C2Access, C2AtomicAccess, Decorators};
use crate::compile::Compile;
use crate::entity::SecondaryMap;
use crate::entity::packed_option::PackedOption;
use crate::ir::klass::{ARRAY_BASE_OFFSET, ARRAY_LENGTH_OFFSET};
use crate::ir::{
    AliasIdx, AllocInfo, ArrayCopyInfo, BasicType, BoolTest, CallInfo, CallSummary, JvmState,
    Klass, LockInfo, MemBarInfo, MemInfo, MemOrder, Node, NodeInfo, Offset, Opcode, PhiInfo,
    PtrNull, Type, TypePtr, slot,
};
use crate::arraycopy::ArrayCopyKind;
use crate::trace;
use smallvec::SmallVec;

/// Memory state split by alias class.
#[derive(Clone, Debug)]
pub struct MemState {
    base: Node,
    slices: SecondaryMap<AliasIdx, PackedOption<Node>>,
}

impl MemState {
    /// All of memory in state `base`.
    pub fn new(base: Node) -> Self {
        Self {
            base,
            slices: SecondaryMap::new(),
        }
    }

    /// State of every slice without an entry of its own.
    pub fn base(&self) -> Node {
        self.base
    }

    /// State of slice `idx`.
    pub fn at(&self, idx: AliasIdx) -> Node {
        if idx == AliasIdx::BOT {
            return self.base;
        }
        self.slices[idx].expand().unwrap_or(self.base)
    }

    /// Set slice `idx`. Setting [`AliasIdx::BOT`] replaces all of memory.
    pub fn set(&mut self, idx: AliasIdx, mem: Node) {
        if idx == AliasIdx::BOT {
            self.base = mem;
            self.slices.clear();
        } else {
            self.slices[idx] = mem.into();
        }
    }

    /// Slices with an entry of their own.
    pub fn slices(&self) -> impl Iterator<Item = (AliasIdx, Node)> + '_ {
        self.slices
            .iter()
            .filter_map(|(idx, m)| m.expand().map(|m| (idx, m)))
    }
}

/// Snapshot of the parser state at one program point.
#[derive(Clone, Debug)]
pub struct KitState {
    /// Control.
    pub ctrl: Node,
    /// I/O.
    pub io: Node,
    /// Memory.
    pub mem: MemState,
}

/// Appends nodes to the graph of a [`Compile`] at the current program point.
pub struct GraphKit<'c> {
    /// The compilation being built.
    pub c: &'c mut Compile,
    state: KitState,
}

impl<'c> GraphKit<'c> {
    /// A kit positioned at method entry.
    pub fn new(c: &'c mut Compile) -> Self {
        let start = c.graph.start();
        let ctrl = c.graph.make_proj(start, slot::CONTROL, Type::Control);
        let io = c.graph.make_proj(start, slot::I_O, Type::Io);
        let mem = c.graph.make_proj(start, slot::MEMORY, Type::Memory);
        Self {
            c,
            state: KitState {
                ctrl,
                io,
                mem: MemState::new(mem),
            },
        }
    }

    /// A kit positioned after `ctrl`, with memory state `mem` (a `MergeMem` is unpacked).
    pub fn at(c: &'c mut Compile, ctrl: Node, io: Node, mem: Node) -> Self {
        let mut kit = Self {
            c,
            state: KitState {
                ctrl,
                io,
                mem: MemState::new(mem),
            },
        };
        kit.set_all_memory(mem);
        kit
    }

    /// Current state.
    pub fn state(&self) -> KitState {
        self.state.clone()
    }

    /// Continue from `state`.
    pub fn set_state(&mut self, state: KitState) {
        self.state = state;
    }

    /// Current control.
    pub fn control(&self) -> Node {
        self.state.ctrl
    }

    /// Move control.
    pub fn set_control(&mut self, ctrl: Node) {
        self.state.ctrl = ctrl;
    }

    /// Current I/O state.
    pub fn i_o(&self) -> Node {
        self.state.io
    }

    /// Current state of slice `idx`.
    pub fn memory(&self, idx: AliasIdx) -> Node {
        self.state.mem.at(idx)
    }

    /// Current state of the slice `tp` belongs to.
    pub fn memory_for(&mut self, tp: &TypePtr) -> Node {
        let idx = self.c.alias_index(tp);
        self.memory(idx)
    }

    /// Set the state of slice `idx`.
    pub fn set_memory(&mut self, idx: AliasIdx, mem: Node) {
        self.state.mem.set(idx, mem);
    }

    /// All of memory as one node: the base state, or a `MergeMem` when slices differ.
    pub fn merged_memory(&mut self) -> Node {
        let slices: SmallVec<[(AliasIdx, Node); 8]> = self.state.mem.slices().collect();
        if slices.is_empty() {
            return self.state.mem.base();
        }
        let mm = self.c.graph.merge_mem(self.state.mem.base());
        for (idx, m) in slices {
            self.c.graph.set_memory_at(mm, idx, m);
        }
        mm
    }

    /// Replace all of memory. A `MergeMem` is unpacked into slices.
    pub fn set_all_memory(&mut self, mem: Node) {
        if self.c.graph.op(mem) == Opcode::MergeMem {
            let base = self.c.graph.base_memory(mem);
            self.state.mem = MemState::new(base);
            for (idx, m) in self.c.graph.memory_slices(mem) {
                self.state.mem.set(idx, m);
            }
        } else {
            self.state.mem = MemState::new(mem);
        }
    }

    /// The `i`th incoming argument of the method.
    pub fn parameter(&mut self, i: usize, ty: Type) -> Node {
        let start = self.c.graph.start();
        let con = slot::PARMS + i;
        if let Some(p) = self.c.graph.proj_out(start, con) {
            return p;
        }
        self.c
            .graph
            .add(Opcode::Parm, &[Some(start)], ty, NodeInfo::Proj(con))
    }

    /// `ptr + offset` inside the object `base`. A top `base` makes a raw address.
    pub fn basic_plus_adr(&mut self, base: Node, ptr: Node, offset: i64) -> Node {
        let off = self.c.graph.intptrcon(offset);
        self.addp(base, ptr, off)
    }

    /// `ptr + offset` inside the object `base`.
    pub fn addp(&mut self, base: Node, ptr: Node, offset: Node) -> Node {
        let g = &mut self.c.graph;
        let delta = g.find_int_con(offset);
        let ty = match g.ty(ptr).make_ptr() {
            Some(tp) => match delta {
                Some(d) => tp.add_offset(d as i32),
                None => tp.with_offset(Offset::Bot),
            },
            None => TypePtr::raw(PtrNull::NotNull, Offset::Bot),
        };
        g.add(
            Opcode::AddP,
            &[None, Some(base), Some(ptr), Some(offset)],
            Type::Ptr(ty),
            NodeInfo::None,
        )
    }

    /// Address of element `idx` of array `ary` holding `elem` values.
    pub fn array_element_address(&mut self, ary: Node, idx: Node, elem: BasicType) -> Node {
        let esize = elem.size_in_bytes(self.c.klasses.compressed_oops());
        if let Some(i) = self.c.graph.find_int_con(idx) {
            return self.basic_plus_adr(ary, ary, ARRAY_BASE_OFFSET as i64 + i * esize as i64);
        }
        let g = &mut self.c.graph;
        let top = g.top();
        let wide = g.add_simple(Opcode::ConvI2L, &[top, idx], Type::Long(None));
        let shift = g.intcon(esize.trailing_zeros() as i32);
        let scaled = g.add_simple(Opcode::LShiftL, &[top, wide, shift], Type::Long(None));
        let inner = self.addp(ary, ary, scaled);
        self.basic_plus_adr(ary, inner, ARRAY_BASE_OFFSET as i64)
    }

    pub(crate) fn is_narrow_access(&self, adr: Node, bt: BasicType) -> bool {
        bt.is_reference()
            && self.c.klasses.compressed_oops()
            && self
                .c
                .graph
                .ty(adr)
                .isa_ptr()
                .is_some_and(|tp| !tp.is_raw())
    }

    /// A load of `info.bt` from `adr`, typed `ty`. Compressed references are decoded.
    pub fn make_load(&mut self, ctl: Option<Node>, adr: Node, ty: Type, info: MemInfo) -> Node {
        let adr_type = self
            .c
            .graph
            .ty(adr)
            .isa_ptr()
            .cloned()
            .unwrap_or_else(TypePtr::bottom);
        let mem = self.memory_for(&adr_type);
        let narrow = self.is_narrow_access(adr, info.bt);
        let g = &mut self.c.graph;
        if narrow {
            let tp = ty.make_ptr().cloned().unwrap_or_else(TypePtr::bottom);
            let info = MemInfo {
                bt: BasicType::NarrowOop,
                ..info
            };
            let ld = g.add(
                Opcode::Load,
                &[ctl, Some(mem), Some(adr)],
                Type::NarrowOop(tp),
                NodeInfo::Mem(info),
            );
            let top = g.top();
            g.add_simple(Opcode::DecodeN, &[top, ld], ty)
        } else {
            g.add(
                Opcode::Load,
                &[ctl, Some(mem), Some(adr)],
                ty,
                NodeInfo::Mem(info),
            )
        }
    }

    /// A store of `val` to `adr`. Compressed references are encoded first.
    pub fn store_to_memory(&mut self, ctl: Option<Node>, adr: Node, val: Node, info: MemInfo) -> Node {
        let adr_type = self
            .c
            .graph
            .ty(adr)
            .isa_ptr()
            .cloned()
            .unwrap_or_else(TypePtr::bottom);
        let idx = self.c.alias_index(&adr_type);
        let mem = self.memory(idx);
        let narrow = self.is_narrow_access(adr, info.bt);
        let capture = self.capturing_initialization(ctl, adr, mem, &info);
        let g = &mut self.c.graph;
        let (val, info) = if narrow {
            let tp = g.ty(val).make_ptr().cloned().unwrap_or_else(TypePtr::null_ptr);
            let top = g.top();
            let enc = g.add_simple(Opcode::EncodeP, &[top, val], Type::NarrowOop(tp));
            (
                enc,
                MemInfo {
                    bt: BasicType::NarrowOop,
                    ..info
                },
            )
        } else {
            (val, info)
        };
        if let Some((init, offset)) = capture {
            return self.capture_store(init, offset, val, info);
        }
        let g = &mut self.c.graph;
        let st = g.add(
            Opcode::Store,
            &[ctl, Some(mem), Some(adr), Some(val)],
            Type::Memory,
            NodeInfo::Mem(info),
        );
        self.set_memory(idx, st);
        st
    }

    /// The initialization of the object allocated last and the field offset, if a store to
    /// `adr` at memory state `mem` can become part of it: nothing but stores to other fields
    /// happened since the allocation and nothing read the new object yet.
    fn capturing_initialization(
        &self,
        ctl: Option<Node>,
        adr: Node,
        mem: Node,
        info: &MemInfo,
    ) -> Option<(Node, i32)> {
        let g = &self.c.graph;
        let (init_ctrl, obj) = self.c.recent_alloc()?;
        if ctl != Some(init_ctrl) || self.control() != init_ctrl {
            return None;
        }
        if info.order != MemOrder::Unordered || info.mismatched || info.unsafe_access {
            return None;
        }
        if g.op(adr) != Opcode::AddP || g.input(adr, slot::addp::BASE) != Some(obj) {
            return None;
        }
        let offset = g
            .ty(adr)
            .isa_ptr()
            .filter(|tp| tp.is_instptr())
            .and_then(|tp| tp.offset.known())?;
        let init = g.input(init_ctrl, 0).filter(|&i| g.op(i) == Opcode::Initialize)?;
        if g.op(mem) != Opcode::Proj || g.input(mem, 0) != Some(init) {
            return None;
        }
        let read = g
            .outs(mem)
            .iter()
            .any(|&u| g.op(u) == Opcode::Load || g.op(u).is_load_store());
        if read || g.find_captured_store(init, offset).is_some() {
            return None;
        }
        Some((init, offset))
    }

    /// Hang the store of `val` at byte `offset` of the new object off its initialization. The
    /// store writes raw memory straight after the allocation; the field's slice keeps the
    /// initialization's state.
    fn capture_store(&mut self, init: Node, offset: i32, val: Node, info: MemInfo) -> Node {
        let g = &self.c.graph;
        let top = g.top();
        let alloc_ctl = g.input(init, slot::CONTROL);
        let zero_mem = g.input(init, slot::MEMORY).map(|mm| g.base_memory(mm));
        let rawoop = g.input(init, slot::init::RAW_ADDRESS).unwrap_or(top);
        let adr = self.basic_plus_adr(top, rawoop, i64::from(offset));
        let g = &mut self.c.graph;
        let st = g.add(
            Opcode::Store,
            &[alloc_ctl, zero_mem, Some(adr), Some(val)],
            Type::Memory,
            NodeInfo::Mem(info),
        );
        g.add_req(init, Some(st));
        trace!("store {} captured by {}", st, init);
        st
    }

    /// The object allocated at `ctl` by the most recent allocation, if there was no safepoint in
    /// between.
    pub fn just_allocated_object(&self, ctl: Node) -> Option<Node> {
        let g = &self.c.graph;
        let mut ctl = ctl;
        // Skip a degenerate region left over from an inlined constructor.
        if g.op(ctl) == Opcode::Region && g.req(ctl) == 2 {
            if let Some(c) = g.input(ctl, 1) {
                ctl = c;
            }
        }
        match self.c.recent_alloc() {
            Some((c, obj)) if c == ctl => Some(obj),
            _ => None,
        }
    }

    fn jvms(&self, req: usize) -> JvmState {
        JvmState {
            method: String::from("m"),
            bci: 0,
            locoff: req,
            monoff: req,
            scloff: req,
            endoff: req,
        }
    }

    fn call_prologue(&mut self) -> SmallVec<[Option<Node>; 8]> {
        let mem = self.merged_memory();
        let top = self.c.graph.top();
        let mut ins = SmallVec::new();
        ins.push(Some(self.control()));
        ins.push(Some(self.i_o()));
        ins.push(Some(mem));
        ins.push(Some(top));
        ins.push(Some(top));
        ins
    }

    fn call_epilogue(&mut self, call: Node, io: bool) {
        let g = &mut self.c.graph;
        let ctrl = g.make_proj(call, slot::CONTROL, Type::Control);
        let mem = g.make_proj(call, slot::MEMORY, Type::Memory);
        if io {
            let io = g.make_proj(call, slot::I_O, Type::Io);
            self.state.io = io;
        }
        self.set_control(ctrl);
        self.set_all_memory(mem);
    }

    fn debug_jvms(&mut self, n: Node, debug: &[Node]) {
        let start = self.c.graph.req(n);
        for &d in debug {
            self.c.graph.add_req(n, Some(d));
        }
        let end = self.c.graph.req(n);
        if let Some(j) = self.c.graph.data_mut(n).jvms_mut() {
            j.locoff = start;
            j.monoff = end;
            j.scloff = end;
            j.endoff = end;
        }
    }

    /// Allocate an instance of `klass`. Returns the new object.
    pub fn new_instance(&mut self, klass: Klass) -> Node {
        let size = i64::from(self.c.klasses.instance_size(klass));
        let size = self.c.graph.intptrcon(size);
        let ty = TypePtr::inst(klass, true, PtrNull::NotNull);
        self.allocate(Opcode::Allocate, klass, size, None, ty)
    }

    /// Allocate an array of `length` elements of `elem`. Returns the new array.
    pub fn new_array(&mut self, elem: BasicType, length: Node) -> Node {
        let klass = self.c.klasses.array_of(elem);
        let len = self.c.graph.find_int_con(length).map(|l| l as i32);
        let size = match len {
            Some(l) => {
                let s = i64::from(self.c.klasses.array_size(klass, l));
                self.c.graph.intptrcon(s)
            }
            None => {
                let esize = elem.size_in_bytes(self.c.klasses.compressed_oops());
                let g = &mut self.c.graph;
                let top = g.top();
                let wide = g.add_simple(Opcode::ConvI2L, &[top, length], Type::Long(None));
                let shift = g.intcon(esize.trailing_zeros() as i32);
                let bytes = g.add_simple(Opcode::LShiftL, &[top, wide, shift], Type::Long(None));
                let header = g.longcon(i64::from(ARRAY_BASE_OFFSET));
                g.add_simple(Opcode::AddL, &[top, bytes, header], Type::Long(None))
            }
        };
        let elem = if elem == BasicType::Array {
            BasicType::Object
        } else {
            elem
        };
        let ty = TypePtr::ary(klass, elem, len, true, PtrNull::NotNull);
        self.allocate(Opcode::AllocateArray, klass, size, Some(length), ty)
    }

    fn allocate(
        &mut self,
        op: Opcode,
        klass: Klass,
        size: Node,
        length: Option<Node>,
        oop_type: TypePtr,
    ) -> Node {
        let mut ins = self.call_prologue();
        let klass_node = self.c.graph.makecon(TypePtr::klass_ptr(klass));
        let top = self.c.graph.top();
        ins.push(Some(size));
        ins.push(Some(klass_node));
        ins.push(Some(top));
        if let Some(l) = length {
            ins.push(Some(l));
        }
        let info = AllocInfo {
            jvms: self.jvms(ins.len()),
            klass,
            is_scalar_replaceable: false,
            is_non_escaping: false,
            has_eliminated_locks: false,
        };
        let g = &mut self.c.graph;
        let alloc = g.add(op, &ins, Type::Tuple, NodeInfo::Alloc(Box::new(info)));
        let ctrl = g.make_proj(alloc, slot::CONTROL, Type::Control);
        let io = g.make_proj(alloc, slot::I_O, Type::Io);
        let malloc = g.make_proj(alloc, slot::MEMORY, Type::Memory);
        let rawoop = g.make_proj(
            alloc,
            slot::PARMS,
            Type::Ptr(TypePtr::raw(PtrNull::NotNull, Offset::Known(0))),
        );
        g.add_macro_node(alloc);
        self.state.ctrl = ctrl;
        self.state.io = io;
        self.set_memory(AliasIdx::RAW, malloc);

        // The initialization barrier captures the slices of the new object's fields: their
        // state before the allocation feeds it, and they are sourced from it afterwards.
        let minit_in = self.c.graph.merge_mem(malloc);
        let init = self.c.graph.add(
            Opcode::Initialize,
            &[
                Some(ctrl),
                None,
                Some(minit_in),
                None,
                None,
                None,
                Some(rawoop),
            ],
            Type::Tuple,
            NodeInfo::MemBar(MemBarInfo {
                adr_type: Some(TypePtr::raw(PtrNull::Maybe, Offset::Bot)),
            }),
        );
        let init_ctrl = self.c.graph.make_proj(init, slot::CONTROL, Type::Control);
        let minit_out = self.c.graph.make_proj(init, slot::MEMORY, Type::Memory);
        self.set_control(init_ctrl);
        self.set_memory(AliasIdx::RAW, minit_out);

        let mut hooked: SmallVec<[AliasIdx; 8]> = SmallVec::new();
        let mark = self.c.alias_index(&oop_type.with_offset(Offset::Known(0)));
        let klass_idx = self.c.alias_index(&oop_type.with_offset(Offset::Known(8)));
        self.set_memory(mark, minit_out);
        self.set_memory(klass_idx, minit_out);
        if oop_type.is_aryptr() {
            hooked.push(self.c.alias_index(&oop_type.with_offset(Offset::Bot)));
            hooked.push(self.c.alias_index(&oop_type.with_offset(Offset::Known(ARRAY_LENGTH_OFFSET))));
        } else {
            let offsets: SmallVec<[i32; 8]> = self
                .c
                .klasses
                .nonstatic_fields(klass)
                .iter()
                .map(|f| f.offset)
                .collect();
            for off in offsets {
                hooked.push(self.c.alias_index(&oop_type.with_offset(Offset::Known(off))));
            }
        }
        for idx in hooked {
            let prev = self.memory(idx);
            self.c.graph.set_memory_at(minit_in, idx, prev);
            self.set_memory(idx, minit_out);
        }

        let javaoop = self.c.graph.add(
            Opcode::CheckCastPP,
            &[Some(init_ctrl), Some(rawoop)],
            Type::Ptr(oop_type),
            NodeInfo::None,
        );
        self.c.set_recent_alloc(init_ctrl, javaoop);
        javaoop
    }

    /// A safepoint recording `locals` as debug info.
    pub fn safepoint(&mut self, locals: &[Node]) -> Node {
        let ins = self.call_prologue();
        let info = CallInfo {
            name: String::from("safepoint"),
            jvms: Some(self.jvms(ins.len())),
            ..CallInfo::default()
        };
        let sfpt = self
            .c
            .graph
            .add(Opcode::SafePoint, &ins, Type::Tuple, NodeInfo::Call(Box::new(info)));
        self.debug_jvms(sfpt, locals);
        let ctrl = self.c.graph.make_proj(sfpt, slot::CONTROL, Type::Control);
        self.set_control(ctrl);
        sfpt
    }

    /// A call with explicit opcode and payload. `debug` values are recorded as locals.
    pub fn make_call(&mut self, op: Opcode, info: CallInfo, args: &[Node], debug: &[Node]) -> Node {
        let call = self.make_call_node(op, info, args);
        if op.is_call_leaf() {
            debug_assert!(debug.is_empty(), "leaf calls carry no debug info");
        } else {
            self.debug_jvms(call, debug);
        }
        self.call_epilogue(call, !op.is_call_leaf());
        call
    }

    /// A call node at the current state, without projections. The kit's state is unchanged;
    /// the caller wires up the call's outputs.
    pub fn make_call_node(&mut self, op: Opcode, info: CallInfo, args: &[Node]) -> Node {
        let mut ins = self.call_prologue();
        ins.extend(args.iter().map(|&a| Some(a)));
        let mut info = info;
        if !op.is_call_leaf() && info.jvms.is_none() {
            info.jvms = Some(self.jvms(ins.len()));
        }
        self.c
            .graph
            .add(op, &ins, Type::Tuple, NodeInfo::Call(Box::new(info)))
    }

    /// A call to a statically bound Java method.
    pub fn call_static(
        &mut self,
        name: &str,
        args: &[Node],
        ret: Option<BasicType>,
        summary: Option<CallSummary>,
        debug: &[Node],
    ) -> Node {
        let params = args
            .iter()
            .map(|&a| basic_type_of(self.c.graph.ty(a)))
            .collect();
        let info = CallInfo {
            name: name.to_string(),
            params,
            ret,
            summary,
            ..CallInfo::default()
        };
        self.make_call(Opcode::CallStaticJava, info, args, debug)
    }

    /// The value returned by `call`, typed `ty`.
    pub fn call_result(&mut self, call: Node, ty: Type) -> Node {
        self.c.graph.make_proj(call, slot::PARMS, ty)
    }

    /// A call to the boxing method of `klass` with primitive `val`. Returns the box.
    pub fn box_value(&mut self, klass: Klass, val: Node, debug: &[Node]) -> Node {
        let info = CallInfo {
            name: String::from("valueOf"),
            params: vec![basic_type_of(self.c.graph.ty(val))],
            ret: Some(BasicType::Object),
            boxing: true,
            summary: Some(CallSummary {
                args: vec![Default::default()],
                return_allocated: true,
                return_local: false,
            }),
            ..CallInfo::default()
        };
        let call = self.make_call(Opcode::CallStaticJava, info, &[val], debug);
        self.c.graph.add_macro_node(call);
        self.call_result(call, Type::Ptr(TypePtr::inst(klass, false, PtrNull::NotNull)))
    }

    /// A runtime call without safepoint that may touch all of memory.
    pub fn make_leaf_call(&mut self, name: &str, args: &[Node]) -> Node {
        let info = CallInfo {
            name: name.to_string(),
            ..CallInfo::default()
        };
        self.make_call(Opcode::CallLeaf, info, args, &[])
    }

    /// A memory barrier over all of memory.
    pub fn insert_mem_bar(&mut self, op: Opcode, precedent: Option<Node>) -> Node {
        let mem = self.merged_memory();
        let mut ins: SmallVec<[Option<Node>; 6]> =
            SmallVec::from_slice(&[Some(self.control()), None, Some(mem), None, None]);
        if precedent.is_some() {
            ins.push(precedent);
        }
        let mb = self
            .c
            .graph
            .add(op, &ins, Type::Tuple, NodeInfo::MemBar(MemBarInfo::default()));
        let ctrl = self.c.graph.make_proj(mb, slot::CONTROL, Type::Control);
        let mem = self.c.graph.make_proj(mb, slot::MEMORY, Type::Memory);
        self.set_control(ctrl);
        self.set_all_memory(mem);
        mb
    }

    /// A memory barrier over slice `idx` only.
    pub fn insert_mem_bar_volatile(&mut self, op: Opcode, idx: AliasIdx, precedent: Option<Node>) -> Node {
        let mem = self.memory(idx);
        let adr_type = self.c.alias.adr_type(idx).clone();
        let mut ins: SmallVec<[Option<Node>; 6]> =
            SmallVec::from_slice(&[Some(self.control()), None, Some(mem), None, None]);
        if precedent.is_some() {
            ins.push(precedent);
        }
        let mb = self.c.graph.add(
            op,
            &ins,
            Type::Tuple,
            NodeInfo::MemBar(MemBarInfo {
                adr_type: Some(adr_type),
            }),
        );
        let ctrl = self.c.graph.make_proj(mb, slot::CONTROL, Type::Control);
        let mem = self.c.graph.make_proj(mb, slot::MEMORY, Type::Memory);
        self.set_control(ctrl);
        self.set_memory(idx, mem);
        mb
    }

    /// Enter the monitor of `obj`. Returns the lock slot, needed to exit it again.
    pub fn lock(&mut self, obj: Node, debug: &[Node]) -> Node {
        let root = self.c.graph.root();
        let raw = Type::Ptr(TypePtr::raw(PtrNull::NotNull, Offset::Known(0)));
        let bx = self
            .c
            .graph
            .add(Opcode::BoxLock, &[Some(root)], raw, NodeInfo::None);
        let mut ins = self.call_prologue();
        ins.push(Some(obj));
        ins.push(Some(bx));
        let info = LockInfo {
            jvms: self.jvms(ins.len()),
            eliminated: false,
            coarsened: false,
        };
        let lock = self
            .c
            .graph
            .add(Opcode::Lock, &ins, Type::Tuple, NodeInfo::Lock(Box::new(info)));
        self.debug_jvms(lock, debug);
        self.c.graph.add_macro_node(lock);
        self.call_epilogue(lock, false);
        self.insert_mem_bar(Opcode::MemBarAcquireLock, None);
        bx
    }

    /// Exit the monitor of `obj` entered with lock slot `bx`.
    pub fn unlock(&mut self, obj: Node, bx: Node) -> Node {
        self.insert_mem_bar(Opcode::MemBarReleaseLock, None);
        let mut ins = self.call_prologue();
        ins.push(Some(obj));
        ins.push(Some(bx));
        let info = LockInfo {
            jvms: self.jvms(ins.len()),
            eliminated: false,
            coarsened: false,
        };
        let unlock = self
            .c
            .graph
            .add(Opcode::Unlock, &ins, Type::Tuple, NodeInfo::Lock(Box::new(info)));
        self.c.graph.add_macro_node(unlock);
        self.call_epilogue(unlock, false);
        unlock
    }

    /// A bulk copy of `len` elements.
    #[allow(clippy::too_many_arguments, reason = "mirrors the copy intrinsic")]
    pub fn make_arraycopy(
        &mut self,
        kind: ArrayCopyKind,
        src: Node,
        src_pos: Node,
        dest: Node,
        dest_pos: Node,
        len: Node,
        validated: bool,
        tightly_coupled: bool,
    ) -> Node {
        let mut ins = self.call_prologue();
        ins.extend([
            Some(src),
            Some(src_pos),
            Some(dest),
            Some(dest_pos),
            Some(len),
            None,
            None,
            None,
            None,
        ]);
        let info = ArrayCopyInfo {
            jvms: self.jvms(ins.len()),
            kind,
            arguments_validated: validated,
            alloc_tightly_coupled: tightly_coupled,
            src_type: None,
            dest_type: None,
        };
        let ac = self.c.graph.add(
            Opcode::ArrayCopy,
            &ins,
            Type::Tuple,
            NodeInfo::ArrayCopy(Box::new(info)),
        );
        self.c.graph.add_macro_node(ac);
        let g = &mut self.c.graph;
        let ctrl = g.make_proj(ac, slot::CONTROL, Type::Control);
        let io = g.make_proj(ac, slot::I_O, Type::Io);
        let mem = g.make_proj(ac, slot::MEMORY, Type::Memory);
        self.state.io = io;
        self.set_control(ctrl);
        if kind == ArrayCopyKind::CloneBasic {
            // Clones only publish their raw effect; a CPU order barrier after them orders the
            // copied fields against later accesses.
            self.set_memory(AliasIdx::RAW, mem);
        } else {
            self.set_all_memory(mem);
        }
        ac
    }

    /// Return from the method.
    pub fn return_value(&mut self, val: Option<Node>) -> Node {
        let mut ins = self.call_prologue();
        ins.push(val);
        let ret = self
            .c
            .graph
            .add(Opcode::Return, &ins, Type::Control, NodeInfo::None);
        let root = self.c.graph.root();
        self.c.graph.add_req(root, Some(ret));
        let top = self.c.graph.top();
        self.set_control(top);
        ret
    }

    /// Compare two pointers.
    pub fn cmp_p(&mut self, a: Node, b: Node) -> Node {
        let top = self.c.graph.top();
        self.c
            .graph
            .add_simple(Opcode::CmpP, &[top, a, b], Type::Int(None))
    }

    /// Compare two ints.
    pub fn cmp_i(&mut self, a: Node, b: Node) -> Node {
        let top = self.c.graph.top();
        self.c
            .graph
            .add_simple(Opcode::CmpI, &[top, a, b], Type::Int(None))
    }

    /// Test the result of a compare.
    pub fn bool(&mut self, cmp: Node, test: BoolTest) -> Node {
        let top = self.c.graph.top();
        self.c.graph.add(
            Opcode::Bool,
            &[Some(top), Some(cmp)],
            Type::Int(None),
            NodeInfo::Bool(test),
        )
    }

    /// Branch on `bol`. Returns the (true, false) projections; control is left unchanged.
    pub fn make_if(&mut self, bol: Node, prob: f32) -> (Node, Node) {
        let g = &mut self.c.graph;
        let iff = g.add(
            Opcode::If,
            &[Some(self.state.ctrl), Some(bol)],
            Type::Tuple,
            NodeInfo::If(prob),
        );
        let t = g.add(Opcode::IfTrue, &[Some(iff)], Type::Control, NodeInfo::None);
        let f = g.add(Opcode::IfFalse, &[Some(iff)], Type::Control, NodeInfo::None);
        (t, f)
    }

    /// A Phi of `values` at `region`.
    pub fn make_phi(&mut self, region: Node, values: &[Node], ty: Type, adr_type: Option<TypePtr>) -> Node {
        let mut ins: SmallVec<[Option<Node>; 4]> = SmallVec::new();
        ins.push(Some(region));
        ins.extend(values.iter().map(|&v| Some(v)));
        self.c
            .graph
            .add(Opcode::Phi, &ins, ty, NodeInfo::Phi(PhiInfo { adr_type }))
    }

    /// Join control flow from `states`, creating Phis for whatever differs. The kit continues
    /// from the merged state, which is also returned.
    pub fn merge_states(&mut self, states: &[KitState]) -> KitState {
        debug_assert!(!states.is_empty());
        let mut ins: SmallVec<[Option<Node>; 4]> = SmallVec::new();
        ins.push(None);
        ins.extend(states.iter().map(|s| Some(s.ctrl)));
        let region = self
            .c
            .graph
            .add(Opcode::Region, &ins, Type::Control, NodeInfo::None);

        let ios: SmallVec<[Node; 4]> = states.iter().map(|s| s.io).collect();
        let io = if ios.iter().all(|&i| i == ios[0]) {
            ios[0]
        } else {
            self.make_phi(region, &ios, Type::Io, None)
        };

        let bases: SmallVec<[Node; 4]> = states.iter().map(|s| s.mem.base()).collect();
        let base = if bases.iter().all(|&b| b == bases[0]) {
            bases[0]
        } else {
            self.make_phi(region, &bases, Type::Memory, None)
        };
        let mut mem = MemState::new(base);
        let mut idxs: SmallVec<[AliasIdx; 8]> = SmallVec::new();
        for s in states {
            for (idx, _) in s.mem.slices() {
                if !idxs.contains(&idx) {
                    idxs.push(idx);
                }
            }
        }
        idxs.sort();
        for idx in idxs {
            let vals: SmallVec<[Node; 4]> = states.iter().map(|s| s.mem.at(idx)).collect();
            let m = if vals.iter().all(|&v| v == vals[0]) {
                vals[0]
            } else {
                let adr_type = self.c.alias.adr_type(idx).clone();
                self.make_phi(region, &vals, Type::Memory, Some(adr_type))
            };
            if m != base {
                mem.set(idx, m);
            }
        }
        let merged = KitState {
            ctrl: region,
            io,
            mem,
        };
        self.state = merged.clone();
        merged
    }

    /// Load through the barrier policy. `val_type` is the type of the loaded value.
    pub fn access_load_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        val_type: Type,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2Access::new(self, decorators | Decorators::C2_READ_ACCESS, bt, obj, adr);
        bs.c2().load_at(self, &mut access, &val_type)
    }

    /// Store through the barrier policy.
    pub fn access_store_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        val: Node,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2Access::new(self, decorators | Decorators::C2_WRITE_ACCESS, bt, obj, adr);
        bs.c2().store_at(self, &mut access, val)
    }

    /// Compare-and-exchange through the barrier policy. Returns the old value.
    #[allow(clippy::too_many_arguments, reason = "one argument per operand")]
    pub fn access_atomic_cmpxchg_val_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        expected: Node,
        new_val: Node,
        val_type: Type,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2AtomicAccess::new(self, decorators, bt, obj, adr);
        bs.c2()
            .atomic_cmpxchg_val_at(self, &mut access, expected, new_val, &val_type)
    }

    /// Compare-and-swap through the barrier policy. Returns the success flag.
    pub fn access_atomic_cmpxchg_bool_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        expected: Node,
        new_val: Node,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2AtomicAccess::new(self, decorators, bt, obj, adr);
        bs.c2()
            .atomic_cmpxchg_bool_at(self, &mut access, expected, new_val)
    }

    /// Atomic exchange through the barrier policy. Returns the old value.
    pub fn access_atomic_xchg_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        new_val: Node,
        val_type: Type,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2AtomicAccess::new(self, decorators, bt, obj, adr);
        bs.c2().atomic_xchg_at(self, &mut access, new_val, &val_type)
    }

    /// Atomic add through the barrier policy. Returns the old value.
    pub fn access_atomic_add_at(
        &mut self,
        obj: Node,
        adr: Node,
        bt: BasicType,
        delta: Node,
        decorators: Decorators,
    ) -> Node {
        let bs = self.c.barrier_set();
        let mut access = C2AtomicAccess::new(self, decorators, bt, obj, adr);
        let ty = Type::of_basic_type(bt);
        bs.c2().atomic_add_at(self, &mut access, delta, &ty)
    }

    /// Copy every field of `src` into the fresh object `dst` of `size` bytes.
    pub fn access_clone(&mut self, src: Node, dst: Node, size: Node, is_array: bool) {
        let bs = self.c.barrier_set();
        bs.c2().clone(self, src, dst, size, is_array);
        self.insert_mem_bar(Opcode::MemBarCPUOrder, None);
    }

    /// Offset and type of field `name` of `obj`, if `obj` is an object of a class that has one.
    fn field(&self, obj: Node, name: &str) -> Option<(i32, BasicType)> {
        let klass = self.c.graph.ty(obj).isa_oopptr().and_then(|tp| tp.klass);
        let field = klass.and_then(|k| {
            self.c
                .klasses
                .nonstatic_fields(k)
                .into_iter()
                .find(|f| f.name == name)
                .map(|f| (f.offset, f.bt))
        });
        debug_assert!(field.is_some(), "no field {name} in {obj} of class {klass:?}");
        field
    }

    fn default_value_type(&self, bt: BasicType) -> Type {
        if bt.is_reference() {
            Type::Ptr(TypePtr::inst(self.c.klasses.object(), false, PtrNull::Maybe))
        } else {
            Type::of_basic_type(bt)
        }
    }

    /// Load field `name` of `obj`.
    pub fn load_field(&mut self, obj: Node, name: &str) -> Node {
        let Some((_, bt)) = self.field(obj, name) else {
            return self.c.graph.top();
        };
        let ty = self.default_value_type(bt);
        self.load_field_typed(obj, name, ty, Decorators::empty())
    }

    /// Load field `name` of `obj` as a value of type `ty`.
    pub fn load_field_typed(&mut self, obj: Node, name: &str, ty: Type, decorators: Decorators) -> Node {
        let Some((offset, bt)) = self.field(obj, name) else {
            return self.c.graph.top();
        };
        let adr = self.basic_plus_adr(obj, obj, i64::from(offset));
        self.access_load_at(obj, adr, bt, ty, decorators | Decorators::IN_HEAP)
    }

    /// Store `val` into field `name` of `obj`.
    pub fn store_field(&mut self, obj: Node, name: &str, val: Node) -> Node {
        self.store_field_with(obj, name, val, Decorators::empty())
    }

    /// Store `val` into field `name` of `obj` with extra decorators.
    pub fn store_field_with(&mut self, obj: Node, name: &str, val: Node, decorators: Decorators) -> Node {
        let Some((offset, bt)) = self.field(obj, name) else {
            return self.c.graph.top();
        };
        let adr = self.basic_plus_adr(obj, obj, i64::from(offset));
        self.access_store_at(obj, adr, bt, val, decorators | Decorators::IN_HEAP)
    }

    /// Load element `idx` of array `ary`.
    pub fn load_array(&mut self, ary: Node, idx: Node, elem: BasicType) -> Node {
        let adr = self.array_element_address(ary, idx, elem);
        let ty = self.default_value_type(elem);
        self.access_load_at(ary, adr, elem, ty, Decorators::IN_HEAP | Decorators::IS_ARRAY)
    }

    /// Store `val` into element `idx` of array `ary`.
    pub fn store_array(&mut self, ary: Node, idx: Node, elem: BasicType, val: Node) -> Node {
        let adr = self.array_element_address(ary, idx, elem);
        self.access_store_at(ary, adr, elem, val, Decorators::IN_HEAP | Decorators::IS_ARRAY)
    }

    /// A plain load that bypasses the barrier policy.
    pub fn raw_load(&mut self, adr: Node, bt: BasicType, ty: Type) -> Node {
        let ctl = self.control();
        self.make_load(Some(ctl), adr, ty, MemInfo::plain(bt))
    }

    /// A plain store that bypasses the barrier policy.
    pub fn raw_store(&mut self, adr: Node, bt: BasicType, val: Node, order: MemOrder) -> Node {
        let ctl = self.control();
        let info = MemInfo {
            order,
            ..MemInfo::plain(bt)
        };
        self.store_to_memory(Some(ctl), adr, val, info)
    }
}

/// The basic type of values of type `ty`.
pub fn basic_type_of(ty: &Type) -> BasicType {
    match ty {
        Type::Int(_) => BasicType::Int,
        Type::Long(_) => BasicType::Long,
        Type::Float => BasicType::Float,
        Type::Double => BasicType::Double,
        Type::NarrowOop(_) => BasicType::NarrowOop,
        Type::Ptr(tp) if tp.is_raw() => BasicType::Address,
        Type::Ptr(_) => BasicType::Object,
        _ => BasicType::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{KlassFlags, KlassTable};
    use crate::settings::{Flags, GcKind, builder};

    fn compile(gc: GcKind) -> (Compile, Klass) {
        let mut kt = KlassTable::new(true);
        let point = kt.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        let mut b = builder();
        b.gc(gc);
        (Compile::new(Flags::new(b), kt), point)
    }

    #[test]
    fn allocation_hooks_field_slices() {
        let (mut c, point) = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(point);
        let x = kit.c.alias_index(&kit.c.graph.ty(p).isa_ptr().unwrap().add_offset(12));
        let minit = kit.memory(x);
        let init = kit.c.graph.input(minit, 0).unwrap();
        assert_eq!(kit.c.graph.op(init), Opcode::Initialize);
        assert_eq!(kit.memory(AliasIdx::RAW), minit);
        assert_eq!(kit.c.recent_alloc(), Some((kit.control(), p)));
        assert_eq!(kit.just_allocated_object(kit.control()), Some(p));

        let alloc = kit.c.graph.ideal_allocation(p).unwrap();
        let malloc = kit.c.graph.proj_out(alloc, slot::MEMORY);
        let one = kit.c.graph.intcon(1);
        let st = kit.store_field(p, "x", one);
        // The first store to the field is part of the initialization.
        assert_eq!(kit.c.graph.find_captured_store(init, 12), Some(st));
        assert_eq!(kit.c.graph.input(st, slot::mem::MEMORY), malloc);
        assert_eq!(kit.memory(x), minit);

        let two = kit.c.graph.intcon(2);
        let st2 = kit.store_field(p, "x", two);
        assert_eq!(kit.c.graph.input(st2, slot::mem::MEMORY), Some(minit));
        assert_eq!(kit.memory(x), st2);
        assert_eq!(kit.c.graph.find_captured_store(init, 12), Some(st));
        assert_eq!(kit.c.graph.macro_nodes().len(), 1);
    }

    #[test]
    fn store_after_read_or_call_is_not_captured() {
        let (mut c, point) = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(point);
        let init = kit.c.graph.initialization(kit.c.graph.ideal_allocation(p).unwrap()).unwrap();
        let x = kit.load_field(p, "x");
        kit.store_field(p, "y", x);
        assert_eq!(kit.c.graph.find_captured_store(init, 16), None);

        let q = kit.new_instance(point);
        let init = kit.c.graph.initialization(kit.c.graph.ideal_allocation(q).unwrap()).unwrap();
        kit.make_leaf_call("unrelated", &[]);
        let one = kit.c.graph.intcon(1);
        let st = kit.store_field(q, "x", one);
        assert_eq!(kit.c.graph.find_captured_store(init, 12), None);
        assert_eq!(kit.c.graph.req(init), slot::init::RAW_STORES);
        assert_eq!(kit.c.graph.op(kit.c.graph.input(st, slot::mem::MEMORY).unwrap()), Opcode::Proj);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "no field z"))]
    fn unknown_field_yields_top() {
        let (mut c, point) = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(point);
        let mem = kit.memory(AliasIdx::RAW);
        let one = kit.c.graph.intcon(1);
        let top = kit.c.graph.top();
        assert_eq!(kit.store_field(p, "z", one), top);
        assert_eq!(kit.load_field(p, "z"), top);
        assert_eq!(kit.memory(AliasIdx::RAW), mem);
    }

    #[test]
    fn merge_creates_phis_only_where_needed() {
        let (mut c, point) = compile(GcKind::NoOp);
        let mut kit = GraphKit::new(&mut c);
        let p = kit.new_instance(point);
        let a = kit.c.graph.intcon(1);
        let b = kit.c.graph.intcon(2);
        let cond = kit.parameter(0, Type::Int(None));
        let zero = kit.c.graph.intcon(0);
        let cmp = kit.cmp_i(cond, zero);
        let bol = kit.bool(cmp, BoolTest::Ne);
        let (t, f) = kit.make_if(bol, 0.5);
        let before = kit.state();

        kit.set_control(t);
        kit.store_field(p, "x", a);
        let left = kit.state();
        kit.set_state(before);
        kit.set_control(f);
        kit.store_field(p, "x", b);
        let right = kit.state();

        let merged = kit.merge_states(&[left, right]);
        let x = kit.c.alias_index(&kit.c.graph.ty(p).isa_ptr().unwrap().add_offset(12));
        let y = kit.c.alias_index(&kit.c.graph.ty(p).isa_ptr().unwrap().add_offset(16));
        let phi = merged.mem.at(x);
        assert_eq!(kit.c.graph.op(phi), Opcode::Phi);
        assert_eq!(kit.c.graph.input(phi, 0), Some(merged.ctrl));
        assert_ne!(kit.c.graph.op(merged.mem.at(y)), Opcode::Phi);
    }

    #[test]
    fn compressed_references() {
        let mut kt = KlassTable::new(true);
        let holder = kt.define_instance("Holder", None, &[("f", BasicType::Object)], KlassFlags::empty());
        let mut b = builder();
        b.gc(GcKind::NoOp);
        let mut c = Compile::new(Flags::new(b), kt);
        let mut kit = GraphKit::new(&mut c);
        let h = kit.new_instance(holder);
        let v = kit.load_field(h, "f");
        assert_eq!(kit.c.graph.op(v), Opcode::DecodeN);
        let st = kit.store_field(h, "f", v);
        let val = kit.c.graph.input(st, slot::mem::VALUE).unwrap();
        assert_eq!(kit.c.graph.op(val), Opcode::EncodeP);
    }
}
