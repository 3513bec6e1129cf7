//! Node opcodes and per-format payloads.

use crate::arraycopy::ArrayCopyKind;
use crate::ir::entities::{Klass, Node};
use crate::ir::types::{BasicType, Type, TypePtr};
use bitflags::bitflags;
use smallvec::SmallVec;

/// Fixed input slots.
///
/// Call-like nodes (safepoints, calls, allocations, locks, array copies, memory barriers) share
/// one layout for their first inputs; their projections use the same numbers.
pub mod slot {
    /// Control input of every node that has one.
    pub const CONTROL: usize = 0;
    /// I/O state of a call-like node.
    pub const I_O: usize = 1;
    /// Memory state of a call-like node.
    pub const MEMORY: usize = 2;
    /// Frame pointer of a call-like node.
    pub const FRAME_PTR: usize = 3;
    /// Return address of a call-like node.
    pub const RETURN_ADR: usize = 4;
    /// First argument of a call-like node. Also the result projection number.
    pub const PARMS: usize = 5;

    /// Loads, stores and atomics.
    pub mod mem {
        /// Memory state input.
        pub const MEMORY: usize = 1;
        /// Address input.
        pub const ADDRESS: usize = 2;
        /// Stored value, or new value of an atomic.
        pub const VALUE: usize = 3;
        /// Expected value of a compare-and-swap.
        pub const EXPECTED: usize = 4;
        /// The oop store a card mark belongs to.
        pub const OOP_STORE: usize = 4;
    }

    /// Address arithmetic.
    pub mod addp {
        /// The object the address points into (top for raw addresses).
        pub const BASE: usize = 1;
        /// The address being offset; the base or another `AddP`.
        pub const ADDRESS: usize = 2;
        /// Byte offset.
        pub const OFFSET: usize = 3;
    }

    /// Allocations.
    pub mod alloc {
        /// Size in bytes.
        pub const SIZE: usize = super::PARMS;
        /// Class pointer.
        pub const KLASS: usize = super::PARMS + 1;
        /// Fast path guard.
        pub const INITIAL_TEST: usize = super::PARMS + 2;
        /// Array length.
        pub const LENGTH: usize = super::PARMS + 3;
    }

    /// Memory barriers.
    pub mod membar {
        /// The memory operation the barrier is tied to.
        pub const PRECEDENT: usize = super::PARMS;
    }

    /// Initialize: a barrier after an allocation that captures its initializing stores.
    pub mod init {
        /// Raw address of the new object.
        pub const RAW_ADDRESS: usize = super::PARMS + 1;
        /// First captured store.
        pub const RAW_STORES: usize = super::PARMS + 2;
    }

    /// Lock and Unlock.
    pub mod lock {
        /// The locked object.
        pub const OBJECT: usize = super::PARMS;
        /// The stack slot of the lock.
        pub const BOX: usize = super::PARMS + 1;
    }

    /// Collector barrier nodes, laid out like memory barriers.
    pub mod gc_barrier {
        /// Address of the field whose previous value is logged; top when the value is known.
        pub const ADDRESS: usize = super::PARMS;
        /// The value to log, if known up front.
        pub const VALUE: usize = super::PARMS + 1;
        /// Memory state the previous field value is loaded from.
        pub const FIELD_MEMORY: usize = super::PARMS + 2;
    }

    /// Array copies.
    pub mod arraycopy {
        /// Source array or object.
        pub const SRC: usize = super::PARMS;
        /// Start index in the source.
        pub const SRC_POS: usize = super::PARMS + 1;
        /// Destination array or object.
        pub const DEST: usize = super::PARMS + 2;
        /// Start index in the destination.
        pub const DEST_POS: usize = super::PARMS + 3;
        /// Element count (or size in words for basic clones).
        pub const LENGTH: usize = super::PARMS + 4;
        /// Length of the source array.
        pub const SRC_LEN: usize = super::PARMS + 5;
        /// Length of the destination array.
        pub const DEST_LEN: usize = super::PARMS + 6;
        /// Class of the source.
        pub const SRC_KLASS: usize = super::PARMS + 7;
        /// Class of the destination.
        pub const DEST_KLASS: usize = super::PARMS + 8;
    }
}

/// Node operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "opcode names are self-describing")]
pub enum Opcode {
    // Graph structure.
    Root,
    Start,
    Parm,
    Proj,
    Region,
    Phi,
    If,
    IfTrue,
    IfFalse,
    Halt,
    Return,

    // Constants.
    Top,
    ConI,
    ConL,
    ConP,

    // Integer arithmetic.
    AddI,
    AddL,
    SubI,
    SubL,
    LShiftL,
    URShiftL,
    ConvI2L,

    // Pointers.
    AddP,
    CastP2X,
    CastX2P,
    CheckCastPP,
    CastPP,
    EncodeP,
    DecodeN,
    ThreadLocal,

    // Comparisons.
    CmpI,
    CmpL,
    CmpP,
    Bool,
    Conv2B,

    // Memory.
    Load,
    Store,
    StoreCM,
    CompareAndSwap,
    WeakCompareAndSwap,
    CompareAndExchange,
    GetAndSet,
    GetAndAdd,
    SCMemProj,
    MergeMem,
    ClearArray,

    // Memory barriers.
    MemBarAcquire,
    MemBarRelease,
    MemBarVolatile,
    MemBarCPUOrder,
    MemBarStoreStore,
    MemBarAcquireLock,
    MemBarReleaseLock,
    Initialize,

    // Safepoints and calls.
    SafePoint,
    CallStaticJava,
    CallDynamicJava,
    CallLeaf,
    CallLeafNoFP,
    CallRuntime,
    Allocate,
    AllocateArray,
    Lock,
    Unlock,
    ArrayCopy,
    FastLock,
    BoxLock,

    // Debug info of scalar replaced objects.
    SafePointScalarObject,
    SafePointScalarMerge,

    // Collector specific nodes, expanded late.
    GcCompareAndSwap,
    GcWeakCompareAndSwap,
    GcCompareAndExchange,
    ReadBarrier,
    WriteBarrier,
    EnqueueBarrier,
}

impl Opcode {
    /// Safepoints and every kind of call: nodes with debug info.
    pub fn is_safepoint(self) -> bool {
        self == Opcode::SafePoint || self.is_call()
    }

    /// Every kind of call.
    pub fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::CallStaticJava
                | Opcode::CallDynamicJava
                | Opcode::CallLeaf
                | Opcode::CallLeafNoFP
                | Opcode::CallRuntime
                | Opcode::Allocate
                | Opcode::AllocateArray
                | Opcode::Lock
                | Opcode::Unlock
                | Opcode::ArrayCopy
        )
    }

    /// Calls into Java code.
    pub fn is_call_java(self) -> bool {
        matches!(self, Opcode::CallStaticJava | Opcode::CallDynamicJava)
    }

    /// Runtime stubs without safepoint.
    pub fn is_call_leaf(self) -> bool {
        matches!(self, Opcode::CallLeaf | Opcode::CallLeafNoFP)
    }

    /// Object and array allocations.
    pub fn is_allocate(self) -> bool {
        matches!(self, Opcode::Allocate | Opcode::AllocateArray)
    }

    /// Lock and Unlock.
    pub fn is_abstract_lock(self) -> bool {
        matches!(self, Opcode::Lock | Opcode::Unlock)
    }

    /// Loads.
    pub fn is_load(self) -> bool {
        self == Opcode::Load
    }

    /// Stores, including card marks.
    pub fn is_store(self) -> bool {
        matches!(self, Opcode::Store | Opcode::StoreCM)
    }

    /// Atomic read-modify-write operations.
    pub fn is_load_store(self) -> bool {
        matches!(
            self,
            Opcode::CompareAndSwap
                | Opcode::WeakCompareAndSwap
                | Opcode::CompareAndExchange
                | Opcode::GetAndSet
                | Opcode::GetAndAdd
        ) || self.is_gc_cas()
    }

    /// Collector specific compare-and-swap variants.
    pub fn is_gc_cas(self) -> bool {
        matches!(
            self,
            Opcode::GcCompareAndSwap | Opcode::GcWeakCompareAndSwap | Opcode::GcCompareAndExchange
        )
    }

    /// Nodes with `Memory` and `Address` inputs in the memory slot layout.
    pub fn is_mem(self) -> bool {
        self.is_load() || self.is_store() || self.is_load_store()
    }

    /// Memory barriers, including `Initialize`.
    pub fn is_membar(self) -> bool {
        matches!(
            self,
            Opcode::MemBarAcquire
                | Opcode::MemBarRelease
                | Opcode::MemBarVolatile
                | Opcode::MemBarCPUOrder
                | Opcode::MemBarStoreStore
                | Opcode::MemBarAcquireLock
                | Opcode::MemBarReleaseLock
                | Opcode::Initialize
        )
    }

    /// Nodes producing a tuple consumed through projections.
    pub fn is_multi(self) -> bool {
        self == Opcode::Start
            || self == Opcode::If
            || self.is_safepoint()
            || self.is_membar()
            || self.is_gc_barrier()
    }

    /// Collector barriers that stay opaque until macro expansion.
    pub fn is_gc_barrier(self) -> bool {
        matches!(self, Opcode::WriteBarrier | Opcode::EnqueueBarrier)
    }

    /// Projections.
    pub fn is_proj(self) -> bool {
        matches!(
            self,
            Opcode::Proj | Opcode::Parm | Opcode::IfTrue | Opcode::IfFalse
        )
    }

    /// Control flow nodes.
    pub fn is_cfg(self) -> bool {
        matches!(
            self,
            Opcode::Root
                | Opcode::Start
                | Opcode::Region
                | Opcode::If
                | Opcode::IfTrue
                | Opcode::IfFalse
                | Opcode::Halt
                | Opcode::Return
        ) || self.is_safepoint()
            || self.is_membar()
            || self.is_gc_barrier()
    }

    /// Constants.
    pub fn is_con(self) -> bool {
        matches!(
            self,
            Opcode::Top | Opcode::ConI | Opcode::ConL | Opcode::ConP
        )
    }

    /// Casts that narrow a pointer's type.
    pub fn is_constraint_cast(self) -> bool {
        matches!(self, Opcode::CheckCastPP | Opcode::CastPP)
    }
}

/// Memory ordering of an access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemOrder {
    /// Plain access.
    Unordered,
    /// Later accesses may not float above.
    Acquire,
    /// Earlier accesses may not float below.
    Release,
    /// Sequentially consistent.
    SeqCst,
}

/// Payload of loads, stores and atomics.
#[derive(Clone, Debug, PartialEq)]
pub struct MemInfo {
    /// Type of the value in memory.
    pub bt: BasicType,
    /// Memory ordering.
    pub order: MemOrder,
    /// The access type does not match the declared field type.
    pub mismatched: bool,
    /// The access comes from an `Unsafe` intrinsic.
    pub unsafe_access: bool,
}

impl MemInfo {
    /// A plain access of type `bt`.
    pub fn plain(bt: BasicType) -> Self {
        Self {
            bt,
            order: MemOrder::Unordered,
            mismatched: false,
            unsafe_access: false,
        }
    }
}

/// Payload of Phis.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PhiInfo {
    /// For memory Phis, the slice they merge; `None` for all of memory or for value Phis.
    pub adr_type: Option<TypePtr>,
}

/// Payload of memory barriers.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MemBarInfo {
    /// The slice the barrier orders; `None` for all of memory.
    pub adr_type: Option<TypePtr>,
}

/// Layout of the debug info attached to a safepoint.
///
/// Debug inputs run from `locoff` to `endoff`. Values describing scalar replaced objects are
/// appended at the end, starting at `scloff`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct JvmState {
    /// Method being executed.
    pub method: String,
    /// Bytecode index.
    pub bci: i32,
    /// First local.
    pub locoff: usize,
    /// First monitor.
    pub monoff: usize,
    /// First scalar replaced field value.
    pub scloff: usize,
    /// One past the last debug input.
    pub endoff: usize,
}

impl JvmState {
    /// First debug input.
    pub fn debug_start(&self) -> usize {
        self.locoff
    }

    /// One past the last debug input.
    pub fn debug_end(&self) -> usize {
        self.endoff
    }
}

bitflags! {
    /// What a callee does with one of its arguments, as computed by a bytecode level analysis.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ArgSummary: u8 {
        /// The argument may be returned.
        const RETURNED = 1 << 0;
        /// The argument stays on the stack: it does not escape the callee.
        const STACK = 1 << 1;
        /// The argument's fields do not escape either.
        const LOCAL = 1 << 2;
    }
}

/// Escape summary of a statically known callee.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CallSummary {
    /// Per-argument summary.
    pub args: Vec<ArgSummary>,
    /// The callee returns a freshly allocated object.
    pub return_allocated: bool,
    /// The callee returns only its arguments or fresh objects.
    pub return_local: bool,
}

/// Payload of safepoints and ordinary calls.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CallInfo {
    /// Callee method or runtime stub name.
    pub name: String,
    /// Declared parameter types.
    pub params: Vec<BasicType>,
    /// Declared return type.
    pub ret: Option<BasicType>,
    /// Debug info; absent for leaf calls.
    pub jvms: Option<JvmState>,
    /// Escape summary of the callee, if it could be analyzed.
    pub summary: Option<CallSummary>,
    /// The callee is a primitive boxing method.
    pub boxing: bool,
    /// The callee is a copy stub.
    pub arraycopy_stub: bool,
    /// Boxing call proved removable by escape analysis.
    pub eliminated_boxing: bool,
    /// Some argument only escapes into this call.
    pub arg_escape: bool,
    /// The debug info references an object that does not escape globally.
    pub ea_local_in_scope: bool,
}

/// Payload of allocations.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocInfo {
    /// Debug info of the slow path call.
    pub jvms: JvmState,
    /// Class allocated.
    pub klass: Klass,
    /// Escape analysis found the allocation scalar replaceable.
    pub is_scalar_replaceable: bool,
    /// Escape analysis found the allocation does not escape.
    pub is_non_escaping: bool,
    /// The allocation result is only used by locks that were eliminated.
    pub has_eliminated_locks: bool,
}

/// Payload of Lock and Unlock.
#[derive(Clone, Debug, PartialEq)]
pub struct LockInfo {
    /// Debug info.
    pub jvms: JvmState,
    /// The lock was proven unnecessary.
    pub eliminated: bool,
    /// The lock was merged with an adjacent region on the same object.
    pub coarsened: bool,
}

/// Payload of array copies.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayCopyInfo {
    /// Debug info of the slow path.
    pub jvms: JvmState,
    /// Copy flavour.
    pub kind: ArrayCopyKind,
    /// Bounds and types were checked before the copy.
    pub arguments_validated: bool,
    /// The destination is a fresh allocation with no safepoint in between.
    pub alloc_tightly_coupled: bool,
    /// Known instance type of the source, set by escape analysis.
    pub src_type: Option<TypePtr>,
    /// Known instance type of the destination, set by escape analysis.
    pub dest_type: Option<TypePtr>,
}

/// Debug-info description of a scalar replaced object.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarObjectInfo {
    /// Type of the object that was replaced.
    pub ty: TypePtr,
    /// The allocation that was replaced.
    pub alloc: Option<Node>,
    /// Index of the first field value, relative to the safepoint's `scloff`.
    pub first_index: usize,
    /// Number of field values.
    pub n_fields: usize,
}

/// Debug-info description of a merge of scalar replaced objects.
///
/// Inputs are the root followed by one [`ScalarObjectInfo`] node per scalar replaced candidate.
/// The merge pointer (for inputs that were not scalar replaced) and the selector (which input was
/// taken) are appended to the safepoint itself, at `merge_pointer_idx` and the slot after it.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarMergeInfo {
    /// Index of the merge pointer in the safepoint's inputs, relative to its `scloff`.
    pub merge_pointer_idx: usize,
}

/// Condition code of a Bool node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs, reason = "standard condition names")]
pub enum BoolTest {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BoolTest {
    /// The condition that holds exactly when `self` does not.
    pub fn negate(self) -> BoolTest {
        match self {
            BoolTest::Eq => BoolTest::Ne,
            BoolTest::Ne => BoolTest::Eq,
            BoolTest::Lt => BoolTest::Ge,
            BoolTest::Ge => BoolTest::Lt,
            BoolTest::Le => BoolTest::Gt,
            BoolTest::Gt => BoolTest::Le,
        }
    }
}

/// Format specific node payload.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum NodeInfo {
    /// No payload.
    #[default]
    None,
    /// Projection number.
    Proj(usize),
    /// Memory access.
    Mem(MemInfo),
    /// Phi.
    Phi(PhiInfo),
    /// Memory barrier.
    MemBar(MemBarInfo),
    /// Safepoint or call.
    Call(Box<CallInfo>),
    /// Allocation.
    Alloc(Box<AllocInfo>),
    /// Lock or Unlock.
    Lock(Box<LockInfo>),
    /// Array copy.
    ArrayCopy(Box<ArrayCopyInfo>),
    /// Condition.
    Bool(BoolTest),
    /// Branch probability of the true path.
    If(f32),
    /// Scalar replaced object.
    ScalarObject(ScalarObjectInfo),
    /// Scalar replaced merge.
    ScalarMerge(ScalarMergeInfo),
}

/// A node: opcode, ordered inputs, type and payload.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// Operation.
    pub op: Opcode,
    /// Ordered inputs. Missing inputs are `None`.
    pub inputs: SmallVec<[Option<Node>; 4]>,
    /// Users, one entry per input edge.
    pub outs: SmallVec<[Node; 4]>,
    /// Type computed for the node.
    pub ty: Type,
    /// Format specific payload.
    pub info: NodeInfo,
    /// The node was removed from the graph.
    pub dead: bool,
}

impl NodeData {
    /// Debug info of a safepoint-like node.
    pub fn jvms(&self) -> Option<&JvmState> {
        match &self.info {
            NodeInfo::Call(c) => c.jvms.as_ref(),
            NodeInfo::Alloc(a) => Some(&a.jvms),
            NodeInfo::Lock(l) => Some(&l.jvms),
            NodeInfo::ArrayCopy(a) => Some(&a.jvms),
            _ => None,
        }
    }

    /// Mutable debug info of a safepoint-like node.
    pub fn jvms_mut(&mut self) -> Option<&mut JvmState> {
        match &mut self.info {
            NodeInfo::Call(c) => c.jvms.as_mut(),
            NodeInfo::Alloc(a) => Some(&mut a.jvms),
            NodeInfo::Lock(l) => Some(&mut l.jvms),
            NodeInfo::ArrayCopy(a) => Some(&mut a.jvms),
            _ => None,
        }
    }
}
