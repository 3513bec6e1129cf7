//! Access decorators.
//!
//! Every heap access is described by a set of decorators: its memory ordering, where the
//! accessed location lives, the strength of the reference being accessed and compiler specific
//! facts. Barrier policies and the fence logic only look at decorators, never at the bytecode
//! that produced the access.

use crate::ir::{BasicType, MemOrder, Opcode};
use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Properties of one memory access.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Decorators: u32 {
        /// No ordering beyond program order of the thread.
        const MO_UNORDERED = 1 << 0;
        /// Atomic but unordered.
        const MO_RELAXED = 1 << 1;
        /// Later accesses stay after this one.
        const MO_ACQUIRE = 1 << 2;
        /// Earlier accesses stay before this one.
        const MO_RELEASE = 1 << 3;
        /// Sequentially consistent (Java `volatile`).
        const MO_SEQ_CST = 1 << 4;

        /// Access without any collector barrier.
        const AS_RAW = 1 << 5;

        /// The location is in the Java heap.
        const IN_HEAP = 1 << 6;
        /// The location is outside the Java heap.
        const IN_NATIVE = 1 << 7;
        /// The location is an array element.
        const IS_ARRAY = 1 << 8;
        /// The destination of a copy holds no valid references yet.
        const IS_DEST_UNINITIALIZED = 1 << 9;

        /// A strong reference.
        const ON_STRONG_OOP_REF = 1 << 10;
        /// A weak reference.
        const ON_WEAK_OOP_REF = 1 << 11;
        /// A phantom reference.
        const ON_PHANTOM_OOP_REF = 1 << 12;
        /// A reference whose strength is only known at run time.
        const ON_UNKNOWN_OOP_REF = 1 << 13;

        /// The access type does not match the declared type of the location.
        const C2_MISMATCHED = 1 << 14;
        /// An `Unsafe` access.
        const C2_UNSAFE_ACCESS = 1 << 15;
        /// The load must stay below its control input.
        const C2_CONTROL_DEPENDENT_LOAD = 1 << 16;
        /// The load depends on a check other than the one directly guarding it.
        const C2_UNKNOWN_CONTROL_LOAD = 1 << 17;
        /// The load may not be moved at all.
        const C2_PINNED_LOAD = 1 << 18;
        /// The access reads memory.
        const C2_READ_ACCESS = 1 << 19;
        /// The access writes memory.
        const C2_WRITE_ACCESS = 1 << 20;
        /// The target is a fresh allocation with no safepoint since.
        const C2_TIGHTLY_COUPLED_ALLOC = 1 << 21;
        /// The access is part of an array copy.
        const C2_ARRAY_COPY = 1 << 22;
        /// A compare-and-swap that may fail spuriously.
        const C2_WEAK_CMPXCHG = 1 << 23;
    }
}

impl Decorators {
    /// All memory ordering decorators.
    pub const MO_MASK: Decorators = Decorators::MO_UNORDERED
        .union(Decorators::MO_RELAXED)
        .union(Decorators::MO_ACQUIRE)
        .union(Decorators::MO_RELEASE)
        .union(Decorators::MO_SEQ_CST);

    /// All reference strength decorators.
    pub const REF_STRENGTH_MASK: Decorators = Decorators::ON_STRONG_OOP_REF
        .union(Decorators::ON_WEAK_OOP_REF)
        .union(Decorators::ON_PHANTOM_OOP_REF)
        .union(Decorators::ON_UNKNOWN_OOP_REF);

    /// Fill in the defaults for an access of type `bt`: unordered, in the heap when nothing
    /// else was said, strong for references.
    ///
    /// Unsafe loads are additionally pinned below their guard unless `known_field` says the
    /// address provably names a field of the object.
    pub fn fixup(self, bt: BasicType, known_field: bool) -> Decorators {
        let mut d = self;
        if !d.intersects(Decorators::MO_MASK) {
            d |= Decorators::MO_UNORDERED;
        }
        if !d.intersects(Decorators::IN_HEAP | Decorators::IN_NATIVE)
            && !d.contains(Decorators::C2_UNSAFE_ACCESS)
        {
            d |= Decorators::IN_HEAP;
        }
        if bt.is_reference() && !d.intersects(Decorators::REF_STRENGTH_MASK) {
            d |= Decorators::ON_STRONG_OOP_REF;
        }
        if d.is_read() && !d.is_write() && d.contains(Decorators::C2_UNSAFE_ACCESS) {
            d |= Decorators::C2_CONTROL_DEPENDENT_LOAD | Decorators::C2_UNKNOWN_CONTROL_LOAD;
            if known_field && !needs_cpu_membar(d, false) {
                d -= Decorators::C2_CONTROL_DEPENDENT_LOAD | Decorators::C2_UNKNOWN_CONTROL_LOAD;
            }
        }
        d
    }

    /// Does the access read memory?
    pub fn is_read(self) -> bool {
        self.contains(Decorators::C2_READ_ACCESS)
    }

    /// Does the access write memory?
    pub fn is_write(self) -> bool {
        self.contains(Decorators::C2_WRITE_ACCESS)
    }

    /// A read-modify-write access.
    pub fn is_atomic(self) -> bool {
        self.is_read() && self.is_write()
    }

    /// Is the location neither known to be in the heap nor known to be outside it?
    pub fn is_mixed(self) -> bool {
        !self.intersects(Decorators::IN_HEAP | Decorators::IN_NATIVE)
    }

    /// Is the access a plain unordered access?
    pub fn is_unordered(self) -> bool {
        self.contains(Decorators::MO_UNORDERED)
    }
}

/// Must the access be bracketed by CPU order barriers?
///
/// Atomics always are. An unsafe access is when its location is unknown, when it is ordered,
/// or when it is a mismatched access outside an array: the alias class of such an access cannot
/// be trusted to keep other accesses away from it.
pub fn needs_cpu_membar(d: Decorators, adr_is_array: bool) -> bool {
    if d.is_atomic() {
        return true;
    }
    if d.contains(Decorators::C2_UNSAFE_ACCESS) {
        return d.is_mixed()
            || !d.is_unordered()
            || (d.contains(Decorators::C2_MISMATCHED) && !adr_is_array);
    }
    debug_assert!(!d.is_mixed(), "location unknown for a safe access");
    false
}

/// The barriers that surround one access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FencePlan {
    /// Barrier emitted before the access.
    pub leading: Option<Opcode>,
    /// Whether a `MemBarCPUOrder` is emitted on both sides of the access.
    pub cpu_order: bool,
    /// Barrier emitted after the access, with the access as its precedent.
    pub trailing: Option<Opcode>,
}

impl FencePlan {
    /// The plan for an access with decorators `d`.
    ///
    /// `iriw` selects the variant for machines that are not multiple-copy atomic: volatile
    /// loads then get the full fence in front instead of volatile stores getting it behind.
    pub fn for_access(d: Decorators, adr_is_array: bool, iriw: bool) -> FencePlan {
        let seq_cst = d.contains(Decorators::MO_SEQ_CST);
        let release = d.contains(Decorators::MO_RELEASE);
        let acquire = d.contains(Decorators::MO_ACQUIRE);
        let (leading, trailing) = if d.is_atomic() {
            let leading = if release {
                Some(Opcode::MemBarRelease)
            } else if seq_cst {
                Some(if iriw {
                    Opcode::MemBarVolatile
                } else {
                    Opcode::MemBarRelease
                })
            } else {
                None
            };
            let trailing = (acquire || seq_cst).then_some(Opcode::MemBarAcquire);
            (leading, trailing)
        } else if d.is_write() {
            let leading = (seq_cst || release).then_some(Opcode::MemBarRelease);
            let trailing = (seq_cst && !iriw).then_some(Opcode::MemBarVolatile);
            (leading, trailing)
        } else {
            let leading = (seq_cst && iriw).then_some(Opcode::MemBarVolatile);
            let trailing = (seq_cst || acquire).then_some(Opcode::MemBarAcquire);
            (leading, trailing)
        };
        FencePlan {
            leading,
            cpu_order: needs_cpu_membar(d, adr_is_array),
            trailing,
        }
    }

    /// Does the plan emit nothing?
    pub fn is_empty(&self) -> bool {
        self.leading.is_none() && !self.cpu_order && self.trailing.is_none()
    }
}

/// The ordering attached to the memory node itself.
///
/// Stores of references are releasing even when unordered: the stored reference may point to a
/// freshly created object whose initialization must be visible first.
pub fn mem_node_mo(d: Decorators, bt: BasicType) -> MemOrder {
    if d.contains(Decorators::MO_SEQ_CST) {
        if d.is_atomic() {
            MemOrder::SeqCst
        } else if d.is_write() {
            MemOrder::Release
        } else {
            MemOrder::Acquire
        }
    } else if d.contains(Decorators::MO_RELEASE) {
        MemOrder::Release
    } else if d.contains(Decorators::MO_ACQUIRE) {
        MemOrder::Acquire
    } else if d.is_write() && bt.is_reference() {
        MemOrder::Release
    } else {
        MemOrder::Unordered
    }
}

impl fmt::Display for FencePlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.leading {
            Some(op) => write!(f, "{op:?}")?,
            None => f.write_str("-")?,
        }
        f.write_str(if self.cpu_order { " cpu " } else { " " })?;
        match self.trailing {
            Some(op) => write!(f, "{op:?}"),
            None => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(mo: Decorators, rw: Decorators) -> Decorators {
        (mo | rw).fixup(BasicType::Int, false)
    }

    #[test]
    fn defaults() {
        let d = Decorators::C2_READ_ACCESS.fixup(BasicType::Object, false);
        assert!(d.contains(Decorators::MO_UNORDERED | Decorators::IN_HEAP));
        assert!(d.contains(Decorators::ON_STRONG_OOP_REF));
        let d = Decorators::C2_READ_ACCESS.fixup(BasicType::Int, false);
        assert!(!d.intersects(Decorators::REF_STRENGTH_MASK));
    }

    #[test]
    fn unsafe_loads_are_pinned() {
        let d = (Decorators::C2_READ_ACCESS | Decorators::C2_UNSAFE_ACCESS | Decorators::IN_HEAP)
            .fixup(BasicType::Int, false);
        assert!(d.contains(Decorators::C2_CONTROL_DEPENDENT_LOAD));
        let d = (Decorators::C2_READ_ACCESS | Decorators::C2_UNSAFE_ACCESS | Decorators::IN_HEAP)
            .fixup(BasicType::Int, true);
        assert!(!d.contains(Decorators::C2_CONTROL_DEPENDENT_LOAD));
    }

    #[test]
    fn volatile_store_and_load() {
        let st = FencePlan::for_access(
            access(Decorators::MO_SEQ_CST, Decorators::C2_WRITE_ACCESS),
            false,
            false,
        );
        assert_eq!(st.leading, Some(Opcode::MemBarRelease));
        assert_eq!(st.trailing, Some(Opcode::MemBarVolatile));
        assert!(!st.cpu_order);

        let ld = FencePlan::for_access(
            access(Decorators::MO_SEQ_CST, Decorators::C2_READ_ACCESS),
            false,
            true,
        );
        assert_eq!(ld.leading, Some(Opcode::MemBarVolatile));
        assert_eq!(ld.trailing, Some(Opcode::MemBarAcquire));

        let plain = FencePlan::for_access(access(Decorators::empty(), Decorators::C2_READ_ACCESS), false, false);
        assert!(plain.is_empty());
        assert_eq!(plain.to_string(), "- -");
    }

    #[test]
    fn orders() {
        let w = Decorators::C2_WRITE_ACCESS;
        let rw = Decorators::C2_READ_ACCESS | Decorators::C2_WRITE_ACCESS;
        assert_eq!(mem_node_mo(Decorators::MO_SEQ_CST | rw, BasicType::Int), MemOrder::SeqCst);
        assert_eq!(mem_node_mo(Decorators::MO_UNORDERED | w, BasicType::Object), MemOrder::Release);
        assert_eq!(mem_node_mo(Decorators::MO_UNORDERED | w, BasicType::Int), MemOrder::Unordered);
        assert_eq!(
            mem_node_mo(Decorators::MO_ACQUIRE | Decorators::C2_READ_ACCESS, BasicType::Int),
            MemOrder::Acquire
        );
    }
}
