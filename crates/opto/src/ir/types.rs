//! The type lattice attached to every node.
//!
//! Only the parts of the lattice this crate reasons about are modelled precisely: pointer types
//! carry the class, exactness, offset and instance identity that alias analysis and escape
//! analysis depend on. Integer types are either a known constant or unknown.

use crate::ir::entities::{Klass, Node};
use crate::ir::klass::KlassTable;
use core::fmt;

/// Java-level basic types, plus the VM-internal address and narrow oop types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BasicType {
    /// `boolean`.
    Boolean,
    /// `char`.
    Char,
    /// `float`.
    Float,
    /// `double`.
    Double,
    /// `byte`.
    Byte,
    /// `short`.
    Short,
    /// `int`.
    Int,
    /// `long`.
    Long,
    /// Object reference.
    Object,
    /// Array reference.
    Array,
    /// No value.
    Void,
    /// Untyped machine word.
    Address,
    /// Compressed object reference.
    NarrowOop,
}

impl BasicType {
    /// Is this a heap reference?
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            BasicType::Object | BasicType::Array | BasicType::NarrowOop
        )
    }

    /// Size of a value of this type stored in the heap.
    pub fn size_in_bytes(self, compressed_oops: bool) -> i32 {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float | BasicType::NarrowOop => 4,
            BasicType::Long | BasicType::Double | BasicType::Address => 8,
            BasicType::Object | BasicType::Array => {
                if compressed_oops {
                    4
                } else {
                    8
                }
            }
            BasicType::Void => 0,
        }
    }

    /// Types narrower than `int`, which are widened when loaded.
    pub fn is_subword(self) -> bool {
        matches!(
            self,
            BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short
        )
    }

    /// The type values of this basic type have once they are in a register.
    pub fn stack_type(self) -> BasicType {
        match self {
            BasicType::Boolean | BasicType::Byte | BasicType::Char | BasicType::Short => {
                BasicType::Int
            }
            BasicType::Array => BasicType::Object,
            other => other,
        }
    }
}

impl fmt::Display for BasicType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Object => "object",
            BasicType::Array => "array",
            BasicType::Void => "void",
            BasicType::Address => "address",
            BasicType::NarrowOop => "narrowoop",
        })
    }
}

/// A byte offset into an object, or one of the two lattice extremes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Offset {
    /// No offset at all (dead code).
    Top,
    /// Some unknown offset.
    Bot,
    /// A known byte offset.
    Known(i32),
}

impl Offset {
    /// Add two offsets.
    pub fn add(self, other: Offset) -> Offset {
        match (self, other) {
            (Offset::Top, _) | (_, Offset::Top) => Offset::Top,
            (Offset::Bot, _) | (_, Offset::Bot) => Offset::Bot,
            (Offset::Known(a), Offset::Known(b)) => Offset::Known(a + b),
        }
    }

    /// Lattice meet: equal offsets stay, anything else falls to `Bot`.
    pub fn meet(self, other: Offset) -> Offset {
        match (self, other) {
            (Offset::Top, o) | (o, Offset::Top) => o,
            (a, b) if a == b => a,
            _ => Offset::Bot,
        }
    }

    /// The offset, if known.
    pub fn known(self) -> Option<i32> {
        match self {
            Offset::Known(o) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Offset::Top => f.write_str("+top"),
            Offset::Bot => f.write_str("+any"),
            Offset::Known(o) => write!(f, "+{o}"),
        }
    }
}

/// What a pointer points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PtrKind {
    /// Anything: the generic pointer, or the null constant.
    Any,
    /// Raw memory, not a Java object.
    Raw,
    /// An instance of a class.
    Inst,
    /// An array.
    Ary,
    /// A class's metadata.
    Klass,
}

/// Nullness of a pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PtrNull {
    /// Always null.
    Null,
    /// A known non-null constant.
    Constant,
    /// Never null.
    NotNull,
    /// Possibly null.
    Maybe,
}

/// A pointer type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypePtr {
    /// Kind of memory pointed to.
    pub kind: PtrKind,
    /// Nullness.
    pub null: PtrNull,
    /// Class of the object (or of the class pointer). `None` for `Any`, `Raw` and for arrays whose
    /// class is not statically known.
    pub klass: Option<Klass>,
    /// The class is exact; no subclass is possible.
    pub exact: bool,
    /// Offset of the address from the start of the object.
    pub offset: Offset,
    /// The allocation this pointer uniquely refers to, after escape analysis made it a known
    /// instance.
    pub instance_id: Option<Node>,
    /// Element type of an array.
    pub elem: Option<BasicType>,
    /// Constant length of an array.
    pub len: Option<i32>,
}

impl TypePtr {
    fn new(kind: PtrKind, null: PtrNull) -> Self {
        Self {
            kind,
            null,
            klass: None,
            exact: false,
            offset: Offset::Known(0),
            instance_id: None,
            elem: None,
            len: None,
        }
    }

    /// The generic pointer with unknown offset. Its alias class is all of memory.
    pub fn bottom() -> Self {
        Self {
            offset: Offset::Bot,
            ..Self::new(PtrKind::Any, PtrNull::Maybe)
        }
    }

    /// The null constant.
    pub fn null_ptr() -> Self {
        Self::new(PtrKind::Any, PtrNull::Null)
    }

    /// A raw pointer.
    pub fn raw(null: PtrNull, offset: Offset) -> Self {
        Self {
            offset,
            ..Self::new(PtrKind::Raw, null)
        }
    }

    /// A pointer to an instance of `klass`.
    pub fn inst(klass: Klass, exact: bool, null: PtrNull) -> Self {
        Self {
            klass: Some(klass),
            exact,
            ..Self::new(PtrKind::Inst, null)
        }
    }

    /// A pointer to an array of class `klass` holding `elem` values.
    pub fn ary(klass: Klass, elem: BasicType, len: Option<i32>, exact: bool, null: PtrNull) -> Self {
        Self {
            klass: Some(klass),
            exact,
            elem: Some(elem),
            len,
            ..Self::new(PtrKind::Ary, null)
        }
    }

    /// A constant pointer to the metadata of `klass`.
    pub fn klass_ptr(klass: Klass) -> Self {
        Self {
            klass: Some(klass),
            exact: true,
            ..Self::new(PtrKind::Klass, PtrNull::Constant)
        }
    }

    /// Is this a pointer to a Java object?
    pub fn is_oopptr(&self) -> bool {
        matches!(self.kind, PtrKind::Inst | PtrKind::Ary)
    }

    /// Is this a pointer to a Java instance?
    pub fn is_instptr(&self) -> bool {
        self.kind == PtrKind::Inst
    }

    /// Is this a pointer to a Java array?
    pub fn is_aryptr(&self) -> bool {
        self.kind == PtrKind::Ary
    }

    /// Is this a raw pointer?
    pub fn is_raw(&self) -> bool {
        self.kind == PtrKind::Raw
    }

    /// Is this the null constant?
    pub fn is_null(&self) -> bool {
        self.null == PtrNull::Null
    }

    /// May this pointer be null?
    pub fn maybe_null(&self) -> bool {
        matches!(self.null, PtrNull::Null | PtrNull::Maybe)
    }

    /// Does this pointer name exactly one allocation?
    pub fn is_known_instance(&self) -> bool {
        self.instance_id.is_some()
    }

    /// This pointer moved by `delta` bytes.
    pub fn add_offset(&self, delta: i32) -> Self {
        self.with_offset(self.offset.add(Offset::Known(delta)))
    }

    /// This pointer with a different offset.
    pub fn with_offset(&self, offset: Offset) -> Self {
        Self {
            offset,
            ..self.clone()
        }
    }

    /// This pointer tagged with (or stripped of) an instance identity.
    pub fn cast_to_instance_id(&self, instance_id: Option<Node>) -> Self {
        Self {
            instance_id,
            exact: self.exact || instance_id.is_some(),
            ..self.clone()
        }
    }

    /// This pointer with different nullness.
    pub fn cast_to_null(&self, null: PtrNull) -> Self {
        Self {
            null,
            ..self.clone()
        }
    }

    /// This pointer with different exactness.
    pub fn cast_to_exactness(&self, exact: bool) -> Self {
        Self {
            exact,
            ..self.clone()
        }
    }

    /// Can an object of this type also be an object of type `other`?
    ///
    /// Used to detect paths made dead by type checks, where a cast claims a type unrelated to the
    /// allocation flowing into it.
    pub fn maybe_subtype_of(&self, other: &TypePtr, klasses: &KlassTable) -> bool {
        if !other.is_oopptr() {
            return other.kind == PtrKind::Any;
        }
        let (Some(mine), Some(theirs)) = (self.klass, other.klass) else {
            return true;
        };
        if other.klass == Some(klasses.object()) && other.is_instptr() {
            return true;
        }
        if self.kind != other.kind {
            return false;
        }
        if klasses.is_subclass_of(mine, theirs) {
            return true;
        }
        !self.exact && klasses.is_subclass_of(theirs, mine)
    }

    /// Lattice meet, as computed for a Phi merging both values.
    pub fn meet(&self, other: &TypePtr, klasses: &KlassTable) -> TypePtr {
        if self == other {
            return self.clone();
        }
        if self.is_null() && other.is_oopptr() {
            return other.cast_to_null(PtrNull::Maybe);
        }
        if other.is_null() && self.is_oopptr() {
            return self.cast_to_null(PtrNull::Maybe);
        }
        let null = match (self.null, other.null) {
            (a, b) if a == b => a,
            (PtrNull::Constant, PtrNull::NotNull) | (PtrNull::NotNull, PtrNull::Constant) => {
                PtrNull::NotNull
            }
            _ => PtrNull::Maybe,
        };
        if self.kind != other.kind {
            if self.is_oopptr() && other.is_oopptr() {
                return TypePtr::inst(klasses.object(), false, null)
                    .with_offset(self.offset.meet(other.offset));
            }
            return TypePtr::bottom();
        }
        let klass = match (self.klass, other.klass) {
            (Some(a), Some(b)) => Some(klasses.common_super(a, b)),
            _ => None,
        };
        TypePtr {
            kind: self.kind,
            null,
            klass,
            exact: self.exact && other.exact && self.klass == other.klass,
            offset: self.offset.meet(other.offset),
            instance_id: if self.instance_id == other.instance_id {
                self.instance_id
            } else {
                None
            },
            elem: if self.elem == other.elem {
                self.elem
            } else {
                Some(BasicType::Object)
            },
            len: if self.len == other.len { self.len } else { None },
        }
    }
}

impl fmt::Display for TypePtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            PtrKind::Any if self.is_null() => return f.write_str("null"),
            PtrKind::Any => f.write_str("ptr")?,
            PtrKind::Raw => f.write_str("rawptr")?,
            PtrKind::Inst => f.write_str("inst")?,
            PtrKind::Ary => f.write_str("ary")?,
            PtrKind::Klass => f.write_str("klassptr")?,
        }
        if let Some(k) = self.klass {
            write!(f, ":{k}")?;
        }
        if let Some(e) = self.elem {
            write!(f, "[{e}")?;
            if let Some(l) = self.len {
                write!(f, ";{l}")?;
            }
            f.write_str("]")?;
        }
        if self.exact {
            f.write_str(":exact")?;
        }
        match self.null {
            PtrNull::NotNull => f.write_str(":NotNull")?,
            PtrNull::Constant => f.write_str(":Const")?,
            _ => {}
        }
        write!(f, "{}", self.offset)?;
        if let Some(id) = self.instance_id {
            write!(f, " iid={id}")?;
        }
        Ok(())
    }
}

/// The type of a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// Dead: no value.
    Top,
    /// Any value.
    Bottom,
    /// Control flow.
    Control,
    /// A memory state.
    Memory,
    /// The I/O state.
    Io,
    /// The result of a multi-output node; its projections carry the real types.
    Tuple,
    /// A 32-bit integer, constant if known.
    Int(Option<i32>),
    /// A 64-bit integer, constant if known.
    Long(Option<i64>),
    /// A 32-bit float.
    Float,
    /// A 64-bit float.
    Double,
    /// A pointer.
    Ptr(TypePtr),
    /// A compressed heap reference.
    NarrowOop(TypePtr),
}

impl Type {
    /// The pointer type, if this is a (non-narrow) pointer.
    pub fn isa_ptr(&self) -> Option<&TypePtr> {
        match self {
            Type::Ptr(p) => Some(p),
            _ => None,
        }
    }

    /// The pointer type if this points to a Java object.
    pub fn isa_oopptr(&self) -> Option<&TypePtr> {
        self.isa_ptr().filter(|p| p.is_oopptr())
    }

    /// The pointer type behind either a pointer or a compressed pointer.
    pub fn make_ptr(&self) -> Option<&TypePtr> {
        match self {
            Type::Ptr(p) | Type::NarrowOop(p) => Some(p),
            _ => None,
        }
    }

    /// Is this a compressed reference?
    pub fn is_narrowoop(&self) -> bool {
        matches!(self, Type::NarrowOop(_))
    }

    /// Is this the dead type?
    pub fn is_top(&self) -> bool {
        *self == Type::Top
    }

    /// Is this a value whose points-to information matters?
    pub fn is_reference(&self) -> bool {
        match self.make_ptr() {
            Some(p) => p.is_oopptr() || p.is_null() || p.kind == PtrKind::Any,
            None => false,
        }
    }

    /// The constant value of an `int` or `long` typed node.
    pub fn int_con(&self) -> Option<i64> {
        match *self {
            Type::Int(Some(v)) => Some(i64::from(v)),
            Type::Long(Some(v)) => Some(v),
            _ => None,
        }
    }

    /// The type of a value of basic type `bt` loaded from the heap.
    pub fn of_basic_type(bt: BasicType) -> Type {
        match bt.stack_type() {
            BasicType::Int => Type::Int(None),
            BasicType::Long => Type::Long(None),
            BasicType::Float => Type::Float,
            BasicType::Double => Type::Double,
            BasicType::Address => Type::Ptr(TypePtr::raw(PtrNull::Maybe, Offset::Known(0))),
            BasicType::Void => Type::Top,
            _ => Type::Ptr(TypePtr::bottom().with_offset(Offset::Known(0))),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Top => f.write_str("top"),
            Type::Bottom => f.write_str("bottom"),
            Type::Control => f.write_str("control"),
            Type::Memory => f.write_str("memory"),
            Type::Io => f.write_str("abIO"),
            Type::Tuple => f.write_str("tuple"),
            Type::Int(Some(v)) => write!(f, "int:{v}"),
            Type::Int(None) => f.write_str("int"),
            Type::Long(Some(v)) => write!(f, "long:{v}"),
            Type::Long(None) => f.write_str("long"),
            Type::Float => f.write_str("float"),
            Type::Double => f.write_str("double"),
            Type::Ptr(p) => write!(f, "{p}"),
            Type::NarrowOop(p) => write!(f, "narrow {p}"),
        }
    }
}
