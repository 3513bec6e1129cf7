//! Loaded classes and their object layout.
//!
//! Objects start with an 8 byte mark word followed by a 4 byte compressed class pointer. Instance
//! fields are packed after the header in declaration order, each aligned to its own size; arrays
//! keep their length right after the header and start their elements at a fixed base offset.

use crate::entity::PrimaryMap;
use crate::ir::entities::Klass;
use crate::ir::types::BasicType;
use bitflags::bitflags;

/// Offset of the mark word.
pub const MARK_OFFSET: i32 = 0;
/// Offset of the compressed class pointer.
pub const KLASS_OFFSET: i32 = 8;
/// Size of the object header.
pub const HEADER_SIZE: i32 = 12;
/// Offset of an array's length.
pub const ARRAY_LENGTH_OFFSET: i32 = 12;
/// Offset of an array's first element.
pub const ARRAY_BASE_OFFSET: i32 = 16;
/// Heap objects are aligned to this many bytes.
pub const OBJECT_ALIGNMENT: i32 = 8;

bitflags! {
    /// Properties of a class that matter to the optimizer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct KlassFlags: u16 {
        /// Instances must be registered for finalization.
        const HAS_FINALIZER = 1 << 0;
        /// The VM adds fields that are not declared in the class file.
        const HAS_INJECTED_FIELDS = 1 << 1;
        /// Some loaded class extends this one.
        const HAS_SUBKLASS = 1 << 2;
        /// A primitive wrapper class with a `valueOf` cache.
        const IS_BOX = 1 << 3;
        /// `java.lang.ref.Reference` or a subclass.
        const IS_REFERENCE = 1 << 4;
        /// Abstract class or interface.
        const NOT_INSTANTIABLE = 1 << 5;
    }
}

/// Instance class or array class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KlassKind {
    /// A class with named fields.
    Instance,
    /// An array class.
    Array {
        /// Element type.
        elem: BasicType,
    },
}

/// A non-static field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Byte offset within the object.
    pub offset: i32,
    /// Declared type.
    pub bt: BasicType,
    /// Class declaring the field.
    pub holder: Klass,
}

/// A loaded class.
#[derive(Clone, Debug)]
pub struct KlassData {
    /// Class name.
    pub name: String,
    /// Instance or array.
    pub kind: KlassKind,
    /// Direct superclass, `None` for `java.lang.Object`.
    pub super_klass: Option<Klass>,
    /// Fields declared by this class itself.
    pub fields: Vec<FieldInfo>,
    /// Class properties.
    pub flags: KlassFlags,
    /// First byte after the last field.
    fields_end: i32,
}

/// All classes known to the compilation.
pub struct KlassTable {
    klasses: PrimaryMap<Klass, KlassData>,
    object: Klass,
    compressed_oops: bool,
}

fn align_up(v: i32, align: i32) -> i32 {
    (v + align - 1) & !(align - 1)
}

impl KlassTable {
    /// Create a table holding only `java.lang.Object`.
    pub fn new(compressed_oops: bool) -> Self {
        let mut klasses = PrimaryMap::new();
        let object = klasses.push(KlassData {
            name: "java/lang/Object".to_string(),
            kind: KlassKind::Instance,
            super_klass: None,
            fields: Vec::new(),
            flags: KlassFlags::empty(),
            fields_end: HEADER_SIZE,
        });
        Self {
            klasses,
            object,
            compressed_oops,
        }
    }

    /// `java.lang.Object`.
    pub fn object(&self) -> Klass {
        self.object
    }

    /// Are heap references four bytes wide?
    pub fn compressed_oops(&self) -> bool {
        self.compressed_oops
    }

    /// Define an instance class with the given non-static fields, laid out after those of
    /// `super_klass` (or `java.lang.Object`).
    pub fn define_instance(
        &mut self,
        name: &str,
        super_klass: Option<Klass>,
        fields: &[(&str, BasicType)],
        flags: KlassFlags,
    ) -> Klass {
        let sup = super_klass.unwrap_or(self.object);
        let mut offset = self.klasses[sup].fields_end;
        let holder = Klass::from_u32(self.klasses.len() as u32);
        let mut declared = Vec::with_capacity(fields.len());
        for &(fname, bt) in fields {
            let size = bt.size_in_bytes(self.compressed_oops);
            offset = align_up(offset, size);
            declared.push(FieldInfo {
                name: fname.to_string(),
                offset,
                bt,
                holder,
            });
            offset += size;
        }
        self.klasses[sup].flags |= KlassFlags::HAS_SUBKLASS;
        let k = self.klasses.push(KlassData {
            name: name.to_string(),
            kind: KlassKind::Instance,
            super_klass: Some(sup),
            fields: declared,
            flags,
            fields_end: offset,
        });
        debug_assert_eq!(k, holder);
        k
    }

    /// The array class with element type `elem`, creating it on first use.
    pub fn array_of(&mut self, elem: BasicType) -> Klass {
        let elem = if elem == BasicType::Array {
            BasicType::Object
        } else {
            elem
        };
        if let Some((k, _)) = self
            .klasses
            .iter()
            .find(|(_, d)| d.kind == KlassKind::Array { elem })
        {
            return k;
        }
        self.klasses.push(KlassData {
            name: format!("[{elem}"),
            kind: KlassKind::Array { elem },
            super_klass: Some(self.object),
            fields: Vec::new(),
            flags: KlassFlags::empty(),
            fields_end: ARRAY_BASE_OFFSET,
        })
    }

    /// Class data.
    pub fn get(&self, k: Klass) -> &KlassData {
        &self.klasses[k]
    }

    /// Class flags.
    pub fn flags(&self, k: Klass) -> KlassFlags {
        self.klasses[k].flags
    }

    /// Is `k` an array class?
    pub fn is_array(&self, k: Klass) -> bool {
        matches!(self.klasses[k].kind, KlassKind::Array { .. })
    }

    /// Element type of an array class.
    pub fn element_type(&self, k: Klass) -> Option<BasicType> {
        match self.klasses[k].kind {
            KlassKind::Array { elem } => Some(elem),
            KlassKind::Instance => None,
        }
    }

    /// Size of an instance of `k`, aligned.
    pub fn instance_size(&self, k: Klass) -> i32 {
        align_up(self.klasses[k].fields_end, OBJECT_ALIGNMENT)
    }

    /// Size of an array of class `k` with `len` elements, aligned.
    pub fn array_size(&self, k: Klass, len: i32) -> i32 {
        let elem = self.element_type(k).unwrap_or(BasicType::Object);
        align_up(
            ARRAY_BASE_OFFSET + len * elem.size_in_bytes(self.compressed_oops),
            OBJECT_ALIGNMENT,
        )
    }

    /// All non-static fields of an instance of `k`, inherited ones first, ordered by offset.
    pub fn nonstatic_fields(&self, k: Klass) -> Vec<&FieldInfo> {
        let mut chain = Vec::new();
        let mut cur = Some(k);
        while let Some(c) = cur {
            chain.push(c);
            cur = self.klasses[c].super_klass;
        }
        let mut fields: Vec<&FieldInfo> = chain
            .iter()
            .rev()
            .flat_map(|&c| self.klasses[c].fields.iter())
            .collect();
        fields.sort_by_key(|f| f.offset);
        fields
    }

    /// The field of `k` (or a superclass) at `offset`.
    pub fn field_at(&self, k: Klass, offset: i32) -> Option<&FieldInfo> {
        let mut cur = Some(k);
        while let Some(c) = cur {
            if let Some(f) = self.klasses[c].fields.iter().find(|f| f.offset == offset) {
                return Some(f);
            }
            cur = self.klasses[c].super_klass;
        }
        None
    }

    /// Is `sub` the same class as `sup`, or one of its subclasses?
    pub fn is_subclass_of(&self, sub: Klass, sup: Klass) -> bool {
        let mut cur = Some(sub);
        while let Some(c) = cur {
            if c == sup {
                return true;
            }
            cur = self.klasses[c].super_klass;
        }
        false
    }

    /// The closest common superclass of `a` and `b`.
    pub fn common_super(&self, a: Klass, b: Klass) -> Klass {
        let mut cur = Some(a);
        while let Some(c) = cur {
            if self.is_subclass_of(b, c) {
                return c;
            }
            cur = self.klasses[c].super_klass;
        }
        self.object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_layout() {
        let mut kt = KlassTable::new(true);
        let point = kt.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        let fields = kt.nonstatic_fields(point);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].offset, 12);
        assert_eq!(fields[1].offset, 16);
        assert_eq!(kt.instance_size(point), 24);
        assert!(kt.flags(kt.object()).contains(KlassFlags::HAS_SUBKLASS));

        let p3 = kt.define_instance(
            "Point3",
            Some(point),
            &[("z", BasicType::Long), ("next", BasicType::Object)],
            KlassFlags::empty(),
        );
        assert_eq!(kt.field_at(p3, 24).map(|f| f.name.as_str()), Some("z"));
        assert_eq!(kt.field_at(p3, 32).map(|f| f.bt), Some(BasicType::Object));
        assert_eq!(kt.field_at(p3, 12).map(|f| f.holder), Some(point));
        assert_eq!(kt.common_super(p3, point), point);
    }

    #[test]
    fn arrays() {
        let mut kt = KlassTable::new(false);
        let ia = kt.array_of(BasicType::Int);
        assert_eq!(kt.array_of(BasicType::Int), ia);
        assert_eq!(kt.array_size(ia, 3), 32);
        let oa = kt.array_of(BasicType::Object);
        assert_eq!(kt.array_size(oa, 2), 32);
        assert!(kt.is_subclass_of(oa, kt.object()));
    }
}
