//! Alias classes.
//!
//! Every address type is flattened to a canonical representative; each distinct representative
//! gets its own [`AliasIdx`]. Instance fields share a slice per declaring class and offset, all
//! elements of arrays with the same element type share a slice, and known instances produced by
//! escape analysis get slices of their own whose "general" index is the slice they were split
//! from.

use crate::FxHashMap;
use crate::entity::PrimaryMap;
use crate::ir::entities::AliasIdx;
use crate::ir::klass::{ARRAY_LENGTH_OFFSET, HEADER_SIZE, KlassTable};
use crate::ir::types::{BasicType, Offset, PtrKind, PtrNull, TypePtr};

/// One alias class.
#[derive(Clone, Debug)]
pub struct AliasType {
    /// Canonical address type.
    pub adr_type: TypePtr,
    /// The same slice with the instance identity removed.
    pub general: AliasIdx,
}

/// All alias classes of a compilation.
pub struct AliasTable {
    types: PrimaryMap<AliasIdx, AliasType>,
    index: FxHashMap<TypePtr, AliasIdx>,
}

enum Flat {
    Top,
    Bot,
    Raw,
    Typed(TypePtr),
}

impl Default for AliasTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasTable {
    /// A table holding the sentinel slices.
    pub fn new() -> Self {
        let mut types = PrimaryMap::new();
        let top = TypePtr::bottom().with_offset(Offset::Top);
        // Index 0 is never handed out.
        types.push(AliasType {
            adr_type: top.clone(),
            general: AliasIdx::TOP,
        });
        types.push(AliasType {
            adr_type: top,
            general: AliasIdx::TOP,
        });
        types.push(AliasType {
            adr_type: TypePtr::bottom(),
            general: AliasIdx::BOT,
        });
        types.push(AliasType {
            adr_type: TypePtr::raw(PtrNull::Maybe, Offset::Bot),
            general: AliasIdx::RAW,
        });
        debug_assert_eq!(types.len(), AliasIdx::FIRST_GENERAL.as_u32() as usize);
        Self {
            types,
            index: FxHashMap::default(),
        }
    }

    fn flatten(tp: &TypePtr, klasses: &KlassTable) -> Flat {
        let canonical = |kind, klass, elem, offset| {
            Flat::Typed(TypePtr {
                kind,
                null: PtrNull::Maybe,
                klass,
                exact: false,
                offset,
                instance_id: tp.instance_id,
                elem,
                len: None,
            })
        };
        if tp.offset == Offset::Top {
            return Flat::Top;
        }
        match tp.kind {
            PtrKind::Raw => Flat::Raw,
            PtrKind::Any => Flat::Bot,
            PtrKind::Klass => canonical(PtrKind::Klass, None, None, tp.offset),
            PtrKind::Inst => match tp.offset {
                Offset::Known(o) if o < HEADER_SIZE => {
                    canonical(PtrKind::Inst, Some(klasses.object()), None, tp.offset)
                }
                Offset::Known(o) => {
                    let holder = tp
                        .klass
                        .and_then(|k| klasses.field_at(k, o))
                        .map(|f| f.holder)
                        .or(tp.klass);
                    canonical(PtrKind::Inst, holder, None, tp.offset)
                }
                _ => Flat::Bot,
            },
            PtrKind::Ary => match tp.offset {
                Offset::Known(ARRAY_LENGTH_OFFSET) => {
                    canonical(PtrKind::Ary, None, None, tp.offset)
                }
                Offset::Known(o) if o < HEADER_SIZE => {
                    canonical(PtrKind::Inst, Some(klasses.object()), None, tp.offset)
                }
                _ => {
                    let elem = match tp.elem {
                        Some(BasicType::Array) | Some(BasicType::NarrowOop) | None => {
                            BasicType::Object
                        }
                        Some(e) => e,
                    };
                    canonical(PtrKind::Ary, None, Some(elem), Offset::Bot)
                }
            },
        }
    }

    /// The alias class of addresses of type `tp`, created on first use.
    pub fn index_of(&mut self, tp: &TypePtr, klasses: &KlassTable) -> AliasIdx {
        let flat = match Self::flatten(tp, klasses) {
            Flat::Top => return AliasIdx::TOP,
            Flat::Bot => return AliasIdx::BOT,
            Flat::Raw => return AliasIdx::RAW,
            Flat::Typed(t) => t,
        };
        if let Some(&idx) = self.index.get(&flat) {
            return idx;
        }
        let general = if flat.instance_id.is_some() {
            self.index_of(&flat.cast_to_instance_id(None).cast_to_exactness(false), klasses)
        } else {
            AliasIdx::from_u32(self.types.len() as u32)
        };
        let idx = self.types.push(AliasType {
            adr_type: flat.clone(),
            general,
        });
        self.index.insert(flat, idx);
        idx
    }

    /// The alias class of `tp` if it already exists.
    pub fn find_index(&self, tp: &TypePtr, klasses: &KlassTable) -> Option<AliasIdx> {
        match Self::flatten(tp, klasses) {
            Flat::Top => Some(AliasIdx::TOP),
            Flat::Bot => Some(AliasIdx::BOT),
            Flat::Raw => Some(AliasIdx::RAW),
            Flat::Typed(t) => self.index.get(&t).copied(),
        }
    }

    /// Canonical address type of a slice.
    pub fn adr_type(&self, idx: AliasIdx) -> &TypePtr {
        &self.types[idx].adr_type
    }

    /// The slice `idx` was split from, or `idx` itself.
    pub fn general_index(&self, idx: AliasIdx) -> AliasIdx {
        self.types[idx].general
    }

    /// Number of slices, sentinels included. Every index is below this.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Never true: the sentinels always exist.
    pub fn is_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::entities::Node;
    use crate::ir::klass::KlassFlags;

    #[test]
    fn slices() {
        let mut kt = KlassTable::new(true);
        let point = kt.define_instance(
            "Point",
            None,
            &[("x", BasicType::Int), ("y", BasicType::Int)],
            KlassFlags::empty(),
        );
        let sub = kt.define_instance("Sub", Some(point), &[], KlassFlags::empty());
        let ia = kt.array_of(BasicType::Int);
        let mut at = AliasTable::new();

        let x = TypePtr::inst(point, true, PtrNull::NotNull).add_offset(12);
        let x_sub = TypePtr::inst(sub, false, PtrNull::Maybe).add_offset(12);
        let y = TypePtr::inst(point, true, PtrNull::NotNull).add_offset(16);
        let ix = at.index_of(&x, &kt);
        assert_eq!(at.index_of(&x_sub, &kt), ix);
        assert_ne!(at.index_of(&y, &kt), ix);
        assert_eq!(at.general_index(ix), ix);

        let inst = x.cast_to_instance_id(Some(Node::from_u32(40)));
        let ii = at.index_of(&inst, &kt);
        assert_ne!(ii, ix);
        assert_eq!(at.general_index(ii), ix);
        assert!(at.adr_type(ii).is_known_instance());

        let e0 = TypePtr::ary(ia, BasicType::Int, Some(4), true, PtrNull::NotNull).add_offset(16);
        let e1 = e0.add_offset(4);
        assert_eq!(at.index_of(&e0, &kt), at.index_of(&e1, &kt));
        assert_eq!(at.index_of(&TypePtr::bottom(), &kt), AliasIdx::BOT);
        assert_eq!(
            at.index_of(&TypePtr::raw(PtrNull::NotNull, Offset::Known(8)), &kt),
            AliasIdx::RAW
        );
    }
}
