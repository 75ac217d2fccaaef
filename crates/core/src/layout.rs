//! Layout engine: size, alignment, field offsets, element strides.
//!
//! Layouts describe the language's view of memory: structs lay their fields
//! out C-style (each field aligned, total size rounded up to the struct
//! alignment), unions are a tag word followed by the widest variant payload.
//! Heap-resident kinds (strings, arrays, maps, ranges, channels, tasks) are
//! one handle wide when embedded in another aggregate.

use crate::types::{TypeId, TypeKind, TypeTable};
use thiserror::Error;

/// Size and alignment of a type, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
}

impl Layout {
    fn scalar(size: u64) -> Layout {
        Layout {
            size,
            align: size.max(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout of incomplete type {0}")]
    Incomplete(TypeId),

    #[error("{0} is not a struct type")]
    NotAStruct(TypeId),

    #[error("{0} is not an array type")]
    NotAnArray(TypeId),

    #[error("struct {ty} has no field {index}")]
    NoSuchField { ty: TypeId, index: u32 },
}

fn align_up(offset: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

impl TypeTable {
    /// Size and alignment of `ty`. Errors on the UNKNOWN sentinel.
    pub fn layout_of(&self, ty: TypeId) -> Result<Layout, LayoutError> {
        let kind = self.kind(ty).ok_or(LayoutError::Incomplete(ty))?;
        Ok(match kind {
            TypeKind::Unit => Layout { size: 0, align: 1 },
            TypeKind::Bool => Layout::scalar(1),
            TypeKind::Int(bits) | TypeKind::Uint(bits) => Layout::scalar(u64::from(*bits) / 8),
            // Arbitrary-precision numbers, ropes, and the container kinds are
            // handle-sized when embedded in an aggregate.
            TypeKind::IntBig
            | TypeKind::UintBig
            | TypeKind::FloatBig
            | TypeKind::Str
            | TypeKind::Array(_)
            | TypeKind::Map(_, _)
            | TypeKind::Range(_)
            | TypeKind::Chan(_)
            | TypeKind::Task(_)
            | TypeKind::Func
            | TypeKind::Ref(_)
            | TypeKind::RefMut(_)
            | TypeKind::Ptr => Layout::scalar(8),
            TypeKind::Struct { fields, .. } => {
                let mut size = 0u64;
                let mut align = 1u64;
                for (_, field_ty) in fields {
                    let l = self.layout_of(*field_ty)?;
                    size = align_up(size, l.align) + l.size;
                    align = align.max(l.align);
                }
                Layout {
                    size: align_up(size, align),
                    align,
                }
            }
            TypeKind::Union { variants, .. } => {
                // Tag word, then the widest variant payload laid out as a
                // struct would be.
                let mut payload_size = 0u64;
                let mut align = 8u64;
                for variant in variants {
                    let mut size = 0u64;
                    for field_ty in &variant.payload {
                        let l = self.layout_of(*field_ty)?;
                        size = align_up(size, l.align) + l.size;
                        align = align.max(l.align);
                    }
                    payload_size = payload_size.max(size);
                }
                Layout {
                    size: align_up(8 + payload_size, align),
                    align,
                }
            }
        })
    }

    /// Byte offset of field `index` within struct `ty`.
    pub fn field_offset(&self, ty: TypeId, index: u32) -> Result<u64, LayoutError> {
        let fields = self
            .struct_fields(ty)
            .ok_or(LayoutError::NotAStruct(ty))?
            .to_vec();
        if index as usize >= fields.len() {
            return Err(LayoutError::NoSuchField { ty, index });
        }
        let mut offset = 0u64;
        for (i, (_, field_ty)) in fields.iter().enumerate() {
            let l = self.layout_of(*field_ty)?;
            offset = align_up(offset, l.align);
            if i == index as usize {
                return Ok(offset);
            }
            offset += l.size;
        }
        unreachable!("index validated above")
    }

    /// Byte stride between consecutive elements of array type `ty`.
    pub fn elem_stride(&self, ty: TypeId) -> Result<u64, LayoutError> {
        let elem = self.elem_of(ty).ok_or(LayoutError::NotAnArray(ty))?;
        let l = self.layout_of(elem)?;
        Ok(align_up(l.size, l.align).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_layouts() {
        let mut t = TypeTable::new();
        assert_eq!(t.layout_of(t.unit()).unwrap(), Layout { size: 0, align: 1 });
        assert_eq!(t.layout_of(t.bool_()).unwrap(), Layout { size: 1, align: 1 });
        let i16_ = t.int_of_width(16, true);
        assert_eq!(t.layout_of(i16_).unwrap(), Layout { size: 2, align: 2 });
        assert_eq!(t.layout_of(t.str_()).unwrap(), Layout { size: 8, align: 8 });
    }

    #[test]
    fn test_struct_layout_padding() {
        let mut t = TypeTable::new();
        let i8_ = t.int_of_width(8, true);
        let i64_ = t.int64();
        // { b: i8, n: i64 } -> n aligned to 8, total 16
        let s = t.struct_of("Mixed", &[("b", i8_), ("n", i64_)]);
        let l = t.layout_of(s).unwrap();
        assert_eq!(l.size, 16);
        assert_eq!(l.align, 8);
        assert_eq!(t.field_offset(s, 0).unwrap(), 0);
        assert_eq!(t.field_offset(s, 1).unwrap(), 8);
    }

    #[test]
    fn test_union_layout_widest_variant() {
        let mut t = TypeTable::new();
        let i64_ = t.int64();
        let opt = t.option_of(i64_);
        // tag word + one i64 payload
        assert_eq!(t.layout_of(opt).unwrap().size, 16);
    }

    #[test]
    fn test_elem_stride() {
        let mut t = TypeTable::new();
        let i8_ = t.int_of_width(8, true);
        let arr = t.array_of(i8_);
        assert_eq!(t.elem_stride(arr).unwrap(), 1);
        let arr64 = t.array_of(t.int64());
        assert_eq!(t.elem_stride(arr64).unwrap(), 8);
    }

    #[test]
    fn test_incomplete_type_errors() {
        let t = TypeTable::new();
        assert_eq!(
            t.layout_of(TypeId::UNKNOWN),
            Err(LayoutError::Incomplete(TypeId::UNKNOWN))
        );
    }

    #[test]
    fn test_field_offset_bad_index() {
        let mut t = TypeTable::new();
        let int64 = t.int64();
        let s = t.struct_of("One", &[("x", int64)]);
        assert!(matches!(
            t.field_offset(s, 3),
            Err(LayoutError::NoSuchField { .. })
        ));
    }
}
