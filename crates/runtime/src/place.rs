//! Place evaluation: projection walking, loads, and stores.
//!
//! A place is a local/global root plus deref/field/index projections. The
//! walk produces a `Location`; loads through a location return a snapshot
//! (no reference-count change — `Operand::Copy` retains afterwards), stores
//! honor the mutability flag and implicitly release the overwritten value.
//! Union-typed destinations re-tag member-typed values to the declared slot
//! type so the outer tag layout travels with the value.

use crate::error::{PanicKind, VmError, VmResult, err};
use crate::frame::Slot;
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::value::{Location, LocationKind, Value, ValueKind};
use volt_core::{
    Const, FieldSel, LayoutError, Operand, Place, PlaceRoot, Projection, Rvalue, TypeId, TypeKind,
};

fn layout_panic(e: LayoutError) -> VmError {
    err(PanicKind::TypeMismatch, e.to_string())
}

impl Vm {
    /// Walk a place to its location, starting from the current frame.
    pub(crate) fn resolve_place(&mut self, place: &Place) -> VmResult<Location> {
        let frame_idx = self.frames.len().checked_sub(1).ok_or_else(|| {
            err(PanicKind::InvalidLocation, "place evaluation without a frame")
        })?;
        let mut loc = match place.root {
            PlaceRoot::Local(local) => Location::new(
                LocationKind::Local {
                    frame: frame_idx as u32,
                    local,
                },
                true,
            ),
            PlaceRoot::Global(global) => Location::new(LocationKind::Global { global }, true),
        };
        for projection in &place.projections {
            loc = match projection {
                Projection::Deref => {
                    let v = self.read_location(&loc)?;
                    match v.kind {
                        ValueKind::Ref(inner) => Location::new(inner.kind, false),
                        ValueKind::RefMut(inner) => Location::new(inner.kind, inner.mutable),
                        ValueKind::Ptr(inner) => inner,
                        _ => {
                            return Err(err(
                                PanicKind::DerefNonReference,
                                format!("dereference of {}", v.kind_name()),
                            )
                            .into());
                        }
                    }
                }
                Projection::Field(sel) => {
                    let v = self.read_location(&loc)?;
                    let ValueKind::Struct(object) = v.kind else {
                        return Err(err(
                            PanicKind::TypeMismatch,
                            format!("field access on {}", v.kind_name()),
                        )
                        .into());
                    };
                    let field = match sel {
                        FieldSel::Index(i) => *i,
                        FieldSel::Named(name) => {
                            self.types.field_index(v.ty, *name).ok_or_else(|| {
                                err(
                                    PanicKind::TypeMismatch,
                                    format!(
                                        "type {} has no field `{}`",
                                        self.types.display(v.ty),
                                        self.types.symbol_name(*name)
                                    ),
                                )
                            })?
                        }
                    };
                    let offset = self
                        .types
                        .field_offset(v.ty, field)
                        .map_err(layout_panic)?;
                    Location::new(
                        LocationKind::Field {
                            object,
                            field,
                            offset,
                        },
                        loc.mutable,
                    )
                }
                Projection::Index(index_local) => {
                    let index = {
                        let slot = self.local_slot(frame_idx, *index_local)?;
                        slot.check_readable()?;
                        slot.value.as_int().ok_or_else(|| {
                            err(
                                PanicKind::TypeMismatch,
                                format!("index is {}, not int", slot.value.kind_name()),
                            )
                        })?
                    };
                    if index < 0 {
                        return Err(err(
                            PanicKind::OutOfBounds,
                            format!("negative index {index}"),
                        )
                        .into());
                    }
                    let v = self.read_location(&loc)?;
                    let ValueKind::Array(object) = v.kind else {
                        return Err(err(
                            PanicKind::TypeMismatch,
                            format!("index into {}", v.kind_name()),
                        )
                        .into());
                    };
                    // Views resolve transparently onto their base array.
                    let (base, final_index, bound) = self.array_target(object, index as u64)?;
                    if final_index >= bound {
                        return Err(err(
                            PanicKind::OutOfBounds,
                            format!("index {index} out of bounds"),
                        )
                        .into());
                    }
                    let stride = self
                        .types
                        .elem_stride(v.ty)
                        .unwrap_or(std::mem::size_of::<u64>() as u64);
                    Location::new(
                        LocationKind::Element {
                            object: base,
                            index: final_index,
                            offset: stride * final_index,
                        },
                        loc.mutable,
                    )
                }
            };
        }
        Ok(loc)
    }

    /// Resolve an array-or-view handle to (base array, element index within
    /// the base, exclusive bound within the base).
    pub(crate) fn array_target(
        &self,
        object: crate::value::Handle,
        index: u64,
    ) -> VmResult<(crate::value::Handle, u64, u64)> {
        match &self.heap.get(object)?.payload {
            ObjectPayload::Array(elems) => Ok((object, index, elems.len() as u64)),
            ObjectPayload::ArraySlice {
                base, start, len, ..
            } => Ok((*base, *start + index, *start + *len)),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("handle {} is not an array", object.0),
            )
            .into()),
        }
    }

    pub(crate) fn local_slot(&self, frame: usize, local: volt_core::LocalId) -> Result<&Slot, VmError> {
        let frame = self
            .frames
            .get(frame)
            .ok_or_else(|| err(PanicKind::InvalidLocation, "reference outlived its frame"))?;
        frame.slots.get(local.0 as usize).ok_or_else(|| {
            err(
                PanicKind::InvalidLocation,
                format!("invalid local {}", local.0),
            )
        })
    }

    fn local_slot_mut(
        &mut self,
        frame: usize,
        local: volt_core::LocalId,
    ) -> Result<&mut Slot, VmError> {
        let frame = self
            .frames
            .get_mut(frame)
            .ok_or_else(|| err(PanicKind::InvalidLocation, "reference outlived its frame"))?;
        frame.slots.get_mut(local.0 as usize).ok_or_else(|| {
            err(
                PanicKind::InvalidLocation,
                format!("invalid local {}", local.0),
            )
        })
    }

    /// Load a snapshot of the value at `loc`. No reference count changes;
    /// callers that keep the value must retain it.
    pub(crate) fn read_location(&mut self, loc: &Location) -> VmResult<Value> {
        match loc.kind {
            LocationKind::Local { frame, local } => {
                let slot = self.local_slot(frame as usize, local)?;
                slot.check_readable()?;
                Ok(slot.value.clone())
            }
            LocationKind::Global { global } => {
                let slot = self
                    .globals
                    .get(global.0 as usize)
                    .ok_or_else(|| err(PanicKind::InvalidLocation, "invalid global"))?;
                slot.check_readable()?;
                Ok(slot.value.clone())
            }
            LocationKind::Field { object, field, .. } => {
                match &self.heap.get(object)?.payload {
                    ObjectPayload::Struct(fields) => {
                        fields.get(field as usize).cloned().ok_or_else(|| {
                            err(
                                PanicKind::InvalidLocation,
                                format!("struct has no field {field}"),
                            )
                            .into()
                        })
                    }
                    _ => Err(err(PanicKind::InvalidLocation, "field of a non-struct").into()),
                }
            }
            LocationKind::Element { object, index, .. } => {
                match &self.heap.get(object)?.payload {
                    ObjectPayload::Array(elems) => {
                        elems.get(index as usize).cloned().ok_or_else(|| {
                            err(
                                PanicKind::OutOfBounds,
                                format!("index {index} out of bounds (length {})", elems.len()),
                            )
                            .into()
                        })
                    }
                    _ => Err(err(PanicKind::InvalidLocation, "element of a non-array").into()),
                }
            }
            LocationKind::MapEntry { object, entry } => {
                match &self.heap.get(object)?.payload {
                    ObjectPayload::Map(map) => map
                        .entries
                        .get(entry as usize)
                        .map(|e| e.value.clone())
                        .ok_or_else(|| {
                            err(
                                PanicKind::InvalidLocation,
                                format!("map has no entry {entry}"),
                            )
                            .into()
                        }),
                    _ => Err(err(PanicKind::InvalidLocation, "entry of a non-map").into()),
                }
            }
            LocationKind::TagPayload { object, index } => {
                match &self.heap.get(object)?.payload {
                    ObjectPayload::Tag(tag) => {
                        tag.payload.get(index as usize).cloned().ok_or_else(|| {
                            err(
                                PanicKind::TagPayloadIndexOutOfRange,
                                format!("tag payload index {index} out of range"),
                            )
                            .into()
                        })
                    }
                    _ => Err(err(PanicKind::TagPayloadNonTag, "payload of a non-tag").into()),
                }
            }
            LocationKind::StringBytes { .. } | LocationKind::RawBytes { .. } => Err(err(
                PanicKind::InvalidLocation,
                "byte locations are accessed through the memory intrinsics",
            )
            .into()),
        }
    }

    /// Store `v` at `loc`, releasing whatever was there. Fatal through an
    /// immutable location.
    pub(crate) fn write_location(&mut self, loc: &Location, v: Value) -> VmResult<()> {
        if !loc.mutable {
            self.release_owned(v)?;
            return Err(err(
                PanicKind::StoreImmutableRef,
                "store through an immutable reference",
            )
            .into());
        }
        let declared = self.declared_ty_of_location(loc);
        let v = self.retag_value(v, declared)?;
        match loc.kind {
            LocationKind::Local { frame, local } => {
                let rendered = self.tracer.is_some().then(|| self.render_value(&v));
                let slot = self.local_slot_mut(frame as usize, local)?;
                // Overwrite drops the old value even while borrowed; only
                // moves and explicit drops require the borrow closed.
                let old = if slot.needs_drop() {
                    Some(std::mem::replace(&mut slot.value, Value::invalid()))
                } else {
                    None
                };
                slot.value = v;
                slot.initialized = true;
                slot.moved = false;
                slot.dropped = false;
                if let Some(old) = old {
                    self.heap.release_value(&old)?;
                }
                if let Some(rendered) = rendered {
                    self.writes.push((local, rendered));
                }
                Ok(())
            }
            LocationKind::Global { global } => {
                let slot = self
                    .globals
                    .get_mut(global.0 as usize)
                    .ok_or_else(|| err(PanicKind::InvalidLocation, "invalid global"))?;
                let old = if slot.needs_drop() {
                    Some(std::mem::replace(&mut slot.value, Value::invalid()))
                } else {
                    None
                };
                slot.value = v;
                slot.initialized = true;
                slot.moved = false;
                slot.dropped = false;
                if let Some(old) = old {
                    self.heap.release_value(&old)?;
                }
                Ok(())
            }
            LocationKind::Field { object, field, .. } => {
                let old = match &mut self.heap.get_mut(object)?.payload {
                    ObjectPayload::Struct(fields) => {
                        let cell = fields.get_mut(field as usize).ok_or_else(|| {
                            err(
                                PanicKind::InvalidLocation,
                                format!("struct has no field {field}"),
                            )
                        })?;
                        std::mem::replace(cell, v)
                    }
                    _ => {
                        self.release_owned(v)?;
                        return Err(
                            err(PanicKind::InvalidLocation, "field of a non-struct").into()
                        );
                    }
                };
                self.heap.release_value(&old)?;
                Ok(())
            }
            LocationKind::Element { object, index, .. } => {
                let old = match &mut self.heap.get_mut(object)?.payload {
                    ObjectPayload::Array(elems) => {
                        let cell = elems.get_mut(index as usize).ok_or_else(|| {
                            err(
                                PanicKind::OutOfBounds,
                                format!("index {index} out of bounds"),
                            )
                        })?;
                        std::mem::replace(cell, v)
                    }
                    _ => {
                        self.release_owned(v)?;
                        return Err(
                            err(PanicKind::InvalidLocation, "element of a non-array").into()
                        );
                    }
                };
                self.heap.release_value(&old)?;
                Ok(())
            }
            LocationKind::MapEntry { object, entry } => {
                let old = match &mut self.heap.get_mut(object)?.payload {
                    ObjectPayload::Map(map) => {
                        let cell = map.entries.get_mut(entry as usize).ok_or_else(|| {
                            err(
                                PanicKind::InvalidLocation,
                                format!("map has no entry {entry}"),
                            )
                        })?;
                        std::mem::replace(&mut cell.value, v)
                    }
                    _ => {
                        self.release_owned(v)?;
                        return Err(err(PanicKind::InvalidLocation, "entry of a non-map").into());
                    }
                };
                self.heap.release_value(&old)?;
                Ok(())
            }
            LocationKind::TagPayload { object, index } => {
                let old = match &mut self.heap.get_mut(object)?.payload {
                    ObjectPayload::Tag(tag) => {
                        let cell = tag.payload.get_mut(index as usize).ok_or_else(|| {
                            err(
                                PanicKind::TagPayloadIndexOutOfRange,
                                format!("tag payload index {index} out of range"),
                            )
                        })?;
                        std::mem::replace(cell, v)
                    }
                    _ => {
                        self.release_owned(v)?;
                        return Err(err(PanicKind::TagPayloadNonTag, "payload of a non-tag").into());
                    }
                };
                self.heap.release_value(&old)?;
                Ok(())
            }
            LocationKind::StringBytes { .. } | LocationKind::RawBytes { .. } => {
                self.release_owned(v)?;
                Err(err(
                    PanicKind::InvalidLocation,
                    "byte locations are written through the memory intrinsics",
                )
                .into())
            }
        }
    }

    pub(crate) fn write_place(&mut self, place: &Place, v: Value) -> VmResult<()> {
        let loc = match self.resolve_place(place) {
            Ok(loc) => loc,
            Err(e) => {
                let _ = self.heap.release_value(&v);
                return Err(e);
            }
        };
        self.write_location(&loc, v)
    }

    /// Declared type of the storage a location names; UNKNOWN when it
    /// cannot be derived.
    fn declared_ty_of_location(&self, loc: &Location) -> TypeId {
        match loc.kind {
            LocationKind::Local { frame, local } => self
                .local_slot(frame as usize, local)
                .map(|s| s.ty)
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::Global { global } => self
                .globals
                .get(global.0 as usize)
                .map(|s| s.ty)
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::Field { object, field, .. } => self
                .heap
                .get(object)
                .ok()
                .and_then(|o| self.types.struct_fields(o.ty))
                .and_then(|fields| fields.get(field as usize))
                .map(|(_, ty)| *ty)
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::Element { object, .. } => self
                .heap
                .get(object)
                .ok()
                .and_then(|o| self.types.elem_of(o.ty))
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::MapEntry { object, .. } => self
                .heap
                .get(object)
                .ok()
                .and_then(|o| match self.types.kind(o.ty) {
                    Some(TypeKind::Map(_, v)) => Some(*v),
                    _ => None,
                })
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::TagPayload { object, index } => self
                .heap
                .get(object)
                .ok()
                .and_then(|o| match &o.payload {
                    ObjectPayload::Tag(tag) => self
                        .types
                        .variant(o.ty, tag.variant)
                        .and_then(|v| v.payload.get(index as usize).copied()),
                    _ => None,
                })
                .unwrap_or(TypeId::UNKNOWN),
            LocationKind::StringBytes { .. } | LocationKind::RawBytes { .. } => TypeId::UNKNOWN,
        }
    }

    /// Re-tag a member-typed value stored into a union-typed slot so it
    /// carries the declared outer layout.
    pub(crate) fn retag_value(&mut self, mut v: Value, declared: TypeId) -> VmResult<Value> {
        if declared.is_unknown() || v.ty == declared {
            return Ok(v);
        }
        if let (Some(TypeKind::Union { .. }), ValueKind::Tag(h)) =
            (self.types.kind(declared), v.kind)
        {
            v.ty = declared;
            self.heap.get_mut(h)?.ty = declared;
        }
        Ok(v)
    }

    // ---- operands and rvalues ----

    pub(crate) fn eval_operand(&mut self, op: &Operand) -> VmResult<Value> {
        match op {
            Operand::Copy(place) => {
                let loc = self.resolve_place(place)?;
                let v = self.read_location(&loc)?;
                self.heap.retain_value(&v)?;
                Ok(v)
            }
            Operand::Move(place) => {
                if !place.projections.is_empty() {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        "cannot move out of a projection",
                    )
                    .into());
                }
                match place.root {
                    PlaceRoot::Local(local) => {
                        let frame = self.frames.len() - 1;
                        Ok(self.local_slot_mut(frame, local)?.take_moved()?)
                    }
                    PlaceRoot::Global(global) => {
                        let slot = self
                            .globals
                            .get_mut(global.0 as usize)
                            .ok_or_else(|| err(PanicKind::InvalidLocation, "invalid global"))?;
                        Ok(slot.take_moved()?)
                    }
                }
            }
            Operand::Const(c) => self.const_value(c),
        }
    }

    pub(crate) fn const_value(&mut self, c: &Const) -> VmResult<Value> {
        Ok(match c {
            Const::Unit => Value::unit(self.types.unit()),
            Const::Bool(b) => Value::bool_(*b, self.types.bool_()),
            Const::Int(v, ty) => Value::int(*v, *ty),
            Const::Str(s) => {
                let ty = self.types.str_();
                let h = crate::rope::from_bytes(&mut self.heap, ty, s.as_bytes())?;
                Value::new(ty, ValueKind::Str(h))
            }
            Const::Func(f) => Value::new(self.types.func(), ValueKind::Func(*f)),
        })
    }

    pub(crate) fn eval_rvalue(&mut self, rvalue: &Rvalue) -> VmResult<Value> {
        match rvalue {
            Rvalue::Use(op) => self.eval_operand(op),
            Rvalue::Binary { op, lhs, rhs } => {
                let l = self.eval_operand(lhs)?;
                let r = match self.eval_operand(rhs) {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = self.heap.release_value(&l);
                        return Err(e);
                    }
                };
                self.binary_op(*op, l, r)
            }
            Rvalue::Unary { op, operand } => {
                let v = self.eval_operand(operand)?;
                self.unary_op(*op, v)
            }
            Rvalue::Ref { place, mutable } => {
                let mut loc = self.resolve_place(place)?;
                if *mutable && !loc.mutable {
                    return Err(err(
                        PanicKind::StoreImmutableRef,
                        "mutable borrow of an immutable location",
                    )
                    .into());
                }
                loc.mutable = *mutable;
                // Reads through the new reference require a live value now.
                let inner = self.read_location(&loc)?;
                let inner_ty = inner.ty;
                self.borrow_root(place)?;
                let ty = if *mutable {
                    self.types.ref_mut_of(inner_ty)
                } else {
                    self.types.ref_of(inner_ty)
                };
                Ok(Value::new(
                    ty,
                    if *mutable {
                        ValueKind::RefMut(loc)
                    } else {
                        ValueKind::Ref(loc)
                    },
                ))
            }
            Rvalue::StructLit { ty, fields } => {
                let values = self.eval_operands(fields.clone())?;
                let h = self.heap.alloc(*ty, ObjectPayload::Struct(values));
                Ok(Value::new(*ty, ValueKind::Struct(h)))
            }
            Rvalue::ArrayLit { ty, elems } => {
                let values = self.eval_operands(elems.clone())?;
                let h = self.heap.alloc(*ty, ObjectPayload::Array(values));
                Ok(Value::new(*ty, ValueKind::Array(h)))
            }
            Rvalue::TagTest { place, variant } => {
                let loc = self.resolve_place(place)?;
                let v = self.read_location(&loc)?;
                let ValueKind::Tag(h) = v.kind else {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        format!("tag test on {}", v.kind_name()),
                    )
                    .into());
                };
                let actual = self.tag_variant_of(h)?;
                let matches = actual == *variant
                    || self.types.symbol_name(actual) == self.types.symbol_name(*variant);
                Ok(Value::bool_(matches, self.types.bool_()))
            }
            Rvalue::TagPayload {
                place,
                variant,
                index,
            } => {
                let loc = self.resolve_place(place)?;
                let v = self.read_location(&loc)?;
                let ValueKind::Tag(h) = v.kind else {
                    return Err(err(
                        PanicKind::TagPayloadNonTag,
                        format!("tag payload of {}", v.kind_name()),
                    )
                    .into());
                };
                self.tag_payload_clone(h, *variant, *index)
            }
        }
    }

    /// Open a borrow on the root slot of a place.
    fn borrow_root(&mut self, place: &Place) -> VmResult<()> {
        match place.root {
            PlaceRoot::Local(local) => {
                let frame = self.frames.len() - 1;
                self.local_slot_mut(frame, local)?.borrows += 1;
            }
            PlaceRoot::Global(global) => {
                if let Some(slot) = self.globals.get_mut(global.0 as usize) {
                    slot.borrows += 1;
                }
            }
        }
        Ok(())
    }
}
