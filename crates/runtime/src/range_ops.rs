//! Ranges and the iteration protocol.
//!
//! Two shapes share the range object: array iterators (`for` over arrays)
//! and numeric descriptors with optional start/end and an inclusive flag.
//! `iter_init` turns an array into an iterator range and is the identity on
//! an existing range; `iter_next` yields `Option<T>` and advances in place,
//! promoting to a big integer when an open-ended fixed-width walk crosses
//! the i64 boundary on an arbitrary-precision element type.

use crate::error::{PanicKind, VmResult, err};
use crate::heap::{ObjectPayload, RangePayload};
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, expect_args};
use crate::value::{Handle, Value, ValueKind};
use num_bigint::BigInt;
use std::cmp::Ordering;
use volt_core::{IntClass, TypeId};

impl Vm {
    /// `iter_init`: arrays become iterator ranges (taking ownership of the
    /// array reference), ranges pass through untouched.
    pub(crate) fn range_iter_init(&mut self, v: Value) -> VmResult<Value> {
        match v.kind {
            ValueKind::Range(_) => Ok(v),
            ValueKind::Array(base) => {
                let len = self.array_len(base)?;
                let elem = self
                    .types
                    .elem_of(v.ty)
                    .unwrap_or(TypeId::UNKNOWN);
                let range_ty = if elem.is_unknown() {
                    self.types.range_of(self.types.unit())
                } else {
                    self.types.range_of(elem)
                };
                let h = self.heap.alloc(
                    range_ty,
                    ObjectPayload::Range(RangePayload::Iter {
                        base,
                        start: 0,
                        len,
                        current: 0,
                    }),
                );
                Ok(Value::new(range_ty, ValueKind::Range(h)))
            }
            _ => {
                let msg = format!("cannot iterate {}", v.kind_name());
                self.release_owned(v)?;
                Err(err(PanicKind::TypeMismatch, msg).into())
            }
        }
    }

    /// `iter_next`: yield the next element or `nothing` at termination.
    pub(crate) fn range_iter_next(&mut self, h: Handle) -> VmResult<Value> {
        let payload = match &self.heap.get(h)?.payload {
            ObjectPayload::Range(r) => r.clone(),
            _ => {
                return Err(err(
                    PanicKind::TypeMismatch,
                    format!("handle {} is not a range", h.0),
                )
                .into());
            }
        };
        match payload {
            RangePayload::Iter {
                base,
                start,
                len,
                current,
            } => {
                if current >= len {
                    let elem = self.range_elem_ty(h);
                    return self.option_nothing(elem);
                }
                let elem = self.array_get_clone(base, start + current)?;
                self.set_iter_current(h, current + 1)?;
                self.option_some(elem)
            }
            RangePayload::Descriptor {
                start,
                end,
                inclusive,
            } => {
                let Some(current) = start else {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        "cannot iterate a range with no start",
                    )
                    .into());
                };
                if let Some(end) = &end {
                    let ord = self.range_cmp(&current, end)?;
                    let finished = match inclusive {
                        true => ord == Ordering::Greater,
                        false => ord != Ordering::Less,
                    };
                    if finished {
                        let elem = self.range_elem_ty(h);
                        return self.option_nothing(elem);
                    }
                }
                let next = self.range_increment(&current)?;
                self.set_descriptor_start(h, Some(next))?;
                // `current` moves out to the caller inside the option
                self.option_some(current)
            }
        }
    }

    fn range_elem_ty(&mut self, h: Handle) -> TypeId {
        let ty = self.heap.get(h).map(|o| o.ty).unwrap_or(TypeId::UNKNOWN);
        match self.types.kind(ty) {
            Some(volt_core::TypeKind::Range(elem)) => *elem,
            _ => self.types.unit(),
        }
    }

    fn set_iter_current(&mut self, h: Handle, new_current: u64) -> VmResult<()> {
        if let ObjectPayload::Range(RangePayload::Iter { current, .. }) =
            &mut self.heap.get_mut(h)?.payload
        {
            *current = new_current;
        }
        Ok(())
    }

    fn set_descriptor_start(&mut self, h: Handle, new_start: Option<Value>) -> VmResult<()> {
        if let ObjectPayload::Range(RangePayload::Descriptor { start, .. }) =
            &mut self.heap.get_mut(h)?.payload
        {
            *start = new_start;
        }
        Ok(())
    }

    fn range_cmp(&mut self, a: &Value, b: &Value) -> VmResult<Ordering> {
        match (a.kind, b.kind) {
            (ValueKind::Int(x), ValueKind::Int(y)) => Ok(x.cmp(&y)),
            _ => {
                // mixed inline/big after promotion
                let out = self.binary_op_compare(a, b)?;
                Ok(out)
            }
        }
    }

    /// `start + 1`, promoting to a big integer at the i64 boundary when the
    /// element type is unbounded.
    fn range_increment(&mut self, current: &Value) -> VmResult<Value> {
        match current.kind {
            ValueKind::Int(n) => match n.checked_add(1) {
                Some(next) => Ok(Value::int(next, current.ty)),
                None => {
                    let class = self
                        .types
                        .int_class(current.ty)
                        .unwrap_or(IntClass::Signed(64));
                    if class.is_arbitrary() {
                        let next = BigInt::from(n) + 1;
                        Ok(self.alloc_bigint(current.ty, next))
                    } else {
                        Err(err(PanicKind::IntOverflow, "range iteration overflow").into())
                    }
                }
            },
            ValueKind::BigInt(h) => {
                let next = match &self.heap.get(h)?.payload {
                    ObjectPayload::BigInt(b) => crate::bignum::add_small(b, 1),
                    _ => return Err(err(PanicKind::TypeMismatch, "corrupt range bound").into()),
                };
                Ok(self.alloc_bigint(current.ty, next))
            }
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("range over {}", current.kind_name()),
            )
            .into()),
        }
    }

    fn binary_op_compare(&mut self, a: &Value, b: &Value) -> VmResult<Ordering> {
        // Delegate to the arithmetic module's ordering, which understands
        // mixed inline/big operands of one class.
        let l = a.clone();
        let r = b.clone();
        self.heap.retain_value(&l)?;
        self.heap.retain_value(&r)?;
        let lt = self.binary_op(volt_core::BinOp::Lt, l, r)?;
        if lt.as_bool() == Some(true) {
            return Ok(Ordering::Less);
        }
        let l = a.clone();
        let r = b.clone();
        self.heap.retain_value(&l)?;
        self.heap.retain_value(&r)?;
        let eq = self.binary_op(volt_core::BinOp::Eq, l, r)?;
        Ok(if eq.as_bool() == Some(true) {
            Ordering::Equal
        } else {
            Ordering::Greater
        })
    }

    fn make_descriptor(
        &mut self,
        start: Option<Value>,
        end: Option<Value>,
        inclusive: bool,
        dst_ty: TypeId,
    ) -> VmResult<Value> {
        let elem = start
            .as_ref()
            .or(end.as_ref())
            .map(|v| v.ty)
            .unwrap_or_else(|| self.types.int64());
        let ty = if dst_ty.is_unknown() {
            self.types.range_of(elem)
        } else {
            dst_ty
        };
        let h = self.heap.alloc(
            ty,
            ObjectPayload::Range(RangePayload::Descriptor {
                start,
                end,
                inclusive,
            }),
        );
        Ok(Value::new(ty, ValueKind::Range(h)))
    }
}

// ---------------------------------------------------------------------------
// Intrinsic handlers
// ---------------------------------------------------------------------------

/// `start..end` (or `start..=end` with the inclusive flag set).
pub(crate) fn range_int_new(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst_ty = ctx.dst_ty;
    let [start, end, inclusive] = expect_args::<3>(vm, "rt_range_int_new", ctx.args)?;
    let ValueKind::Bool(inclusive) = inclusive.kind else {
        let msg = format!("inclusive flag is {}, not bool", inclusive.kind_name());
        vm.release_owned(start)?;
        vm.release_owned(end)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    vm.make_descriptor(Some(start), Some(end), inclusive, dst_ty)
}

/// `start..`
pub(crate) fn range_int_from_start(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst_ty = ctx.dst_ty;
    let [start] = expect_args::<1>(vm, "rt_range_int_from_start", ctx.args)?;
    vm.make_descriptor(Some(start), None, false, dst_ty)
}

/// `..end`
pub(crate) fn range_int_to_end(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst_ty = ctx.dst_ty;
    let [end] = expect_args::<1>(vm, "rt_range_int_to_end", ctx.args)?;
    vm.make_descriptor(None, Some(end), false, dst_ty)
}

/// `..`
pub(crate) fn range_int_full(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst_ty = ctx.dst_ty;
    expect_args::<0>(vm, "rt_range_int_full", ctx.args)?;
    vm.make_descriptor(None, None, false, dst_ty)
}

/// `__range`: the iteration-protocol entry point.
pub(crate) fn iter_init(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "__range", ctx.args)?;
    vm.range_iter_init(v)
}

/// `next` on a range.
pub(crate) fn iter_next(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "next", ctx.args)?;
    let ValueKind::Range(h) = v.kind else {
        let msg = format!("next on {}", v.kind_name());
        vm.release_owned(v)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let out = vm.range_iter_next(h)?;
    vm.release_owned(v)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockHost;
    use volt_core::{ModuleBuilder, TypeTable};

    fn vm() -> Vm {
        Vm::new(
            ModuleBuilder::new("t").build(),
            TypeTable::new(),
            Box::new(MockHost::new()),
        )
    }

    fn next_int(vm: &mut Vm, h: Handle) -> Option<i64> {
        let out = vm.range_iter_next(h).unwrap();
        let ValueKind::Tag(tag) = out.kind else {
            panic!("expected Option tag");
        };
        let some = vm.types.intern_symbol("Some");
        if vm.tag_variant_of(tag).unwrap() == some {
            Some(vm.tag_payload_clone(tag, some, 0).unwrap().as_int().unwrap())
        } else {
            None
        }
    }

    #[test]
    fn test_array_iteration() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let arr_ty = vm.types.array_of(int64);
        let arr = vm.heap.alloc(
            arr_ty,
            ObjectPayload::Array(vec![Value::int(4, int64), Value::int(5, int64)]),
        );
        let range = vm
            .range_iter_init(Value::new(arr_ty, ValueKind::Array(arr)))
            .unwrap();
        let ValueKind::Range(h) = range.kind else {
            panic!("expected range");
        };
        assert_eq!(next_int(&mut vm, h), Some(4));
        assert_eq!(next_int(&mut vm, h), Some(5));
        assert_eq!(next_int(&mut vm, h), None);
        // iteration stays exhausted
        assert_eq!(next_int(&mut vm, h), None);
    }

    #[test]
    fn test_empty_array_yields_nothing_immediately() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let arr_ty = vm.types.array_of(int64);
        let arr = vm.heap.alloc(arr_ty, ObjectPayload::Array(vec![]));
        let range = vm
            .range_iter_init(Value::new(arr_ty, ValueKind::Array(arr)))
            .unwrap();
        let ValueKind::Range(h) = range.kind else {
            panic!()
        };
        assert_eq!(next_int(&mut vm, h), None);
    }

    #[test]
    fn test_iter_init_identity_on_range() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let r = vm
            .make_descriptor(
                Some(Value::int(0, int64)),
                Some(Value::int(2, int64)),
                false,
                TypeId::UNKNOWN,
            )
            .unwrap();
        let again = vm.range_iter_init(r.clone()).unwrap();
        assert_eq!(again.heap_handle(), r.heap_handle());
    }

    #[test]
    fn test_exclusive_and_inclusive_descriptors() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let r = vm
            .make_descriptor(
                Some(Value::int(1, int64)),
                Some(Value::int(3, int64)),
                false,
                TypeId::UNKNOWN,
            )
            .unwrap();
        let ValueKind::Range(h) = r.kind else {
            panic!()
        };
        assert_eq!(next_int(&mut vm, h), Some(1));
        assert_eq!(next_int(&mut vm, h), Some(2));
        assert_eq!(next_int(&mut vm, h), None);

        let r = vm
            .make_descriptor(
                Some(Value::int(1, int64)),
                Some(Value::int(3, int64)),
                true,
                TypeId::UNKNOWN,
            )
            .unwrap();
        let ValueKind::Range(h) = r.kind else {
            panic!()
        };
        assert_eq!(next_int(&mut vm, h), Some(1));
        assert_eq!(next_int(&mut vm, h), Some(2));
        assert_eq!(next_int(&mut vm, h), Some(3));
        assert_eq!(next_int(&mut vm, h), None);
    }

    #[test]
    fn test_open_end_promotes_on_arbitrary_type() {
        let mut vm = vm();
        let big_ty = vm.types.int_big();
        let r = vm
            .make_descriptor(Some(Value::int(i64::MAX, big_ty)), None, false, TypeId::UNKNOWN)
            .unwrap();
        let ValueKind::Range(h) = r.kind else {
            panic!()
        };
        // first yield is i64::MAX; the stored start is now a big integer
        assert_eq!(next_int(&mut vm, h), Some(i64::MAX));
        let out = vm.range_iter_next(h).unwrap();
        let ValueKind::Tag(tag) = out.kind else {
            panic!()
        };
        let some = vm.types.intern_symbol("Some");
        let v = vm.tag_payload_clone(tag, some, 0).unwrap();
        assert!(matches!(v.kind, ValueKind::BigInt(_)));
    }

    #[test]
    fn test_open_end_overflow_on_fixed_type() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let r = vm
            .make_descriptor(Some(Value::int(i64::MAX, int64)), None, false, TypeId::UNKNOWN)
            .unwrap();
        let ValueKind::Range(h) = r.kind else {
            panic!()
        };
        assert_eq!(next_int(&mut vm, h), Some(i64::MAX));
        assert!(vm.range_iter_next(h).is_err());
    }

    #[test]
    fn test_no_start_not_iterable() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let r = vm
            .make_descriptor(None, Some(Value::int(3, int64)), false, TypeId::UNKNOWN)
            .unwrap();
        let ValueKind::Range(h) = r.kind else {
            panic!()
        };
        assert!(vm.range_iter_next(h).is_err());
    }
}
