//! Growable arrays and array views.
//!
//! Push appends without cloning (the caller surrendered ownership) and
//! grows by doubling with a small floor. Views are base + start + length;
//! reads and writes project through the base, so pushes through a view are
//! unsupported.

use crate::error::{PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::value::{Handle, Value, ValueKind};

/// Growth floor: arrays jump straight to this capacity on first push.
const MIN_CAPACITY: usize = 4;

impl Vm {
    fn array_elems_mut(&mut self, h: Handle) -> VmResult<&mut Vec<Value>> {
        match &mut self.heap.get_mut(h)?.payload {
            ObjectPayload::Array(elems) => Ok(elems),
            ObjectPayload::ArraySlice { .. } => Err(err(
                PanicKind::TypeMismatch,
                "cannot grow an array through a view",
            )
            .into()),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("handle {} is not an array", h.0),
            )
            .into()),
        }
    }

    /// Length of an array or view.
    pub(crate) fn array_len(&mut self, h: Handle) -> VmResult<u64> {
        match &self.heap.get(h)?.payload {
            ObjectPayload::Array(elems) => Ok(elems.len() as u64),
            ObjectPayload::ArraySlice { len, .. } => Ok(*len),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("handle {} is not an array", h.0),
            )
            .into()),
        }
    }

    /// Append, growing by at least doubling when full.
    pub(crate) fn array_push_value(&mut self, h: Handle, v: Value) -> VmResult<()> {
        let elems = match self.array_elems_mut(h) {
            Ok(elems) => elems,
            Err(e) => {
                let _ = self.heap.release_value(&v);
                return Err(e);
            }
        };
        if elems.len() == elems.capacity() {
            let target = (elems.capacity() * 2).max(MIN_CAPACITY);
            elems.reserve_exact(target - elems.len());
        }
        elems.push(v);
        Ok(())
    }

    /// `Some(last)` transferring ownership to the caller, `nothing` on
    /// empty.
    pub(crate) fn array_pop_value(&mut self, h: Handle) -> VmResult<Value> {
        let elem_ty = self.types.elem_of(self.heap.get(h)?.ty);
        let popped = self.array_elems_mut(h)?.pop();
        match popped {
            Some(v) => self.option_some(v),
            None => {
                let elem = elem_ty.unwrap_or_else(|| self.types.unit());
                self.option_nothing(elem)
            }
        }
    }

    /// Grow capacity to at least `cap`, clamped to at least the current
    /// length. Contents are untouched.
    pub(crate) fn array_reserve_cap(&mut self, h: Handle, cap: u64) -> VmResult<()> {
        let elems = self.array_elems_mut(h)?;
        let want = (cap as usize).max(elems.len());
        if want > elems.capacity() {
            elems.reserve_exact(want - elems.len());
        }
        Ok(())
    }

    /// Snapshot of one element (no refcount change), resolving views.
    pub(crate) fn array_get_snapshot(&mut self, h: Handle, index: u64) -> VmResult<Value> {
        let (base, final_index, bound) = self.array_target(h, index)?;
        if final_index >= bound {
            return Err(err(
                PanicKind::OutOfBounds,
                format!("index {index} out of bounds"),
            )
            .into());
        }
        match &self.heap.get(base)?.payload {
            ObjectPayload::Array(elems) => elems
                .get(final_index as usize)
                .cloned()
                .ok_or_else(|| err(PanicKind::OutOfBounds, "view outruns its base array").into()),
            _ => Err(err(PanicKind::TypeMismatch, "view base is not an array").into()),
        }
    }

    /// Clone-for-share of one element.
    pub(crate) fn array_get_clone(&mut self, h: Handle, index: u64) -> VmResult<Value> {
        let v = self.array_get_snapshot(h, index)?;
        self.heap.retain_value(&v)?;
        Ok(v)
    }

    /// A view over `[start, start+len)`; retains the base array.
    pub(crate) fn array_make_view(&mut self, h: Handle, start: u64, len: u64) -> VmResult<Value> {
        // Re-anchor views of views on the underlying base.
        let (base, real_start, ty) = match &self.heap.get(h)?.payload {
            ObjectPayload::Array(elems) => {
                if start + len > elems.len() as u64 {
                    return Err(err(
                        PanicKind::OutOfBounds,
                        format!("view {start}..{} of array length {}", start + len, elems.len()),
                    )
                    .into());
                }
                (h, start, self.heap.get(h)?.ty)
            }
            ObjectPayload::ArraySlice {
                base,
                start: base_start,
                len: base_len,
                ..
            } => {
                if start + len > *base_len {
                    return Err(err(
                        PanicKind::OutOfBounds,
                        format!("view {start}..{} of view length {base_len}", start + len),
                    )
                    .into());
                }
                (*base, base_start + start, self.heap.get(h)?.ty)
            }
            _ => {
                return Err(err(
                    PanicKind::TypeMismatch,
                    format!("handle {} is not an array", h.0),
                )
                .into());
            }
        };
        self.heap.retain(base)?;
        let view = self.heap.alloc(
            ty,
            ObjectPayload::ArraySlice {
                base,
                start: real_start,
                len,
                capacity: len,
            },
        );
        Ok(Value::new(ty, ValueKind::Array(view)))
    }
}

fn array_handle(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Handle> {
    match v.kind {
        ValueKind::Array(h) => Ok(h),
        _ => {
            let _ = vm.heap.release_value(v);
            Err(err(
                PanicKind::TypeMismatch,
                format!("{name}: expected array, got {}", v.kind_name()),
            )
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Intrinsic handlers
// ---------------------------------------------------------------------------

pub(crate) fn array_push(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [arr, v] = expect_args::<2>(vm, "rt_array_push", ctx.args)?;
    let h = match array_handle(vm, "rt_array_push", &arr) {
        Ok(h) => h,
        Err(e) => {
            let _ = vm.heap.release_value(&v);
            return Err(e);
        }
    };
    vm.array_push_value(h, v)?;
    vm.release_owned(arr)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn array_pop(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [arr] = expect_args::<1>(vm, "rt_array_pop", ctx.args)?;
    let h = array_handle(vm, "rt_array_pop", &arr)?;
    let out = vm.array_pop_value(h)?;
    vm.release_owned(arr)?;
    Ok(out)
}

pub(crate) fn array_reserve(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [arr, cap] = expect_args::<2>(vm, "rt_array_reserve", ctx.args)?;
    let h = array_handle(vm, "rt_array_reserve", &arr)?;
    let cap = arg_int(vm, "rt_array_reserve", &cap)?;
    vm.array_reserve_cap(h, cap.max(0) as u64)?;
    vm.release_owned(arr)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn array_view(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [arr, start, len] = expect_args::<3>(vm, "rt_array_view", ctx.args)?;
    let h = array_handle(vm, "rt_array_view", &arr)?;
    let start = arg_int(vm, "rt_array_view", &start)?;
    let len = arg_int(vm, "rt_array_view", &len)?;
    if start < 0 || len < 0 {
        vm.release_owned(arr)?;
        return Err(err(PanicKind::OutOfBounds, "negative view bounds").into());
    }
    let out = vm.array_make_view(h, start as u64, len as u64)?;
    vm.release_owned(arr)?;
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

    fn int_array(vm: &mut Vm, values: &[i64]) -> Handle {
        let int64 = vm.types.int64();
        let ty = vm.types.array_of(int64);
        let elems = values.iter().map(|v| Value::int(*v, int64)).collect();
        vm.heap.alloc(ty, ObjectPayload::Array(elems))
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let h = int_array(&mut vm, &[1, 2]);
        vm.array_push_value(h, Value::int(3, int64)).unwrap();
        assert_eq!(vm.array_len(h).unwrap(), 3);
        let popped = vm.array_pop_value(h).unwrap();
        let ValueKind::Tag(tag) = popped.kind else {
            panic!("expected Option tag");
        };
        let some = vm.types.intern_symbol("Some");
        assert_eq!(vm.tag_variant_of(tag).unwrap(), some);
        let v = vm.tag_payload_clone(tag, some, 0).unwrap();
        assert_eq!(v.as_int(), Some(3));
        assert_eq!(vm.array_len(h).unwrap(), 2);
    }

    #[test]
    fn test_pop_empty_is_nothing() {
        let mut vm = vm();
        let h = int_array(&mut vm, &[]);
        let popped = vm.array_pop_value(h).unwrap();
        let ValueKind::Tag(tag) = popped.kind else {
            panic!("expected Option tag");
        };
        let nothing = vm.types.intern_symbol("nothing");
        assert_eq!(vm.tag_variant_of(tag).unwrap(), nothing);
    }

    #[test]
    fn test_growth_at_least_doubles() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let h = int_array(&mut vm, &[]);
        for i in 0..100 {
            vm.array_push_value(h, Value::int(i, int64)).unwrap();
        }
        assert_eq!(vm.array_len(h).unwrap(), 100);
        for i in 0..100 {
            assert_eq!(vm.array_get_snapshot(h, i).unwrap().as_int(), Some(i as i64));
        }
    }

    #[test]
    fn test_reserve_clamps_to_len() {
        let mut vm = vm();
        let h = int_array(&mut vm, &[1, 2, 3]);
        vm.array_reserve_cap(h, 1).unwrap();
        assert_eq!(vm.array_len(h).unwrap(), 3);
        vm.array_reserve_cap(h, 64).unwrap();
        assert_eq!(vm.array_len(h).unwrap(), 3);
    }

    #[test]
    fn test_view_projects_through_base() {
        let mut vm = vm();
        let h = int_array(&mut vm, &[10, 20, 30, 40]);
        let view = vm.array_make_view(h, 1, 2).unwrap();
        let ValueKind::Array(vh) = view.kind else {
            panic!("expected array view");
        };
        assert_eq!(vm.array_len(vh).unwrap(), 2);
        assert_eq!(vm.array_get_snapshot(vh, 0).unwrap().as_int(), Some(20));
        assert_eq!(vm.array_get_snapshot(vh, 1).unwrap().as_int(), Some(30));
        assert!(vm.array_get_snapshot(vh, 2).is_err());
        // base retained by the view
        assert_eq!(vm.heap.get(h).unwrap().refcount, 2);
        // pushes through a view are unsupported
        let int64 = vm.types.int64();
        assert!(vm.array_push_value(vh, Value::int(5, int64)).is_err());
    }

    #[test]
    fn test_view_of_view_reanchors() {
        let mut vm = vm();
        let h = int_array(&mut vm, &[1, 2, 3, 4, 5]);
        let v1 = vm.array_make_view(h, 1, 3).unwrap();
        let ValueKind::Array(v1h) = v1.kind else {
            panic!()
        };
        let v2 = vm.array_make_view(v1h, 1, 2).unwrap();
        let ValueKind::Array(v2h) = v2.kind else {
            panic!()
        };
        match &vm.heap.get(v2h).unwrap().payload {
            ObjectPayload::ArraySlice { base, start, .. } => {
                assert_eq!(*base, h);
                assert_eq!(*start, 2);
            }
            _ => panic!("expected view"),
        }
        assert_eq!(vm.array_get_snapshot(v2h, 0).unwrap().as_int(), Some(3));
    }
}
