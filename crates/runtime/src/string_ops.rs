//! String intrinsics over the rope representation.

use crate::error::{OsCode, PanicKind, VmError, VmResult, err};
use crate::heap::{Heap, ObjectPayload, StrRepr};
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::rope;
use crate::value::{Handle, Location, LocationKind, Value, ValueKind};

/// Bytes of a flat string node. Callers flatten first.
pub(crate) fn flat_bytes(heap: &Heap, h: Handle) -> Result<&[u8], VmError> {
    match &heap.get(h)?.payload {
        ObjectPayload::Str(s) => match &s.repr {
            StrRepr::Flat(bytes) => Ok(bytes),
            _ => Err(err(
                PanicKind::TypeMismatch,
                "string bytes requested before flattening",
            )),
        },
        _ => Err(err(
            PanicKind::TypeMismatch,
            format!("handle {} is not a string", h.0),
        )),
    }
}

fn str_handle(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Handle> {
    match v.kind {
        ValueKind::Str(h) => Ok(h),
        _ => {
            let _ = vm.heap.release_value(v);
            Err(err(
                PanicKind::TypeMismatch,
                format!("{name}: expected string, got {}", v.kind_name()),
            )
            .into())
        }
    }
}

/// Collect an array argument of byte-sized ints into a buffer.
fn byte_array(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Vec<u8>> {
    let ValueKind::Array(h) = v.kind else {
        let _ = vm.heap.release_value(v);
        return Err(err(
            PanicKind::TypeMismatch,
            format!("{name}: expected byte array, got {}", v.kind_name()),
        )
        .into());
    };
    let len = vm.array_len(h)?;
    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        let elem = vm.array_get_snapshot(h, i)?;
        let byte = elem
            .as_int()
            .filter(|b| (0..=255).contains(b))
            .ok_or_else(|| {
                err(
                    PanicKind::TypeMismatch,
                    format!("{name}: array element {i} is not a byte"),
                )
            })?;
        out.push(byte as u8);
    }
    Ok(out)
}

/// As `byte_array` but for UTF-16 code units.
fn unit_array(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Vec<u16>> {
    let ValueKind::Array(h) = v.kind else {
        let _ = vm.heap.release_value(v);
        return Err(err(
            PanicKind::TypeMismatch,
            format!("{name}: expected code-unit array, got {}", v.kind_name()),
        )
        .into());
    };
    let len = vm.array_len(h)?;
    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        let elem = vm.array_get_snapshot(h, i)?;
        let unit = elem
            .as_int()
            .filter(|u| (0..=0xffff).contains(u))
            .ok_or_else(|| {
                err(
                    PanicKind::TypeMismatch,
                    format!("{name}: array element {i} is not a UTF-16 code unit"),
                )
            })?;
        out.push(unit as u16);
    }
    Ok(out)
}

/// Strict UTF-8 ingress; invalid input is recoverable (`Erring`).
pub(crate) fn string_from_bytes(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_from_bytes", ctx.args)?;
    let bytes = byte_array(vm, "rt_string_from_bytes", &v)?;
    vm.release_owned(v)?;
    let str_ty = vm.types.str_();
    match rope::from_bytes(&mut vm.heap, str_ty, &bytes) {
        Ok(h) => {
            let s = Value::new(str_ty, ValueKind::Str(h));
            vm.erring_success_value(s)
        }
        Err(e) => vm.erring_error_value(str_ty, OsCode::InvalidData, &e.message),
    }
}

/// Strict UTF-16 ingress; unpaired surrogates are recoverable.
pub(crate) fn string_from_utf16(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_from_utf16", ctx.args)?;
    let units = unit_array(vm, "rt_string_from_utf16", &v)?;
    vm.release_owned(v)?;
    let str_ty = vm.types.str_();
    match rope::from_utf16(&mut vm.heap, str_ty, &units) {
        Ok(h) => {
            let s = Value::new(str_ty, ValueKind::Str(h));
            vm.erring_success_value(s)
        }
        Err(e) => vm.erring_error_value(str_ty, OsCode::InvalidData, &e.message),
    }
}

pub(crate) fn string_len(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_len", ctx.args)?;
    let h = str_handle(vm, "rt_string_len", &v)?;
    let n = rope::cp_len(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    Ok(Value::int(n as i64, vm.types.int64()))
}

pub(crate) fn string_len_bytes(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_len_bytes", ctx.args)?;
    let h = str_handle(vm, "rt_string_len_bytes", &v)?;
    let n = rope::byte_len(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    Ok(Value::int(n as i64, vm.types.int64()))
}

/// Code point at an index.
pub(crate) fn string_index(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v, i] = expect_args::<2>(vm, "rt_string_index", ctx.args)?;
    let h = str_handle(vm, "rt_string_index", &v)?;
    let i = arg_int(vm, "rt_string_index", &i)?;
    if i < 0 {
        vm.release_owned(v)?;
        return Err(err(PanicKind::OutOfBounds, format!("negative index {i}")).into());
    }
    let c = rope::char_at(&mut vm.heap, h, i as u64)?;
    vm.release_owned(v)?;
    Ok(Value::int(c as i64, vm.types.int64()))
}

pub(crate) fn string_slice(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v, start, len] = expect_args::<3>(vm, "rt_string_slice", ctx.args)?;
    let h = str_handle(vm, "rt_string_slice", &v)?;
    let start = arg_int(vm, "rt_string_slice", &start)?;
    let len = arg_int(vm, "rt_string_slice", &len)?;
    if start < 0 || len < 0 {
        vm.release_owned(v)?;
        return Err(err(PanicKind::OutOfBounds, "negative slice bounds").into());
    }
    let ty = v.ty;
    let out = rope::slice(&mut vm.heap, ty, h, start as u64, len as u64)?;
    vm.release_owned(v)?;
    Ok(Value::new(ty, ValueKind::Str(out)))
}

/// Idempotent on flat strings.
pub(crate) fn string_force_flatten(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_force_flatten", ctx.args)?;
    let h = str_handle(vm, "rt_string_force_flatten", &v)?;
    rope::force_flatten(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn string_concat(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [a, b] = expect_args::<2>(vm, "rt_string_concat", ctx.args)?;
    let ha = str_handle(vm, "rt_string_concat", &a)?;
    let hb = match str_handle(vm, "rt_string_concat", &b) {
        Ok(h) => h,
        Err(e) => {
            let _ = vm.heap.release_value(&a);
            return Err(e);
        }
    };
    let ty = a.ty;
    let inline_max = vm.config.string_concat_inline_max;
    let out = rope::concat(&mut vm.heap, ty, ha, hb, inline_max)?;
    vm.release_owned(a)?;
    vm.release_owned(b)?;
    Ok(Value::new(ty, ValueKind::Str(out)))
}

pub(crate) fn string_eq(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [a, b] = expect_args::<2>(vm, "rt_string_eq", ctx.args)?;
    let ha = str_handle(vm, "rt_string_eq", &a)?;
    let hb = match str_handle(vm, "rt_string_eq", &b) {
        Ok(h) => h,
        Err(e) => {
            let _ = vm.heap.release_value(&a);
            return Err(e);
        }
    };
    let equal = rope::eq(&mut vm.heap, ha, hb)?;
    vm.release_owned(a)?;
    vm.release_owned(b)?;
    Ok(Value::bool_(equal, vm.types.bool_()))
}

/// Pointer to the string's bytes; the rope is flattened so the pointer sees
/// contiguous content.
pub(crate) fn string_ptr(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_string_ptr", ctx.args)?;
    let h = str_handle(vm, "rt_string_ptr", &v)?;
    rope::force_flatten(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    Ok(Value::new(
        vm.types.ptr(),
        ValueKind::Ptr(Location::new(
            LocationKind::StringBytes {
                object: h,
                offset: 0,
            },
            false,
        )),
    ))
}

/// Read-only byte view; same shape as `rt_string_ptr`.
pub(crate) fn string_bytes_view(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    string_ptr(vm, ctx)
}
