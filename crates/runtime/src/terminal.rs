//! Terminal intrinsics.
//!
//! All gated on the host exposing a terminal capability; without one, every
//! operation answers with the `Unsupported` error code rather than
//! panicking, so programs can probe and fall back.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::host::TermEvent;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, expect_args};
use crate::rope;
use crate::value::{Value, ValueKind};

fn unsupported(vm: &mut Vm) -> VmResult<Value> {
    let unit = vm.types.unit();
    vm.erring_error_value(unit, OsCode::Unsupported, "no terminal capability")
}

fn term_unit_op(
    vm: &mut Vm,
    ctx: CallCtx,
    name: &str,
    op: impl FnOnce(&mut dyn crate::host::Terminal) -> std::io::Result<()>,
) -> VmResult<Value> {
    expect_args::<0>(vm, name, ctx.args)?;
    let Some(term) = vm.host.terminal() else {
        return unsupported(vm);
    };
    match op(term) {
        Ok(()) => {
            let unit_v = Value::unit(vm.types.unit());
            vm.erring_success_value(unit_v)
        }
        Err(e) => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::from_io(&e), &e.to_string())
        }
    }
}

/// `rt_term_raw_mode(enable)`.
pub(crate) fn term_raw_mode(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [enable] = expect_args::<1>(vm, "rt_term_raw_mode", ctx.args)?;
    let ValueKind::Bool(enable) = enable.kind else {
        let msg = format!("rt_term_raw_mode: expected bool, got {}", enable.kind_name());
        vm.release_owned(enable)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let Some(term) = vm.host.terminal() else {
        return unsupported(vm);
    };
    match term.set_raw_mode(enable) {
        Ok(()) => {
            let unit_v = Value::unit(vm.types.unit());
            vm.erring_success_value(unit_v)
        }
        Err(e) => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::from_io(&e), &e.to_string())
        }
    }
}

pub(crate) fn term_enter_alt(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    term_unit_op(vm, ctx, "rt_term_enter_alt", |t| t.enter_alt_screen())
}

pub(crate) fn term_exit_alt(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    term_unit_op(vm, ctx, "rt_term_exit_alt", |t| t.exit_alt_screen())
}

pub(crate) fn term_hide_cursor(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    term_unit_op(vm, ctx, "rt_term_hide_cursor", |t| t.hide_cursor())
}

pub(crate) fn term_show_cursor(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    term_unit_op(vm, ctx, "rt_term_show_cursor", |t| t.show_cursor())
}

pub(crate) fn term_flush(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    term_unit_op(vm, ctx, "rt_term_flush", |t| t.flush())
}

/// `rt_term_size`: `Erring<TermSize { cols, rows }>`.
pub(crate) fn term_size(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_term_size", ctx.args)?;
    let Some(term) = vm.host.terminal() else {
        return unsupported(vm);
    };
    match term.size() {
        Ok((cols, rows)) => {
            let int64 = vm.types.int64();
            let size_ty = vm
                .types
                .struct_of("TermSize", &[("cols", int64), ("rows", int64)]);
            let h = vm.heap.alloc(
                size_ty,
                ObjectPayload::Struct(vec![
                    Value::int(i64::from(cols), int64),
                    Value::int(i64::from(rows), int64),
                ]),
            );
            let v = Value::new(size_ty, ValueKind::Struct(h));
            vm.erring_success_value(v)
        }
        Err(e) => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::from_io(&e), &e.to_string())
        }
    }
}

pub(crate) fn term_write(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [data] = expect_args::<1>(vm, "rt_term_write", ctx.args)?;
    let bytes = match data.kind {
        ValueKind::Str(h) => {
            let text = rope::materialize(&mut vm.heap, h)?;
            vm.release_owned(data)?;
            text.into_bytes()
        }
        ValueKind::Array(arr) => {
            let len = vm.array_len(arr)?;
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                let elem = vm.array_get_snapshot(arr, i)?;
                let byte = elem.as_int().filter(|b| (0..=255).contains(b)).ok_or_else(|| {
                    err(PanicKind::TypeMismatch, "rt_term_write: array element is not a byte")
                })?;
                out.push(byte as u8);
            }
            vm.release_owned(data)?;
            out
        }
        _ => {
            let msg = format!("rt_term_write: cannot write {}", data.kind_name());
            vm.release_owned(data)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    let Some(term) = vm.host.terminal() else {
        return unsupported(vm);
    };
    match term.write_bytes(&bytes) {
        Ok(()) => {
            let unit_v = Value::unit(vm.types.unit());
            vm.erring_success_value(unit_v)
        }
        Err(e) => {
            let unit = vm.types.unit();
            vm.erring_error_value(unit, OsCode::from_io(&e), &e.to_string())
        }
    }
}

/// `rt_term_read_event`: `Erring<TermEvent>` where `TermEvent` is the union
/// `Key(code) | Resize(cols, rows) | Eof`.
pub(crate) fn term_read_event(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_term_read_event", ctx.args)?;
    let Some(term) = vm.host.terminal() else {
        return unsupported(vm);
    };
    let event = match term.read_event() {
        Ok(event) => event,
        Err(e) => {
            let unit = vm.types.unit();
            return vm.erring_error_value(unit, OsCode::from_io(&e), &e.to_string());
        }
    };
    let int64 = vm.types.int64();
    let event_ty = vm.types.union_of(
        "TermEvent",
        &[
            ("Key", &[int64]),
            ("Resize", &[int64, int64]),
            ("Eof", &[]),
        ],
    );
    let tag = match event {
        TermEvent::Key(b) => {
            let sym = vm.types.intern_symbol("Key");
            vm.make_tag(event_ty, sym, vec![Value::int(i64::from(b), int64)])?
        }
        TermEvent::Resize(cols, rows) => {
            let sym = vm.types.intern_symbol("Resize");
            vm.make_tag(
                event_ty,
                sym,
                vec![
                    Value::int(i64::from(cols), int64),
                    Value::int(i64::from(rows), int64),
                ],
            )?
        }
        TermEvent::Eof => {
            let sym = vm.types.intern_symbol("Eof");
            vm.make_tag(event_ty, sym, Vec::new())?
        }
    };
    vm.erring_success_value(tag)
}
