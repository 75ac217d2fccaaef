//! Stdio and environment intrinsics.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, arg_int, expect_args};
use crate::rope;
use crate::value::{Value, ValueKind};

/// `rt_argv`: the process arguments as an array of strings.
pub(crate) fn rt_argv(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_argv", ctx.args)?;
    let str_ty = vm.types.str_();
    let arr_ty = vm.types.array_of(str_ty);
    let args = vm.host.argv();
    let mut elems = Vec::with_capacity(args.len());
    for arg in args {
        let h = rope::from_bytes(&mut vm.heap, str_ty, arg.as_bytes())?;
        elems.push(Value::new(str_ty, ValueKind::Str(h)));
    }
    let h = vm.heap.alloc(arr_ty, ObjectPayload::Array(elems));
    Ok(Value::new(arr_ty, ValueKind::Array(h)))
}

/// `rt_stdin_read_all`: the whole of stdin as `Erring<Str>`.
pub(crate) fn rt_stdin_read_all(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_stdin_read_all", ctx.args)?;
    let str_ty = vm.types.str_();
    match vm.host.stdin_read_all() {
        Ok(bytes) => match rope::from_bytes(&mut vm.heap, str_ty, &bytes) {
            Ok(h) => {
                let s = Value::new(str_ty, ValueKind::Str(h));
                vm.erring_success_value(s)
            }
            Err(e) => vm.erring_error_value(str_ty, OsCode::InvalidData, &e.message),
        },
        Err(e) => vm.erring_error_value(str_ty, OsCode::from_io(&e), &e.to_string()),
    }
}

/// `readline`: `Some(line)` without the newline, `nothing` at end of input.
pub(crate) fn readline(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "readline", ctx.args)?;
    let str_ty = vm.types.str_();
    match vm.host.stdin_read_line() {
        Ok(Some(line)) => {
            let h = rope::from_bytes(&mut vm.heap, str_ty, line.as_bytes())?;
            let s = Value::new(str_ty, ValueKind::Str(h));
            vm.option_some(s)
        }
        Ok(None) => vm.option_nothing(str_ty),
        Err(e) => Err(err(PanicKind::Unimplemented, format!("stdin failed: {e}")).into()),
    }
}

fn write_stream(vm: &mut Vm, ctx: CallCtx, name: &str, stderr: bool) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, name, ctx.args)?;
    let ValueKind::Str(h) = v.kind else {
        let msg = format!("{name}: expected string, got {}", v.kind_name());
        vm.release_owned(v)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let text = rope::materialize(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    let result = if stderr {
        vm.host.write_stderr(text.as_bytes())
    } else {
        vm.host.write_stdout(text.as_bytes())
    };
    if let Err(e) = result {
        return Err(err(PanicKind::Unimplemented, format!("{name} failed: {e}")).into());
    }
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn rt_write_stdout(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    write_stream(vm, ctx, "rt_write_stdout", false)
}

pub(crate) fn rt_write_stderr(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    write_stream(vm, ctx, "rt_write_stderr", true)
}

/// `exit`/`rt_exit`: shutdown with a user-supplied code. An error-like
/// argument (the `error` arm of `Erring`) prints its message field and
/// exits 1.
pub(crate) fn rt_exit(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "exit", ctx.args)?;
    match v.kind {
        ValueKind::Int(code) => {
            vm.release_owned(v)?;
            Err(crate::error::Unwind::Exit(code as i32))
        }
        ValueKind::Tag(h) => {
            let message = vm.error_like_message(h)?;
            vm.release_owned(v)?;
            let _ = vm
                .host
                .write_stderr(format!("error: {message}\n").as_bytes());
            Err(crate::error::Unwind::Exit(1))
        }
        _ => {
            let msg = format!("exit takes an int or an error, got {}", v.kind_name());
            vm.release_owned(v)?;
            Err(err(PanicKind::TypeMismatch, msg).into())
        }
    }
}

/// `rt_parse_arg`: argv[i] parsed as an integer, recoverable.
pub(crate) fn rt_parse_arg(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [i] = expect_args::<1>(vm, "rt_parse_arg", ctx.args)?;
    let i = arg_int(vm, "rt_parse_arg", &i)?;
    let int64 = vm.types.int64();
    let args = vm.host.argv();
    let Some(arg) = (i >= 0).then(|| args.get(i as usize)).flatten() else {
        return vm.erring_error_value(int64, OsCode::NotFound, &format!("no argument {i}"));
    };
    match arg.parse::<i64>() {
        Ok(n) => {
            let v = Value::int(n, int64);
            vm.erring_success_value(v)
        }
        Err(_) => {
            let msg = format!("`{arg}` is not an integer");
            vm.erring_error_value(int64, OsCode::InvalidData, &msg)
        }
    }
}

/// `rt_panic`: a user panic; terminal, exit code 1.
pub(crate) fn rt_panic(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "rt_panic", ctx.args)?;
    let message = match v.kind {
        ValueKind::Str(h) => rope::materialize(&mut vm.heap, h)?,
        _ => format!("{}", v.kind_name()),
    };
    vm.release_owned(v)?;
    Err(err(PanicKind::User, message).into())
}

/// `rt_panic_bounds`: the dedicated bounds-check failure.
pub(crate) fn rt_panic_bounds(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [index, len] = expect_args::<2>(vm, "rt_panic_bounds", ctx.args)?;
    let index = arg_int(vm, "rt_panic_bounds", &index)?;
    let len = arg_int(vm, "rt_panic_bounds", &len)?;
    Err(err(
        PanicKind::OutOfBounds,
        format!("index {index} out of bounds (length {len})"),
    )
    .into())
}

impl Vm {
    /// Message field of an error-like tag (`error(OsError { .. })`).
    pub(crate) fn error_like_message(&mut self, tag: crate::value::Handle) -> VmResult<String> {
        let payload = match &self.heap.get(tag)?.payload {
            ObjectPayload::Tag(t) => t.payload.first().cloned(),
            _ => None,
        };
        if let Some(Value {
            kind: ValueKind::Struct(s),
            ..
        }) = payload
        {
            // OsError { code, message }
            let msg = if let ObjectPayload::Struct(fields) = &self.heap.get(s)?.payload {
                if let Some(Value {
                    kind: ValueKind::Str(msg),
                    ..
                }) = fields.get(1)
                {
                    Some(*msg)
                } else {
                    None
                }
            } else {
                None
            };
            if let Some(msg) = msg {
                return crate::rope::materialize(&mut self.heap, msg);
            }
        }
        Ok("unknown error".to_string())
    }
}
