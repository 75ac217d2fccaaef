//! Central intrinsic dispatch.
//!
//! Calls whose callee is a runtime-recognized name land here: the name is
//! stripped of any `::<…>` instantiation suffix, checked against the
//! destination type's tag layout (tag constructors), then looked up in the
//! flat name table. Every dispatched intrinsic is reported to the recorder
//! and checked against the replayer when those are attached.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::interp::Vm;
use crate::value::{Location, LocationKind, Value, ValueKind};
use volt_core::{Place, TypeId, TypeKind};

/// Everything a handler can see about its call site.
pub(crate) struct CallCtx {
    pub args: Vec<Value>,
    pub type_args: Vec<TypeId>,
    /// Declared type of the destination slot, when the call writes to a
    /// plain local; tag constructors use it to pick their layout.
    pub dst_ty: TypeId,
}

impl CallCtx {
    /// First type argument, falling back to the destination type.
    pub fn type_arg(&self) -> TypeId {
        self.type_args.first().copied().unwrap_or(self.dst_ty)
    }
}

pub(crate) type Handler = fn(&mut Vm, CallCtx) -> VmResult<Value>;

/// Resolved tag-constructor call site.
enum TagTarget {
    Variant(TypeId, volt_core::Symbol),
    BuiltinSome,
    BuiltinNothing(TypeId),
}

/// Strip a generic-instantiation suffix: `foo::<int>` -> `foo`.
pub(crate) fn strip_generic_suffix(name: &str) -> &str {
    match name.find("::<") {
        Some(i) => &name[..i],
        None => name,
    }
}

/// Take exactly `N` arguments, releasing everything on arity mismatch.
pub(crate) fn expect_args<const N: usize>(
    vm: &mut Vm,
    name: &str,
    args: Vec<Value>,
) -> VmResult<[Value; N]> {
    if args.len() != N {
        let got = args.len();
        for v in &args {
            let _ = vm.heap.release_value(v);
        }
        return Err(err(
            PanicKind::TypeMismatch,
            format!("{name} expects {N} argument(s), got {got}"),
        )
        .into());
    }
    Ok(args.try_into().expect("length checked"))
}

pub(crate) fn arg_int(vm: &mut Vm, name: &str, v: &Value) -> VmResult<i64> {
    match v.kind {
        ValueKind::Int(n) => Ok(n),
        _ => {
            let _ = vm.heap.release_value(v);
            Err(err(
                PanicKind::TypeMismatch,
                format!("{name}: expected int, got {}", v.kind_name()),
            )
            .into())
        }
    }
}

impl Vm {
    /// Entry point for `call` instructions whose callee is a name.
    pub(crate) fn call_named(
        &mut self,
        name: &str,
        dst: Option<Place>,
        args: Vec<Value>,
        type_args: &[TypeId],
    ) -> VmResult<()> {
        let base = strip_generic_suffix(name).to_string();
        let dst_ty = dst
            .as_ref()
            .map(|p| self.place_root_ty(p))
            .unwrap_or(TypeId::UNKNOWN);
        let logging = self.recorder.is_some() || self.replayer.is_some();
        let args_json = logging.then(|| {
            args.iter()
                .map(|v| self.value_to_json(v))
                .collect::<Vec<_>>()
        });

        let ret = if let Some(target) = self.tag_ctor_target(&base, dst_ty, &args, type_args) {
            self.build_tag(target, args)?
        } else {
            let Some(handler) = lookup(&base) else {
                for v in &args {
                    let _ = self.heap.release_value(v);
                }
                return Err(err(
                    PanicKind::UnsupportedIntrinsic,
                    format!("unsupported intrinsic `{base}`"),
                )
                .into());
            };
            handler(
                self,
                CallCtx {
                    args,
                    type_args: type_args.to_vec(),
                    dst_ty,
                },
            )?
        };

        if let Some(args_json) = args_json {
            let ret_json = self.value_to_json(&ret);
            if let Some(rec) = self.recorder.as_mut() {
                rec.record_intrinsic(&base, &args_json, &ret_json);
            }
            if self.replayer.is_some() {
                let check = self
                    .replayer
                    .as_mut()
                    .expect("checked above")
                    .expect_intrinsic(&base, &args_json, &ret_json);
                if let Err(e) = check {
                    let _ = self.heap.release_value(&ret);
                    return Err(e.into());
                }
            }
        }

        match dst {
            Some(place) => self.write_place(&place, ret),
            None => self.release_owned(ret),
        }
    }

    /// Declared type of a destination place with a bare local/global root;
    /// UNKNOWN for projected places (the handler does not need those).
    fn place_root_ty(&self, place: &Place) -> TypeId {
        if !place.projections.is_empty() {
            return TypeId::UNKNOWN;
        }
        match place.root {
            volt_core::PlaceRoot::Local(local) => self
                .frames
                .last()
                .and_then(|f| f.slots.get(local.0 as usize))
                .map(|s| s.ty)
                .unwrap_or(TypeId::UNKNOWN),
            volt_core::PlaceRoot::Global(global) => self
                .globals
                .get(global.0 as usize)
                .map(|s| s.ty)
                .unwrap_or(TypeId::UNKNOWN),
        }
    }

    /// Tag-constructor hook: a callee naming a variant of the destination's
    /// union layout allocates that tag. The built-in `Option` variants work
    /// without a known destination.
    fn tag_ctor_target(
        &self,
        base: &str,
        dst_ty: TypeId,
        args: &[Value],
        type_args: &[TypeId],
    ) -> Option<TagTarget> {
        if let Some(TypeKind::Union { .. }) = self.types.kind(dst_ty) {
            if let Some(sym) = self.types.find_symbol(base) {
                if self.types.variant(dst_ty, sym).is_some() {
                    return Some(TagTarget::Variant(dst_ty, sym));
                }
            }
        }
        match base {
            "Some" if args.len() == 1 => Some(TagTarget::BuiltinSome),
            "nothing" if args.is_empty() => Some(TagTarget::BuiltinNothing(
                type_args.first().copied().unwrap_or(TypeId::UNKNOWN),
            )),
            _ => None,
        }
    }

    fn build_tag(&mut self, target: TagTarget, mut args: Vec<Value>) -> VmResult<Value> {
        match target {
            TagTarget::Variant(union_ty, sym) => self.make_tag(union_ty, sym, args),
            TagTarget::BuiltinSome => {
                let v = args.pop().expect("arity checked by tag_ctor_target");
                self.option_some(v)
            }
            TagTarget::BuiltinNothing(elem) => {
                let elem = if elem.is_unknown() {
                    self.types.unit()
                } else {
                    elem
                };
                self.option_nothing(elem)
            }
        }
    }
}

/// The flat name table. One entry per runtime built-in; handlers live with
/// the subsystem they touch.
pub(crate) fn lookup(name: &str) -> Option<Handler> {
    Some(match name {
        // Introspection
        "size_of" => size_of,
        "align_of" => align_of,
        "default" => default_value,
        "__len" => universal_len,
        "__clone" => universal_clone,
        "__index" => universal_index,
        "__to" => universal_to,
        "from_str" => from_str,
        "from_bytes" => crate::string_ops::string_from_bytes,
        "__add" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Add),
        "__sub" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Sub),
        "__mul" => magic_mul,
        "__div" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Div),
        "__mod" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Rem),
        "__eq" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Eq),
        "__ne" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Ne),
        "__lt" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Lt),
        "__le" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Le),
        "__gt" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Gt),
        "__ge" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Ge),
        "__and" => |vm, c| magic_binary(vm, c, volt_core::BinOp::BitAnd),
        "__or" => |vm, c| magic_binary(vm, c, volt_core::BinOp::BitOr),
        "__xor" => |vm, c| magic_binary(vm, c, volt_core::BinOp::BitXor),
        "__shl" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Shl),
        "__shr" => |vm, c| magic_binary(vm, c, volt_core::BinOp::Shr),
        "__pos" => |vm, c| magic_unary(vm, c, volt_core::UnOp::Pos),
        "__neg" => |vm, c| magic_unary(vm, c, volt_core::UnOp::Neg),
        "__not" => |vm, c| magic_unary(vm, c, volt_core::UnOp::Not),

        // Stdio / environment
        "rt_argv" => crate::io::rt_argv,
        "rt_stdin_read_all" => crate::io::rt_stdin_read_all,
        "readline" => crate::io::readline,
        "rt_write_stdout" => crate::io::rt_write_stdout,
        "rt_write_stderr" => crate::io::rt_write_stderr,
        "rt_exit" | "exit" => crate::io::rt_exit,
        "rt_parse_arg" => crate::io::rt_parse_arg,
        "rt_panic" => crate::io::rt_panic,
        "rt_panic_bounds" => crate::io::rt_panic_bounds,

        // Strings
        "rt_string_ptr" => crate::string_ops::string_ptr,
        "rt_string_len" => crate::string_ops::string_len,
        "rt_string_len_bytes" => crate::string_ops::string_len_bytes,
        "rt_string_from_bytes" => crate::string_ops::string_from_bytes,
        "rt_string_from_utf16" => crate::string_ops::string_from_utf16,
        "rt_string_index" => crate::string_ops::string_index,
        "rt_string_slice" => crate::string_ops::string_slice,
        "rt_string_force_flatten" => crate::string_ops::string_force_flatten,
        "rt_string_bytes_view" => crate::string_ops::string_bytes_view,
        "rt_string_concat" => crate::string_ops::string_concat,
        "rt_string_eq" => crate::string_ops::string_eq,

        // Raw memory
        "rt_alloc" => rt_alloc,
        "rt_free" => rt_free,
        "rt_realloc" => rt_realloc,
        "rt_memcpy" => rt_memcpy,
        "rt_memmove" => rt_memmove,

        // Arrays
        "rt_array_reserve" => crate::array_ops::array_reserve,
        "rt_array_push" => crate::array_ops::array_push,
        "rt_array_pop" => crate::array_ops::array_pop,
        "rt_array_view" => crate::array_ops::array_view,

        // Ranges and iteration
        "rt_range_int_new" => crate::range_ops::range_int_new,
        "rt_range_int_from_start" => crate::range_ops::range_int_from_start,
        "rt_range_int_to_end" => crate::range_ops::range_int_to_end,
        "rt_range_int_full" => crate::range_ops::range_int_full,
        "__range" => crate::range_ops::iter_init,
        "next" => crate::range_ops::iter_next,

        // Maps (and channel construction, both answer to `new`)
        "new" => dispatch_new,
        "len" => crate::map_ops::map_len,
        "contains" => crate::map_ops::map_contains,
        "get_ref" => crate::map_ops::map_get_ref,
        "get_mut" => crate::map_ops::map_get_mut,
        "insert" => crate::map_ops::map_insert,
        "remove" => crate::map_ops::map_remove,

        // Diagnostics
        "rt_heap_stats" => crate::diagnostics::heap_stats,
        "rt_heap_dump" => crate::diagnostics::heap_dump,

        // Filesystem
        "rt_fs_cwd" => crate::file::fs_cwd,
        "rt_fs_metadata" | "rt_fs_file_metadata" => crate::file::fs_metadata,
        "rt_fs_read_dir" => crate::file::fs_read_dir,
        "rt_fs_mkdir" => crate::file::fs_mkdir,
        "rt_fs_remove_file" => crate::file::fs_remove_file,
        "rt_fs_remove_dir" => crate::file::fs_remove_dir,
        "rt_fs_open" => crate::file::fs_open,
        "rt_fs_close" => crate::file::fs_close,
        "rt_fs_read" => crate::file::fs_read,
        "rt_fs_write" => crate::file::fs_write,
        "rt_fs_seek" => crate::file::fs_seek,
        "rt_fs_flush" => crate::file::fs_flush,
        "rt_fs_read_file" => crate::file::fs_read_file,
        "rt_fs_write_file" => crate::file::fs_write_file,
        "rt_fs_file_name" => crate::file::fs_file_name,
        "rt_fs_file_type" => crate::file::fs_file_type,

        // Networking
        "rt_net_listen" => crate::tcp::net_listen,
        "rt_net_connect" => crate::tcp::net_connect,
        "rt_net_accept" => crate::tcp::net_accept,
        "rt_net_read" => crate::tcp::net_read,
        "rt_net_write" => crate::tcp::net_write,
        "rt_net_close" => crate::tcp::net_close,
        "rt_net_local_addr" => crate::tcp::net_local_addr,
        "rt_net_wait_accept" => crate::tcp::net_wait_accept,
        "rt_net_wait_readable" => crate::tcp::net_wait_readable,
        "rt_net_wait_writable" => crate::tcp::net_wait_writable,

        // Terminal
        "rt_term_raw_mode" => crate::terminal::term_raw_mode,
        "rt_term_enter_alt" => crate::terminal::term_enter_alt,
        "rt_term_exit_alt" => crate::terminal::term_exit_alt,
        "rt_term_hide_cursor" => crate::terminal::term_hide_cursor,
        "rt_term_show_cursor" => crate::terminal::term_show_cursor,
        "rt_term_size" => crate::terminal::term_size,
        "rt_term_write" => crate::terminal::term_write,
        "rt_term_flush" => crate::terminal::term_flush,
        "rt_term_read_event" => crate::terminal::term_read_event,

        // Clock and concurrency
        "monotonic_now" => crate::time_ops::monotonic_now,
        "checkpoint" => crate::time_ops::checkpoint_intrinsic,
        "sleep" => crate::time_ops::sleep,
        "timeout" => crate::time_ops::timeout,
        "__task_create" => crate::scheduler::task_create,
        "__task_state" => crate::scheduler::task_state,
        "clone" => crate::scheduler::task_clone,
        "cancel" => crate::scheduler::task_cancel,
        "make_channel" => crate::channel::make_channel,
        "send" => crate::channel::send,
        "recv" => crate::channel::recv,
        "try_send" => crate::channel::try_send,
        "try_recv" => crate::channel::try_recv,
        "close" => crate::channel::close,
        "rt_task_parked" => crate::scheduler::task_parked,
        "rt_scope_enter" => crate::scheduler::scope_enter,
        "rt_scope_register_child" => crate::scheduler::scope_register_child,
        "rt_scope_cancel_all" => crate::scheduler::scope_cancel_all,
        "rt_scope_join_all" => crate::scheduler::scope_join_all,
        "rt_scope_exit" => crate::scheduler::scope_exit,

        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Introspection handlers
// ---------------------------------------------------------------------------

fn size_of(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    for v in &ctx.args {
        let _ = vm.heap.release_value(v);
    }
    let ty = ctx.type_arg();
    let layout = vm
        .types
        .layout_of(ty)
        .map_err(|e| err(PanicKind::TypeMismatch, e.to_string()))?;
    Ok(Value::int(layout.size as i64, vm.types.int64()))
}

fn align_of(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    for v in &ctx.args {
        let _ = vm.heap.release_value(v);
    }
    let ty = ctx.type_arg();
    let layout = vm
        .types
        .layout_of(ty)
        .map_err(|e| err(PanicKind::TypeMismatch, e.to_string()))?;
    Ok(Value::int(layout.align as i64, vm.types.int64()))
}

fn default_value(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    for v in &ctx.args {
        let _ = vm.heap.release_value(v);
    }
    let ty = ctx.type_arg();
    vm.default_of(ty)
}

fn universal_len(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "__len", ctx.args)?;
    let len = match v.kind {
        ValueKind::Str(h) => crate::rope::cp_len(&mut vm.heap, h)?,
        ValueKind::Array(h) => vm.array_len(h)?,
        ValueKind::Map(h) => vm.map_entry_count(h)?,
        _ => {
            let msg = format!("__len on {}", v.kind_name());
            vm.release_owned(v)?;
            return Err(err(PanicKind::TypeMismatch, msg).into());
        }
    };
    vm.release_owned(v)?;
    Ok(Value::int(len as i64, vm.types.int64()))
}

/// Clone-for-share: same handle, one more reference.
fn universal_clone(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "__clone", ctx.args)?;
    vm.heap.retain_value(&v)?;
    let clone = v.clone();
    vm.release_owned(v)?;
    Ok(clone)
}

fn universal_index(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [v, idx] = expect_args::<2>(vm, "__index", ctx.args)?;
    let result = match v.kind {
        ValueKind::Array(h) => {
            let i = arg_int(vm, "__index", &idx)?;
            if i < 0 {
                vm.release_owned(v)?;
                return Err(err(PanicKind::OutOfBounds, format!("negative index {i}")).into());
            }
            let elem = vm.array_get_clone(h, i as u64)?;
            Ok(elem)
        }
        ValueKind::Str(h) => {
            let i = arg_int(vm, "__index", &idx)?;
            if i < 0 {
                vm.release_owned(v)?;
                return Err(err(PanicKind::OutOfBounds, format!("negative index {i}")).into());
            }
            let c = crate::rope::char_at(&mut vm.heap, h, i as u64)?;
            Ok(Value::int(c as i64, vm.types.int64()))
        }
        ValueKind::Map(h) => {
            let out = vm.map_get_clone(h, &idx);
            vm.release_owned(idx)?;
            out
        }
        _ => {
            let msg = format!("__index on {}", v.kind_name());
            vm.release_owned(idx)?;
            Err(err(PanicKind::TypeMismatch, msg).into())
        }
    };
    vm.release_owned(v)?;
    result
}

fn universal_to(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst = ctx.type_arg();
    let [v] = expect_args::<1>(vm, "__to", ctx.args)?;
    vm.convert_to(v, dst)
}

/// Recoverable parse: `Erring<T>` instead of a conversion panic.
fn from_str(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let dst = ctx.type_arg();
    let [v] = expect_args::<1>(vm, "from_str", ctx.args)?;
    let ValueKind::Str(h) = v.kind else {
        let msg = format!("from_str on {}", v.kind_name());
        vm.release_owned(v)?;
        return Err(err(PanicKind::TypeMismatch, msg).into());
    };
    let text = crate::rope::materialize(&mut vm.heap, h)?;
    vm.release_owned(v)?;
    let parsed = vm.parse_text_as(&text, dst)?;
    match parsed {
        Some(value) => vm.erring_success_value(value),
        None => vm.erring_error_value(
            dst,
            OsCode::InvalidData,
            &format!("cannot parse `{text}`"),
        ),
    }
}

fn magic_binary(vm: &mut Vm, ctx: CallCtx, op: volt_core::BinOp) -> VmResult<Value> {
    let [l, r] = expect_args::<2>(vm, "binary operator", ctx.args)?;
    vm.binary_op(op, l, r)
}

/// `__mul` doubles as string repetition when the left side is a string.
fn magic_mul(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [l, r] = expect_args::<2>(vm, "__mul", ctx.args)?;
    if let ValueKind::Str(h) = l.kind {
        let count = arg_int(vm, "__mul", &r)?;
        if count < 0 {
            vm.release_owned(l)?;
            return Err(err(PanicKind::OutOfBounds, "negative repeat count").into());
        }
        let out = crate::rope::repeat(&mut vm.heap, l.ty, h, count as u64)?;
        let ty = l.ty;
        vm.release_owned(l)?;
        return Ok(Value::new(ty, ValueKind::Str(out)));
    }
    vm.binary_op(volt_core::BinOp::Mul, l, r)
}

fn magic_unary(vm: &mut Vm, ctx: CallCtx, op: volt_core::UnOp) -> VmResult<Value> {
    let [v] = expect_args::<1>(vm, "unary operator", ctx.args)?;
    vm.unary_op(op, v)
}

/// `new` constructs whatever the destination type says: a map or a channel.
fn dispatch_new(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let ty = ctx.type_arg();
    match vm.types.kind(ty) {
        Some(TypeKind::Map(_, _)) => crate::map_ops::map_new(vm, ctx),
        Some(TypeKind::Chan(_)) => crate::channel::make_channel(vm, ctx),
        _ => {
            for v in &ctx.args {
                let _ = vm.heap.release_value(v);
            }
            Err(err(
                PanicKind::UnsupportedIntrinsic,
                format!("`new` cannot build {}", vm.types.display(ty)),
            )
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Raw memory handlers
// ---------------------------------------------------------------------------

fn rt_alloc(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [size, align] = expect_args::<2>(vm, "rt_alloc", ctx.args)?;
    let size = arg_int(vm, "rt_alloc", &size)?;
    let align = arg_int(vm, "rt_alloc", &align)?;
    let raw = vm.raw.alloc(size as u64, align as u64)?;
    Ok(Value::new(
        vm.types.ptr(),
        ValueKind::Ptr(Location::new(LocationKind::RawBytes { raw, offset: 0 }, true)),
    ))
}

fn ptr_location(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Location> {
    match v.kind {
        ValueKind::Ptr(loc) => Ok(loc),
        _ => {
            let _ = vm.heap.release_value(v);
            Err(err(
                PanicKind::TypeMismatch,
                format!("{name}: expected pointer, got {}", v.kind_name()),
            )
            .into())
        }
    }
}

fn rt_free(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [ptr, size, align] = expect_args::<3>(vm, "rt_free", ctx.args)?;
    let loc = ptr_location(vm, "rt_free", &ptr)?;
    let size = arg_int(vm, "rt_free", &size)?;
    let align = arg_int(vm, "rt_free", &align)?;
    let LocationKind::RawBytes { raw, offset: 0 } = loc.kind else {
        return Err(err(
            PanicKind::InvalidLocation,
            "rt_free requires a base raw pointer",
        )
        .into());
    };
    vm.raw.free(raw, size as u64, align as u64)?;
    Ok(Value::unit(vm.types.unit()))
}

fn rt_realloc(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [ptr, old_size, new_size, align] = expect_args::<4>(vm, "rt_realloc", ctx.args)?;
    let loc = ptr_location(vm, "rt_realloc", &ptr)?;
    let old_size = arg_int(vm, "rt_realloc", &old_size)?;
    let new_size = arg_int(vm, "rt_realloc", &new_size)?;
    let align = arg_int(vm, "rt_realloc", &align)?;
    let LocationKind::RawBytes { raw, offset: 0 } = loc.kind else {
        return Err(err(
            PanicKind::InvalidLocation,
            "rt_realloc requires a base raw pointer",
        )
        .into());
    };
    let new = vm
        .raw
        .realloc(raw, old_size as u64, new_size as u64, align as u64)?;
    Ok(Value::new(
        vm.types.ptr(),
        ValueKind::Ptr(Location::new(
            LocationKind::RawBytes {
                raw: new,
                offset: 0,
            },
            true,
        )),
    ))
}

fn rt_memcpy(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [dst, src, n] = expect_args::<3>(vm, "rt_memcpy", ctx.args)?;
    let dst_loc = ptr_location(vm, "rt_memcpy", &dst)?;
    let src_loc = ptr_location(vm, "rt_memcpy", &src)?;
    let n = arg_int(vm, "rt_memcpy", &n)? as u64;
    let data = vm.read_bytes_at(&src_loc, n)?;
    vm.write_bytes_at(&dst_loc, &data)?;
    Ok(Value::unit(vm.types.unit()))
}

fn rt_memmove(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [dst, src, n] = expect_args::<3>(vm, "rt_memmove", ctx.args)?;
    let dst_loc = ptr_location(vm, "rt_memmove", &dst)?;
    let src_loc = ptr_location(vm, "rt_memmove", &src)?;
    let n = arg_int(vm, "rt_memmove", &n)? as u64;
    if let (
        LocationKind::RawBytes {
            raw: dst_raw,
            offset: dst_off,
        },
        LocationKind::RawBytes {
            raw: src_raw,
            offset: src_off,
        },
    ) = (dst_loc.kind, src_loc.kind)
    {
        vm.raw.move_within(dst_raw, dst_off, src_raw, src_off, n)?;
        return Ok(Value::unit(vm.types.unit()));
    }
    // Distinct object kinds cannot overlap; a buffered copy is a move.
    let data = vm.read_bytes_at(&src_loc, n)?;
    vm.write_bytes_at(&dst_loc, &data)?;
    Ok(Value::unit(vm.types.unit()))
}

impl Vm {
    /// The default value of a type: zero for numbers, empty for containers,
    /// recursive for structs, the payload-less variant for unions.
    pub(crate) fn default_of(&mut self, ty: TypeId) -> VmResult<Value> {
        let kind = self
            .types
            .kind(ty)
            .ok_or_else(|| err(PanicKind::TypeMismatch, "default of incomplete type"))?
            .clone();
        Ok(match kind {
            TypeKind::Unit => Value::unit(ty),
            TypeKind::Bool => Value::bool_(false, ty),
            TypeKind::Int(_) | TypeKind::Uint(_) => Value::int(0, ty),
            TypeKind::IntBig => self.alloc_bigint(ty, num_bigint::BigInt::from(0)),
            TypeKind::UintBig => self.alloc_biguint(ty, num_bigint::BigUint::from(0u32)),
            TypeKind::FloatBig => self.alloc_bigfloat(ty, crate::bignum::BigFloat::zero()),
            TypeKind::Str => {
                let h = crate::rope::flat(&mut self.heap, ty, String::new());
                Value::new(ty, ValueKind::Str(h))
            }
            TypeKind::Array(_) => {
                let h = self
                    .heap
                    .alloc(ty, crate::heap::ObjectPayload::Array(Vec::new()));
                Value::new(ty, ValueKind::Array(h))
            }
            TypeKind::Map(_, _) => {
                let h = self.heap.alloc(
                    ty,
                    crate::heap::ObjectPayload::Map(crate::heap::MapPayload::default()),
                );
                Value::new(ty, ValueKind::Map(h))
            }
            TypeKind::Struct { fields, .. } => {
                let mut values = Vec::with_capacity(fields.len());
                for (_, field_ty) in fields {
                    values.push(self.default_of(field_ty)?);
                }
                let h = self
                    .heap
                    .alloc(ty, crate::heap::ObjectPayload::Struct(values));
                Value::new(ty, ValueKind::Struct(h))
            }
            TypeKind::Union { variants, .. } => {
                let variant = variants
                    .iter()
                    .find(|v| {
                        v.payload.is_empty() && self.types.symbol_name(v.name) == "nothing"
                    })
                    .or_else(|| variants.iter().find(|v| v.payload.is_empty()))
                    .ok_or_else(|| {
                        err(
                            PanicKind::Unimplemented,
                            format!(
                                "{} has no payload-less variant to default to",
                                self.types.display(ty)
                            ),
                        )
                    })?;
                let name = variant.name;
                self.make_tag(ty, name, Vec::new())?
            }
            _ => {
                return Err(err(
                    PanicKind::Unimplemented,
                    format!("no default for {}", self.types.display(ty)),
                )
                .into());
            }
        })
    }

    /// Read `n` bytes starting at a byte location (raw, string, or
    /// byte-array backed).
    pub(crate) fn read_bytes_at(&mut self, loc: &Location, n: u64) -> VmResult<Vec<u8>> {
        match loc.kind {
            LocationKind::RawBytes { raw, offset } => Ok(self.raw.read(raw, offset, n)?.to_vec()),
            LocationKind::StringBytes { object, offset } => {
                crate::rope::force_flatten(&mut self.heap, object)?;
                let bytes = crate::string_ops::flat_bytes(&self.heap, object)?;
                let end = offset
                    .checked_add(n)
                    .filter(|e| *e <= bytes.len() as u64)
                    .ok_or_else(|| {
                        err(PanicKind::OutOfBounds, "string byte read out of bounds")
                    })?;
                Ok(bytes[offset as usize..end as usize].to_vec())
            }
            LocationKind::Element { object, index, .. } => {
                let mut out = Vec::with_capacity(n as usize);
                for i in 0..n {
                    let v = self.array_get_snapshot(object, index + i)?;
                    let byte = v.as_int().filter(|b| (0..=255).contains(b)).ok_or_else(|| {
                        err(
                            PanicKind::TypeMismatch,
                            "memcpy source array must hold bytes",
                        )
                    })?;
                    out.push(byte as u8);
                }
                Ok(out)
            }
            _ => Err(err(
                PanicKind::InvalidLocation,
                "memcpy source must point at bytes",
            )
            .into()),
        }
    }

    /// Write bytes through a byte location; strings are immutable.
    pub(crate) fn write_bytes_at(&mut self, loc: &Location, data: &[u8]) -> VmResult<()> {
        if !loc.mutable {
            return Err(err(
                PanicKind::StoreImmutableRef,
                "store through an immutable pointer",
            )
            .into());
        }
        match loc.kind {
            LocationKind::RawBytes { raw, offset } => {
                self.raw.write(raw, offset, data)?;
                Ok(())
            }
            LocationKind::Element { object, index, .. } => {
                let ty = self.types.int_of_width(8, false);
                for (i, byte) in data.iter().enumerate() {
                    let cell = Location::new(
                        LocationKind::Element {
                            object,
                            index: index + i as u64,
                            offset: 0,
                        },
                        true,
                    );
                    self.write_location(&cell, Value::int(i64::from(*byte), ty))?;
                }
                Ok(())
            }
            _ => Err(err(
                PanicKind::InvalidLocation,
                "memcpy destination must point at mutable bytes",
            )
            .into()),
        }
    }
}
