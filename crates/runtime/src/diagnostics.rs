//! Runtime diagnostics: heap statistics and live-object dumps.
//!
//! `rt_heap_stats` returns the six heap counters as a struct;
//! `rt_heap_dump` renders the live set plus scheduler and channel counters
//! into a stable, human-readable string.

use crate::error::VmResult;
use crate::heap::{ObjectPayload, StrRepr};
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, expect_args};
use crate::value::{Value, ValueKind};

/// `rt_heap_stats`: `HeapStats { allocs, frees, live_blocks, live_bytes,
/// rc_incs, rc_decs }`.
pub(crate) fn heap_stats(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_heap_stats", ctx.args)?;
    let stats = vm.heap.stats();
    let int64 = vm.types.int64();
    let ty = vm.types.struct_of(
        "HeapStats",
        &[
            ("allocs", int64),
            ("frees", int64),
            ("live_blocks", int64),
            ("live_bytes", int64),
            ("rc_incs", int64),
            ("rc_decs", int64),
        ],
    );
    let h = vm.heap.alloc(
        ty,
        ObjectPayload::Struct(vec![
            Value::int(stats.allocs as i64, int64),
            Value::int(stats.frees as i64, int64),
            Value::int(stats.live_blocks as i64, int64),
            Value::int(stats.live_bytes as i64, int64),
            Value::int(stats.rc_incs as i64, int64),
            Value::int(stats.rc_decs as i64, int64),
        ]),
    );
    Ok(Value::new(ty, ValueKind::Struct(h)))
}

/// `rt_heap_dump`: the live set, stable-sorted by kind then handle, plus
/// executor and channel counters.
pub(crate) fn heap_dump(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    expect_args::<0>(vm, "rt_heap_dump", ctx.args)?;
    let mut live: Vec<_> = vm
        .heap
        .live_objects()
        .map(|(h, o)| (o.kind, h, o.refcount, render_payload(&o.payload)))
        .collect();
    live.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    let mut out = String::new();
    out.push_str(&format!("live objects: {}\n", live.len()));
    for (kind, h, rc, brief) in live {
        out.push_str(&format!("  {}#{} rc={} {}\n", kind.name(), h.0, rc, brief));
    }
    let exec = &vm.exec.stats;
    out.push_str(&format!(
        "tasks: spawned={} completed={} polls={} wakes={} peak={}\n",
        exec.spawned, exec.completed, exec.polls, exec.wakes, exec.peak_live
    ));
    out.push_str(&format!("channels: open={}\n", vm.chans.count()));
    let str_ty = vm.types.str_();
    let h = crate::rope::flat(&mut vm.heap, str_ty, out);
    Ok(Value::new(str_ty, ValueKind::Str(h)))
}

fn render_payload(payload: &ObjectPayload) -> String {
    match payload {
        ObjectPayload::Str(s) => match &s.repr {
            StrRepr::Flat(bytes) => format!("flat {} bytes", bytes.len()),
            StrRepr::Concat(a, b) => format!("concat #{} #{}", a.0, b.0),
            StrRepr::Slice { base, start, len } => {
                format!("slice #{} {}..+{}", base.0, start, len)
            }
        },
        ObjectPayload::Array(elems) => format!("len {}", elems.len()),
        ObjectPayload::ArraySlice { base, start, len, .. } => {
            format!("view #{} {}..+{}", base.0, start, len)
        }
        ObjectPayload::Map(map) => format!("{} entries", map.entries.len()),
        ObjectPayload::Struct(fields) => format!("{} fields", fields.len()),
        ObjectPayload::Tag(tag) => format!("variant #{}", tag.variant.0),
        ObjectPayload::Range(_) => "range".to_string(),
        ObjectPayload::BigInt(v) => v.to_string(),
        ObjectPayload::BigUint(v) => v.to_string(),
        ObjectPayload::BigFloat(v) => v.format(),
        ObjectPayload::Freed => "freed".to_string(),
    }
}

impl Vm {
    /// Terse one-line rendering of a value for the tracer.
    pub(crate) fn render_value(&self, v: &Value) -> String {
        match v.kind {
            ValueKind::Invalid => "invalid".to_string(),
            ValueKind::Int(n) => n.to_string(),
            ValueKind::Bool(b) => b.to_string(),
            ValueKind::Unit => "()".to_string(),
            ValueKind::Func(f) => format!("fn{}", f.0),
            ValueKind::Ref(_) => "&_".to_string(),
            ValueKind::RefMut(_) => "&mut _".to_string(),
            ValueKind::Ptr(_) => "ptr".to_string(),
            ValueKind::Str(h) => match self.heap.lookup(h).map(|o| &o.payload) {
                Some(ObjectPayload::Str(s)) => match &s.repr {
                    StrRepr::Flat(bytes) => {
                        format!("{:?}", String::from_utf8_lossy(bytes))
                    }
                    _ => format!("str#{}", h.0),
                },
                _ => format!("str#{}", h.0),
            },
            ValueKind::Array(h) => format!("array#{}", h.0),
            ValueKind::Map(h) => format!("map#{}", h.0),
            ValueKind::Struct(h) => format!("struct#{}", h.0),
            ValueKind::Tag(h) => format!("tag#{}", h.0),
            ValueKind::Range(h) => format!("range#{}", h.0),
            ValueKind::BigInt(h) | ValueKind::BigUint(h) | ValueKind::BigFloat(h) => {
                match self.heap.lookup(h).map(|o| &o.payload) {
                    Some(ObjectPayload::BigInt(v)) => v.to_string(),
                    Some(ObjectPayload::BigUint(v)) => v.to_string(),
                    Some(ObjectPayload::BigFloat(v)) => v.format(),
                    _ => format!("big#{}", h.0),
                }
            }
        }
    }
}
