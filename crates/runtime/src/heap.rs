//! The typed, reference-counted heap.
//!
//! Every non-inline value lives here, addressed by a monotonically
//! increasing handle starting at 1 (handle 0 is the universal "none"). An
//! object is live while its reference count is at least 1; releasing the
//! last reference recursively releases children (struct fields, array
//! elements, map entries, tag payloads, range stored values, string
//! concat/slice descendants) and marks the slot freed. Freed slots are kept
//! so diagnostics can still describe them; touching one through `get` is a
//! use-after-free panic, releasing one again is a double-free.

use crate::bignum::BigFloat;
use crate::error::{PanicKind, VmError, err};
use crate::map_ops::CanonKey;
use crate::value::{Handle, Value};
use num_bigint::{BigInt, BigUint};
use rustc_hash::FxHashMap;
use volt_core::{Symbol, TypeId};

/// Runtime kind of a heap object; survives freeing for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    Str,
    Array,
    ArraySlice,
    Map,
    Struct,
    Tag,
    Range,
    BigInt,
    BigUint,
    BigFloat,
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Str => "string",
            ObjectKind::Array => "array",
            ObjectKind::ArraySlice => "array-slice",
            ObjectKind::Map => "map",
            ObjectKind::Struct => "struct",
            ObjectKind::Tag => "tag",
            ObjectKind::Range => "range",
            ObjectKind::BigInt => "big-int",
            ObjectKind::BigUint => "big-uint",
            ObjectKind::BigFloat => "big-float",
        }
    }
}

/// String rope node. Concat and slice nodes retain their children; a
/// force-flatten rewrites the node to `Flat` in place and releases them.
#[derive(Debug, Clone, PartialEq)]
pub enum StrRepr {
    Flat(Vec<u8>),
    Concat(Handle, Handle),
    /// `start`/`len` are in code points over the base.
    Slice { base: Handle, start: u64, len: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrPayload {
    pub repr: StrRepr,
    /// Cached byte length, once known.
    pub byte_len: Option<u64>,
    /// Cached code-point length, once known.
    pub cp_len: Option<u64>,
}

impl StrPayload {
    pub fn flat(bytes: Vec<u8>) -> Self {
        let byte_len = Some(bytes.len() as u64);
        StrPayload {
            repr: StrRepr::Flat(bytes),
            byte_len,
            cp_len: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub key: Value,
    pub value: Value,
}

/// Insertion-ordered entries plus a canonical-key index for O(1) lookups.
#[derive(Debug, Clone, Default)]
pub struct MapPayload {
    pub entries: Vec<MapEntry>,
    pub index: FxHashMap<CanonKey, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagData {
    /// Stable symbol of the variant.
    pub variant: Symbol,
    pub payload: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangePayload {
    /// `for` over an array: the base is retained for the iterator's
    /// lifetime.
    Iter {
        base: Handle,
        start: u64,
        len: u64,
        current: u64,
    },
    /// Numeric descriptor; `start`/`end` may be big-number handles.
    Descriptor {
        start: Option<Value>,
        end: Option<Value>,
        inclusive: bool,
    },
}

#[derive(Debug, Clone)]
pub enum ObjectPayload {
    Str(StrPayload),
    Array(Vec<Value>),
    ArraySlice {
        base: Handle,
        start: u64,
        len: u64,
        capacity: u64,
    },
    Map(MapPayload),
    Struct(Vec<Value>),
    Tag(TagData),
    Range(RangePayload),
    BigInt(BigInt),
    BigUint(BigUint),
    BigFloat(BigFloat),
    /// Placeholder left behind once the object is freed.
    Freed,
}

impl ObjectPayload {
    pub fn kind(&self) -> Option<ObjectKind> {
        Some(match self {
            ObjectPayload::Str(_) => ObjectKind::Str,
            ObjectPayload::Array(_) => ObjectKind::Array,
            ObjectPayload::ArraySlice { .. } => ObjectKind::ArraySlice,
            ObjectPayload::Map(_) => ObjectKind::Map,
            ObjectPayload::Struct(_) => ObjectKind::Struct,
            ObjectPayload::Tag(_) => ObjectKind::Tag,
            ObjectPayload::Range(_) => ObjectKind::Range,
            ObjectPayload::BigInt(_) => ObjectKind::BigInt,
            ObjectPayload::BigUint(_) => ObjectKind::BigUint,
            ObjectPayload::BigFloat(_) => ObjectKind::BigFloat,
            ObjectPayload::Freed => return None,
        })
    }
}

#[derive(Debug)]
pub struct HeapObject {
    pub ty: TypeId,
    pub kind: ObjectKind,
    pub refcount: u64,
    pub freed: bool,
    /// Monotonic allocation id, for stable diagnostic ordering.
    pub alloc_id: u64,
    pub payload: ObjectPayload,
}

/// Heap counters surfaced through `rt_heap_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub allocs: u64,
    pub frees: u64,
    pub live_blocks: u64,
    pub live_bytes: u64,
    pub rc_incs: u64,
    pub rc_decs: u64,
}

#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
    allocs: u64,
    frees: u64,
    rc_incs: u64,
    rc_decs: u64,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn alloc(&mut self, ty: TypeId, payload: ObjectPayload) -> Handle {
        let kind = payload
            .kind()
            .expect("allocating a freed payload is a runtime bug");
        self.allocs += 1;
        self.objects.push(HeapObject {
            ty,
            kind,
            refcount: 1,
            freed: false,
            alloc_id: self.allocs,
            payload,
        });
        Handle(self.objects.len() as u64)
    }

    fn slot(&self, h: Handle) -> Result<&HeapObject, VmError> {
        if h.is_none() {
            return Err(err(PanicKind::InvalidHandle, "invalid handle 0"));
        }
        self.objects
            .get(h.0 as usize - 1)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid handle {}", h.0)))
    }

    fn slot_mut(&mut self, h: Handle) -> Result<&mut HeapObject, VmError> {
        if h.is_none() {
            return Err(err(PanicKind::InvalidHandle, "invalid handle 0"));
        }
        self.objects
            .get_mut(h.0 as usize - 1)
            .ok_or_else(|| err(PanicKind::InvalidHandle, format!("invalid handle {}", h.0)))
    }

    /// Live-object access; touching a freed object is use-after-free.
    pub fn get(&self, h: Handle) -> Result<&HeapObject, VmError> {
        let obj = self.slot(h)?;
        if obj.freed {
            return Err(err(
                PanicKind::UseAfterFreeHeap,
                format!("use of freed {} (handle {})", obj.kind.name(), h.0),
            ));
        }
        Ok(obj)
    }

    pub fn get_mut(&mut self, h: Handle) -> Result<&mut HeapObject, VmError> {
        let obj = self.slot_mut(h)?;
        if obj.freed {
            return Err(err(
                PanicKind::UseAfterFreeHeap,
                format!("use of freed {} (handle {})", obj.kind.name(), h.0),
            ));
        }
        Ok(obj)
    }

    /// Raw, freed-tolerant access. Diagnostics only.
    pub fn lookup(&self, h: Handle) -> Option<&HeapObject> {
        self.slot(h).ok()
    }

    /// Add a reference to a live object.
    pub fn retain(&mut self, h: Handle) -> Result<(), VmError> {
        let obj = self.slot_mut(h)?;
        if obj.freed {
            return Err(err(
                PanicKind::UseAfterFreeHeap,
                format!("retain of freed {} (handle {})", obj.kind.name(), h.0),
            ));
        }
        obj.refcount += 1;
        self.rc_incs += 1;
        Ok(())
    }

    /// Drop a reference; frees and recursively releases children when the
    /// count reaches zero. Releasing a freed or zero-count object is a
    /// double-free.
    pub fn release(&mut self, h: Handle) -> Result<(), VmError> {
        let mut pending = vec![h];
        while let Some(h) = pending.pop() {
            let freed_now;
            {
                let obj = self.slot_mut(h)?;
                if obj.freed || obj.refcount == 0 {
                    return Err(err(
                        PanicKind::DoubleFree,
                        format!("double free of {} (handle {})", obj.kind.name(), h.0),
                    ));
                }
                obj.refcount -= 1;
                freed_now = obj.refcount == 0;
                if freed_now {
                    let payload = std::mem::replace(&mut obj.payload, ObjectPayload::Freed);
                    obj.freed = true;
                    collect_children(&payload, &mut pending);
                }
            }
            self.rc_decs += 1;
            if freed_now {
                self.frees += 1;
            }
        }
        Ok(())
    }

    /// Retain the handle a value owns, if any.
    pub fn retain_value(&mut self, v: &Value) -> Result<(), VmError> {
        match v.heap_handle() {
            Some(h) => self.retain(h),
            None => Ok(()),
        }
    }

    /// Release the handle a value owns, if any.
    pub fn release_value(&mut self, v: &Value) -> Result<(), VmError> {
        match v.heap_handle() {
            Some(h) => self.release(h),
            None => Ok(()),
        }
    }

    pub fn live_objects(&self) -> impl Iterator<Item = (Handle, &HeapObject)> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, o)| !o.freed)
            .map(|(i, o)| (Handle(i as u64 + 1), o))
    }

    pub fn stats(&self) -> HeapStats {
        let mut live_blocks = 0;
        let mut live_bytes = 0;
        for (_, obj) in self.live_objects() {
            live_blocks += 1;
            live_bytes += payload_bytes(&obj.payload);
        }
        HeapStats {
            allocs: self.allocs,
            frees: self.frees,
            live_blocks,
            live_bytes,
            rc_incs: self.rc_incs,
            rc_decs: self.rc_decs,
        }
    }

    /// Leak report after shutdown: kind counts plus the first few survivors,
    /// stable-sorted by kind then handle. `None` when the heap is clean.
    pub fn leak_message(&self, list_max: usize) -> Option<String> {
        let mut live: Vec<(Handle, &HeapObject)> = self.live_objects().collect();
        if live.is_empty() {
            return None;
        }
        live.sort_by_key(|(h, o)| (o.kind, h.0));
        let mut counts: Vec<(ObjectKind, usize)> = Vec::new();
        for (_, obj) in &live {
            match counts.iter_mut().find(|(k, _)| *k == obj.kind) {
                Some((_, n)) => *n += 1,
                None => counts.push((obj.kind, 1)),
            }
        }
        counts.sort_by_key(|(k, _)| *k);
        let summary = counts
            .iter()
            .map(|(k, n)| format!("{} x{}", k.name(), n))
            .collect::<Vec<_>>()
            .join(", ");
        let listed = live
            .iter()
            .take(list_max)
            .map(|(h, o)| format!("{}#{} rc={}", o.kind.name(), h.0, o.refcount))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            "{} object(s) still alive: {summary} [{listed}]",
            live.len()
        ))
    }
}

/// Push the heap children of a payload that is being freed.
fn collect_children(payload: &ObjectPayload, pending: &mut Vec<Handle>) {
    let mut push_value = |v: &Value, pending: &mut Vec<Handle>| {
        if let Some(h) = v.heap_handle() {
            pending.push(h);
        }
    };
    match payload {
        ObjectPayload::Str(s) => match s.repr {
            StrRepr::Flat(_) => {}
            StrRepr::Concat(a, b) => {
                pending.push(a);
                pending.push(b);
            }
            StrRepr::Slice { base, .. } => pending.push(base),
        },
        ObjectPayload::Array(elems) | ObjectPayload::Struct(elems) => {
            for v in elems {
                push_value(v, pending);
            }
        }
        ObjectPayload::ArraySlice { base, .. } => pending.push(*base),
        ObjectPayload::Map(map) => {
            for entry in &map.entries {
                push_value(&entry.key, pending);
                push_value(&entry.value, pending);
            }
        }
        ObjectPayload::Tag(tag) => {
            for v in &tag.payload {
                push_value(v, pending);
            }
        }
        ObjectPayload::Range(RangePayload::Iter { base, .. }) => pending.push(*base),
        ObjectPayload::Range(RangePayload::Descriptor { start, end, .. }) => {
            if let Some(v) = start {
                push_value(v, pending);
            }
            if let Some(v) = end {
                push_value(v, pending);
            }
        }
        ObjectPayload::BigInt(_)
        | ObjectPayload::BigUint(_)
        | ObjectPayload::BigFloat(_)
        | ObjectPayload::Freed => {}
    }
}

/// Rough resident size of a payload, for the live-bytes counter.
fn payload_bytes(payload: &ObjectPayload) -> u64 {
    let value = std::mem::size_of::<Value>() as u64;
    match payload {
        ObjectPayload::Str(s) => match &s.repr {
            StrRepr::Flat(bytes) => bytes.len() as u64,
            _ => 32,
        },
        ObjectPayload::Array(elems) | ObjectPayload::Struct(elems) => elems.len() as u64 * value,
        ObjectPayload::ArraySlice { .. } => 32,
        ObjectPayload::Map(map) => map.entries.len() as u64 * 2 * value,
        ObjectPayload::Tag(tag) => tag.payload.len() as u64 * value,
        ObjectPayload::Range(_) => 32,
        ObjectPayload::BigInt(v) => (v.bits() / 8 + 1),
        ObjectPayload::BigUint(v) => (v.bits() / 8 + 1),
        ObjectPayload::BigFloat(v) => (v.mantissa.bits() / 8 + 9),
        ObjectPayload::Freed => 0,
    }
}
