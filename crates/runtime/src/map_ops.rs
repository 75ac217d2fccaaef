//! Insertion-ordered maps with canonicalized keys.
//!
//! Entries stay in insertion order; a secondary index maps canonical keys
//! to entry positions. Canonicalization folds every integer representation
//! of the same mathematical value onto one key, so `(i64)5`, `(big-int)5`,
//! and `(big-uint)5` hit the same entry. Inserting over an existing key
//! replaces the value in place (releasing the old one) without reordering.

use crate::error::{PanicKind, VmResult, err};
use crate::heap::{MapEntry, MapPayload, ObjectPayload};
use crate::interp::Vm;
use crate::intrinsics::{CallCtx, expect_args};
use crate::value::{Handle, Location, LocationKind, Value, ValueKind};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use volt_core::{IntClass, TypeKind};

/// Canonical form of a map key. All integer kinds normalize to `Int` when
/// the value fits in an i64, otherwise to `Big`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonKey {
    Unit,
    Bool(bool),
    Int(i64),
    Big(BigInt),
    Str(Vec<u8>),
}

impl Vm {
    /// Canonicalize a key value. Strings flatten; non-hashable kinds are a
    /// type mismatch.
    pub(crate) fn canon_key(&mut self, v: &Value) -> VmResult<CanonKey> {
        match v.kind {
            ValueKind::Unit => Ok(CanonKey::Unit),
            ValueKind::Bool(b) => Ok(CanonKey::Bool(b)),
            ValueKind::Int(n) => {
                let unsigned = matches!(
                    self.types.int_class(v.ty),
                    Some(IntClass::Unsigned(_) | IntClass::BigUnsigned)
                );
                if unsigned {
                    let wide = n as u64;
                    Ok(match i64::try_from(wide) {
                        Ok(narrow) => CanonKey::Int(narrow),
                        Err(_) => CanonKey::Big(BigInt::from(wide)),
                    })
                } else {
                    Ok(CanonKey::Int(n))
                }
            }
            ValueKind::BigInt(h) | ValueKind::BigUint(h) => {
                let big = match &self.heap.get(h)?.payload {
                    ObjectPayload::BigInt(b) => b.clone(),
                    ObjectPayload::BigUint(b) => crate::bignum::biguint_to_bigint(b),
                    _ => return Err(err(PanicKind::TypeMismatch, "corrupt big key").into()),
                };
                Ok(match big.to_i64() {
                    Some(narrow) => CanonKey::Int(narrow),
                    None => CanonKey::Big(big),
                })
            }
            ValueKind::Str(h) => {
                crate::rope::force_flatten(&mut self.heap, h)?;
                Ok(CanonKey::Str(
                    crate::string_ops::flat_bytes(&self.heap, h)?.to_vec(),
                ))
            }
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("{} cannot be a map key", v.kind_name()),
            )
            .into()),
        }
    }

    fn map_payload_mut(&mut self, h: Handle) -> VmResult<&mut MapPayload> {
        match &mut self.heap.get_mut(h)?.payload {
            ObjectPayload::Map(map) => Ok(map),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("handle {} is not a map", h.0),
            )
            .into()),
        }
    }

    pub(crate) fn map_entry_count(&mut self, h: Handle) -> VmResult<u64> {
        Ok(self.map_payload_mut(h)?.entries.len() as u64)
    }

    fn map_find(&mut self, h: Handle, key: &Value) -> VmResult<Option<usize>> {
        let canon = self.canon_key(key)?;
        Ok(self.map_payload_mut(h)?.index.get(&canon).copied())
    }

    /// Insert, consuming key and value. Existing keys keep their position;
    /// the prior value is released, and the fresh key copy too (the entry
    /// keeps its original key).
    pub(crate) fn map_insert_value(&mut self, h: Handle, key: Value, value: Value) -> VmResult<()> {
        let canon = self.canon_key(&key)?;
        let map = self.map_payload_mut(h)?;
        if let Some(&pos) = map.index.get(&canon) {
            let old = std::mem::replace(&mut map.entries[pos].value, value);
            self.heap.release_value(&old)?;
            self.heap.release_value(&key)?;
            return Ok(());
        }
        let pos = map.entries.len();
        map.entries.push(MapEntry { key, value });
        map.index.insert(canon, pos);
        Ok(())
    }

    /// Clone-for-share read; `nothing` for a missing key.
    pub(crate) fn map_get_clone(&mut self, h: Handle, key: &Value) -> VmResult<Value> {
        let value_ty = self.map_value_ty(h);
        match self.map_find(h, key)? {
            Some(pos) => {
                let v = self.map_payload_mut(h)?.entries[pos].value.clone();
                self.heap.retain_value(&v)?;
                self.option_some(v)
            }
            None => self.option_nothing(value_ty),
        }
    }

    /// Remove, returning `Some(value)` with ownership or `nothing`. Later
    /// entries shift down; the index is rebuilt to match.
    pub(crate) fn map_remove_value(&mut self, h: Handle, key: &Value) -> VmResult<Value> {
        let value_ty = self.map_value_ty(h);
        match self.map_find(h, key)? {
            Some(pos) => {
                let (entry, keys) = {
                    let map = self.map_payload_mut(h)?;
                    let entry = map.entries.remove(pos);
                    let keys: Vec<Value> =
                        map.entries.iter().map(|e| e.key.clone()).collect();
                    (entry, keys)
                };
                let canon: Vec<CanonKey> = keys
                    .iter()
                    .map(|k| self.canon_stored(k))
                    .collect::<Result<_, _>>()?;
                let map = self.map_payload_mut(h)?;
                map.index.clear();
                for (i, c) in canon.into_iter().enumerate() {
                    map.index.insert(c, i);
                }
                // Entries own both key and value; the key dies here, the
                // value transfers out.
                self.heap.release_value(&entry.key)?;
                self.option_some(entry.value)
            }
            None => self.option_nothing(value_ty),
        }
    }

    /// Canonical key of an entry already stored in a map. Stored keys were
    /// canonicalized on insert, so strings are already flat; no heap
    /// mutation happens here.
    fn canon_stored(&self, key: &Value) -> Result<CanonKey, crate::error::VmError> {
        match key.kind {
            ValueKind::Unit => Ok(CanonKey::Unit),
            ValueKind::Bool(b) => Ok(CanonKey::Bool(b)),
            ValueKind::Int(n) => {
                let unsigned = matches!(
                    self.types.int_class(key.ty),
                    Some(IntClass::Unsigned(_) | IntClass::BigUnsigned)
                );
                if unsigned {
                    let wide = n as u64;
                    Ok(match i64::try_from(wide) {
                        Ok(narrow) => CanonKey::Int(narrow),
                        Err(_) => CanonKey::Big(BigInt::from(wide)),
                    })
                } else {
                    Ok(CanonKey::Int(n))
                }
            }
            ValueKind::BigInt(h) | ValueKind::BigUint(h) => {
                let big = match &self.heap.get(h)?.payload {
                    ObjectPayload::BigInt(b) => b.clone(),
                    ObjectPayload::BigUint(b) => crate::bignum::biguint_to_bigint(b),
                    _ => return Err(err(PanicKind::TypeMismatch, "corrupt big key")),
                };
                Ok(match big.to_i64() {
                    Some(narrow) => CanonKey::Int(narrow),
                    None => CanonKey::Big(big),
                })
            }
            ValueKind::Str(h) => Ok(CanonKey::Str(
                crate::string_ops::flat_bytes(&self.heap, h)?.to_vec(),
            )),
            _ => Err(err(PanicKind::TypeMismatch, "corrupt map key")),
        }
    }

    fn map_value_ty(&mut self, h: Handle) -> volt_core::TypeId {
        self.heap
            .get(h)
            .ok()
            .and_then(|o| match self.types.kind(o.ty) {
                Some(TypeKind::Map(_, v)) => Some(*v),
                _ => None,
            })
            .unwrap_or_else(|| self.types.unit())
    }
}

fn map_handle(vm: &mut Vm, name: &str, v: &Value) -> VmResult<Handle> {
    match v.kind {
        ValueKind::Map(h) => Ok(h),
        _ => {
            let _ = vm.heap.release_value(v);
            Err(err(
                PanicKind::TypeMismatch,
                format!("{name}: expected map, got {}", v.kind_name()),
            )
            .into())
        }
    }
}

// ---------------------------------------------------------------------------
// Intrinsic handlers
// ---------------------------------------------------------------------------

pub(crate) fn map_new(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    for v in &ctx.args {
        let _ = vm.heap.release_value(v);
    }
    let ty = ctx.type_arg();
    let h = vm.heap.alloc(ty, ObjectPayload::Map(MapPayload::default()));
    Ok(Value::new(ty, ValueKind::Map(h)))
}

pub(crate) fn map_len(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [m] = expect_args::<1>(vm, "len", ctx.args)?;
    let h = map_handle(vm, "len", &m)?;
    let n = vm.map_entry_count(h)?;
    vm.release_owned(m)?;
    Ok(Value::int(n as i64, vm.types.int64()))
}

pub(crate) fn map_contains(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [m, k] = expect_args::<2>(vm, "contains", ctx.args)?;
    let h = map_handle(vm, "contains", &m)?;
    let found = vm.map_find(h, &k)?.is_some();
    vm.release_owned(k)?;
    vm.release_owned(m)?;
    Ok(Value::bool_(found, vm.types.bool_()))
}

/// `Option` of an immutable reference bound to the entry location.
pub(crate) fn map_get_ref(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    map_entry_ref(vm, ctx, false)
}

/// `Option` of a mutable reference bound to the entry location.
pub(crate) fn map_get_mut(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    map_entry_ref(vm, ctx, true)
}

fn map_entry_ref(vm: &mut Vm, ctx: CallCtx, mutable: bool) -> VmResult<Value> {
    let name = if mutable { "get_mut" } else { "get_ref" };
    let [m, k] = expect_args::<2>(vm, name, ctx.args)?;
    let h = map_handle(vm, name, &m)?;
    let found = vm.map_find(h, &k)?;
    vm.release_owned(k)?;
    vm.release_owned(m)?;
    match found {
        Some(pos) => {
            let value_ty = vm.map_value_ty(h);
            let loc = Location::new(
                LocationKind::MapEntry {
                    object: h,
                    entry: pos as u64,
                },
                mutable,
            );
            let (ref_ty, kind) = if mutable {
                (vm.types.ref_mut_of(value_ty), ValueKind::RefMut(loc))
            } else {
                (vm.types.ref_of(value_ty), ValueKind::Ref(loc))
            };
            let r = Value::new(ref_ty, kind);
            vm.option_some(r)
        }
        None => {
            let value_ty = vm.map_value_ty(h);
            let ref_ty = if mutable {
                vm.types.ref_mut_of(value_ty)
            } else {
                vm.types.ref_of(value_ty)
            };
            vm.option_nothing(ref_ty)
        }
    }
}

pub(crate) fn map_insert(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [m, k, v] = expect_args::<3>(vm, "insert", ctx.args)?;
    let h = match map_handle(vm, "insert", &m) {
        Ok(h) => h,
        Err(e) => {
            let _ = vm.heap.release_value(&k);
            let _ = vm.heap.release_value(&v);
            return Err(e);
        }
    };
    vm.map_insert_value(h, k, v)?;
    vm.release_owned(m)?;
    Ok(Value::unit(vm.types.unit()))
}

pub(crate) fn map_remove(vm: &mut Vm, ctx: CallCtx) -> VmResult<Value> {
    let [m, k] = expect_args::<2>(vm, "remove", ctx.args)?;
    let h = map_handle(vm, "remove", &m)?;
    let out = vm.map_remove_value(h, &k)?;
    vm.release_owned(k)?;
    vm.release_owned(m)?;
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

    fn new_map(vm: &mut Vm) -> Handle {
        let int64 = vm.types.int64();
        let ty = vm.types.map_of(int64, int64);
        vm.heap.alloc(ty, ObjectPayload::Map(MapPayload::default()))
    }

    fn unwrap_some(vm: &mut Vm, v: &Value) -> Value {
        let ValueKind::Tag(tag) = v.kind else {
            panic!("expected Option tag");
        };
        let some = vm.types.intern_symbol("Some");
        vm.tag_payload_clone(tag, some, 0).unwrap()
    }

    fn is_nothing(vm: &mut Vm, v: &Value) -> bool {
        let ValueKind::Tag(tag) = v.kind else {
            return false;
        };
        let nothing = vm.types.intern_symbol("nothing");
        vm.tag_variant_of(tag).unwrap() == nothing
    }

    #[test]
    fn test_insert_get_remove() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let h = new_map(&mut vm);
        vm.map_insert_value(h, Value::int(1, int64), Value::int(10, int64))
            .unwrap();
        let got = vm.map_get_clone(h, &Value::int(1, int64)).unwrap();
        assert_eq!(unwrap_some(&mut vm, &got).as_int(), Some(10));
        let removed = vm.map_remove_value(h, &Value::int(1, int64)).unwrap();
        assert_eq!(unwrap_some(&mut vm, &removed).as_int(), Some(10));
        let missing = vm.map_get_clone(h, &Value::int(1, int64)).unwrap();
        assert!(is_nothing(&mut vm, &missing));
    }

    #[test]
    fn test_insert_replaces_and_releases_prior() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let str_ty = vm.types.str_();
        let h = new_map(&mut vm);
        let s1 = crate::rope::flat(&mut vm.heap, str_ty, "old".to_string());
        vm.map_insert_value(
            h,
            Value::int(1, int64),
            Value::new(str_ty, ValueKind::Str(s1)),
        )
        .unwrap();
        let s2 = crate::rope::flat(&mut vm.heap, str_ty, "new".to_string());
        vm.map_insert_value(
            h,
            Value::int(1, int64),
            Value::new(str_ty, ValueKind::Str(s2)),
        )
        .unwrap();
        // the prior value has been released
        assert!(vm.heap.lookup(s1).unwrap().freed);
        assert_eq!(vm.map_entry_count(h).unwrap(), 1);
    }

    #[test]
    fn test_integer_kinds_canonicalize_together() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let big_ty = vm.types.int_big();
        let h = new_map(&mut vm);
        vm.map_insert_value(h, Value::int(5, int64), Value::int(50, int64))
            .unwrap();
        let big_five = vm.alloc_bigint(big_ty, BigInt::from(5));
        let got = vm.map_get_clone(h, &big_five).unwrap();
        assert_eq!(unwrap_some(&mut vm, &got).as_int(), Some(50));
    }

    #[test]
    fn test_insertion_order_survives_replacement() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let h = new_map(&mut vm);
        for k in [3, 1, 2] {
            vm.map_insert_value(h, Value::int(k, int64), Value::int(k * 10, int64))
                .unwrap();
        }
        vm.map_insert_value(h, Value::int(1, int64), Value::int(99, int64))
            .unwrap();
        let keys: Vec<i64> = match &vm.heap.get(h).unwrap().payload {
            ObjectPayload::Map(map) => map
                .entries
                .iter()
                .map(|e| e.key.as_int().unwrap())
                .collect(),
            _ => panic!("expected map"),
        };
        assert_eq!(keys, vec![3, 1, 2]);
    }

    #[test]
    fn test_remove_rebuilds_positions() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let h = new_map(&mut vm);
        for k in [1, 2, 3] {
            vm.map_insert_value(h, Value::int(k, int64), Value::int(k * 10, int64))
                .unwrap();
        }
        let _ = vm.map_remove_value(h, &Value::int(1, int64)).unwrap();
        let got = vm.map_get_clone(h, &Value::int(3, int64)).unwrap();
        assert_eq!(unwrap_some(&mut vm, &got).as_int(), Some(30));
    }

    #[test]
    fn test_unhashable_key_rejected() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let arr_ty = vm.types.array_of(int64);
        let arr = vm.heap.alloc(arr_ty, ObjectPayload::Array(vec![]));
        let key = Value::new(arr_ty, ValueKind::Array(arr));
        assert!(vm.canon_key(&key).is_err());
    }
}
