//! Tagged-union construction and payload access.
//!
//! A tag object carries the variant's stable symbol and the payload values
//! for that variant. Construction is arity-checked against the union's tag
//! layout; payload extraction clones for share (the caller gains a
//! reference). The built-in sums `Option<T>`, `Erring<T>`, and `Outcome<T>`
//! are built through the same path.

use crate::error::{OsCode, PanicKind, VmResult, err};
use crate::heap::{ObjectPayload, TagData};
use crate::interp::Vm;
use crate::value::{Handle, Value, ValueKind};
use volt_core::{Symbol, TypeId};

impl Vm {
    /// The variant symbol a tag object currently holds.
    pub(crate) fn tag_variant_of(&self, h: Handle) -> VmResult<Symbol> {
        match &self.heap.get(h)?.payload {
            ObjectPayload::Tag(tag) => Ok(tag.variant),
            _ => Err(err(
                PanicKind::SwitchTagNonTag,
                format!("handle {} is not a tag", h.0),
            )
            .into()),
        }
    }

    /// Allocate a tag of `union_ty` holding `variant` with `payload`.
    /// Arity-checked against the tag layout; consumes the payload values.
    pub(crate) fn make_tag(
        &mut self,
        union_ty: TypeId,
        variant: Symbol,
        payload: Vec<Value>,
    ) -> VmResult<Value> {
        let arity = match self.types.variant(union_ty, variant) {
            Some(v) => v.payload.len(),
            None => {
                for v in &payload {
                    let _ = self.heap.release_value(v);
                }
                return Err(err(
                    PanicKind::UnknownTagLayout,
                    format!(
                        "{} has no variant `{}`",
                        self.types.display(union_ty),
                        self.types.symbol_name(variant)
                    ),
                )
                .into());
            }
        };
        if payload.len() != arity {
            let got = payload.len();
            for v in &payload {
                let _ = self.heap.release_value(v);
            }
            return Err(err(
                PanicKind::TypeMismatch,
                format!(
                    "variant `{}` takes {arity} value(s), got {got}",
                    self.types.symbol_name(variant)
                ),
            )
            .into());
        }
        let h = self
            .heap
            .alloc(union_ty, ObjectPayload::Tag(TagData { variant, payload }));
        Ok(Value::new(union_ty, ValueKind::Tag(h)))
    }

    /// Clone payload `index` out of a tag that must hold `expected`.
    pub(crate) fn tag_payload_clone(
        &mut self,
        h: Handle,
        expected: Symbol,
        index: u32,
    ) -> VmResult<Value> {
        let v = {
            let obj = self.heap.get(h)?;
            let ObjectPayload::Tag(tag) = &obj.payload else {
                return Err(err(
                    PanicKind::TagPayloadNonTag,
                    format!("handle {} is not a tag", h.0),
                )
                .into());
            };
            if tag.variant != expected
                && self.types.symbol_name(tag.variant) != self.types.symbol_name(expected)
            {
                return Err(err(
                    PanicKind::TagPayloadTagMismatch,
                    format!(
                        "tag holds `{}`, payload of `{}` requested",
                        self.types.symbol_name(tag.variant),
                        self.types.symbol_name(expected)
                    ),
                )
                .into());
            }
            tag.payload
                .get(index as usize)
                .cloned()
                .ok_or_else(|| {
                    err(
                        PanicKind::TagPayloadIndexOutOfRange,
                        format!(
                            "variant `{}` has no payload {index}",
                            self.types.symbol_name(expected)
                        ),
                    )
                })?
        };
        self.heap.retain_value(&v)?;
        Ok(v)
    }

    // ---- built-in sums ----

    pub(crate) fn option_some(&mut self, v: Value) -> VmResult<Value> {
        let union_ty = self.types.option_of(v.ty);
        let sym = self.types.intern_symbol("Some");
        self.make_tag(union_ty, sym, vec![v])
    }

    pub(crate) fn option_nothing(&mut self, elem_ty: TypeId) -> VmResult<Value> {
        let elem = if elem_ty.is_unknown() {
            self.types.unit()
        } else {
            elem_ty
        };
        let union_ty = self.types.option_of(elem);
        let sym = self.types.intern_symbol("nothing");
        self.make_tag(union_ty, sym, Vec::new())
    }

    pub(crate) fn outcome_success(&mut self, v: Value) -> VmResult<Value> {
        let union_ty = self.types.outcome_of(v.ty);
        let sym = self.types.intern_symbol("Success");
        self.make_tag(union_ty, sym, vec![v])
    }

    pub(crate) fn outcome_cancelled(&mut self) -> VmResult<Value> {
        let unit = self.types.unit();
        let union_ty = self.types.outcome_of(unit);
        let sym = self.types.intern_symbol("Cancelled");
        self.make_tag(union_ty, sym, Vec::new())
    }

    pub(crate) fn erring_success_value(&mut self, v: Value) -> VmResult<Value> {
        let union_ty = self.types.erring_of(v.ty);
        let sym = self.types.intern_symbol("Success");
        self.make_tag(union_ty, sym, vec![v])
    }

    /// The `error(OsError { code, message })` arm shared by every fallible
    /// OS-interface intrinsic.
    pub(crate) fn erring_error_value(
        &mut self,
        ok_ty: TypeId,
        code: OsCode,
        message: &str,
    ) -> VmResult<Value> {
        let str_ty = self.types.str_();
        let code_h = crate::rope::flat(&mut self.heap, str_ty, code.as_str().to_string());
        let msg_h = crate::rope::flat(&mut self.heap, str_ty, message.to_string());
        let os_error_ty = self.types.os_error();
        let payload = self.heap.alloc(
            os_error_ty,
            ObjectPayload::Struct(vec![
                Value::new(str_ty, ValueKind::Str(code_h)),
                Value::new(str_ty, ValueKind::Str(msg_h)),
            ]),
        );
        let ok = if ok_ty.is_unknown() {
            self.types.unit()
        } else {
            ok_ty
        };
        let union_ty = self.types.erring_of(ok);
        let sym = self.types.intern_symbol("error");
        self.make_tag(
            union_ty,
            sym,
            vec![Value::new(os_error_ty, ValueKind::Struct(payload))],
        )
    }

    /// Shorthand: `Erring` from a host `io::Result`.
    pub(crate) fn erring_from_io<T>(
        &mut self,
        ok_ty: TypeId,
        result: std::io::Result<T>,
        ok: impl FnOnce(&mut Vm, T) -> VmResult<Value>,
    ) -> VmResult<Value> {
        match result {
            Ok(v) => {
                let v = ok(self, v)?;
                self.erring_success_value(v)
            }
            Err(e) => self.erring_error_value(ok_ty, OsCode::from_io(&e), &e.to_string()),
        }
    }
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

    #[test]
    fn test_construct_and_extract() {
        let mut vm = vm();
        let seven = Value::int(7, vm.types.int64());
        let some = vm.option_some(seven).unwrap();
        let ValueKind::Tag(h) = some.kind else {
            panic!("expected tag");
        };
        let sym = vm.types.intern_symbol("Some");
        assert_eq!(vm.tag_variant_of(h).unwrap(), sym);
        let payload = vm.tag_payload_clone(h, sym, 0).unwrap();
        assert_eq!(payload.as_int(), Some(7));
    }

    #[test]
    fn test_payload_variant_mismatch() {
        let mut vm = vm();
        let nothing = vm.option_nothing(vm.types.int64()).unwrap();
        let ValueKind::Tag(h) = nothing.kind else {
            panic!("expected tag");
        };
        let some = vm.types.intern_symbol("Some");
        let e = vm.tag_payload_clone(h, some, 0).unwrap_err();
        match e {
            crate::error::Unwind::Panic(e) => {
                assert_eq!(e.kind, PanicKind::TagPayloadTagMismatch);
            }
            _ => panic!("expected panic"),
        }
    }

    #[test]
    fn test_payload_index_out_of_range() {
        let mut vm = vm();
        let v = Value::int(1, vm.types.int64());
        let some = vm.option_some(v).unwrap();
        let ValueKind::Tag(h) = some.kind else {
            panic!("expected tag");
        };
        let sym = vm.types.intern_symbol("Some");
        let e = vm.tag_payload_clone(h, sym, 5).unwrap_err();
        match e {
            crate::error::Unwind::Panic(e) => {
                assert_eq!(e.kind, PanicKind::TagPayloadIndexOutOfRange);
            }
            _ => panic!("expected panic"),
        }
    }

    #[test]
    fn test_arity_checked() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let opt = vm.types.option_of(int64);
        let sym = vm.types.intern_symbol("Some");
        let e = vm.make_tag(opt, sym, vec![]).unwrap_err();
        match e {
            crate::error::Unwind::Panic(e) => assert_eq!(e.kind, PanicKind::TypeMismatch),
            _ => panic!("expected panic"),
        }
    }

    #[test]
    fn test_payload_extraction_retains() {
        let mut vm = vm();
        let str_ty = vm.types.str_();
        let s = crate::rope::flat(&mut vm.heap, str_ty, "hi".to_string());
        let some = vm
            .option_some(Value::new(str_ty, ValueKind::Str(s)))
            .unwrap();
        let ValueKind::Tag(h) = some.kind else {
            panic!("expected tag");
        };
        assert_eq!(vm.heap.get(s).unwrap().refcount, 1);
        let sym = vm.types.intern_symbol("Some");
        let _payload = vm.tag_payload_clone(h, sym, 0).unwrap();
        assert_eq!(vm.heap.get(s).unwrap().refcount, 2);
    }

    #[test]
    fn test_erring_error_shape() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let e = vm
            .erring_error_value(int64, OsCode::NotFound, "missing.txt")
            .unwrap();
        let ValueKind::Tag(h) = e.kind else {
            panic!("expected tag");
        };
        let variants = vm.types.tag_layout(e.ty).unwrap();
        assert_eq!(vm.types.symbol_name(variants[0].name), "Success");
        let error_sym = vm.types.intern_symbol("error");
        assert_eq!(vm.tag_variant_of(h).unwrap(), error_sym);
    }
}
