//! Arithmetic, comparison, and numeric conversion.
//!
//! Fixed-width integer operations are checked: overflow panics unless the
//! static type is the arbitrary-precision flavor, in which case the operand
//! promotes to a heap big-integer and the result stays big. Unsigned fixed
//! widths reinterpret the same 64-bit slot storage; signedness comes from
//! the static type. Comparisons require matching operand kinds (numeric
//! kinds of one static class may mix, since arbitrary-precision values live
//! as `Int` until they overflow); everything else is a type mismatch.

use crate::bignum::{self, BigFloat};
use crate::error::{PanicKind, VmResult, err};
use crate::heap::ObjectPayload;
use crate::interp::Vm;
use crate::value::{Value, ValueKind};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::cmp::Ordering;
use volt_core::{BinOp, IntClass, TypeId, TypeKind, UnOp};

impl Vm {
    fn int_class_or_default(&self, ty: TypeId) -> IntClass {
        self.types.int_class(ty).unwrap_or(IntClass::Signed(64))
    }

    /// A numeric operand as a big integer, honoring signedness.
    fn as_bigint(&self, v: &Value) -> VmResult<BigInt> {
        match v.kind {
            ValueKind::Int(n) => Ok(match self.int_class_or_default(v.ty) {
                IntClass::Unsigned(_) | IntClass::BigUnsigned => BigInt::from(n as u64),
                _ => BigInt::from(n),
            }),
            ValueKind::BigInt(h) | ValueKind::BigUint(h) => match &self.heap.get(h)?.payload {
                ObjectPayload::BigInt(b) => Ok(b.clone()),
                ObjectPayload::BigUint(b) => Ok(bignum::biguint_to_bigint(b)),
                _ => Err(err(PanicKind::TypeMismatch, "corrupt big integer").into()),
            },
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("{} is not an integer", v.kind_name()),
            )
            .into()),
        }
    }

    fn big_float_of(&self, v: &Value) -> VmResult<BigFloat> {
        match v.kind {
            ValueKind::BigFloat(h) => match &self.heap.get(h)?.payload {
                ObjectPayload::BigFloat(f) => Ok(f.clone()),
                _ => Err(err(PanicKind::TypeMismatch, "corrupt big float").into()),
            },
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("{} is not a float", v.kind_name()),
            )
            .into()),
        }
    }

    pub(crate) fn alloc_bigint(&mut self, ty: TypeId, v: BigInt) -> Value {
        let h = self.heap.alloc(ty, ObjectPayload::BigInt(v));
        Value::new(ty, ValueKind::BigInt(h))
    }

    pub(crate) fn alloc_biguint(&mut self, ty: TypeId, v: num_bigint::BigUint) -> Value {
        let h = self.heap.alloc(ty, ObjectPayload::BigUint(v));
        Value::new(ty, ValueKind::BigUint(h))
    }

    pub(crate) fn alloc_bigfloat(&mut self, ty: TypeId, v: BigFloat) -> Value {
        let h = self.heap.alloc(ty, ObjectPayload::BigFloat(v));
        Value::new(ty, ValueKind::BigFloat(h))
    }

    pub(crate) fn binary_op(&mut self, op: BinOp, l: Value, r: Value) -> VmResult<Value> {
        let result = self.binary_op_inner(op, &l, &r);
        self.release_owned(l)?;
        self.release_owned(r)?;
        result
    }

    fn binary_op_inner(&mut self, op: BinOp, l: &Value, r: &Value) -> VmResult<Value> {
        use BinOp::*;
        match op {
            Eq | Ne => {
                let equal = self.values_equal(l, r)?;
                Ok(Value::bool_(
                    if op == Eq { equal } else { !equal },
                    self.types.bool_(),
                ))
            }
            Lt | Le | Gt | Ge => {
                let ord = self.numeric_cmp(l, r)?;
                let outcome = match op {
                    Lt => ord == Ordering::Less,
                    Le => ord != Ordering::Greater,
                    Gt => ord == Ordering::Greater,
                    Ge => ord != Ordering::Less,
                    _ => unreachable!(),
                };
                Ok(Value::bool_(outcome, self.types.bool_()))
            }
            And | Or => match (l.kind, r.kind) {
                (ValueKind::Bool(a), ValueKind::Bool(b)) => Ok(Value::bool_(
                    if op == And { a && b } else { a || b },
                    self.types.bool_(),
                )),
                _ => Err(err(
                    PanicKind::TypeMismatch,
                    format!("logical op on {} and {}", l.kind_name(), r.kind_name()),
                )
                .into()),
            },
            Add if matches!(l.kind, ValueKind::Str(_)) => {
                let (ValueKind::Str(a), ValueKind::Str(b)) = (l.kind, r.kind) else {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        format!("cannot add string and {}", r.kind_name()),
                    )
                    .into());
                };
                let inline_max = self.config.string_concat_inline_max;
                let h = crate::rope::concat(&mut self.heap, l.ty, a, b, inline_max)?;
                Ok(Value::new(l.ty, ValueKind::Str(h)))
            }
            Add | Sub | Mul | Div | Rem => self.numeric_binary(op, l, r),
            BitAnd | BitOr | BitXor | Shl | Shr => self.bitwise_binary(op, l, r),
        }
    }

    fn numeric_binary(&mut self, op: BinOp, l: &Value, r: &Value) -> VmResult<Value> {
        // Big-float lane.
        if matches!(l.kind, ValueKind::BigFloat(_)) || matches!(r.kind, ValueKind::BigFloat(_)) {
            let a = self.big_float_of(l)?;
            let b = self.big_float_of(r)?;
            let out = match op {
                BinOp::Add => a.add(&b),
                BinOp::Sub => a.sub(&b),
                BinOp::Mul => a.mul(&b),
                BinOp::Div => a
                    .div(&b)
                    .ok_or_else(|| err(PanicKind::IntOverflow, "division by zero"))?,
                BinOp::Rem => {
                    return Err(err(
                        PanicKind::TypeMismatch,
                        "remainder is not defined on floats",
                    )
                    .into());
                }
                _ => unreachable!(),
            };
            return Ok(self.alloc_bigfloat(l.ty, out));
        }
        let class = self.int_class_or_default(l.ty);
        // Fixed-width lane: both operands inline and the class bounded.
        if let (ValueKind::Int(a), ValueKind::Int(b)) = (l.kind, r.kind) {
            if !class.is_arbitrary() {
                return self.fixed_int_binary(op, a, b, class, l.ty);
            }
            // Arbitrary signed class still inline: try fast i64, promote on
            // overflow. Unsigned goes through the big lane so underflow is
            // caught.
            if class == IntClass::Big {
                if let Some(out) = fixed_i64_fast(op, a, b)? {
                    return Ok(Value::int(out, l.ty));
                }
            }
        }
        // Big lane.
        let a = self.as_bigint(l)?;
        let b = self.as_bigint(r)?;
        let out = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == BigInt::from(0) {
                    return Err(err(PanicKind::IntOverflow, "division by zero").into());
                }
                a / b
            }
            BinOp::Rem => {
                if b == BigInt::from(0) {
                    return Err(err(PanicKind::IntOverflow, "division by zero").into());
                }
                a % b
            }
            _ => unreachable!(),
        };
        if class == IntClass::BigUnsigned {
            let out = bignum::bigint_to_biguint(&out).ok_or_else(|| {
                err(PanicKind::IntOverflow, "unsigned arithmetic went negative")
            })?;
            return Ok(self.alloc_biguint(l.ty, out));
        }
        Ok(self.alloc_bigint(l.ty, out))
    }

    fn fixed_int_binary(
        &mut self,
        op: BinOp,
        a: i64,
        b: i64,
        class: IntClass,
        ty: TypeId,
    ) -> VmResult<Value> {
        let out = match class {
            IntClass::Unsigned(bits) => {
                let (a, b) = (a as u64, b as u64);
                let out = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Div => {
                        if b == 0 {
                            return Err(err(PanicKind::IntOverflow, "division by zero").into());
                        }
                        a.checked_div(b)
                    }
                    BinOp::Rem => {
                        if b == 0 {
                            return Err(err(PanicKind::IntOverflow, "division by zero").into());
                        }
                        a.checked_rem(b)
                    }
                    _ => unreachable!(),
                }
                .filter(|out| bits == 64 || *out <= (1u64 << bits) - 1)
                .ok_or_else(|| overflow_error(op))?;
                out as i64
            }
            _ => {
                let bits = match class {
                    IntClass::Signed(bits) => bits,
                    _ => 64,
                };
                let out = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Div => {
                        if b == 0 {
                            return Err(err(PanicKind::IntOverflow, "division by zero").into());
                        }
                        a.checked_div(b)
                    }
                    BinOp::Rem => {
                        if b == 0 {
                            return Err(err(PanicKind::IntOverflow, "division by zero").into());
                        }
                        a.checked_rem(b)
                    }
                    _ => unreachable!(),
                }
                .filter(|out| fits_signed(*out, bits))
                .ok_or_else(|| overflow_error(op))?;
                out
            }
        };
        Ok(Value::int(out, ty))
    }

    fn bitwise_binary(&mut self, op: BinOp, l: &Value, r: &Value) -> VmResult<Value> {
        let (ValueKind::Int(a), ValueKind::Int(b)) = (l.kind, r.kind) else {
            return Err(err(
                PanicKind::TypeMismatch,
                format!("bitwise op on {} and {}", l.kind_name(), r.kind_name()),
            )
            .into());
        };
        let class = self.int_class_or_default(l.ty);
        let out = match op {
            BinOp::BitAnd => a & b,
            BinOp::BitOr => a | b,
            BinOp::BitXor => a ^ b,
            BinOp::Shl | BinOp::Shr => {
                let bits = match class {
                    IntClass::Signed(bits) | IntClass::Unsigned(bits) => bits,
                    _ => 64,
                };
                if b < 0 || b as u32 >= u32::from(bits) {
                    return Err(err(
                        PanicKind::IntOverflow,
                        format!("shift by {b} out of range for {bits}-bit int"),
                    )
                    .into());
                }
                if op == BinOp::Shl {
                    // Truncate to the declared width so the stored value
                    // stays in range for its static type: mask for unsigned,
                    // sign-extend from the width's sign bit for signed.
                    let shifted = ((a as u64) << b) as i64;
                    match class {
                        IntClass::Unsigned(bits) if bits < 64 => {
                            (shifted as u64 & ((1u64 << bits) - 1)) as i64
                        }
                        IntClass::Signed(bits) if bits < 64 => {
                            let excess = 64 - u32::from(bits);
                            (shifted << excess) >> excess
                        }
                        _ => shifted,
                    }
                } else {
                    match class {
                        IntClass::Unsigned(_) => ((a as u64) >> b) as i64,
                        _ => a >> b,
                    }
                }
            }
            _ => unreachable!(),
        };
        Ok(Value::int(out, l.ty))
    }

    pub(crate) fn unary_op(&mut self, op: UnOp, v: Value) -> VmResult<Value> {
        let result = self.unary_op_inner(op, &v);
        self.release_owned(v)?;
        result
    }

    fn unary_op_inner(&mut self, op: UnOp, v: &Value) -> VmResult<Value> {
        match (op, v.kind) {
            (UnOp::Not, ValueKind::Bool(b)) => Ok(Value::bool_(!b, self.types.bool_())),
            (UnOp::Not, ValueKind::Int(n)) => Ok(Value::int(!n, v.ty)),
            (UnOp::Pos, ValueKind::Int(_)) => Ok(v.clone()),
            (UnOp::Neg, ValueKind::Int(n)) => {
                let class = self.int_class_or_default(v.ty);
                match n.checked_neg().filter(|out| match class {
                    IntClass::Signed(bits) => fits_signed(*out, bits),
                    IntClass::Big => true,
                    // negating a nonzero unsigned value leaves its range
                    _ => n == 0,
                }) {
                    Some(out) => Ok(Value::int(out, v.ty)),
                    None if class.is_arbitrary() => {
                        let big = -self.as_bigint(v)?;
                        Ok(self.alloc_bigint(v.ty, big))
                    }
                    None => Err(err(PanicKind::IntOverflow, "negation overflow").into()),
                }
            }
            (UnOp::Neg, ValueKind::BigInt(_)) => {
                let big = -self.as_bigint(v)?;
                Ok(self.alloc_bigint(v.ty, big))
            }
            (UnOp::Neg, ValueKind::BigFloat(_)) => {
                let f = self.big_float_of(v)?.neg();
                Ok(self.alloc_bigfloat(v.ty, f))
            }
            (UnOp::Pos, ValueKind::BigInt(_) | ValueKind::BigUint(_) | ValueKind::BigFloat(_)) => {
                if let Some(h) = v.heap_handle() {
                    self.heap.retain(h)?;
                }
                Ok(v.clone())
            }
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("unary {op:?} on {}", v.kind_name()),
            )
            .into()),
        }
    }

    /// Equality: strings by content, other heap kinds by handle identity,
    /// numerics of one class by value. Cross-kind comparison is a type
    /// mismatch.
    pub(crate) fn values_equal(&mut self, l: &Value, r: &Value) -> VmResult<bool> {
        match (l.kind, r.kind) {
            (ValueKind::Unit, ValueKind::Unit) => Ok(true),
            (ValueKind::Bool(a), ValueKind::Bool(b)) => Ok(a == b),
            (ValueKind::Func(a), ValueKind::Func(b)) => Ok(a == b),
            (ValueKind::Str(a), ValueKind::Str(b)) => crate::rope::eq(&mut self.heap, a, b),
            (ValueKind::Int(_), ValueKind::Int(_))
            | (ValueKind::Int(_), ValueKind::BigInt(_) | ValueKind::BigUint(_))
            | (ValueKind::BigInt(_) | ValueKind::BigUint(_), ValueKind::Int(_))
            | (
                ValueKind::BigInt(_) | ValueKind::BigUint(_),
                ValueKind::BigInt(_) | ValueKind::BigUint(_),
            ) => Ok(self.as_bigint(l)? == self.as_bigint(r)?),
            (ValueKind::BigFloat(_), ValueKind::BigFloat(_)) => {
                Ok(self.big_float_of(l)?.compare(&self.big_float_of(r)?) == Ordering::Equal)
            }
            (ValueKind::Array(a), ValueKind::Array(b))
            | (ValueKind::Map(a), ValueKind::Map(b))
            | (ValueKind::Struct(a), ValueKind::Struct(b))
            | (ValueKind::Tag(a), ValueKind::Tag(b))
            | (ValueKind::Range(a), ValueKind::Range(b)) => Ok(a == b),
            (ValueKind::Ref(a), ValueKind::Ref(b))
            | (ValueKind::RefMut(a), ValueKind::RefMut(b))
            | (ValueKind::Ptr(a), ValueKind::Ptr(b)) => Ok(a == b),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("cannot compare {} and {}", l.kind_name(), r.kind_name()),
            )
            .into()),
        }
    }

    fn numeric_cmp(&mut self, l: &Value, r: &Value) -> VmResult<Ordering> {
        match (l.kind, r.kind) {
            (ValueKind::Int(a), ValueKind::Int(b)) => {
                // Same slot kind: signedness branches on the static type.
                Ok(match self.int_class_or_default(l.ty) {
                    IntClass::Unsigned(_) | IntClass::BigUnsigned => (a as u64).cmp(&(b as u64)),
                    _ => a.cmp(&b),
                })
            }
            (ValueKind::BigFloat(_), ValueKind::BigFloat(_)) => {
                Ok(self.big_float_of(l)?.compare(&self.big_float_of(r)?))
            }
            (
                ValueKind::Int(_) | ValueKind::BigInt(_) | ValueKind::BigUint(_),
                ValueKind::Int(_) | ValueKind::BigInt(_) | ValueKind::BigUint(_),
            ) => Ok(self.as_bigint(l)?.cmp(&self.as_bigint(r)?)),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("cannot order {} and {}", l.kind_name(), r.kind_name()),
            )
            .into()),
        }
    }

    /// Decimal rendering of any numeric value, honoring signedness.
    pub(crate) fn format_numeric(&mut self, v: &Value) -> VmResult<String> {
        match v.kind {
            ValueKind::Int(n) => Ok(match self.int_class_or_default(v.ty) {
                IntClass::Unsigned(_) | IntClass::BigUnsigned => format!("{}", n as u64),
                _ => format!("{n}"),
            }),
            ValueKind::BigInt(_) | ValueKind::BigUint(_) => Ok(self.as_bigint(v)?.to_string()),
            ValueKind::BigFloat(_) => Ok(self.big_float_of(v)?.format()),
            ValueKind::Bool(b) => Ok(b.to_string()),
            _ => Err(err(
                PanicKind::TypeMismatch,
                format!("{} is not numeric", v.kind_name()),
            )
            .into()),
        }
    }

    /// The universal `__to` conversion. Consumes `v`; panics with
    /// `invalid-numeric-conversion` when the value does not fit the
    /// destination.
    pub(crate) fn convert_to(&mut self, v: Value, dst: TypeId) -> VmResult<Value> {
        if v.ty == dst {
            return Ok(v);
        }
        let result = self.convert_to_inner(&v, dst);
        self.release_owned(v)?;
        result
    }

    fn convert_to_inner(&mut self, v: &Value, dst: TypeId) -> VmResult<Value> {
        let dst_kind = self
            .types
            .kind(dst)
            .ok_or_else(|| err(PanicKind::TypeMismatch, "conversion to incomplete type"))?
            .clone();
        match dst_kind {
            TypeKind::Bool => match v.kind {
                ValueKind::Bool(b) => Ok(Value::bool_(b, dst)),
                ValueKind::Int(n) => Ok(Value::bool_(n != 0, dst)),
                ValueKind::Str(h) => {
                    let text = crate::rope::materialize(&mut self.heap, h)?;
                    match text.as_str() {
                        "true" => Ok(Value::bool_(true, dst)),
                        "false" => Ok(Value::bool_(false, dst)),
                        other => Err(err(
                            PanicKind::InvalidNumericConversion,
                            format!("`{other}` is not a bool"),
                        )
                        .into()),
                    }
                }
                _ => self.conversion_mismatch(v, dst),
            },
            TypeKind::Int(bits) | TypeKind::Uint(bits) => {
                let signed = matches!(dst_kind, TypeKind::Int(_));
                let big = match v.kind {
                    ValueKind::Bool(b) => BigInt::from(b as i64),
                    ValueKind::Str(h) => {
                        let text = crate::rope::materialize(&mut self.heap, h)?;
                        bignum::parse_int(&text).ok_or_else(|| {
                            err(
                                PanicKind::InvalidNumericConversion,
                                format!("`{text}` is not an integer"),
                            )
                        })?
                    }
                    ValueKind::BigFloat(_) => self.big_float_of(v)?.to_int_trunc(),
                    _ => self.as_bigint(v)?,
                };
                let fits = if signed {
                    signed_range_contains(&big, bits)
                } else {
                    unsigned_range_contains(&big, bits)
                };
                if !fits {
                    return Err(err(
                        PanicKind::InvalidNumericConversion,
                        format!("{big} does not fit {}", self.types.display(dst)),
                    )
                    .into());
                }
                let bits64 = if signed {
                    big.to_i64().expect("range checked")
                } else {
                    big.to_u64().expect("range checked") as i64
                };
                Ok(Value::int(bits64, dst))
            }
            TypeKind::IntBig => {
                let big = match v.kind {
                    ValueKind::BigFloat(_) => self.big_float_of(v)?.to_int_trunc(),
                    ValueKind::Str(h) => {
                        let text = crate::rope::materialize(&mut self.heap, h)?;
                        bignum::parse_int(&text).ok_or_else(|| {
                            err(
                                PanicKind::InvalidNumericConversion,
                                format!("`{text}` is not an integer"),
                            )
                        })?
                    }
                    ValueKind::Bool(b) => BigInt::from(b as i64),
                    _ => self.as_bigint(v)?,
                };
                Ok(self.alloc_bigint(dst, big))
            }
            TypeKind::UintBig => {
                let big = match v.kind {
                    ValueKind::BigFloat(_) => self.big_float_of(v)?.to_int_trunc(),
                    ValueKind::Str(h) => {
                        let text = crate::rope::materialize(&mut self.heap, h)?;
                        bignum::parse_int(&text).ok_or_else(|| {
                            err(
                                PanicKind::InvalidNumericConversion,
                                format!("`{text}` is not an integer"),
                            )
                        })?
                    }
                    _ => self.as_bigint(v)?,
                };
                let out = bignum::bigint_to_biguint(&big).ok_or_else(|| {
                    err(
                        PanicKind::InvalidNumericConversion,
                        format!("{big} is negative"),
                    )
                })?;
                Ok(self.alloc_biguint(dst, out))
            }
            TypeKind::FloatBig => {
                let out = match v.kind {
                    ValueKind::BigFloat(_) => self.big_float_of(v)?,
                    ValueKind::Str(h) => {
                        let text = crate::rope::materialize(&mut self.heap, h)?;
                        BigFloat::parse(&text).ok_or_else(|| {
                            err(
                                PanicKind::InvalidNumericConversion,
                                format!("`{text}` is not a number"),
                            )
                        })?
                    }
                    _ => BigFloat::from_int(&self.as_bigint(v)?),
                };
                Ok(self.alloc_bigfloat(dst, out))
            }
            TypeKind::Str => {
                let text = match v.kind {
                    ValueKind::Str(h) => {
                        self.heap.retain(h)?;
                        return Ok(Value::new(dst, ValueKind::Str(h)));
                    }
                    ValueKind::Unit => "()".to_string(),
                    _ => self.format_numeric(v)?,
                };
                let h = crate::rope::flat(&mut self.heap, dst, text);
                Ok(Value::new(dst, ValueKind::Str(h)))
            }
            _ => self.conversion_mismatch(v, dst),
        }
    }

    /// Recoverable parse used by `from_str`: `None` on malformed input
    /// instead of a conversion panic.
    pub(crate) fn parse_text_as(&mut self, text: &str, dst: TypeId) -> VmResult<Option<Value>> {
        let Some(kind) = self.types.kind(dst).cloned() else {
            return Ok(None);
        };
        Ok(match kind {
            TypeKind::Bool => match text.trim() {
                "true" => Some(Value::bool_(true, dst)),
                "false" => Some(Value::bool_(false, dst)),
                _ => None,
            },
            TypeKind::Int(bits) => text
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|v| fits_signed(*v, bits))
                .map(|v| Value::int(v, dst)),
            TypeKind::Uint(bits) => text
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|v| bits >= 64 || *v <= (1u64 << bits) - 1)
                .map(|v| Value::int(v as i64, dst)),
            TypeKind::IntBig => bignum::parse_int(text).map(|v| self.alloc_bigint(dst, v)),
            TypeKind::UintBig => bignum::parse_uint(text).map(|v| self.alloc_biguint(dst, v)),
            TypeKind::FloatBig => BigFloat::parse(text).map(|v| self.alloc_bigfloat(dst, v)),
            TypeKind::Str => {
                let ty = dst;
                let h = crate::rope::flat(&mut self.heap, ty, text.to_string());
                Some(Value::new(ty, crate::value::ValueKind::Str(h)))
            }
            _ => None,
        })
    }

    fn conversion_mismatch(&self, v: &Value, dst: TypeId) -> VmResult<Value> {
        Err(err(
            PanicKind::InvalidNumericConversion,
            format!(
                "cannot convert {} to {}",
                v.kind_name(),
                self.types.display(dst)
            ),
        )
        .into())
    }
}

/// Fast i64 path for arbitrary-precision static types: `None` means
/// "promote".
fn fixed_i64_fast(op: BinOp, a: i64, b: i64) -> VmResult<Option<i64>> {
    Ok(match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(err(PanicKind::IntOverflow, "division by zero").into());
            }
            a.checked_div(b)
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(err(PanicKind::IntOverflow, "division by zero").into());
            }
            a.checked_rem(b)
        }
        _ => None,
    })
}

fn fits_signed(v: i64, bits: u8) -> bool {
    if bits >= 64 {
        return true;
    }
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    v >= min && v <= max
}

fn signed_range_contains(v: &BigInt, bits: u8) -> bool {
    match v.to_i64() {
        Some(v) => fits_signed(v, bits),
        None => false,
    }
}

fn unsigned_range_contains(v: &BigInt, bits: u8) -> bool {
    match v.to_u64() {
        Some(v) => bits >= 64 || v <= (1u64 << bits) - 1,
        None => false,
    }
}

fn overflow_error(op: BinOp) -> crate::error::VmError {
    err(
        PanicKind::IntOverflow,
        format!("{} overflow", match op {
            BinOp::Add => "addition",
            BinOp::Sub => "subtraction",
            BinOp::Mul => "multiplication",
            BinOp::Div => "division",
            BinOp::Rem => "remainder",
            _ => "arithmetic",
        }),
    )
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

    fn kind_of(e: crate::error::Unwind) -> PanicKind {
        match e {
            crate::error::Unwind::Panic(e) => e.kind,
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[test]
    fn test_checked_add_panics_at_i64_bounds() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let e = vm
            .binary_op(
                BinOp::Add,
                Value::int(i64::MAX, int64),
                Value::int(1, int64),
            )
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }

    #[test]
    fn test_narrow_width_range_checked() {
        let mut vm = vm();
        let i8_ = vm.types.int_of_width(8, true);
        let ok = vm
            .binary_op(BinOp::Add, Value::int(100, i8_), Value::int(27, i8_))
            .unwrap();
        assert_eq!(ok.as_int(), Some(127));
        let e = vm
            .binary_op(BinOp::Add, Value::int(100, i8_), Value::int(28, i8_))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }

    #[test]
    fn test_unsigned_uses_bit_pattern() {
        let mut vm = vm();
        let u64_ = vm.types.uint64();
        // -1 as a u64 bit pattern is u64::MAX; it compares above 1
        let gt = vm
            .binary_op(BinOp::Gt, Value::int(-1, u64_), Value::int(1, u64_))
            .unwrap();
        assert_eq!(gt.as_bool(), Some(true));
        let e = vm
            .binary_op(BinOp::Sub, Value::int(0, u64_), Value::int(1, u64_))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }

    #[test]
    fn test_arbitrary_class_promotes() {
        let mut vm = vm();
        let big = vm.types.int_big();
        let out = vm
            .binary_op(BinOp::Mul, Value::int(i64::MAX, big), Value::int(2, big))
            .unwrap();
        assert!(matches!(out.kind, ValueKind::BigInt(_)));
        assert_eq!(
            vm.format_numeric(&out).unwrap(),
            "18446744073709551614"
        );
    }

    #[test]
    fn test_division_by_zero() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let e = vm
            .binary_op(BinOp::Div, Value::int(1, int64), Value::int(0, int64))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }

    #[test]
    fn test_cross_kind_comparison_rejected() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let bool_ = vm.types.bool_();
        let e = vm
            .binary_op(BinOp::Eq, Value::int(1, int64), Value::bool_(true, bool_))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::TypeMismatch);
    }

    #[test]
    fn test_string_equality_is_content() {
        let mut vm = vm();
        let str_ty = vm.types.str_();
        let a = crate::rope::flat(&mut vm.heap, str_ty, "same".to_string());
        let b = crate::rope::flat(&mut vm.heap, str_ty, "same".to_string());
        let eq = vm
            .binary_op(
                BinOp::Eq,
                Value::new(str_ty, ValueKind::Str(a)),
                Value::new(str_ty, ValueKind::Str(b)),
            )
            .unwrap();
        assert_eq!(eq.as_bool(), Some(true));
    }

    #[test]
    fn test_to_conversion_matrix() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let i8_ = vm.types.int_of_width(8, true);
        let str_ty = vm.types.str_();
        let bool_ = vm.types.bool_();
        let float = vm.types.float_big();

        // int -> string
        let s = vm.convert_to(Value::int(-5, int64), str_ty).unwrap();
        let ValueKind::Str(h) = s.kind else { panic!() };
        assert_eq!(crate::rope::materialize(&mut vm.heap, h).unwrap(), "-5");

        // string -> int
        let txt = crate::rope::flat(&mut vm.heap, str_ty, "42".to_string());
        let n = vm
            .convert_to(Value::new(str_ty, ValueKind::Str(txt)), int64)
            .unwrap();
        assert_eq!(n.as_int(), Some(42));

        // narrowing is checked
        let e = vm.convert_to(Value::int(1000, int64), i8_).unwrap_err();
        assert_eq!(kind_of(e), PanicKind::InvalidNumericConversion);

        // bool -> int and back
        let one = vm
            .convert_to(Value::bool_(true, bool_), int64)
            .unwrap();
        assert_eq!(one.as_int(), Some(1));
        let t = vm.convert_to(Value::int(2, int64), bool_).unwrap();
        assert_eq!(t.as_bool(), Some(true));

        // float truncates toward zero on the way to int
        let f = crate::bignum::BigFloat::parse("-3.9").unwrap();
        let fv = vm.alloc_bigfloat(float, f);
        let n = vm.convert_to(fv, int64).unwrap();
        assert_eq!(n.as_int(), Some(-3));
    }

    #[test]
    fn test_parse_text_as_is_recoverable() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        assert!(vm.parse_text_as("17", int64).unwrap().is_some());
        assert!(vm.parse_text_as("not a number", int64).unwrap().is_none());
        let bool_ = vm.types.bool_();
        assert!(vm.parse_text_as("true", bool_).unwrap().is_some());
        assert!(vm.parse_text_as("yes", bool_).unwrap().is_none());
    }

    #[test]
    fn test_shift_range_checked() {
        let mut vm = vm();
        let int64 = vm.types.int64();
        let ok = vm
            .binary_op(BinOp::Shl, Value::int(1, int64), Value::int(8, int64))
            .unwrap();
        assert_eq!(ok.as_int(), Some(256));
        let e = vm
            .binary_op(BinOp::Shl, Value::int(1, int64), Value::int(64, int64))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }

    #[test]
    fn test_narrow_shift_wraps_to_declared_width() {
        let mut vm = vm();
        let i8_ = vm.types.int_of_width(8, true);
        let u8_ = vm.types.int_of_width(8, false);
        // shifting into the sign bit wraps to the 8-bit two's-complement
        // pattern, keeping the stored value in range for its static type
        let signed = vm
            .binary_op(BinOp::Shl, Value::int(1, i8_), Value::int(7, i8_))
            .unwrap();
        assert_eq!(signed.as_int(), Some(-128));
        let unsigned = vm
            .binary_op(BinOp::Shl, Value::int(1, u8_), Value::int(7, u8_))
            .unwrap();
        assert_eq!(unsigned.as_int(), Some(128));
        // bits shifted past the width drop entirely
        let dropped = vm
            .binary_op(BinOp::Shl, Value::int(0b0110_0000, i8_), Value::int(2, i8_))
            .unwrap();
        assert_eq!(dropped.as_int(), Some(-128));
        // a shift amount at the width is out of range, same as 64-bit
        let e = vm
            .binary_op(BinOp::Shl, Value::int(1, i8_), Value::int(8, i8_))
            .unwrap_err();
        assert_eq!(kind_of(e), PanicKind::IntOverflow);
    }
}
