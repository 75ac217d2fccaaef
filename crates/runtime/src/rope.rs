//! String rope: flat, concat, and slice nodes with lazy materialization.
//!
//! Ingress is strict: host bytes must be valid UTF-8 and UTF-16 code units
//! must pair correctly; both are normalized to NFC before the flat node is
//! allocated. Short concatenations materialize immediately; longer ones
//! build a concat node retaining both children. Byte and code-point lengths
//! are cached on first computation, and any operation that needs raw bytes
//! flattens the rope at most once per object.

use crate::error::{PanicKind, VmError, VmResult, err};
use crate::heap::{Heap, ObjectPayload, StrPayload, StrRepr};
use crate::value::Handle;
use unicode_normalization::UnicodeNormalization;
use volt_core::TypeId;

/// Shape snapshot used to recurse without holding a heap borrow.
enum Shape {
    Flat,
    Concat(Handle, Handle),
    Slice { base: Handle, start: u64, len: u64 },
}

fn shape(heap: &Heap, h: Handle) -> Result<Shape, VmError> {
    match &heap.get(h)?.payload {
        ObjectPayload::Str(s) => Ok(match s.repr {
            StrRepr::Flat(_) => Shape::Flat,
            StrRepr::Concat(a, b) => Shape::Concat(a, b),
            StrRepr::Slice { base, start, len } => Shape::Slice { base, start, len },
        }),
        _ => Err(err(
            PanicKind::TypeMismatch,
            format!("handle {} is not a string", h.0),
        )),
    }
}

fn payload(heap: &Heap, h: Handle) -> Result<&StrPayload, VmError> {
    match &heap.get(h)?.payload {
        ObjectPayload::Str(s) => Ok(s),
        _ => Err(err(
            PanicKind::TypeMismatch,
            format!("handle {} is not a string", h.0),
        )),
    }
}

fn payload_mut(heap: &mut Heap, h: Handle) -> Result<&mut StrPayload, VmError> {
    match &mut heap.get_mut(h)?.payload {
        ObjectPayload::Str(s) => Ok(s),
        _ => Err(err(
            PanicKind::TypeMismatch,
            format!("handle {} is not a string", h.0),
        )),
    }
}

/// Allocate a flat node from already-normalized text.
pub fn flat(heap: &mut Heap, ty: TypeId, text: String) -> Handle {
    let cp = text.chars().count() as u64;
    let mut p = StrPayload::flat(text.into_bytes());
    p.cp_len = Some(cp);
    heap.alloc(ty, ObjectPayload::Str(p))
}

/// Ingress from host bytes: strict UTF-8 validation, NFC normalization.
pub fn from_bytes(heap: &mut Heap, ty: TypeId, bytes: &[u8]) -> Result<Handle, VmError> {
    let text = std::str::from_utf8(bytes).map_err(|e| {
        err(
            PanicKind::InvalidNumericConversion,
            format!("invalid UTF-8 at byte {}", e.valid_up_to()),
        )
    })?;
    Ok(flat(heap, ty, text.nfc().collect()))
}

/// Ingress from UTF-16 code units: strict surrogate validation, NFC.
pub fn from_utf16(heap: &mut Heap, ty: TypeId, units: &[u16]) -> Result<Handle, VmError> {
    let text: String = char::decode_utf16(units.iter().copied())
        .collect::<Result<String, _>>()
        .map_err(|e| {
            err(
                PanicKind::InvalidNumericConversion,
                format!("unpaired surrogate 0x{:04x}", e.unpaired_surrogate()),
            )
        })?;
    Ok(flat(heap, ty, text.nfc().collect()))
}

/// Byte length, cached per node.
pub fn byte_len(heap: &mut Heap, h: Handle) -> VmResult<u64> {
    if let Some(n) = payload(heap, h)?.byte_len {
        return Ok(n);
    }
    let n = match shape(heap, h)? {
        Shape::Flat => match &payload(heap, h)?.repr {
            StrRepr::Flat(bytes) => bytes.len() as u64,
            _ => unreachable!(),
        },
        Shape::Concat(a, b) => byte_len(heap, a)?
            .checked_add(byte_len(heap, b)?)
            .ok_or_else(|| err(PanicKind::IntOverflow, "string length overflow"))?,
        Shape::Slice { base, start, len } => range_byte_len(heap, base, start, start + len)?,
    };
    payload_mut(heap, h)?.byte_len = Some(n);
    Ok(n)
}

/// Code-point length, cached per node.
pub fn cp_len(heap: &mut Heap, h: Handle) -> VmResult<u64> {
    if let Some(n) = payload(heap, h)?.cp_len {
        return Ok(n);
    }
    let n = match shape(heap, h)? {
        Shape::Flat => match &payload(heap, h)?.repr {
            StrRepr::Flat(bytes) => count_chars(bytes) as u64,
            _ => unreachable!(),
        },
        Shape::Concat(a, b) => cp_len(heap, a)? + cp_len(heap, b)?,
        Shape::Slice { len, .. } => len,
    };
    payload_mut(heap, h)?.cp_len = Some(n);
    Ok(n)
}

fn count_chars(bytes: &[u8]) -> usize {
    // Flat nodes hold valid UTF-8 by construction.
    std::str::from_utf8(bytes)
        .map(|s| s.chars().count())
        .unwrap_or(0)
}

/// Code point at index `i`, descending only into the relevant child.
pub fn char_at(heap: &mut Heap, h: Handle, i: u64) -> VmResult<char> {
    match shape(heap, h)? {
        Shape::Flat => {
            let p = payload(heap, h)?;
            let StrRepr::Flat(bytes) = &p.repr else {
                unreachable!()
            };
            std::str::from_utf8(bytes)
                .ok()
                .and_then(|s| s.chars().nth(i as usize))
                .ok_or_else(|| {
                    err(
                        PanicKind::OutOfBounds,
                        format!("string index {i} out of bounds"),
                    )
                    .into()
                })
        }
        Shape::Concat(a, b) => {
            let left = cp_len(heap, a)?;
            if i < left {
                char_at(heap, a, i)
            } else {
                char_at(heap, b, i - left)
            }
        }
        Shape::Slice { base, start, len } => {
            if i >= len {
                return Err(err(
                    PanicKind::OutOfBounds,
                    format!("string index {i} out of bounds"),
                )
                .into());
            }
            char_at(heap, base, start + i)
        }
    }
}

/// Append the code-point range `[start, end)` of `h` to `out` without
/// materializing intermediate nodes.
pub fn append_range(heap: &mut Heap, h: Handle, start: u64, end: u64, out: &mut Vec<u8>) -> VmResult<()> {
    if start >= end {
        return Ok(());
    }
    match shape(heap, h)? {
        Shape::Flat => {
            let p = payload(heap, h)?;
            let StrRepr::Flat(bytes) = &p.repr else {
                unreachable!()
            };
            let s = std::str::from_utf8(bytes).unwrap_or("");
            out.extend(
                s.chars()
                    .skip(start as usize)
                    .take((end - start) as usize)
                    .flat_map(|c| {
                        let mut buf = [0u8; 4];
                        c.encode_utf8(&mut buf).as_bytes().to_vec()
                    }),
            );
            Ok(())
        }
        Shape::Concat(a, b) => {
            let left = cp_len(heap, a)?;
            if start < left {
                append_range(heap, a, start, end.min(left), out)?;
            }
            if end > left {
                append_range(heap, b, start.saturating_sub(left), end - left, out)?;
            }
            Ok(())
        }
        Shape::Slice {
            base,
            start: s,
            len,
        } => append_range(heap, base, s + start, s + end.min(len), out),
    }
}

/// Byte length of the code-point range `[start, end)` of `h`.
fn range_byte_len(heap: &mut Heap, h: Handle, start: u64, end: u64) -> VmResult<u64> {
    if start >= end {
        return Ok(0);
    }
    match shape(heap, h)? {
        Shape::Flat => {
            let p = payload(heap, h)?;
            let StrRepr::Flat(bytes) = &p.repr else {
                unreachable!()
            };
            let s = std::str::from_utf8(bytes).unwrap_or("");
            Ok(s.chars()
                .skip(start as usize)
                .take((end - start) as usize)
                .map(|c| c.len_utf8() as u64)
                .sum())
        }
        Shape::Concat(a, b) => {
            let left = cp_len(heap, a)?;
            let mut n = 0;
            if start < left {
                n += range_byte_len(heap, a, start, end.min(left))?;
            }
            if end > left {
                n += range_byte_len(heap, b, start.saturating_sub(left), end - left)?;
            }
            Ok(n)
        }
        Shape::Slice {
            base,
            start: s,
            len,
        } => range_byte_len(heap, base, s + start, s + end.min(len)),
    }
}

/// Rewrite `h` to a flat node in place, releasing any children. Idempotent
/// on flat nodes.
pub fn force_flatten(heap: &mut Heap, h: Handle) -> VmResult<()> {
    if matches!(shape(heap, h)?, Shape::Flat) {
        return Ok(());
    }
    let total = cp_len(heap, h)?;
    let mut bytes = Vec::new();
    append_range(heap, h, 0, total, &mut bytes)?;
    let byte_len = bytes.len() as u64;
    let old = std::mem::replace(
        &mut payload_mut(heap, h)?.repr,
        StrRepr::Flat(bytes),
    );
    {
        let p = payload_mut(heap, h)?;
        p.byte_len = Some(byte_len);
        p.cp_len = Some(total);
    }
    match old {
        StrRepr::Flat(_) => {}
        StrRepr::Concat(a, b) => {
            heap.release(a)?;
            heap.release(b)?;
        }
        StrRepr::Slice { base, .. } => heap.release(base)?,
    }
    Ok(())
}

/// Flatten and copy out the full text.
pub fn materialize(heap: &mut Heap, h: Handle) -> VmResult<String> {
    force_flatten(heap, h)?;
    let p = payload(heap, h)?;
    let StrRepr::Flat(bytes) = &p.repr else {
        unreachable!()
    };
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Concatenate. Totals at or below `inline_max` bytes materialize a new
/// flat node; larger results get a concat node retaining both children.
pub fn concat(heap: &mut Heap, ty: TypeId, a: Handle, b: Handle, inline_max: u64) -> VmResult<Handle> {
    let len_a = byte_len(heap, a)?;
    let len_b = byte_len(heap, b)?;
    let total = len_a
        .checked_add(len_b)
        .ok_or_else(|| err(PanicKind::IntOverflow, "string length overflow"))?;
    let cp_total = cp_len(heap, a)? + cp_len(heap, b)?;
    if total <= inline_max {
        let mut bytes = Vec::with_capacity(total as usize);
        let cp_a = cp_len(heap, a)?;
        append_range(heap, a, 0, cp_a, &mut bytes)?;
        let cp_b = cp_len(heap, b)?;
        append_range(heap, b, 0, cp_b, &mut bytes)?;
        let mut p = StrPayload::flat(bytes);
        p.cp_len = Some(cp_total);
        return Ok(heap.alloc(ty, ObjectPayload::Str(p)));
    }
    heap.retain(a)?;
    heap.retain(b)?;
    Ok(heap.alloc(
        ty,
        ObjectPayload::Str(StrPayload {
            repr: StrRepr::Concat(a, b),
            byte_len: Some(total),
            cp_len: Some(cp_total),
        }),
    ))
}

/// Slice `[start, start+len)` in code points. Slices of slices re-anchor on
/// the underlying base so chains stay one level deep.
pub fn slice(heap: &mut Heap, ty: TypeId, base: Handle, start: u64, len: u64) -> VmResult<Handle> {
    let total = cp_len(heap, base)?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| err(PanicKind::IntOverflow, "slice bounds overflow"))?;
    if end > total {
        return Err(err(
            PanicKind::OutOfBounds,
            format!("slice {start}..{end} of string with {total} code points"),
        )
        .into());
    }
    let (target, offset) = match shape(heap, base)? {
        Shape::Slice {
            base: inner,
            start: inner_start,
            ..
        } => (inner, inner_start + start),
        _ => (base, start),
    };
    heap.retain(target)?;
    Ok(heap.alloc(
        ty,
        ObjectPayload::Str(StrPayload {
            repr: StrRepr::Slice {
                base: target,
                start: offset,
                len,
            },
            byte_len: None,
            cp_len: Some(len),
        }),
    ))
}

/// Content equality; forces both sides flat at most once each.
pub fn eq(heap: &mut Heap, a: Handle, b: Handle) -> VmResult<bool> {
    if a == b {
        return Ok(true);
    }
    force_flatten(heap, a)?;
    force_flatten(heap, b)?;
    let pa = payload(heap, a)?;
    let pb = payload(heap, b)?;
    match (&pa.repr, &pb.repr) {
        (StrRepr::Flat(ba), StrRepr::Flat(bb)) => Ok(ba == bb),
        _ => unreachable!("both flattened above"),
    }
}

/// Repeat `h` `count` times. The empty string stays empty for any count.
pub fn repeat(heap: &mut Heap, ty: TypeId, h: Handle, count: u64) -> VmResult<Handle> {
    let total = cp_len(heap, h)?;
    if total == 0 || count == 0 {
        return Ok(flat(heap, ty, String::new()));
    }
    let mut bytes = Vec::new();
    for _ in 0..count {
        append_range(heap, h, 0, total, &mut bytes)?;
    }
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok(flat(heap, ty, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty() -> TypeId {
        TypeId(7)
    }

    #[test]
    fn test_flat_lengths() {
        let mut heap = Heap::new();
        let h = flat(&mut heap, ty(), "héllo".to_string());
        assert_eq!(byte_len(&mut heap, h).unwrap(), 6);
        assert_eq!(cp_len(&mut heap, h).unwrap(), 5);
    }

    #[test]
    fn test_from_bytes_rejects_invalid_utf8() {
        let mut heap = Heap::new();
        assert!(from_bytes(&mut heap, ty(), &[0xff, 0xfe]).is_err());
        let h = from_bytes(&mut heap, ty(), "ok".as_bytes()).unwrap();
        assert_eq!(materialize(&mut heap, h).unwrap(), "ok");
    }

    #[test]
    fn test_ingress_normalizes_nfc() {
        let mut heap = Heap::new();
        // "e" + combining acute accent normalizes to a single code point
        let decomposed = "e\u{0301}";
        let h = from_bytes(&mut heap, ty(), decomposed.as_bytes()).unwrap();
        assert_eq!(cp_len(&mut heap, h).unwrap(), 1);
        assert_eq!(materialize(&mut heap, h).unwrap(), "\u{00e9}");
    }

    #[test]
    fn test_utf16_matches_utf8() {
        let mut heap = Heap::new();
        let text = "grüß 😊";
        let units: Vec<u16> = text.encode_utf16().collect();
        let a = from_utf16(&mut heap, ty(), &units).unwrap();
        let b = from_bytes(&mut heap, ty(), text.as_bytes()).unwrap();
        assert!(eq(&mut heap, a, b).unwrap());
    }

    #[test]
    fn test_utf16_rejects_unpaired_surrogate() {
        let mut heap = Heap::new();
        assert!(from_utf16(&mut heap, ty(), &[0xd800]).is_err());
    }

    #[test]
    fn test_small_concat_materializes_flat() {
        let mut heap = Heap::new();
        let a = flat(&mut heap, ty(), "ab".to_string());
        let b = flat(&mut heap, ty(), "cd".to_string());
        let c = concat(&mut heap, ty(), a, b, 128).unwrap();
        match &heap.get(c).unwrap().payload {
            ObjectPayload::Str(s) => assert!(matches!(s.repr, StrRepr::Flat(_))),
            _ => panic!("expected string"),
        }
        // children not retained by a flat result
        assert_eq!(heap.get(a).unwrap().refcount, 1);
        assert_eq!(materialize(&mut heap, c).unwrap(), "abcd");
    }

    #[test]
    fn test_large_concat_builds_node_and_retains() {
        let mut heap = Heap::new();
        let a = flat(&mut heap, ty(), "x".repeat(100));
        let b = flat(&mut heap, ty(), "y".repeat(100));
        let c = concat(&mut heap, ty(), a, b, 128).unwrap();
        assert_eq!(heap.get(a).unwrap().refcount, 2);
        assert_eq!(heap.get(b).unwrap().refcount, 2);
        assert_eq!(byte_len(&mut heap, c).unwrap(), 200);
        assert_eq!(char_at(&mut heap, c, 150).unwrap(), 'y');
        // flatten releases the children back to one reference
        force_flatten(&mut heap, c).unwrap();
        assert_eq!(heap.get(a).unwrap().refcount, 1);
        assert_eq!(byte_len(&mut heap, c).unwrap(), 200);
    }

    #[test]
    fn test_flatten_idempotent_on_flat() {
        let mut heap = Heap::new();
        let h = flat(&mut heap, ty(), "abc".to_string());
        force_flatten(&mut heap, h).unwrap();
        force_flatten(&mut heap, h).unwrap();
        assert_eq!(byte_len(&mut heap, h).unwrap(), 3);
    }

    #[test]
    fn test_slice_lengths_and_chars() {
        let mut heap = Heap::new();
        let base = flat(&mut heap, ty(), "héllo wörld".to_string());
        let s = slice(&mut heap, ty(), base, 6, 5).unwrap();
        assert_eq!(cp_len(&mut heap, s).unwrap(), 5);
        assert_eq!(byte_len(&mut heap, s).unwrap(), 6); // "wörld"
        assert_eq!(char_at(&mut heap, s, 1).unwrap(), 'ö');
        assert_eq!(materialize(&mut heap, s).unwrap(), "wörld");
    }

    #[test]
    fn test_slice_of_slice_reanchors() {
        let mut heap = Heap::new();
        let base = flat(&mut heap, ty(), "abcdefgh".to_string());
        let s1 = slice(&mut heap, ty(), base, 2, 5).unwrap(); // cdefg
        let s2 = slice(&mut heap, ty(), s1, 1, 3).unwrap(); // def
        match &heap.get(s2).unwrap().payload {
            ObjectPayload::Str(StrPayload {
                repr: StrRepr::Slice { base: b, start, len },
                ..
            }) => {
                assert_eq!(*b, base);
                assert_eq!((*start, *len), (3, 3));
            }
            _ => panic!("expected slice node"),
        }
        assert_eq!(materialize(&mut heap, s2).unwrap(), "def");
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let mut heap = Heap::new();
        let base = flat(&mut heap, ty(), "abc".to_string());
        assert!(slice(&mut heap, ty(), base, 1, 3).is_err());
    }

    #[test]
    fn test_eq_across_shapes() {
        let mut heap = Heap::new();
        let a = flat(&mut heap, ty(), "x".repeat(100));
        let b = flat(&mut heap, ty(), "y".repeat(100));
        let long = concat(&mut heap, ty(), a, b, 128).unwrap();
        let mut text = "x".repeat(100);
        text.push_str(&"y".repeat(100));
        let flat_copy = flat(&mut heap, ty(), text);
        assert!(eq(&mut heap, long, flat_copy).unwrap());
        let other = flat(&mut heap, ty(), "nope".to_string());
        assert!(!eq(&mut heap, long, other).unwrap());
    }

    #[test]
    fn test_empty_repeat_stays_empty() {
        let mut heap = Heap::new();
        let empty = flat(&mut heap, ty(), String::new());
        let r = repeat(&mut heap, ty(), empty, 1000).unwrap();
        assert_eq!(byte_len(&mut heap, r).unwrap(), 0);
    }
}
