//! Arbitrary-precision numerics.
//!
//! Fixed-width integers live inline in `ValueKind::Int`; values whose static
//! type is the arbitrary-precision flavor are promoted to heap-resident big
//! integers on overflow. Big floats are decimal: a big-integer mantissa and
//! a power-of-ten exponent, so formatting and parsing round-trip exactly.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{Signed, ToPrimitive, Zero};
use std::cmp::Ordering;

/// Decimal arbitrary-precision float: `mantissa * 10^exp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigFloat {
    pub mantissa: BigInt,
    pub exp: i64,
}

/// Division scale: quotients are computed to this many decimal digits.
const DIV_SCALE: u32 = 34;

impl BigFloat {
    pub fn zero() -> Self {
        BigFloat {
            mantissa: BigInt::zero(),
            exp: 0,
        }
    }

    pub fn from_int(v: &BigInt) -> Self {
        BigFloat {
            mantissa: v.clone(),
            exp: 0,
        }
        .normalized()
    }

    pub fn from_i64(v: i64) -> Self {
        Self::from_int(&BigInt::from(v))
    }

    /// Drop trailing decimal zeros from the mantissa.
    fn normalized(mut self) -> Self {
        if self.mantissa.is_zero() {
            self.exp = 0;
            return self;
        }
        let ten = BigInt::from(10);
        while (&self.mantissa % &ten).is_zero() {
            self.mantissa /= &ten;
            self.exp += 1;
        }
        self
    }

    /// Rewrite both operands to a common exponent.
    fn aligned(&self, other: &BigFloat) -> (BigInt, BigInt, i64) {
        let exp = self.exp.min(other.exp);
        let a = &self.mantissa * pow10((self.exp - exp) as u64);
        let b = &other.mantissa * pow10((other.exp - exp) as u64);
        (a, b, exp)
    }

    pub fn add(&self, other: &BigFloat) -> BigFloat {
        let (a, b, exp) = self.aligned(other);
        BigFloat {
            mantissa: a + b,
            exp,
        }
        .normalized()
    }

    pub fn sub(&self, other: &BigFloat) -> BigFloat {
        let (a, b, exp) = self.aligned(other);
        BigFloat {
            mantissa: a - b,
            exp,
        }
        .normalized()
    }

    pub fn mul(&self, other: &BigFloat) -> BigFloat {
        BigFloat {
            mantissa: &self.mantissa * &other.mantissa,
            exp: self.exp + other.exp,
        }
        .normalized()
    }

    /// Quotient to `DIV_SCALE` decimal digits. `None` on division by zero.
    pub fn div(&self, other: &BigFloat) -> Option<BigFloat> {
        if other.mantissa.is_zero() {
            return None;
        }
        let scaled = &self.mantissa * pow10(u64::from(DIV_SCALE));
        Some(
            BigFloat {
                mantissa: scaled / &other.mantissa,
                exp: self.exp - other.exp - i64::from(DIV_SCALE),
            }
            .normalized(),
        )
    }

    pub fn neg(&self) -> BigFloat {
        BigFloat {
            mantissa: -&self.mantissa,
            exp: self.exp,
        }
    }

    pub fn compare(&self, other: &BigFloat) -> Ordering {
        let (a, b, _) = self.aligned(other);
        a.cmp(&b)
    }

    /// Truncate toward zero.
    pub fn to_int_trunc(&self) -> BigInt {
        if self.exp >= 0 {
            &self.mantissa * pow10(self.exp as u64)
        } else {
            &self.mantissa / pow10((-self.exp) as u64)
        }
    }

    /// Parse a decimal literal: optional sign, digits, optional fraction.
    pub fn parse(s: &str) -> Option<BigFloat> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let (digits, frac_len) = match s.split_once('.') {
            Some((whole, frac)) => {
                if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (format!("{whole}{frac}"), frac.len() as i64)
            }
            None => (s.to_string(), 0),
        };
        let mantissa: BigInt = digits.parse().ok()?;
        Some(
            BigFloat {
                mantissa,
                exp: -frac_len,
            }
            .normalized(),
        )
    }

    /// Exact decimal rendering.
    pub fn format(&self) -> String {
        if self.exp >= 0 {
            let v = &self.mantissa * pow10(self.exp as u64);
            return v.to_string();
        }
        let frac_len = (-self.exp) as usize;
        let negative = self.mantissa.is_negative();
        let digits = self.mantissa.magnitude().to_string();
        let digits = if digits.len() <= frac_len {
            format!("{}{}", "0".repeat(frac_len - digits.len() + 1), digits)
        } else {
            digits
        };
        let split = digits.len() - frac_len;
        let sign = if negative { "-" } else { "" };
        format!("{sign}{}.{}", &digits[..split], &digits[split..])
    }
}

fn pow10(n: u64) -> BigInt {
    BigInt::from(10u32).pow(n as u32)
}

/// Parse a big integer from decimal text.
pub fn parse_int(s: &str) -> Option<BigInt> {
    s.trim().parse().ok()
}

/// Parse a big unsigned integer; rejects negatives.
pub fn parse_uint(s: &str) -> Option<BigUint> {
    s.trim().parse().ok()
}

/// Add a small integer to a big one without an intermediate allocation of
/// the small side.
pub fn add_small(v: &BigInt, small: i64) -> BigInt {
    v + BigInt::from(small)
}

pub fn big_to_i64(v: &BigInt) -> Option<i64> {
    v.to_i64()
}

pub fn biguint_to_u64(v: &BigUint) -> Option<u64> {
    v.to_u64()
}

pub fn biguint_to_bigint(v: &BigUint) -> BigInt {
    BigInt::from_biguint(Sign::Plus, v.clone())
}

pub fn bigint_to_biguint(v: &BigInt) -> Option<BigUint> {
    if v.is_negative() {
        None
    } else {
        Some(v.magnitude().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_round_trip() {
        for s in ["0", "1", "-7", "3.25", "-0.001", "12000"] {
            let f = BigFloat::parse(s).unwrap();
            assert_eq!(f.format(), s, "round trip of {s}");
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(BigFloat::parse("").is_none());
        assert!(BigFloat::parse("1.").is_none());
        assert!(BigFloat::parse("abc").is_none());
        assert!(parse_int("12x").is_none());
        assert!(parse_uint("-3").is_none());
    }

    #[test]
    fn test_add_aligns_exponents() {
        let a = BigFloat::parse("1.5").unwrap();
        let b = BigFloat::parse("0.25").unwrap();
        assert_eq!(a.add(&b).format(), "1.75");
        assert_eq!(a.sub(&b).format(), "1.25");
    }

    #[test]
    fn test_mul_div() {
        let a = BigFloat::parse("1.5").unwrap();
        let b = BigFloat::parse("4").unwrap();
        assert_eq!(a.mul(&b).format(), "6");
        assert_eq!(b.div(&a).unwrap().format(), "2.666666666666666666666666666666666");
        assert!(b.div(&BigFloat::zero()).is_none());
    }

    #[test]
    fn test_compare() {
        let a = BigFloat::parse("2.5").unwrap();
        let b = BigFloat::parse("2.50").unwrap();
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(a.compare(&BigFloat::from_i64(3)), Ordering::Less);
    }

    #[test]
    fn test_to_int_trunc_toward_zero() {
        assert_eq!(
            BigFloat::parse("2.9").unwrap().to_int_trunc(),
            BigInt::from(2)
        );
        assert_eq!(
            BigFloat::parse("-2.9").unwrap().to_int_trunc(),
            BigInt::from(-2)
        );
    }

    #[test]
    fn test_int_promotion_helpers() {
        let big = BigInt::from(i64::MAX);
        assert_eq!(add_small(&big, 1), BigInt::from(i64::MAX) + 1);
        assert!(big_to_i64(&add_small(&big, 1)).is_none());
    }
}
