//! The numeric tower.
//!
//! Four subtypes with the promotion lattice `Integer ⊆ Rational ⊆ Real`,
//! plus arbitrary-precision big integers reached when fixnum arithmetic
//! overflows. Exact arithmetic never silently loses precision: dividing two
//! integers produces a rational when the quotient is not exact, and results
//! demote back down the lattice whenever they fit (a rational with
//! denominator one becomes an integer, a big integer that fits in an `i64`
//! becomes a fixnum).

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;

#[derive(Clone, Debug)]
pub enum Number {
    /// Fixnum integer.
    Integer(i64),
    /// Arbitrary-precision integer, used when fixnum arithmetic overflows.
    Big(BigInt),
    /// Exact ratio of big integers, always in lowest terms with a
    /// denominator greater than one.
    Rational(BigRational),
    /// Inexact IEEE double.
    Real(f64),
}

impl Number {
    /// Demote a big integer to a fixnum when it fits.
    pub fn from_bigint(value: BigInt) -> Number {
        match value.to_i64() {
            Some(small) => Number::Integer(small),
            None => Number::Big(value),
        }
    }

    /// Demote a rational to an integer when the denominator is one.
    pub fn from_rational(value: BigRational) -> Number {
        if value.is_integer() {
            Number::from_bigint(value.to_integer())
        } else {
            Number::Rational(value)
        }
    }

    /// The exact tiers as a ratio; `None` for reals.
    fn exact(&self) -> Option<BigRational> {
        match self {
            Number::Integer(i) => Some(BigRational::from_integer(BigInt::from(*i))),
            Number::Big(b) => Some(BigRational::from_integer(b.clone())),
            Number::Rational(r) => Some(r.clone()),
            Number::Real(_) => None,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Number::Integer(i) => *i as f64,
            Number::Big(b) => b.to_f64().unwrap_or(f64::INFINITY),
            Number::Rational(r) => r.to_f64().unwrap_or(f64::INFINITY),
            Number::Real(r) => *r,
        }
    }

    pub fn is_exact(&self) -> bool {
        !matches!(self, Number::Real(_))
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Number::Integer(i) => *i == 0,
            Number::Big(b) => b.is_zero(),
            Number::Rational(r) => r.is_zero(),
            Number::Real(r) => *r == 0.0,
        }
    }

    /// `integer?` in the R7RS sense: exact integers, and reals with no
    /// fractional part.
    pub fn is_integer_valued(&self) -> bool {
        match self {
            Number::Integer(_) | Number::Big(_) => true,
            Number::Rational(_) => false,
            Number::Real(r) => r.is_finite() && r.fract() == 0.0,
        }
    }

    /// `rational?`: every exact number, and every finite real.
    pub fn is_rational_valued(&self) -> bool {
        match self {
            Number::Real(r) => r.is_finite(),
            _ => true,
        }
    }

    pub fn add(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => match a.checked_add(*b) {
                Some(sum) => Number::Integer(sum),
                None => Number::from_bigint(BigInt::from(*a) + BigInt::from(*b)),
            },
            _ => self.exact_or_real(other, |a, b| a + b, |a, b| a + b),
        }
    }

    pub fn sub(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => match a.checked_sub(*b) {
                Some(diff) => Number::Integer(diff),
                None => Number::from_bigint(BigInt::from(*a) - BigInt::from(*b)),
            },
            _ => self.exact_or_real(other, |a, b| a - b, |a, b| a - b),
        }
    }

    pub fn mul(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => match a.checked_mul(*b) {
                Some(product) => Number::Integer(product),
                None => Number::from_bigint(BigInt::from(*a) * BigInt::from(*b)),
            },
            _ => self.exact_or_real(other, |a, b| a * b, |a, b| a * b),
        }
    }

    /// Division. `None` signals an exact zero divisor; real division
    /// follows IEEE semantics instead.
    pub fn div(&self, other: &Number) -> Option<Number> {
        match (self.exact(), other.exact()) {
            (Some(a), Some(b)) => {
                if b.is_zero() {
                    None
                } else {
                    Some(Number::from_rational(a / b))
                }
            }
            _ => Some(Number::Real(self.to_f64() / other.to_f64())),
        }
    }

    pub fn neg(&self) -> Number {
        Number::Integer(0).sub(self)
    }

    /// Same-identity comparison for `eqv?`: equal value *and* equal
    /// exactness, so `1` and `1.0` are not `eqv?`.
    pub fn eqv(&self, other: &Number) -> bool {
        self.is_exact() == other.is_exact() && self == other
    }

    fn exact_or_real(
        &self,
        other: &Number,
        exact_op: fn(&BigRational, &BigRational) -> BigRational,
        real_op: fn(f64, f64) -> f64,
    ) -> Number {
        match (self.exact(), other.exact()) {
            (Some(a), Some(b)) => Number::from_rational(exact_op(&a, &b)),
            _ => Number::Real(real_op(self.to_f64(), other.to_f64())),
        }
    }

    /// Parse a number literal: optional explicit sign, decimal fraction for
    /// reals, `/` for rationals. Returns `None` for malformed text and for
    /// rationals with a zero denominator.
    pub fn parse(text: &str) -> Option<Number> {
        if let Some((numer_text, denom_text)) = text.split_once('/') {
            let numer: BigInt = numer_text.parse().ok()?;
            let denom: BigInt = denom_text.parse().ok()?;
            if denom.is_zero() {
                return None;
            }
            return Some(Number::from_rational(BigRational::new(numer, denom)));
        }
        if text.contains('.') {
            return text.parse::<f64>().ok().map(Number::Real);
        }
        if let Ok(small) = text.parse::<i64>() {
            return Some(Number::Integer(small));
        }
        text.parse::<BigInt>().ok().map(Number::from_bigint)
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self.exact(), other.exact()) {
            (Some(a), Some(b)) => a == b,
            _ => self.to_f64() == other.to_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.exact(), other.exact()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => self.to_f64().partial_cmp(&other.to_f64()),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Number::Integer(i) => write!(f, "{i}"),
            Number::Big(b) => write!(f, "{b}"),
            Number::Rational(r) => write!(f, "{}/{}", r.numer(), r.denom()),
            Number::Real(r) => {
                if r.is_nan() {
                    write!(f, "+nan.0")
                } else if r.is_infinite() {
                    write!(f, "{}", if r.is_sign_positive() { "+inf.0" } else { "-inf.0" })
                } else {
                    write!(f, "{r:?}")
                }
            }
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Integer(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Real(value)
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;

    fn int(i: i64) -> Number {
        Number::Integer(i)
    }

    #[test]
    fn test_fixnum_arithmetic() {
        assert_eq!(int(2).add(&int(3)), int(5));
        assert_eq!(int(2).sub(&int(3)), int(-1));
        assert_eq!(int(6).mul(&int(7)), int(42));
        assert_eq!(int(6).div(&int(3)).unwrap(), int(2));
    }

    #[test]
    fn test_overflow_promotes_to_big() {
        let huge = int(i64::MAX).add(&int(1));
        assert!(matches!(huge, Number::Big(_)));
        assert_eq!(
            format!("{huge}"),
            "9223372036854775808",
        );
        // Arithmetic on the promoted result keeps working.
        let back = huge.sub(&int(1));
        assert_eq!(back, int(i64::MAX));
        assert!(matches!(back, Number::Integer(_)));
    }

    #[test]
    fn test_inexact_division_yields_rational() {
        let r = int(1).div(&int(3)).unwrap();
        assert!(matches!(r, Number::Rational(_)));
        assert_eq!(format!("{r}"), "1/3");
        // 1/3 * 3 demotes back to an integer.
        assert_eq!(r.mul(&int(3)), int(1));
        assert!(matches!(r.mul(&int(3)), Number::Integer(_)));
    }

    #[test]
    fn test_exact_zero_divisor() {
        assert!(int(1).div(&int(0)).is_none());
        // Real division follows IEEE instead.
        let inf = Number::Real(1.0).div(&int(0)).unwrap();
        assert!(matches!(inf, Number::Real(r) if r.is_infinite()));
    }

    #[test]
    fn test_cross_tier_comparison() {
        assert_eq!(int(1), Number::Real(1.0));
        assert!(int(1) < Number::Rational(BigRational::new(BigInt::from(3), BigInt::from(2))));
        assert!(Number::Real(0.5) < int(1));
        assert!(int(i64::MAX).add(&int(1)) > int(i64::MAX));
    }

    #[test]
    fn test_eqv_distinguishes_exactness() {
        assert!(int(1).eqv(&int(1)));
        assert!(!int(1).eqv(&Number::Real(1.0)));
        assert!(Number::Real(1.5).eqv(&Number::Real(1.5)));
    }

    #[test]
    fn test_parse() {
        let cases = vec![
            ("42", int(42)),
            ("-5", int(-5)),
            ("+17", int(17)),
            ("3.25", Number::Real(3.25)),
            ("-0.5", Number::Real(-0.5)),
            ("1/3", Number::Rational(BigRational::new(BigInt::from(1), BigInt::from(3)))),
            ("4/2", int(2)),
            ("-6/4", Number::Rational(BigRational::new(BigInt::from(-3), BigInt::from(2)))),
            ("99999999999999999999", Number::from_bigint("99999999999999999999".parse().unwrap())),
        ];
        for (text, expected) in cases {
            let parsed = Number::parse(text).unwrap();
            assert!(parsed.eqv(&expected), "parsing {text}: got {parsed}");
        }
        assert!(Number::parse("1/0").is_none());
        assert!(Number::parse("abc").is_none());
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["42", "-5", "1/3", "3.25", "-9223372036854775809"] {
            let n = Number::parse(text).unwrap();
            assert_eq!(format!("{n}"), text);
        }
    }

    #[test]
    fn test_predicates() {
        assert!(int(3).is_integer_valued());
        assert!(Number::Real(2.0).is_integer_valued());
        assert!(!Number::Real(2.5).is_integer_valued());
        assert!(Number::parse("1/3").unwrap().is_rational_valued());
        assert!(!Number::Real(f64::INFINITY).is_rational_valued());
    }
}
