//! Token amounts in cogs, the smallest indivisible unit of the payment token.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{ChannelError, Result};

/// Non-negative integral amount of cogs.
///
/// Amounts never pass through floating point: they are parsed from and
/// rendered to base-10 integer strings, which is also how they travel to
/// the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cogs(BigUint);

impl Cogs {
    /// The zero amount.
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Convert Self directly from an `u64`.
    pub fn from_u64(n: u64) -> Self {
        Self(BigUint::from(n))
    }

    /// Convert Self directly from an `u128`.
    pub fn from_u128(n: u128) -> Self {
        Self(BigUint::from(n))
    }

    /// Build an amount from big-endian bytes (e.g. a `uint256` word).
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }

    /// Canonicalize a user- or wire-supplied amount.
    ///
    /// Accepts decimal digits with an optional leading `+` and surrounding
    /// whitespace. A fractional part is tolerated only when it is all zeros
    /// (`"5.00"` is five cogs); anything else is not a whole number of cogs
    /// and is rejected, as are negative values.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.starts_with('-') {
            return Err(ChannelError::InvalidAmount(format!(
                "negative amount `{trimmed}`"
            )));
        }
        let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let (whole, fraction) = unsigned.split_once('.').unwrap_or((unsigned, ""));

        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ChannelError::InvalidAmount(format!(
                "`{trimmed}` is not a decimal integer"
            )));
        }
        if !fraction.bytes().all(|b| b == b'0') {
            return Err(ChannelError::InvalidAmount(format!(
                "`{trimmed}` has a fractional cog value"
            )));
        }

        BigUint::parse_bytes(whole.as_bytes(), 10)
            .map(Self)
            .ok_or_else(|| ChannelError::InvalidAmount(format!("`{trimmed}` is not a number")))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `self - rhs`, or `None` when `rhs` is larger.
    pub fn checked_sub(&self, rhs: &Self) -> Option<Self> {
        if self.0 >= rhs.0 {
            Some(Self(&self.0 - &rhs.0))
        } else {
            None
        }
    }

    /// `self - rhs`, clamped at zero.
    pub fn saturating_sub(&self, rhs: &Self) -> Self {
        self.checked_sub(rhs).unwrap_or_default()
    }

    /// Multiply by a whole factor (e.g. price times number of calls).
    pub fn scale(&self, factor: u64) -> Self {
        Self(&self.0 * BigUint::from(factor))
    }

    pub fn to_u128(&self) -> Option<u128> {
        self.0.to_u128()
    }

    /// Big-endian byte representation without leading zeros.
    pub fn to_bytes_be(&self) -> Vec<u8> {
        self.0.to_bytes_be()
    }
}

impl From<u64> for Cogs {
    fn from(n: u64) -> Self {
        Self::from_u64(n)
    }
}

impl From<BigUint> for Cogs {
    fn from(v: BigUint) -> Self {
        Self(v)
    }
}

impl From<Cogs> for BigUint {
    fn from(v: Cogs) -> BigUint {
        v.0
    }
}

impl Add for Cogs {
    type Output = Cogs;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Add<&Cogs> for &Cogs {
    type Output = Cogs;

    fn add(self, rhs: &Cogs) -> Self::Output {
        Cogs(&self.0 + &rhs.0)
    }
}

impl AddAssign<&Cogs> for Cogs {
    fn add_assign(&mut self, rhs: &Cogs) {
        self.0 += &rhs.0;
    }
}

impl FromStr for Cogs {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Cogs {
    /// Print the inner BigUint as a decimal string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_str_radix(10))
    }
}

impl Serialize for Cogs {
    fn serialize<S>(&self, s: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&self.0.to_str_radix(10))
    }
}

impl<'de> Deserialize<'de> for Cogs {
    fn deserialize<D>(d: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        d.deserialize_any(CogsVisitor)
    }
}

// Accepts canonical strings as well as plain JSON integers.
struct CogsVisitor;

impl Visitor<'_> for CogsVisitor {
    type Value = Cogs;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a non-negative integer amount of cogs")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Cogs, E> {
        Ok(Cogs::from_u64(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Cogs, E> {
        u64::try_from(v)
            .map(Cogs::from_u64)
            .map_err(|_| E::custom(format!("negative amount {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Cogs, E> {
        Cogs::parse(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_whole_numbers() {
        assert_eq!(Cogs::parse("42").unwrap(), Cogs::from_u64(42));
        assert_eq!(Cogs::parse(" +7 ").unwrap(), Cogs::from_u64(7));
        assert_eq!(Cogs::parse("5.000").unwrap(), Cogs::from_u64(5));
        assert_eq!(Cogs::parse("0").unwrap(), Cogs::zero());

        let big = "123456789012345678901234567890";
        assert_eq!(Cogs::parse(big).unwrap().to_string(), big);
    }

    #[test]
    fn parse_rejects_fractional_and_negative() {
        for bad in ["1.5", "-1", "-0", "", "abc", "1e5", "0x10", ".5", "1.0.0"] {
            assert!(
                matches!(Cogs::parse(bad), Err(ChannelError::InvalidAmount(_))),
                "`{bad}` should be rejected"
            );
        }
    }

    #[test]
    fn subtraction_never_goes_negative() {
        let ten = Cogs::from_u64(10);
        let three = Cogs::from_u64(3);
        assert_eq!(ten.checked_sub(&three), Some(Cogs::from_u64(7)));
        assert_eq!(three.checked_sub(&ten), None);
        assert_eq!(three.saturating_sub(&ten), Cogs::zero());
        assert_eq!(&ten + &three, Cogs::from_u64(13));
        assert_eq!(three.scale(4), Cogs::from_u64(12));
    }

    #[test]
    fn serde_uses_decimal_strings() {
        let amount = Cogs::from_u128(u128::MAX);
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, format!("\"{}\"", u128::MAX));
        assert_eq!(serde_json::from_str::<Cogs>(&json).unwrap(), amount);

        assert_eq!(serde_json::from_str::<Cogs>("25").unwrap(), Cogs::from_u64(25));
        assert!(serde_json::from_str::<Cogs>("\"2.5\"").is_err());
        assert!(serde_json::from_str::<Cogs>("-3").is_err());
        assert!(serde_json::from_str::<Cogs>("2.5").is_err());
    }
}
