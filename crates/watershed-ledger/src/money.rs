//! Cent-exact money arithmetic.
//!
//! Balances are single-currency and kept as whole cents. Anything that needs a
//! fractional intermediate (fees, pro-rata credits, monthly installments) is
//! computed in `i128` and rounded once to the nearest cent, half away from
//! zero. Over JSON, amounts travel as dollar numbers.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Basis points in one whole (100%).
pub const BPS_SCALE: i128 = 10_000;

/// A signed amount of money in cents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero dollars.
    pub const ZERO: Money = Money(0);

    /// One cent, the tolerance used when deciding a balance is settled.
    pub const CENT: Money = Money(1);

    /// Largest magnitude accepted from outside: ten trillion dollars.
    ///
    /// Sums of thousands of bounded amounts still fit in `i64`.
    pub const MAX: Money = Money(1_000_000_000_000_000);

    /// Create from a count of cents.
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Create from whole dollars.
    pub const fn from_dollars_whole(dollars: i64) -> Self {
        Money(dollars * 100)
    }

    /// Convert a dollar figure to cents, rounding to the nearest cent.
    ///
    /// Returns `None` for NaN, infinities and magnitudes beyond [`Money::MAX`].
    pub fn from_dollars(dollars: f64) -> Option<Self> {
        if !dollars.is_finite() {
            return None;
        }
        let cents = (dollars * 100.0).round();
        if cents.abs() > Money::MAX.0 as f64 {
            return None;
        }
        Some(Money(cents as i64))
    }

    /// The raw cent count.
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Dollar value, for display and JSON only.
    pub fn to_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Subtract, flooring the result at zero.
    pub fn saturating_sub_floor(self, other: Money) -> Money {
        Money((self.0 - other.0).max(0))
    }

    /// `round2(self * bps / 10_000)`.
    pub fn apply_bps(self, bps: u32) -> Money {
        Money(div_round(self.0 as i128 * bps as i128, BPS_SCALE) as i64)
    }

    /// `round2(self / parts)`. `parts` of zero yields the amount unchanged.
    pub fn split_even(self, parts: u32) -> Money {
        if parts == 0 {
            return self;
        }
        Money(div_round(self.0 as i128, parts as i128) as i64)
    }

    /// `round2(self * part / whole)`, the pro-rata slice of `self`.
    ///
    /// A non-positive `whole` yields zero.
    pub fn pro_rata(self, part: Money, whole: Money) -> Money {
        if whole.0 <= 0 {
            return Money::ZERO;
        }
        Money(div_round(self.0 as i128 * part.0 as i128, whole.0 as i128) as i64)
    }

    /// True when the amount is within one cent of zero (or below it).
    pub fn is_settled(self) -> bool {
        self <= Money::CENT
    }
}

/// Integer division rounding half away from zero. `d` must be positive.
fn div_round(n: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    if n >= 0 {
        (2 * n + d) / (2 * d)
    } else {
        -((-2 * n + d) / (2 * d))
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}${}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_dollars())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let dollars = f64::deserialize(deserializer)?;
        Money::from_dollars(dollars)
            .ok_or_else(|| de::Error::custom(format!("invalid money amount: {}", dollars)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollars_round_to_cents() {
        assert_eq!(Money::from_dollars(12.345), Some(Money::from_cents(1235)));
        assert_eq!(Money::from_dollars(0.29), Some(Money::from_cents(29)));
        assert_eq!(Money::from_dollars(f64::NAN), None);
        assert_eq!(Money::from_dollars(f64::INFINITY), None);
    }

    #[test]
    fn out_of_range_amounts_rejected() {
        assert_eq!(Money::from_dollars(9.0e16), None);
        assert_eq!(Money::from_dollars(-9.0e16), None);
        assert_eq!(Money::from_dollars(1.0e13), Some(Money::MAX));
        assert!(serde_json::from_str::<Money>("90000000000000000").is_err());
        assert_eq!(Money::MAX.checked_add(Money::MAX), Some(Money::from_cents(2 * Money::MAX.cents())));
        assert_eq!(Money::from_cents(i64::MAX).checked_add(Money::CENT), None);
        assert_eq!(Money::from_cents(i64::MIN).checked_sub(Money::CENT), None);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(div_round(5, 2), 3);
        assert_eq!(div_round(-5, 2), -3);
        assert_eq!(div_round(4, 3), 1);
        assert_eq!(div_round(5, 3), 2);
    }

    #[test]
    fn fee_and_installments() {
        // 5% of $200.00
        assert_eq!(Money::from_dollars_whole(200).apply_bps(500), Money::from_dollars_whole(10));
        // $100.00 over 3 months
        assert_eq!(Money::from_dollars_whole(100).split_even(3), Money::from_cents(3333));
        // $0.05 over 2 months rounds up
        assert_eq!(Money::from_cents(5).split_even(2), Money::from_cents(3));
    }

    #[test]
    fn pro_rata_slices() {
        let payment = Money::from_dollars_whole(40);
        let slice = payment.pro_rata(Money::from_dollars_whole(50), Money::from_dollars_whole(200));
        assert_eq!(slice, Money::from_dollars_whole(10));
        assert_eq!(payment.pro_rata(Money::CENT, Money::ZERO), Money::ZERO);
    }

    #[test]
    fn display() {
        assert_eq!(Money::from_cents(123_456).to_string(), "$1234.56");
        assert_eq!(Money::from_cents(-5).to_string(), "-$0.05");
    }

    #[test]
    fn json_is_dollars() {
        let json = serde_json::to_string(&Money::from_cents(1234)).unwrap();
        assert_eq!(json, "12.34");
        let parsed: Money = serde_json::from_str("300").unwrap();
        assert_eq!(parsed, Money::from_dollars_whole(300));
    }
}
