use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed-point decimal with 4 decimal places, stored as a scaled integer.
///
/// Serialized as its display string (`"12.5000"`) so config files and audit
/// dumps never round-trip through floating point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid amount '{0}'")]
pub struct ParseAmountError(String);

impl Amount {
    const SCALE: i64 = 10_000;

    pub const ZERO: Amount = Amount(0);

    pub fn from_float(value: f64) -> Self {
        Amount((value * Self::SCALE as f64).round() as i64)
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    /// Whole currency units, e.g. `from_units(10)` is `10.0000`.
    pub fn from_units(units: i64) -> Self {
        Amount(units.saturating_mul(Self::SCALE))
    }

    pub fn scaled(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    /// Per-unit rate multiplied by a count (views). `None` on overflow.
    pub fn checked_times(self, count: u64) -> Option<Amount> {
        let scaled = i128::from(self.0).checked_mul(i128::from(count))?;
        i64::try_from(scaled).ok().map(Amount)
    }

    /// Per-thousand rate (RPM) applied to a count, rounded down. `None` on
    /// overflow.
    pub fn checked_per_thousand(self, count: u64) -> Option<Amount> {
        let scaled = i128::from(self.0).checked_mul(i128::from(count))? / 1_000;
        i64::try_from(scaled).ok().map(Amount)
    }

    /// Sum that reports overflow instead of panicking.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Amount>) -> Option<Amount> {
        amounts
            .into_iter()
            .try_fold(Amount::ZERO, |acc, a| acc.checked_add(a))
    }

    /// Fraction of this amount expressed in basis points, rounded down.
    pub fn bps(self, basis_points: u32) -> Amount {
        let scaled = i128::from(self.0) * i128::from(basis_points) / 10_000;
        Amount(scaled as i64)
    }

    /// How many whole `unit`s fit into this amount. Zero for non-positive units.
    pub fn whole_multiples_of(self, unit: Amount) -> i64 {
        if unit.0 <= 0 {
            return 0;
        }
        self.0.max(0) / unit.0
    }

    pub fn max_zero(self) -> Amount {
        Amount(self.0.max(0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        let whole = abs / scale;
        let frac = abs % scale;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAmountError(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(err());
        }
        if frac.len() > 4 || !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(err());
        }
        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err())?
        };
        let frac: i64 = format!("{frac:0<4}").parse().map_err(|_| err())?;
        let value = whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(err)?;
        Ok(Amount(if negative { -value } else { value }))
    }
}

impl TryFrom<String> for Amount {
    type Error = ParseAmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.to_string()
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Amount {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Amount(-self.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_float_converts_correctly() {
        assert_eq!(Amount::from_float(100.0), Amount::from_scaled(1_000_000));
        assert_eq!(Amount::from_float(0.01), Amount::from_scaled(100));
        assert_eq!(Amount::from_float(1.23456), Amount::from_scaled(12346));
    }

    #[test]
    fn from_units_scales() {
        assert_eq!(Amount::from_units(10), Amount::from_scaled(100_000));
    }

    #[test]
    fn display_formats() {
        assert_eq!(Amount::from_scaled(1_000_000).to_string(), "100.0000");
        assert_eq!(Amount::from_scaled(-502_500).to_string(), "-50.2500");
        assert_eq!(Amount::from_scaled(-1).to_string(), "-0.0001");
        assert_eq!(Amount::default().to_string(), "0.0000");
    }

    #[test]
    fn parse_accepts_display_output_and_short_forms() {
        assert_eq!("12.5".parse::<Amount>(), Ok(Amount::from_scaled(125_000)));
        assert_eq!("10".parse::<Amount>(), Ok(Amount::from_units(10)));
        assert_eq!("-0.0001".parse::<Amount>(), Ok(Amount::from_scaled(-1)));
        assert_eq!(".5".parse::<Amount>(), Ok(Amount::from_scaled(5_000)));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Amount>().is_err());
        assert!("1.23456".parse::<Amount>().is_err());
        assert!("1e3".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn rate_times_views() {
        // 1,000 views at 0.01 per view
        let rate = Amount::from_float(0.01);
        assert_eq!(rate.checked_times(1_000), Some(Amount::from_units(10)));
        assert_eq!(rate.checked_times(0), Some(Amount::ZERO));
        assert_eq!(rate.checked_times(u64::MAX), None);
    }

    #[test]
    fn rpm_rounds_down() {
        // $4 RPM over 2,500 views
        let rpm = Amount::from_units(4);
        assert_eq!(rpm.checked_per_thousand(2_500), Some(Amount::from_units(10)));
        assert_eq!(
            Amount::from_scaled(3).checked_per_thousand(999),
            Some(Amount::from_scaled(2))
        );
        assert_eq!(Amount::from_scaled(i64::MAX).checked_per_thousand(u64::MAX), None);
    }

    #[test]
    fn checked_sum_reports_overflow() {
        let half = Amount::from_scaled(i64::MAX / 2 + 1);
        assert_eq!(Amount::checked_sum([half, half]), None);
        assert_eq!(
            Amount::checked_sum([Amount::from_units(1), Amount::from_units(2)]),
            Some(Amount::from_units(3))
        );
        assert_eq!(half.saturating_add(half), Amount::from_scaled(i64::MAX));
    }

    #[test]
    fn bps_rounds_down() {
        assert_eq!(Amount::from_units(100).bps(250), Amount::from_float(2.5));
        assert_eq!(Amount::from_scaled(3).bps(5_000), Amount::from_scaled(1));
        assert_eq!(Amount::from_units(100).bps(0), Amount::ZERO);
    }

    #[test]
    fn whole_multiples() {
        let ten = Amount::from_units(10);
        assert_eq!(Amount::from_units(55).whole_multiples_of(ten), 5);
        assert_eq!(Amount::from_units(-5).whole_multiples_of(ten), 0);
        assert_eq!(ten.whole_multiples_of(Amount::ZERO), 0);
    }

    #[test]
    fn arithmetic_and_sum() {
        let a = Amount::from_scaled(100);
        let b = Amount::from_scaled(30);
        assert_eq!(a - b, Amount::from_scaled(70));
        assert_eq!(-a, Amount::from_scaled(-100));
        assert_eq!([a, b].into_iter().sum::<Amount>(), Amount::from_scaled(130));
        assert_eq!(Amount::from_scaled(i64::MAX).checked_add(a), None);
    }

    #[test]
    fn serde_uses_strings() {
        let json = serde_json::to_string(&Amount::from_units(5)).unwrap();
        assert_eq!(json, "\"5.0000\"");
        let back: Amount = serde_json::from_str("\"0.25\"").unwrap();
        assert_eq!(back, Amount::from_float(0.25));
    }
}
