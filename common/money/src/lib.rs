use bigdecimal::BigDecimal;
use bigdecimal::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Normalize a monetary value to 2 decimal places (banker's rounding not applied; BigDecimal uses plain rounding when reducing scale)
pub fn normalize_scale(value: &BigDecimal) -> BigDecimal {
    // Set scale to 2 using with_scale, which truncates/extends with zeros.
    value.with_scale(2)
}

/// Compare two monetary values allowing a tolerance (in cents) after normalization.
pub fn nearly_equal(a: &BigDecimal, b: &BigDecimal, cents_tolerance: i64) -> bool {
    let na = normalize_scale(a);
    let nb = normalize_scale(b);
    // Convert difference to cents integer to avoid floating comparison.
    let diff = (na - nb).with_scale(2);
    // Convert to i64 cents via *100
    let cents = diff.to_f64().unwrap_or(0.0) * 100.0;
    cents.abs() <= cents_tolerance as f64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedMoney(BigDecimal);

impl NormalizedMoney {
    pub fn new(raw: BigDecimal) -> Self {
        Self(normalize_scale(&raw))
    }
    pub fn inner(&self) -> &BigDecimal { &self.0 }
}

impl From<BigDecimal> for NormalizedMoney {
    fn from(value: BigDecimal) -> Self { Self::new(value) }
}

/// Upstream money shapes seen across commerce/fulfillment platforms, normalized to
/// integer cents. Mirrors the `_to_cents`/`_money_to_cents` helpers platform adapters
/// used before everything funneled through typed money columns.
pub mod cents {
    /// `{amount, divisor}` style money object (commerce-A line items, fees, totals).
    ///
    /// `divisor == 1` is a documented platform quirk meaning `amount` is already a
    /// whole-currency-unit integer, not a fractional-cent numerator.
    pub fn from_amount_divisor(amount: i64, divisor: i64) -> i64 {
        if divisor == 1 {
            amount * 100
        } else if divisor == 0 {
            0
        } else {
            amount * 100 / divisor
        }
    }

    /// Decimal-string money (e.g. `"19.99"`), rounded to the nearest cent.
    pub fn from_decimal_str(value: &str) -> Option<i64> {
        let value: f64 = value.trim().parse().ok()?;
        Some((value * 100.0).round() as i64)
    }

    /// Floating-point money amount in major units (commerce-B GraphQL `amount` fields).
    pub fn from_float(amount: f64) -> i64 {
        (amount * 100.0).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    #[test]
    fn test_normalize() {
        let v = BigDecimal::parse_bytes(b"12.3456", 10).unwrap();
        assert_eq!(normalize_scale(&v).to_string(), "12.34");
    }
    #[test]
    fn test_nearly_equal() {
        let a = BigDecimal::parse_bytes(b"10.001", 10).unwrap();
        let b = BigDecimal::parse_bytes(b"10.009", 10).unwrap();
        assert!(nearly_equal(&a, &b, 1)); // 1 cent tolerance
    }

    #[test]
    fn cents_from_amount_divisor_handles_divisor_one_quirk() {
        assert_eq!(cents::from_amount_divisor(1999, 1), 199_900);
        assert_eq!(cents::from_amount_divisor(1999, 100), 1999);
        assert_eq!(cents::from_amount_divisor(5, 0), 0);
    }

    #[test]
    fn cents_from_decimal_str_rounds_to_nearest_cent() {
        assert_eq!(cents::from_decimal_str("19.99").unwrap(), 1999);
        assert_eq!(cents::from_decimal_str("3.005").unwrap(), 301);
        assert!(cents::from_decimal_str("not-a-number").is_none());
    }

    #[test]
    fn cents_from_float_rounds() {
        assert_eq!(cents::from_float(42.5), 4250);
    }
}
