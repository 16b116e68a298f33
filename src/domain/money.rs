//! Integer money helpers. Amounts are minor units (cents), rates are basis points.

pub const BPS_SCALE: i64 = 10_000;

/// `amount * bps / 10_000`, rounded half-up. Negative inputs are treated as zero.
pub fn apply_bps(amount: i64, bps: i32) -> i64 {
    if amount <= 0 || bps <= 0 {
        return 0;
    }
    let product = amount as i128 * bps as i128;
    ((product + (BPS_SCALE as i128 / 2)) / BPS_SCALE as i128) as i64
}

/// Formats cents as a decimal string, e.g. `1999` -> `"19.99"`.
pub fn format_minor(amount: i64, currency: &str) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{sign}{}.{:02} {}", abs / 100, abs % 100, currency.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_up() {
        // 8.25% of 10.00 = 0.825 -> 0.83
        assert_eq!(apply_bps(1000, 825), 83);
        // 8.25% of 9.99 = 0.824175 -> 0.82
        assert_eq!(apply_bps(999, 825), 82);
        assert_eq!(apply_bps(1, 5000), 1);
    }

    #[test]
    fn zero_and_negative_inputs_yield_zero() {
        assert_eq!(apply_bps(0, 825), 0);
        assert_eq!(apply_bps(-100, 825), 0);
        assert_eq!(apply_bps(100, 0), 0);
    }

    #[test]
    fn full_rate_returns_amount() {
        assert_eq!(apply_bps(12_345, 10_000), 12_345);
    }

    #[test]
    fn formats_minor_units() {
        assert_eq!(format_minor(1999, "usd"), "19.99 USD");
        assert_eq!(format_minor(5, "eur"), "0.05 EUR");
        assert_eq!(format_minor(-250, "usd"), "-2.50 USD");
    }
}
