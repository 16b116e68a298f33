//! Cart and order totals.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{
    promotions::{self, PromotionRule},
    tax,
};

/// A cart line joined with its catalog data.
#[derive(Debug, Clone)]
pub struct LineInput {
    pub product_id: i32,
    pub variant_id: i32,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
    pub category: String,
    pub product_price_cents: i64,
    pub variant_price_cents: Option<i64>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PricedLine {
    pub product_id: i32,
    pub variant_id: i32,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
    pub list_unit_price_cents: i64,
    pub unit_price_cents: i64,
    pub quantity: i32,
    pub line_total_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, Default)]
pub struct Totals {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

pub fn price_line(line: &LineInput, promotions: &[PromotionRule], now: DateTime<Utc>) -> PricedLine {
    let list_unit_price_cents = line.variant_price_cents.unwrap_or(line.product_price_cents);
    let bps = promotions::best_discount_bps(promotions, line.product_id, &line.category, now);
    let unit_price_cents = promotions::discounted_price(list_unit_price_cents, bps);

    PricedLine {
        product_id: line.product_id,
        variant_id: line.variant_id,
        product_name: line.product_name.clone(),
        variant_name: line.variant_name.clone(),
        sku: line.sku.clone(),
        list_unit_price_cents,
        unit_price_cents,
        quantity: line.quantity,
        line_total_cents: unit_price_cents * line.quantity as i64,
    }
}

pub fn price_lines(
    lines: &[LineInput],
    promotions: &[PromotionRule],
    now: DateTime<Utc>,
) -> Vec<PricedLine> {
    lines
        .iter()
        .map(|line| price_line(line, promotions, now))
        .collect()
}

pub fn subtotal(lines: &[PricedLine]) -> i64 {
    lines.iter().map(|line| line.line_total_cents).sum()
}

/// Tax is charged on the discounted subtotal.
pub fn totals(subtotal_cents: i64, discount_cents: i64, tax_rate_bps: i32) -> Totals {
    let discount_cents = discount_cents.clamp(0, subtotal_cents.max(0));
    let taxable = subtotal_cents - discount_cents;
    let tax_cents = tax::tax_for(taxable, tax_rate_bps);

    Totals {
        subtotal_cents,
        discount_cents,
        tax_cents,
        total_cents: taxable + tax_cents,
    }
}

/// Splits `discount` across `amounts` in proportion to their size.
///
/// Largest-remainder rounding: the parts always sum to `min(discount, sum(amounts))`
/// and no part exceeds its amount.
pub fn allocate_discount(amounts: &[i64], discount: i64) -> Vec<i64> {
    let total: i64 = amounts.iter().map(|a| (*a).max(0)).sum();
    if total == 0 || discount <= 0 {
        return vec![0; amounts.len()];
    }
    let discount = discount.min(total);

    let mut parts = Vec::with_capacity(amounts.len());
    let mut remainders = Vec::with_capacity(amounts.len());
    for (index, amount) in amounts.iter().enumerate() {
        let exact = (*amount).max(0) as i128 * discount as i128;
        parts.push((exact / total as i128) as i64);
        remainders.push((exact % total as i128, index));
    }

    let mut leftover = discount - parts.iter().sum::<i64>();
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, index) in remainders {
        if leftover == 0 {
            break;
        }
        if parts[index] < amounts[index] {
            parts[index] += 1;
            leftover -= 1;
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn line(product_id: i32, price: i64, variant_price: Option<i64>, quantity: i32) -> LineInput {
        LineInput {
            product_id,
            variant_id: product_id * 10,
            product_name: format!("Product {product_id}"),
            variant_name: "Default".into(),
            sku: format!("SKU-{product_id}"),
            category: "apparel".into(),
            product_price_cents: price,
            variant_price_cents: variant_price,
            quantity,
        }
    }

    #[test]
    fn variant_price_overrides_product_price() {
        let priced = price_line(&line(1, 2000, Some(2500), 2), &[], Utc::now());
        assert_eq!(priced.unit_price_cents, 2500);
        assert_eq!(priced.line_total_cents, 5000);
    }

    #[test]
    fn promotion_lowers_unit_price() {
        let promo = PromotionRule {
            percent_off_bps: 1000,
            product_id: None,
            category: Some("apparel".into()),
            starts_at: Utc::now() - Duration::hours(1),
            ends_at: None,
            is_active: true,
        };
        let priced = price_line(&line(1, 2000, None, 3), &[promo], Utc::now());
        assert_eq!(priced.list_unit_price_cents, 2000);
        assert_eq!(priced.unit_price_cents, 1800);
        assert_eq!(priced.line_total_cents, 5400);
    }

    #[test]
    fn totals_tax_the_discounted_subtotal() {
        let totals = totals(10_000, 2_000, 825);
        assert_eq!(
            totals,
            Totals {
                subtotal_cents: 10_000,
                discount_cents: 2_000,
                tax_cents: 660,
                total_cents: 8_660,
            }
        );
    }

    #[test]
    fn discount_never_exceeds_subtotal() {
        let totals = totals(500, 900, 1000);
        assert_eq!(totals.discount_cents, 500);
        assert_eq!(totals.total_cents, 0);
    }

    #[test]
    fn allocation_sums_exactly() {
        let parts = allocate_discount(&[333, 333, 334], 100);
        assert_eq!(parts.iter().sum::<i64>(), 100);
        assert_eq!(parts, vec![33, 33, 34]);

        let parts = allocate_discount(&[1, 1, 1], 2);
        assert_eq!(parts, vec![1, 1, 0]);
    }

    #[test]
    fn allocation_is_capped_by_amounts() {
        let parts = allocate_discount(&[100, 50], 1_000);
        assert_eq!(parts, vec![100, 50]);
        assert_eq!(allocate_discount(&[0, 0], 10), vec![0, 0]);
        assert_eq!(allocate_discount(&[10, 20], 0), vec![0, 0]);
    }
}
