use chrono::{DateTime, Utc};

use crate::{domain::money, models::PromotionEntity};

#[derive(Debug, Clone)]
pub struct PromotionRule {
    pub percent_off_bps: i32,
    pub product_id: Option<i32>,
    pub category: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl From<&PromotionEntity> for PromotionRule {
    fn from(promotion: &PromotionEntity) -> Self {
        Self {
            percent_off_bps: promotion.percent_off_bps,
            product_id: promotion.product_id,
            category: promotion.category.clone(),
            starts_at: promotion.starts_at,
            ends_at: promotion.ends_at,
            is_active: promotion.is_active,
        }
    }
}

impl PromotionRule {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.starts_at <= now && self.ends_at.is_none_or(|ends_at| now < ends_at)
    }

    /// Product scope wins over category scope; neither set means site-wide.
    pub fn applies_to(&self, product_id: i32, category: &str) -> bool {
        match (&self.product_id, &self.category) {
            (Some(id), _) => *id == product_id,
            (None, Some(scope)) => scope.eq_ignore_ascii_case(category),
            (None, None) => true,
        }
    }
}

/// Largest live discount for a product. Promotions never stack.
pub fn best_discount_bps(
    promotions: &[PromotionRule],
    product_id: i32,
    category: &str,
    now: DateTime<Utc>,
) -> Option<i32> {
    promotions
        .iter()
        .filter(|p| p.is_live(now) && p.applies_to(product_id, category))
        .map(|p| p.percent_off_bps.clamp(0, money::BPS_SCALE as i32))
        .max()
}

pub fn discounted_price(price_cents: i64, percent_off_bps: Option<i32>) -> i64 {
    match percent_off_bps {
        Some(bps) => price_cents - money::apply_bps(price_cents, bps),
        None => price_cents,
    }
}
