use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{domain::money, models::CouponEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponKind {
    /// Value is basis points off the subtotal.
    Percent,
    /// Value is a fixed amount in cents.
    Fixed,
}

impl CouponKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponKind::Percent => "PERCENT",
            CouponKind::Fixed => "FIXED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CouponError> {
        match raw.trim().to_uppercase().as_str() {
            "PERCENT" => Ok(CouponKind::Percent),
            "FIXED" => Ok(CouponKind::Fixed),
            _ => Err(CouponError::UnknownKind(raw.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CouponError {
    #[error("Coupon is not active")]
    Inactive,
    #[error("Coupon is not valid yet")]
    NotStarted,
    #[error("Coupon has expired")]
    Expired,
    #[error("Coupon has reached its redemption limit")]
    Exhausted,
    #[error("Coupon requires a subtotal of at least {min_subtotal_cents} cents")]
    BelowMinimum { min_subtotal_cents: i64 },
    #[error("Unknown coupon kind {0}")]
    UnknownKind(String),
    #[error("Coupon value is out of range")]
    InvalidValue,
    #[error("Coupon code must be 3 to 64 letters, digits, '-' or '_'")]
    InvalidCode,
}

#[derive(Debug, Clone)]
pub struct CouponRule {
    pub kind: CouponKind,
    pub value: i64,
    pub min_subtotal_cents: i64,
    pub max_redemptions: Option<i32>,
    pub redemption_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl TryFrom<&CouponEntity> for CouponRule {
    type Error = CouponError;

    fn try_from(coupon: &CouponEntity) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: CouponKind::parse(&coupon.kind)?,
            value: coupon.value,
            min_subtotal_cents: coupon.min_subtotal_cents,
            max_redemptions: coupon.max_redemptions,
            redemption_count: coupon.redemption_count,
            starts_at: coupon.starts_at,
            expires_at: coupon.expires_at,
            is_active: coupon.is_active,
        })
    }
}

pub fn normalize_code(code: &str) -> Result<String, CouponError> {
    let code = code.trim().to_uppercase();
    let valid_chars = code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !(3..=64).contains(&code.len()) || !valid_chars {
        return Err(CouponError::InvalidCode);
    }
    Ok(code)
}

pub fn validate_definition(kind: CouponKind, value: i64) -> Result<(), CouponError> {
    let in_range = match kind {
        CouponKind::Percent => (1..=money::BPS_SCALE).contains(&value),
        CouponKind::Fixed => value > 0,
    };
    if in_range {
        Ok(())
    } else {
        Err(CouponError::InvalidValue)
    }
}

impl CouponRule {
    /// Checks whether the coupon may be redeemed against `subtotal_cents` at `now`.
    pub fn check(&self, subtotal_cents: i64, now: DateTime<Utc>) -> Result<(), CouponError> {
        if !self.is_active {
            return Err(CouponError::Inactive);
        }
        if self.starts_at.is_some_and(|starts_at| now < starts_at) {
            return Err(CouponError::NotStarted);
        }
        if self.expires_at.is_some_and(|expires_at| now >= expires_at) {
            return Err(CouponError::Expired);
        }
        if self
            .max_redemptions
            .is_some_and(|max| self.redemption_count >= max)
        {
            return Err(CouponError::Exhausted);
        }
        if subtotal_cents < self.min_subtotal_cents {
            return Err(CouponError::BelowMinimum {
                min_subtotal_cents: self.min_subtotal_cents,
            });
        }
        Ok(())
    }

    /// Discount in cents, capped at the subtotal.
    pub fn discount_for(&self, subtotal_cents: i64) -> i64 {
        let raw = match self.kind {
            CouponKind::Percent => {
                money::apply_bps(subtotal_cents, self.value.clamp(0, money::BPS_SCALE) as i32)
            }
            CouponKind::Fixed => self.value,
        };
        raw.clamp(0, subtotal_cents.max(0))
    }

    /// `check` followed by `discount_for`.
    pub fn redeem(&self, subtotal_cents: i64, now: DateTime<Utc>) -> Result<i64, CouponError> {
        self.check(subtotal_cents, now)?;
        Ok(self.discount_for(subtotal_cents))
    }
}
