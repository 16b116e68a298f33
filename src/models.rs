use chrono::{DateTime, Utc};
use diesel::{
    Selectable,
    prelude::{AsChangeset, Identifiable, Insertable, Queryable},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

// Catalog

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::products)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ProductEntity {
    pub id: i32,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::products)]
pub struct CreateProductEntity {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
    pub image_url: Option<String>,
}

#[derive(AsChangeset, Deserialize, Debug, Default, ToSchema)]
#[diesel(table_name = crate::schema::products)]
pub struct UpdateProductEntity {
    pub slug: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub price_cents: Option<i64>,
    pub image_url: Option<String>,
    pub is_active: Option<bool>,
}

impl UpdateProductEntity {
    pub fn is_empty(&self) -> bool {
        self.slug.is_none()
            && self.name.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.price_cents.is_none()
            && self.image_url.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::product_variants)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct VariantEntity {
    pub id: i32,
    pub product_id: i32,
    pub sku: String,
    pub name: String,
    pub price_cents: Option<i64>,
    pub stock: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::product_variants)]
pub struct CreateVariantEntity {
    pub product_id: i32,
    pub sku: String,
    pub name: String,
    pub price_cents: Option<i64>,
    pub stock: i32,
}

#[derive(AsChangeset, Deserialize, Debug, Default, ToSchema)]
#[diesel(table_name = crate::schema::product_variants)]
pub struct UpdateVariantEntity {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub price_cents: Option<i64>,
    pub is_active: Option<bool>,
}

impl UpdateVariantEntity {
    pub fn is_empty(&self) -> bool {
        self.sku.is_none()
            && self.name.is_none()
            && self.price_cents.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Queryable, Selectable, Serialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::inventory_movements)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InventoryMovementEntity {
    pub id: i32,
    pub variant_id: i32,
    pub delta: i32,
    pub reason: String,
    pub order_id: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::inventory_movements)]
pub struct CreateInventoryMovementEntity {
    pub variant_id: i32,
    pub delta: i32,
    pub reason: String,
    pub order_id: Option<i32>,
}

// Carts

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::carts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CartEntity {
    pub id: i32,
    pub customer_id: Uuid,
    pub email: Option<String>,
    pub status: String,
    pub coupon_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, ToSchema)]
#[diesel(belongs_to(CartEntity, foreign_key = cart_id))]
#[diesel(table_name = crate::schema::cart_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CartItemEntity {
    pub cart_id: i32,
    pub variant_id: i32,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::cart_items)]
pub struct CreateCartItemEntity {
    pub cart_id: i32,
    pub variant_id: i32,
    pub quantity: i32,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::carts)]
pub struct CreateCartEntity {
    pub customer_id: Uuid,
    pub email: Option<String>,
    pub status: String,
}

// Orders

#[derive(Queryable, Serialize, Selectable, Identifiable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderEntity {
    pub id: i32,
    pub customer_id: Uuid,
    pub cart_id: i32,
    pub email: String,
    pub status: String,
    pub currency: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub refunded_cents: i64,
    pub coupon_code: Option<String>,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub shipping_address: Value,
    /// Why a paid order is parked in PENDING for manual review.
    pub hold_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreateOrderEntity {
    pub customer_id: Uuid,
    pub cart_id: i32,
    pub email: String,
    pub status: String,
    pub currency: String,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub coupon_code: Option<String>,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    pub shipping_address: Value,
    pub hold_reason: Option<String>,
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::order_items)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OrderItemEntity {
    pub id: i32,
    pub order_id: i32,
    pub product_id: i32,
    pub variant_id: i32,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
    pub unit_price_cents: i64,
    pub quantity: i32,
    pub line_total_cents: i64,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::order_items)]
pub struct CreateOrderItemEntity {
    pub order_id: i32,
    pub product_id: i32,
    pub variant_id: i32,
    pub product_name: String,
    pub variant_name: String,
    pub sku: String,
    pub unit_price_cents: i64,
    pub quantity: i32,
    pub line_total_cents: i64,
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::refunds)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RefundEntity {
    pub id: Uuid,
    pub order_id: i32,
    pub amount_cents: i64,
    pub reason: String,
    pub provider_ref: Option<String>,
    pub status: String,
    pub restocked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::refunds)]
pub struct CreateRefundEntity {
    pub order_id: i32,
    pub amount_cents: i64,
    pub reason: String,
    pub provider_ref: Option<String>,
    pub status: String,
    pub restocked: bool,
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::abandoned_carts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AbandonedCartEntity {
    pub id: i32,
    pub cart_id: i32,
    pub customer_id: Uuid,
    pub email: String,
    pub detected_at: DateTime<Utc>,
    pub reminder_count: i32,
    pub last_reminded_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub recovery_token: Uuid,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::abandoned_carts)]
pub struct CreateAbandonedCartEntity {
    pub cart_id: i32,
    pub customer_id: Uuid,
    pub email: String,
}

// Tax

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::tax_rates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaxRateEntity {
    pub id: i32,
    pub name: String,
    pub country: String,
    pub region: Option<String>,
    pub rate_bps: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::tax_rates)]
pub struct CreateTaxRateEntity {
    pub name: String,
    pub country: String,
    pub region: Option<String>,
    pub rate_bps: i32,
}

#[derive(AsChangeset, Deserialize, Debug, Default, ToSchema)]
#[diesel(table_name = crate::schema::tax_rates)]
pub struct UpdateTaxRateEntity {
    pub name: Option<String>,
    pub rate_bps: Option<i32>,
    pub is_active: Option<bool>,
}

impl UpdateTaxRateEntity {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.rate_bps.is_none() && self.is_active.is_none()
    }
}

// Marketing

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::coupons)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CouponEntity {
    pub id: i32,
    pub code: String,
    pub kind: String,
    pub value: i64,
    pub min_subtotal_cents: i64,
    pub max_redemptions: Option<i32>,
    pub redemption_count: i32,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::coupons)]
pub struct CreateCouponEntity {
    pub code: String,
    pub kind: String,
    pub value: i64,
    pub min_subtotal_cents: i64,
    pub max_redemptions: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(AsChangeset, Deserialize, Debug, Default, ToSchema)]
#[diesel(table_name = crate::schema::coupons)]
pub struct UpdateCouponEntity {
    pub value: Option<i64>,
    pub min_subtotal_cents: Option<i64>,
    pub max_redemptions: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

impl UpdateCouponEntity {
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.min_subtotal_cents.is_none()
            && self.max_redemptions.is_none()
            && self.starts_at.is_none()
            && self.expires_at.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::promotions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct PromotionEntity {
    pub id: i32,
    pub name: String,
    pub percent_off_bps: i32,
    pub product_id: Option<i32>,
    pub category: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug, ToSchema)]
#[diesel(table_name = crate::schema::promotions)]
pub struct CreatePromotionEntity {
    pub name: String,
    pub percent_off_bps: i32,
    pub product_id: Option<i32>,
    pub category: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(AsChangeset, Deserialize, Debug, Default, ToSchema)]
#[diesel(table_name = crate::schema::promotions)]
pub struct UpdatePromotionEntity {
    pub name: Option<String>,
    pub percent_off_bps: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
}

impl UpdatePromotionEntity {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.percent_off_bps.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Queryable, Serialize, Selectable, Debug, Clone, ToSchema)]
#[diesel(table_name = crate::schema::reviews)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ReviewEntity {
    pub id: i32,
    pub product_id: i32,
    pub customer_id: Uuid,
    pub rating: i16,
    pub title: String,
    pub body: String,
    pub status: String,
    pub verified_purchase: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::reviews)]
pub struct CreateReviewEntity {
    pub product_id: i32,
    pub customer_id: Uuid,
    pub rating: i16,
    pub title: String,
    pub body: String,
    pub status: String,
    pub verified_purchase: bool,
}

// Outbox

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::outbox)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboxEntity {
    pub id: i32,
    pub event_type: String,
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = crate::schema::outbox)]
pub struct CreateOutboxEntity {
    pub event_type: String,
    pub payload: String,
    pub status: String,
}
