use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    domain::{
        coupons::{CouponError, CouponRule},
        inventory::{self, CART_ACTIVE, StockError, StockView},
        pricing::{self, LineInput, PricedLine, Totals},
    },
    models::{
        CartEntity, CartItemEntity, CouponEntity, CreateCartEntity, ProductEntity, VariantEntity,
    },
    platform::middleware::Customer,
    schema::{cart_items, carts, coupons, product_variants, products},
    services::catalog,
};

/// A cart line with everything needed to price it and check stock.
#[derive(Debug, Clone)]
pub struct CartLine {
    pub item: CartItemEntity,
    pub variant: VariantEntity,
    pub product: ProductEntity,
}

impl CartLine {
    pub fn to_input(&self) -> LineInput {
        LineInput {
            product_id: self.product.id,
            variant_id: self.variant.id,
            product_name: self.product.name.clone(),
            variant_name: self.variant.name.clone(),
            sku: self.variant.sku.clone(),
            category: self.product.category.clone(),
            product_price_cents: self.product.price_cents,
            variant_price_cents: self.variant.price_cents,
            quantity: self.item.quantity,
        }
    }

    pub fn stock_view(&self) -> StockView<'_> {
        StockView {
            sku: &self.variant.sku,
            stock: self.variant.stock,
            variant_active: self.variant.is_active,
            product_active: self.product.is_active,
        }
    }

    pub fn ensure_available(&self) -> Result<(), StockError> {
        inventory::ensure_available(&self.stock_view(), self.item.quantity)
    }
}

#[derive(Serialize, ToSchema, Debug)]
pub struct CartView {
    pub cart: CartEntity,
    pub lines: Vec<PricedLine>,
    pub totals: Totals,
    /// Why the applied coupon currently gives no discount, if it doesn't.
    pub coupon_error: Option<String>,
}

/// Priced cart content plus the coupon outcome.
pub struct PricedCart {
    pub lines: Vec<CartLine>,
    pub priced: Vec<PricedLine>,
    pub subtotal_cents: i64,
    pub coupon: Option<(CouponEntity, Result<i64, CouponError>)>,
}

impl PricedCart {
    pub fn discount_cents(&self) -> i64 {
        match &self.coupon {
            Some((_, Ok(discount))) => *discount,
            _ => 0,
        }
    }

    pub fn coupon_error(&self) -> Option<String> {
        match &self.coupon {
            Some((_, Err(err))) => Some(err.to_string()),
            _ => None,
        }
    }
}

pub async fn find_active_cart(
    conn: &mut AsyncPgConnection,
    customer_id: Uuid,
) -> Result<Option<CartEntity>> {
    carts::table
        .filter(carts::customer_id.eq(customer_id))
        .filter(carts::status.eq(CART_ACTIVE))
        .select(CartEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get active cart")
}

/// Returns the customer's active cart, creating one when needed, and
/// remembers the customer's email for recovery reminders.
pub async fn get_or_create_active_cart(
    conn: &mut AsyncPgConnection,
    customer: &Customer,
) -> Result<CartEntity> {
    if let Some(cart) = find_active_cart(conn, customer.id).await? {
        if let Some(email) = email_to_capture(cart.email.as_deref(), customer.email.as_deref()) {
            return diesel::update(carts::table.find(cart.id))
                .set(carts::email.eq(email))
                .returning(CartEntity::as_returning())
                .get_result(conn)
                .await
                .context("Failed to update cart email");
        }
        return Ok(cart);
    }

    diesel::insert_into(carts::table)
        .values(CreateCartEntity {
            customer_id: customer.id,
            email: customer.email.clone(),
            status: CART_ACTIVE.into(),
        })
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create cart")
}

/// The token's email when it should replace what the cart has stored.
fn email_to_capture<'a>(stored: Option<&str>, token: Option<&'a str>) -> Option<&'a str> {
    let token = token.map(str::trim).filter(|email| !email.is_empty())?;
    (stored != Some(token)).then_some(token)
}

pub async fn touch_cart(conn: &mut AsyncPgConnection, cart_id: i32) -> Result<CartEntity> {
    diesel::update(carts::table.find(cart_id))
        .set(carts::updated_at.eq(diesel::dsl::now))
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to update cart timestamp")
}

pub async fn load_lines(conn: &mut AsyncPgConnection, cart_id: i32) -> Result<Vec<CartLine>> {
    let rows: Vec<(CartItemEntity, VariantEntity, ProductEntity)> = cart_items::table
        .inner_join(product_variants::table.inner_join(products::table))
        .filter(cart_items::cart_id.eq(cart_id))
        .order_by(cart_items::created_at.asc())
        .select((
            CartItemEntity::as_select(),
            VariantEntity::as_select(),
            ProductEntity::as_select(),
        ))
        .load(conn)
        .await
        .context("Failed to get cart items")?;

    Ok(rows
        .into_iter()
        .map(|(item, variant, product)| CartLine {
            item,
            variant,
            product,
        })
        .collect())
}

pub async fn find_coupon(conn: &mut AsyncPgConnection, code: &str) -> Result<Option<CouponEntity>> {
    coupons::table
        .filter(coupons::code.eq(code))
        .select(CouponEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get coupon")
}

pub async fn price_cart(
    conn: &mut AsyncPgConnection,
    cart: &CartEntity,
    now: DateTime<Utc>,
) -> Result<PricedCart> {
    let lines = load_lines(conn, cart.id).await?;
    let promotions = catalog::live_promotions(conn, now).await?;

    let inputs: Vec<LineInput> = lines.iter().map(CartLine::to_input).collect();
    let priced = pricing::price_lines(&inputs, &promotions, now);
    let subtotal_cents = pricing::subtotal(&priced);

    let coupon = match &cart.coupon_code {
        Some(code) => match find_coupon(conn, code).await? {
            Some(coupon) => {
                let outcome = CouponRule::try_from(&coupon)
                    .and_then(|rule| rule.redeem(subtotal_cents, now));
                Some((coupon, outcome))
            }
            None => None,
        },
        None => None,
    };

    Ok(PricedCart {
        lines,
        priced,
        subtotal_cents,
        coupon,
    })
}

/// Cart as shown to the shopper; tax is unknown until a destination is given.
pub async fn cart_view(conn: &mut AsyncPgConnection, cart: CartEntity) -> Result<CartView> {
    let priced = price_cart(conn, &cart, Utc::now()).await?;
    let totals = pricing::totals(priced.subtotal_cents, priced.discount_cents(), 0);
    let coupon_error = priced.coupon_error();

    Ok(CartView {
        cart,
        lines: priced.priced,
        totals,
        coupon_error,
    })
}
