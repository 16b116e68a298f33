use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    api::payments::CheckoutSessionObject,
    domain::{
        inventory::{self, CART_CONVERTED},
        order_status::{self, OrderStatus},
    },
    models::{
        CartEntity, CreateInventoryMovementEntity, CreateOrderEntity, CreateOrderItemEntity,
        OrderEntity, OrderItemEntity, RefundEntity,
    },
    notifications::{OrderEmailItem, OrderNotification},
    platform::{app_error::AppError, outbox},
    schema::{
        abandoned_carts, carts, coupons, inventory_movements, order_items, orders,
        product_variants, refunds,
    },
    services::carts as cart_service,
};

#[derive(Serialize, ToSchema, Debug)]
pub struct OrderDetails {
    pub order: OrderEntity,
    pub order_items: Vec<OrderItemEntity>,
    pub refunds: Vec<RefundEntity>,
}

#[derive(Debug)]
pub enum MaterializeOutcome {
    Created(OrderEntity),
    AlreadyProcessed(OrderEntity),
}

/// Metadata keys written at checkout and read back by the webhook.
pub mod metadata {
    pub const CART_ID: &str = "cart_id";
    pub const CUSTOMER_ID: &str = "customer_id";
    pub const EMAIL: &str = "email";
    pub const SUBTOTAL: &str = "subtotal_cents";
    pub const DISCOUNT: &str = "discount_cents";
    pub const TAX: &str = "tax_cents";
    pub const COUPON: &str = "coupon_code";
    pub const SHIPPING_ADDRESS: &str = "shipping_address";
}

pub fn parse_status(order: &OrderEntity) -> Result<OrderStatus> {
    order
        .status
        .parse::<OrderStatus>()
        .with_context(|| format!("Order #{} has an unknown status", order.id))
}

pub async fn load_items(
    conn: &mut AsyncPgConnection,
    order_ids: &[i32],
) -> Result<HashMap<i32, Vec<OrderItemEntity>>> {
    let items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq_any(order_ids))
        .order_by(order_items::id.asc())
        .select(OrderItemEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get order items")?;

    let mut group: HashMap<i32, Vec<OrderItemEntity>> = HashMap::new();
    for item in items {
        group.entry(item.order_id).or_default().push(item);
    }
    Ok(group)
}

pub async fn order_details(
    conn: &mut AsyncPgConnection,
    order: OrderEntity,
) -> Result<OrderDetails> {
    let order_items = load_items(conn, &[order.id])
        .await?
        .remove(&order.id)
        .unwrap_or_default();

    let refunds: Vec<RefundEntity> = refunds::table
        .filter(refunds::order_id.eq(order.id))
        .order_by(refunds::created_at.asc())
        .select(RefundEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get refunds")?;

    Ok(OrderDetails {
        order,
        order_items,
        refunds,
    })
}

/// Returns every item of the order to stock and records the movements.
pub async fn restock_order(conn: &mut AsyncPgConnection, order_id: i32, reason: &str) -> Result<()> {
    let items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .select(OrderItemEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get order items")?;

    for item in items {
        diesel::update(product_variants::table.find(item.variant_id))
            .set((
                product_variants::stock.eq(product_variants::stock + item.quantity),
                product_variants::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .await
            .context("Failed to restock variant")?;

        diesel::insert_into(inventory_movements::table)
            .values(CreateInventoryMovementEntity {
                variant_id: item.variant_id,
                delta: item.quantity,
                reason: reason.to_string(),
                order_id: Some(order_id),
            })
            .execute(conn)
            .await
            .context("Failed to record inventory movement")?;
    }

    Ok(())
}

/// Moves an order to `next` if the lifecycle allows it, restocking on cancel
/// and queueing the customer notification. The update is guarded on the
/// current status so concurrent changes cannot both win.
pub async fn change_status(
    conn: &mut AsyncPgConnection,
    order: &OrderEntity,
    next: OrderStatus,
) -> Result<OrderEntity> {
    let current = parse_status(order)?;
    order_status::transition(current, next).map_err(AppError::from)?;

    let updated: OrderEntity = diesel::update(
        orders::table
            .find(order.id)
            .filter(orders::status.eq(current.as_str())),
    )
    .set((
        orders::status.eq(next.as_str()),
        orders::hold_reason.eq(None::<String>),
        orders::updated_at.eq(diesel::dsl::now),
    ))
    .returning(OrderEntity::as_returning())
    .get_result(conn)
    .await
    .optional()
    .context("Failed to update order status")?
    .ok_or_else(|| AppError::Conflict("Order status changed concurrently".into()))?;

    if next.restocks() {
        restock_order(conn, updated.id, "order_cancelled").await?;
    }

    let notification = OrderNotification::StatusChanged {
        order_id: updated.id,
        email: updated.email.clone(),
        status: next,
    };
    outbox::publish(conn, notification.event_type().into(), &notification).await?;

    info!(
        "Order #{} moved from {} to {}",
        updated.id, current, next
    );
    Ok(updated)
}

fn metadata_i64(session: &CheckoutSessionObject, key: &str) -> Option<i64> {
    session.metadata.get(key).and_then(|v| v.parse().ok())
}

/// Compares the amounts the shopper checked out with what the cart prices to
/// now. The cart stays editable until payment completes, so a mismatch means
/// the order would not match what was paid for.
pub fn checkout_drift(
    session: &CheckoutSessionObject,
    subtotal_cents: i64,
    discount_cents: i64,
) -> Option<String> {
    let mut changes = Vec::new();
    if let Some(paid) =
        metadata_i64(session, metadata::SUBTOTAL).filter(|paid| *paid != subtotal_cents)
    {
        changes.push(format!("subtotal {paid} -> {subtotal_cents}"));
    }
    if let Some(paid) =
        metadata_i64(session, metadata::DISCOUNT).filter(|paid| *paid != discount_cents)
    {
        changes.push(format!("discount {paid} -> {discount_cents}"));
    }
    (!changes.is_empty())
        .then(|| format!("cart changed after checkout ({})", changes.join(", ")))
}

async fn lock_variant_stock(
    conn: &mut AsyncPgConnection,
    variant_ids: &[i32],
) -> Result<HashMap<i32, i32>> {
    let rows: Vec<(i32, i32)> = product_variants::table
        .filter(product_variants::id.eq_any(variant_ids))
        .order_by(product_variants::id.asc())
        .select((product_variants::id, product_variants::stock))
        .for_update()
        .load(conn)
        .await
        .context("Failed to lock variant stock")?;
    Ok(rows.into_iter().collect())
}

/// Turns a completed checkout session into an order. Replays of the same
/// session return the existing order untouched. Must run inside a transaction.
pub async fn materialize_from_session(
    conn: &mut AsyncPgConnection,
    session: &CheckoutSessionObject,
    default_currency: &str,
) -> Result<MaterializeOutcome> {
    let existing: Option<OrderEntity> = orders::table
        .filter(orders::checkout_session_id.eq(&session.id))
        .select(OrderEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to look up order by session")?;
    if let Some(order) = existing {
        return Ok(MaterializeOutcome::AlreadyProcessed(order));
    }

    let cart_id: i32 = session
        .metadata
        .get(metadata::CART_ID)
        .or(session.client_reference_id.as_ref())
        .and_then(|raw| raw.parse().ok())
        .with_context(|| format!("Checkout session {} carries no cart id", session.id))?;

    let cart: CartEntity = carts::table
        .find(cart_id)
        .select(CartEntity::as_select())
        .for_update()
        .get_result(conn)
        .await
        .with_context(|| format!("Cart #{cart_id} not found"))?;

    let cart_pricing = cart_service::price_cart(conn, &cart, Utc::now()).await?;
    if cart_pricing.lines.is_empty() {
        anyhow::bail!("Cart #{} has no items to order", cart.id);
    }

    let subtotal_cents = cart_pricing.subtotal_cents;
    // A coupon that lapsed after checkout keeps the discount the customer paid.
    let discount_cents = match &cart_pricing.coupon {
        Some((_, Ok(discount))) => *discount,
        _ => metadata_i64(session, metadata::DISCOUNT).unwrap_or(0),
    }
    .clamp(0, subtotal_cents.max(0));
    let tax_cents = metadata_i64(session, metadata::TAX).unwrap_or(0);
    let total_cents = session
        .amount_total
        .unwrap_or(subtotal_cents - discount_cents + tax_cents);

    let email = session
        .customer_details
        .as_ref()
        .and_then(|details| details.email.clone())
        .or_else(|| session.metadata.get(metadata::EMAIL).cloned())
        .or_else(|| cart.email.clone())
        .unwrap_or_default();

    let shipping_address: Value = session
        .metadata
        .get(metadata::SHIPPING_ADDRESS)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);

    let coupon_code = session
        .metadata
        .get(metadata::COUPON)
        .filter(|code| !code.is_empty())
        .cloned()
        .or_else(|| cart.coupon_code.clone());

    let hold_reason = checkout_drift(session, subtotal_cents, discount_cents);
    if let Some(reason) = &hold_reason {
        warn!(
            "Cart #{} changed after checkout session {}: {}",
            cart.id, session.id, reason
        );
    }
    let status = if session.payment_status == "paid" && hold_reason.is_none() {
        OrderStatus::Processing
    } else {
        OrderStatus::Pending
    };

    let order: OrderEntity = diesel::insert_into(orders::table)
        .values(CreateOrderEntity {
            customer_id: cart.customer_id,
            cart_id: cart.id,
            email: email.clone(),
            status: status.as_str().into(),
            currency: session
                .currency
                .clone()
                .unwrap_or_else(|| default_currency.to_string()),
            subtotal_cents,
            discount_cents,
            tax_cents,
            total_cents,
            coupon_code: coupon_code.clone(),
            checkout_session_id: session.id.clone(),
            payment_intent_id: session.payment_intent.clone(),
            shipping_address,
            hold_reason,
        })
        .returning(OrderEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to create order")?;

    let new_items: Vec<CreateOrderItemEntity> = cart_pricing
        .priced
        .iter()
        .map(|line| CreateOrderItemEntity {
            order_id: order.id,
            product_id: line.product_id,
            variant_id: line.variant_id,
            product_name: line.product_name.clone(),
            variant_name: line.variant_name.clone(),
            sku: line.sku.clone(),
            unit_price_cents: line.unit_price_cents,
            quantity: line.quantity,
            line_total_cents: line.line_total_cents,
        })
        .collect();
    diesel::insert_into(order_items::table)
        .values(&new_items)
        .execute(conn)
        .await
        .context("Failed to create order items")?;

    let variant_ids: Vec<i32> = cart_pricing
        .lines
        .iter()
        .map(|line| line.variant.id)
        .collect();
    let locked = lock_variant_stock(conn, &variant_ids).await?;
    let sku_of: HashMap<i32, &str> = cart_pricing
        .lines
        .iter()
        .map(|line| (line.variant.id, line.variant.sku.as_str()))
        .collect();
    let wanted: Vec<(i32, i32)> = cart_pricing
        .lines
        .iter()
        .map(|line| (line.variant.id, line.item.quantity))
        .collect();

    for change in inventory::plan_fulfilment(&locked, &wanted) {
        if change.oversold > 0 {
            warn!(
                "Order #{} oversold {} unit(s) of {}",
                order.id,
                change.oversold,
                sku_of.get(&change.variant_id).copied().unwrap_or_default()
            );
        }
        diesel::update(product_variants::table.find(change.variant_id))
            .set((
                product_variants::stock.eq(change.stock_after),
                product_variants::updated_at.eq(diesel::dsl::now),
            ))
            .execute(conn)
            .await
            .context("Failed to decrement stock")?;

        diesel::insert_into(inventory_movements::table)
            .values(CreateInventoryMovementEntity {
                variant_id: change.variant_id,
                delta: change.delta,
                reason: "order_placed".into(),
                order_id: Some(order.id),
            })
            .execute(conn)
            .await
            .context("Failed to record inventory movement")?;
    }

    if let Some(code) = &coupon_code {
        diesel::update(coupons::table.filter(coupons::code.eq(code)))
            .set(coupons::redemption_count.eq(coupons::redemption_count + 1))
            .execute(conn)
            .await
            .context("Failed to redeem coupon")?;
    }

    diesel::update(carts::table.find(cart.id))
        .set((
            carts::status.eq(CART_CONVERTED),
            carts::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await
        .context("Failed to convert cart")?;

    diesel::update(
        abandoned_carts::table
            .filter(abandoned_carts::cart_id.eq(cart.id))
            .filter(abandoned_carts::recovered_at.is_null()),
    )
    .set(abandoned_carts::recovered_at.eq(diesel::dsl::now))
    .execute(conn)
    .await
    .context("Failed to mark abandoned cart as recovered")?;

    let notification = OrderNotification::Confirmed {
        order_id: order.id,
        email,
        currency: order.currency.clone(),
        items: cart_pricing
            .priced
            .iter()
            .map(|line| OrderEmailItem {
                name: format!("{} ({})", line.product_name, line.variant_name),
                quantity: line.quantity,
                line_total_cents: line.line_total_cents,
            })
            .collect(),
        subtotal_cents,
        discount_cents,
        tax_cents,
        total_cents,
    };
    outbox::publish(conn, notification.event_type().into(), &notification).await?;

    info!(
        "Order #{} created from checkout session {} ({})",
        order.id, session.id, order.status
    );
    Ok(MaterializeOutcome::Created(order))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(subtotal: Option<&str>, discount: Option<&str>) -> CheckoutSessionObject {
        let mut metadata = HashMap::from([(metadata::CART_ID.to_string(), "7".to_string())]);
        if let Some(value) = subtotal {
            metadata.insert(metadata::SUBTOTAL.into(), value.into());
        }
        if let Some(value) = discount {
            metadata.insert(metadata::DISCOUNT.into(), value.into());
        }
        CheckoutSessionObject {
            id: "cs_test_1".into(),
            payment_intent: Some("pi_1".into()),
            payment_status: "paid".into(),
            amount_total: Some(4500),
            currency: Some("usd".into()),
            client_reference_id: Some("7".into()),
            customer_details: None,
            metadata,
        }
    }

    #[test]
    fn unchanged_cart_has_no_drift() {
        assert_eq!(checkout_drift(&session(Some("5000"), Some("500")), 5000, 500), None);
    }

    #[test]
    fn items_added_after_checkout_are_flagged() {
        let reason = checkout_drift(&session(Some("5000"), Some("500")), 8000, 800).unwrap();
        assert!(reason.contains("subtotal 5000 -> 8000"), "{reason}");
        assert!(reason.contains("discount 500 -> 800"), "{reason}");
    }

    #[test]
    fn sessions_without_amounts_are_trusted() {
        assert_eq!(checkout_drift(&session(None, None), 8000, 0), None);
        assert_eq!(
            checkout_drift(&session(Some("not a number"), None), 8000, 0),
            None
        );
    }
}
