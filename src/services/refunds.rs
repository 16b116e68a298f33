//! Refund bookkeeping.
//!
//! An admin refund is reserved as a `pending` row before the processor is
//! called, so the amount counts against the refundable balance while the
//! request is in flight. The row is finalized by whichever arrives first:
//! the processor's reply or the `charge.refunded` webhook, which finds it
//! through the `refund_id` metadata. Order totals move only on finalize.

use anyhow::Context;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    api::payments::ChargeObject,
    domain::{
        order_status::OrderStatus,
        refunds::{self, REFUND_FAILED, REFUND_PENDING, REFUND_SUCCEEDED},
    },
    models::{CreateRefundEntity, OrderEntity, RefundEntity},
    notifications::OrderNotification,
    platform::{app_error::AppError, outbox},
    schema::{orders, refunds as refunds_table},
    services::orders as order_service,
};

pub const EXTERNAL_REFUND_REASON: &str = "Refunded by payment processor";

#[derive(Serialize, ToSchema, Debug)]
pub struct RefundRes {
    pub order: OrderEntity,
    pub refund: RefundEntity,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    /// `None` refunds the remaining balance.
    pub amount_cents: Option<i64>,
    pub reason: String,
    pub restock: bool,
}

/// A refund row held against an order, ready to send to the processor.
#[derive(Debug)]
pub struct Reservation {
    pub refund: RefundEntity,
    pub payment_intent_id: String,
}

pub async fn lock_order(conn: &mut AsyncPgConnection, id: i32) -> Result<OrderEntity, AppError> {
    orders::table
        .find(id)
        .select(OrderEntity::as_select())
        .for_update()
        .get_result(conn)
        .await
        .optional()
        .context("Failed to get order")?
        .ok_or(AppError::NotFound)
}

/// Sum of refunds sent to the processor but not yet confirmed.
async fn in_flight_cents(conn: &mut AsyncPgConnection, order_id: i32) -> Result<i64, AppError> {
    let amounts: Vec<i64> = refunds_table::table
        .filter(refunds_table::order_id.eq(order_id))
        .filter(refunds_table::status.eq(REFUND_PENDING))
        .select(refunds_table::amount_cents)
        .load(conn)
        .await
        .context("Failed to get pending refunds")?;
    Ok(amounts.iter().sum())
}

/// Reserves a refund for the order. Must run inside a transaction.
pub async fn reserve(
    conn: &mut AsyncPgConnection,
    order_id: i32,
    request: RefundRequest,
) -> Result<Reservation, AppError> {
    let order = lock_order(conn, order_id).await?;
    let status = order_service::parse_status(&order)?;
    let in_flight = in_flight_cents(conn, order.id).await?;
    let plan = refunds::plan_refund(
        status,
        order.total_cents,
        order.refunded_cents + in_flight,
        request.amount_cents,
    )?;
    let payment_intent_id = order.payment_intent_id.clone().ok_or_else(|| {
        AppError::Conflict("Order has no captured payment to refund".into())
    })?;

    if request.restock {
        let already_restocked: i64 = refunds_table::table
            .filter(refunds_table::order_id.eq(order.id))
            .filter(refunds_table::restocked.eq(true))
            .filter(refunds_table::status.ne(REFUND_FAILED))
            .count()
            .get_result(conn)
            .await
            .context("Failed to get refunds")?;
        if already_restocked > 0 {
            return Err(AppError::Conflict("Order items were already restocked".into()));
        }
    }

    let refund: RefundEntity = diesel::insert_into(refunds_table::table)
        .values(CreateRefundEntity {
            order_id: order.id,
            amount_cents: plan.amount_cents,
            reason: request.reason,
            provider_ref: None,
            status: REFUND_PENDING.into(),
            restocked: request.restock,
        })
        .returning(RefundEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(Reservation {
        refund,
        payment_intent_id,
    })
}

/// Gives the reserved amount back when the processor call failed. A refund
/// that went through anyway is still picked up by the webhook.
pub async fn release(conn: &mut AsyncPgConnection, refund_id: Uuid) -> Result<(), AppError> {
    diesel::update(
        refunds_table::table
            .find(refund_id)
            .filter(refunds_table::status.eq(REFUND_PENDING)),
    )
    .set(refunds_table::status.eq(REFUND_FAILED))
    .execute(conn)
    .await
    .context("Failed to release refund")?;
    Ok(())
}

/// Confirms a reserved refund and applies it to the order. Returns `None`
/// when the refund was already confirmed or the processor declined it.
/// Must run inside a transaction.
pub async fn finalize(
    conn: &mut AsyncPgConnection,
    refund_id: Uuid,
    provider_ref: &str,
    provider_status: &str,
) -> Result<Option<RefundRes>, AppError> {
    let order_id: i32 = refunds_table::table
        .find(refund_id)
        .select(refunds_table::order_id)
        .first(conn)
        .await
        .optional()
        .context("Failed to get refund")?
        .ok_or(AppError::NotFound)?;

    // Order before refund, the same order every other refund path locks in.
    let order = lock_order(conn, order_id).await?;
    let refund: RefundEntity = refunds_table::table
        .find(refund_id)
        .select(RefundEntity::as_select())
        .for_update()
        .get_result(conn)
        .await
        .context("Failed to lock refund")?;

    if refund.status == REFUND_SUCCEEDED {
        return Ok(None);
    }

    let declined = refunds::provider_declined(provider_status);
    let refund: RefundEntity = diesel::update(refunds_table::table.find(refund.id))
        .set((
            refunds_table::status.eq(if declined { REFUND_FAILED } else { REFUND_SUCCEEDED }),
            refunds_table::provider_ref.eq(Some(provider_ref)),
        ))
        .returning(RefundEntity::as_returning())
        .get_result(conn)
        .await?;

    if declined {
        warn!(
            "Refund {} for order #{} was declined by the processor ({})",
            refund.id, order.id, provider_status
        );
        return Ok(None);
    }

    let order = apply_to_order(conn, &order, &refund).await?;
    Ok(Some(RefundRes { order, refund }))
}

/// The refund and its order as currently stored.
pub async fn current(conn: &mut AsyncPgConnection, refund_id: Uuid) -> Result<RefundRes, AppError> {
    let refund: RefundEntity = refunds_table::table
        .find(refund_id)
        .select(RefundEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get refund")?
        .ok_or(AppError::NotFound)?;
    let order: OrderEntity = orders::table
        .find(refund.order_id)
        .select(OrderEntity::as_select())
        .first(conn)
        .await
        .context("Failed to get order")?;
    Ok(RefundRes { order, refund })
}

/// Moves the confirmed amount onto a locked order, restocks if the refund
/// asked for it and queues the customer email.
async fn apply_to_order(
    conn: &mut AsyncPgConnection,
    order: &OrderEntity,
    refund: &RefundEntity,
) -> Result<OrderEntity, AppError> {
    let status = order_service::parse_status(order)?;
    let plan = refunds::settle(
        status,
        order.total_cents,
        order.refunded_cents,
        refund.amount_cents,
    );

    let updated: OrderEntity = diesel::update(orders::table.find(order.id))
        .set((
            orders::refunded_cents.eq(plan.refunded_after_cents),
            orders::status.eq(plan.status_after.as_str()),
            orders::updated_at.eq(diesel::dsl::now),
        ))
        .returning(OrderEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to update order refund totals")?;

    if refund.restocked {
        order_service::restock_order(conn, order.id, "refund_restock").await?;
    }

    let notification = OrderNotification::Refunded {
        order_id: updated.id,
        email: updated.email.clone(),
        currency: updated.currency.clone(),
        amount_cents: refund.amount_cents,
        fully_refunded: plan.status_after == OrderStatus::Refunded,
    };
    outbox::publish(conn, notification.event_type().into(), &notification).await?;

    info!(
        "Order #{} refunded {} cents ({} of {})",
        updated.id, refund.amount_cents, updated.refunded_cents, updated.total_cents
    );
    Ok(updated)
}

/// Records money returned outside the admin API, e.g. from the processor
/// dashboard. Amounts that do not fit the order's balance are logged and skipped.
async fn record_external(
    conn: &mut AsyncPgConnection,
    order_id: i32,
    amount_cents: i64,
    provider_ref: Option<String>,
) -> Result<Option<RefundRes>, AppError> {
    let order = lock_order(conn, order_id).await?;
    let status = order_service::parse_status(&order)?;
    let in_flight = in_flight_cents(conn, order.id).await?;
    if let Err(e) = refunds::plan_refund(
        status,
        order.total_cents,
        order.refunded_cents + in_flight,
        Some(amount_cents),
    ) {
        warn!("Cannot record refund for order #{}: {}", order.id, e);
        return Ok(None);
    }

    let refund: RefundEntity = diesel::insert_into(refunds_table::table)
        .values(CreateRefundEntity {
            order_id: order.id,
            amount_cents,
            reason: EXTERNAL_REFUND_REASON.into(),
            provider_ref,
            status: REFUND_SUCCEEDED.into(),
            restocked: false,
        })
        .returning(RefundEntity::as_returning())
        .get_result(conn)
        .await?;

    let order = apply_to_order(conn, &order, &refund).await?;
    Ok(Some(RefundRes { order, refund }))
}

async fn provider_ref_known(conn: &mut AsyncPgConnection, provider_ref: &str) -> Result<bool, AppError> {
    let known: i64 = refunds_table::table
        .filter(refunds_table::provider_ref.eq(provider_ref))
        .count()
        .get_result(conn)
        .await
        .context("Failed to look up refund by provider reference")?;
    Ok(known > 0)
}

/// Brings the order in line with a `charge.refunded` event. Each refund on
/// the charge is matched to a reserved row by its `refund_id` metadata, or
/// skipped if its processor id is already recorded; anything else is an
/// external refund. Charges sent without their refund list fall back to the
/// cumulative amount. Returns how many refunds were applied.
/// Must run inside a transaction.
pub async fn reconcile_charge(
    conn: &mut AsyncPgConnection,
    charge: &ChargeObject,
) -> Result<usize, AppError> {
    let Some(payment_intent) = charge.payment_intent.as_deref() else {
        warn!("Refunded charge {} has no payment intent", charge.id);
        return Ok(0);
    };

    let order: Option<OrderEntity> = orders::table
        .filter(orders::payment_intent_id.eq(payment_intent))
        .select(OrderEntity::as_select())
        .for_update()
        .get_result(conn)
        .await
        .optional()
        .context("Failed to look up order by payment intent")?;
    let Some(order) = order else {
        warn!("No order for payment intent {}", payment_intent);
        return Ok(0);
    };

    let listed = charge.refund_list();
    if listed.is_empty() {
        let in_flight = in_flight_cents(conn, order.id).await?;
        let delta = charge.amount_refunded - order.refunded_cents - in_flight;
        if delta <= 0 {
            return Ok(0);
        }
        let applied = record_external(conn, order.id, delta, None).await?;
        return Ok(usize::from(applied.is_some()));
    }

    let mut applied = 0;
    // The processor lists the newest refund first.
    for listed_refund in listed.iter().rev() {
        let provider_status = listed_refund.status.as_deref().unwrap_or(REFUND_SUCCEEDED);
        if refunds::provider_declined(provider_status) {
            continue;
        }

        let reserved: Option<Uuid> = match listed_refund.local_refund_id() {
            Some(local_id) => refunds_table::table
                .find(local_id)
                .filter(refunds_table::order_id.eq(order.id))
                .select(refunds_table::id)
                .first(conn)
                .await
                .optional()
                .context("Failed to get refund")?,
            None => None,
        };

        if let Some(refund_id) = reserved {
            if finalize(conn, refund_id, &listed_refund.id, provider_status)
                .await?
                .is_some()
            {
                applied += 1;
            }
            continue;
        }

        if provider_ref_known(conn, &listed_refund.id).await? {
            continue;
        }
        if record_external(conn, order.id, listed_refund.amount, Some(listed_refund.id.clone()))
            .await?
            .is_some()
        {
            applied += 1;
        }
    }

    Ok(applied)
}
