use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    api::payments::{self, ChargeObject, CheckoutSessionObject, WebhookEvent},
    domain::order_status::OrderStatus,
    models::OrderEntity,
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
    },
    schema::orders,
    services::{
        orders::{self as order_service, MaterializeOutcome},
        refunds as refund_service,
    },
};

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/webhooks",
        OpenApiRouter::new().routes(utoipa_axum::routes!(payment_webhook)),
    )
}

#[derive(Serialize, ToSchema, Debug)]
pub struct WebhookAck {
    pub event_id: String,
    pub handled: bool,
}

/// Receives payment processor events. Authenticated by the HMAC signature
/// header only; anything that fails verification is rejected before parsing.
#[utoipa::path(
    post,
    path = "/payments",
    tags = ["Webhooks"],
    request_body(content = String, content_type = "application/json"),
    params(
        ("Stripe-Signature" = String, Header, description = "t=<unix>,v1=<hex HMAC-SHA256>")
    ),
    responses(
        (status = 200, description = "Event acknowledged", body = StdResponse<WebhookAck, String>),
        (status = 400, description = "Malformed event"),
        (status = 401, description = "Signature verification failed")
    )
)]
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let config = &state.config.payments;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    payments::verify_signature(
        signature,
        &body,
        &config.webhook_secret,
        config.webhook_tolerance_secs,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        warn!("Rejected payment webhook: {}", e);
        AppError::Unauthorized
    })?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Malformed event: {e}")))?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let handled = match event.event_type.as_str() {
        "checkout.session.completed" => {
            let session: CheckoutSessionObject = parse_object(&event)?;
            let currency = state.config.store.currency.clone();
            let outcome = conn
                .transaction(move |conn| {
                    Box::pin(async move {
                        let outcome =
                            order_service::materialize_from_session(conn, &session, &currency)
                                .await?;
                        Ok::<MaterializeOutcome, AppError>(outcome)
                    })
                })
                .await?;
            match outcome {
                MaterializeOutcome::Created(order) => {
                    info!("Order #{} created from event {}", order.id, event.id)
                }
                MaterializeOutcome::AlreadyProcessed(order) => {
                    info!("Event {} replayed for order #{}", event.id, order.id)
                }
            }
            true
        }
        "checkout.session.async_payment_succeeded" => {
            let session: CheckoutSessionObject = parse_object(&event)?;
            settle_pending(conn, session.id, OrderStatus::Processing).await?
        }
        "checkout.session.async_payment_failed" => {
            let session: CheckoutSessionObject = parse_object(&event)?;
            settle_pending(conn, session.id, OrderStatus::Cancelled).await?
        }
        "charge.refunded" => {
            let charge: ChargeObject = parse_object(&event)?;
            reconcile_refunds(conn, charge).await?
        }
        other => {
            warn!("Ignoring payment event {} of type {}", event.id, other);
            false
        }
    };

    Ok(StdResponse {
        data: Some(WebhookAck {
            event_id: event.id,
            handled,
        }),
        message: Some("Event received"),
    })
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> Result<T, AppError> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        AppError::BadRequest(format!(
            "Malformed {} payload: {}",
            event.event_type, e
        ))
    })
}

/// Resolves a delayed payment. Only orders still waiting on payment move.
async fn settle_pending(
    conn: &mut AsyncPgConnection,
    session_id: String,
    next: OrderStatus,
) -> Result<bool, AppError> {
    conn.transaction(move |conn| {
        Box::pin(async move {
            let order: Option<OrderEntity> = orders::table
                .filter(orders::checkout_session_id.eq(&session_id))
                .select(OrderEntity::as_select())
                .for_update()
                .get_result(conn)
                .await
                .optional()
                .context("Failed to look up order by session")?;

            let Some(order) = order else {
                warn!("No order for checkout session {}", session_id);
                return Ok(false);
            };
            if order_service::parse_status(&order)? != OrderStatus::Pending {
                info!(
                    "Order #{} is already {}, skipping delayed payment update",
                    order.id, order.status
                );
                return Ok(false);
            }
            if next == OrderStatus::Processing {
                if let Some(reason) = &order.hold_reason {
                    warn!(
                        "Order #{} was paid but stays PENDING for review: {}",
                        order.id, reason
                    );
                    return Ok(false);
                }
            }

            order_service::change_status(conn, &order, next).await?;
            Ok::<bool, AppError>(true)
        })
    })
    .await
}

/// Applies the refunds listed on a refunded charge, once each.
async fn reconcile_refunds(
    conn: &mut AsyncPgConnection,
    charge: ChargeObject,
) -> Result<bool, AppError> {
    let charge_id = charge.id.clone();
    let applied = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let applied = refund_service::reconcile_charge(conn, &charge).await?;
                Ok::<usize, AppError>(applied)
            })
        })
        .await?;
    if applied > 0 {
        info!("Charge {} applied {} refund(s)", charge_id, applied);
    }
    Ok(applied > 0)
}
