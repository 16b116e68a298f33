use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, pg::Pg};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::{order_status::OrderStatus, refunds::REFUND_FAILED},
    models::OrderEntity,
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::orders,
    services::{
        orders::{self as order_service, OrderDetails},
        refunds::{self as refund_service, RefundRequest, RefundRes, Reservation},
    },
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_orders))
            .routes(utoipa_axum::routes!(get_order))
            .routes(utoipa_axum::routes!(update_order_status))
            .routes(utoipa_axum::routes!(refund_order))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrdersQuery {
    pub status: Option<OrderStatus>,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateStatusReq {
    pub status: OrderStatus,
}

#[derive(Deserialize, ToSchema)]
pub struct RefundReq {
    /// Defaults to the remaining refundable balance.
    pub amount_cents: Option<i64>,
    pub reason: String,
    #[serde(default)]
    pub restock: bool,
}

async fn find_order(conn: &mut AsyncPgConnection, id: i32) -> Result<OrderEntity, AppError> {
    orders::table
        .find(id)
        .select(OrderEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get order")?
        .ok_or(AppError::NotFound)
}

/// Fetch all orders, optionally only those in one status.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(OrdersQuery),
    responses(
        (status = 200, description = "List all orders", body = StdResponse<Vec<OrderEntity>, String>)
    )
)]
async fn get_orders(
    Query(query): Query<OrdersQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let mut statement: orders::BoxedQuery<'_, Pg> = orders::table.into_boxed();
    if let Some(status) = query.status {
        statement = statement.filter(orders::status.eq(status.as_str()));
    }
    let orders: Vec<OrderEntity> = statement
        .order_by(orders::created_at.desc())
        .select(OrderEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get orders")?;

    Ok(StdResponse {
        data: Some(orders),
        message: Some("Get orders successfully"),
    })
}

/// Fetch an order with its items and refunds.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to fetch")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<OrderDetails, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = find_order(conn, id).await?;
    let details = order_service::order_details(conn, order).await?;

    Ok(StdResponse {
        data: Some(details),
        message: Some("Get order successfully"),
    })
}

/// Move an order along its lifecycle. Cancelling puts the items back in stock.
#[utoipa::path(
    patch,
    path = "/{id}/status",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to update")
    ),
    request_body = UpdateStatusReq,
    responses(
        (status = 200, description = "Order status updated", body = StdResponse<OrderEntity, String>),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Transition not allowed")
    )
)]
async fn update_order_status(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateStatusReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.status == OrderStatus::Refunded {
        return Err(AppError::BadRequest(
            "Use the refund endpoint to refund an order".into(),
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let updated_order = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let order = find_order(conn, id).await?;
                let updated = order_service::change_status(conn, &order, body.status).await?;
                Ok::<OrderEntity, AppError>(updated)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(updated_order),
        message: Some("Order status updated successfully"),
    })
}

/// Refund part or all of an order through the payment processor.
#[utoipa::path(
    post,
    path = "/{id}/refunds",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to refund")
    ),
    request_body = RefundReq,
    responses(
        (status = 200, description = "Refund issued", body = StdResponse<RefundRes, String>),
        (status = 400, description = "Invalid amount"),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order cannot be refunded, or the processor declined"),
        (status = 502, description = "Payment processor unreachable")
    )
)]
async fn refund_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<RefundReq>,
) -> Result<impl IntoResponse, AppError> {
    let reason = body.reason.trim().to_string();
    if reason.is_empty() {
        return Err(AppError::BadRequest("A refund reason is required".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let request = RefundRequest {
        amount_cents: body.amount_cents,
        reason,
        restock: body.restock,
    };
    let reservation = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let reservation = refund_service::reserve(conn, id, request).await?;
                Ok::<Reservation, AppError>(reservation)
            })
        })
        .await?;
    let refund_id = reservation.refund.id;

    let provider_refund = match state
        .payments()
        .create_refund(
            &reservation.payment_intent_id,
            reservation.refund.amount_cents,
            &reservation.refund.reason,
            id,
            refund_id,
        )
        .await
    {
        Ok(provider_refund) => provider_refund,
        Err(e) => {
            if let Err(release_err) = refund_service::release(conn, refund_id).await {
                tracing::error!("Failed to release refund {}: {}", refund_id, release_err);
            }
            return Err(e.into());
        }
    };

    let res = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let finalized = refund_service::finalize(
                    conn,
                    refund_id,
                    &provider_refund.id,
                    &provider_refund.status,
                )
                .await?;
                // Already confirmed by the webhook, or declined.
                let res = match finalized {
                    Some(res) => res,
                    None => refund_service::current(conn, refund_id).await?,
                };
                Ok::<RefundRes, AppError>(res)
            })
        })
        .await?;

    if res.refund.status == REFUND_FAILED {
        return Err(AppError::Conflict(
            "Payment processor declined the refund".into(),
        ));
    }

    Ok(StdResponse {
        data: Some(res),
        message: Some("Refund issued successfully"),
    })
}
