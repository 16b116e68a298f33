use anyhow::{Context, Result};
use axum::{
    Extension,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::order_status::OrderStatus,
    models::{OrderEntity, OrderItemEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Customer},
    },
    schema::orders,
    services::orders::{self as order_service, OrderDetails},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_my_orders))
            .routes(utoipa_axum::routes!(get_my_order))
            .routes(utoipa_axum::routes!(cancel_my_order))
            .route_layer(axum::middleware::from_fn(middleware::customer_authorization)),
    )
}

#[derive(Serialize, ToSchema)]
pub struct OrderWithItems {
    pub order: OrderEntity,
    pub order_items: Vec<OrderItemEntity>,
}

async fn find_own_order(
    conn: &mut AsyncPgConnection,
    id: i32,
    customer: &Customer,
) -> Result<OrderEntity, AppError> {
    orders::table
        .find(id)
        .filter(orders::customer_id.eq(customer.id))
        .select(OrderEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get order")?
        .ok_or(AppError::NotFound)
}

/// Fetch all orders belonging to the authenticated customer, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List my orders", body = StdResponse<Vec<OrderWithItems>, String>)
    )
)]
async fn get_my_orders(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let orders: Vec<OrderEntity> = orders::table
        .filter(orders::customer_id.eq(customer.id))
        .order_by(orders::created_at.desc())
        .select(OrderEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get my orders")?;

    let order_ids: Vec<i32> = orders.iter().map(|order| order.id).collect();
    let mut group = order_service::load_items(conn, &order_ids).await?;

    let order_with_items: Vec<OrderWithItems> = orders
        .into_iter()
        .map(|order| OrderWithItems {
            order_items: group.remove(&order.id).unwrap_or_default(),
            order,
        })
        .collect();

    Ok(StdResponse {
        data: Some(order_with_items),
        message: Some("Get my orders successfully"),
    })
}

/// Fetch one of my orders with its items and refunds.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to fetch")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<OrderDetails, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_my_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = find_own_order(conn, id, &customer).await?;
    let details = order_service::order_details(conn, order).await?;

    Ok(StdResponse {
        data: Some(details),
        message: Some("Get order successfully"),
    })
}

/// Cancel an order that is still waiting for payment. Items go back to stock.
#[utoipa::path(
    post,
    path = "/{id}/cancel",
    tags = ["Orders"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to cancel")
    ),
    responses(
        (status = 200, description = "Order cancelled", body = StdResponse<OrderEntity, String>),
        (status = 404, description = "Order not found"),
        (status = 409, description = "Order is past the pending stage")
    )
)]
async fn cancel_my_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let updated_order = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let order = find_own_order(conn, id, &customer).await?;
                if order_service::parse_status(&order)? != OrderStatus::Pending {
                    return Err(AppError::Conflict(
                        "Only pending orders can be cancelled".into(),
                    ));
                }
                if order.hold_reason.is_some() {
                    return Err(AppError::Conflict(
                        "Order is being reviewed by the store".into(),
                    ));
                }
                let updated = order_service::change_status(conn, &order, OrderStatus::Cancelled)
                    .await?;
                Ok::<OrderEntity, AppError>(updated)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(updated_order),
        message: Some("Order cancelled successfully"),
    })
}
