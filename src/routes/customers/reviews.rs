use anyhow::{Context, Result};
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{
    ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper,
    result::DatabaseErrorKind,
};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::{
        order_status::OrderStatus,
        reviews::{self, ReviewStatus},
    },
    models::{CreateReviewEntity, ReviewEntity},
    platform::{
        aliases::DieselError,
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Customer},
    },
    schema::{order_items, orders, products, reviews as reviews_table},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/products",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(create_review))
            .route_layer(axum::middleware::from_fn(middleware::customer_authorization)),
    )
}

#[derive(Deserialize, ToSchema)]
pub struct CreateReviewReq {
    pub rating: i16,
    #[serde(default)]
    pub title: String,
    pub body: String,
}

/// Submit a review. It stays hidden until a moderator approves it.
#[utoipa::path(
    post,
    path = "/{product_id}/reviews",
    tags = ["Reviews"],
    security(("bearerAuth" = [])),
    params(
        ("product_id" = i32, Path, description = "Product to review")
    ),
    request_body = CreateReviewReq,
    responses(
        (status = 200, description = "Review submitted", body = StdResponse<ReviewEntity, String>),
        (status = 400, description = "Invalid rating, title or body"),
        (status = 404, description = "Product not found"),
        (status = 409, description = "Product already reviewed by this customer")
    )
)]
async fn create_review(
    Path(product_id): Path<i32>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
    Json(body): Json<CreateReviewReq>,
) -> Result<impl IntoResponse, AppError> {
    let draft = reviews::validate(body.rating, &body.title, &body.body)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    products::table
        .find(product_id)
        .filter(products::is_active.eq(true))
        .select(products::id)
        .first::<i32>(conn)
        .await
        .optional()
        .context("Failed to get product")?
        .ok_or(AppError::NotFound)?;

    let purchases: i64 = order_items::table
        .inner_join(orders::table)
        .filter(orders::customer_id.eq(customer.id))
        .filter(orders::status.ne(OrderStatus::Cancelled.as_str()))
        .filter(order_items::product_id.eq(product_id))
        .count()
        .get_result(conn)
        .await
        .context("Failed to check purchases")?;

    let review: ReviewEntity = diesel::insert_into(reviews_table::table)
        .values(CreateReviewEntity {
            product_id,
            customer_id: customer.id,
            rating: draft.rating,
            title: draft.title,
            body: draft.body,
            status: ReviewStatus::Pending.as_str().into(),
            verified_purchase: purchases > 0,
        })
        .returning(ReviewEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(|err| match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                AppError::Conflict("You have already reviewed this product".into())
            }
            other => other.into(),
        })?;

    Ok(StdResponse {
        data: Some(review),
        message: Some("Review submitted for moderation"),
    })
}
