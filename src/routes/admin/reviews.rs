use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::reviews::ReviewStatus,
    models::ReviewEntity,
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::reviews,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/reviews",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_reviews))
            .routes(utoipa_axum::routes!(approve_review))
            .routes(utoipa_axum::routes!(reject_review))
            .routes(utoipa_axum::routes!(delete_review))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ReviewsQuery {
    /// Defaults to `PENDING`, the moderation queue.
    pub status: Option<ReviewStatus>,
}

async fn set_status(
    state: &AppState,
    id: i32,
    status: ReviewStatus,
) -> Result<ReviewEntity, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let review: ReviewEntity = diesel::update(reviews::table.find(id))
        .set((
            reviews::status.eq(status.as_str()),
            reviews::updated_at.eq(diesel::dsl::now),
        ))
        .returning(ReviewEntity::as_returning())
        .get_result(conn)
        .await?;
    Ok(review)
}

/// Fetch reviews in one moderation state, oldest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(ReviewsQuery),
    responses(
        (status = 200, description = "List reviews", body = StdResponse<Vec<ReviewEntity>, String>)
    )
)]
async fn get_reviews(
    Query(query): Query<ReviewsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let status = query.status.unwrap_or(ReviewStatus::Pending);
    let reviews: Vec<ReviewEntity> = reviews::table
        .filter(reviews::status.eq(status.as_str()))
        .order_by(reviews::created_at.asc())
        .select(ReviewEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get reviews")?;

    Ok(StdResponse {
        data: Some(reviews),
        message: Some("Get reviews successfully"),
    })
}

/// Publish a review on the product page.
#[utoipa::path(
    post,
    path = "/{id}/approve",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Review ID to approve")
    ),
    responses(
        (status = 200, description = "Review approved", body = StdResponse<ReviewEntity, String>),
        (status = 404, description = "Review not found")
    )
)]
async fn approve_review(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let review = set_status(&state, id, ReviewStatus::Approved).await?;

    Ok(StdResponse {
        data: Some(review),
        message: Some("Review approved"),
    })
}

/// Hide a review.
#[utoipa::path(
    post,
    path = "/{id}/reject",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Review ID to reject")
    ),
    responses(
        (status = 200, description = "Review rejected", body = StdResponse<ReviewEntity, String>),
        (status = 404, description = "Review not found")
    )
)]
async fn reject_review(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let review = set_status(&state, id, ReviewStatus::Rejected).await?;

    Ok(StdResponse {
        data: Some(review),
        message: Some("Review rejected"),
    })
}

/// Delete a review for good. The customer may then write a new one.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Review ID to delete")
    ),
    responses(
        (status = 200, description = "Review deleted", body = StdResponse<ReviewEntity, String>),
        (status = 404, description = "Review not found")
    )
)]
async fn delete_review(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let review: ReviewEntity = diesel::delete(reviews::table.find(id))
        .returning(ReviewEntity::as_returning())
        .get_result(conn)
        .await?;

    Ok(StdResponse {
        data: Some(review),
        message: Some("Review deleted"),
    })
}
