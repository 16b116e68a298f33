use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::money::BPS_SCALE,
    models::{CreatePromotionEntity, PromotionEntity, UpdatePromotionEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::promotions,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/promotions",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_promotions, create_promotion))
            .routes(utoipa_axum::routes!(update_promotion, delete_promotion))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

fn check_promotion(
    percent_off_bps: Option<i32>,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    if percent_off_bps.is_some_and(|bps| !(1..=BPS_SCALE as i32).contains(&bps)) {
        return Err(AppError::BadRequest(format!(
            "Discount must be between 1 and {BPS_SCALE} basis points"
        )));
    }
    if let (Some(starts_at), Some(ends_at)) = (starts_at, ends_at) {
        if ends_at <= starts_at {
            return Err(AppError::BadRequest(
                "Promotion must end after it starts".into(),
            ));
        }
    }
    Ok(())
}

/// Fetch every promotion, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List promotions", body = StdResponse<Vec<PromotionEntity>, String>)
    )
)]
async fn get_promotions(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let promotions: Vec<PromotionEntity> = promotions::table
        .order_by(promotions::starts_at.desc())
        .select(PromotionEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get promotions")?;

    Ok(StdResponse {
        data: Some(promotions),
        message: Some("Get promotions successfully"),
    })
}

/// Create a promotion for one product, one category, or the whole store
/// when neither is given.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreatePromotionEntity,
    responses(
        (status = 200, description = "Promotion created", body = StdResponse<PromotionEntity, String>),
        (status = 400, description = "Invalid discount or window")
    )
)]
async fn create_promotion(
    State(state): State<AppState>,
    Json(mut body): Json<CreatePromotionEntity>,
) -> Result<impl IntoResponse, AppError> {
    check_promotion(Some(body.percent_off_bps), Some(body.starts_at), body.ends_at)?;
    body.name = body.name.trim().to_string();
    if body.name.is_empty() {
        return Err(AppError::BadRequest("Name is required".into()));
    }
    body.category = body
        .category
        .map(|category| category.trim().to_string())
        .filter(|category| !category.is_empty());

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let promotion: PromotionEntity = diesel::insert_into(promotions::table)
        .values(&body)
        .returning(PromotionEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(promotion),
        message: Some("Promotion created successfully"),
    })
}

/// Update a promotion.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Promotion ID to update")
    ),
    request_body = UpdatePromotionEntity,
    responses(
        (status = 200, description = "Promotion updated", body = StdResponse<PromotionEntity, String>),
        (status = 404, description = "Promotion not found")
    )
)]
async fn update_promotion(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdatePromotionEntity>,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let current: PromotionEntity = promotions::table
        .find(id)
        .select(PromotionEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get promotion")?
        .ok_or(AppError::NotFound)?;
    check_promotion(
        body.percent_off_bps,
        Some(body.starts_at.unwrap_or(current.starts_at)),
        body.ends_at.or(current.ends_at),
    )?;

    let promotion: PromotionEntity = diesel::update(promotions::table.find(id))
        .set((&body, promotions::updated_at.eq(diesel::dsl::now)))
        .returning(PromotionEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(promotion),
        message: Some("Promotion updated successfully"),
    })
}

/// Delete a promotion.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Promotion ID to delete")
    ),
    responses(
        (status = 200, description = "Promotion deleted", body = StdResponse<PromotionEntity, String>),
        (status = 404, description = "Promotion not found")
    )
)]
async fn delete_promotion(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let promotion: PromotionEntity = diesel::delete(promotions::table.find(id))
        .returning(PromotionEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(promotion),
        message: Some("Promotion deleted successfully"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn discount_must_be_a_real_percentage() {
        assert!(check_promotion(Some(0), None, None).is_err());
        assert!(check_promotion(Some(2_500), None, None).is_ok());
        assert!(check_promotion(Some(10_001), None, None).is_err());
    }

    #[test]
    fn window_must_be_ordered() {
        let now = Utc::now();
        assert!(check_promotion(None, Some(now), Some(now - Duration::hours(1))).is_err());
        assert!(check_promotion(None, Some(now), Some(now + Duration::hours(1))).is_ok());
    }
}
