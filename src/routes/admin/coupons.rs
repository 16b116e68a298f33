use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::coupons::{self, CouponKind},
    models::{CouponEntity, CreateCouponEntity, UpdateCouponEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::coupons as coupons_table,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/coupons",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_coupons, create_coupon))
            .routes(utoipa_axum::routes!(update_coupon, deactivate_coupon))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct CreateCouponReq {
    pub code: String,
    /// `PERCENT` (value in basis points) or `FIXED` (value in cents).
    pub kind: String,
    pub value: i64,
    #[serde(default)]
    pub min_subtotal_cents: i64,
    pub max_redemptions: Option<i32>,
    pub starts_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn check_limits(
    min_subtotal_cents: Option<i64>,
    max_redemptions: Option<i32>,
    starts_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    if min_subtotal_cents.is_some_and(|min| min < 0) {
        return Err(AppError::BadRequest(
            "Minimum subtotal cannot be negative".into(),
        ));
    }
    if max_redemptions.is_some_and(|max| max < 1) {
        return Err(AppError::BadRequest(
            "Maximum redemptions must be at least 1".into(),
        ));
    }
    if let (Some(starts_at), Some(expires_at)) = (starts_at, expires_at) {
        if expires_at <= starts_at {
            return Err(AppError::BadRequest(
                "Coupon must expire after it starts".into(),
            ));
        }
    }
    Ok(())
}

impl CreateCouponReq {
    fn into_entity(self) -> Result<CreateCouponEntity, AppError> {
        let code = coupons::normalize_code(&self.code)?;
        let kind = CouponKind::parse(&self.kind)?;
        coupons::validate_definition(kind, self.value)?;
        check_limits(
            Some(self.min_subtotal_cents),
            self.max_redemptions,
            self.starts_at,
            self.expires_at,
        )?;

        Ok(CreateCouponEntity {
            code,
            kind: kind.as_str().into(),
            value: self.value,
            min_subtotal_cents: self.min_subtotal_cents,
            max_redemptions: self.max_redemptions,
            starts_at: self.starts_at,
            expires_at: self.expires_at,
        })
    }
}

/// Fetch every coupon, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List coupons", body = StdResponse<Vec<CouponEntity>, String>)
    )
)]
async fn get_coupons(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let coupons: Vec<CouponEntity> = coupons_table::table
        .order_by(coupons_table::created_at.desc())
        .select(CouponEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get coupons")?;

    Ok(StdResponse {
        data: Some(coupons),
        message: Some("Get coupons successfully"),
    })
}

/// Create a coupon. Codes are stored upper-case.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateCouponReq,
    responses(
        (status = 200, description = "Coupon created", body = StdResponse<CouponEntity, String>),
        (status = 400, description = "Invalid coupon definition"),
        (status = 409, description = "Code already taken")
    )
)]
async fn create_coupon(
    State(state): State<AppState>,
    Json(body): Json<CreateCouponReq>,
) -> Result<impl IntoResponse, AppError> {
    let new_coupon = body.into_entity()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let coupon: CouponEntity = diesel::insert_into(coupons_table::table)
        .values(new_coupon)
        .returning(CouponEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(coupon),
        message: Some("Coupon created successfully"),
    })
}

/// Update a coupon. The code and kind are fixed once created.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Coupon ID to update")
    ),
    request_body = UpdateCouponEntity,
    responses(
        (status = 200, description = "Coupon updated", body = StdResponse<CouponEntity, String>),
        (status = 404, description = "Coupon not found")
    )
)]
async fn update_coupon(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateCouponEntity>,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let current: CouponEntity = coupons_table::table
        .find(id)
        .select(CouponEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get coupon")?
        .ok_or(AppError::NotFound)?;

    if let Some(value) = body.value {
        coupons::validate_definition(CouponKind::parse(&current.kind)?, value)?;
    }
    check_limits(
        body.min_subtotal_cents,
        body.max_redemptions,
        body.starts_at.or(current.starts_at),
        body.expires_at.or(current.expires_at),
    )?;

    let coupon: CouponEntity = diesel::update(coupons_table::table.find(id))
        .set((&body, coupons_table::updated_at.eq(diesel::dsl::now)))
        .returning(CouponEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(coupon),
        message: Some("Coupon updated successfully"),
    })
}

/// Switch a coupon off. Carts holding it lose the discount at checkout.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Coupon ID to deactivate")
    ),
    responses(
        (status = 200, description = "Coupon deactivated", body = StdResponse<CouponEntity, String>),
        (status = 404, description = "Coupon not found")
    )
)]
async fn deactivate_coupon(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let coupon: CouponEntity = diesel::update(coupons_table::table.find(id))
        .set((
            coupons_table::is_active.eq(false),
            coupons_table::updated_at.eq(diesel::dsl::now),
        ))
        .returning(CouponEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(coupon),
        message: Some("Coupon deactivated successfully"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn req(kind: &str, value: i64) -> CreateCouponReq {
        CreateCouponReq {
            code: " spring-10 ".into(),
            kind: kind.into(),
            value,
            min_subtotal_cents: 0,
            max_redemptions: None,
            starts_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn builds_a_normalized_coupon() {
        let coupon = req("percent", 1000).into_entity().unwrap();
        assert_eq!(coupon.code, "SPRING-10");
        assert_eq!(coupon.kind, "PERCENT");
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(req("PERCENT", 10_001).into_entity().is_err());
        assert!(req("FIXED", 0).into_entity().is_err());
        assert!(req("BOGO", 1).into_entity().is_err());
    }

    #[test]
    fn rejects_inverted_windows() {
        let now = Utc::now();
        let mut body = req("FIXED", 500);
        body.starts_at = Some(now);
        body.expires_at = Some(now - Duration::days(1));
        assert!(matches!(body.into_entity(), Err(AppError::BadRequest(_))));
    }
}
