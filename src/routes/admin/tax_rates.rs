use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::{money::BPS_SCALE, tax},
    models::{CreateTaxRateEntity, TaxRateEntity, UpdateTaxRateEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::tax_rates,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/tax-rates",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_tax_rates, create_tax_rate))
            .routes(utoipa_axum::routes!(update_tax_rate, delete_tax_rate))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

fn check_rate(rate_bps: i32) -> Result<(), AppError> {
    if (0..=BPS_SCALE as i32).contains(&rate_bps) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!(
            "Rate must be between 0 and {BPS_SCALE} basis points"
        )))
    }
}

/// Fetch every tax rate.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List tax rates", body = StdResponse<Vec<TaxRateEntity>, String>)
    )
)]
async fn get_tax_rates(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let rates: Vec<TaxRateEntity> = tax_rates::table
        .order_by((tax_rates::country.asc(), tax_rates::region.asc()))
        .select(TaxRateEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get tax rates")?;

    Ok(StdResponse {
        data: Some(rates),
        message: Some("Get tax rates successfully"),
    })
}

/// Create a rate for a country, or for one region of it.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateTaxRateEntity,
    responses(
        (status = 200, description = "Tax rate created", body = StdResponse<TaxRateEntity, String>),
        (status = 409, description = "A rate already exists for this destination")
    )
)]
async fn create_tax_rate(
    State(state): State<AppState>,
    Json(body): Json<CreateTaxRateEntity>,
) -> Result<impl IntoResponse, AppError> {
    check_rate(body.rate_bps)?;
    let country = tax::validate_country(&body.country)
        .ok_or_else(|| AppError::BadRequest("Country must be a two-letter code".into()))?;
    let region = body
        .region
        .map(|region| region.trim().to_uppercase())
        .filter(|region| !region.is_empty());
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("Name is required".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let rate: TaxRateEntity = diesel::insert_into(tax_rates::table)
        .values(CreateTaxRateEntity {
            name,
            country,
            region,
            rate_bps: body.rate_bps,
        })
        .returning(TaxRateEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(rate),
        message: Some("Tax rate created successfully"),
    })
}

/// Update a tax rate.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Tax rate ID to update")
    ),
    request_body = UpdateTaxRateEntity,
    responses(
        (status = 200, description = "Tax rate updated", body = StdResponse<TaxRateEntity, String>),
        (status = 404, description = "Tax rate not found")
    )
)]
async fn update_tax_rate(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateTaxRateEntity>,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }
    if let Some(rate_bps) = body.rate_bps {
        check_rate(rate_bps)?;
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let rate: TaxRateEntity = diesel::update(tax_rates::table.find(id))
        .set((&body, tax_rates::updated_at.eq(diesel::dsl::now)))
        .returning(TaxRateEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(rate),
        message: Some("Tax rate updated successfully"),
    })
}

/// Delete a tax rate.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Tax rate ID to delete")
    ),
    responses(
        (status = 200, description = "Tax rate deleted", body = StdResponse<TaxRateEntity, String>),
        (status = 404, description = "Tax rate not found")
    )
)]
async fn delete_tax_rate(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let rate: TaxRateEntity = diesel::delete(tax_rates::table.find(id))
        .returning(TaxRateEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(rate),
        message: Some("Tax rate deleted successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_bounded() {
        assert!(check_rate(0).is_ok());
        assert!(check_rate(10_000).is_ok());
        assert!(check_rate(10_001).is_err());
        assert!(check_rate(-1).is_err());
    }
}
