use anyhow::{Context, Result};
use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::inventory,
    models::{
        CreateInventoryMovementEntity, CreateVariantEntity, InventoryMovementEntity,
        UpdateVariantEntity, VariantEntity,
    },
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::{inventory_movements, product_variants, products},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/variants",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_variants, create_variant))
            .routes(utoipa_axum::routes!(update_variant))
            .routes(utoipa_axum::routes!(adjust_stock))
            .routes(utoipa_axum::routes!(get_movements))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct VariantsQuery {
    pub product_id: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct CreateVariantReq {
    pub product_id: i32,
    pub sku: String,
    pub name: String,
    /// Leave empty to use the product price.
    pub price_cents: Option<i64>,
    #[serde(default)]
    pub stock: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct AdjustStockReq {
    /// Units to add (positive) or remove (negative).
    pub delta: i32,
    pub reason: String,
}

#[derive(Serialize, ToSchema)]
pub struct AdjustStockRes {
    pub variant: VariantEntity,
    pub movement: InventoryMovementEntity,
}

fn normalize_sku(sku: &str) -> Result<String, AppError> {
    let sku = sku.trim().to_uppercase();
    if sku.is_empty() || sku.len() > 64 || sku.chars().any(char::is_whitespace) {
        return Err(AppError::BadRequest(
            "SKU must be 1 to 64 characters without spaces".into(),
        ));
    }
    Ok(sku)
}

/// List the variants of a product.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(VariantsQuery),
    responses(
        (status = 200, description = "List variants", body = StdResponse<Vec<VariantEntity>, String>)
    )
)]
async fn get_variants(
    Query(query): Query<VariantsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let variants: Vec<VariantEntity> = product_variants::table
        .filter(product_variants::product_id.eq(query.product_id))
        .order_by(product_variants::id.asc())
        .select(VariantEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get variants")?;

    Ok(StdResponse {
        data: Some(variants),
        message: Some("Get variants successfully"),
    })
}

/// Add a variant to a product. Opening stock is recorded as a movement.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateVariantReq,
    responses(
        (status = 200, description = "Variant created", body = StdResponse<VariantEntity, String>),
        (status = 404, description = "Product not found"),
        (status = 409, description = "SKU already taken")
    )
)]
async fn create_variant(
    State(state): State<AppState>,
    Json(body): Json<CreateVariantReq>,
) -> Result<impl IntoResponse, AppError> {
    let sku = normalize_sku(&body.sku)?;
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("Name is required".into()));
    }
    if body.price_cents.is_some_and(|price| price < 0) || body.stock < 0 {
        return Err(AppError::BadRequest(
            "Price and stock cannot be negative".into(),
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let variant = conn
        .transaction(move |conn| {
            Box::pin(async move {
                products::table
                    .find(body.product_id)
                    .select(products::id)
                    .first::<i32>(conn)
                    .await
                    .optional()
                    .context("Failed to get product")?
                    .ok_or(AppError::NotFound)?;

                let variant: VariantEntity = diesel::insert_into(product_variants::table)
                    .values(CreateVariantEntity {
                        product_id: body.product_id,
                        sku,
                        name: body.name.trim().to_string(),
                        price_cents: body.price_cents,
                        stock: body.stock,
                    })
                    .returning(VariantEntity::as_returning())
                    .get_result(conn)
                    .await?;

                if variant.stock > 0 {
                    diesel::insert_into(inventory_movements::table)
                        .values(CreateInventoryMovementEntity {
                            variant_id: variant.id,
                            delta: variant.stock,
                            reason: "initial_stock".into(),
                            order_id: None,
                        })
                        .execute(conn)
                        .await
                        .context("Failed to record inventory movement")?;
                }

                Ok::<VariantEntity, AppError>(variant)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(variant),
        message: Some("Variant created successfully"),
    })
}

/// Update variant fields. Stock changes go through `adjust-stock`.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Variant ID to update")
    ),
    request_body = UpdateVariantEntity,
    responses(
        (status = 200, description = "Variant updated", body = StdResponse<VariantEntity, String>),
        (status = 404, description = "Variant not found")
    )
)]
async fn update_variant(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(mut body): Json<UpdateVariantEntity>,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }
    if let Some(sku) = &body.sku {
        body.sku = Some(normalize_sku(sku)?);
    }
    if body.price_cents.is_some_and(|price| price < 0) {
        return Err(AppError::BadRequest("Price cannot be negative".into()));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let variant: VariantEntity = diesel::update(product_variants::table.find(id))
        .set((&body, product_variants::updated_at.eq(diesel::dsl::now)))
        .returning(VariantEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(variant),
        message: Some("Variant updated successfully"),
    })
}

/// Add or remove stock by hand, e.g. after a stock count. Stock cannot go negative.
#[utoipa::path(
    post,
    path = "/{id}/adjust-stock",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Variant ID to adjust")
    ),
    request_body = AdjustStockReq,
    responses(
        (status = 200, description = "Stock adjusted", body = StdResponse<AdjustStockRes, String>),
        (status = 404, description = "Variant not found"),
        (status = 409, description = "Adjustment would make stock negative")
    )
)]
async fn adjust_stock(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<AdjustStockReq>,
) -> Result<impl IntoResponse, AppError> {
    let reason = body.reason.trim().to_string();
    if body.delta == 0 || reason.is_empty() {
        return Err(AppError::BadRequest(
            "A non-zero delta and a reason are required".into(),
        ));
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let res = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let variant: VariantEntity = product_variants::table
                    .find(id)
                    .select(VariantEntity::as_select())
                    .for_update()
                    .get_result(conn)
                    .await
                    .optional()
                    .context("Failed to get variant")?
                    .ok_or(AppError::NotFound)?;

                let stock = inventory::adjusted_stock(&variant.sku, variant.stock, body.delta)?;

                let variant: VariantEntity = diesel::update(product_variants::table.find(id))
                    .set((
                        product_variants::stock.eq(stock),
                        product_variants::updated_at.eq(diesel::dsl::now),
                    ))
                    .returning(VariantEntity::as_returning())
                    .get_result(conn)
                    .await
                    .context("Failed to update stock")?;

                let movement: InventoryMovementEntity =
                    diesel::insert_into(inventory_movements::table)
                        .values(CreateInventoryMovementEntity {
                            variant_id: id,
                            delta: body.delta,
                            reason,
                            order_id: None,
                        })
                        .returning(InventoryMovementEntity::as_returning())
                        .get_result(conn)
                        .await
                        .context("Failed to record inventory movement")?;

                Ok::<AdjustStockRes, AppError>(AdjustStockRes { variant, movement })
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(res),
        message: Some("Stock adjusted successfully"),
    })
}

/// Stock history of a variant, newest first.
#[utoipa::path(
    get,
    path = "/{id}/movements",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Variant ID")
    ),
    responses(
        (status = 200, description = "List inventory movements", body = StdResponse<Vec<InventoryMovementEntity>, String>)
    )
)]
async fn get_movements(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let movements: Vec<InventoryMovementEntity> = inventory_movements::table
        .filter(inventory_movements::variant_id.eq(id))
        .order_by(inventory_movements::created_at.desc())
        .select(InventoryMovementEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get inventory movements")?;

    Ok(StdResponse {
        data: Some(movements),
        message: Some("Get inventory movements successfully"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skus_are_upper_cased() {
        assert_eq!(normalize_sku(" tee-m ").unwrap(), "TEE-M");
        assert!(normalize_sku("tee m").is_err());
        assert!(normalize_sku("  ").is_err());
    }
}
