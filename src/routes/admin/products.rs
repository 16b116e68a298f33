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
    models::{CreateProductEntity, ProductEntity, UpdateProductEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::products,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/products",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_products, create_product))
            .routes(utoipa_axum::routes!(update_product, deactivate_product))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

fn valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 128
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-')
}

fn check_product_fields(
    slug: Option<&str>,
    name: Option<&str>,
    price_cents: Option<i64>,
) -> Result<(), AppError> {
    if slug.is_some_and(|slug| !valid_slug(slug)) {
        return Err(AppError::BadRequest(
            "Slug must be lowercase letters, digits and dashes".into(),
        ));
    }
    if name.is_some_and(|name| name.trim().is_empty()) {
        return Err(AppError::BadRequest("Name is required".into()));
    }
    if price_cents.is_some_and(|price| price < 0) {
        return Err(AppError::BadRequest("Price cannot be negative".into()));
    }
    Ok(())
}

/// Fetch all products, inactive ones included.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List all products", body = StdResponse<Vec<ProductEntity>, String>)
    )
)]
async fn get_products(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let products: Vec<ProductEntity> = products::table
        .order_by(products::id.desc())
        .select(ProductEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get products")?;

    Ok(StdResponse {
        data: Some(products),
        message: Some("Get products successfully"),
    })
}

/// Create a product. Variants are added separately.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body = CreateProductEntity,
    responses(
        (status = 200, description = "Product created", body = StdResponse<ProductEntity, String>),
        (status = 409, description = "Slug already taken")
    )
)]
async fn create_product(
    State(state): State<AppState>,
    Json(body): Json<CreateProductEntity>,
) -> Result<impl IntoResponse, AppError> {
    check_product_fields(Some(&body.slug), Some(&body.name), Some(body.price_cents))?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let product: ProductEntity = diesel::insert_into(products::table)
        .values(&body)
        .returning(ProductEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(product),
        message: Some("Product created successfully"),
    })
}

/// Update product fields.
#[utoipa::path(
    patch,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Product ID to update")
    ),
    request_body = UpdateProductEntity,
    responses(
        (status = 200, description = "Product updated", body = StdResponse<ProductEntity, String>),
        (status = 404, description = "Product not found")
    )
)]
async fn update_product(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateProductEntity>,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Nothing to update".into()));
    }
    check_product_fields(body.slug.as_deref(), body.name.as_deref(), body.price_cents)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let product: ProductEntity = diesel::update(products::table.find(id))
        .set((&body, products::updated_at.eq(diesel::dsl::now)))
        .returning(ProductEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(product),
        message: Some("Product updated successfully"),
    })
}

/// Hide a product from the storefront. Past orders keep their snapshots.
#[utoipa::path(
    delete,
    path = "/{id}",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    params(
        ("id" = i32, Path, description = "Product ID to deactivate")
    ),
    responses(
        (status = 200, description = "Product deactivated", body = StdResponse<ProductEntity, String>),
        (status = 404, description = "Product not found")
    )
)]
async fn deactivate_product(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let product: ProductEntity = diesel::update(products::table.find(id))
        .set((
            products::is_active.eq(false),
            products::updated_at.eq(diesel::dsl::now),
        ))
        .returning(ProductEntity::as_returning())
        .get_result(conn)
        .await
        .map_err(AppError::from)?;

    Ok(StdResponse {
        data: Some(product),
        message: Some("Product deactivated successfully"),
    })
}
