use std::collections::HashMap;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{
    BoolExpressionMethods, ExpressionMethods, OptionalExtension, PgTextExpressionMethods, QueryDsl, SelectableHelper,
    pg::Pg,
};
use diesel_async::RunQueryDsl;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::{
        promotions,
        reviews::{self, RatingSummary, ReviewStatus},
    },
    models::{ProductEntity, ReviewEntity, VariantEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
    },
    schema::{product_variants, products, reviews as reviews_table},
    services::catalog,
};

const DEFAULT_PER_PAGE: i64 = 20;
const MAX_PER_PAGE: i64 = 100;

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/products",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(list_products))
            .routes(utoipa_axum::routes!(get_product)),
    )
}

#[derive(Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct ListProductsQuery {
    pub category: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl ListProductsQuery {
    fn paging(&self) -> (i64, i64) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self
            .per_page
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }

    /// Row offset for the clamped page; saturates instead of overflowing.
    fn offset(&self) -> i64 {
        let (page, per_page) = self.paging();
        (page - 1).saturating_mul(per_page)
    }
}

#[derive(Serialize, ToSchema)]
pub struct ProductSummary {
    pub product: ProductEntity,
    /// Lowest list price across active variants.
    pub from_price_cents: i64,
    /// Set when a live promotion lowers `from_price_cents`.
    pub sale_price_cents: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct ProductPage {
    pub items: Vec<ProductSummary>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

#[derive(Serialize, ToSchema)]
pub struct VariantView {
    pub variant: VariantEntity,
    pub unit_price_cents: i64,
    pub sale_price_cents: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct ProductDetail {
    pub product: ProductEntity,
    pub variants: Vec<VariantView>,
    pub reviews: Vec<ReviewEntity>,
    pub rating: RatingSummary,
}

fn search_pattern(search: &str) -> String {
    let escaped = search
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn sale_price(list_price: i64, bps: Option<i32>) -> Option<i64> {
    let discounted = promotions::discounted_price(list_price, bps);
    (discounted < list_price).then_some(discounted)
}

/// Browse active products, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Catalog"],
    params(ListProductsQuery),
    responses(
        (status = 200, description = "List products", body = StdResponse<ProductPage, String>)
    )
)]
async fn list_products(
    Query(query): Query<ListProductsQuery>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let (page, per_page) = query.paging();
    let filtered = || {
        let mut statement: products::BoxedQuery<'_, Pg> = products::table
            .filter(products::is_active.eq(true))
            .into_boxed();
        if let Some(category) = query.category.as_deref().filter(|c| !c.is_empty()) {
            statement = statement.filter(products::category.eq(category.to_string()));
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let pattern = search_pattern(search);
            statement = statement.filter(
                products::name
                    .ilike(pattern.clone())
                    .or(products::description.ilike(pattern)),
            );
        }
        statement
    };

    let total: i64 = filtered()
        .count()
        .get_result(conn)
        .await
        .context("Failed to count products")?;

    let product_list: Vec<ProductEntity> = filtered()
        .order_by((products::created_at.desc(), products::id.desc()))
        .limit(per_page)
        .offset(query.offset())
        .select(ProductEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get products")?;

    let product_ids: Vec<i32> = product_list.iter().map(|product| product.id).collect();
    let variants: Vec<VariantEntity> = product_variants::table
        .filter(product_variants::product_id.eq_any(&product_ids))
        .filter(product_variants::is_active.eq(true))
        .select(VariantEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get variants")?;

    let base_prices: HashMap<i32, i64> = product_list
        .iter()
        .map(|product| (product.id, product.price_cents))
        .collect();
    let mut lowest: HashMap<i32, i64> = HashMap::new();
    for variant in &variants {
        let Some(base) = base_prices.get(&variant.product_id) else {
            continue;
        };
        let price = variant.price_cents.unwrap_or(*base);
        lowest
            .entry(variant.product_id)
            .and_modify(|current| *current = (*current).min(price))
            .or_insert(price);
    }

    let now = Utc::now();
    let live = catalog::live_promotions(conn, now).await?;
    let items = product_list
        .into_iter()
        .map(|product| {
            let from_price_cents = lowest
                .get(&product.id)
                .copied()
                .unwrap_or(product.price_cents);
            let bps = promotions::best_discount_bps(&live, product.id, &product.category, now);
            ProductSummary {
                sale_price_cents: sale_price(from_price_cents, bps),
                from_price_cents,
                product,
            }
        })
        .collect();

    Ok(StdResponse {
        data: Some(ProductPage {
            items,
            page,
            per_page,
            total,
        }),
        message: Some("Get products successfully"),
    })
}

/// Product page: variants with stock, approved reviews and the rating summary.
#[utoipa::path(
    get,
    path = "/{slug}",
    tags = ["Catalog"],
    params(
        ("slug" = String, Path, description = "Product slug")
    ),
    responses(
        (status = 200, description = "Get product successfully", body = StdResponse<ProductDetail, String>),
        (status = 404, description = "Product not found")
    )
)]
async fn get_product(
    Path(slug): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let product: ProductEntity = products::table
        .filter(products::slug.eq(&slug))
        .filter(products::is_active.eq(true))
        .select(ProductEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get product")?
        .ok_or(AppError::NotFound)?;

    let variants: Vec<VariantEntity> = product_variants::table
        .filter(product_variants::product_id.eq(product.id))
        .filter(product_variants::is_active.eq(true))
        .order_by(product_variants::id.asc())
        .select(VariantEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get variants")?;

    let approved: Vec<ReviewEntity> = reviews_table::table
        .filter(reviews_table::product_id.eq(product.id))
        .filter(reviews_table::status.eq(ReviewStatus::Approved.as_str()))
        .order_by(reviews_table::created_at.desc())
        .select(ReviewEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get reviews")?;

    let now = Utc::now();
    let live = catalog::live_promotions(conn, now).await?;
    let bps = promotions::best_discount_bps(&live, product.id, &product.category, now);

    let variants = variants
        .into_iter()
        .map(|variant| {
            let unit_price_cents = variant.price_cents.unwrap_or(product.price_cents);
            VariantView {
                sale_price_cents: sale_price(unit_price_cents, bps),
                unit_price_cents,
                variant,
            }
        })
        .collect();

    let ratings: Vec<i16> = approved.iter().map(|review| review.rating).collect();

    Ok(StdResponse {
        data: Some(ProductDetail {
            rating: reviews::summarize(&ratings),
            product,
            variants,
            reviews: approved,
        }),
        message: Some("Get product successfully"),
    })
}
