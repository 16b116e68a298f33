use anyhow::{Context, Result};
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use uuid::Uuid;

use crate::{
    domain::{
        coupons::{self, CouponRule},
        inventory::{self, CART_ACTIVE, StockView},
    },
    models::{AbandonedCartEntity, CartEntity, CreateCartItemEntity, ProductEntity, VariantEntity},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Customer},
    },
    schema::{abandoned_carts, cart_items, carts, product_variants, products},
    services::carts::{self as cart_service, CartView},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/cart",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_cart))
            .routes(utoipa_axum::routes!(add_item))
            .routes(utoipa_axum::routes!(update_item, remove_item))
            .routes(utoipa_axum::routes!(apply_coupon, remove_coupon))
            .routes(utoipa_axum::routes!(recover_cart))
            .route_layer(axum::middleware::from_fn(middleware::customer_authorization)),
    )
}

#[derive(Deserialize, ToSchema)]
pub struct AddItemReq {
    pub variant_id: i32,
    pub quantity: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct UpdateItemReq {
    /// `0` removes the line.
    pub quantity: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct ApplyCouponReq {
    pub code: String,
}

async fn find_variant(
    conn: &mut AsyncPgConnection,
    variant_id: i32,
) -> Result<(VariantEntity, ProductEntity), AppError> {
    product_variants::table
        .inner_join(products::table)
        .filter(product_variants::id.eq(variant_id))
        .select((VariantEntity::as_select(), ProductEntity::as_select()))
        .first(conn)
        .await
        .optional()
        .context("Failed to get variant")?
        .ok_or(AppError::NotFound)
}

async fn set_item_quantity(
    conn: &mut AsyncPgConnection,
    cart: &CartEntity,
    variant_id: i32,
    quantity: i32,
) -> Result<(), AppError> {
    let (variant, product) = find_variant(conn, variant_id).await?;
    inventory::ensure_available(
        &StockView {
            sku: &variant.sku,
            stock: variant.stock,
            variant_active: variant.is_active,
            product_active: product.is_active,
        },
        quantity,
    )?;

    diesel::insert_into(cart_items::table)
        .values(CreateCartItemEntity {
            cart_id: cart.id,
            variant_id,
            quantity,
        })
        .on_conflict((cart_items::cart_id, cart_items::variant_id))
        .do_update()
        .set((
            cart_items::quantity.eq(quantity),
            cart_items::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await
        .context("Failed to save cart item")?;

    Ok(())
}

/// Current cart with priced lines and totals. Tax is added at checkout.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Get cart successfully", body = StdResponse<CartView, String>)
    )
)]
async fn get_cart(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
    let view = cart_service::cart_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Get cart successfully"),
    })
}

/// Add a variant to the cart, or increase its quantity if already present.
#[utoipa::path(
    post,
    path = "/items",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    request_body = AddItemReq,
    responses(
        (status = 200, description = "Item added", body = StdResponse<CartView, String>),
        (status = 404, description = "Variant not found"),
        (status = 409, description = "Not enough stock")
    )
)]
async fn add_item(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
    Json(body): Json<AddItemReq>,
) -> Result<impl IntoResponse, AppError> {
    inventory::validate_quantity(body.quantity)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let view = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
                let existing: Option<i32> = cart_items::table
                    .find((cart.id, body.variant_id))
                    .select(cart_items::quantity)
                    .first(conn)
                    .await
                    .optional()
                    .context("Failed to get cart item")?;

                let quantity = existing.unwrap_or(0) + body.quantity;
                set_item_quantity(conn, &cart, body.variant_id, quantity).await?;

                let cart = cart_service::touch_cart(conn, cart.id).await?;
                let view = cart_service::cart_view(conn, cart).await?;
                Ok::<CartView, AppError>(view)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Item added to cart"),
    })
}

/// Set the quantity of a cart line.
#[utoipa::path(
    patch,
    path = "/items/{variant_id}",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    params(
        ("variant_id" = i32, Path, description = "Variant in the cart")
    ),
    request_body = UpdateItemReq,
    responses(
        (status = 200, description = "Cart updated", body = StdResponse<CartView, String>),
        (status = 404, description = "Variant is not in the cart")
    )
)]
async fn update_item(
    Path(variant_id): Path<i32>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
    Json(body): Json<UpdateItemReq>,
) -> Result<impl IntoResponse, AppError> {
    if body.quantity != 0 {
        inventory::validate_quantity(body.quantity)?;
    }

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let view = conn
        .transaction(move |conn| {
            Box::pin(async move {
                let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
                let in_cart: Option<i32> = cart_items::table
                    .find((cart.id, variant_id))
                    .select(cart_items::quantity)
                    .first(conn)
                    .await
                    .optional()
                    .context("Failed to get cart item")?;
                if in_cart.is_none() {
                    return Err(AppError::NotFound);
                }

                if body.quantity == 0 {
                    diesel::delete(cart_items::table.find((cart.id, variant_id)))
                        .execute(conn)
                        .await
                        .context("Failed to remove cart item")?;
                } else {
                    set_item_quantity(conn, &cart, variant_id, body.quantity).await?;
                }

                let cart = cart_service::touch_cart(conn, cart.id).await?;
                let view = cart_service::cart_view(conn, cart).await?;
                Ok::<CartView, AppError>(view)
            })
        })
        .await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Cart updated"),
    })
}

/// Remove a variant from the cart.
#[utoipa::path(
    delete,
    path = "/items/{variant_id}",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    params(
        ("variant_id" = i32, Path, description = "Variant to remove")
    ),
    responses(
        (status = 200, description = "Item removed", body = StdResponse<CartView, String>)
    )
)]
async fn remove_item(
    Path(variant_id): Path<i32>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
    diesel::delete(cart_items::table.find((cart.id, variant_id)))
        .execute(conn)
        .await
        .context("Failed to remove cart item")?;

    let cart = cart_service::touch_cart(conn, cart.id).await?;
    let view = cart_service::cart_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Item removed from cart"),
    })
}

/// Attach a coupon to the cart. The coupon must be redeemable for the current subtotal.
#[utoipa::path(
    post,
    path = "/coupon",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    request_body = ApplyCouponReq,
    responses(
        (status = 200, description = "Coupon applied", body = StdResponse<CartView, String>),
        (status = 400, description = "Coupon cannot be redeemed"),
        (status = 404, description = "Unknown coupon")
    )
)]
async fn apply_coupon(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
    Json(body): Json<ApplyCouponReq>,
) -> Result<impl IntoResponse, AppError> {
    let code = coupons::normalize_code(&body.code)?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
    let coupon = cart_service::find_coupon(conn, &code)
        .await?
        .ok_or(AppError::NotFound)?;

    let priced = cart_service::price_cart(conn, &cart, Utc::now()).await?;
    CouponRule::try_from(&coupon)?.redeem(priced.subtotal_cents, Utc::now())?;

    let cart: CartEntity = diesel::update(carts::table.find(cart.id))
        .set((
            carts::coupon_code.eq(Some(coupon.code)),
            carts::updated_at.eq(diesel::dsl::now),
        ))
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to apply coupon")?;
    let view = cart_service::cart_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Coupon applied"),
    })
}

/// Detach the coupon from the cart.
#[utoipa::path(
    delete,
    path = "/coupon",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Coupon removed", body = StdResponse<CartView, String>)
    )
)]
async fn remove_coupon(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
    let cart: CartEntity = diesel::update(carts::table.find(cart.id))
        .set((
            carts::coupon_code.eq(None::<String>),
            carts::updated_at.eq(diesel::dsl::now),
        ))
        .returning(CartEntity::as_returning())
        .get_result(conn)
        .await
        .context("Failed to remove coupon")?;
    let view = cart_service::cart_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Coupon removed"),
    })
}

/// Follow a reminder link. Records the click and returns the cart it points to.
#[utoipa::path(
    post,
    path = "/recover/{token}",
    tags = ["Cart"],
    security(("bearerAuth" = [])),
    params(
        ("token" = Uuid, Path, description = "Recovery token from the reminder email")
    ),
    responses(
        (status = 200, description = "Cart recovered", body = StdResponse<CartView, String>),
        (status = 404, description = "Unknown token or cart of another customer"),
        (status = 409, description = "Cart was already checked out")
    )
)]
async fn recover_cart(
    Path(token): Path<Uuid>,
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let record: AbandonedCartEntity = abandoned_carts::table
        .filter(abandoned_carts::recovery_token.eq(token))
        .filter(abandoned_carts::customer_id.eq(customer.id))
        .select(AbandonedCartEntity::as_select())
        .first(conn)
        .await
        .optional()
        .context("Failed to get abandoned cart")?
        .ok_or(AppError::NotFound)?;

    diesel::update(
        abandoned_carts::table
            .find(record.id)
            .filter(abandoned_carts::clicked_at.is_null()),
    )
    .set(abandoned_carts::clicked_at.eq(diesel::dsl::now))
    .execute(conn)
    .await
    .context("Failed to record recovery click")?;

    let cart: CartEntity = carts::table
        .find(record.cart_id)
        .select(CartEntity::as_select())
        .get_result(conn)
        .await
        .context("Failed to get cart")?;
    if cart.status != CART_ACTIVE {
        return Err(AppError::Conflict("Cart was already checked out".into()));
    }

    let view = cart_service::cart_view(conn, cart).await?;

    Ok(StdResponse {
        data: Some(view),
        message: Some("Cart recovered"),
    })
}
