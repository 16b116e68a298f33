use anyhow::{Context, Result};
use axum::{Extension, Json, extract::State, response::IntoResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    api::payments::{CheckoutLineItem, CheckoutSessionRequest},
    domain::{
        pricing::{self, PricedLine, Totals},
        tax,
    },
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware::{self, Customer},
    },
    services::{carts as cart_service, catalog, orders::metadata},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/checkout",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(checkout))
            .route_layer(axum::middleware::from_fn(middleware::customer_authorization)),
    )
}

#[derive(Deserialize, Serialize, ToSchema, Debug, Clone)]
pub struct ShippingAddress {
    pub name: String,
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2.
    pub country: String,
}

impl ShippingAddress {
    /// Trims every field and upper-cases the country.
    fn normalized(self) -> Result<Self, AppError> {
        let required = |value: String, field: &str| {
            let value = value.trim().to_string();
            if value.is_empty() {
                Err(AppError::BadRequest(format!("Shipping {field} is required")))
            } else {
                Ok(value)
            }
        };
        let optional = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            name: required(self.name, "name")?,
            line1: required(self.line1, "address line")?,
            line2: optional(self.line2),
            city: required(self.city, "city")?,
            region: optional(self.region),
            postal_code: required(self.postal_code, "postal code")?,
            country: tax::validate_country(&self.country).ok_or_else(|| {
                AppError::BadRequest("Shipping country must be a two-letter code".into())
            })?,
        })
    }
}

#[derive(Deserialize, ToSchema)]
pub struct CheckoutReq {
    pub shipping_address: ShippingAddress,
}

#[derive(Serialize, ToSchema)]
pub struct CheckoutRes {
    pub session_id: String,
    pub url: Option<String>,
    pub totals: Totals,
}

/// One processor line per cart line with its share of the coupon folded in,
/// plus a tax line. The amounts add up to `totals.total_cents`.
fn checkout_line_items(lines: &[PricedLine], totals: &Totals) -> Vec<CheckoutLineItem> {
    let amounts: Vec<i64> = lines.iter().map(|line| line.line_total_cents).collect();
    let shares = pricing::allocate_discount(&amounts, totals.discount_cents);

    let mut items: Vec<CheckoutLineItem> = lines
        .iter()
        .zip(shares)
        .map(|(line, share)| CheckoutLineItem {
            name: format!(
                "{} ({}) x {}",
                line.product_name, line.variant_name, line.quantity
            ),
            unit_amount_cents: line.line_total_cents - share,
            quantity: 1,
        })
        .collect();

    if totals.tax_cents > 0 {
        items.push(CheckoutLineItem {
            name: "Tax".into(),
            unit_amount_cents: totals.tax_cents,
            quantity: 1,
        });
    }
    items
}

/// Start payment for the current cart. The cart stays active until the
/// payment processor reports the completed session.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Checkout"],
    security(("bearerAuth" = [])),
    request_body = CheckoutReq,
    responses(
        (status = 200, description = "Checkout session created", body = StdResponse<CheckoutRes, String>),
        (status = 400, description = "Empty cart, bad address or coupon no longer valid"),
        (status = 409, description = "Not enough stock"),
        (status = 502, description = "Payment processor unreachable")
    )
)]
async fn checkout(
    State(state): State<AppState>,
    Extension(customer): Extension<Customer>,
    Json(body): Json<CheckoutReq>,
) -> Result<impl IntoResponse, AppError> {
    let address = body.shipping_address.normalized()?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let cart = cart_service::get_or_create_active_cart(conn, &customer).await?;
    let priced = cart_service::price_cart(conn, &cart, Utc::now()).await?;
    if priced.lines.is_empty() {
        return Err(AppError::BadRequest("Cart is empty".into()));
    }
    for line in &priced.lines {
        line.ensure_available()?;
    }
    if let Some(reason) = priced.coupon_error() {
        return Err(AppError::BadRequest(reason));
    }

    let rate_bps = catalog::tax_rate_bps(conn, &address.country, address.region.as_deref()).await?;
    let totals = pricing::totals(priced.subtotal_cents, priced.discount_cents(), rate_bps);

    let store = &state.config.store;
    let email = customer.email.clone().or_else(|| cart.email.clone());
    let shipping_json =
        serde_json::to_string(&address).context("Failed to serialize shipping address")?;

    let request = CheckoutSessionRequest {
        currency: store.currency.clone(),
        line_items: checkout_line_items(&priced.priced, &totals),
        success_url: format!("{}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}", store.url),
        cancel_url: format!("{}/cart", store.url),
        customer_email: email.clone(),
        client_reference_id: cart.id.to_string(),
        metadata: vec![
            (metadata::CART_ID.into(), cart.id.to_string()),
            (metadata::CUSTOMER_ID.into(), customer.id.to_string()),
            (metadata::EMAIL.into(), email.unwrap_or_default()),
            (metadata::SUBTOTAL.into(), totals.subtotal_cents.to_string()),
            (metadata::DISCOUNT.into(), totals.discount_cents.to_string()),
            (metadata::TAX.into(), totals.tax_cents.to_string()),
            (
                metadata::COUPON.into(),
                cart.coupon_code.clone().unwrap_or_default(),
            ),
            (metadata::SHIPPING_ADDRESS.into(), shipping_json),
        ],
    };

    let session = state.payments().create_checkout_session(&request).await?;
    tracing::info!(
        "Checkout session {} created for cart #{} ({} cents)",
        session.id,
        cart.id,
        totals.total_cents
    );

    Ok(StdResponse {
        data: Some(CheckoutRes {
            session_id: session.id,
            url: session.url,
            totals,
        }),
        message: Some("Checkout session created"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(name: &str, unit: i64, quantity: i32) -> PricedLine {
        PricedLine {
            product_id: 1,
            variant_id: 1,
            product_name: name.into(),
            variant_name: "M".into(),
            sku: format!("{name}-M"),
            list_unit_price_cents: unit,
            unit_price_cents: unit,
            quantity,
            line_total_cents: unit * quantity as i64,
        }
    }

    #[test]
    fn line_items_add_up_to_the_total() {
        let lines = vec![line("Tee", 1999, 3), line("Mug", 1250, 1)];
        let subtotal = pricing::subtotal(&lines);
        let totals = pricing::totals(subtotal, 1000, 825);

        let items = checkout_line_items(&lines, &totals);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].name, "Tee (M) x 3");
        assert_eq!(items[2].name, "Tax");

        let sum: i64 = items
            .iter()
            .map(|item| item.unit_amount_cents * item.quantity as i64)
            .sum();
        assert_eq!(sum, totals.total_cents);
    }

    #[test]
    fn no_tax_line_without_tax() {
        let lines = vec![line("Tee", 1999, 1)];
        let totals = pricing::totals(1999, 0, 0);
        let items = checkout_line_items(&lines, &totals);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].unit_amount_cents, 1999);
    }

    #[test]
    fn address_is_normalized() {
        let address = ShippingAddress {
            name: " Ada ".into(),
            line1: "1 Main St".into(),
            line2: Some("  ".into()),
            city: "Springfield".into(),
            region: Some(" IL ".into()),
            postal_code: "62701".into(),
            country: "us".into(),
        }
        .normalized()
        .unwrap();
        assert_eq!(address.name, "Ada");
        assert_eq!(address.line2, None);
        assert_eq!(address.region.as_deref(), Some("IL"));
        assert_eq!(address.country, "US");
    }

    #[test]
    fn address_requires_a_valid_country() {
        let address = ShippingAddress {
            name: "Ada".into(),
            line1: "1 Main St".into(),
            line2: None,
            city: "Springfield".into(),
            region: None,
            postal_code: "62701".into(),
            country: "USA".into(),
        };
        assert!(matches!(address.normalized(), Err(AppError::BadRequest(_))));
    }
}
