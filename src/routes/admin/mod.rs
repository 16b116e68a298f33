pub mod abandoned_carts;
pub mod coupons;
pub mod orders;
pub mod products;
pub mod promotions;
pub mod reviews;
pub mod tax_rates;
pub mod variants;

use utoipa_axum::router::OpenApiRouter;

use crate::platform::app_state::AppState;

/// Back-office routes. Every one of them requires an admin token.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    products::routes_with_openapi()
        .merge(variants::routes_with_openapi())
        .merge(orders::routes_with_openapi())
        .merge(tax_rates::routes_with_openapi())
        .merge(coupons::routes_with_openapi())
        .merge(promotions::routes_with_openapi())
        .merge(reviews::routes_with_openapi())
        .merge(abandoned_carts::routes_with_openapi())
}
