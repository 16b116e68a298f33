pub mod carts;
pub mod checkout;
pub mod orders;
pub mod reviews;

use utoipa_axum::router::OpenApiRouter;

use crate::platform::app_state::AppState;

/// Routes for signed-in shoppers.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    carts::routes_with_openapi()
        .merge(checkout::routes_with_openapi())
        .merge(orders::routes_with_openapi())
        .merge(reviews::routes_with_openapi())
}
