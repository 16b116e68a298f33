pub mod admin;
pub mod cron;
pub mod customers;
pub mod products;
pub mod webhooks;

use std::sync::Arc;

use axum::{Extension, Router};
use tower_http::trace::TraceLayer;
use utoipa_axum::router::OpenApiRouter;

use crate::platform::{app_state::AppState, swagger};

/// Every route of the service with its OpenAPI description.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    products::routes_with_openapi()
        .merge(customers::routes_with_openapi())
        .merge(admin::routes_with_openapi())
        .merge(webhooks::routes_with_openapi())
        .merge(cron::routes_with_openapi())
}

/// Assembles the HTTP application: routes, Swagger UI, auth config for the
/// middleware and request tracing.
pub fn app(state: AppState) -> Router {
    let (router, mut openapi) = routes_with_openapi().split_for_parts();
    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("Storefront API")
        .version("1.0.0")
        .build();
    let swagger_ui = swagger::create_swagger_ui(openapi);

    router
        .merge(swagger_ui)
        .layer(Extension(Arc::new(state.config.auth.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
