use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    domain::abandoned::AbandonmentPolicy,
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    services::abandoned::{self, AbandonedCartRun},
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/cron",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(abandoned_carts))
            .route_layer(axum::middleware::from_fn(middleware::cron_authorization)),
    )
}

/// Detects newly abandoned carts and sends the reminders that are due.
/// Meant to be hit by an external scheduler with the cron secret.
#[utoipa::path(
    post,
    path = "/abandoned-carts",
    tags = ["Cron"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "Run summary", body = StdResponse<AbandonedCartRun, String>),
        (status = 401, description = "Missing or wrong cron secret")
    )
)]
async fn abandoned_carts(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let policy = AbandonmentPolicy::from(&state.config.abandoned_carts);
    let run = abandoned::run(conn, &state.email(), &policy, &state.config.store.url).await?;

    Ok(StdResponse {
        data: Some(run),
        message: Some("Abandoned cart run finished"),
    })
}
