use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    models::AbandonedCartEntity,
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
        middleware,
    },
    schema::abandoned_carts,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/abandoned-carts",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_abandoned_carts))
            .route_layer(axum::middleware::from_fn(middleware::admin_authorization)),
    )
}

#[derive(Serialize, ToSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Detected,
    Reminded,
    Clicked,
    Recovered,
}

impl From<&AbandonedCartEntity> for RecoveryState {
    fn from(record: &AbandonedCartEntity) -> Self {
        if record.recovered_at.is_some() {
            RecoveryState::Recovered
        } else if record.clicked_at.is_some() {
            RecoveryState::Clicked
        } else if record.reminder_count > 0 {
            RecoveryState::Reminded
        } else {
            RecoveryState::Detected
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AbandonedCartView {
    #[serde(flatten)]
    pub record: AbandonedCartEntity,
    pub recovery_state: RecoveryState,
}

/// Fetch abandoned-cart records, most recently detected first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    responses(
        (status = 200, description = "List abandoned carts", body = StdResponse<Vec<AbandonedCartView>, String>)
    )
)]
async fn get_abandoned_carts(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let records: Vec<AbandonedCartEntity> = abandoned_carts::table
        .order_by(abandoned_carts::detected_at.desc())
        .select(AbandonedCartEntity::as_select())
        .load(conn)
        .await
        .context("Failed to get abandoned carts")?;

    let views: Vec<AbandonedCartView> = records
        .into_iter()
        .map(|record| AbandonedCartView {
            recovery_state: RecoveryState::from(&record),
            record,
        })
        .collect();

    Ok(StdResponse {
        data: Some(views),
        message: Some("Get abandoned carts successfully"),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn record() -> AbandonedCartEntity {
        AbandonedCartEntity {
            id: 1,
            cart_id: 7,
            customer_id: Uuid::new_v4(),
            email: "shopper@example.com".into(),
            detected_at: Utc::now(),
            reminder_count: 0,
            last_reminded_at: None,
            clicked_at: None,
            recovered_at: None,
            recovery_token: Uuid::new_v4(),
        }
    }

    #[test]
    fn recovery_wins_over_earlier_stages() {
        let mut cart = record();
        assert_eq!(RecoveryState::from(&cart), RecoveryState::Detected);

        cart.reminder_count = 1;
        assert_eq!(RecoveryState::from(&cart), RecoveryState::Reminded);

        cart.clicked_at = Some(Utc::now());
        assert_eq!(RecoveryState::from(&cart), RecoveryState::Clicked);

        cart.recovered_at = Some(Utc::now());
        assert_eq!(RecoveryState::from(&cart), RecoveryState::Recovered);
    }
}
