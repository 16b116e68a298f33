//! Delivers queued order notifications by email.
//!
//! Rows are written by [`crate::platform::outbox::publish`] inside the
//! transaction that changed the order. This task polls the table, sends
//! each message through the email API and records the outcome.

use std::time::Duration;

use anyhow::{Context, Result};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{
    api::email::EmailClient,
    models::OutboxEntity,
    notifications::OrderNotification,
    platform::{
        app_state::AppState,
        outbox::{STATUS_FAILED, STATUS_PENDING, STATUS_SENT},
    },
    schema::outbox,
};

const BATCH_SIZE: i64 = 50;
const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Where a row goes after a failed send.
pub fn status_after_failure(attempts_after: i32, max_attempts: i32) -> &'static str {
    if attempts_after >= max_attempts {
        STATUS_FAILED
    } else {
        STATUS_PENDING
    }
}

pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(state.config.outbox.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Outbox relay polling every {:?}", period);

        loop {
            ticker.tick().await;
            match relay_batch(&state).await {
                Ok(stats) if stats != RelayStats::default() => info!(
                    "Outbox relay: {} sent, {} retried, {} failed",
                    stats.sent, stats.retried, stats.failed
                ),
                Ok(_) => {}
                Err(e) => error!("Outbox relay pass failed: {:#}", e),
            }
        }
    })
}

pub async fn relay_batch(state: &AppState) -> Result<RelayStats> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let pending: Vec<OutboxEntity> = outbox::table
        .filter(outbox::status.eq(STATUS_PENDING))
        .order_by(outbox::id.asc())
        .limit(BATCH_SIZE)
        .select(OutboxEntity::as_select())
        .load(conn)
        .await
        .context("Failed to load pending outbox rows")?;

    let email = state.email();
    let max_attempts = state.config.outbox.max_attempts;
    let mut stats = RelayStats::default();

    for entry in pending {
        match deliver(&email, &entry, &state.config.store.url).await {
            Ok(()) => {
                mark_sent(conn, entry.id).await?;
                stats.sent += 1;
            }
            Err(e) => {
                let attempts = entry.attempts + 1;
                let status = status_after_failure(attempts, max_attempts);
                warn!(
                    "Outbox #{} ({}) attempt {} failed: {:#}",
                    entry.id, entry.event_type, attempts, e
                );
                mark_failed_attempt(conn, entry.id, attempts, status, &format!("{e:#}")).await?;
                if status == STATUS_FAILED {
                    stats.failed += 1;
                } else {
                    stats.retried += 1;
                }
            }
        }
    }

    Ok(stats)
}

async fn deliver(email: &EmailClient, entry: &OutboxEntity, store_url: &str) -> Result<()> {
    let notification: OrderNotification = serde_json::from_str(&entry.payload)
        .with_context(|| format!("Unreadable {} payload", entry.event_type))?;
    let message = notification.render(store_url);
    if message.to.trim().is_empty() {
        anyhow::bail!("Order has no email address");
    }
    email.send(&message).await?;
    Ok(())
}

async fn mark_sent(conn: &mut AsyncPgConnection, id: i32) -> Result<()> {
    diesel::update(outbox::table.find(id))
        .set((
            outbox::status.eq(STATUS_SENT),
            outbox::attempts.eq(outbox::attempts + 1),
            outbox::last_error.eq(None::<String>),
            outbox::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await
        .context("Failed to mark outbox row as sent")?;
    Ok(())
}

async fn mark_failed_attempt(
    conn: &mut AsyncPgConnection,
    id: i32,
    attempts: i32,
    status: &str,
    reason: &str,
) -> Result<()> {
    let last_error: String = reason.chars().take(MAX_ERROR_CHARS).collect();
    diesel::update(outbox::table.find(id))
        .set((
            outbox::status.eq(status),
            outbox::attempts.eq(attempts),
            outbox::last_error.eq(Some(last_error)),
            outbox::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .await
        .context("Failed to record outbox failure")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_the_attempt_budget_is_spent() {
        assert_eq!(status_after_failure(1, 5), STATUS_PENDING);
        assert_eq!(status_after_failure(4, 5), STATUS_PENDING);
        assert_eq!(status_after_failure(5, 5), STATUS_FAILED);
    }

    #[test]
    fn a_single_attempt_budget_fails_immediately() {
        assert_eq!(status_after_failure(1, 1), STATUS_FAILED);
        assert_eq!(status_after_failure(1, 0), STATUS_FAILED);
    }
}
