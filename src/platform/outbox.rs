use anyhow::{Context, Result};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

use crate::{models::CreateOutboxEntity, schema::outbox};

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_SENT: &str = "SENT";
pub const STATUS_FAILED: &str = "FAILED";

/// Queues an event in the outbox table using the caller's connection,
/// so the row commits or rolls back with the surrounding transaction.
pub async fn publish<T: Serialize>(
    conn: &mut AsyncPgConnection,
    event_type: String,
    payload: T,
) -> Result<()> {
    let payload = serde_json::to_string(&payload).context("Failed to serialize outbox payload")?;

    diesel::insert_into(outbox::table)
        .values(CreateOutboxEntity {
            event_type,
            payload,
            status: STATUS_PENDING.into(),
        })
        .execute(conn)
        .await
        .context("Failed to insert outbox event")?;

    Ok(())
}
