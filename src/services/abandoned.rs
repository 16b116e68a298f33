use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    api::email::EmailClient,
    domain::{
        abandoned::{self, AbandonmentPolicy, CartActivity, ReminderState},
        inventory::CART_ACTIVE,
    },
    models::{AbandonedCartEntity, CartEntity, CreateAbandonedCartEntity},
    notifications,
    schema::{abandoned_carts, cart_items, carts},
    services::carts as cart_service,
};

#[derive(Serialize, ToSchema, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AbandonedCartRun {
    pub detected: usize,
    pub reminded: usize,
    pub failed: usize,
}

/// Records carts that crossed the idle threshold since the last run.
pub async fn detect(
    conn: &mut AsyncPgConnection,
    policy: &AbandonmentPolicy,
    now: DateTime<Utc>,
) -> Result<usize> {
    let candidates: Vec<CartEntity> = carts::table
        .filter(carts::status.eq(CART_ACTIVE))
        .filter(carts::email.is_not_null())
        .filter(carts::updated_at.lt(policy.cutoff(now)))
        .select(CartEntity::as_select())
        .load(conn)
        .await
        .context("Failed to load idle carts")?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i32> = candidates.iter().map(|cart| cart.id).collect();
    let known: HashSet<i32> = abandoned_carts::table
        .filter(abandoned_carts::cart_id.eq_any(&ids))
        .select(abandoned_carts::cart_id)
        .load::<i32>(conn)
        .await
        .context("Failed to load abandoned cart records")?
        .into_iter()
        .collect();

    let mut item_counts: HashMap<i32, usize> = HashMap::new();
    let item_cart_ids: Vec<i32> = cart_items::table
        .filter(cart_items::cart_id.eq_any(&ids))
        .select(cart_items::cart_id)
        .load(conn)
        .await
        .context("Failed to count cart items")?;
    for cart_id in item_cart_ids {
        *item_counts.entry(cart_id).or_default() += 1;
    }

    let new_records: Vec<CreateAbandonedCartEntity> = candidates
        .into_iter()
        .filter(|cart| !known.contains(&cart.id))
        .filter(|cart| {
            policy.is_abandoned(
                &CartActivity {
                    is_active: cart.status == CART_ACTIVE,
                    item_count: item_counts.get(&cart.id).copied().unwrap_or(0),
                    email: cart.email.clone(),
                    updated_at: cart.updated_at,
                },
                now,
            )
        })
        .filter_map(|cart| {
            cart.email.map(|email| CreateAbandonedCartEntity {
                cart_id: cart.id,
                customer_id: cart.customer_id,
                email,
            })
        })
        .collect();
    if new_records.is_empty() {
        return Ok(0);
    }

    let inserted = diesel::insert_into(abandoned_carts::table)
        .values(&new_records)
        .on_conflict(abandoned_carts::cart_id)
        .do_nothing()
        .execute(conn)
        .await
        .context("Failed to record abandoned carts")?;

    Ok(inserted)
}

/// Sends every reminder that is due. Returns `(sent, failed)`.
pub async fn send_due_reminders(
    conn: &mut AsyncPgConnection,
    email: &EmailClient,
    policy: &AbandonmentPolicy,
    store_url: &str,
    now: DateTime<Utc>,
) -> Result<(usize, usize)> {
    let open: Vec<(AbandonedCartEntity, CartEntity)> = abandoned_carts::table
        .inner_join(carts::table)
        .filter(abandoned_carts::recovered_at.is_null())
        .filter(abandoned_carts::reminder_count.lt(policy.max_reminders))
        .filter(carts::status.eq(CART_ACTIVE))
        .select((AbandonedCartEntity::as_select(), CartEntity::as_select()))
        .load(conn)
        .await
        .context("Failed to load abandoned carts")?;

    let mut sent = 0;
    let mut failed = 0;
    for (record, cart) in open {
        let state = ReminderState {
            reminder_count: record.reminder_count,
            last_reminded_at: record.last_reminded_at,
            recovered_at: record.recovered_at,
            cart_updated_at: cart.updated_at,
        };
        if !policy.reminder_due(&state, now) {
            continue;
        }

        let lines = cart_service::load_lines(conn, cart.id).await?;
        if lines.is_empty() {
            continue;
        }
        let items: Vec<(String, i32)> = lines
            .iter()
            .map(|line| {
                (
                    format!("{} ({})", line.product.name, line.variant.name),
                    line.item.quantity,
                )
            })
            .collect();
        let message = notifications::abandoned_cart_reminder(
            &record.email,
            &items,
            &abandoned::recovery_url(store_url, record.recovery_token),
            record.reminder_count + 1,
        );

        if let Err(err) = email.send(&message).await {
            warn!("Failed to send reminder for cart #{}: {:#}", cart.id, err);
            failed += 1;
            continue;
        }

        diesel::update(abandoned_carts::table.find(record.id))
            .set((
                abandoned_carts::reminder_count.eq(abandoned_carts::reminder_count + 1),
                abandoned_carts::last_reminded_at.eq(now),
            ))
            .execute(conn)
            .await
            .context("Failed to update reminder state")?;
        sent += 1;
    }

    Ok((sent, failed))
}

pub async fn run(
    conn: &mut AsyncPgConnection,
    email: &EmailClient,
    policy: &AbandonmentPolicy,
    store_url: &str,
) -> Result<AbandonedCartRun> {
    let now = Utc::now();
    let detected = detect(conn, policy, now).await?;
    let (reminded, failed) = send_due_reminders(conn, email, policy, store_url, now).await?;

    info!(
        "Abandoned cart run: {} detected, {} reminded, {} failed",
        detected, reminded, failed
    );
    Ok(AbandonedCartRun {
        detected,
        reminded,
        failed,
    })
}
