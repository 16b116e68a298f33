use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::{
    domain::{
        promotions::PromotionRule,
        tax::{self, TaxRule},
    },
    models::{PromotionEntity, TaxRateEntity},
    schema::{promotions, tax_rates},
};

/// Promotions that are switched on and have started; `PromotionRule::is_live`
/// still decides on the end date.
pub async fn live_promotions(
    conn: &mut AsyncPgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<PromotionRule>> {
    let rows: Vec<PromotionEntity> = promotions::table
        .filter(promotions::is_active.eq(true))
        .filter(promotions::starts_at.le(now))
        .select(PromotionEntity::as_select())
        .load(conn)
        .await
        .context("Failed to load promotions")?;

    Ok(rows
        .iter()
        .map(PromotionRule::from)
        .filter(|rule| rule.is_live(now))
        .collect())
}

pub async fn tax_rate_bps(
    conn: &mut AsyncPgConnection,
    country: &str,
    region: Option<&str>,
) -> Result<i32> {
    let rows: Vec<TaxRateEntity> = tax_rates::table
        .filter(tax_rates::is_active.eq(true))
        .filter(tax_rates::country.eq(country.to_uppercase()))
        .select(TaxRateEntity::as_select())
        .load(conn)
        .await
        .context("Failed to load tax rates")?;

    let rules: Vec<TaxRule> = rows.iter().map(TaxRule::from).collect();
    Ok(tax::resolve_rate_bps(&rules, country, region))
}
