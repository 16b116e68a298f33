//! Abandoned-cart detection and reminder scheduling.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::platform::config::AbandonedCartConfig;

#[derive(Debug, Clone, Copy)]
pub struct AbandonmentPolicy {
    pub after: Duration,
    pub reminder_interval: Duration,
    pub max_reminders: i32,
}

impl From<&AbandonedCartConfig> for AbandonmentPolicy {
    fn from(config: &AbandonedCartConfig) -> Self {
        Self {
            after: Duration::hours(config.after_hours),
            reminder_interval: Duration::hours(config.reminder_interval_hours),
            max_reminders: config.max_reminders,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CartActivity {
    pub is_active: bool,
    pub item_count: usize,
    pub email: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReminderState {
    pub reminder_count: i32,
    pub last_reminded_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
    pub cart_updated_at: DateTime<Utc>,
}

impl AbandonmentPolicy {
    /// Carts untouched since this instant are candidates.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.after
    }

    pub fn is_abandoned(&self, cart: &CartActivity, now: DateTime<Utc>) -> bool {
        cart.is_active
            && cart.item_count > 0
            && cart.email.as_deref().is_some_and(|email| !email.trim().is_empty())
            && cart.updated_at < self.cutoff(now)
    }

    pub fn reminder_due(&self, state: &ReminderState, now: DateTime<Utc>) -> bool {
        if state.recovered_at.is_some() || state.reminder_count >= self.max_reminders {
            return false;
        }
        match state.last_reminded_at {
            None => true,
            Some(last) => {
                now - last >= self.reminder_interval && state.cart_updated_at <= last
            }
        }
    }
}

pub fn recovery_url(store_url: &str, token: Uuid) -> String {
    format!("{}/cart/recover/{}", store_url.trim_end_matches('/'), token)
}
