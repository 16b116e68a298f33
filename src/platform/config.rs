use std::{net::SocketAddr, str::FromStr};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub cron_secret: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"[redacted]")
            .field("cron_secret", &"[redacted]")
            .finish()
    }
}

#[derive(Clone)]
pub struct PaymentsConfig {
    pub api_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

impl std::fmt::Debug for PaymentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentsConfig")
            .field("api_url", &self.api_url)
            .field("webhook_tolerance_secs", &self.webhook_tolerance_secs)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct AbandonedCartConfig {
    pub after_hours: i64,
    pub reminder_interval_hours: i64,
    pub max_reminders: i32,
}

#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub poll_interval_secs: u64,
    pub max_attempts: i32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub payments: PaymentsConfig,
    pub email: EmailConfig,
    pub store: StoreConfig,
    pub abandoned_carts: AbandonedCartConfig,
    pub outbox: OutboxConfig,
}

/// Reads the service configuration from the process environment.
///
/// Call [`crate::platform::bootstrap::init_env`] first so `.env` values are visible.
pub fn load() -> Result<AppConfig> {
    load_from(|key| std::env::var(key).ok())
}

/// Builds the configuration from an arbitrary key lookup.
pub fn load_from<F>(lookup: F) -> Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let required = |key: &str| -> Result<String> {
        lookup(key)
            .filter(|value| !value.trim().is_empty())
            .with_context(|| format!("Missing required environment variable {key}"))
    };
    let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

    Ok(AppConfig {
        database: DatabaseConfig {
            url: required("DATABASE_URL")?,
        },
        server: ServerConfig {
            addr: parse(&or_default("SERVER_ADDR", "0.0.0.0:3000"), "SERVER_ADDR")?,
        },
        auth: AuthConfig {
            jwt_secret: required("JWT_SECRET")?,
            cron_secret: required("CRON_SECRET")?,
        },
        payments: PaymentsConfig {
            api_url: or_default("PAYMENT_API_URL", "https://api.stripe.com")
                .trim_end_matches('/')
                .to_string(),
            secret_key: required("PAYMENT_SECRET_KEY")?,
            webhook_secret: required("PAYMENT_WEBHOOK_SECRET")?,
            webhook_tolerance_secs: parse(
                &or_default("PAYMENT_WEBHOOK_TOLERANCE_SECS", "300"),
                "PAYMENT_WEBHOOK_TOLERANCE_SECS",
            )?,
        },
        email: EmailConfig {
            api_url: or_default("EMAIL_API_URL", "https://api.resend.com")
                .trim_end_matches('/')
                .to_string(),
            api_key: required("EMAIL_API_KEY")?,
            from: or_default("EMAIL_FROM", "Store <orders@example.com>"),
        },
        store: StoreConfig {
            url: or_default("STORE_URL", "http://localhost:3000")
                .trim_end_matches('/')
                .to_string(),
            currency: or_default("STORE_CURRENCY", "usd").to_lowercase(),
        },
        abandoned_carts: AbandonedCartConfig {
            after_hours: parse(
                &or_default("ABANDONED_CART_AFTER_HOURS", "24"),
                "ABANDONED_CART_AFTER_HOURS",
            )?,
            reminder_interval_hours: parse(
                &or_default("ABANDONED_CART_REMINDER_INTERVAL_HOURS", "24"),
                "ABANDONED_CART_REMINDER_INTERVAL_HOURS",
            )?,
            max_reminders: parse(
                &or_default("ABANDONED_CART_MAX_REMINDERS", "2"),
                "ABANDONED_CART_MAX_REMINDERS",
            )?,
        },
        outbox: OutboxConfig {
            poll_interval_secs: parse(
                &or_default("OUTBOX_POLL_INTERVAL_SECS", "10"),
                "OUTBOX_POLL_INTERVAL_SECS",
            )?,
            max_attempts: parse(&or_default("OUTBOX_MAX_ATTEMPTS", "5"), "OUTBOX_MAX_ATTEMPTS")?,
        },
    })
}

fn parse<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("Invalid value for {key}: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/store"),
            ("JWT_SECRET", "jwt"),
            ("CRON_SECRET", "cron"),
            ("PAYMENT_SECRET_KEY", "sk_test"),
            ("PAYMENT_WEBHOOK_SECRET", "whsec"),
            ("EMAIL_API_KEY", "re_test"),
        ])
    }

    fn load_map(env: &HashMap<&'static str, &'static str>) -> Result<AppConfig> {
        load_from(|key| env.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_are_applied() {
        let config = load_map(&base_env()).unwrap();
        assert_eq!(config.server.addr.port(), 3000);
        assert_eq!(config.payments.api_url, "https://api.stripe.com");
        assert_eq!(config.payments.webhook_tolerance_secs, 300);
        assert_eq!(config.store.currency, "usd");
        assert_eq!(config.abandoned_carts.after_hours, 24);
        assert_eq!(config.abandoned_carts.max_reminders, 2);
        assert_eq!(config.outbox.max_attempts, 5);
    }

    #[test]
    fn missing_required_variable_is_reported() {
        let mut env = base_env();
        env.remove("JWT_SECRET");
        let err = load_map(&env).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn invalid_number_is_reported() {
        let mut env = base_env();
        env.insert("ABANDONED_CART_AFTER_HOURS", "soon");
        let err = load_map(&env).unwrap_err();
        assert!(err.to_string().contains("ABANDONED_CART_AFTER_HOURS"));
    }

    #[test]
    fn trailing_slashes_are_trimmed() {
        let mut env = base_env();
        env.insert("STORE_URL", "https://shop.example.com/");
        let config = load_map(&env).unwrap();
        assert_eq!(config.store.url, "https://shop.example.com");
    }

    #[test]
    fn secrets_are_not_debug_printed() {
        let config = load_map(&base_env()).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("sk_test"));
        assert!(!printed.contains("whsec"));
    }
}
