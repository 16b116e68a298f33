use std::collections::HashMap;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::platform::{app_error::AppError, config::PaymentsConfig};

const SERVICE_NAME: &str = "PaymentProcessor";

pub struct PaymentsClient {
    client: Client,
    api_url: String,
    secret_key: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutLineItem {
    pub name: String,
    pub unit_amount_cents: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub currency: String,
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub client_reference_id: String,
    pub metadata: Vec<(String, String)>,
}

impl CheckoutSessionRequest {
    /// Flattens the request into the processor's bracketed form encoding.
    pub fn to_form(&self) -> Vec<(String, String)> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), self.success_url.clone()),
            ("cancel_url".to_string(), self.cancel_url.clone()),
            (
                "client_reference_id".to_string(),
                self.client_reference_id.clone(),
            ),
        ];
        if let Some(email) = &self.customer_email {
            form.push(("customer_email".to_string(), email.clone()));
        }
        for (index, item) in self.line_items.iter().enumerate() {
            let prefix = format!("line_items[{index}]");
            form.push((
                format!("{prefix}[price_data][currency]"),
                self.currency.clone(),
            ));
            form.push((
                format!("{prefix}[price_data][unit_amount]"),
                item.unit_amount_cents.to_string(),
            ));
            form.push((
                format!("{prefix}[price_data][product_data][name]"),
                item.name.clone(),
            ));
            form.push((format!("{prefix}[quantity]"), item.quantity.to_string()));
        }
        for (key, value) in &self.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }
        form
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    pub status: String,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: Option<String>,
}

impl PaymentsClient {
    pub fn new(client: Client, config: &PaymentsConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    pub async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        self.post_form("/v1/checkout/sessions", &request.to_form())
            .await
            .context("Failed to create checkout session")
    }

    /// Issues a refund. `refund_id` is echoed back in the refund's metadata
    /// so the `charge.refunded` webhook can match it to the reserved row.
    pub async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_cents: i64,
        reason: &str,
        order_id: i32,
        refund_id: Uuid,
    ) -> Result<ProviderRefund> {
        let form = refund_form(payment_intent_id, amount_cents, reason, order_id, refund_id);
        self.post_form("/v1/refunds", &form)
            .await
            .context("Failed to create refund")
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.api_url, path))
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|_| AppError::ServiceUnreachable(SERVICE_NAME.into()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ProviderErrorBody>()
                .await
                .ok()
                .and_then(|body| body.error.message)
                .unwrap_or_else(|| status.to_string());
            return Err(AppError::BadRequest(format!("Payment processor: {message}")).into());
        }

        response.json().await.context("Failed to parse JSON")
    }
}

pub const REFUND_ID_METADATA: &str = "refund_id";

fn refund_form(
    payment_intent_id: &str,
    amount_cents: i64,
    reason: &str,
    order_id: i32,
    refund_id: Uuid,
) -> Vec<(String, String)> {
    vec![
        ("payment_intent".to_string(), payment_intent_id.to_string()),
        ("amount".to_string(), amount_cents.to_string()),
        ("reason".to_string(), "requested_by_customer".to_string()),
        ("metadata[order_id]".to_string(), order_id.to_string()),
        (
            format!("metadata[{REFUND_ID_METADATA}]"),
            refund_id.to_string(),
        ),
        ("metadata[note]".to_string(), reason.to_string()),
    ]
}

// Webhooks

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing or malformed signature header")]
    Malformed,
    #[error("Signature timestamp is outside the tolerance window")]
    Stale,
    #[error("No signature matches the payload")]
    Mismatch,
}

type HmacSha256 = Hmac<Sha256>;

/// Verifies a `t=<unix>,v1=<hex>[,v1=<hex>...]` signature header over `"<t>.<payload>"`.
pub fn verify_signature(
    header: &str,
    payload: &[u8],
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if now_unix.abs_diff(timestamp) > tolerance_secs.max(0).unsigned_abs() {
        return Err(SignatureError::Stale);
    }

    let matches = signatures.iter().any(|signature| {
        keyed_mac(secret, timestamp, payload).is_some_and(|mac| mac.verify_slice(signature).is_ok())
    });

    if matches {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn keyed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Some(mac)
}

/// Produces a header value accepted by [`verify_signature`].
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> Option<String> {
    let signature = hex::encode(keyed_mac(secret, timestamp, payload)?.finalize().into_bytes());
    Some(format!("t={timestamp},v1={signature}"))
}

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub payment_intent: Option<String>,
    pub payment_status: String,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub client_reference_id: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub payment_intent: Option<String>,
    pub amount_refunded: i64,
    #[serde(default)]
    pub refunds: Option<ChargeRefunds>,
}

impl ChargeObject {
    /// Individual refunds listed on the charge, newest first as sent.
    pub fn refund_list(&self) -> &[ChargeRefund] {
        self.refunds.as_ref().map_or(&[], |list| list.data.as_slice())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChargeRefunds {
    #[serde(default)]
    pub data: Vec<ChargeRefund>,
}

#[derive(Debug, Deserialize)]
pub struct ChargeRefund {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ChargeRefund {
    /// The local refund row this refund was issued for, if it came from us.
    pub fn local_refund_id(&self) -> Option<Uuid> {
        self.metadata
            .get(REFUND_ID_METADATA)
            .and_then(|id| Uuid::parse_str(id).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn accepts_a_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(&header, payload, SECRET, 300, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn accepts_any_of_several_v1_entries() {
        let payload = b"{}";
        let valid = sign_payload(payload, SECRET, 1_700_000_000).unwrap();
        let valid_sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t=1700000000,v1={},v1={}", "00".repeat(32), valid_sig);
        assert!(verify_signature(&header, payload, SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_tampered_payload_and_wrong_secret() {
        let header = sign_payload(b"{\"amount\":100}", SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(&header, b"{\"amount\":1}", SECRET, 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(&header, b"{\"amount\":100}", "other", 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_and_malformed_headers() {
        let header = sign_payload(b"{}", SECRET, 1_700_000_000).unwrap();
        assert_eq!(
            verify_signature(&header, b"{}", SECRET, 300, 1_700_000_301),
            Err(SignatureError::Stale)
        );
        assert_eq!(
            verify_signature("v1=abcd", b"{}", SECRET, 300, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature("t=1", b"{}", SECRET, 300, 1),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        for header in [
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            assert_eq!(
                verify_signature(header, b"{}", SECRET, 300, 1_700_000_000),
                Err(SignatureError::Stale)
            );
        }
        assert_eq!(
            verify_signature("t=0,v1=00", b"{}", SECRET, i64::MIN, i64::MAX),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn refund_form_carries_the_local_refund_id() {
        let refund_id = Uuid::nil();
        let form = refund_form("pi_1", 1500, "damaged", 7, refund_id);
        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("amount"), Some("1500"));
        assert_eq!(get("metadata[order_id]"), Some("7"));
        assert_eq!(
            get("metadata[refund_id]"),
            Some("00000000-0000-0000-0000-000000000000")
        );
    }

    #[test]
    fn charge_refunds_expose_local_ids() {
        let raw = serde_json::json!({
            "id": "ch_1",
            "payment_intent": "pi_1",
            "amount_refunded": 2500,
            "refunds": { "data": [
                { "id": "re_2", "amount": 1000, "metadata": {} },
                { "id": "re_1", "amount": 1500, "status": "succeeded",
                  "metadata": { "refund_id": "00000000-0000-0000-0000-000000000000" } }
            ]}
        });
        let charge: ChargeObject = serde_json::from_value(raw).unwrap();
        let refunds = charge.refund_list();
        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].local_refund_id(), None);
        assert_eq!(refunds[1].local_refund_id(), Some(Uuid::nil()));

        let bare: ChargeObject = serde_json::from_value(serde_json::json!({
            "id": "ch_2", "payment_intent": null, "amount_refunded": 0
        }))
        .unwrap();
        assert!(bare.refund_list().is_empty());
    }

    #[test]
    fn checkout_form_uses_bracketed_keys() {
        let request = CheckoutSessionRequest {
            currency: "usd".into(),
            line_items: vec![CheckoutLineItem {
                name: "Tee (M) x 2".into(),
                unit_amount_cents: 3600,
                quantity: 1,
            }],
            success_url: "https://shop/success".into(),
            cancel_url: "https://shop/cart".into(),
            customer_email: Some("a@b.co".into()),
            client_reference_id: "42".into(),
            metadata: vec![("cart_id".into(), "42".into())],
        };
        let form = request.to_form();
        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("mode"), Some("payment"));
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("3600"));
        assert_eq!(
            get("line_items[0][price_data][product_data][name]"),
            Some("Tee (M) x 2")
        );
        assert_eq!(get("metadata[cart_id]"), Some("42"));
        assert_eq!(get("customer_email"), Some("a@b.co"));
    }

    #[test]
    fn parses_checkout_completed_event() {
        let raw = serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_1",
                "payment_intent": "pi_1",
                "payment_status": "paid",
                "amount_total": 8660,
                "currency": "usd",
                "client_reference_id": "7",
                "customer_details": { "email": "a@b.co" },
                "metadata": { "cart_id": "7" }
            }}
        });
        let event: WebhookEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, "checkout.session.completed");
        let session: CheckoutSessionObject = serde_json::from_value(event.data.object).unwrap();
        assert_eq!(session.amount_total, Some(8660));
        assert_eq!(session.metadata.get("cart_id").map(String::as_str), Some("7"));
    }
}
