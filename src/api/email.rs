use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::platform::{app_error::AppError, config::EmailConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

pub struct EmailClient {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct SendEmailReq<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SendEmailRes {
    id: String,
}

impl EmailClient {
    pub fn new(client: Client, config: &EmailConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        }
    }

    /// Sends one message and returns the provider's message id.
    pub async fn send(&self, message: &EmailMessage) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&SendEmailReq {
                from: &self.from,
                to: [&message.to],
                subject: &message.subject,
                html: &message.html,
                text: &message.text,
            })
            .send()
            .await
            .map_err(|_| AppError::ServiceUnreachable("EmailService".into()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Email service returned {}: {}", status, body);
        }

        let sent: SendEmailRes = response.json().await.context("Failed to parse JSON")?;
        Ok(sent.id)
    }
}
