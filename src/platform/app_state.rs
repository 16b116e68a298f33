use std::sync::Arc;

use reqwest::Client;

use crate::{
    api::{email::EmailClient, payments::PaymentsClient},
    platform::{aliases::DbPool, config::AppConfig},
};

#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub http_client: Client,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, db_pool: DbPool) -> Self {
        Self {
            db_pool,
            http_client: Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn payments(&self) -> PaymentsClient {
        PaymentsClient::new(self.http_client.clone(), &self.config.payments)
    }

    pub fn email(&self) -> EmailClient {
        EmailClient::new(self.http_client.clone(), &self.config.email)
    }
}
