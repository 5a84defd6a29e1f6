//! HTTP client for the billing/metering provider.

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::BillingProvider;
use crate::config::BillingConfig;

pub struct HttpBilling {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpBilling {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl BillingProvider for HttpBilling {
    async fn record_usage(
        &self,
        billing_account_id: &str,
        amount_minor_units: i64,
        idempotency_key: &str,
    ) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/meter_events", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({
                "billing_account_id": billing_account_id,
                "amount_minor_units": amount_minor_units,
                "idempotency_key": idempotency_key,
            }))
            .send()
            .await
            .context("Failed to emit meter event")?;

        // The provider answers 409 when the idempotency key was already
        // consumed; the usage is recorded, so treat it as success.
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        resp.error_for_status()
            .context("Meter event endpoint returned error status")?;
        Ok(())
    }
}
