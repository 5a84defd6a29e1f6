//! HTTP client for the execution-environment provider.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::SandboxProvider;
use crate::config::SandboxConfig;
use crate::models::ExecOutput;

pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    timeout_secs: u64,
    env: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    cost_usd: f64,
}

impl HttpSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            timeout_secs: config.timeout_secs,
            env: config.env.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SandboxProvider for HttpSandbox {
    async fn create(&self, repo_full_name: &str, token: &str) -> Result<String> {
        let resp: CreateResponse = self
            .client
            .post(self.url("/environments"))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({
                "repo": repo_full_name,
                "token": token,
                "timeout_secs": self.timeout_secs,
                "env": self.env,
            }))
            .send()
            .await
            .context("Failed to create environment")?
            .error_for_status()
            .context("Environment create returned error status")?
            .json()
            .await
            .context("Failed to parse environment create response")?;
        Ok(resp.id)
    }

    async fn exec(&self, env_id: &str, argv: &[String]) -> Result<ExecOutput> {
        self.client
            .post(self.url(&format!("/environments/{}/exec", env_id)))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "argv": argv }))
            .send()
            .await
            .context("Failed to exec in environment")?
            .error_for_status()
            .context("Environment exec returned error status")?
            .json()
            .await
            .context("Failed to parse exec response")
    }

    async fn extend_timeout(&self, env_id: &str, extra_secs: u64) -> Result<()> {
        self.client
            .post(self.url(&format!("/environments/{}/timeout", env_id)))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "extend_secs": extra_secs }))
            .send()
            .await
            .context("Failed to extend environment timeout")?
            .error_for_status()
            .context("Environment timeout extension returned error status")?;
        Ok(())
    }

    async fn usage_usd(&self, env_id: &str) -> Result<f64> {
        let resp: UsageResponse = self
            .client
            .get(self.url(&format!("/environments/{}/usage", env_id)))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to query environment usage")?
            .error_for_status()
            .context("Environment usage returned error status")?
            .json()
            .await
            .context("Failed to parse usage response")?;
        Ok(resp.cost_usd)
    }

    async fn stop(&self, env_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/environments/{}", env_id)))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("Failed to stop environment")?;
        // Already gone is fine: stop must be idempotent.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .context("Environment stop returned error status")?;
        Ok(())
    }
}
