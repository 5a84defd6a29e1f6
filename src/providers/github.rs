//! GitHub implementation of [`HostProvider`].
//!
//! One `reqwest::Client` is shared across calls. The app-level credential
//! authenticates installation-token minting; minted tokens are used for
//! nothing here — they are handed to the sandbox so git operations run
//! inside the leased environment, not on this host.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::HostProvider;
use crate::config::GithubConfig;
use crate::models::{PullRequestInfo, PullRequestRef, PushAccess};

const USER_AGENT: &str = "codemend";

pub struct GithubHost {
    client: reqwest::Client,
    api_base: String,
    app_token: String,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    #[serde(default)]
    permissions: Option<RepoPermissions>,
    #[serde(default)]
    archived: bool,
}

#[derive(Debug, Deserialize)]
struct RepoPermissions {
    #[serde(default)]
    push: bool,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: i64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct PullDetailResponse {
    number: i64,
    head: GitRef,
    base: GitRef,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    git_ref: String,
}

impl GithubHost {
    pub fn new(config: &GithubConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            app_token: config.app_token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

#[async_trait]
impl HostProvider for GithubHost {
    async fn check_push_access(
        &self,
        _installation_id: i64,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<PushAccess> {
        let resp = self
            .client
            .get(self.url(&format!("/repos/{}", repo_full_name)))
            .bearer_auth(&self.app_token)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to query repository")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(PushAccess {
                can_push: false,
                reason: Some(format!("repository {} not accessible", repo_full_name)),
            });
        }
        let repo: RepoResponse = resp
            .error_for_status()
            .context("Repository lookup returned error status")?
            .json()
            .await
            .context("Failed to parse repository response")?;

        if repo.archived {
            return Ok(PushAccess {
                can_push: false,
                reason: Some("repository is archived".to_string()),
            });
        }
        if !repo.permissions.map(|p| p.push).unwrap_or(false) {
            return Ok(PushAccess {
                can_push: false,
                reason: Some(format!("no push permission on branch {}", branch)),
            });
        }
        Ok(PushAccess {
            can_push: true,
            reason: None,
        })
    }

    async fn get_access_token(&self, installation_id: i64) -> Result<String> {
        let resp: InstallationTokenResponse = self
            .client
            .post(self.url(&format!(
                "/app/installations/{}/access_tokens",
                installation_id
            )))
            .bearer_auth(&self.app_token)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to request installation token")?
            .error_for_status()
            .context("Installation token endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse installation token response")?;
        Ok(resp.token)
    }

    async fn get_pull_request(
        &self,
        _installation_id: i64,
        repo_full_name: &str,
        number: i64,
    ) -> Result<PullRequestInfo> {
        let resp: PullDetailResponse = self
            .client
            .get(self.url(&format!("/repos/{}/pulls/{}", repo_full_name, number)))
            .bearer_auth(&self.app_token)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .context("Failed to fetch pull request")?
            .error_for_status()
            .context("Pull request lookup returned error status")?
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(PullRequestInfo {
            number: resp.number,
            head_ref: resp.head.git_ref,
            base_ref: resp.base.git_ref,
        })
    }

    async fn create_pull_request(
        &self,
        _installation_id: i64,
        repo_full_name: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef> {
        let resp: PullResponse = self
            .client
            .post(self.url(&format!("/repos/{}/pulls", repo_full_name)))
            .bearer_auth(&self.app_token)
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({
                "title": title,
                "head": head_branch,
                "base": base_branch,
                "body": body,
            }))
            .send()
            .await
            .context("Failed to create pull request")?
            .error_for_status()
            .context("Pull request endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse pull request response")?;
        Ok(PullRequestRef {
            number: resp.number,
            url: resp.html_url,
        })
    }

    async fn add_comment(
        &self,
        _installation_id: i64,
        repo_full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()> {
        self.client
            .post(self.url(&format!(
                "/repos/{}/issues/{}/comments",
                repo_full_name, issue_number
            )))
            .bearer_auth(&self.app_token)
            .header("User-Agent", USER_AGENT)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to post comment")?
            .error_for_status()
            .context("Comment endpoint returned error status")?;
        Ok(())
    }
}
