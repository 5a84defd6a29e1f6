//! External collaborators, each behind a narrow async trait.
//!
//! The orchestrator only ever sees these traits; the real implementations
//! (`GithubHost`, `HttpSandbox`, `HttpBilling`) are thin reqwest clients,
//! and tests substitute in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ExecOutput, PullRequestInfo, PullRequestRef, PushAccess};

pub mod billing;
pub mod github;
pub mod sandbox;

pub use billing::HttpBilling;
pub use github::GithubHost;
pub use sandbox::HttpSandbox;

/// Source-code hosting provider operations.
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// Check whether the installation can push to the given branch.
    async fn check_push_access(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<PushAccess>;

    /// Mint a short-lived access token for the installation.
    async fn get_access_token(&self, installation_id: i64) -> Result<String>;

    /// Look up an existing pull request's head and base branches.
    async fn get_pull_request(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        number: i64,
    ) -> Result<PullRequestInfo>;

    async fn create_pull_request(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        head_branch: &str,
        base_branch: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequestRef>;

    /// Post a comment on an issue or pull request. Callers treat failures
    /// as best-effort; the trait itself still reports them.
    async fn add_comment(
        &self,
        installation_id: i64,
        repo_full_name: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()>;
}

/// Ephemeral execution-environment provider. Environments are exclusively
/// leased: created at most once per run, stopped exactly once, never reused.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision an environment with the repository checked out.
    /// Returns the opaque environment id.
    async fn create(&self, repo_full_name: &str, token: &str) -> Result<String>;

    /// Run a command inside the environment.
    async fn exec(&self, env_id: &str, argv: &[String]) -> Result<ExecOutput>;

    /// Grant the environment extra lifetime before a long step.
    async fn extend_timeout(&self, env_id: &str, extra_secs: u64) -> Result<()>;

    /// Compute cost accumulated by the provider so far, in USD.
    async fn usage_usd(&self, env_id: &str) -> Result<f64>;

    /// Stop the environment. Must be idempotent and tolerate ids that were
    /// never created.
    async fn stop(&self, env_id: &str) -> Result<()>;
}

/// Billing/metering provider.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Emit one meter event. `idempotency_key` deduplicates retried
    /// emissions of the same run's usage.
    async fn record_usage(
        &self,
        billing_account_id: &str,
        amount_minor_units: i64,
        idempotency_key: &str,
    ) -> Result<()>;
}
