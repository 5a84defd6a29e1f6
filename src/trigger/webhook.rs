//! Inbound webhook handler.
//!
//! Verifies the HMAC signature over the raw body, recognizes the two event
//! shapes that start a review run (an exact mention comment, and pull
//! request opened/synchronize/reopened), checks eligibility against the
//! registry, and takes the dedup guard synchronously so the HTTP response
//! reflects the real decision.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::errors::TriggerError;
use crate::models::{ReviewParams, StartDecision, WorkflowParams};
use crate::providers::HostProvider;
use crate::workflow::Orchestrator;

#[derive(Clone)]
pub struct WebhookState {
    pub db: DbHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub host: Arc<dyn HostProvider>,
    pub secret: String,
    pub mention_command: String,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: Option<String>,
    repository: RepositoryPayload,
    #[serde(default)]
    comment: Option<CommentPayload>,
    #[serde(default)]
    issue: Option<IssuePayload>,
    #[serde(default)]
    pull_request: Option<PullRequestPayload>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    body: String,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: i64,
    /// Present (any value) when the issue is actually a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    number: i64,
    head: BranchRef,
    base: BranchRef,
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        match self {
            TriggerError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "invalid signature").into_response()
            }
            TriggerError::MalformedPayload(msg) => {
                (StatusCode::BAD_REQUEST, format!("malformed payload: {}", msg)).into_response()
            }
            // Webhook deliveries for repos we won't act on are acknowledged,
            // not failed; the provider would otherwise retry and alert.
            TriggerError::NotEligible { repo, reason } => (
                StatusCode::OK,
                axum::Json(json!({ "status": "ignored", "repo": repo, "reason": reason })),
            )
                .into_response(),
            TriggerError::Store(e) | TriggerError::StartFailed(e) => {
                warn!(error = %format!("{:#}", e), "webhook processing failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

/// Constant-time check of `X-Hub-Signature-256` against the raw body.
fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), TriggerError> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or(TriggerError::InvalidSignature)?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(TriggerError::InvalidSignature)?;
    let expected = hex::decode(hex_digest).map_err(|_| TriggerError::InvalidSignature)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| TriggerError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| TriggerError::InvalidSignature)
}

/// True when the comment body is exactly the mention command, modulo
/// surrounding whitespace and case. Substring matches do not trigger.
fn is_mention(body: &str, mention_command: &str) -> bool {
    body.trim().to_lowercase() == mention_command
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TriggerError> {
    verify_signature(&state.secret, &headers, &body)?;

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let payload: WebhookPayload =
        serde_json::from_slice(&body).map_err(|e| TriggerError::MalformedPayload(e.to_string()))?;

    let pr_number = match recognize(event, &payload, &state.mention_command) {
        Some(n) => n,
        None => return Ok(ack("ignored")),
    };

    let repo_name = payload.repository.full_name.clone();
    let repo = state
        .db
        .call(move |store| store.get_repository_by_full_name(&repo_name))
        .await
        .map_err(TriggerError::Store)?
        .ok_or_else(|| TriggerError::NotEligible {
            repo: payload.repository.full_name.clone(),
            reason: "repository not registered".to_string(),
        })?;
    if !repo.reviews_enabled {
        return Err(TriggerError::NotEligible {
            repo: repo.full_name,
            reason: "reviews disabled".to_string(),
        });
    }
    let org_id = repo.org_id;
    let org = state
        .db
        .call(move |store| store.get_organization(org_id))
        .await
        .map_err(TriggerError::Store)?
        .ok_or_else(|| TriggerError::NotEligible {
            repo: repo.full_name.clone(),
            reason: "organization not registered".to_string(),
        })?;
    let Some(billing_account_id) = org.billing_account_id.clone() else {
        return Err(TriggerError::NotEligible {
            repo: repo.full_name,
            reason: "organization has no billing account".to_string(),
        });
    };

    // The mention path only knows the PR number; resolve branches before
    // the run's params are persisted.
    let (pr_branch, base_branch) = match &payload.pull_request {
        Some(pr) => (pr.head.name.clone(), pr.base.name.clone()),
        None => {
            let info = state
                .host
                .get_pull_request(org.installation_id, &repo.full_name, pr_number)
                .await
                .map_err(TriggerError::StartFailed)?;
            (info.head_ref, info.base_ref)
        }
    };

    let params = ReviewParams {
        org_id: org.id,
        repo_id: repo.id,
        repo_full_name: repo.full_name.clone(),
        pr_number,
        pr_branch,
        base_branch,
        installation_id: org.installation_id,
        billing_account_id,
    };
    let workflow = WorkflowParams::Review(params);
    let stored = workflow.clone();
    let (repo_id, org_id, full_name) = (repo.id, org.id, repo.full_name.clone());
    let decision = state
        .db
        .call(move |store| store.try_start(repo_id, org_id, &full_name, Some(pr_number), &stored))
        .await
        .map_err(TriggerError::Store)?;

    match decision {
        StartDecision::Started(run_id) => {
            info!(repo = %repo.full_name, pr = pr_number, run_id = %run_id, "review run started");
            state.orchestrator.start(run_id.clone(), workflow);
            Ok((StatusCode::OK, axum::Json(json!({ "status": "started", "run_id": run_id })))
                .into_response())
        }
        StartDecision::Skipped => Ok(ack("skipped")),
    }
}

fn ack(status: &str) -> Response {
    (StatusCode::OK, axum::Json(json!({ "status": status }))).into_response()
}

/// Map a recognized event to the PR number it targets; `None` means the
/// delivery is acknowledged and dropped.
fn recognize(event: &str, payload: &WebhookPayload, mention_command: &str) -> Option<i64> {
    match event {
        "issue_comment" => {
            if payload.action.as_deref() != Some("created") {
                return None;
            }
            let comment = payload.comment.as_ref()?;
            let issue = payload.issue.as_ref()?;
            issue.pull_request.as_ref()?;
            if !is_mention(&comment.body, mention_command) {
                return None;
            }
            Some(issue.number)
        }
        "pull_request" => {
            let action = payload.action.as_deref()?;
            if !matches!(action, "opened" | "synchronize" | "reopened") {
                return None;
            }
            payload.pull_request.as_ref().map(|pr| pr.number)
        }
        _ => None,
    }
}
