//! Workflow orchestration.
//!
//! Two shapes share this infrastructure: the scheduled repository sweep
//! (`sweep`) and the pull-request review (`review`). Both are sequences of
//! checkpointed steps (see [`crate::exec`]) over the provider traits, with
//! one invariant enforced by the wrapper in this module: no exit path skips
//! the environment release or the terminal run-state update.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::billing::UsageRecorder;
use crate::config::AppConfig;
use crate::db::{DbHandle, TerminalFields};
use crate::errors::WorkflowError;
use crate::exec::StepContext;
use crate::guard::SandboxGuard;
use crate::models::{
    PullRequestRef, ReviewParams, RunStatus, SweepParams, WorkflowParams,
};
use crate::providers::{BillingProvider, HostProvider, SandboxProvider};

mod review;
mod sweep;

/// What a workflow body produced, before it is translated into a terminal
/// run status.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// A new pull request was opened (sweep).
    PrCreated(PullRequestRef),
    /// Fix commits were pushed onto an existing pull request (review).
    PushedFixes { sections: Vec<String> },
    /// Nothing left to do. `note` carries a non-fatal explanation such as
    /// the AI fixer declining the remaining issues.
    NoIssues { note: Option<String> },
}

pub struct Orchestrator {
    pub(crate) config: AppConfig,
    pub(crate) db: DbHandle,
    pub(crate) host: Arc<dyn HostProvider>,
    pub(crate) sandbox: Arc<dyn SandboxProvider>,
    pub(crate) billing: Arc<dyn BillingProvider>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        db: DbHandle,
        host: Arc<dyn HostProvider>,
        sandbox: Arc<dyn SandboxProvider>,
        billing: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            config,
            db,
            host,
            sandbox,
            billing,
        }
    }

    /// Fire-and-forget start. The spawned invocation persists its own
    /// outcome; callers get nothing back (trigger-layer contract).
    pub fn start(self: &Arc<Self>, run_id: String, params: WorkflowParams) {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orch.execute(&run_id, params).await {
                error!(run_id = %run_id, error = %format!("{:#}", e), "workflow finished with error");
            }
        });
    }

    /// Run one workflow invocation to completion. Used by `start` and by
    /// the resume path; safe to call again for an interrupted run because
    /// completed steps replay from the step log.
    pub async fn execute(&self, run_id: &str, params: WorkflowParams) -> Result<()> {
        match params {
            WorkflowParams::Sweep(p) => self.execute_sweep(run_id, p).await,
            WorkflowParams::Review(p) => self.execute_review(run_id, p).await,
        }
    }

    /// Re-drive every run left in `running` by a previous process.
    /// Returns the number of runs resumed.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<usize> {
        let runs = self.db.call(|store| store.list_running_runs()).await?;
        let count = runs.len();
        for run in runs {
            let params: WorkflowParams = serde_json::from_str(&run.params)
                .with_context(|| format!("Corrupt params for run {}", run.id))?;
            info!(run_id = %run.id, kind = %run.workflow_kind, "resuming interrupted run");
            self.start(run.id, params);
        }
        Ok(count)
    }

    /// Like [`resume_incomplete`](Self::resume_incomplete), but drives each
    /// run to completion before returning. Used by the `resume` subcommand,
    /// where the process exits once this returns.
    pub async fn resume_and_wait(&self) -> Result<usize> {
        let runs = self.db.call(|store| store.list_running_runs()).await?;
        let count = runs.len();
        for run in runs {
            let params: WorkflowParams = serde_json::from_str(&run.params)
                .with_context(|| format!("Corrupt params for run {}", run.id))?;
            info!(run_id = %run.id, kind = %run.workflow_kind, "resuming interrupted run");
            if let Err(e) = self.execute(&run.id, params).await {
                warn!(run_id = %run.id, error = %format!("{:#}", e), "resumed run failed");
            }
        }
        Ok(count)
    }

    async fn execute_sweep(&self, run_id: &str, params: SweepParams) -> Result<()> {
        let ctx = StepContext::new(self.db.clone(), run_id);
        let mut guard = SandboxGuard::new(Arc::clone(&self.sandbox));

        let result = sweep::run(self, &ctx, &mut guard, &params).await;
        self.settle_costs(&ctx, &mut guard).await;

        match result {
            Ok(outcome) => {
                // Billing failure after a successful body fails the run:
                // usage was incurred and could not be reported.
                if let Err(e) = self.report_billing(&ctx, &params.billing_account_id).await {
                    self.finish(run_id, RunStatus::Failed, TerminalFields {
                        error: Some(format!("{:#}", e)),
                        ..Default::default()
                    })
                    .await?;
                    return Err(e.into());
                }
                self.finish_success(run_id, outcome).await
            }
            Err(e) => {
                let message = e.to_string();
                warn!(run_id, error = %message, "sweep run failed");
                self.finish(run_id, RunStatus::Failed, TerminalFields {
                    error: Some(message),
                    ..Default::default()
                })
                .await?;
                Err(e.into())
            }
        }
    }

    async fn execute_review(&self, run_id: &str, params: ReviewParams) -> Result<()> {
        let ctx = StepContext::new(self.db.clone(), run_id);
        let mut guard = SandboxGuard::new(Arc::clone(&self.sandbox));

        let result = review::run(self, &ctx, &mut guard, &params).await;
        self.settle_costs(&ctx, &mut guard).await;

        match result {
            Ok(outcome) => {
                if let Err(e) = self.report_billing(&ctx, &params.billing_account_id).await {
                    self.finish(run_id, RunStatus::Failed, TerminalFields {
                        error: Some(format!("{:#}", e)),
                        ..Default::default()
                    })
                    .await?;
                    return Err(e.into());
                }
                self.post_review_summary(&params, &outcome).await;
                match outcome {
                    Outcome::PushedFixes { .. } => {
                        self.finish(run_id, RunStatus::SuccessPrCreated, TerminalFields {
                            pr_number: Some(params.pr_number),
                            pr_url: Some(review_pr_url(&self.config.github.web_base, &params)),
                            error: None,
                        })
                        .await
                    }
                    _ => self.finish(run_id, RunStatus::SuccessNoIssues, TerminalFields::default()).await,
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(run_id, error = %message, "review run failed");
                self.post_review_failure(&params, &e).await;
                self.finish(run_id, RunStatus::Failed, TerminalFields {
                    error: Some(message),
                    ..Default::default()
                })
                .await?;
                Err(e.into())
            }
        }
    }

    /// Release the environment (exactly once per invocation, a no-op when
    /// none was created) and fold its provider-accumulated cost onto the
    /// run. The cost write is checkpointed so a resumed run cannot add it
    /// twice; failures here are logged, never allowed to block the
    /// terminal state update.
    async fn settle_costs(&self, ctx: &StepContext, guard: &mut SandboxGuard) {
        let cost = guard.release().await;
        let db = self.db.clone();
        let run_id = ctx.run_id().to_string();
        let recorded: Result<f64> = ctx
            .run_step("record_sandbox_cost", async move {
                db.call(move |store| {
                    store.add_sandbox_cost(&run_id, cost)?;
                    Ok(cost)
                })
                .await
            })
            .await;
        if let Err(e) = recorded {
            warn!(run_id = %ctx.run_id(), error = %format!("{:#}", e), "failed to record sandbox cost");
        }
    }

    /// Checkpointed billing report. The meter event itself carries the run
    /// id as idempotency key, closing the window between emission and
    /// checkpoint persistence.
    async fn report_billing(
        &self,
        ctx: &StepContext,
        billing_account_id: &str,
    ) -> Result<(), WorkflowError> {
        let recorder = UsageRecorder::new(self.db.clone(), Arc::clone(&self.billing));
        let run_id = ctx.run_id().to_string();
        let account = billing_account_id.to_string();
        ctx.run_step("report_billing_usage", async move {
            recorder.record(&run_id, &account).await
        })
        .await
        .map_err(WorkflowError::Billing)
    }

    async fn finish_success(&self, run_id: &str, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::PrCreated(pr) => {
                self.finish(run_id, RunStatus::SuccessPrCreated, TerminalFields {
                    pr_number: Some(pr.number),
                    pr_url: Some(pr.url),
                    error: None,
                })
                .await
            }
            Outcome::NoIssues { note } => {
                if let Some(note) = note {
                    info!(run_id, note = %note, "sweep left issues unresolved");
                }
                self.finish(run_id, RunStatus::SuccessNoIssues, TerminalFields::default())
                    .await
            }
            Outcome::PushedFixes { .. } => {
                self.finish(run_id, RunStatus::SuccessNoIssues, TerminalFields::default())
                    .await
            }
        }
    }

    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        fields: TerminalFields,
    ) -> Result<()> {
        let id = run_id.to_string();
        let run = self
            .db
            .call(move |store| store.finish_run(&id, status, fields))
            .await?;
        info!(run_id, status = %run.status, "run finished");
        Ok(())
    }

    /// Best-effort summary comment on the reviewed pull request.
    async fn post_review_summary(&self, params: &ReviewParams, outcome: &Outcome) {
        let body = match outcome {
            Outcome::PushedFixes { sections } if !sections.is_empty() => format!(
                "codemend applied fixes to this pull request:\n\n{}",
                sections
                    .iter()
                    .map(|s| format!("- {}", s))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
            _ => "codemend reviewed this pull request: no issues found.".to_string(),
        };
        self.post_comment(params, &body).await;
    }

    /// Best-effort failure comment; access denials get the explanatory
    /// wording, everything else the generic one.
    async fn post_review_failure(&self, params: &ReviewParams, err: &WorkflowError) {
        let body = match err {
            WorkflowError::AccessDenied { reason } => format!(
                "codemend can't push to `{}`: {}. Grant push access to enable automated fixes.",
                params.pr_branch, reason
            ),
            other => format!("codemend run failed: {}", other),
        };
        self.post_comment(params, &body).await;
    }

    async fn post_comment(&self, params: &ReviewParams, body: &str) {
        if let Err(e) = self
            .host
            .add_comment(
                params.installation_id,
                &params.repo_full_name,
                params.pr_number,
                body,
            )
            .await
        {
            // Notification loss never alters the run's recorded outcome.
            warn!(
                repo = %params.repo_full_name,
                pr = params.pr_number,
                error = %format!("{:#}", e),
                "failed to post comment"
            );
        }
    }
}

fn review_pr_url(web_base: &str, params: &ReviewParams) -> String {
    format!(
        "{}/{}/pull/{}",
        web_base.trim_end_matches('/'),
        params.repo_full_name,
        params.pr_number
    )
}
