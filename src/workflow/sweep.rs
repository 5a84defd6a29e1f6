//! Scheduled repository sweep.
//!
//! Clone the repository's default branch into a leased environment, run the
//! deterministic fixer, and open at most one pull request. The AI fixer is
//! consulted only when the deterministic pass changed nothing but issues
//! remain; a fixer that declines is a non-fatal outcome, not a failure.

use anyhow::Error;

use crate::errors::WorkflowError;
use crate::exec::StepContext;
use crate::guard::SandboxGuard;
use crate::models::{AiFixOutcome, Changelog, FixOutcome, PushAccess, SweepParams};
use crate::steps;

use super::{Orchestrator, Outcome};

pub(super) async fn run(
    orch: &Orchestrator,
    ctx: &StepContext,
    guard: &mut SandboxGuard,
    params: &SweepParams,
) -> Result<Outcome, WorkflowError> {
    let access: PushAccess = ctx
        .run_step(
            "check_push_access",
            orch.host.check_push_access(
                params.installation_id,
                &params.repo_full_name,
                &params.default_branch,
            ),
        )
        .await?;
    if !access.can_push {
        return Err(WorkflowError::AccessDenied {
            reason: access
                .reason
                .unwrap_or_else(|| "push access denied".to_string()),
        });
    }

    let token: String = ctx
        .run_step(
            "get_access_token",
            orch.host.get_access_token(params.installation_id),
        )
        .await?;
    let env_id: String = ctx
        .run_step(
            "create_environment",
            orch.sandbox.create(&params.repo_full_name, &token),
        )
        .await?;
    guard.arm(env_id.clone());

    ctx.run_step("install_dependencies", async {
        steps::install_dependencies(orch.sandbox.as_ref(), &env_id)
            .await
            .map_err(Error::from)
    })
    .await?;

    ctx.run_step("configure_git_identity", async {
        steps::configure_git_identity(
            orch.sandbox.as_ref(),
            &env_id,
            &orch.config.fixer.git_user_name,
            &orch.config.fixer.git_user_email,
        )
        .await
        .map_err(Error::from)
    })
    .await?;

    let fix: FixOutcome = ctx
        .run_step("run_deterministic_fix", async {
            steps::run_deterministic_fix(orch.sandbox.as_ref(), &env_id)
                .await
                .map_err(Error::from)
        })
        .await?;

    if fix.has_changes {
        return open_fix_pr(orch, ctx, params, &env_id).await;
    }

    if fix.has_remaining_issues {
        let ai: AiFixOutcome = ctx
            .run_step("run_ai_fix", async {
                steps::run_ai_fix(
                    orch.sandbox.as_ref(),
                    &env_id,
                    orch.config.fixer.ai_max_issues,
                    orch.config.fixer.ai_max_turns,
                )
                .await
                .map_err(Error::from)
            })
            .await?;
        if ai.cost_usd > 0.0 {
            let run_id = ctx.run_id().to_string();
            let cost = ai.cost_usd;
            orch.db
                .call(move |store| store.set_ai_cost(&run_id, cost))
                .await?;
        }

        if !ai.success {
            // The fixer declining the remaining issues is an expected
            // outcome on a sweep; the next scheduled pass tries again.
            return Ok(Outcome::NoIssues {
                note: Some(
                    ai.error_message
                        .unwrap_or_else(|| "could not resolve remaining issues".to_string()),
                ),
            });
        }

        let dirty: bool = ctx
            .run_step("check_working_tree", async {
                steps::has_uncommitted_changes(orch.sandbox.as_ref(), &env_id)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        if dirty {
            return open_fix_pr(orch, ctx, params, &env_id).await;
        }
        return Ok(Outcome::NoIssues {
            note: Some("could not resolve remaining issues".to_string()),
        });
    }

    Ok(Outcome::NoIssues { note: None })
}

/// Branch, push, and open the sweep's single pull request. The branch name
/// derives from the run id, so a resumed run re-targets the same branch.
async fn open_fix_pr(
    orch: &Orchestrator,
    ctx: &StepContext,
    params: &SweepParams,
    env_id: &str,
) -> Result<Outcome, WorkflowError> {
    let changelog: Changelog = ctx
        .run_step("generate_changelog", async {
            steps::generate_changelog(orch.sandbox.as_ref(), env_id)
                .await
                .map_err(Error::from)
        })
        .await?;

    let branch = format!(
        "{}-{}",
        orch.config.sweep.branch_prefix,
        &ctx.run_id()[..8]
    );
    let branch: String = ctx
        .run_step("create_branch_and_push", async {
            steps::create_branch_and_push(
                orch.sandbox.as_ref(),
                env_id,
                &branch,
                "style: apply automated code quality fixes",
            )
            .await
            .map_err(Error::from)
        })
        .await?;

    let pr = ctx
        .run_step(
            "create_pull_request",
            orch.host.create_pull_request(
                params.installation_id,
                &params.repo_full_name,
                &branch,
                &params.default_branch,
                "style: automated code quality fixes",
                &pr_body(&changelog),
            ),
        )
        .await?;
    Ok(Outcome::PrCreated(pr))
}

fn pr_body(changelog: &Changelog) -> String {
    if changelog.success && !changelog.changelog.trim().is_empty() {
        changelog.changelog.clone()
    } else {
        "Automated code quality fixes.".to_string()
    }
}
