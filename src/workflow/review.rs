//! Pull-request review run.
//!
//! Works directly on the PR's head branch: deterministic fixes are committed
//! and pushed first, then the AI fixer takes one bounded pass at whatever
//! remains. Unlike a sweep, a fixer-reported failure here is fatal — the
//! reviewer asked for help and silence would look like a clean bill.

use anyhow::Error;

use crate::errors::WorkflowError;
use crate::exec::StepContext;
use crate::guard::SandboxGuard;
use crate::models::{AiFixOutcome, Changelog, FixOutcome, PushAccess, ReviewParams};
use crate::steps;

use super::{Orchestrator, Outcome};

pub(super) async fn run(
    orch: &Orchestrator,
    ctx: &StepContext,
    guard: &mut SandboxGuard,
    params: &ReviewParams,
) -> Result<Outcome, WorkflowError> {
    let access: PushAccess = ctx
        .run_step(
            "check_push_access",
            orch.host.check_push_access(
                params.installation_id,
                &params.repo_full_name,
                &params.pr_branch,
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

    ctx.run_step("checkout_branch", async {
        steps::checkout_branch(orch.sandbox.as_ref(), &env_id, &params.pr_branch)
            .await
            .map_err(Error::from)
    })
    .await?;

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

    let mut sections: Vec<String> = Vec::new();

    let fix: FixOutcome = ctx
        .run_step("run_deterministic_fix", async {
            steps::run_deterministic_fix(orch.sandbox.as_ref(), &env_id)
                .await
                .map_err(Error::from)
        })
        .await?;

    if fix.has_changes {
        let changelog: Changelog = ctx
            .run_step_attempt("generate_changelog", 0, async {
                steps::generate_changelog(orch.sandbox.as_ref(), &env_id)
                    .await
                    .map_err(Error::from)
            })
            .await?;
        ctx.run_step_attempt("commit_and_push", 0, async {
            steps::commit_and_push(
                orch.sandbox.as_ref(),
                &env_id,
                "style: apply automated code quality fixes",
            )
            .await
            .map_err(Error::from)
        })
        .await?;
        sections.push(section_text(&changelog, "Applied deterministic fixes."));
    }

    if fix.has_remaining_issues {
        // AI turns take longer than rule application; buy headroom before
        // starting so the environment lease doesn't expire mid-fix.
        ctx.run_step("extend_timeout", async {
            orch.sandbox
                .extend_timeout(&env_id, orch.config.sandbox.ai_extend_secs)
                .await
        })
        .await?;

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
            return Err(WorkflowError::AiFixFailed {
                message: ai
                    .error_message
                    .unwrap_or_else(|| "fixer reported failure".to_string()),
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
            let changelog: Changelog = ctx
                .run_step_attempt("generate_changelog", 1, async {
                    steps::generate_changelog(orch.sandbox.as_ref(), &env_id)
                        .await
                        .map_err(Error::from)
                })
                .await?;
            ctx.run_step_attempt("commit_and_push", 1, async {
                steps::commit_and_push(
                    orch.sandbox.as_ref(),
                    &env_id,
                    "fix: resolve remaining code quality issues",
                )
                .await
                .map_err(Error::from)
            })
            .await?;
            sections.push(section_text(&changelog, "Resolved remaining issues."));
        }
    }

    if sections.is_empty() {
        Ok(Outcome::NoIssues { note: None })
    } else {
        Ok(Outcome::PushedFixes { sections })
    }
}

fn section_text(changelog: &Changelog, fallback: &str) -> String {
    if changelog.success && !changelog.changelog.trim().is_empty() {
        changelog.changelog.clone()
    } else {
        fallback.to_string()
    }
}
