//! Step catalog: the individually checkpointable operations the workflows
//! sequence. Everything here runs inside the leased environment via the
//! sandbox provider's exec; fixer tools report results as a JSON object on
//! their final stdout line (possibly embedded after a log prefix).

use serde::de::DeserializeOwned;

use crate::errors::WorkflowError;
use crate::models::{AiFixOutcome, Changelog, ExecOutput, FixOutcome};
use crate::providers::SandboxProvider;

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Last `n` bytes of command output, for error messages. Snaps forward to
/// a character boundary so multibyte output can't split.
fn tail(s: &str, n: usize) -> &str {
    let mut start = s.len().saturating_sub(n);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

async fn run_checked(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    step: &str,
    command: Vec<String>,
) -> Result<ExecOutput, WorkflowError> {
    let out = sandbox
        .exec(env_id, &command)
        .await
        .map_err(|e| WorkflowError::step(step, format!("{:#}", e)))?;
    if !out.success() {
        return Err(WorkflowError::step(
            step,
            format!("exit code {}: {}", out.exit_code, tail(&out.stderr, 400)),
        ));
    }
    Ok(out)
}

/// Find a JSON report object in command output. Scans lines bottom-up and
/// tolerates a log prefix before the object (e.g. `[fix] {...}`).
pub fn parse_report<T: DeserializeOwned>(stdout: &str) -> Option<T> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if let Ok(value) = serde_json::from_str::<T>(trimmed) {
            return Some(value);
        }
        if let Some(start) = trimmed.find('{')
            && let Some(end) = trimmed.rfind('}')
            && end > start
            && let Ok(value) = serde_json::from_str::<T>(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}

pub async fn install_dependencies(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
) -> Result<(), WorkflowError> {
    run_checked(
        sandbox,
        env_id,
        "install_dependencies",
        argv(&["codemend-agent", "install-deps"]),
    )
    .await?;
    Ok(())
}

pub async fn checkout_branch(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    branch: &str,
) -> Result<(), WorkflowError> {
    run_checked(
        sandbox,
        env_id,
        "checkout_branch",
        argv(&["git", "checkout", branch]),
    )
    .await?;
    Ok(())
}

pub async fn configure_git_identity(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    user_name: &str,
    user_email: &str,
) -> Result<(), WorkflowError> {
    run_checked(
        sandbox,
        env_id,
        "configure_git_identity",
        argv(&["git", "config", "user.name", user_name]),
    )
    .await?;
    run_checked(
        sandbox,
        env_id,
        "configure_git_identity",
        argv(&["git", "config", "user.email", user_email]),
    )
    .await?;
    Ok(())
}

/// Run the deterministic (rule-based) fixer.
pub async fn run_deterministic_fix(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
) -> Result<FixOutcome, WorkflowError> {
    let out = run_checked(
        sandbox,
        env_id,
        "run_deterministic_fix",
        argv(&["codemend-agent", "fix", "--report-json"]),
    )
    .await?;
    parse_report(&out.stdout).ok_or_else(|| {
        WorkflowError::step(
            "run_deterministic_fix",
            format!("no report in output: {}", tail(&out.stdout, 200)),
        )
    })
}

/// Run the bounded AI fixer. Bounds (issue cap, turn budget) come from
/// configuration; the tool skips complex multi-file changes on its own.
pub async fn run_ai_fix(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    max_issues: u32,
    max_turns: u32,
) -> Result<AiFixOutcome, WorkflowError> {
    let out = run_checked(
        sandbox,
        env_id,
        "run_ai_fix",
        vec![
            "codemend-agent".into(),
            "ai-fix".into(),
            "--report-json".into(),
            "--max-issues".into(),
            max_issues.to_string(),
            "--max-turns".into(),
            max_turns.to_string(),
        ],
    )
    .await?;
    parse_report(&out.stdout).ok_or_else(|| {
        WorkflowError::step(
            "run_ai_fix",
            format!("no report in output: {}", tail(&out.stdout, 200)),
        )
    })
}

pub async fn generate_changelog(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
) -> Result<Changelog, WorkflowError> {
    let out = run_checked(
        sandbox,
        env_id,
        "generate_changelog",
        argv(&["codemend-agent", "changelog", "--report-json"]),
    )
    .await?;
    parse_report(&out.stdout).ok_or_else(|| {
        WorkflowError::step(
            "generate_changelog",
            format!("no report in output: {}", tail(&out.stdout, 200)),
        )
    })
}

/// True when the working tree has uncommitted changes.
pub async fn has_uncommitted_changes(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
) -> Result<bool, WorkflowError> {
    let out = run_checked(
        sandbox,
        env_id,
        "check_working_tree",
        argv(&["git", "status", "--porcelain"]),
    )
    .await?;
    Ok(!out.stdout.trim().is_empty())
}

/// Commit everything and push to the current branch.
pub async fn commit_and_push(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    message: &str,
) -> Result<(), WorkflowError> {
    run_checked(sandbox, env_id, "commit_and_push", argv(&["git", "add", "-A"])).await?;
    run_checked(
        sandbox,
        env_id,
        "commit_and_push",
        argv(&["git", "commit", "-m", message]),
    )
    .await?;
    run_checked(sandbox, env_id, "commit_and_push", argv(&["git", "push"])).await?;
    Ok(())
}

/// Create a new branch, commit everything, and push it. Returns the branch
/// name so the caller can open a pull request against it.
pub async fn create_branch_and_push(
    sandbox: &dyn SandboxProvider,
    env_id: &str,
    branch: &str,
    message: &str,
) -> Result<String, WorkflowError> {
    run_checked(
        sandbox,
        env_id,
        "create_branch_and_push",
        argv(&["git", "checkout", "-b", branch]),
    )
    .await?;
    run_checked(
        sandbox,
        env_id,
        "create_branch_and_push",
        argv(&["git", "add", "-A"]),
    )
    .await?;
    run_checked(
        sandbox,
        env_id,
        "create_branch_and_push",
        argv(&["git", "commit", "-m", message]),
    )
    .await?;
    run_checked(
        sandbox,
        env_id,
        "create_branch_and_push",
        argv(&["git", "push", "-u", "origin", branch]),
    )
    .await?;
    Ok(branch.to_string())
}
