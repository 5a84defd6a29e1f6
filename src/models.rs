use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a remediation run.
///
/// `Pending` is transient: it exists only inside the dedup guard's
/// transaction and is advanced to `Running` before the transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    SuccessPrCreated,
    SuccessNoIssues,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::SuccessPrCreated => "success_pr_created",
            Self::SuccessNoIssues => "success_no_issues",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SuccessPrCreated | Self::SuccessNoIssues | Self::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success_pr_created" => Ok(Self::SuccessPrCreated),
            "success_no_issues" => Ok(Self::SuccessNoIssues),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Validate that a run status transition is allowed.
/// Terminal states accept no further transitions.
pub fn is_valid_transition(from: &RunStatus, to: &RunStatus) -> bool {
    matches!(
        (from, to),
        (RunStatus::Pending, RunStatus::Running)
            | (RunStatus::Running, RunStatus::SuccessPrCreated)
            | (RunStatus::Running, RunStatus::SuccessNoIssues)
            | (RunStatus::Running, RunStatus::Failed)
    )
}

/// The two workflow shapes the orchestrator supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Sweep,
    Review,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sweep => "sweep",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sweep" => Ok(Self::Sweep),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid workflow kind: {}", s)),
        }
    }
}

/// One remediation attempt. Never deleted; terminal records are retained
/// for audit and billing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub org_id: i64,
    pub repo_id: i64,
    pub repo_full_name: String,
    /// `None` for a scheduled sweep, `Some` for a pull-request review run.
    pub pr_number: Option<i64>,
    pub status: RunStatus,
    pub workflow_kind: WorkflowKind,
    /// Serialized workflow params, kept so an interrupted run can be resumed.
    pub params: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub out_pr_number: Option<i64>,
    pub out_pr_url: Option<String>,
    pub error: Option<String>,
    pub sandbox_cost_usd: f64,
    pub ai_cost_usd: f64,
}

/// Result of a dedup-guarded start attempt. A lost race is `Skipped`,
/// which is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum StartDecision {
    Started(String),
    Skipped,
}

/// Inputs for a scheduled repository sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepParams {
    pub org_id: i64,
    pub repo_id: i64,
    pub repo_full_name: String,
    pub default_branch: String,
    pub installation_id: i64,
    pub billing_account_id: String,
}

/// Inputs for a pull-request review run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewParams {
    pub org_id: i64,
    pub repo_id: i64,
    pub repo_full_name: String,
    pub pr_number: i64,
    pub pr_branch: String,
    pub base_branch: String,
    pub installation_id: i64,
    pub billing_account_id: String,
}

/// Params for either workflow shape, tagged for storage alongside the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowParams {
    Sweep(SweepParams),
    Review(ReviewParams),
}

impl WorkflowParams {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::Sweep(_) => WorkflowKind::Sweep,
            Self::Review(_) => WorkflowKind::Review,
        }
    }
}

/// An installed organization. Organizations without a billing account are
/// excluded from scheduled sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub installation_id: i64,
    pub billing_account_id: Option<String>,
}

/// A repository visible to the orchestrator, with its feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub org_id: i64,
    pub full_name: String,
    pub default_branch: String,
    pub sweeps_enabled: bool,
    pub reviews_enabled: bool,
}

/// Push-access check result from the hosting provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAccess {
    pub can_push: bool,
    pub reason: Option<String>,
}

/// Report from the deterministic fixer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixOutcome {
    pub has_changes: bool,
    pub has_remaining_issues: bool,
}

/// Report from the bounded AI fixer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiFixOutcome {
    pub success: bool,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Changelog generation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changelog {
    pub success: bool,
    #[serde(default)]
    pub changelog: String,
}

/// A created or updated pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: i64,
    pub url: String,
}

/// Branch coordinates of an existing pull request, looked up when a trigger
/// payload names the PR but not its branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: i64,
    pub head_ref: String,
    pub base_ref: String,
}

/// Output of one command executed inside a leased environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Multi-status result of one scheduled sweep pass. Partial failures are
/// collected here instead of aborting the pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub started: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<SweepFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub repo_full_name: String,
    pub error: String,
}
