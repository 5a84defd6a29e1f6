//! End-to-end workflow tests over in-memory fakes for every provider.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use codemend::config::AppConfig;
use codemend::db::{DbHandle, Store};
use codemend::models::{
    ExecOutput, PullRequestInfo, PullRequestRef, PushAccess, ReviewParams, RunStatus,
    StartDecision, SweepParams, WorkflowParams,
};
use codemend::providers::{BillingProvider, HostProvider, SandboxProvider};
use codemend::workflow::Orchestrator;

struct FakeHost {
    can_push: bool,
    deny_reason: Option<String>,
    prs: Mutex<Vec<(String, String, String)>>, // (head, base, title)
    comments: Mutex<Vec<(i64, String)>>,
}

impl FakeHost {
    fn allowing() -> Self {
        Self {
            can_push: true,
            deny_reason: None,
            prs: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        }
    }

    fn denying(reason: &str) -> Self {
        Self {
            can_push: false,
            deny_reason: Some(reason.to_string()),
            prs: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostProvider for FakeHost {
    async fn check_push_access(
        &self,
        _installation_id: i64,
        _repo: &str,
        _branch: &str,
    ) -> Result<PushAccess> {
        Ok(PushAccess {
            can_push: self.can_push,
            reason: self.deny_reason.clone(),
        })
    }

    async fn get_access_token(&self, _installation_id: i64) -> Result<String> {
        Ok("tok_123".into())
    }

    async fn get_pull_request(
        &self,
        _installation_id: i64,
        _repo: &str,
        number: i64,
    ) -> Result<PullRequestInfo> {
        Ok(PullRequestInfo {
            number,
            head_ref: "feature".into(),
            base_ref: "main".into(),
        })
    }

    async fn create_pull_request(
        &self,
        _installation_id: i64,
        _repo: &str,
        head: &str,
        base: &str,
        title: &str,
        _body: &str,
    ) -> Result<PullRequestRef> {
        self.prs
            .lock()
            .unwrap()
            .push((head.to_string(), base.to_string(), title.to_string()));
        Ok(PullRequestRef {
            number: 101,
            url: "https://github.com/acme/widgets/pull/101".into(),
        })
    }

    async fn add_comment(
        &self,
        _installation_id: i64,
        _repo: &str,
        issue_number: i64,
        body: &str,
    ) -> Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((issue_number, body.to_string()));
        Ok(())
    }
}

/// Scripted environment: replies keyed by the first matching argv fragment,
/// with counters for lifecycle assertions.
struct FakeSandbox {
    script: Vec<(&'static str, ExecOutput)>,
    usage: f64,
    creates: AtomicU32,
    stops: AtomicU32,
    extends: AtomicU32,
    execs: Mutex<Vec<String>>,
}

impl FakeSandbox {
    fn with(script: Vec<(&'static str, ExecOutput)>, usage: f64) -> Self {
        Self {
            script,
            usage,
            creates: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            extends: AtomicU32::new(0),
            execs: Mutex::new(Vec::new()),
        }
    }

    fn exec_count(&self, fragment: &str) -> usize {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(fragment))
            .count()
    }
}

fn report(json: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: json.to_string(),
        stderr: String::new(),
    }
}

#[async_trait]
impl SandboxProvider for FakeSandbox {
    async fn create(&self, _repo: &str, _token: &str) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok("env-1".into())
    }

    async fn exec(&self, _env_id: &str, argv: &[String]) -> Result<ExecOutput> {
        let joined = argv.join(" ");
        self.execs.lock().unwrap().push(joined.clone());
        for (fragment, output) in &self.script {
            if joined.contains(fragment) {
                return Ok(output.clone());
            }
        }
        Ok(report(""))
    }

    async fn extend_timeout(&self, _env_id: &str, _extra_secs: u64) -> Result<()> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn usage_usd(&self, _env_id: &str) -> Result<f64> {
        Ok(self.usage)
    }

    async fn stop(&self, _env_id: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeBilling {
    events: Mutex<Vec<(String, i64, String)>>,
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn record_usage(
        &self,
        billing_account_id: &str,
        amount_minor_units: i64,
        idempotency_key: &str,
    ) -> Result<()> {
        self.events.lock().unwrap().push((
            billing_account_id.to_string(),
            amount_minor_units,
            idempotency_key.to_string(),
        ));
        Ok(())
    }
}

struct Harness {
    db: DbHandle,
    orchestrator: Arc<Orchestrator>,
    host: Arc<FakeHost>,
    sandbox: Arc<FakeSandbox>,
    billing: Arc<FakeBilling>,
}

fn harness(host: FakeHost, sandbox: FakeSandbox) -> Harness {
    harness_with(AppConfig::default(), host, sandbox)
}

fn harness_with(config: AppConfig, host: FakeHost, sandbox: FakeSandbox) -> Harness {
    let db = DbHandle::new(Store::new_in_memory().unwrap());
    let host = Arc::new(host);
    let sandbox = Arc::new(sandbox);
    let billing = Arc::new(FakeBilling::default());
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        db.clone(),
        host.clone(),
        sandbox.clone(),
        billing.clone(),
    ));
    Harness {
        db,
        orchestrator,
        host,
        sandbox,
        billing,
    }
}

fn sweep_params() -> SweepParams {
    SweepParams {
        org_id: 1,
        repo_id: 10,
        repo_full_name: "acme/widgets".into(),
        default_branch: "main".into(),
        installation_id: 77,
        billing_account_id: "ba_1".into(),
    }
}

fn review_params() -> ReviewParams {
    ReviewParams {
        org_id: 1,
        repo_id: 10,
        repo_full_name: "acme/widgets".into(),
        pr_number: 7,
        pr_branch: "feature".into(),
        base_branch: "main".into(),
        installation_id: 77,
        billing_account_id: "ba_1".into(),
    }
}

async fn start_run(h: &Harness, params: &WorkflowParams) -> String {
    let pr_number = match params {
        WorkflowParams::Sweep(_) => None,
        WorkflowParams::Review(p) => Some(p.pr_number),
    };
    let stored = params.clone();
    let decision = h
        .db
        .call(move |store| store.try_start(10, 1, "acme/widgets", pr_number, &stored))
        .await
        .unwrap();
    match decision {
        StartDecision::Started(run_id) => run_id,
        StartDecision::Skipped => panic!("expected a fresh run"),
    }
}

async fn get_run(h: &Harness, run_id: &str) -> codemend::models::Run {
    let id = run_id.to_string();
    h.db.call(move |store| store.get_run(&id))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn sweep_with_deterministic_changes_opens_one_pr() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": true, "has_remaining_issues": false}"#),
            ),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- normalized imports"}"#),
            ),
        ],
        0.034,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert_eq!(run.out_pr_number, Some(101));
    assert!(run.out_pr_url.as_deref().unwrap().contains("/pull/101"));

    let prs = h.host.prs.lock().unwrap();
    assert_eq!(prs.len(), 1);
    let (head, base, _title) = &prs[0];
    assert!(head.starts_with("codemend/fix-"));
    assert_eq!(base, "main");

    // Environment lifecycle: one create, one stop.
    assert_eq!(h.sandbox.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 1);

    // 0.034 USD rounds up to 4 minor units, keyed by the run id.
    let events = h.billing.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], ("ba_1".to_string(), 4, run_id.clone()));
    assert!((run.sandbox_cost_usd - 0.034).abs() < 1e-9);
}

#[tokio::test]
async fn sweep_deterministic_changes_suppress_ai_branch() {
    // Both flags set: changes were made AND issues remain. The PR for the
    // deterministic changes is the invocation's one PR; the AI fixer must
    // not run even though issues are left over.
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": true, "has_remaining_issues": true}"#),
            ),
            (
                "ai-fix",
                report(r#"{"success": true, "cost_usd": 0.99}"#),
            ),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- normalized imports"}"#),
            ),
        ],
        0.02,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert_eq!(h.sandbox.exec_count("ai-fix"), 0);
    assert_eq!(run.ai_cost_usd, 0.0);
    assert_eq!(h.host.prs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn review_pr_url_follows_configured_web_base() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": true, "has_remaining_issues": false}"#),
            ),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- style cleanups"}"#),
            ),
        ],
        0.0,
    );
    let mut config = AppConfig::default();
    config.github.web_base = "https://git.example.com".into();
    let h = harness_with(config, FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Review(review_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert_eq!(
        run.out_pr_url.as_deref(),
        Some("https://git.example.com/acme/widgets/pull/7")
    );
}

#[tokio::test]
async fn sweep_ai_decline_is_non_fatal() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": false, "has_remaining_issues": true}"#),
            ),
            (
                "ai-fix",
                report(r#"{"success": false, "error_message": "issues too entangled"}"#),
            ),
        ],
        0.0,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessNoIssues);
    assert!(h.host.prs.lock().unwrap().is_empty());
    // Zero-cost run emits no meter event.
    assert!(h.billing.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sweep_ai_fix_that_commits_opens_pr() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": false, "has_remaining_issues": true}"#),
            ),
            (
                "ai-fix",
                report(r#"{"success": true, "cost_usd": 0.25}"#),
            ),
            ("status", report(" M src/app.js\n")),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- fixed null handling"}"#),
            ),
        ],
        0.10,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert!((run.ai_cost_usd - 0.25).abs() < 1e-9);
    assert_eq!(h.host.prs.lock().unwrap().len(), 1);

    // 0.10 + 0.25 = 0.35 USD -> 35 minor units.
    let events = h.billing.events.lock().unwrap();
    assert_eq!(events[0].1, 35);
}

#[tokio::test]
async fn sweep_access_denial_creates_no_environment() {
    let sandbox = FakeSandbox::with(vec![], 0.0);
    let h = harness(FakeHost::denying("branch protected"), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    let result = h.orchestrator.execute(&run_id, params).await;
    assert!(result.is_err());

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("branch protected"));
    assert_eq!(h.sandbox.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 0);
    assert!(h.billing.events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn review_applies_both_fix_categories() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": true, "has_remaining_issues": true}"#),
            ),
            (
                "ai-fix",
                report(r#"{"success": true, "cost_usd": 0.25}"#),
            ),
            ("status", report(" M src/app.js\n")),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- style cleanups"}"#),
            ),
        ],
        0.10,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Review(review_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert_eq!(run.out_pr_number, Some(7));

    // Deterministic commit plus AI commit, pushed to the PR branch.
    assert_eq!(h.sandbox.exec_count("git commit"), 2);
    assert_eq!(h.sandbox.exec_count("git checkout feature"), 1);
    assert_eq!(h.sandbox.extends.load(Ordering::SeqCst), 1);

    // One summary comment describing what was applied.
    let comments = h.host.comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].0, 7);
    assert!(comments[0].1.contains("applied fixes"));

    let events = h.billing.events.lock().unwrap();
    assert_eq!(events[0].1, 35);
}

#[tokio::test]
async fn review_with_no_issues_comments_clean() {
    let sandbox = FakeSandbox::with(
        vec![(
            "codemend-agent fix",
            report(r#"{"has_changes": false, "has_remaining_issues": false}"#),
        )],
        0.0,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Review(review_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params).await.unwrap();

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessNoIssues);
    assert_eq!(h.sandbox.exec_count("git commit"), 0);

    let comments = h.host.comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("no issues found"));
}

#[tokio::test]
async fn review_ai_failure_is_fatal_and_commented() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": false, "has_remaining_issues": true}"#),
            ),
            (
                "ai-fix",
                report(r#"{"success": false, "error_message": "refused: cross-file refactor"}"#),
            ),
        ],
        0.05,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Review(review_params());
    let run_id = start_run(&h, &params).await;

    let result = h.orchestrator.execute(&run_id, params).await;
    assert!(result.is_err());

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("cross-file refactor"));

    let comments = h.host.comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("failed"));

    // Failed runs are not billed, but the environment still gets stopped.
    assert!(h.billing.events.lock().unwrap().is_empty());
    assert_eq!(h.sandbox.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn review_denial_comment_names_the_reason() {
    let sandbox = FakeSandbox::with(vec![], 0.0);
    let h = harness(FakeHost::denying("branch protected"), sandbox);
    let params = WorkflowParams::Review(review_params());
    let run_id = start_run(&h, &params).await;

    let result = h.orchestrator.execute(&run_id, params).await;
    assert!(result.is_err());

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("branch protected"));
    assert_eq!(h.sandbox.creates.load(Ordering::SeqCst), 0);

    let comments = h.host.comments.lock().unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].1.contains("branch protected"));
}

#[tokio::test]
async fn re_execution_replays_without_repeating_side_effects() {
    let sandbox = FakeSandbox::with(
        vec![
            (
                "codemend-agent fix",
                report(r#"{"has_changes": true, "has_remaining_issues": false}"#),
            ),
            (
                "changelog",
                report(r#"{"success": true, "changelog": "- normalized imports"}"#),
            ),
        ],
        0.034,
    );
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Sweep(sweep_params());
    let run_id = start_run(&h, &params).await;

    h.orchestrator.execute(&run_id, params.clone()).await.unwrap();
    let execs_after_first = h.sandbox.execs.lock().unwrap().len();

    // Re-driving the same run replays every checkpointed step.
    h.orchestrator.execute(&run_id, params).await.unwrap();

    assert_eq!(h.sandbox.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.sandbox.execs.lock().unwrap().len(), execs_after_first);
    assert_eq!(h.host.prs.lock().unwrap().len(), 1);
    assert_eq!(h.billing.events.lock().unwrap().len(), 1);

    let run = get_run(&h, &run_id).await;
    assert_eq!(run.status, RunStatus::SuccessPrCreated);
    assert!((run.sandbox_cost_usd - 0.034).abs() < 1e-9);
}

#[tokio::test]
async fn second_trigger_for_same_target_is_skipped() {
    let sandbox = FakeSandbox::with(vec![], 0.0);
    let h = harness(FakeHost::allowing(), sandbox);
    let params = WorkflowParams::Review(review_params());
    let _run_id = start_run(&h, &params).await;

    let stored = params.clone();
    let second = h
        .db
        .call(move |store| store.try_start(10, 1, "acme/widgets", Some(7), &stored))
        .await
        .unwrap();
    assert_eq!(second, StartDecision::Skipped);

    // A different PR on the same repo is an independent target.
    let mut other = review_params();
    other.pr_number = 8;
    let stored = WorkflowParams::Review(other);
    let third = h
        .db
        .call(move |store| store.try_start(10, 1, "acme/widgets", Some(8), &stored))
        .await
        .unwrap();
    assert!(matches!(third, StartDecision::Started(_)));
}
