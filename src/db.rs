//! SQLite persistence for runs, step checkpoints, and the installation
//! registry.
//!
//! All access goes through [`DbHandle`], which wraps the synchronous
//! [`Store`] behind `Arc<Mutex>` and runs closures on tokio's blocking
//! thread pool so SQLite I/O never ties up async worker threads.
//!
//! The dedup guard lives here: [`Store::try_start`] performs the
//! check-then-insert for a (repository, pull-request) key inside a single
//! `IMMEDIATE` transaction. SQLite transactions are serializable, and a
//! `SQLITE_BUSY` result is the serialization-conflict signal — mapped to
//! [`StartDecision::Skipped`], never to an error.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use uuid::Uuid;

use crate::models::{
    Organization, Repository, Run, RunStatus, StartDecision, WorkflowParams, is_valid_transition,
};

/// Async-safe handle to the codemend database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the store mutex synchronously. For startup initialization
    /// and tests only — never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct Store {
    conn: Connection,
}

/// Outcome fields written on a terminal transition.
#[derive(Debug, Clone, Default)]
pub struct TerminalFields {
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to set pragmas")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS organizations (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    installation_id INTEGER NOT NULL,
                    billing_account_id TEXT
                );

                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY,
                    org_id INTEGER NOT NULL REFERENCES organizations(id),
                    full_name TEXT NOT NULL UNIQUE,
                    default_branch TEXT NOT NULL DEFAULT 'main',
                    sweeps_enabled INTEGER NOT NULL DEFAULT 0,
                    reviews_enabled INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    org_id INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    repo_full_name TEXT NOT NULL,
                    pr_number INTEGER,
                    status TEXT NOT NULL DEFAULT 'pending',
                    workflow_kind TEXT NOT NULL,
                    params TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    out_pr_number INTEGER,
                    out_pr_url TEXT,
                    error TEXT,
                    sandbox_cost_usd REAL NOT NULL DEFAULT 0,
                    ai_cost_usd REAL NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_runs_key
                    ON runs(repo_id, pr_number, status);

                CREATE TABLE IF NOT EXISTS step_log (
                    run_id TEXT NOT NULL REFERENCES runs(id),
                    step_name TEXT NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    output TEXT NOT NULL,
                    completed_at TEXT NOT NULL,
                    UNIQUE(run_id, step_name, attempt)
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dedup guard
    // ------------------------------------------------------------------

    /// Create a run for the (repository, pull-request) key unless one is
    /// already active. The existence check, insert, and pending→running
    /// advance all happen inside one IMMEDIATE transaction; a lost race
    /// (busy/locked) is reported as `Skipped`.
    pub fn try_start(
        &mut self,
        repo_id: i64,
        org_id: i64,
        repo_full_name: &str,
        pr_number: Option<i64>,
        params: &WorkflowParams,
    ) -> Result<StartDecision> {
        let params_json =
            serde_json::to_string(params).context("Failed to serialize workflow params")?;
        let kind = params.kind();

        let tx = match self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
        {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => return Ok(StartDecision::Skipped),
            Err(e) => return Err(e).context("Failed to begin dedup transaction"),
        };

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM runs
                 WHERE repo_id = ?1 AND pr_number IS ?2
                   AND status IN ('pending', 'running')
                 LIMIT 1",
                params![repo_id, pr_number],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query active runs")?;

        if active.is_some() {
            // Transaction rolls back on drop; nothing was created.
            return Ok(StartDecision::Skipped);
        }

        let run_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO runs (id, org_id, repo_id, repo_full_name, pr_number,
                               status, workflow_kind, params, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8)",
            params![
                run_id,
                org_id,
                repo_id,
                repo_full_name,
                pr_number,
                kind.as_str(),
                params_json,
                now()
            ],
        )
        .context("Failed to insert run")?;
        tx.execute(
            "UPDATE runs SET status = 'running' WHERE id = ?1",
            params![run_id],
        )
        .context("Failed to advance run to running")?;

        match tx.commit() {
            Ok(()) => Ok(StartDecision::Started(run_id)),
            Err(e) if is_busy(&e) => Ok(StartDecision::Skipped),
            Err(e) => Err(e).context("Failed to commit dedup transaction"),
        }
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                "SELECT id, org_id, repo_id, repo_full_name, pr_number, status,
                        workflow_kind, params, started_at, completed_at,
                        out_pr_number, out_pr_url, error,
                        sandbox_cost_usd, ai_cost_usd
                 FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()
            .context("Failed to load run")
    }

    /// Apply a terminal transition. Sets `completed_at` exactly once; if the
    /// run is already terminal this is an idempotent no-op that returns the
    /// stored record unchanged.
    pub fn finish_run(
        &mut self,
        run_id: &str,
        status: RunStatus,
        fields: TerminalFields,
    ) -> Result<Run> {
        anyhow::ensure!(status.is_terminal(), "finish_run requires a terminal status");
        let run = self
            .get_run(run_id)?
            .with_context(|| format!("Run {} not found", run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        anyhow::ensure!(
            is_valid_transition(&run.status, &status),
            "Invalid transition {} -> {} for run {}",
            run.status,
            status,
            run_id
        );
        self.conn
            .execute(
                "UPDATE runs SET status = ?2, completed_at = ?3,
                        out_pr_number = ?4, out_pr_url = ?5, error = ?6
                 WHERE id = ?1",
                params![
                    run_id,
                    status.as_str(),
                    now(),
                    fields.pr_number,
                    fields.pr_url,
                    fields.error
                ],
            )
            .context("Failed to finish run")?;
        self.get_run(run_id)?
            .with_context(|| format!("Run {} disappeared", run_id))
    }

    /// Add sandbox cost onto a run. Costs only ever grow.
    pub fn add_sandbox_cost(&mut self, run_id: &str, delta_usd: f64) -> Result<()> {
        if delta_usd <= 0.0 {
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE runs SET sandbox_cost_usd = sandbox_cost_usd + ?2 WHERE id = ?1",
                params![run_id, delta_usd],
            )
            .context("Failed to add sandbox cost")?;
        Ok(())
    }

    /// Record the AI fixer's cost. Monotonic: a replayed cost-tracking step
    /// never lowers the stored value.
    pub fn set_ai_cost(&mut self, run_id: &str, cost_usd: f64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET ai_cost_usd = MAX(ai_cost_usd, ?2) WHERE id = ?1",
                params![run_id, cost_usd.max(0.0)],
            )
            .context("Failed to set AI cost")?;
        Ok(())
    }

    /// Runs left in `running` (e.g. by a process that died mid-workflow).
    pub fn list_running_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, repo_id, repo_full_name, pr_number, status,
                    workflow_kind, params, started_at, completed_at,
                    out_pr_number, out_pr_url, error,
                    sandbox_cost_usd, ai_cost_usd
             FROM runs WHERE status = 'running' ORDER BY started_at",
        )?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list running runs")?;
        Ok(runs)
    }

    // ------------------------------------------------------------------
    // Step log
    // ------------------------------------------------------------------

    /// Persist a completed step checkpoint. Inserting the same
    /// (run, step, attempt) twice keeps the first record.
    pub fn record_step(
        &mut self,
        run_id: &str,
        step_name: &str,
        attempt: u32,
        output: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO step_log (run_id, step_name, attempt, output, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, step_name, attempt, output, now()],
            )
            .context("Failed to record step checkpoint")?;
        Ok(())
    }

    pub fn get_step(&self, run_id: &str, step_name: &str, attempt: u32) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT output FROM step_log
                 WHERE run_id = ?1 AND step_name = ?2 AND attempt = ?3",
                params![run_id, step_name, attempt],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load step checkpoint")
    }

    // ------------------------------------------------------------------
    // Installation registry (read-only from the core's perspective)
    // ------------------------------------------------------------------

    pub fn upsert_organization(&mut self, org: &Organization) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO organizations (id, name, installation_id, billing_account_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    installation_id = excluded.installation_id,
                    billing_account_id = excluded.billing_account_id",
                params![org.id, org.name, org.installation_id, org.billing_account_id],
            )
            .context("Failed to upsert organization")?;
        Ok(())
    }

    pub fn upsert_repository(&mut self, repo: &Repository) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO repositories (id, org_id, full_name, default_branch,
                                           sweeps_enabled, reviews_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    org_id = excluded.org_id,
                    full_name = excluded.full_name,
                    default_branch = excluded.default_branch,
                    sweeps_enabled = excluded.sweeps_enabled,
                    reviews_enabled = excluded.reviews_enabled",
                params![
                    repo.id,
                    repo.org_id,
                    repo.full_name,
                    repo.default_branch,
                    repo.sweeps_enabled,
                    repo.reviews_enabled
                ],
            )
            .context("Failed to upsert repository")?;
        Ok(())
    }

    /// Organizations eligible for scheduled sweeps: those with a billing
    /// account configured.
    pub fn list_billable_organizations(&self) -> Result<Vec<Organization>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, installation_id, billing_account_id
             FROM organizations WHERE billing_account_id IS NOT NULL ORDER BY id",
        )?;
        let orgs = stmt
            .query_map([], org_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list organizations")?;
        Ok(orgs)
    }

    pub fn get_organization(&self, org_id: i64) -> Result<Option<Organization>> {
        self.conn
            .query_row(
                "SELECT id, name, installation_id, billing_account_id
                 FROM organizations WHERE id = ?1",
                params![org_id],
                org_from_row,
            )
            .optional()
            .context("Failed to load organization")
    }

    pub fn list_sweep_repositories(&self, org_id: i64) -> Result<Vec<Repository>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, org_id, full_name, default_branch, sweeps_enabled, reviews_enabled
             FROM repositories WHERE org_id = ?1 AND sweeps_enabled = 1 ORDER BY id",
        )?;
        let repos = stmt
            .query_map(params![org_id], repo_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list repositories")?;
        Ok(repos)
    }

    pub fn get_repository_by_full_name(&self, full_name: &str) -> Result<Option<Repository>> {
        self.conn
            .query_row(
                "SELECT id, org_id, full_name, default_branch, sweeps_enabled, reviews_enabled
                 FROM repositories WHERE full_name = ?1",
                params![full_name],
                repo_from_row,
            )
            .optional()
            .context("Failed to load repository")
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status: String = row.get(5)?;
    let kind: String = row.get(6)?;
    Ok(Run {
        id: row.get(0)?,
        org_id: row.get(1)?,
        repo_id: row.get(2)?,
        repo_full_name: row.get(3)?,
        pr_number: row.get(4)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        workflow_kind: kind.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        params: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        out_pr_number: row.get(10)?,
        out_pr_url: row.get(11)?,
        error: row.get(12)?,
        sandbox_cost_usd: row.get(13)?,
        ai_cost_usd: row.get(14)?,
    })
}

fn org_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        installation_id: row.get(2)?,
        billing_account_id: row.get(3)?,
    })
}

fn repo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        org_id: row.get(1)?,
        full_name: row.get(2)?,
        default_branch: row.get(3)?,
        sweeps_enabled: row.get(4)?,
        reviews_enabled: row.get(5)?,
    })
}
