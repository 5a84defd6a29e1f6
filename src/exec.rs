//! Durable step execution.
//!
//! A workflow invocation is a sequence of named steps whose outputs are
//! small serde values, never live handles. Each completed step is
//! checkpointed in the step log under (run id, step name, attempt); when an
//! interrupted run is re-driven, completed steps replay their recorded
//! output instead of re-executing side effects.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::db::DbHandle;

/// Checkpointing context for one workflow invocation.
#[derive(Clone)]
pub struct StepContext {
    db: DbHandle,
    run_id: String,
}

impl StepContext {
    pub fn new(db: DbHandle, run_id: impl Into<String>) -> Self {
        Self {
            db,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute a step at most once. If a checkpoint for (run, name, 0)
    /// exists, its recorded output is returned and `fut` is never polled.
    /// Errors are not checkpointed: a failed step re-executes on resume.
    pub async fn run_step<T, F>(&self, name: &str, fut: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Future<Output = Result<T>>,
    {
        self.run_step_attempt(name, 0, fut).await
    }

    /// Like [`run_step`](Self::run_step) for steps that may legitimately run
    /// more than once per workflow under the same name (e.g. a second
    /// commit-and-push in a review run).
    pub async fn run_step_attempt<T, F>(&self, name: &str, attempt: u32, fut: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Future<Output = Result<T>>,
    {
        let run_id = self.run_id.clone();
        let step_name = name.to_string();
        let cached = self
            .db
            .call(move |store| store.get_step(&run_id, &step_name, attempt))
            .await?;

        if let Some(json) = cached {
            debug!(run_id = %self.run_id, step = name, attempt, "replaying checkpointed step");
            return serde_json::from_str(&json)
                .with_context(|| format!("Corrupt checkpoint for step '{}'", name));
        }

        let value = fut.await?;

        let json = serde_json::to_string(&value)
            .with_context(|| format!("Failed to serialize output of step '{}'", name))?;
        let run_id = self.run_id.clone();
        let step_name = name.to_string();
        self.db
            .call(move |store| store.record_step(&run_id, &step_name, attempt, &json))
            .await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::models::{StartDecision, SweepParams, WorkflowParams};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn context_with_run() -> StepContext {
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        let params = WorkflowParams::Sweep(SweepParams {
            org_id: 1,
            repo_id: 10,
            repo_full_name: "acme/widgets".into(),
            default_branch: "main".into(),
            installation_id: 77,
            billing_account_id: "ba_1".into(),
        });
        let decision = db
            .call(move |store| store.try_start(10, 1, "acme/widgets", None, &params))
            .await
            .unwrap();
        let StartDecision::Started(run_id) = decision else {
            panic!("expected grant");
        };
        StepContext::new(db, run_id)
    }

    #[tokio::test]
    async fn test_step_executes_once_then_replays() {
        let ctx = context_with_run().await;
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let out: String = ctx
                .run_step("create_environment", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("env-abc".to_string())
                })
                .await
                .unwrap();
            assert_eq!(out, "env-abc");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_step_is_not_checkpointed() {
        let ctx = context_with_run().await;

        let first: Result<u32> = ctx
            .run_step("install_dependencies", async { anyhow::bail!("transient") })
            .await;
        assert!(first.is_err());

        // Retry runs the body again and checkpoints on success.
        let second: u32 = ctx
            .run_step("install_dependencies", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(second, 7);

        let third: u32 = ctx
            .run_step("install_dependencies", async {
                panic!("must replay, not execute")
            })
            .await
            .unwrap();
        assert_eq!(third, 7);
    }

    #[tokio::test]
    async fn test_attempts_are_distinct_checkpoints() {
        let ctx = context_with_run().await;
        let a: u32 = ctx
            .run_step_attempt("commit_and_push", 0, async { Ok(1) })
            .await
            .unwrap();
        let b: u32 = ctx
            .run_step_attempt("commit_and_push", 1, async { Ok(2) })
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
    }
}
