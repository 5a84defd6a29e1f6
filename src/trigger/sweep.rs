//! Periodic sweep scanner.
//!
//! Enumerates billable organizations and their sweep-enabled repositories
//! and starts one sweep run per repository. The pass is multi-status: a
//! repository that fails to start lands in the report, it never aborts the
//! rest of the pass.

use std::sync::Arc;

use tracing::{info, warn};

use crate::db::DbHandle;
use crate::errors::TriggerError;
use crate::models::{
    Organization, Repository, StartDecision, SweepFailure, SweepParams, SweepReport,
    WorkflowParams,
};
use crate::workflow::Orchestrator;

pub struct SweepScanner {
    db: DbHandle,
    orchestrator: Arc<Orchestrator>,
}

impl SweepScanner {
    pub fn new(db: DbHandle, orchestrator: Arc<Orchestrator>) -> Self {
        Self { db, orchestrator }
    }

    /// One full pass over every eligible repository.
    pub async fn run_pass(&self) -> Result<SweepReport, TriggerError> {
        let orgs = self
            .db
            .call(|store| store.list_billable_organizations())
            .await
            .map_err(TriggerError::Store)?;

        let mut report = SweepReport::default();
        for org in orgs {
            // The query filters on billing_account_id, but the field stays
            // optional in the model; skip rather than assume.
            let Some(billing_account_id) = org.billing_account_id.clone() else {
                continue;
            };
            let org_id = org.id;
            let repos = self
                .db
                .call(move |store| store.list_sweep_repositories(org_id))
                .await
                .map_err(TriggerError::Store)?;

            for repo in repos {
                match self.start_one(&org, &repo, &billing_account_id).await {
                    Ok(StartDecision::Started(run_id)) => {
                        info!(repo = %repo.full_name, run_id = %run_id, "sweep run started");
                        report.started.push(repo.full_name.clone());
                    }
                    Ok(StartDecision::Skipped) => {
                        report.skipped.push(repo.full_name.clone());
                    }
                    Err(e) => {
                        warn!(repo = %repo.full_name, error = %format!("{:#}", e), "sweep start failed");
                        report.failed.push(SweepFailure {
                            repo_full_name: repo.full_name.clone(),
                            error: format!("{:#}", e),
                        });
                    }
                }
            }
        }
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "sweep pass complete"
        );
        Ok(report)
    }

    async fn start_one(
        &self,
        org: &Organization,
        repo: &Repository,
        billing_account_id: &str,
    ) -> anyhow::Result<StartDecision> {
        let params = SweepParams {
            org_id: org.id,
            repo_id: repo.id,
            repo_full_name: repo.full_name.clone(),
            default_branch: repo.default_branch.clone(),
            installation_id: org.installation_id,
            billing_account_id: billing_account_id.to_string(),
        };
        let workflow = WorkflowParams::Sweep(params);
        let (repo_id, org_id, full_name) = (repo.id, org.id, repo.full_name.clone());
        let stored = workflow.clone();
        let decision = self
            .db
            .call(move |store| store.try_start(repo_id, org_id, &full_name, None, &stored))
            .await?;

        if let StartDecision::Started(run_id) = &decision {
            self.orchestrator.start(run_id.clone(), workflow);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::models::RunStatus;

    fn seed(store: &mut Store) {
        store
            .upsert_organization(&Organization {
                id: 1,
                name: "acme".into(),
                installation_id: 77,
                billing_account_id: Some("ba_1".into()),
            })
            .unwrap();
        store
            .upsert_organization(&Organization {
                id: 2,
                name: "freeloader".into(),
                installation_id: 78,
                billing_account_id: None,
            })
            .unwrap();
        store
            .upsert_repository(&Repository {
                id: 10,
                org_id: 1,
                full_name: "acme/widgets".into(),
                default_branch: "main".into(),
                sweeps_enabled: true,
                reviews_enabled: true,
            })
            .unwrap();
        store
            .upsert_repository(&Repository {
                id: 11,
                org_id: 1,
                full_name: "acme/docs".into(),
                default_branch: "main".into(),
                sweeps_enabled: false,
                reviews_enabled: true,
            })
            .unwrap();
        store
            .upsert_repository(&Repository {
                id: 20,
                org_id: 2,
                full_name: "freeloader/app".into(),
                default_branch: "main".into(),
                sweeps_enabled: true,
                reviews_enabled: true,
            })
            .unwrap();
    }

    async fn seeded_db() -> DbHandle {
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        db.call(|store| {
            seed(store);
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_pass_starts_eligible_repos_only() {
        let db = seeded_db().await;

        // Enumerate the same way the scanner does, without spawning
        // workflows: orgs without a billing account are excluded, and so
        // are repos with sweeps disabled.
        let orgs = db
            .call(|store| store.list_billable_organizations())
            .await
            .unwrap();
        assert_eq!(orgs.len(), 1);
        assert_eq!(orgs[0].id, 1);

        let repos = db
            .call(|store| store.list_sweep_repositories(1))
            .await
            .unwrap();
        let names: Vec<_> = repos.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["acme/widgets"]);
    }

    #[tokio::test]
    async fn test_second_pass_skips_active_run() {
        let db = seeded_db().await;

        let params = WorkflowParams::Sweep(SweepParams {
            org_id: 1,
            repo_id: 10,
            repo_full_name: "acme/widgets".into(),
            default_branch: "main".into(),
            installation_id: 77,
            billing_account_id: "ba_1".into(),
        });
        let first = db
            .call({
                let params = params.clone();
                move |store| store.try_start(10, 1, "acme/widgets", None, &params)
            })
            .await
            .unwrap();
        assert!(matches!(first, StartDecision::Started(_)));

        let second = db
            .call(move |store| store.try_start(10, 1, "acme/widgets", None, &params))
            .await
            .unwrap();
        assert_eq!(second, StartDecision::Skipped);
    }

    #[tokio::test]
    async fn test_finished_run_frees_the_slot() {
        let db = seeded_db().await;
        let params = WorkflowParams::Sweep(SweepParams {
            org_id: 1,
            repo_id: 10,
            repo_full_name: "acme/widgets".into(),
            default_branch: "main".into(),
            installation_id: 77,
            billing_account_id: "ba_1".into(),
        });

        let first = db
            .call({
                let params = params.clone();
                move |store| store.try_start(10, 1, "acme/widgets", None, &params)
            })
            .await
            .unwrap();
        let StartDecision::Started(run_id) = first else {
            panic!("expected grant");
        };
        db.call(move |store| {
            store.finish_run(
                &run_id,
                RunStatus::SuccessNoIssues,
                crate::db::TerminalFields::default(),
            )
        })
        .await
        .unwrap();

        let again = db
            .call(move |store| store.try_start(10, 1, "acme/widgets", None, &params))
            .await
            .unwrap();
        assert!(matches!(again, StartDecision::Started(_)));
    }
}
