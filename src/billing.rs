//! Billing usage recording.
//!
//! One meter event per run, emitted after the run's costs are final.
//! Zero-cost runs emit nothing. Conversion to minor currency units rounds
//! up — undercharging is the failure mode to avoid. The meter event carries
//! the run id as idempotency key so a replayed billing step (checkpoint lost
//! after emission) cannot double-report usage.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::db::DbHandle;
use crate::providers::BillingProvider;

/// Convert a USD amount to integer cents, rounding up.
///
/// A cent value within 1e-9 of an integer is treated as that integer;
/// anything farther above still ceils. Binary floats make `0.1 * 100.0`
/// land a hair above 10, and ceiling that would bill 11. The tolerance is
/// orders of magnitude below any real cost difference, so the only amounts
/// it snaps down are float-representation artifacts of exact cents.
pub fn to_minor_units(usd: f64) -> i64 {
    let cents = usd * 100.0;
    let nearest = cents.round();
    if (cents - nearest).abs() < 1e-9 {
        nearest as i64
    } else {
        cents.ceil() as i64
    }
}

pub struct UsageRecorder {
    db: DbHandle,
    provider: Arc<dyn BillingProvider>,
}

impl UsageRecorder {
    pub fn new(db: DbHandle, provider: Arc<dyn BillingProvider>) -> Self {
        Self { db, provider }
    }

    /// Sum the run's execution and AI costs and emit one meter event.
    /// A non-positive total is a no-op. Emission failures propagate —
    /// silent billing loss is unacceptable.
    pub async fn record(&self, run_id: &str, billing_account_id: &str) -> Result<()> {
        let id = run_id.to_string();
        let run = self
            .db
            .call(move |store| store.get_run(&id))
            .await?
            .with_context(|| format!("Run {} not found for billing", run_id))?;

        let total_usd = run.sandbox_cost_usd + run.ai_cost_usd;
        if total_usd <= 0.0 {
            return Ok(());
        }

        let minor_units = to_minor_units(total_usd);
        self.provider
            .record_usage(billing_account_id, minor_units, run_id)
            .await
            .with_context(|| format!("Failed to report usage for run {}", run_id))?;
        info!(
            run_id,
            billing_account_id, minor_units, "reported billing usage"
        );
        Ok(())
    }
}
