//! Scoped ownership of a leased execution environment.
//!
//! A [`SandboxGuard`] is created before any fallible step and released on
//! every exit path by the orchestrator's outer wrapper, so the stop call
//! happens exactly once per invocation — including the degenerate case
//! where access was denied and no environment was ever created.

use std::sync::Arc;

use tracing::warn;

use crate::providers::SandboxProvider;

pub struct SandboxGuard {
    sandbox: Arc<dyn SandboxProvider>,
    env_id: Option<String>,
    released: bool,
}

impl SandboxGuard {
    pub fn new(sandbox: Arc<dyn SandboxProvider>) -> Self {
        Self {
            sandbox,
            env_id: None,
            released: false,
        }
    }

    /// Record the environment id right after the create step.
    pub fn arm(&mut self, env_id: impl Into<String>) {
        self.env_id = Some(env_id.into());
    }

    pub fn env_id(&self) -> Option<&str> {
        self.env_id.as_deref()
    }

    /// Stop the environment and return its provider-accumulated cost.
    ///
    /// No-op when no environment was created or when already released.
    /// Stop and usage failures are logged, not raised: a flaky provider
    /// must never block the run's terminal state update.
    pub async fn release(&mut self) -> f64 {
        if self.released {
            return 0.0;
        }
        self.released = true;

        let Some(env_id) = self.env_id.clone() else {
            return 0.0;
        };

        let cost = match self.sandbox.usage_usd(&env_id).await {
            Ok(cost) => cost,
            Err(e) => {
                warn!(env_id = %env_id, error = %format!("{:#}", e), "failed to read environment usage");
                0.0
            }
        };
        if let Err(e) = self.sandbox.stop(&env_id).await {
            warn!(env_id = %env_id, error = %format!("{:#}", e), "failed to stop environment");
        }
        cost
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        // Stop is async and cannot run here; the orchestrator wrapper is
        // responsible for releasing on every path. A leak means a bug.
        if !self.released && self.env_id.is_some() {
            warn!(
                env_id = %self.env_id.as_deref().unwrap_or_default(),
                "sandbox guard dropped without release; environment may leak"
            );
        }
    }
}
