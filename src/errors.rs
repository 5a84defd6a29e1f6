//! Typed error hierarchy for the codemend orchestrator.
//!
//! Two top-level enums cover the two surfaces:
//! - `WorkflowError` — failures inside one workflow invocation
//! - `TriggerError` — webhook and sweep-scanner failures
//!
//! Dedup-guard race losses are deliberately not errors; they surface as
//! `StartDecision::Skipped` from the store.

use thiserror::Error;

/// Errors raised inside one workflow invocation. Everything except
/// `Billing` is absorbed into the run record; billing failures also
/// propagate to the caller so a sweep can report them.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Push access denied before any resource was created.
    #[error("{reason}")]
    AccessDenied { reason: String },

    /// An environment, install, or fixer step failed.
    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    /// The bounded AI fixer reported a fatal error.
    #[error("AI fixer failed: {message}")]
    AiFixFailed { message: String },

    /// Billing report emission failed. Never swallowed.
    #[error("Billing report failed: {0}")]
    Billing(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn step(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Step {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

/// Errors from the trigger layer (webhook handler and sweep scanner).
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Repository {repo} is not eligible: {reason}")]
    NotEligible { repo: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Failed to start workflow: {0}")]
    StartFailed(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_displays_reason_verbatim() {
        let err = WorkflowError::AccessDenied {
            reason: "branch protected".into(),
        };
        assert_eq!(err.to_string(), "branch protected");
    }

    #[test]
    fn step_error_carries_step_name() {
        let err = WorkflowError::step("install_dependencies", "exit code 1");
        match &err {
            WorkflowError::Step { step, message } => {
                assert_eq!(step, "install_dependencies");
                assert_eq!(message, "exit code 1");
            }
            _ => panic!("Expected Step variant"),
        }
        assert!(err.to_string().contains("install_dependencies"));
    }

    #[test]
    fn billing_error_is_matchable() {
        let err = WorkflowError::Billing(anyhow::anyhow!("meter endpoint 500"));
        assert!(matches!(err, WorkflowError::Billing(_)));
        assert!(err.to_string().contains("meter endpoint 500"));
    }

    #[test]
    fn trigger_errors_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&TriggerError::InvalidSignature);
        assert_std_error(&WorkflowError::AccessDenied {
            reason: "x".into(),
        });
    }
}
