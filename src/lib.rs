//! codemend — automated code-quality remediation orchestrator.
//!
//! Watches installed repositories and keeps them clean: scheduled sweeps
//! open fix pull requests against the default branch, and webhook-triggered
//! review runs push fixes onto open pull requests. Every remediation is a
//! durable multi-step run — checkpointed in SQLite, deduplicated per
//! target, resource-guarded, and billed by actual usage.

pub mod billing;
pub mod config;
pub mod db;
pub mod errors;
pub mod exec;
pub mod guard;
pub mod models;
pub mod providers;
pub mod server;
pub mod steps;
pub mod trigger;
pub mod workflow;
