//! Trigger layer: everything that decides a workflow should start.
//!
//! Both entry points go through the store's dedup guard before handing the
//! run to the orchestrator, so concurrent triggers for the same target
//! resolve to exactly one active run.

pub mod sweep;
pub mod webhook;

pub use sweep::SweepScanner;
