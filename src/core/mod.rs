//! Core orchestration logic.
//!
//! This module contains:
//! - Orchestrator: plans and executes per-patient step sequences
//! - TaskRegistry: durable task ledger (SQLite)
//! - ProgressTracker: in-memory progress records for polling
//! - EventStore: append-only audit log per task
//! - CancelToken: cooperative cancellation at step boundaries

pub mod cancel;
pub mod event_store;
pub mod orchestrator;
pub mod progress;
pub mod task_registry;

// Re-export commonly used types
pub use cancel::CancelToken;
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use orchestrator::{
    plan_steps, Orchestrator, PatientPlan, PreparedRun, ProcessRequest, StatusReport, DEFAULT_WORKERS,
};
pub use progress::{poll_until_done, PollOutcome, ProgressError, ProgressTracker, DEFAULT_POLL_INTERVAL};
pub use task_registry::{RegistryError, TaskRegistry, TaskUpdate};
