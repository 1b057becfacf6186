//! Domain types for the medpipe orchestrator.
//!
//! This module contains the core data structures:
//! - Step / Stage / ArtifactKind: the fixed processing order and its artifact layout
//! - StepResult / PipelineRun / BatchResult: outcomes of one invocation
//! - Task / ProgressRecord: the durable ledger and its polling view
//! - PatientStatus: filesystem-derived status
//! - Events: audit records of step transitions

pub mod artifact;
pub mod error;
pub mod events;
pub mod run;
pub mod status;
pub mod step;
pub mod task;

// Re-export commonly used types
pub use artifact::{ArtifactKind, Stage};
pub use error::{ErrorKind, StepError, UnknownStep};
pub use events::{Event, EventType, StepStatus};
pub use run::{BatchResult, PipelineRun, RunOutcome, StepResult};
pub use status::{DataStructure, PatientStatus, StageStatus, StageSummary};
pub use step::{Step, StepInfo};
pub use task::{ProgressRecord, Task, TaskStatistics, TaskStatus};
