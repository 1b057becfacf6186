//! medpipe - Medical image preprocessing pipeline orchestrator
//!
//! Drives a fixed sequence of preprocessing steps over per-patient imaging
//! data, from raw DICOM through NIfTI conversion, registration, segmentation,
//! bias correction and resampling to normalization. The orchestrator never
//! touches image contents; external tools do the work behind the `Executor`
//! trait.
//!
//! # Architecture
//!
//! The filesystem is the database:
//! - Each step writes its artifacts into a numbered stage directory
//! - A step is complete when its output artifacts exist
//! - Status is re-derived from disk, so reruns skip finished work
//!
//! Each invocation is also recorded as a durable Task (SQLite) with an
//! in-memory progress record for polling clients and a JSONL audit log.
//!
//! # Modules
//!
//! - `adapters`: Step executors (subprocess commands)
//! - `core`: Orchestrator, TaskRegistry, ProgressTracker, EventStore
//! - `domain`: Data structures (Step, Stage, StepResult, Task)
//! - `store`: Artifact store layout, status inference, patient locks
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the remaining steps for every patient
//! medpipe run --data-root /data/study --watch
//!
//! # Run one step for one patient
//! medpipe step P001 dicom_to_nii --data-root /data/study
//!
//! # What is done, according to the filesystem
//! medpipe status P001 --data-root /data/study
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use adapters::{CommandExecutor, CommandSpec, Executor, ExecutorTable, StepContext};
pub use core::{Orchestrator, ProcessRequest, ProgressTracker, TaskRegistry};
pub use domain::{
    BatchResult, ErrorKind, PipelineRun, ProgressRecord, RunOutcome, Stage, Step, StepError,
    StepResult, StepStatus, Task, TaskStatus,
};
pub use store::ArtifactStore;
