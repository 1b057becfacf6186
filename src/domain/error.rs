//! Step failure taxonomy.
//!
//! A failing step is recorded, never thrown past the orchestrator. Every
//! failure carries exactly one `ErrorKind` plus the context needed to act on
//! it without re-running.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::step::Step;

/// Classification of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Required input artifact missing
    PreconditionError,

    /// Executor raised during computation
    ProcessingError,

    /// Artifact read/write failure
    IoError,

    /// Missing external tooling or model assets
    ConfigurationError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::PreconditionError => "PreconditionError",
            ErrorKind::ProcessingError => "ProcessingError",
            ErrorKind::IoError => "IOError",
            ErrorKind::ConfigurationError => "ConfigurationError",
        };
        f.write_str(s)
    }
}

/// A typed step failure
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("{step} for patient {patient_id}: required input missing at {}", path.display())]
    Precondition {
        patient_id: String,
        step: Step,
        path: PathBuf,
    },

    #[error("{step} for patient {patient_id} failed: {message}")]
    Processing {
        patient_id: String,
        step: Step,
        message: String,
    },

    #[error("{step} for patient {patient_id}: I/O error at {}: {message}", path.display())]
    Io {
        patient_id: String,
        step: Step,
        path: PathBuf,
        message: String,
    },

    #[error("{step} is not usable: {message}")]
    Configuration { step: Step, message: String },
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Precondition { .. } => ErrorKind::PreconditionError,
            StepError::Processing { .. } => ErrorKind::ProcessingError,
            StepError::Io { .. } => ErrorKind::IoError,
            StepError::Configuration { .. } => ErrorKind::ConfigurationError,
        }
    }

    pub fn step(&self) -> Step {
        match self {
            StepError::Precondition { step, .. }
            | StepError::Processing { step, .. }
            | StepError::Io { step, .. }
            | StepError::Configuration { step, .. } => *step,
        }
    }
}

/// A step name outside the canonical set
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown step '{0}' (expected one of: dicom_to_nii, registration, nnunet_segmentation, n4_correction, resample, normalization)")]
pub struct UnknownStep(pub String);
