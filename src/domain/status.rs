//! Filesystem-derived status views.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::artifact::Stage;
use super::step::Step;

/// Presence of one stage's artifacts for a patient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub present: bool,
    pub artifact_count: usize,
}

/// What has actually been produced for a patient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientStatus {
    pub patient_id: String,
    pub raw_input_present: bool,

    /// Steps whose output stage holds artifacts, in canonical order
    pub completed_steps: Vec<Step>,

    /// End of the contiguous completed prefix
    pub last_completed_step: Option<Step>,

    /// First step of the canonical order that has not produced output
    pub next_step: Option<Step>,

    pub stages: Vec<StageStatus>,
}

impl PatientStatus {
    pub fn is_complete(&self) -> bool {
        self.next_step.is_none()
    }
}

/// One stage directory in the data tree overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage: Stage,
    pub dir_name: String,
    pub exists: bool,
    pub patients: Vec<String>,
}

/// Overview of the whole data tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStructure {
    pub root: PathBuf,
    pub stages: Vec<StageSummary>,
}
