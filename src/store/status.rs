//! Pure status inference over an artifact snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::domain::{ArtifactKind, PatientStatus, Stage, StageStatus, Step};

/// Artifact files found per kind for one patient (paths relative to the data root)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientArtifacts {
    pub patient_id: String,
    pub artifacts: BTreeMap<ArtifactKind, Vec<PathBuf>>,
}

impl PatientArtifacts {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            artifacts: BTreeMap::new(),
        }
    }

    /// Builder used by tests and callers that assemble snapshots by hand
    pub fn with(mut self, kind: ArtifactKind, files: &[&str]) -> Self {
        self.artifacts
            .insert(kind, files.iter().map(PathBuf::from).collect());
        self
    }

    pub fn has(&self, kind: ArtifactKind) -> bool {
        self.count(kind) > 0
    }

    pub fn count(&self, kind: ArtifactKind) -> usize {
        self.artifacts.get(&kind).map_or(0, Vec::len)
    }
}

/// Derive a patient's status from what exists on disk.
///
/// A step counts as completed when its output kind has artifacts.
/// `last_completed_step` is the end of the contiguous completed prefix, so a
/// stray later stage never makes an earlier gap look finished.
pub fn infer_status(artifacts: &PatientArtifacts) -> PatientStatus {
    let stages = Stage::ALL
        .into_iter()
        .map(|stage| {
            let count: usize = stage.kinds().map(|kind| artifacts.count(kind)).sum();
            StageStatus {
                stage,
                present: count > 0,
                artifact_count: count,
            }
        })
        .collect();

    let completed_steps: Vec<Step> = Step::ALL
        .into_iter()
        .filter(|step| artifacts.has(step.output()))
        .collect();

    let next_step = Step::ALL
        .into_iter()
        .find(|step| !artifacts.has(step.output()));

    let last_completed_step = match next_step {
        Some(next) => Step::ALL[..next.index()].last().copied(),
        None => Step::ALL.last().copied(),
    };

    PatientStatus {
        patient_id: artifacts.patient_id.clone(),
        raw_input_present: artifacts.has(ArtifactKind::Dicom),
        completed_steps,
        last_completed_step,
        next_step,
        stages,
    }
}
