//! Path layout and discovery for the artifact tree.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use glob::MatchOptions;
use thiserror::Error;
use tracing::debug;

use crate::domain::{ArtifactKind, DataStructure, Stage, StageSummary, Step, StepError};

use super::status::PatientArtifacts;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// A patient id that cannot name a folder inside a stage directory
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid patient id '{0}': must be a plain, non-hidden folder name")]
pub struct InvalidPatientId(pub String);

/// Reject ids that would escape the stage directory or collide with hidden entries
pub fn validate_patient_id(patient_id: &str) -> Result<(), InvalidPatientId> {
    let bad = patient_id.is_empty()
        || patient_id.starts_with('.')
        || patient_id.contains(['/', '\\'])
        || patient_id.contains('\0');
    if bad {
        Err(InvalidPatientId(patient_id.to_string()))
    } else {
        Ok(())
    }
}

/// Filesystem layout rooted at a data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<index>_<Name>`
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// `<root>/<index>_<Name>/<patient_id>`
    pub fn patient_dir(&self, stage: Stage, patient_id: &str) -> PathBuf {
        self.stage_dir(stage).join(patient_id)
    }

    /// Express a path relative to the data root when it lies inside it
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }

    /// Patients with a folder under the raw-input stage, sorted
    pub fn discover_patients(&self) -> io::Result<Vec<String>> {
        list_subdirs(&self.stage_dir(Stage::Dicom))
    }

    /// Artifact files of one kind for one patient, sorted and de-duplicated
    pub fn artifacts(&self, kind: ArtifactKind, patient_id: &str) -> io::Result<Vec<PathBuf>> {
        let dir = self.patient_dir(kind.stage(), patient_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let base = glob::Pattern::escape(&dir.to_string_lossy());
        let mut found = BTreeSet::new();

        for pattern in kind.patterns() {
            let full = format!("{}/{}", base, pattern);
            let entries = glob::glob_with(&full, MATCH_OPTIONS)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            for entry in entries {
                let path = entry.map_err(io::Error::from)?;
                if path.is_file() && kind.accepts(&path) {
                    found.insert(path);
                }
            }
        }

        Ok(found.into_iter().collect())
    }

    /// Verify every input kind of `step` has artifacts for the patient.
    ///
    /// Returns the input artifact files on success, or a `PreconditionError`
    /// naming the first missing input.
    pub fn check_inputs(&self, step: Step, patient_id: &str) -> Result<Vec<PathBuf>, StepError> {
        let mut inputs = Vec::new();

        for &kind in step.inputs() {
            let dir = self.patient_dir(kind.stage(), patient_id);
            let found = self.artifacts(kind, patient_id).map_err(|e| StepError::Io {
                patient_id: patient_id.to_string(),
                step,
                path: dir.clone(),
                message: e.to_string(),
            })?;

            if found.is_empty() {
                let path = match kind {
                    ArtifactKind::Mask => dir.join("*_seg.nii.gz"),
                    _ => dir,
                };
                return Err(StepError::Precondition {
                    patient_id: patient_id.to_string(),
                    step,
                    path,
                });
            }
            inputs.extend(found);
        }

        Ok(inputs)
    }

    /// Existing output artifacts of `step` for the patient
    pub fn output_artifacts(&self, step: Step, patient_id: &str) -> io::Result<Vec<PathBuf>> {
        self.artifacts(step.output(), patient_id)
    }

    pub fn output_exists(&self, step: Step, patient_id: &str) -> io::Result<bool> {
        Ok(!self.output_artifacts(step, patient_id)?.is_empty())
    }

    /// Delete the existing output artifacts of `step` before a forced re-run.
    ///
    /// Only files of the step's own kind are removed; in `2_Reg` the masks and
    /// the registered volumes are cleared independently.
    pub fn clear_outputs(&self, step: Step, patient_id: &str) -> io::Result<usize> {
        let existing = self.output_artifacts(step, patient_id)?;
        for path in &existing {
            std::fs::remove_file(path)?;
        }
        if !existing.is_empty() {
            debug!(patient_id, %step, removed = existing.len(), "Cleared previous outputs");
        }
        Ok(existing.len())
    }

    /// Capture every kind of artifact for one patient
    pub fn snapshot(&self, patient_id: &str) -> io::Result<PatientArtifacts> {
        let mut snapshot = PatientArtifacts::new(patient_id);
        for kind in ArtifactKind::ALL {
            let files = self
                .artifacts(kind, patient_id)?
                .into_iter()
                .map(|p| self.relative(&p))
                .collect();
            snapshot.artifacts.insert(kind, files);
        }
        Ok(snapshot)
    }

    /// Overview of all stage directories and the patients in each
    pub fn data_structure(&self) -> io::Result<DataStructure> {
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let dir = self.stage_dir(stage);
            stages.push(StageSummary {
                stage,
                dir_name: stage.dir_name().to_string(),
                exists: dir.is_dir(),
                patients: list_subdirs(&dir)?,
            });
        }
        Ok(DataStructure {
            root: self.root.clone(),
            stages,
        })
    }
}

/// Sorted names of non-hidden subdirectories; empty if `dir` is absent
fn list_subdirs(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}
