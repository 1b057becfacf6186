//! The fixed, totally ordered set of processing steps.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::artifact::{ArtifactKind, Stage};
use super::error::UnknownStep;

/// One stage of the processing order.
///
/// The derived `Ord` is the canonical execution order. Each step reads
/// artifacts produced by earlier steps and writes exactly one `ArtifactKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// DICOM series to NIfTI conversion
    DicomToNii,

    /// Co-registration of sequences
    Registration,

    /// nnU-Net segmentation
    NnunetSegmentation,

    /// N4 bias-field correction
    N4Correction,

    /// Voxel resampling
    Resample,

    /// Intensity normalization
    Normalization,
}

impl Step {
    /// All steps in canonical order
    pub const ALL: [Step; 6] = [
        Step::DicomToNii,
        Step::Registration,
        Step::NnunetSegmentation,
        Step::N4Correction,
        Step::Resample,
        Step::Normalization,
    ];

    /// Zero-based position in the canonical order
    pub fn index(self) -> usize {
        self as usize
    }

    /// One-based step number
    pub fn number(self) -> u32 {
        self.index() as u32 + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::DicomToNii => "dicom_to_nii",
            Step::Registration => "registration",
            Step::NnunetSegmentation => "nnunet_segmentation",
            Step::N4Correction => "n4_correction",
            Step::Resample => "resample",
            Step::Normalization => "normalization",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Step::DicomToNii => "Convert raw DICOM series to NIfTI volumes",
            Step::Registration => "Register all sequences to a common reference",
            Step::NnunetSegmentation => "Segment registered volumes with nnU-Net",
            Step::N4Correction => "Apply N4 bias-field correction",
            Step::Resample => "Resample volumes to the target voxel spacing",
            Step::Normalization => "Normalize voxel intensities",
        }
    }

    /// Artifacts that must exist before this step may run
    pub fn inputs(self) -> &'static [ArtifactKind] {
        match self {
            Step::DicomToNii => &[ArtifactKind::Dicom],
            Step::Registration => &[ArtifactKind::Nifti],
            Step::NnunetSegmentation => &[ArtifactKind::Registered],
            Step::N4Correction => &[ArtifactKind::Registered, ArtifactKind::Mask],
            Step::Resample => &[ArtifactKind::Corrected],
            Step::Normalization => &[ArtifactKind::Resampled],
        }
    }

    /// Artifacts this step writes
    pub fn output(self) -> ArtifactKind {
        match self {
            Step::DicomToNii => ArtifactKind::Nifti,
            Step::Registration => ArtifactKind::Registered,
            Step::NnunetSegmentation => ArtifactKind::Mask,
            Step::N4Correction => ArtifactKind::Corrected,
            Step::Resample => ArtifactKind::Resampled,
            Step::Normalization => ArtifactKind::Normalized,
        }
    }

    /// Stage directory this step writes into
    pub fn output_stage(self) -> Stage {
        self.output().stage()
    }

    /// Following step in canonical order
    pub fn next(self) -> Option<Step> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Sort and de-duplicate an arbitrary step list into canonical order
    pub fn canonical(steps: &[Step]) -> Vec<Step> {
        let mut ordered = steps.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Step {
    type Err = UnknownStep;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| UnknownStep(s.to_string()))
    }
}

/// Catalog entry returned by `get_available_steps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInfo {
    pub step: Step,
    pub number: u32,
    pub description: String,
    pub inputs: Vec<ArtifactKind>,
    pub output: ArtifactKind,
    pub output_stage: Stage,
}

impl From<Step> for StepInfo {
    fn from(step: Step) -> Self {
        Self {
            step,
            number: step.number(),
            description: step.description().to_string(),
            inputs: step.inputs().to_vec(),
            output: step.output(),
            output_stage: step.output_stage(),
        }
    }
}
