//! Artifact stages of the on-disk data tree.
//!
//! Every stage is a numbered directory directly under the data root holding one
//! folder per patient: `<data_root>/<index>_<Name>/<patient_id>/...`.
//!
//! Stages and steps are not one-to-one: registration and segmentation both
//! write into `2_Reg`, the segmentation as `*_seg.nii.gz` masks beside the
//! registered volumes. `ArtifactKind` tells the two apart.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// A numbered stage directory in the artifact tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Raw DICOM series (pipeline input)
    Dicom,

    /// Converted NIfTI volumes
    Nii,

    /// Co-registered volumes and their segmentation masks
    Reg,

    /// Bias-field corrected volumes
    N4,

    /// Resampled volumes
    Res,

    /// Intensity-normalized volumes (final output)
    Norm,
}

impl Stage {
    /// All stages in directory order
    pub const ALL: [Stage; 6] = [
        Stage::Dicom,
        Stage::Nii,
        Stage::Reg,
        Stage::N4,
        Stage::Res,
        Stage::Norm,
    ];

    /// Numeric prefix of the stage directory
    pub fn index(self) -> usize {
        self as usize
    }

    /// Directory name, e.g. `1_NII`
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Dicom => "0_DICOM",
            Stage::Nii => "1_NII",
            Stage::Reg => "2_Reg",
            Stage::N4 => "3_N4",
            Stage::Res => "4_Res",
            Stage::Norm => "5_Norm",
        }
    }

    /// Parse a stage from its directory name
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.dir_name() == name)
    }

    /// Whether this stage holds raw pipeline input
    pub fn is_raw_input(self) -> bool {
        matches!(self, Stage::Dicom)
    }

    /// Artifact kinds stored in this stage's patient folders
    pub fn kinds(self) -> impl Iterator<Item = ArtifactKind> {
        ArtifactKind::ALL.into_iter().filter(move |k| k.stage() == self)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.dir_name())
    }
}

// Any regular non-hidden file; PACS exports often have no .dcm extension
const DICOM_PATTERNS: &[&str] = &["**/*"];
const NIFTI_PATTERNS: &[&str] = &["**/*.nii.gz", "**/*.nii"];
const MASK_PATTERNS: &[&str] = &["**/*_seg.nii.gz", "**/*_seg.nii"];
const MASK_SUFFIXES: &[&str] = &["_seg.nii.gz", "_seg.nii"];

/// A class of artifact file: the stage folder holding it and how it is named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw DICOM files in `0_DICOM`
    Dicom,

    /// Converted volumes in `1_NII`
    Nifti,

    /// Registered volumes in `2_Reg` (every NIfTI that is not a mask)
    Registered,

    /// Segmentation masks (`*_seg.nii.gz`) in `2_Reg`
    Mask,

    /// Bias-field corrected volumes in `3_N4`
    Corrected,

    /// Resampled volumes in `4_Res`
    Resampled,

    /// Normalized volumes in `5_Norm`
    Normalized,
}

impl ArtifactKind {
    /// All kinds in pipeline order
    pub const ALL: [ArtifactKind; 7] = [
        ArtifactKind::Dicom,
        ArtifactKind::Nifti,
        ArtifactKind::Registered,
        ArtifactKind::Mask,
        ArtifactKind::Corrected,
        ArtifactKind::Resampled,
        ArtifactKind::Normalized,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn stage(self) -> Stage {
        match self {
            ArtifactKind::Dicom => Stage::Dicom,
            ArtifactKind::Nifti => Stage::Nii,
            ArtifactKind::Registered | ArtifactKind::Mask => Stage::Reg,
            ArtifactKind::Corrected => Stage::N4,
            ArtifactKind::Resampled => Stage::Res,
            ArtifactKind::Normalized => Stage::Norm,
        }
    }

    /// Glob patterns (relative to a patient folder) that may name this kind
    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            ArtifactKind::Dicom => DICOM_PATTERNS,
            ArtifactKind::Mask => MASK_PATTERNS,
            _ => NIFTI_PATTERNS,
        }
    }

    /// Final filter on a file already matched by `patterns`
    pub fn accepts(self, path: &Path) -> bool {
        match self {
            ArtifactKind::Registered => !is_mask(path),
            _ => true,
        }
    }

    /// Short label for listings, e.g. `2_Reg` or `2_Reg/*_seg`
    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Mask => "2_Reg/*_seg",
            other => other.stage().dir_name(),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.label())
    }
}

/// Whether a file name carries the segmentation-mask suffix (case-insensitive)
pub fn is_mask(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| {
            let name = name.to_ascii_lowercase();
            MASK_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .unwrap_or(false)
}
