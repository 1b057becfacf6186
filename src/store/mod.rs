//! Artifact store: the numbered stage directories under a data root.
//!
//! The orchestrator reads and writes paths here but never interprets file
//! contents. Patient status is derived purely from what exists on disk, so it
//! stays correct across process restarts.
//!
//! - `ArtifactStore`: layout, discovery and precondition checks
//! - `infer_status`: pure status inference over a snapshot
//! - `PatientLocks`: single-flight guard per patient tree

pub mod layout;
pub mod locks;
pub mod status;

pub use layout::{validate_patient_id, ArtifactStore, InvalidPatientId};
pub use locks::{PatientGuard, PatientLocks};
pub use status::{infer_status, PatientArtifacts};
