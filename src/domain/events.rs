//! Audit events for task execution.
//!
//! Every step transition of a task is appended to that task's log. The log is
//! an audit trail only: patient status is always derived from the artifact
//! tree, never from replaying these events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ErrorKind;
use super::step::Step;

/// A single event in the append-only task log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The task this event belongs to
    pub task_uid: String,

    /// Patient the event concerns (absent for task-level events)
    pub patient_id: Option<String>,

    /// Step the event concerns (absent for task-level events)
    pub step: Option<Step>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{task_uid}:{patient_id}:{step}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary
    pub payload_summary: String,

    /// Status of the step at this point
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Failure classification
    pub error_kind: Option<ErrorKind>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        task_uid: impl Into<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            task_uid: task_uid.into(),
            patient_id: None,
            step: None,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error_kind: None,
            error: None,
        }
    }

    /// Attach the patient and step this event concerns
    pub fn for_step(mut self, patient_id: impl Into<String>, step: Step) -> Self {
        self.patient_id = Some(patient_id.into());
        self.step = Some(step);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, error: String) -> Self {
        self.error_kind = Some(kind);
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStarted,
    TaskSucceeded,
    TaskFailed,
    TaskCancelled,
    StepStarted,
    StepSucceeded,

    /// Output already present; executor not invoked
    StepSkipped,

    StepFailed,
}

/// Status of a single step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully (or skipped with existing output)
    Succeeded,

    /// Failed (with error)
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}
