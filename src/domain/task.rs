//! Tasks and their progress view.
//!
//! A `Task` is the durable record of one orchestration invocation. A
//! `ProgressRecord` is the read-optimized view polled by clients; it is always
//! built from a `Task` so the two never diverge.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a task: `queued → running → (succeeded | failed | cancelled)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,

    /// Stopped at a step boundary on request
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Transitions are monotonic; re-asserting the current status is allowed.
    ///
    /// Success is only reachable through `running`; a queued task may still
    /// fail or be cancelled before it starts.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            TaskStatus::Queued => matches!(
                next,
                TaskStatus::Running | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{}'", s))
    }
}

/// Durable record of one orchestration invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_uid: String,
    pub total_steps: u32,
    pub status: TaskStatus,

    /// One-based number of the step currently executing
    pub current_step_number: u32,

    /// `<patient_id>:<step>` of the step currently executing
    pub current_step_uid: Option<String>,

    /// Count of completed steps; never regresses
    pub last_completed_step: u32,

    pub failed_step_number: Option<u32>,
    pub failed_step_uid: Option<String>,
    pub user_uid: Option<String>,
    pub request_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Completion percentage derived from the step counters
    pub fn progress(&self) -> f64 {
        if self.total_steps == 0 {
            return if self.status == TaskStatus::Succeeded { 100.0 } else { 0.0 };
        }
        self.last_completed_step as f64 / self.total_steps as f64 * 100.0
    }
}

/// Counts per status across the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: u64,
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Polling view of a task's completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,

    /// 0–100
    pub progress: f64,

    pub status: TaskStatus,
    pub message: Option<String>,
    pub completed: bool,
    pub timestamp: DateTime<Utc>,
}

impl ProgressRecord {
    /// Build the progress view of a task
    pub fn from_task(task: &Task, message: Option<String>) -> Self {
        Self {
            task_id: task.task_uid.clone(),
            progress: task.progress(),
            status: task.status,
            message,
            completed: task.status.is_terminal(),
            timestamp: Utc::now(),
        }
    }
}
