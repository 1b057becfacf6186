//! Step results and their aggregation per patient and per batch.
//!
//! A `PipelineRun` is the ordered list of `StepResult`s produced for one
//! patient during one orchestration invocation. A `BatchResult` collects the
//! runs of every patient touched by that invocation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, StepError};
use super::events::StepStatus;
use super::step::Step;

/// Outcome of executing (or skipping) one step for one patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub patient_id: String,
    pub step: Step,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Artifact paths relative to the data root
    pub output_paths: Vec<PathBuf>,

    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,

    /// True when existing output was reused instead of invoking the executor
    #[serde(default)]
    pub skipped: bool,

    pub duration_ms: Option<u64>,
}

impl StepResult {
    /// Begin a step: the result is `running` until finished
    pub fn start(patient_id: impl Into<String>, step: Step) -> Self {
        Self {
            patient_id: patient_id.into(),
            step,
            status: StepStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            output_paths: Vec::new(),
            error_kind: None,
            error_message: None,
            skipped: false,
            duration_ms: None,
        }
    }

    /// Finish successfully with the produced artifacts
    pub fn succeed(self, output_paths: Vec<PathBuf>) -> Self {
        self.finish(StepStatus::Succeeded, |r| r.output_paths = output_paths)
    }

    /// Finish successfully by reusing artifacts that already exist
    pub fn skip(self, output_paths: Vec<PathBuf>) -> Self {
        self.finish(StepStatus::Succeeded, |r| {
            r.output_paths = output_paths;
            r.skipped = true;
        })
    }

    /// Finish with a classified failure
    pub fn fail(self, error: &StepError) -> Self {
        self.finish(StepStatus::Failed, |r| {
            r.error_kind = Some(error.kind());
            r.error_message = Some(error.to_string());
        })
    }

    // Terminal results are immutable: finishing twice keeps the first outcome.
    fn finish(mut self, status: StepStatus, apply: impl FnOnce(&mut Self)) -> Self {
        if self.status.is_terminal() {
            return self;
        }
        let now = Utc::now();
        apply(&mut self);
        self.status = status;
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.finished_at = Some(now);
        self
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// How a patient's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every planned step succeeded
    Succeeded,

    /// A step failed; later steps were not attempted
    Failed,

    /// Stopped at a step boundary by cancellation
    Cancelled,
}

/// The ordered step results of one patient in one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub patient_id: String,
    pub results: Vec<StepResult>,
    pub outcome: RunOutcome,
}

impl PipelineRun {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            results: Vec::new(),
            outcome: RunOutcome::Succeeded,
        }
    }

    /// Append a terminal result; a failed result ends the run
    pub fn record(&mut self, result: StepResult) {
        debug_assert!(result.status.is_terminal());
        debug_assert!(self.results.last().map_or(true, |last| last.step < result.step));
        if result.is_failed() {
            self.outcome = RunOutcome::Failed;
        }
        self.results.push(result);
    }

    pub fn mark_cancelled(&mut self) {
        self.outcome = RunOutcome::Cancelled;
    }

    pub fn is_succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn failed_result(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.is_failed())
    }

    pub fn last_succeeded_step(&self) -> Option<Step> {
        self.results
            .iter()
            .rev()
            .find(|r| r.is_succeeded())
            .map(|r| r.step)
    }

    pub fn result_for(&self, step: Step) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step == step)
    }
}

/// Aggregated per-patient runs of one orchestration invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub task_uid: String,
    pub runs: BTreeMap<String, PipelineRun>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn get(&self, patient_id: &str) -> Option<&PipelineRun> {
        self.runs.get(patient_id)
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.with_outcome(RunOutcome::Succeeded)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.with_outcome(RunOutcome::Failed)
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.with_outcome(RunOutcome::Cancelled)
    }

    pub fn is_all_succeeded(&self) -> bool {
        self.runs.values().all(PipelineRun::is_succeeded)
    }

    fn with_outcome(&self, outcome: RunOutcome) -> Vec<&str> {
        self.runs
            .values()
            .filter(|run| run.outcome == outcome)
            .map(|run| run.patient_id.as_str())
            .collect()
    }
}
