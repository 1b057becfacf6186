//! Main orchestrator for per-patient pipeline execution.
//!
//! Coordinates step ordering, precondition checks, idempotent skips, batch
//! fan-out with per-patient failure isolation, and task/progress reporting.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ExecutorTable, StepContext};
use crate::domain::{
    BatchResult, DataStructure, Event, EventType, PatientStatus, PipelineRun, RunOutcome, Step,
    StepError, StepInfo, StepResult, StepStatus, TaskStatus,
};
use crate::store::{infer_status, validate_patient_id, ArtifactStore, PatientLocks};

use super::cancel::CancelToken;
use super::event_store::{generate_idempotency_key, EventStore};
use super::progress::ProgressTracker;
use super::task_registry::TaskRegistry;

/// Default number of patients processed in parallel
pub const DEFAULT_WORKERS: usize = 4;

/// What to run: which data root, which patients, which steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub data_root: PathBuf,

    /// `None` runs every patient discovered under the raw-input stage
    pub patient_id: Option<String>,

    /// `None` runs the canonical order from the first step whose output is absent
    pub steps: Option<Vec<Step>>,

    /// Re-run steps even when their output already exists
    #[serde(default)]
    pub force: bool,

    /// Stop starting new steps for every patient once one patient fails
    #[serde(default)]
    pub stop_on_patient_failure: bool,

    pub user_uid: Option<String>,
}

impl ProcessRequest {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            patient_id: None,
            steps: None,
            force: false,
            stop_on_patient_failure: false,
            user_uid: None,
        }
    }

    pub fn patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn stop_on_patient_failure(mut self, stop: bool) -> Self {
        self.stop_on_patient_failure = stop;
        self
    }

    pub fn user(mut self, user_uid: impl Into<String>) -> Self {
        self.user_uid = Some(user_uid.into());
        self
    }
}

/// Steps planned for one patient, in canonical order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientPlan {
    pub patient_id: String,
    pub steps: Vec<Step>,
}

/// A registered task whose plans are fixed but which has not started yet
#[derive(Debug)]
pub struct PreparedRun {
    pub task_uid: String,
    pub plans: Vec<PatientPlan>,
    request: ProcessRequest,
    store: ArtifactStore,
    cancel: CancelToken,
}

impl PreparedRun {
    pub fn total_steps(&self) -> u32 {
        self.plans.iter().map(|p| p.steps.len() as u32).sum()
    }
}

/// Status of one patient or of every patient under a data root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusReport {
    Patient(PatientStatus),
    All(BTreeMap<String, PatientStatus>),
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    executors: ExecutorTable,
    registry: Arc<TaskRegistry>,
    progress: Arc<ProgressTracker>,
    events: Option<Arc<EventStore>>,
    locks: PatientLocks,
    workers: usize,
    active: Mutex<HashMap<String, CancelToken>>,
}

impl Orchestrator {
    /// Create an orchestrator over injected collaborators
    pub fn new(executors: ExecutorTable, registry: Arc<TaskRegistry>, progress: Arc<ProgressTracker>) -> Self {
        Self {
            executors,
            registry,
            progress,
            events: None,
            locks: PatientLocks::new(),
            workers: DEFAULT_WORKERS,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Record an audit trail of every step transition
    pub fn with_event_store(mut self, events: Arc<EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound the number of patients processed in parallel (minimum 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn event_store(&self) -> Option<&Arc<EventStore>> {
        self.events.as_ref()
    }

    /// Run `steps` (or the remaining canonical order) for one patient or all patients
    pub async fn process(
        &self,
        data_root: &Path,
        patient_id: Option<&str>,
        steps: Option<Vec<Step>>,
    ) -> Result<BatchResult> {
        let mut request = ProcessRequest::new(data_root);
        request.patient_id = patient_id.map(str::to_string);
        request.steps = steps;
        self.process_request(request).await
    }

    pub async fn process_request(&self, request: ProcessRequest) -> Result<BatchResult> {
        let prepared = self.prepare(request)?;
        self.execute(prepared).await
    }

    /// Run exactly one step for one patient
    pub async fn process_single_step(
        &self,
        data_root: &Path,
        patient_id: &str,
        step: Step,
        force: bool,
    ) -> Result<StepResult> {
        let request = ProcessRequest::new(data_root)
            .patient(patient_id)
            .steps(vec![step])
            .force(force);
        let batch = self.process_request(request).await?;

        batch
            .get(patient_id)
            .and_then(|run| run.result_for(step))
            .cloned()
            .with_context(|| format!("No result recorded for {} of patient {}", step, patient_id))
    }

    /// Start a run in the background; the task uid is available for polling immediately
    pub fn spawn(self: &Arc<Self>, request: ProcessRequest) -> Result<(String, JoinHandle<Result<BatchResult>>)> {
        let prepared = self.prepare(request)?;
        let task_uid = prepared.task_uid.clone();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.execute(prepared).await });
        Ok((task_uid, handle))
    }

    /// Ask a running task to stop before its next step; false if the task is not active
    pub fn cancel(&self, task_uid: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        match active.get(task_uid) {
            Some(token) => {
                info!(%task_uid, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resolve patients and plans, then register the task.
    ///
    /// The returned run must be handed to `execute` or `discard`; until then
    /// the task stays `queued` and remains cancellable.
    #[instrument(skip(self, request), fields(data_root = %request.data_root.display()))]
    pub fn prepare(&self, request: ProcessRequest) -> Result<PreparedRun> {
        if !request.data_root.is_dir() {
            anyhow::bail!("Data root does not exist: {}", request.data_root.display());
        }
        let store = ArtifactStore::new(&request.data_root);

        let patients = match &request.patient_id {
            Some(patient_id) => {
                validate_patient_id(patient_id)?;
                vec![patient_id.clone()]
            }
            None => store
                .discover_patients()
                .with_context(|| format!("Failed to discover patients in {}", store.root().display()))?,
        };

        let mut plans = Vec::with_capacity(patients.len());
        for patient_id in patients {
            let steps = plan_steps(&store, &patient_id, request.steps.as_deref(), request.force)?;
            plans.push(PatientPlan { patient_id, steps });
        }

        let total_steps: u32 = plans.iter().map(|p| p.steps.len() as u32).sum();
        let request_json = serde_json::to_string(&request).context("Failed to serialize request")?;
        let task_uid = self
            .registry
            .create_task(total_steps, request.user_uid.as_deref(), &request_json)
            .context("Failed to register task")?;

        info!(%task_uid, patients = plans.len(), total_steps, "Task registered");

        if let Some(task) = self.registry.get_task(&task_uid)? {
            self.progress.publish(&task, Some("queued".to_string()));
        }

        let cancel = CancelToken::new();
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_uid.clone(), cancel.clone());

        Ok(PreparedRun {
            task_uid,
            plans,
            request,
            store,
            cancel,
        })
    }

    /// Execute a prepared run to completion
    #[instrument(skip(self, prepared), fields(task_uid = %prepared.task_uid))]
    pub async fn execute(&self, prepared: PreparedRun) -> Result<BatchResult> {
        let started_at = Utc::now();
        let PreparedRun {
            task_uid,
            plans,
            request,
            store,
            cancel,
        } = prepared;

        let reporter = TaskReporter {
            task_uid: task_uid.clone(),
            registry: &self.registry,
            progress: &self.progress,
            events: self.events.as_deref(),
            gate: tokio::sync::Mutex::new(()),
        };

        let outcome = async {
            reporter.task_started(plans.len()).await?;

            // Fires when a patient fails and the request opted into batch abort
            let abort = CancelToken::new();

            let runs: Vec<PipelineRun> = stream::iter(plans)
                .map(|plan| {
                    let reporter = &reporter;
                    let store = &store;
                    let cancel = &cancel;
                    let abort = &abort;
                    let request = &request;
                    async move {
                        let run = self
                            .run_patient(store, plan, request.force, reporter, cancel, abort)
                            .await;
                        if run.outcome == RunOutcome::Failed && request.stop_on_patient_failure {
                            warn!(patient_id = %run.patient_id, "Patient failed; stopping remaining patients");
                            abort.cancel();
                        }
                        run
                    }
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

            let runs: BTreeMap<String, PipelineRun> =
                runs.into_iter().map(|run| (run.patient_id.clone(), run)).collect();

            let status = if runs.values().any(|r| r.outcome == RunOutcome::Failed) {
                TaskStatus::Failed
            } else if runs.values().any(|r| r.outcome == RunOutcome::Cancelled) {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Succeeded
            };
            reporter.task_finished(status, &runs).await?;

            Ok::<_, anyhow::Error>(BatchResult {
                task_uid: task_uid.clone(),
                runs,
                started_at,
                finished_at: Utc::now(),
            })
        }
        .await;

        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_uid);

        outcome
    }

    /// Drop a prepared run without executing it; its task ends `cancelled`
    pub fn discard(&self, prepared: PreparedRun) -> Result<()> {
        let task_uid = prepared.task_uid;
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&task_uid);

        let task = self
            .registry
            .finish(&task_uid, TaskStatus::Cancelled)
            .with_context(|| format!("Failed to discard task {}", task_uid))?;
        self.progress.publish(&task, Some("discarded before start".to_string()));
        info!(%task_uid, "Prepared run discarded");
        Ok(())
    }

    /// Number of tasks prepared or executing right now
    pub fn active_tasks(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Walk one patient's plan under its single-flight lock
    async fn run_patient(
        &self,
        store: &ArtifactStore,
        plan: PatientPlan,
        force: bool,
        reporter: &TaskReporter<'_>,
        cancel: &CancelToken,
        abort: &CancelToken,
    ) -> PipelineRun {
        let patient_id = plan.patient_id.as_str();
        let mut run = PipelineRun::new(patient_id);

        let Some(&first) = plan.steps.first() else {
            debug!(patient_id, "Nothing to do");
            return run;
        };

        if cancel.is_cancelled() || abort.is_cancelled() {
            run.mark_cancelled();
            return run;
        }

        let _guard = match self.locks.acquire(store, patient_id).await {
            Ok(guard) => guard,
            Err(e) => {
                let err = StepError::Io {
                    patient_id: patient_id.to_string(),
                    step: first,
                    path: store.root().join(crate::store::locks::LOCK_DIR),
                    message: format!("failed to acquire patient lock: {}", e),
                };
                error!(patient_id, error = %err, "Patient lock unavailable");
                let result = StepResult::start(patient_id, first).fail(&err);
                reporter.step_failed(&result).await;
                run.record(result);
                return run;
            }
        };

        info!(patient_id, steps = plan.steps.len(), "Processing patient");

        for step in plan.steps {
            if cancel.is_cancelled() || abort.is_cancelled() {
                info!(patient_id, next_step = %step, "Run cancelled at step boundary");
                run.mark_cancelled();
                break;
            }

            let result = self.run_step(store, patient_id, step, force, reporter).await;
            let failed = result.is_failed();
            run.record(result);
            if failed {
                break;
            }
        }

        run
    }

    /// Execute, skip, or reject one step; never returns an error
    async fn run_step(
        &self,
        store: &ArtifactStore,
        patient_id: &str,
        step: Step,
        force: bool,
        reporter: &TaskReporter<'_>,
    ) -> StepResult {
        let result = StepResult::start(patient_id, step);

        let inputs = match store.check_inputs(step, patient_id) {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(patient_id, %step, error = %err, "Precondition failed");
                let result = result.fail(&err);
                reporter.step_failed(&result).await;
                return result;
            }
        };

        if !force {
            match store.output_artifacts(step, patient_id) {
                Ok(existing) if !existing.is_empty() => {
                    info!(patient_id, %step, "Output already present, skipping");
                    let outputs = existing.iter().map(|p| store.relative(p)).collect();
                    let result = result.skip(outputs);
                    reporter.step_completed(&result, &inputs).await;
                    return result;
                }
                Ok(_) => {}
                Err(e) => {
                    let err = StepError::Io {
                        patient_id: patient_id.to_string(),
                        step,
                        path: store.patient_dir(step.output_stage(), patient_id),
                        message: e.to_string(),
                    };
                    let result = result.fail(&err);
                    reporter.step_failed(&result).await;
                    return result;
                }
            }
        }

        let executor = match self.executors.get(step) {
            Ok(executor) => executor,
            Err(err) => {
                error!(patient_id, %step, error = %err, "No executor");
                let result = result.fail(&err);
                reporter.step_failed(&result).await;
                return result;
            }
        };

        let output_dir = store.patient_dir(step.output_stage(), patient_id);

        // A forced step starts with none of its own output kind present
        if force {
            if let Err(e) = store.clear_outputs(step, patient_id) {
                let err = StepError::Io {
                    patient_id: patient_id.to_string(),
                    step,
                    path: output_dir.clone(),
                    message: format!("failed to clear previous outputs: {}", e),
                };
                error!(patient_id, %step, error = %err, "Could not clear previous outputs");
                let result = result.fail(&err);
                reporter.step_failed(&result).await;
                return result;
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            let err = StepError::Io {
                patient_id: patient_id.to_string(),
                step,
                path: output_dir.clone(),
                message: e.to_string(),
            };
            let result = result.fail(&err);
            reporter.step_failed(&result).await;
            return result;
        }

        let ctx = StepContext {
            patient_id: patient_id.to_string(),
            step,
            data_root: store.root().to_path_buf(),
            input_dirs: step
                .inputs()
                .iter()
                .map(|kind| store.patient_dir(kind.stage(), patient_id))
                .collect(),
            input_paths: inputs.clone(),
            output_dir,
        };

        reporter.step_started(patient_id, step, &inputs).await;
        let executor_name = executor.name().to_string();
        info!(patient_id, %step, executor = %executor_name, "Executing step");

        // Run on its own task so a panicking executor only fails this step
        let outcome = tokio::spawn(async move { executor.execute(&ctx).await }).await;

        // Success requires the output kind to exist in the tree
        let outcome = match outcome {
            Ok(Ok(_)) => match store.output_artifacts(step, patient_id) {
                Ok(produced) if produced.is_empty() => Ok(Err(StepError::Processing {
                    patient_id: patient_id.to_string(),
                    step,
                    message: format!(
                        "executor '{}' reported success but produced no {} artifacts",
                        executor_name,
                        step.output()
                    ),
                })),
                Ok(produced) => Ok(Ok(produced)),
                Err(e) => Ok(Err(StepError::Io {
                    patient_id: patient_id.to_string(),
                    step,
                    path: store.patient_dir(step.output_stage(), patient_id),
                    message: e.to_string(),
                })),
            },
            other => other,
        };

        match outcome {
            Ok(Ok(outputs)) => {
                let outputs = outputs.iter().map(|p| store.relative(p)).collect();
                let result = result.succeed(outputs);
                info!(patient_id, %step, duration_ms = result.duration_ms, "Step succeeded");
                reporter.step_completed(&result, &inputs).await;
                result
            }
            Ok(Err(err)) => {
                error!(patient_id, %step, kind = %err.kind(), error = %err, "Step failed");
                let result = result.fail(&err);
                reporter.step_failed(&result).await;
                result
            }
            Err(join_err) => {
                let err = StepError::Processing {
                    patient_id: patient_id.to_string(),
                    step,
                    message: format!("executor aborted: {}", join_err),
                };
                error!(patient_id, %step, error = %err, "Step executor panicked");
                let result = result.fail(&err);
                reporter.step_failed(&result).await;
                result
            }
        }
    }

    /// Filesystem-derived status of one patient
    pub fn get_patient_status(&self, data_root: &Path, patient_id: &str) -> Result<PatientStatus> {
        validate_patient_id(patient_id)?;
        let store = ArtifactStore::new(data_root);
        let snapshot = store
            .snapshot(patient_id)
            .with_context(|| format!("Failed to scan artifacts of patient {}", patient_id))?;
        Ok(infer_status(&snapshot))
    }

    /// Status of one patient, or of every discovered patient
    pub fn get_status(&self, data_root: &Path, patient_id: Option<&str>) -> Result<StatusReport> {
        if let Some(patient_id) = patient_id {
            return Ok(StatusReport::Patient(self.get_patient_status(data_root, patient_id)?));
        }

        let store = ArtifactStore::new(data_root);
        let mut all = BTreeMap::new();
        for patient_id in store.discover_patients()? {
            let status = self.get_patient_status(data_root, &patient_id)?;
            all.insert(patient_id, status);
        }
        Ok(StatusReport::All(all))
    }

    pub fn get_available_steps(&self) -> Vec<StepInfo> {
        Step::ALL.into_iter().map(StepInfo::from).collect()
    }

    pub fn get_data_structure(&self, data_root: &Path) -> Result<DataStructure> {
        ArtifactStore::new(data_root)
            .data_structure()
            .with_context(|| format!("Failed to scan data root {}", data_root.display()))
    }
}

/// Steps to run for one patient.
///
/// An explicit list is sorted into canonical order. Otherwise the plan starts
/// at the first step whose output is absent (or at the beginning when forced);
/// later steps with existing output are skipped at execution time.
pub fn plan_steps(store: &ArtifactStore, patient_id: &str, steps: Option<&[Step]>, force: bool) -> Result<Vec<Step>> {
    if let Some(steps) = steps {
        return Ok(Step::canonical(steps));
    }
    if force {
        return Ok(Step::ALL.to_vec());
    }

    for step in Step::ALL {
        let exists = store
            .output_exists(step, patient_id)
            .with_context(|| format!("Failed to inspect {} output of patient {}", step, patient_id))?;
        if !exists {
            return Ok(Step::ALL[step.index()..].to_vec());
        }
    }
    Ok(Vec::new())
}

/// Serializes ledger, progress, and audit writes for one task
struct TaskReporter<'a> {
    task_uid: String,
    registry: &'a TaskRegistry,
    progress: &'a ProgressTracker,
    events: Option<&'a EventStore>,
    gate: tokio::sync::Mutex<()>,
}

impl TaskReporter<'_> {
    fn step_uid(patient_id: &str, step: Step) -> String {
        format!("{}:{}", patient_id, step)
    }

    async fn task_started(&self, patients: usize) -> Result<()> {
        let _gate = self.gate.lock().await;
        let task = self.registry.mark_running(&self.task_uid)?;
        self.progress.publish(&task, Some("running".to_string()));

        self.append(Event::new(
            &self.task_uid,
            EventType::TaskStarted,
            format!("{}:start", self.task_uid),
            format!("Task started for {} patient(s), {} step(s)", patients, task.total_steps),
            StepStatus::Running,
        ))
        .await;
        Ok(())
    }

    async fn step_started(&self, patient_id: &str, step: Step, inputs: &[PathBuf]) {
        let _gate = self.gate.lock().await;
        let step_uid = Self::step_uid(patient_id, step);

        match self.registry.begin_step(&self.task_uid, &step_uid) {
            Ok(task) => {
                self.progress.publish(&task, Some(format!("{} running", step_uid)));
            }
            Err(e) => error!(task_uid = %self.task_uid, error = %e, "Failed to record step start"),
        }

        self.append(
            Event::new(
                &self.task_uid,
                EventType::StepStarted,
                generate_idempotency_key(&self.task_uid, patient_id, step, inputs),
                format!("Step '{}' started", step_uid),
                StepStatus::Running,
            )
            .for_step(patient_id, step),
        )
        .await;
    }

    async fn step_completed(&self, result: &StepResult, inputs: &[PathBuf]) {
        let _gate = self.gate.lock().await;
        let step_uid = Self::step_uid(&result.patient_id, result.step);

        match self.registry.record_step_completed(&self.task_uid) {
            Ok(task) => {
                let verb = if result.skipped { "skipped" } else { "completed" };
                self.progress.publish(&task, Some(format!("{} {}", step_uid, verb)));
            }
            Err(e) => error!(task_uid = %self.task_uid, error = %e, "Failed to record step completion"),
        }

        let (event_type, summary) = if result.skipped {
            (EventType::StepSkipped, format!("Step '{}' skipped: output present", step_uid))
        } else {
            (
                EventType::StepSucceeded,
                format!("Step '{}' produced {} artifact(s)", step_uid, result.output_paths.len()),
            )
        };
        let mut event = Event::new(
            &self.task_uid,
            event_type,
            generate_idempotency_key(&self.task_uid, &result.patient_id, result.step, inputs),
            summary,
            StepStatus::Succeeded,
        )
        .for_step(&result.patient_id, result.step);
        if let Some(ms) = result.duration_ms {
            event = event.with_duration(ms);
        }
        self.append(event).await;
    }

    async fn step_failed(&self, result: &StepResult) {
        let _gate = self.gate.lock().await;
        let step_uid = Self::step_uid(&result.patient_id, result.step);

        match self.registry.record_step_failed(&self.task_uid, &step_uid) {
            Ok(task) => {
                self.progress.publish(&task, Some(format!("{} failed", step_uid)));
            }
            Err(e) => error!(task_uid = %self.task_uid, error = %e, "Failed to record step failure"),
        }

        let mut event = Event::new(
            &self.task_uid,
            EventType::StepFailed,
            format!("{}:{}:failed", self.task_uid, step_uid),
            format!("Step '{}' failed", step_uid),
            StepStatus::Failed,
        )
        .for_step(&result.patient_id, result.step);
        if let (Some(kind), Some(message)) = (result.error_kind, result.error_message.clone()) {
            event = event.with_error(kind, message);
        }
        self.append(event).await;
    }

    async fn task_finished(&self, status: TaskStatus, runs: &BTreeMap<String, PipelineRun>) -> Result<()> {
        let _gate = self.gate.lock().await;
        let task = self.registry.finish(&self.task_uid, status)?;

        let failed = runs.values().filter(|r| r.outcome == RunOutcome::Failed).count();
        let message = format!(
            "{}: {}/{} step(s), {} of {} patient(s) failed",
            status,
            task.last_completed_step,
            task.total_steps,
            failed,
            runs.len()
        );
        self.progress.publish(&task, Some(message.clone()));

        let (event_type, step_status) = match status {
            TaskStatus::Succeeded => (EventType::TaskSucceeded, StepStatus::Succeeded),
            TaskStatus::Cancelled => (EventType::TaskCancelled, StepStatus::Failed),
            _ => (EventType::TaskFailed, StepStatus::Failed),
        };
        self.append(Event::new(
            &self.task_uid,
            event_type,
            format!("{}:complete", self.task_uid),
            message,
            step_status,
        ))
        .await;

        info!(task_uid = %self.task_uid, %status, "Task finished");
        Ok(())
    }

    // Audit failures are logged, never allowed to fail a patient's run
    async fn append(&self, event: Event) {
        if let Some(events) = self.events {
            if let Err(e) = events.append(&event).await {
                warn!(task_uid = %self.task_uid, error = %e, "Failed to append audit event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_plan_starts_at_first_missing_output() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        touch(&temp.path().join("0_DICOM/P001/C0/a.dcm"));
        touch(&temp.path().join("1_NII/P001/C0.nii.gz"));

        let plan = plan_steps(&store, "P001", None, false).unwrap();
        assert_eq!(plan.first(), Some(&Step::Registration));
        assert_eq!(plan.len(), 5);

        let forced = plan_steps(&store, "P001", None, true).unwrap();
        assert_eq!(forced, Step::ALL.to_vec());
    }

    #[test]
    fn test_plan_explicit_is_canonical() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let plan = plan_steps(&store, "P001", Some(&[Step::Resample, Step::DicomToNii]), false).unwrap();
        assert_eq!(plan, vec![Step::DicomToNii, Step::Resample]);
    }

    #[test]
    fn test_plan_empty_when_complete() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        for step in Step::ALL {
            let name = if step == Step::NnunetSegmentation { "x_seg.nii.gz" } else { "x.nii.gz" };
            touch(&store.patient_dir(step.output_stage(), "P001").join(name));
        }
        assert!(plan_steps(&store, "P001", None, false).unwrap().is_empty());
    }

    #[test]
    fn test_request_serializes_for_ledger() {
        let request = ProcessRequest::new("/data").patient("P001").steps(vec![Step::DicomToNii]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"dicom_to_nii\""));
        let parsed: ProcessRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }
}
