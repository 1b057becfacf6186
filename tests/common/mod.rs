//! Shared fixtures for integration tests: tempdir data roots and
//! call-counting fake executors.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use medpipe::adapters::{Executor, ExecutorTable, StepContext};
use medpipe::core::{EventStore, Orchestrator, ProgressTracker, TaskRegistry};
use medpipe::domain::{Step, StepError};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Executor that writes `C0.nii.gz` (or the `C0_seg.nii.gz` mask for
/// segmentation) into the output directory and counts calls
#[derive(Default)]
pub struct FakeExecutor {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    /// Patients this executor fails for ("*" fails everyone)
    fail_for: Vec<String>,
    panic: bool,
    skip_output: bool,
    delay: Duration,
    /// (started, release): signal entry, then wait to be released
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, patient_id: &str) -> Self {
        self.fail_for.push(patient_id.to_string());
        self
    }

    pub fn failing(self) -> Self {
        self.failing_for("*")
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn without_output(mut self) -> Self {
        self.skip_output = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn gated(mut self, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some((started, release));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        "fake"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Vec<PathBuf>, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panic {
            panic!("fake executor crashed");
        }
        if self.fail_for.iter().any(|p| p == "*" || *p == ctx.patient_id) {
            return Err(ctx.processing_error("fake failure"));
        }
        if self.skip_output {
            return Ok(Vec::new());
        }

        let output = ctx.output_dir.join(output_name(ctx.step));
        std::fs::write(&output, b"nifti").map_err(|e| ctx.io_error(&output, &e))?;
        Ok(vec![output])
    }

    async fn health_check(&self, _step: Step) -> Result<(), StepError> {
        Ok(())
    }
}

/// A data root, an orchestrator over it, and one fake per step
pub struct Harness {
    pub temp: TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub fakes: HashMap<Step, Arc<FakeExecutor>>,
}

impl Harness {
    /// Every step succeeds
    pub fn new() -> Self {
        Self::build(|_| Some(FakeExecutor::new()))
    }

    /// `make` decides each step's executor; `None` leaves the step unconfigured
    pub fn build<F>(make: F) -> Self
    where
        F: Fn(Step) -> Option<FakeExecutor>,
    {
        Self::build_with_workers(4, make)
    }

    pub fn build_with_workers<F>(workers: usize, make: F) -> Self
    where
        F: Fn(Step) -> Option<FakeExecutor>,
    {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("data")).unwrap();

        let mut table = ExecutorTable::new();
        let mut fakes = HashMap::new();
        for step in Step::ALL {
            if let Some(fake) = make(step) {
                let fake = Arc::new(fake);
                table.insert(step, fake.clone());
                fakes.insert(step, fake);
            }
        }

        let registry = Arc::new(TaskRegistry::open_in_memory().unwrap());
        let events = Arc::new(EventStore::new(temp.path().join("tasks")));
        let orchestrator = Orchestrator::new(table, registry, Arc::new(ProgressTracker::new()))
            .with_event_store(events)
            .with_workers(workers);

        Self {
            temp,
            orchestrator: Arc::new(orchestrator),
            fakes,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().join("data")
    }

    /// `0_DICOM/<patient>/C0/IM0001.dcm`
    pub fn add_dicom(&self, patient_id: &str) {
        touch(&self.root().join("0_DICOM").join(patient_id).join("C0").join("IM0001.dcm"));
    }

    pub fn fake(&self, step: Step) -> &FakeExecutor {
        &self.fakes[&step]
    }

    pub fn total_calls(&self) -> usize {
        self.fakes.values().map(|f| f.calls()).sum()
    }
}

/// File name a well-behaved executor writes for `step`
pub fn output_name(step: Step) -> &'static str {
    match step {
        Step::NnunetSegmentation => "C0_seg.nii.gz",
        _ => "C0.nii.gz",
    }
}

pub fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"x").unwrap();
}
