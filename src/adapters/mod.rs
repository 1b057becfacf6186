//! Step executor interfaces.
//!
//! The image-processing algorithms themselves live outside this crate. Each
//! `Step` maps to one `Executor` in a fixed `ExecutorTable`; the orchestrator
//! only hands an executor its input paths and collects the output paths.

pub mod command;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Step, StepError};

// Re-export the subprocess executor
pub use command::{CommandExecutor, CommandSpec};

/// Everything an executor needs to run one step for one patient
#[derive(Debug, Clone)]
pub struct StepContext {
    pub patient_id: String,
    pub step: Step,
    pub data_root: PathBuf,

    /// Patient folder of each input kind, in declaration order (may repeat)
    pub input_dirs: Vec<PathBuf>,

    /// Input artifact files found in `input_dirs`
    pub input_paths: Vec<PathBuf>,

    /// Patient folder of the output stage (created before `execute`)
    pub output_dir: PathBuf,
}

impl StepContext {
    pub fn processing_error(&self, message: impl Into<String>) -> StepError {
        StepError::Processing {
            patient_id: self.patient_id.clone(),
            step: self.step,
            message: message.into(),
        }
    }

    pub fn io_error(&self, path: &Path, error: &std::io::Error) -> StepError {
        StepError::Io {
            patient_id: self.patient_id.clone(),
            step: self.step,
            path: path.to_path_buf(),
            message: error.to_string(),
        }
    }

    pub fn configuration_error(&self, message: impl Into<String>) -> StepError {
        StepError::Configuration {
            step: self.step,
            message: message.into(),
        }
    }
}

/// One processing step implementation
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Produce the output artifacts for `ctx`, returning their paths
    async fn execute(&self, ctx: &StepContext) -> Result<Vec<PathBuf>, StepError>;

    /// Verify external tooling and model assets are available
    async fn health_check(&self, step: Step) -> Result<(), StepError>;
}

/// Fixed table from step to executor
#[derive(Clone, Default)]
pub struct ExecutorTable {
    executors: HashMap<Step, Arc<dyn Executor>>,
}

impl ExecutorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with(mut self, step: Step, executor: Arc<dyn Executor>) -> Self {
        self.insert(step, executor);
        self
    }

    pub fn insert(&mut self, step: Step, executor: Arc<dyn Executor>) {
        self.executors.insert(step, executor);
    }

    /// Build subprocess executors from configured command specs
    pub fn from_commands(commands: &HashMap<Step, CommandSpec>) -> Self {
        let mut table = Self::new();
        for (step, spec) in commands {
            table.insert(*step, Arc::new(CommandExecutor::new(spec.clone())));
        }
        table
    }

    /// Executor for `step`; an unconfigured step is a `ConfigurationError`
    pub fn get(&self, step: Step) -> Result<Arc<dyn Executor>, StepError> {
        self.executors
            .get(&step)
            .cloned()
            .ok_or_else(|| StepError::Configuration {
                step,
                message: "no executor configured for this step".to_string(),
            })
    }

    /// Configured steps in canonical order
    pub fn steps(&self) -> Vec<Step> {
        Step::ALL
            .into_iter()
            .filter(|s| self.executors.contains_key(s))
            .collect()
    }

    /// Health of every step, in canonical order
    pub async fn health_check(&self) -> Vec<(Step, Result<(), StepError>)> {
        let mut report = Vec::with_capacity(Step::ALL.len());
        for step in Step::ALL {
            let result = match self.get(step) {
                Ok(executor) => executor.health_check(step).await,
                Err(e) => Err(e),
            };
            report.push((step, result));
        }
        report
    }
}

impl std::fmt::Debug for ExecutorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(
                self.steps()
                    .into_iter()
                    .map(|s| (s, self.executors[&s].name().to_string())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    struct Noop;

    #[async_trait]
    impl Executor for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _ctx: &StepContext) -> Result<Vec<PathBuf>, StepError> {
            Ok(Vec::new())
        }

        async fn health_check(&self, _step: Step) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_executor_is_configuration_error() {
        let table = ExecutorTable::new().with(Step::DicomToNii, Arc::new(Noop));

        assert!(table.get(Step::DicomToNii).is_ok());
        let err = table.get(Step::Registration).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ConfigurationError);
        assert_eq!(table.steps(), vec![Step::DicomToNii]);
    }

    #[tokio::test]
    async fn test_health_report_covers_all_steps() {
        let table = ExecutorTable::new().with(Step::Resample, Arc::new(Noop));
        let report = table.health_check().await;

        assert_eq!(report.len(), 6);
        assert!(report[4].1.is_ok());
        assert!(report[0].1.is_err());
    }
}
