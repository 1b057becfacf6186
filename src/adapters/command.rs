//! Subprocess executor for external processing tools.
//!
//! Runs a configured program (e.g. `dcm2niix`, an ANTs script, `nnUNetv2_predict`)
//! with placeholders in its arguments filled from the step context, then collects
//! whatever artifacts the program left in the output folder.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::{Step, StepError};
use crate::store::ArtifactStore;

use super::{Executor, StepContext};

/// How to invoke one external tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,

    /// Arguments; `{patient_id}`, `{data_root}`, `{output_dir}`, `{input_dir}` and
    /// `{input_dir_N}` are substituted per run
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Kill the program after this many seconds (default: 3600)
    pub timeout_seconds: Option<u64>,
}

fn default_timeout() -> u64 {
    3600
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_seconds: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or_else(default_timeout))
    }
}

/// Executor that shells out to a configured program
pub struct CommandExecutor {
    spec: CommandSpec,
}

impl CommandExecutor {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Arguments with placeholders filled from `ctx`
    fn render_args(&self, ctx: &StepContext) -> Vec<String> {
        self.spec.args.iter().map(|arg| render(arg, ctx)).collect()
    }

    fn spawn_error(&self, ctx: &StepContext, error: &io::Error) -> StepError {
        if error.kind() == io::ErrorKind::NotFound {
            ctx.configuration_error(format!("program '{}' not found", self.spec.program))
        } else {
            ctx.io_error(Path::new(&self.spec.program), error)
        }
    }
}

fn render(arg: &str, ctx: &StepContext) -> String {
    let mut out = arg
        .replace("{patient_id}", &ctx.patient_id)
        .replace("{data_root}", &ctx.data_root.to_string_lossy())
        .replace("{output_dir}", &ctx.output_dir.to_string_lossy());

    for (i, dir) in ctx.input_dirs.iter().enumerate() {
        out = out.replace(&format!("{{input_dir_{}}}", i), &dir.to_string_lossy());
    }
    if let Some(first) = ctx.input_dirs.first() {
        out = out.replace("{input_dir}", &first.to_string_lossy());
    }
    out
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.spec.program
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Vec<PathBuf>, StepError> {
        let args = self.render_args(ctx);
        let step_timeout = self.spec.timeout();
        debug!(program = %self.spec.program, ?args, "Spawning step executor");

        let child = Command::new(&self.spec.program)
            .args(&args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(ctx, &e))?;

        // Wait for completion with timeout; dropping the child kills it
        let output = timeout(step_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ctx.processing_error(format!(
                    "'{}' timed out after {:?}",
                    self.spec.program, step_timeout
                ))
            })?
            .map_err(|e| ctx.io_error(Path::new(&self.spec.program), &e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ctx.processing_error(format!(
                "'{}' failed with exit code {}: {}",
                self.spec.program,
                exit_code,
                stderr.trim()
            )));
        }

        let store = ArtifactStore::new(&ctx.data_root);
        let produced = store
            .output_artifacts(ctx.step, &ctx.patient_id)
            .map_err(|e| ctx.io_error(&ctx.output_dir, &e))?;

        if produced.is_empty() {
            return Err(ctx.processing_error(format!(
                "'{}' exited successfully but produced no artifacts in {}",
                self.spec.program,
                ctx.output_dir.display()
            )));
        }

        Ok(produced)
    }

    async fn health_check(&self, step: Step) -> Result<(), StepError> {
        // Exit status is ignored: many tools return non-zero for --version
        Command::new(&self.spec.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|_| ())
            .map_err(|e| StepError::Configuration {
                step,
                message: format!("program '{}' is not runnable: {}", self.spec.program, e),
            })
    }
}
