//! Command-line interface for medpipe.
//!
//! Provides commands for running the preprocessing pipeline over one patient
//! or a whole data root, inspecting filesystem-derived status, and managing
//! the task ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::ExecutorTable;
use crate::config::{self, paths, ResolvedConfig};
use crate::core::{
    poll_until_done, EventStore, Orchestrator, PollOutcome, ProcessRequest, ProgressTracker,
    StatusReport, TaskRegistry,
};
use crate::domain::{BatchResult, PatientStatus, RunOutcome, Step, StepResult, Task, TaskStatus};

/// medpipe - Medical image preprocessing pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "medpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline for one patient or every patient
    Run {
        /// Patient folder name (all patients under 0_DICOM if omitted)
        #[arg(short, long)]
        patient: Option<String>,

        /// Steps to run, comma-separated (remaining steps if omitted)
        #[arg(short, long, value_delimiter = ',')]
        steps: Vec<Step>,

        /// Re-run steps whose output already exists
        #[arg(short, long)]
        force: bool,

        /// Data root (defaults to MEDPIPE_DATA_ROOT or the config file)
        #[arg(short, long)]
        data_root: Option<PathBuf>,

        /// Stop every patient once one patient fails
        #[arg(long)]
        stop_on_failure: bool,

        /// User recorded on the task
        #[arg(short, long)]
        user: Option<String>,

        /// Print progress while the run executes
        #[arg(short, long)]
        watch: bool,
    },

    /// Run a single step for one patient
    Step {
        /// Patient folder name
        patient: String,

        /// Step name (e.g. dicom_to_nii)
        step: Step,

        /// Re-run even if output exists
        #[arg(short, long)]
        force: bool,

        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// Show which steps are complete, inferred from the data root
    Status {
        /// Patient folder name (all patients if omitted)
        patient: Option<String>,

        #[arg(short, long)]
        data_root: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List pipeline steps in execution order
    Steps,

    /// Show stage directories and the patients in each
    Tree {
        #[arg(short, long)]
        data_root: Option<PathBuf>,
    },

    /// List recent tasks
    Tasks {
        /// Only tasks in this state
        #[arg(long)]
        status: Option<TaskStatus>,

        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show one task
    Task {
        task_uid: String,

        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Count tasks by state
    TaskStats,

    /// Delete a task and its audit log
    TaskDelete { task_uid: String },

    /// Check that every step has a working executor
    Check,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                patient,
                steps,
                force,
                data_root,
                stop_on_failure,
                user,
                watch,
            } => {
                let mut request = ProcessRequest::new(resolve_data_root(data_root)?)
                    .force(force)
                    .stop_on_patient_failure(stop_on_failure);
                request.patient_id = patient;
                request.user_uid = user;
                if !steps.is_empty() {
                    request.steps = Some(steps);
                }
                run(request, watch).await
            }
            Commands::Step {
                patient,
                step,
                force,
                data_root,
            } => run_step(&resolve_data_root(data_root)?, &patient, step, force).await,
            Commands::Status {
                patient,
                data_root,
                json,
            } => show_status(&resolve_data_root(data_root)?, patient.as_deref(), json),
            Commands::Steps => list_steps(),
            Commands::Tree { data_root } => show_tree(&resolve_data_root(data_root)?),
            Commands::Tasks {
                status,
                limit,
                offset,
            } => list_tasks(status, limit, offset),
            Commands::Task { task_uid, json } => show_task(&task_uid, json),
            Commands::TaskStats => show_task_stats(),
            Commands::TaskDelete { task_uid } => delete_task(&task_uid).await,
            Commands::Check => check_executors().await,
            Commands::Config => show_config(),
        }
    }
}

/// Data root from the command line, else from configuration
fn resolve_data_root(arg: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(root) = arg {
        return Ok(root);
    }
    config::config()?
        .data_root
        .clone()
        .context("No data root given. Use --data-root, MEDPIPE_DATA_ROOT, or paths.data_root in .medpipe/config.yaml")
}

fn open_registry() -> Result<TaskRegistry> {
    let db = paths::tasks_db()?;
    TaskRegistry::open(&db).with_context(|| format!("Failed to open task registry: {}", db.display()))
}

/// Wire an orchestrator from configuration
fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let registry = Arc::new(open_registry()?);
    let events = Arc::new(EventStore::from_config()?);

    Ok(Orchestrator::new(
        ExecutorTable::from_commands(&cfg.executors),
        registry,
        Arc::new(ProgressTracker::new()),
    )
    .with_event_store(events)
    .with_workers(cfg.workers))
}

/// Run the pipeline and print a per-patient summary
async fn run(request: ProcessRequest, watch: bool) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = Arc::new(build_orchestrator(cfg)?);

    let (task_uid, handle) = orchestrator.spawn(request)?;
    eprintln!("[Task {} started]", task_uid);

    if watch {
        let outcome = poll_until_done(orchestrator.progress(), &task_uid, cfg.poll_interval, |record| {
            eprintln!(
                "  {:>5.1}%  {:<10} {}",
                record.progress,
                record.status,
                record.message.as_deref().unwrap_or("")
            );
        })
        .await;
        if outcome == PollOutcome::Cleared {
            eprintln!("  (progress record cleared)");
        }
    }

    let batch = handle.await.context("Run task aborted")??;
    print_batch(&batch);

    if !batch.is_all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_batch(batch: &BatchResult) {
    if batch.runs.is_empty() {
        println!("No patients found");
    }

    println!("{:<20} {:<10} {:<22} {}", "PATIENT", "OUTCOME", "LAST STEP", "DETAIL");
    println!("{}", "-".repeat(80));

    for (patient_id, run) in &batch.runs {
        let outcome = match run.outcome {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        let last = run
            .last_succeeded_step()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = run
            .failed_result()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.step,
                    r.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .unwrap_or_default();
        println!("{:<20} {:<10} {:<22} {}", patient_id, outcome, last, detail);
    }

    eprintln!(
        "\n[Task {}: {} succeeded, {} failed, {} cancelled]",
        batch.task_uid,
        batch.succeeded().len(),
        batch.failed().len(),
        batch.cancelled().len()
    );
}

async fn run_step(data_root: &Path, patient_id: &str, step: Step, force: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config::config()?)?;
    let result = orchestrator
        .process_single_step(data_root, patient_id, step, force)
        .await?;
    print_step_result(&result);

    if result.is_failed() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_step_result(result: &StepResult) {
    println!("Patient: {}", result.patient_id);
    println!("Step:    {}", result.step);
    if result.skipped {
        println!("Status:  {} (skipped, output present)", result.status);
    } else {
        println!("Status:  {}", result.status);
    }
    if let Some(ms) = result.duration_ms {
        println!("Time:    {} ms", ms);
    }
    if let (Some(kind), Some(message)) = (result.error_kind, &result.error_message) {
        println!("Error:   {}: {}", kind, message);
    }
    for path in &result.output_paths {
        println!("  -> {}", path.display());
    }
}

fn show_status(data_root: &Path, patient_id: Option<&str>, json: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config::config()?)?;
    let report = orchestrator.get_status(data_root, patient_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let patients: Vec<PatientStatus> = match report {
        StatusReport::Patient(status) => vec![status],
        StatusReport::All(all) => all.into_values().collect(),
    };
    if patients.is_empty() {
        println!("No patients found under {}", data_root.display());
        return Ok(());
    }

    println!("{:<20} {:<6} {:<22} {:<22}", "PATIENT", "RAW", "LAST COMPLETED", "NEXT");
    println!("{}", "-".repeat(72));
    for status in patients {
        println!(
            "{:<20} {:<6} {:<22} {:<22}",
            status.patient_id,
            if status.raw_input_present { "yes" } else { "no" },
            status.last_completed_step.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            status.next_step.map(|s| s.to_string()).unwrap_or_else(|| "(complete)".into()),
        );
    }
    Ok(())
}

fn list_steps() -> Result<()> {
    println!("{:<3} {:<22} {:<16} {:<8} {}", "#", "STEP", "INPUTS", "OUTPUT", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for step in Step::ALL {
        let inputs = step
            .inputs()
            .iter()
            .map(|kind| kind.label())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<3} {:<22} {:<16} {:<8} {}",
            step.number(),
            step,
            inputs,
            step.output().label(),
            step.description()
        );
    }
    Ok(())
}

fn show_tree(data_root: &Path) -> Result<()> {
    let orchestrator = build_orchestrator(config::config()?)?;
    let tree = orchestrator.get_data_structure(data_root)?;

    println!("{}", tree.root.display());
    for stage in &tree.stages {
        if !stage.exists {
            println!("  {}/ (missing)", stage.dir_name);
            continue;
        }
        println!("  {}/ ({} patients)", stage.dir_name, stage.patients.len());
        for patient in &stage.patients {
            println!("    {}", patient);
        }
    }
    Ok(())
}

fn list_tasks(status: Option<TaskStatus>, limit: usize, offset: usize) -> Result<()> {
    let registry = open_registry()?;
    let tasks = registry.list_tasks(status, limit, offset)?;

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<9} {:<20}", "TASK ID", "STATUS", "PROGRESS", "CREATED");
    println!("{}", "-".repeat(80));
    for task in tasks {
        println!(
            "{:<38} {:<10} {:>7.1}%  {:<20}",
            task.task_uid,
            task.status,
            task.progress(),
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn show_task(task_uid: &str, json: bool) -> Result<()> {
    let registry = open_registry()?;
    let task = registry
        .get_task(task_uid)?
        .with_context(|| format!("Task not found: {}", task_uid))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        print_task(&task);
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("Task ID:   {}", task.task_uid);
    println!("Status:    {}", task.status);
    println!(
        "Progress:  {:.1}% ({}/{} steps)",
        task.progress(),
        task.last_completed_step,
        task.total_steps
    );
    if let Some(ref step_uid) = task.current_step_uid {
        println!("Current:   #{} {}", task.current_step_number, step_uid);
    }
    if let Some(ref step_uid) = task.failed_step_uid {
        println!(
            "Failed at: #{} {}",
            task.failed_step_number.unwrap_or_default(),
            step_uid
        );
    }
    if let Some(ref user) = task.user_uid {
        println!("User:      {}", user);
    }
    println!("Created:   {}", task.created_at);
    println!("Updated:   {}", task.updated_at);
    println!("Request:   {}", task.request_json);
}

fn show_task_stats() -> Result<()> {
    let stats = open_registry()?.get_statistics()?;

    println!("Total:     {}", stats.total);
    println!("Queued:    {}", stats.queued);
    println!("Running:   {}", stats.running);
    println!("Succeeded: {}", stats.succeeded);
    println!("Failed:    {}", stats.failed);
    println!("Cancelled: {}", stats.cancelled);
    Ok(())
}

async fn delete_task(task_uid: &str) -> Result<()> {
    let registry = open_registry()?;
    if !registry.delete_task(task_uid)? {
        anyhow::bail!("Task not found: {}", task_uid);
    }
    EventStore::from_config()?.delete(task_uid).await?;

    eprintln!("[Task {} deleted]", task_uid);
    Ok(())
}

async fn check_executors() -> Result<()> {
    let table = ExecutorTable::from_commands(&config::config()?.executors);
    let report = table.health_check().await;

    let mut healthy = true;
    for (step, result) in report {
        match result {
            Ok(()) => println!("  ok    {}", step),
            Err(e) => {
                healthy = false;
                println!("  FAIL  {}: {}", step, e);
            }
        }
    }

    if !healthy {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("medpipe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Task registry:       {}", paths::tasks_db()?.display());
    println!("  Task logs:           {}", paths::task_logs_dir()?.display());
    println!(
        "  Data root:           {}",
        cfg.data_root
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not set)".to_string())
    );
    println!();
    println!("Orchestrator:");
    println!("  Workers:        {}", cfg.workers);
    println!("  Poll interval:  {} ms", cfg.poll_interval.as_millis());
    println!();
    println!("Executors:");
    for step in Step::ALL {
        match cfg.executors.get(&step) {
            Some(spec) => println!("  {:<22} {} {}", step, spec.program, spec.args.join(" ")),
            None => println!("  {:<22} (not configured)", step),
        }
    }

    Ok(())
}
