//! Configuration for medpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MEDPIPE_HOME, MEDPIPE_DATA_ROOT, MEDPIPE_WORKERS)
//! 2. Config file (.medpipe/config.yaml)
//! 3. Defaults (~/.medpipe, 4 workers, 1000 ms poll interval)
//!
//! Config file discovery:
//! - Searches current directory and parents for .medpipe/config.yaml
//! - `paths.home` is relative to the .medpipe/ directory, `paths.data_root`
//!   to the project root (the parent of .medpipe/)

pub mod paths;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::CommandSpec;
use crate::core::{DEFAULT_POLL_INTERVAL, DEFAULT_WORKERS};
use crate::domain::Step;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Subprocess command per step
    #[serde(default)]
    pub executors: HashMap<Step, CommandSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to config file)
    pub home: Option<String>,
    /// Default data root (relative to project root)
    pub data_root: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    pub workers: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state: task database and task logs
    pub home: PathBuf,
    /// Data root used when the CLI is not given one
    pub data_root: Option<PathBuf>,
    /// Patients processed in parallel
    pub workers: usize,
    /// Progress polling interval for `run --watch`
    pub poll_interval: Duration,
    pub executors: HashMap<Step, CommandSpec>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".medpipe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge file, environment and defaults. `env` is injected so tests do not
/// depend on the process environment.
fn resolve<F>(config_file: Option<PathBuf>, default_home: PathBuf, env: F) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    // .medpipe/ and the project root around it
    let medpipe_dir = config_file.as_deref().and_then(Path::parent);
    let project_dir = medpipe_dir.and_then(Path::parent);

    let home = if let Some(env_home) = env("MEDPIPE_HOME") {
        PathBuf::from(env_home)
    } else {
        match (medpipe_dir, file.as_ref().and_then(|f| f.paths.home.as_deref())) {
            (Some(base), Some(home)) => resolve_path(base, home),
            _ => default_home,
        }
    };

    let data_root = if let Some(env_root) = env("MEDPIPE_DATA_ROOT") {
        Some(PathBuf::from(env_root))
    } else {
        match (project_dir, file.as_ref().and_then(|f| f.paths.data_root.as_deref())) {
            (Some(base), Some(root)) => Some(resolve_path(base, root)),
            _ => None,
        }
    };

    let workers = match env("MEDPIPE_WORKERS") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("MEDPIPE_WORKERS is not a number: {}", value))?,
        None => file
            .as_ref()
            .and_then(|f| f.orchestrator.workers)
            .unwrap_or(DEFAULT_WORKERS),
    };
    if workers == 0 {
        anyhow::bail!("workers must be at least 1");
    }

    let poll_interval = file
        .as_ref()
        .and_then(|f| f.orchestrator.poll_interval_ms)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL);

    let executors = file.map(|f| f.executors).unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        data_root,
        workers,
        poll_interval,
        executors,
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".medpipe");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(find_config_file(&cwd), default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the medpipe home directory (engine state).
pub fn medpipe_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
