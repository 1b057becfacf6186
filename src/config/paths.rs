//! Canonical on-disk locations for medpipe engine state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `$MEDPIPE_HOME/tasks.db` | Task registry (SQLite) |
//! | `$MEDPIPE_HOME/tasks/<task_uid>/events.jsonl` | Per-task audit log |
//! | `<data_root>/.locks/<patient_id>.lock` | Cross-process patient lock |

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::store::locks::LOCK_DIR;

/// Get the medpipe home directory (~/.medpipe)
pub fn medpipe_home() -> Result<PathBuf> {
    crate::config::medpipe_home()
}

/// Task registry database ($MEDPIPE_HOME/tasks.db)
pub fn tasks_db() -> Result<PathBuf> {
    Ok(medpipe_home()?.join("tasks.db"))
}

/// Directory of per-task audit logs ($MEDPIPE_HOME/tasks)
pub fn task_logs_dir() -> Result<PathBuf> {
    Ok(medpipe_home()?.join("tasks"))
}

/// Patient lock directory inside a data root
pub fn lock_dir(data_root: &Path) -> PathBuf {
    data_root.join(LOCK_DIR)
}
