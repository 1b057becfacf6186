//! Durable task ledger backed by SQLite.
//!
//! One row per orchestration invocation. All writes go through a single
//! connection behind a mutex, so updates to a task are serialized and each
//! read-modify-write runs in its own transaction.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Task, TaskStatistics, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_uid            TEXT PRIMARY KEY,
    total_steps         INTEGER NOT NULL,
    status              TEXT NOT NULL,
    current_step_number INTEGER NOT NULL DEFAULT 0,
    current_step_uid    TEXT,
    last_completed_step INTEGER NOT NULL DEFAULT 0,
    failed_step_number  INTEGER,
    failed_step_uid     TEXT,
    user_uid            TEXT,
    request_json        TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
"#;

const COLUMNS: &str = "task_uid, total_steps, status, current_step_number, current_step_uid, \
     last_completed_step, failed_step_number, failed_step_uid, user_uid, request_json, \
     created_at, updated_at";

/// Errors that can occur with the task registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition for task {task_uid}: {from} → {to}")]
    InvalidTransition {
        task_uid: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Counter {field} of task {task_uid} cannot move from {from} to {to}")]
    CounterRegression {
        task_uid: String,
        field: &'static str,
        from: u32,
        to: u32,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Partial update of a task row; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub current_step_number: Option<u32>,
    pub current_step_uid: Option<String>,
    pub last_completed_step: Option<u32>,
    pub failed_step_number: Option<u32>,
    pub failed_step_uid: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// SQLite-backed task registry
pub struct TaskRegistry {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").finish_non_exhaustive()
    }
}

impl TaskRegistry {
    /// Open (or create) the registry database at `path`
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            // A directory that cannot be created surfaces as an open failure below
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    /// Registry that lives only as long as the process
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new queued task and return its uid
    pub fn create_task(
        &self,
        total_steps: u32,
        user_uid: Option<&str>,
        request_json: &str,
    ) -> Result<String, RegistryError> {
        let task_uid = Uuid::new_v4().to_string();
        let now = timestamp(Utc::now());

        self.conn().execute(
            &format!("INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, 0, NULL, 0, NULL, NULL, ?4, ?5, ?6, ?6)", COLUMNS),
            params![task_uid, total_steps, TaskStatus::Queued.as_str(), user_uid, request_json, now],
        )?;

        Ok(task_uid)
    }

    /// Apply a partial update, enforcing the state machine and monotonic counters
    pub fn update_task(&self, task_uid: &str, update: TaskUpdate) -> Result<Task, RegistryError> {
        self.modify(task_uid, |task| {
            if let Some(status) = update.status {
                if !task.status.can_transition_to(status) {
                    return Err(RegistryError::InvalidTransition {
                        task_uid: task.task_uid.clone(),
                        from: task.status,
                        to: status,
                    });
                }
                task.status = status;
            }
            if let Some(number) = update.current_step_number {
                check_monotonic(task, "current_step_number", task.current_step_number, number)?;
                task.current_step_number = number;
            }
            if let Some(done) = update.last_completed_step {
                check_monotonic(task, "last_completed_step", task.last_completed_step, done)?;
                if done > task.total_steps {
                    return Err(RegistryError::CounterRegression {
                        task_uid: task.task_uid.clone(),
                        field: "last_completed_step",
                        from: task.last_completed_step,
                        to: done,
                    });
                }
                task.last_completed_step = done;
            }
            if update.current_step_uid.is_some() {
                task.current_step_uid = update.current_step_uid;
            }
            if update.failed_step_number.is_some() {
                task.failed_step_number = update.failed_step_number;
            }
            if update.failed_step_uid.is_some() {
                task.failed_step_uid = update.failed_step_uid;
            }
            Ok(())
        })
    }

    /// Move a queued task to running
    pub fn mark_running(&self, task_uid: &str) -> Result<Task, RegistryError> {
        self.update_task(task_uid, TaskUpdate::status(TaskStatus::Running))
    }

    /// Record that the next step (`step_uid`) has started
    pub fn begin_step(&self, task_uid: &str, step_uid: &str) -> Result<Task, RegistryError> {
        self.modify(task_uid, |task| {
            let number = (task.last_completed_step + 1).min(task.total_steps.max(1));
            task.current_step_number = task.current_step_number.max(number);
            task.current_step_uid = Some(step_uid.to_string());
            Ok(())
        })
    }

    /// Advance the completed-step counter by exactly one
    pub fn record_step_completed(&self, task_uid: &str) -> Result<Task, RegistryError> {
        self.modify(task_uid, |task| {
            if task.last_completed_step >= task.total_steps {
                return Err(RegistryError::CounterRegression {
                    task_uid: task.task_uid.clone(),
                    field: "last_completed_step",
                    from: task.last_completed_step,
                    to: task.last_completed_step + 1,
                });
            }
            task.last_completed_step += 1;
            Ok(())
        })
    }

    /// Record the failing step; only the first failure of a task is kept
    pub fn record_step_failed(&self, task_uid: &str, step_uid: &str) -> Result<Task, RegistryError> {
        self.modify(task_uid, |task| {
            if task.failed_step_uid.is_none() {
                task.failed_step_number = Some(task.last_completed_step + 1);
                task.failed_step_uid = Some(step_uid.to_string());
            }
            Ok(())
        })
    }

    /// Move a task to its terminal status
    pub fn finish(&self, task_uid: &str, status: TaskStatus) -> Result<Task, RegistryError> {
        debug_assert!(status.is_terminal());
        self.update_task(task_uid, TaskUpdate::status(status))
    }

    pub fn get_task(&self, task_uid: &str) -> Result<Option<Task>, RegistryError> {
        let conn = self.conn();
        Ok(load(&conn, task_uid)?)
    }

    /// Tasks newest first, optionally filtered by status
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, RegistryError> {
        let conn = self.conn();
        let limit = limit as i64;
        let offset = offset as i64;

        let tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit, offset], read_task)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1 OFFSET ?2",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit, offset], read_task)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(tasks)
    }

    pub fn get_statistics(&self) -> Result<TaskStatistics, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = TaskStatistics::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as u64;
            stats.total += count;
            match TaskStatus::from_str(&status) {
                Ok(TaskStatus::Queued) => stats.queued += count,
                Ok(TaskStatus::Running) => stats.running += count,
                Ok(TaskStatus::Succeeded) => stats.succeeded += count,
                Ok(TaskStatus::Failed) => stats.failed += count,
                Ok(TaskStatus::Cancelled) => stats.cancelled += count,
                Err(_) => {}
            }
        }

        Ok(stats)
    }

    /// Delete a task; returns false if it did not exist
    pub fn delete_task(&self, task_uid: &str) -> Result<bool, RegistryError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tasks WHERE task_uid = ?1", params![task_uid])?;
        Ok(deleted > 0)
    }

    /// Read-modify-write one task inside a transaction
    fn modify<F>(&self, task_uid: &str, apply: F) -> Result<Task, RegistryError>
    where
        F: FnOnce(&mut Task) -> Result<(), RegistryError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let mut task = load(&tx, task_uid)?.ok_or_else(|| RegistryError::NotFound(task_uid.to_string()))?;
        apply(&mut task)?;
        task.updated_at = Utc::now();

        tx.execute(
            "UPDATE tasks SET status = ?2, current_step_number = ?3, current_step_uid = ?4, \
             last_completed_step = ?5, failed_step_number = ?6, failed_step_uid = ?7, updated_at = ?8 \
             WHERE task_uid = ?1",
            params![
                task.task_uid,
                task.status.as_str(),
                task.current_step_number,
                task.current_step_uid,
                task.last_completed_step,
                task.failed_step_number,
                task.failed_step_uid,
                timestamp(task.updated_at),
            ],
        )?;
        tx.commit()?;

        Ok(task)
    }
}

fn check_monotonic(task: &Task, field: &'static str, from: u32, to: u32) -> Result<(), RegistryError> {
    if to < from {
        return Err(RegistryError::CounterRegression {
            task_uid: task.task_uid.clone(),
            field,
            from,
            to,
        });
    }
    Ok(())
}

fn load(conn: &Connection, task_uid: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE task_uid = ?1", COLUMNS),
        params![task_uid],
        read_task,
    )
    .optional()
}

fn read_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        task_uid: row.get(0)?,
        total_steps: row.get(1)?,
        status: parse_column(row, 2, |s| TaskStatus::from_str(s))?,
        current_step_number: row.get(3)?,
        current_step_uid: row.get(4)?,
        last_completed_step: row.get(5)?,
        failed_step_number: row.get(6)?,
        failed_step_uid: row.get(7)?,
        user_uid: row.get(8)?,
        request_json: row.get(9)?,
        created_at: parse_column(row, 10, parse_timestamp)?,
        updated_at: parse_column(row, 11, parse_timestamp)?,
    })
}

fn parse_column<T, E>(row: &Row<'_>, idx: usize, parse: impl Fn(&str) -> Result<T, E>) -> rusqlite::Result<T>
where
    E: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let reg = registry();
        let uid = reg.create_task(6, Some("user-1"), r#"{"patient_id":"P001"}"#).unwrap();

        let task = reg.get_task(&uid).unwrap().unwrap();
        assert_eq!(task.total_steps, 6);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.last_completed_step, 0);
        assert_eq!(task.user_uid.as_deref(), Some("user-1"));
        assert_eq!(task.request_json, r#"{"patient_id":"P001"}"#);
        assert!(reg.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_state_machine_is_monotonic() {
        let reg = registry();
        let uid = reg.create_task(2, None, "{}").unwrap();

        reg.mark_running(&uid).unwrap();
        reg.finish(&uid, TaskStatus::Failed).unwrap();

        let err = reg.mark_running(&uid).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { from: TaskStatus::Failed, to: TaskStatus::Running, .. }));
        assert_eq!(reg.get_task(&uid).unwrap().unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_queued_task_cannot_skip_running() {
        let reg = registry();
        let uid = reg.create_task(1, None, "{}").unwrap();

        let err = reg.update_task(&uid, TaskUpdate::status(TaskStatus::Succeeded)).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { from: TaskStatus::Queued, to: TaskStatus::Succeeded, .. }));
        assert_eq!(reg.get_task(&uid).unwrap().unwrap().status, TaskStatus::Queued);

        let task = reg.finish(&uid, TaskStatus::Cancelled).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_step_counters() {
        let reg = registry();
        let uid = reg.create_task(2, None, "{}").unwrap();
        reg.mark_running(&uid).unwrap();

        let task = reg.begin_step(&uid, "P001:dicom_to_nii").unwrap();
        assert_eq!(task.current_step_number, 1);
        let task = reg.record_step_completed(&uid).unwrap();
        assert_eq!(task.last_completed_step, 1);

        let task = reg.begin_step(&uid, "P001:registration").unwrap();
        assert_eq!(task.current_step_number, 2);
        assert_eq!(task.current_step_uid.as_deref(), Some("P001:registration"));
        reg.record_step_completed(&uid).unwrap();

        assert!(matches!(
            reg.record_step_completed(&uid),
            Err(RegistryError::CounterRegression { .. })
        ));
    }

    #[test]
    fn test_counters_never_regress() {
        let reg = registry();
        let uid = reg.create_task(6, None, "{}").unwrap();
        reg.update_task(&uid, TaskUpdate { last_completed_step: Some(3), ..Default::default() }).unwrap();

        let err = reg
            .update_task(&uid, TaskUpdate { last_completed_step: Some(2), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, RegistryError::CounterRegression { field: "last_completed_step", .. }));
    }

    #[test]
    fn test_first_failure_is_kept() {
        let reg = registry();
        let uid = reg.create_task(4, None, "{}").unwrap();
        reg.record_step_completed(&uid).unwrap();

        reg.record_step_failed(&uid, "P001:registration").unwrap();
        let task = reg.record_step_failed(&uid, "P002:dicom_to_nii").unwrap();

        assert_eq!(task.failed_step_number, Some(2));
        assert_eq!(task.failed_step_uid.as_deref(), Some("P001:registration"));
    }

    #[test]
    fn test_list_filter_and_paging() {
        let reg = registry();
        let a = reg.create_task(1, None, "{}").unwrap();
        let b = reg.create_task(1, None, "{}").unwrap();
        let c = reg.create_task(1, None, "{}").unwrap();
        reg.mark_running(&b).unwrap();

        let all = reg.list_tasks(None, 10, 0).unwrap();
        assert_eq!(all.iter().map(|t| t.task_uid.as_str()).collect::<Vec<_>>(), vec![c.as_str(), b.as_str(), a.as_str()]);

        let page = reg.list_tasks(None, 1, 1).unwrap();
        assert_eq!(page[0].task_uid, b);

        let running = reg.list_tasks(Some(TaskStatus::Running), 10, 0).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_uid, b);
    }

    #[test]
    fn test_statistics_and_delete() {
        let reg = registry();
        let a = reg.create_task(1, None, "{}").unwrap();
        let b = reg.create_task(1, None, "{}").unwrap();
        reg.mark_running(&b).unwrap();
        reg.finish(&b, TaskStatus::Succeeded).unwrap();

        let stats = reg.get_statistics().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.succeeded, 1);

        assert!(reg.delete_task(&a).unwrap());
        assert!(!reg.delete_task(&a).unwrap());
        assert_eq!(reg.get_statistics().unwrap().total, 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("state/tasks.db");

        let uid = {
            let reg = TaskRegistry::open(&path).unwrap();
            let uid = reg.create_task(3, None, "{}").unwrap();
            reg.mark_running(&uid).unwrap();
            uid
        };

        let reg = TaskRegistry::open(&path).unwrap();
        assert_eq!(reg.get_task(&uid).unwrap().unwrap().status, TaskStatus::Running);
    }
}
