//! Ephemeral progress overlay polled by clients.
//!
//! The tracker is a read-optimized cache keyed by task id. Records are built
//! from the owning `Task`'s counters; a stale update that would move progress
//! backwards, or reopen a completed record, is ignored.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::domain::{ProgressRecord, Task, TaskStatus};

/// Default interval of the reference polling client
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProgressError {
    #[error("Progress {0} is outside 0-100")]
    OutOfRange(f64),
}

/// In-memory progress records keyed by task id
#[derive(Debug, Default)]
pub struct ProgressTracker {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ProgressRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ProgressRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a progress record.
    ///
    /// Returns `Ok(false)` when the update is stale and was ignored.
    pub fn update_progress(
        &self,
        task_id: &str,
        progress: f64,
        status: TaskStatus,
        message: Option<String>,
        completed: bool,
    ) -> Result<bool, ProgressError> {
        if !(0.0..=100.0).contains(&progress) {
            return Err(ProgressError::OutOfRange(progress));
        }

        let record = ProgressRecord {
            task_id: task_id.to_string(),
            progress,
            status,
            message,
            completed,
            timestamp: Utc::now(),
        };
        Ok(self.store(record))
    }

    /// Store the progress view derived from `task`
    pub fn publish(&self, task: &Task, message: Option<String>) -> bool {
        self.store(ProgressRecord::from_task(task, message))
    }

    fn store(&self, record: ProgressRecord) -> bool {
        let mut records = self.write();

        if let Some(existing) = records.get(&record.task_id) {
            let reopens = existing.completed && !record.completed;
            let regresses = !record.completed && record.progress < existing.progress;
            if reopens || regresses {
                debug!(task_id = %record.task_id, "Ignoring stale progress update");
                return false;
            }
        }

        records.insert(record.task_id.clone(), record);
        true
    }

    pub fn get_progress(&self, task_id: &str) -> Option<ProgressRecord> {
        self.read().get(task_id).cloned()
    }

    /// Drop a record; returns false if there was none
    pub fn clear_progress(&self, task_id: &str) -> bool {
        self.write().remove(task_id).is_some()
    }

    /// All records, most recently updated first
    pub fn list_progress(&self) -> Vec<ProgressRecord> {
        let mut records: Vec<ProgressRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }
}

/// How a polling loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The task reached a terminal state
    Completed(ProgressRecord),

    /// The record disappeared (already cleared)
    Cleared,
}

/// Poll `task_id` at `interval` until it completes or its record is gone.
///
/// `on_update` sees every record observed along the way, including the final one.
pub async fn poll_until_done<F>(
    tracker: &ProgressTracker,
    task_id: &str,
    interval: Duration,
    mut on_update: F,
) -> PollOutcome
where
    F: FnMut(&ProgressRecord),
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match tracker.get_progress(task_id) {
            None => return PollOutcome::Cleared,
            Some(record) => {
                on_update(&record);
                if record.completed {
                    return PollOutcome::Completed(record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_and_get() {
        let tracker = ProgressTracker::new();
        assert!(tracker.get_progress("t1").is_none());

        tracker
            .update_progress("t1", 50.0, TaskStatus::Running, Some("halfway".into()), false)
            .unwrap();

        let record = tracker.get_progress("t1").unwrap();
        assert_eq!(record.progress, 50.0);
        assert_eq!(record.message.as_deref(), Some("halfway"));
        assert!(!record.completed);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let tracker = ProgressTracker::new();
        assert_eq!(
            tracker.update_progress("t1", 120.0, TaskStatus::Running, None, false),
            Err(ProgressError::OutOfRange(120.0))
        );
        assert!(tracker.update_progress("t1", f64::NAN, TaskStatus::Running, None, false).is_err());
    }

    #[test]
    fn test_ignores_regression_and_reopen() {
        let tracker = ProgressTracker::new();
        tracker.update_progress("t1", 40.0, TaskStatus::Running, None, false).unwrap();

        assert!(!tracker.update_progress("t1", 20.0, TaskStatus::Running, None, false).unwrap());
        assert_eq!(tracker.get_progress("t1").unwrap().progress, 40.0);

        assert!(tracker.update_progress("t1", 40.0, TaskStatus::Failed, None, true).unwrap());
        assert!(!tracker.update_progress("t1", 60.0, TaskStatus::Running, None, false).unwrap());
        assert_eq!(tracker.get_progress("t1").unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn test_clear_and_list() {
        let tracker = ProgressTracker::new();
        tracker.update_progress("a", 0.0, TaskStatus::Queued, None, false).unwrap();
        tracker.update_progress("b", 10.0, TaskStatus::Running, None, false).unwrap();

        assert_eq!(tracker.list_progress().len(), 2);
        assert!(tracker.clear_progress("a"));
        assert!(!tracker.clear_progress("a"));
        assert_eq!(tracker.list_progress()[0].task_id, "b");
    }

    #[tokio::test]
    async fn test_poll_until_completed() {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.update_progress("t1", 0.0, TaskStatus::Running, None, false).unwrap();

        let writer = tracker.clone();
        tokio::spawn(async move {
            for step in 1..=4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let done = step == 4;
                let status = if done { TaskStatus::Succeeded } else { TaskStatus::Running };
                writer
                    .update_progress("t1", step as f64 * 25.0, status, None, done)
                    .unwrap();
            }
        });

        let mut seen = Vec::new();
        let outcome = poll_until_done(&tracker, "t1", Duration::from_millis(2), |r| seen.push(r.progress)).await;

        match outcome {
            PollOutcome::Completed(record) => assert_eq!(record.progress, 100.0),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_poll_tolerates_cleared_record() {
        let tracker = ProgressTracker::new();
        let outcome = poll_until_done(&tracker, "gone", Duration::from_millis(1), |_| {}).await;
        assert_eq!(outcome, PollOutcome::Cleared);
    }
}
