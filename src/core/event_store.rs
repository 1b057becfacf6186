//! Append-only audit log of task execution with file-based persistence.
//!
//! Each task gets `<base>/<task_uid>/events.jsonl`, newline-delimited JSON for
//! easy inspection. Appends from concurrent patient workers are serialized.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::domain::{Event, EventType, Step};

/// File-based event store using JSONL format
#[derive(Debug)]
pub struct EventStore {
    /// Directory holding one folder per task
    base_dir: PathBuf,

    write_lock: Mutex<()>,
}

impl EventStore {
    /// Open an event store rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the event store in the configured location ($MEDPIPE_HOME/tasks)
    pub fn from_config() -> Result<Self> {
        Ok(Self::new(crate::config::paths::task_logs_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a task's events.jsonl file
    pub fn events_path(&self, task_uid: &str) -> PathBuf {
        self.base_dir.join(task_uid).join("events.jsonl")
    }

    /// Append an event to its task's log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let path = self.events_path(&event.task_uid);
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create task log directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events of a task in order
    pub async fn replay(&self, task_uid: &str) -> Result<Vec<Event>> {
        let path = self.events_path(task_uid);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open events file: {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Find events of a task matching a predicate
    pub async fn find_events<F>(&self, task_uid: &str, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.replay(task_uid).await?;
        Ok(events.into_iter().filter(predicate).collect())
    }

    /// Check whether a step with this idempotency key completed within the task
    pub async fn is_step_completed(&self, task_uid: &str, idempotency_key: &str) -> Result<bool> {
        let events = self.replay(task_uid).await?;
        Ok(events.iter().any(|e| {
            e.idempotency_key == idempotency_key
                && matches!(e.event_type, EventType::StepSucceeded | EventType::StepSkipped)
        }))
    }

    /// Remove a task's log; missing logs are not an error
    pub async fn delete(&self, task_uid: &str) -> Result<()> {
        let dir = self.base_dir.join(task_uid);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete task log: {}", dir.display())),
        }
    }

    /// List task uids that have a log
    pub async fn list_tasks(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    tasks.push(name.to_string());
                }
            }
        }

        tasks.sort();
        Ok(tasks)
    }
}

/// Generate an idempotency key for one step of one patient within a task
pub fn generate_idempotency_key(task_uid: &str, patient_id: &str, step: Step, inputs: &[PathBuf]) -> String {
    let joined = inputs
        .iter()
        .map(|p| p.to_string_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}:{}:{}:{}", task_uid, patient_id, step, hash_input(&joined))
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepStatus;
    use tempfile::TempDir;

    fn step_event(task_uid: &str, event_type: EventType, key: &str) -> Event {
        Event::new(
            task_uid,
            event_type,
            key.to_string(),
            format!("{:?}", event_type),
            StepStatus::Running,
        )
        .for_step("P001", Step::DicomToNii)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::new(temp.path());

        store.append(&step_event("t1", EventType::TaskStarted, "t1:start")).await.unwrap();
        store.append(&step_event("t1", EventType::StepStarted, "k")).await.unwrap();
        store.append(&step_event("t2", EventType::TaskStarted, "t2:start")).await.unwrap();

        let events = store.replay("t1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::TaskStarted);
        assert_eq!(events[1].event_type, EventType::StepStarted);

        assert_eq!(store.list_tasks().await.unwrap(), vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_replay_missing_task_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::new(temp.path());
        assert!(store.replay("nope").await.unwrap().is_empty());
        assert!(store.list_tasks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_completion_lookup() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::new(temp.path());

        store.append(&step_event("t1", EventType::StepStarted, "k1")).await.unwrap();
        assert!(!store.is_step_completed("t1", "k1").await.unwrap());

        store.append(&step_event("t1", EventType::StepSkipped, "k1")).await.unwrap();
        assert!(store.is_step_completed("t1", "k1").await.unwrap());
        assert!(!store.is_step_completed("t1", "k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_task_log() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::new(temp.path());
        store.append(&step_event("t1", EventType::TaskStarted, "k")).await.unwrap();

        store.delete("t1").await.unwrap();
        assert!(store.replay("t1").await.unwrap().is_empty());
        store.delete("t1").await.unwrap();
    }

    #[test]
    fn test_idempotency_key_format() {
        let inputs = vec![PathBuf::from("/data/0_DICOM/P001/C0/a.dcm")];
        let key = generate_idempotency_key("task-1", "P001", Step::DicomToNii, &inputs);

        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "task-1");
        assert_eq!(parts[1], "P001");
        assert_eq!(parts[2], "dicom_to_nii");
        assert_eq!(parts[3].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        assert_eq!(hash_input("a"), hash_input("a"));
        assert_ne!(hash_input("a"), hash_input("b"));
        assert_eq!(hash_input("a").len(), 16);
    }
}
