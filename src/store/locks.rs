//! Single-flight guard per patient artifact tree.
//!
//! A patient's tree has at most one writer at a time. Within a process the
//! guard is a keyed async mutex; across processes an advisory exclusive file
//! lock under `<data_root>/.locks/` is held for the same span.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::layout::ArtifactStore;

/// Directory (under the data root) holding per-patient lock files
pub const LOCK_DIR: &str = ".locks";

type LockKey = (PathBuf, String);
type Slots = Arc<Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>>;

/// Registry of per-patient locks shared by every run of an orchestrator.
///
/// A slot lives only while some run holds or waits for it.
#[derive(Debug, Default)]
pub struct PatientLocks {
    slots: Slots,
}

impl PatientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until this caller is the only writer for the patient's tree
    pub async fn acquire(&self, store: &ArtifactStore, patient_id: &str) -> io::Result<PatientGuard> {
        let root = std::fs::canonicalize(store.root()).unwrap_or_else(|_| store.root().to_path_buf());
        let key = (root.clone(), patient_id.to_string());
        let slot = self.slot(key.clone());

        let local = slot.lock_owned().await;
        debug!(patient_id, "Acquired in-process patient lock");

        let lock_path = lock_file_path(&root, patient_id);
        let file = match tokio::task::spawn_blocking(move || lock_file(&lock_path)).await {
            Ok(Ok(file)) => file,
            Ok(Err(e)) => {
                release_slot(&self.slots, &key, local);
                return Err(e);
            }
            Err(e) => {
                release_slot(&self.slots, &key, local);
                return Err(io::Error::new(io::ErrorKind::Other, e));
            }
        };

        Ok(PatientGuard {
            local: Some(local),
            file,
            key,
            slots: Arc::clone(&self.slots),
        })
    }

    /// Patients with a live slot (held or awaited)
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn slot(&self, key: LockKey) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(key).or_default().clone()
    }
}

/// Unlock, then forget the slot if nobody else holds or awaits it
fn release_slot(slots: &Slots, key: &LockKey, local: OwnedMutexGuard<()>) {
    drop(local);
    let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
    if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        slots.remove(key);
    }
}

/// Held for the duration of one patient's run; releases both locks on drop
#[derive(Debug)]
pub struct PatientGuard {
    local: Option<OwnedMutexGuard<()>>,
    file: File,
    key: LockKey,
    slots: Slots,
}

impl Drop for PatientGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        if let Some(local) = self.local.take() {
            release_slot(&self.slots, &self.key, local);
        }
    }
}

fn lock_file_path(root: &Path, patient_id: &str) -> PathBuf {
    crate::config::paths::lock_dir(root).join(format!("{}.lock", patient_id))
}

fn lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_same_patient_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let locks = Arc::new(PatientLocks::new());

        let guard = locks.acquire(&store, "P001").await.unwrap();
        assert!(temp.path().join(".locks/P001.lock").exists());

        let locks2 = locks.clone();
        let store2 = store.clone();
        let waiter = tokio::spawn(async move { locks2.acquire(&store2, "P001").await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("second acquire should proceed after release")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_slots_are_released() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let locks = Arc::new(PatientLocks::new());

        for patient_id in ["P001", "P002", "P003"] {
            let guard = locks.acquire(&store, patient_id).await.unwrap();
            assert_eq!(locks.tracked(), 1);
            drop(guard);
        }
        assert_eq!(locks.tracked(), 0);

        // A waiter keeps the slot alive across the holder's release
        let guard = locks.acquire(&store, "P001").await.unwrap();
        let locks2 = locks.clone();
        let store2 = store.clone();
        let waiter = tokio::spawn(async move { locks2.acquire(&store2, "P001").await.map(drop) });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(guard);
        assert_eq!(locks.tracked(), 1);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap()
            .unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_different_patients_do_not_block() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path());
        let locks = PatientLocks::new();

        let _a = locks.acquire(&store, "P001").await.unwrap();
        let _b = tokio::time::timeout(Duration::from_secs(5), locks.acquire(&store, "P002"))
            .await
            .expect("other patient must not wait")
            .unwrap();
    }
}
