//! Durable odometer state.
//!
//! The odometer hands snapshots to an [`OdometerStore`]. Saves made from the
//! update path go through a [`PersistenceWorker`] so the caller never blocks
//! on I/O; a failed write is logged and counted, never surfaced to `update`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{OdometerError, Result};
use crate::types::LocationSample;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OdometerState {
    /// meters
    pub odometer: f64,
    /// meters, one sigma
    pub odometer_error: f64,
    pub last_location: Option<LocationSample>,
    /// Unix seconds at snapshot time
    pub saved_at: i64,
}

impl OdometerState {
    pub fn new(odometer: f64, odometer_error: f64, last_location: Option<LocationSample>) -> Self {
        Self {
            odometer,
            odometer_error,
            last_location,
            saved_at: chrono::Utc::now().timestamp(),
        }
    }
}

pub trait OdometerStore: Send + Sync {
    fn save(&self, state: &OdometerState) -> Result<()>;

    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<OdometerState>>;
}

/// One JSON document on disk, replaced atomically on every save.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OdometerStore for JsonFileStore {
    fn save(&self, state: &OdometerState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        // Fresh temp file per save; concurrent writers never share one
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<OdometerState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}

/// Keeps the last snapshot in memory. Used by tests and by hosts that
/// persist through their own channel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<OdometerState>>,
    saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl OdometerStore for MemoryStore {
    fn save(&self, state: &OdometerState) -> Result<()> {
        let mut slot = self
            .state
            .lock()
            .map_err(|_| OdometerError::Storage("memory store lock poisoned".into()))?;
        *slot = Some(*state);
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load(&self) -> Result<Option<OdometerState>> {
        let slot = self
            .state
            .lock()
            .map_err(|_| OdometerError::Storage("memory store lock poisoned".into()))?;
        Ok(*slot)
    }
}

enum Job {
    /// Fire-and-forget; superseded by any newer snapshot still queued
    Save(OdometerState),
    /// Written unconditionally, result sent back
    Write(OdometerState, Sender<Result<()>>),
    /// Acknowledged once everything queued before it is written
    Flush(Sender<()>),
}

/// Result of a [`PersistenceWorker::write`], available once the worker
/// reaches it.
#[derive(Debug)]
pub struct PendingWrite(Receiver<Result<()>>);

impl PendingWrite {
    pub fn wait(self) -> Result<()> {
        self.0.recv().map_err(|_| OdometerError::PersistenceClosed)?
    }
}

/// Background writer. The worker thread is the only writer to the store:
/// queued snapshots, synchronous writes and flushes all go through one
/// channel. Dropping the worker drains the queue and joins.
pub struct PersistenceWorker {
    tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
    failures: Arc<AtomicU64>,
}

impl PersistenceWorker {
    pub fn spawn(store: Arc<dyn OdometerStore>) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        let failures = Arc::new(AtomicU64::new(0));

        let thread_failures = Arc::clone(&failures);
        let handle = thread::Builder::new()
            .name("odometer-persist".to_string())
            .spawn(move || {
                let write_queued = |state: &OdometerState| {
                    if let Err(e) = store.save(state) {
                        thread_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("[ODOMETER] failed to persist state: {}", e);
                    }
                };

                for first in rx.iter() {
                    // Only the newest queued snapshot matters
                    let mut pending = None;
                    for job in std::iter::once(first).chain(rx.try_iter()) {
                        match job {
                            Job::Save(state) => pending = Some(state),
                            Job::Write(state, ack) => {
                                pending = None;
                                let _ = ack.send(store.save(&state));
                            }
                            Job::Flush(ack) => {
                                if let Some(state) = pending.take() {
                                    write_queued(&state);
                                }
                                let _ = ack.send(());
                            }
                        }
                    }
                    if let Some(state) = pending {
                        write_queued(&state);
                    }
                }
                log::debug!("[ODOMETER] persistence worker stopped");
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            failures,
        })
    }

    fn send(&self, job: Job) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(job).map_err(|_| OdometerError::PersistenceClosed),
            None => Err(OdometerError::PersistenceClosed),
        }
    }

    /// Queue a snapshot without blocking.
    pub fn submit(&self, state: OdometerState) -> Result<()> {
        self.send(Job::Save(state))
    }

    /// Queue a snapshot that is written even if newer ones follow; the
    /// returned handle reports the store's answer.
    pub fn write(&self, state: OdometerState) -> Result<PendingWrite> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(Job::Write(state, ack_tx))?;
        Ok(PendingWrite(ack_rx))
    }

    /// Block until every snapshot queued so far has been written (or failed).
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(Job::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| OdometerError::PersistenceClosed)
    }

    /// Background writes that failed so far.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stop accepting snapshots, drain the queue, and join the thread.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("[ODOMETER] persistence worker panicked");
            }
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PersistenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceWorker")
            .field("running", &self.handle.is_some())
            .field("failures", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state(odometer: f64) -> OdometerState {
        OdometerState::new(
            odometer,
            4.5,
            Some(LocationSample::new(45.0, -73.0, 5.0, Some(3.0), 100.0)),
        )
    }

    struct FailingStore;

    impl OdometerStore for FailingStore {
        fn save(&self, _state: &OdometerState) -> Result<()> {
            Err(OdometerError::Storage("disk full".into()))
        }

        fn load(&self) -> Result<Option<OdometerState>> {
            Ok(None)
        }
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("odometer.json"));
        assert!(store.load().unwrap().is_none());

        let state = sample_state(1234.5);
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_json_store_concurrent_saves() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("odometer.json")));

        let writers: Vec<_> = (0..2)
            .map(|w| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    (0..500)
                        .filter(|i| store.save(&sample_state((w * 1000 + i) as f64)).is_err())
                        .count()
                })
            })
            .collect();
        let errors: usize = writers.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(errors, 0);
        assert!(store.load().unwrap().is_some());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_json_store_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/state/odometer.json"));
        store.save(&sample_state(1.0)).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_json_store_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("odometer.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(OdometerError::Serialization(_))));
    }

    #[test]
    fn test_state_json_keys() {
        let json = serde_json::to_string(&sample_state(1.0)).unwrap();
        assert!(json.contains("\"odometerError\""));
        assert!(json.contains("\"lastLocation\""));
        assert!(json.contains("\"savedAt\""));
    }

    #[test]
    fn test_worker_writes_latest_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let mut worker = PersistenceWorker::spawn(store.clone()).unwrap();
        for i in 1..=10 {
            worker.submit(sample_state(i as f64)).unwrap();
        }
        worker.shutdown();

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.odometer, 10.0);
        assert!(store.save_count() >= 1);
        assert_eq!(worker.failure_count(), 0);
    }

    #[test]
    fn test_worker_counts_failures() {
        let worker = PersistenceWorker::spawn(Arc::new(FailingStore)).unwrap();
        worker.submit(sample_state(1.0)).unwrap();
        worker.flush().unwrap();
        assert_eq!(worker.failure_count(), 1);
        assert!(matches!(
            worker.write(sample_state(1.0)).unwrap().wait(),
            Err(OdometerError::Storage(_))
        ));
    }

    #[test]
    fn test_write_goes_through_worker() {
        let store = Arc::new(MemoryStore::new());
        let worker = PersistenceWorker::spawn(store.clone()).unwrap();
        worker.submit(sample_state(1.0)).unwrap();
        worker.write(sample_state(2.0)).unwrap().wait().unwrap();
        worker.flush().unwrap();
        assert_eq!(store.load().unwrap().unwrap().odometer, 2.0);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut worker = PersistenceWorker::spawn(Arc::new(MemoryStore::new())).unwrap();
        worker.shutdown();
        assert!(matches!(
            worker.submit(sample_state(1.0)),
            Err(OdometerError::PersistenceClosed)
        ));
        assert!(matches!(worker.flush(), Err(OdometerError::PersistenceClosed)));
    }
}
