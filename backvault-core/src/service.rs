/*!
Backup service: wires the classifier, task queue, transform pipeline, network
adapter, state store and reporter together.

```text
submit_change ─► ChangeClassifier ─► TaskQueue ─► workers
                                                  │  path lock
                                                  │  read + checksum ─► skip if current
                                                  │  encode ─► upload
                                                  ▼
                                     StateStore update + Reporter result
```
*/

use crate::checksum::compute_hash;
use crate::classifier::{ChangeClassifier, DEFAULT_MAX_FILE_SIZE};
use crate::event::{BackupTask, ChangeEvent, Operation};
use crate::network::NetworkAdapter;
use crate::queue::{PathLocks, SubmitOutcome, TaskHandler, TaskQueue, DEFAULT_QUEUE_CAPACITY};
use crate::report::{BackupResult, Reporter};
use crate::state::{BackupRecord, BackupStats, BackupStatus, FileBackupState, StateStore};
use crate::transform::{TransformFlags, TransformPipeline};
use crate::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tunables for [`BackupService`]
#[derive(Debug, Clone)]
pub struct BackupServiceConfig {
    pub max_file_size: u64,
    /// Number of workers; 0 means one per CPU
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for BackupServiceConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            workers: 5,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl BackupServiceConfig {
    /// Worker count with 0 resolved to the number of CPUs
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// Snapshot of service counters and persisted state
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub queue_length: usize,
    pub pending_tasks: usize,
    pub dropped_tasks: u64,
    pub abandoned_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub skipped_tasks: u64,
    pub deleted_tasks: u64,
    pub store: BackupStats,
}

#[derive(Debug, Default)]
struct TaskCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    deleted: AtomicU64,
}

/// Content read from disk for one task
struct LoadedFile {
    data: Vec<u8>,
    checksum: String,
}

/// Per-task backup logic executed by queue workers
struct BackupWorker {
    state: Arc<dyn StateStore>,
    network: Arc<dyn NetworkAdapter>,
    reporter: Arc<dyn Reporter>,
    pipeline: TransformPipeline,
    locks: PathLocks,
    counters: TaskCounters,
}

/// What a task needs written back after an upload attempt
struct Attempt {
    task: BackupTask,
    start_time: DateTime<Utc>,
    previous: Option<FileBackupState>,
    checksum: String,
    original_size: u64,
    transformed_size: u64,
    flags: TransformFlags,
}

/// How a task ended, for the service counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Failed,
    Deleted,
}

impl BackupWorker {
    async fn process(&self, task: BackupTask) {
        let _path_guard = self.locks.lock(&task.path).await;
        let start_time = Utc::now();

        debug!(path = %task.path.display(), operation = %task.operation, "Processing task");

        if task.operation == Operation::Delete {
            let outcome = self
                .persist(move |state, reporter| mark_deleted(state, reporter, &task, start_time))
                .await;
            self.count(outcome);
            return;
        }

        let path = task.path.clone();
        let previous = match self.persist(move |state, _| state.get(&path)).await {
            Ok(Ok(previous)) => previous,
            Ok(Err(e)) | Err(e) => {
                warn!(path = %task.path.display(), error = %e, "Failed to read file state");
                None
            }
        };

        let loaded = match load_file(&task.path).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let checksum = previous
                    .as_ref()
                    .map(|s| s.last_checksum.clone())
                    .unwrap_or_default();
                let attempt = Attempt {
                    original_size: task.size,
                    task,
                    start_time,
                    previous,
                    checksum,
                    transformed_size: 0,
                    flags: self.pipeline.flags(),
                };
                let outcome = self
                    .persist(move |state, reporter| record_failure(state, reporter, attempt, e))
                    .await;
                self.count(outcome);
                return;
            }
        };

        if previous.as_ref().is_some_and(|s| s.is_current(&loaded.checksum)) {
            debug!(path = %task.path.display(), checksum = %loaded.checksum, "File unchanged, skipping");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let path = task.path.clone();
        let mut attempt = Attempt {
            task,
            start_time,
            previous,
            checksum: loaded.checksum,
            original_size: loaded.data.len() as u64,
            transformed_size: 0,
            flags: self.pipeline.flags(),
        };

        let outcome = match self.transform_and_upload(&path, loaded.data, &attempt.checksum).await {
            Ok((remote_id, transformed_size)) => {
                attempt.transformed_size = transformed_size;
                self.persist(move |state, reporter| {
                    match record_success(state, reporter, &attempt, &remote_id) {
                        Ok(()) => Outcome::Completed,
                        Err(e) => record_failure(state, reporter, attempt, e),
                    }
                })
                .await
            }
            Err(e) => {
                self.persist(move |state, reporter| record_failure(state, reporter, attempt, e))
                    .await
            }
        };
        self.count(outcome);
    }

    /// Run state-store and reporter calls on the blocking pool
    async fn persist<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn StateStore, &dyn Reporter) -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let reporter = Arc::clone(&self.reporter);
        tokio::task::spawn_blocking(move || f(state.as_ref(), reporter.as_ref()))
            .await
            .map_err(|e| BackupError::state_store(format!("persistence task failed: {e}")))
    }

    fn count(&self, outcome: Result<Outcome>) {
        let counter = match outcome {
            Ok(Outcome::Completed) => &self.counters.completed,
            Ok(Outcome::Deleted) => &self.counters.deleted,
            Ok(Outcome::Failed) => &self.counters.failed,
            Err(e) => {
                error!(error = %e, "Failed to persist task outcome");
                &self.counters.failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    async fn transform_and_upload(&self, path: &Path, data: Vec<u8>, checksum: &str) -> Result<(String, u64)> {
        let encoded = if self.pipeline.flags().is_identity() {
            data
        } else {
            let pipeline = self.pipeline.clone();
            tokio::task::spawn_blocking(move || pipeline.encode(&data))
                .await
                .map_err(|e| BackupError::compression(format!("transform task failed: {e}")))??
        };

        let size = encoded.len() as u64;

        #[cfg(feature = "metrics")]
        let timer = crate::observability::UploadTimer::start();

        let uploaded = self.network.upload(path, Bytes::from(encoded), size, checksum).await;

        #[cfg(feature = "metrics")]
        match &uploaded {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }

        Ok((uploaded?, size))
    }
}

fn record_success(
    state: &dyn StateStore,
    reporter: &dyn Reporter,
    attempt: &Attempt,
    remote_id: &str,
) -> Result<()> {
    let task = &attempt.task;
    let now = Utc::now();
    let backup_count = attempt.previous.as_ref().map_or(0, |s| s.backup_count) + 1;

    state.set(
        &task.path,
        FileBackupState {
            last_checksum: attempt.checksum.clone(),
            last_backup_time: now,
            backup_count,
            status: BackupStatus::Success,
        },
    )?;

    if let Err(e) = state.record(BackupRecord {
        file_path: task.path.clone(),
        file_id: remote_id.to_string(),
        checksum: attempt.checksum.clone(),
        original_size: attempt.original_size,
        transformed_size: attempt.transformed_size,
        transform_flags: attempt.flags,
        backup_time: now,
        status: BackupStatus::Success,
        error_message: None,
        operation: task.operation,
    }) {
        warn!(path = %task.path.display(), error = %e, "Failed to record backup history");
    }

    reporter.add_result(BackupResult {
        path: task.path.clone(),
        remote_id: Some(remote_id.to_string()),
        operation: task.operation,
        success: true,
        error: None,
        start_time: attempt.start_time,
        end_time: now,
        original_size: attempt.original_size,
        transformed_size: attempt.transformed_size,
        checksum: attempt.checksum.clone(),
        transform_flags: attempt.flags,
    });

    info!(
        path = %task.path.display(),
        remote_id,
        size = attempt.original_size,
        transformed_size = attempt.transformed_size,
        backup_count,
        "Backed up file"
    );
    Ok(())
}

fn record_failure(
    state: &dyn StateStore,
    reporter: &dyn Reporter,
    attempt: Attempt,
    err: BackupError,
) -> Outcome {
    let task = attempt.task;
    let now = Utc::now();
    let message = err.to_string();

    error!(path = %task.path.display(), operation = %task.operation, error = %message, "Backup failed");

    let failed = FileBackupState {
        last_checksum: attempt.checksum.clone(),
        last_backup_time: now,
        backup_count: attempt.previous.as_ref().map_or(0, |s| s.backup_count),
        status: BackupStatus::Failed,
    };
    if let Err(e) = state.set(&task.path, failed) {
        warn!(path = %task.path.display(), error = %e, "Failed to persist failed state");
    }

    if let Err(e) = state.record(BackupRecord {
        file_path: task.path.clone(),
        file_id: String::new(),
        checksum: attempt.checksum.clone(),
        original_size: attempt.original_size,
        transformed_size: attempt.transformed_size,
        transform_flags: attempt.flags,
        backup_time: now,
        status: BackupStatus::Failed,
        error_message: Some(message.clone()),
        operation: task.operation,
    }) {
        warn!(path = %task.path.display(), error = %e, "Failed to record backup history");
    }

    reporter.add_result(BackupResult {
        path: task.path,
        remote_id: None,
        operation: task.operation,
        success: false,
        error: Some(message),
        start_time: attempt.start_time,
        end_time: now,
        original_size: attempt.original_size,
        transformed_size: attempt.transformed_size,
        checksum: attempt.checksum,
        transform_flags: attempt.flags,
    });
    Outcome::Failed
}

/// Deletions skip transform and upload; only the state changes
fn mark_deleted(
    state: &dyn StateStore,
    reporter: &dyn Reporter,
    task: &BackupTask,
    start_time: DateTime<Utc>,
) -> Outcome {
    let previous = state.get(&task.path).ok().flatten();
    let now = Utc::now();
    let deleted = FileBackupState {
        last_checksum: previous.as_ref().map(|s| s.last_checksum.clone()).unwrap_or_default(),
        last_backup_time: now,
        backup_count: previous.as_ref().map_or(0, |s| s.backup_count),
        status: BackupStatus::Deleted,
    };
    let checksum = deleted.last_checksum.clone();

    let (outcome, error) = match state.set(&task.path, deleted) {
        Ok(()) => {
            info!(path = %task.path.display(), "Marked file as deleted");
            (Outcome::Deleted, None)
        }
        Err(e) => {
            error!(path = %task.path.display(), error = %e, "Failed to mark file as deleted");
            (Outcome::Failed, Some(e.to_string()))
        }
    };

    reporter.add_result(BackupResult {
        path: task.path.clone(),
        remote_id: None,
        operation: Operation::Delete,
        success: outcome == Outcome::Deleted,
        error,
        start_time,
        end_time: now,
        original_size: 0,
        transformed_size: 0,
        checksum,
        transform_flags: TransformFlags::identity(),
    });
    outcome
}

/// Read the whole file and hash it on the blocking pool
async fn load_file(path: &Path) -> Result<LoadedFile> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<LoadedFile> {
        let data = std::fs::read(&owned).map_err(|e| BackupError::io(&owned, e))?;
        let checksum = compute_hash(&data);
        Ok(LoadedFile { data, checksum })
    })
    .await
    .map_err(|e| BackupError::io(path, std::io::Error::other(e)))?
}

#[async_trait]
impl TaskHandler for BackupWorker {
    async fn handle(&self, task: BackupTask) {
        self.process(task).await;
    }
}

/// Change-driven backup engine
pub struct BackupService {
    config: BackupServiceConfig,
    classifier: ChangeClassifier,
    queue: TaskQueue,
    worker: Arc<BackupWorker>,
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("pipeline", &self.worker.pipeline)
            .finish_non_exhaustive()
    }
}

impl BackupService {
    pub fn new(
        config: BackupServiceConfig,
        state: Arc<dyn StateStore>,
        network: Arc<dyn NetworkAdapter>,
        reporter: Arc<dyn Reporter>,
        pipeline: TransformPipeline,
    ) -> Self {
        let classifier = ChangeClassifier::new(config.max_file_size);
        let queue = TaskQueue::new(config.queue_capacity);
        let worker = Arc::new(BackupWorker {
            state,
            network,
            reporter,
            pipeline,
            locks: PathLocks::new(),
            counters: TaskCounters::default(),
        });

        Self {
            config,
            classifier,
            queue,
            worker,
        }
    }

    /// Check the remote end and start the workers
    ///
    /// A failed health check is fatal: nothing is started.
    pub async fn start(&self) -> Result<()> {
        self.worker.network.health_check().await?;

        let workers = self.config.worker_count();
        self.queue.start(workers, self.worker.clone())?;
        info!(workers, flags = ?self.worker.pipeline.flags(), "Backup service started");
        Ok(())
    }

    /// Run `event` through the classifier and enqueue it when accepted
    pub fn submit_change(&self, event: ChangeEvent) -> Result<SubmitOutcome> {
        if self.queue.is_stopped() {
            return Ok(SubmitOutcome::Stopped);
        }

        let state = self.worker.state.get(&event.path)?;
        if !self.classifier.should_backup(&event, state.as_ref()) {
            debug!(path = %event.path.display(), operation = %event.operation, "Change rejected");
            return Ok(SubmitOutcome::Rejected);
        }

        Ok(self.queue.submit(event))
    }

    /// Wait until every queued task has been processed
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Graceful shutdown; see [`TaskQueue::stop`]
    pub async fn stop(&self) {
        self.queue.stop().await;
        info!(
            completed = self.worker.counters.completed.load(Ordering::Relaxed),
            failed = self.worker.counters.failed.load(Ordering::Relaxed),
            dropped = self.queue.dropped(),
            "Backup service stopped"
        );
    }

    pub fn dropped_tasks(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn get_stats(&self) -> Result<ServiceStats> {
        let counters = &self.worker.counters;
        Ok(ServiceStats {
            queue_length: self.queue.len(),
            pending_tasks: self.queue.pending(),
            dropped_tasks: self.queue.dropped(),
            abandoned_tasks: self.queue.abandoned(),
            completed_tasks: counters.completed.load(Ordering::Relaxed),
            failed_tasks: counters.failed.load(Ordering::Relaxed),
            skipped_tasks: counters.skipped.load(Ordering::Relaxed),
            deleted_tasks: counters.deleted.load(Ordering::Relaxed),
            store: self.worker.state.stats()?,
        })
    }
}
