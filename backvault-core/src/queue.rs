/*!
Bounded task queue, worker pool and per-path locking.

[`TaskQueue::submit`] never blocks: when the queue is at capacity the task is dropped
and counted. Workers pull tasks off a shared receiver and hand them to a
[`TaskHandler`]; no ordering is guaranteed between tasks. [`TaskQueue::stop`] lets
in-flight tasks finish, abandons whatever is still queued, and waits for every worker
to exit.
*/

use crate::event::BackupTask;
use crate::{BackupError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default number of tasks the queue holds before dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// What happened to a submitted change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted and waiting for a worker
    Queued,
    /// The classifier decided no backup is needed
    Rejected,
    /// Queue at capacity; the task was dropped
    QueueFull,
    /// The queue no longer accepts work
    Stopped,
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued)
    }
}

/// Work performed for every dequeued task
///
/// Implementations must absorb their own failures; a handler that returns has
/// finished with the task one way or another.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: BackupTask);
}

/// Count of admitted tasks that have not finished yet
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Marks a task finished even if its handler panics
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Bounded, lossy-under-burst queue feeding a fixed pool of workers
#[derive(Debug)]
pub struct TaskQueue {
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<BackupTask>>>,
    receiver: Arc<AsyncMutex<mpsc::Receiver<BackupTask>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<Pending>,
    stopped: AtomicBool,
    dropped: AtomicU64,
    abandoned: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);

        Self {
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(AsyncMutex::new(receiver)),
            shutdown,
            workers: Mutex::new(Vec::new()),
            pending: Arc::new(Pending::default()),
            stopped: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks admitted and not yet finished (queued plus in progress)
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// Tasks waiting in the channel
    pub fn len(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|s| self.capacity - s.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Enqueue without waiting
    pub fn submit(&self, task: BackupTask) -> SubmitOutcome {
        if self.is_stopped() {
            return SubmitOutcome::Stopped;
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return SubmitOutcome::Stopped;
        };

        // Count before sending so a fast worker can't finish first
        self.pending.add();
        match sender.try_send(task) {
            Ok(()) => SubmitOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.pending.done();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                #[cfg(feature = "metrics")]
                crate::observability::BackupMetrics::global().record_dropped_task();
                warn!(
                    path = %task.path.display(),
                    capacity = self.capacity,
                    dropped,
                    "Task queue full, dropping task"
                );
                SubmitOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.done();
                SubmitOutcome::Stopped
            }
        }
    }

    /// Spawn `worker_count` workers feeding tasks to `handler`
    pub fn start(&self, worker_count: usize, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if self.is_stopped() {
            return Err(BackupError::validation("task queue has been stopped"));
        }

        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Err(BackupError::validation("task queue is already running"));
        }

        let worker_count = worker_count.max(1);
        for id in 0..worker_count {
            let receiver = Arc::clone(&self.receiver);
            let shutdown = self.shutdown.subscribe();
            let handler = Arc::clone(&handler);
            let pending = Arc::clone(&self.pending);
            workers.push(tokio::spawn(worker_loop(id, receiver, shutdown, handler, pending)));
        }

        info!(workers = worker_count, capacity = self.capacity, "Started worker pool");
        Ok(())
    }

    /// Wait until every admitted task has finished
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending.get() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting work, let running tasks finish, and wait for the workers
    ///
    /// Tasks still queued are abandoned. Their state was never written, so the
    /// next observation of the path derives them again.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.sender.lock().take();
        self.shutdown.send_replace(true);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut abandoned = 0u64;
        while let Ok(task) = receiver.try_recv() {
            debug!(path = %task.path.display(), "Abandoning queued task");
            abandoned += 1;
            self.pending.done();
        }

        if abandoned > 0 {
            self.abandoned.fetch_add(abandoned, Ordering::Relaxed);
            warn!(abandoned, "Abandoned queued tasks on shutdown");
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<BackupTask>>>,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<dyn TaskHandler>,
    pending: Arc<Pending>,
) {
    debug!(worker = id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                task = receiver.recv() => task,
            }
        };
        let Some(task) = task else {
            break;
        };

        let _done = PendingGuard(Arc::clone(&pending));
        handler.handle(task).await;
    }

    debug!(worker = id, "Worker stopped");
}

/// Advisory per-path locks serializing tasks for the same file
#[derive(Debug, Default)]
pub struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`
    pub async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );

        PathGuard {
            owner: self,
            path: path.to_path_buf(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Paths that currently have a holder or waiter
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held for the duration of one task; releases and prunes the path's lock on drop
pub struct PathGuard<'a> {
    owner: &'a PathLocks,
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        // One reference in the map, one in this guard: nobody else is waiting
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChangeEvent, Operation};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PathBuf>>,
        started: Notify,
        delay: Duration,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, task: BackupTask) {
            self.started.notify_one();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().push(task.path);
        }
    }

    fn task(name: &str) -> BackupTask {
        ChangeEvent::new(name, Operation::Modify, 1)
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let queue = TaskQueue::new(16);
        let recorder = Arc::new(Recorder::default());
        queue.start(3, recorder.clone()).unwrap();

        for i in 0..10 {
            assert_eq!(queue.submit(task(&format!("/f{i}"))), SubmitOutcome::Queued);
        }
        queue.wait_idle().await;

        assert_eq!(recorder.seen.lock().len(), 10);
        assert_eq!(queue.pending(), 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let queue = TaskQueue::new(2);

        assert!(queue.submit(task("/a")).is_queued());
        assert!(queue.submit(task("/b")).is_queued());
        assert_eq!(queue.submit(task("/c")), SubmitOutcome::QueueFull);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let queue = TaskQueue::new(4);
        queue.start(1, Arc::new(Recorder::default())).unwrap();
        queue.stop().await;

        assert_eq!(queue.submit(task("/late")), SubmitOutcome::Stopped);
        assert!(queue.start(1, Arc::new(Recorder::default())).is_err());
    }

    #[tokio::test]
    async fn test_stop_abandons_queued_tasks() {
        let queue = TaskQueue::new(8);
        for i in 0..5 {
            queue.submit(task(&format!("/f{i}")));
        }

        queue.stop().await;
        assert_eq!(queue.abandoned(), 5);
        assert_eq!(queue.pending(), 0);
        queue.wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_running_task() {
        let queue = TaskQueue::new(8);
        let recorder = Arc::new(Recorder {
            delay: Duration::from_secs(5),
            ..Default::default()
        });
        queue.start(1, recorder.clone()).unwrap();
        queue.submit(task("/slow"));

        recorder.started.notified().await;
        queue.stop().await;

        assert_eq!(recorder.seen.lock().as_slice(), [PathBuf::from("/slow")]);
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let queue = TaskQueue::new(1);
        queue.start(1, Arc::new(Recorder::default())).unwrap();
        assert!(queue.start(1, Arc::new(Recorder::default())).is_err());
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_path_lock_serializes_same_path() {
        let locks = Arc::new(PathLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.lock(Path::new("/a")).await;
        let waiter = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock(Path::new("/a")).await;
                order.lock().push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().push("first");
        drop(first);
        waiter.await.unwrap();

        assert_eq!(order.lock().as_slice(), ["first", "second"]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_path_locks_independent_paths() {
        let locks = PathLocks::new();
        let _a = locks.lock(Path::new("/a")).await;
        let _b = locks.lock(Path::new("/b")).await;
        assert_eq!(locks.len(), 2);
    }
}
