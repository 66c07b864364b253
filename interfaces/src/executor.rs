//! Task Executors
//!
//! Fire-and-forget task submission for the real-time slot path. Submitting
//! never blocks: `execute` and `defer` report acceptance immediately, and a
//! `false` return means the task was dropped (typically because the queue is
//! full). Callers decide how to degrade.

use crate::InterfaceError;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace};

/// Unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Task executor contract.
///
/// The boolean result indicates acceptance, not completion.
pub trait TaskExecutor: Send + Sync {
    /// Run the task, possibly inline when the caller already runs on one of
    /// the executor's threads.
    fn execute(&self, task: Task) -> bool;

    /// Queue the task for later execution, never inline.
    fn defer(&self, task: Task) -> bool;
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Fixed set of named worker threads draining one bounded queue
pub struct WorkerPool {
    name: String,
    id: usize,
    nof_workers: usize,
    sender: RwLock<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `nof_workers` threads sharing a queue of `queue_size` tasks
    pub fn new(name: &str, nof_workers: usize, queue_size: usize) -> Result<Self, InterfaceError> {
        if nof_workers == 0 || queue_size == 0 {
            return Err(InterfaceError::InvalidConfig(format!(
                "worker pool '{}' needs at least one worker and one queue slot (workers={}, queue={})",
                name, nof_workers, queue_size
            )));
        }

        let (sender, receiver) = channel::bounded::<Task>(queue_size);
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);

        let mut workers = Vec::with_capacity(nof_workers);
        for index in 0..nof_workers {
            let receiver = receiver.clone();
            let thread_name = format!("{}#{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(id, receiver))
                .map_err(|source| InterfaceError::SpawnFailed { name: thread_name, source })?;
            workers.push(handle);
        }

        info!("Worker pool '{}' started: {} workers, queue size {}", name, nof_workers, queue_size);

        Ok(Self {
            name: name.to_string(),
            id,
            nof_workers,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of worker threads
    pub fn nof_workers(&self) -> usize {
        self.nof_workers
    }

    /// Number of queued tasks not yet picked up by a worker
    pub fn nof_pending(&self) -> usize {
        self.sender.read().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    fn is_current_thread_worker(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.id)
    }

    fn enqueue(&self, task: Task) -> bool {
        let guard = self.sender.read();
        let Some(sender) = guard.as_ref() else {
            debug!("Worker pool '{}' is stopped, rejecting task", self.name);
            return false;
        };

        match sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Worker pool '{}' queue is full", self.name);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Close the queue and join all workers; queued tasks are still run
    pub fn stop(&self) {
        if self.sender.write().take().is_none() {
            return;
        }

        if self.is_current_thread_worker() {
            // Joining from one of our own threads would deadlock; workers
            // exit on their own once the queue drains.
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("Worker thread of pool '{}' panicked", self.name);
            }
        }
        info!("Worker pool '{}' stopped", self.name);
    }
}

impl TaskExecutor for WorkerPool {
    fn execute(&self, task: Task) -> bool {
        if self.is_current_thread_worker() {
            task();
            return true;
        }
        self.enqueue(task)
    }

    fn defer(&self, task: Task) -> bool {
        self.enqueue(task)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(pool_id: usize, receiver: Receiver<Task>) {
    CURRENT_POOL.with(|current| current.set(pool_id));
    while let Ok(task) = receiver.recv() {
        task();
    }
    debug!("Worker {:?} exiting", thread::current().name());
}

/// Executor backed by the tokio blocking thread pool.
///
/// The number of tasks in flight is capped by a semaphore so that
/// saturation surfaces as a rejected submission instead of an unbounded
/// backlog.
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
    permits: Arc<Semaphore>,
}

impl TokioExecutor {
    /// Create an executor on `handle` admitting at most `max_pending` tasks
    pub fn new(handle: tokio::runtime::Handle, max_pending: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_pending)),
        }
    }

    /// Number of tasks that can still be admitted
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskExecutor for TokioExecutor {
    fn execute(&self, task: Task) -> bool {
        self.defer(task)
    }

    fn defer(&self, task: Task) -> bool {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                self.handle.spawn_blocking(move || {
                    task();
                    drop(permit);
                });
                true
            }
            Err(_) => false,
        }
    }
}

/// Executor running every task on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn execute(&self, task: Task) -> bool {
        task();
        true
    }

    fn defer(&self, task: Task) -> bool {
        task();
        true
    }
}

/// Executor whose tasks only run when the owner drains it.
///
/// Useful for single-threaded slot loops and for reproducing executor
/// saturation: once [`ManualExecutor::set_accepting`] is cleared every
/// submission is rejected.
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
    accepting: AtomicBool,
}

impl ManualExecutor {
    /// Create an empty executor accepting tasks
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Accept or reject subsequent submissions
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Number of queued tasks
    pub fn nof_pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the oldest queued task, if any
    pub fn try_run_next(&self) -> bool {
        // The lock is released before running so tasks may submit more work.
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run queued tasks until the queue is empty; returns how many ran
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while self.try_run_next() {
            count += 1;
        }
        count
    }

    fn push(&self, task: Task) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        self.queue.lock().push_back(task);
        true
    }
}

impl Default for ManualExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor for ManualExecutor {
    fn execute(&self, task: Task) -> bool {
        self.push(task)
    }

    fn defer(&self, task: Task) -> bool {
        self.push(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_worker_pool_runs_tasks() {
        let pool = WorkerPool::new("test", 2, 16).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..8 {
            let tx = tx.clone();
            assert!(pool.execute(Box::new(move || tx.send(i).unwrap())));
        }

        let mut results: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_pool_rejects_when_full() {
        let pool = WorkerPool::new("full", 1, 1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        // Occupy the only worker.
        assert!(pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        })));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the queue, then overflow it.
        assert!(pool.defer(Box::new(|| {})));
        assert!(!pool.defer(Box::new(|| {})));
        assert!(!pool.execute(Box::new(|| {})));

        gate_tx.send(()).unwrap();
        pool.stop();
    }

    #[test]
    fn test_worker_pool_executes_inline_on_own_thread() {
        let pool = Arc::new(WorkerPool::new("inline", 1, 4).unwrap());
        let (tx, rx) = mpsc::channel();

        let inner_pool = pool.clone();
        assert!(pool.execute(Box::new(move || {
            let outer = thread::current().id();
            let (inner_tx, inner_rx) = mpsc::channel();
            // Same pool, same thread: must run before execute returns.
            let accepted = inner_pool.execute(Box::new(move || {
                inner_tx.send(thread::current().id()).unwrap();
            }));
            let inner = inner_rx.try_recv().ok();
            tx.send((accepted, Some(outer) == inner)).unwrap();
        })));

        let (accepted, same_thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(accepted);
        assert!(same_thread);
        pool.stop();
    }

    #[test]
    fn test_worker_pool_stop_rejects_new_tasks() {
        let pool = WorkerPool::new("stop", 1, 4).unwrap();
        pool.stop();
        assert!(!pool.execute(Box::new(|| {})));
        assert_eq!(pool.nof_pending(), 0);
    }

    #[test]
    fn test_worker_pool_invalid_config() {
        assert!(matches!(
            WorkerPool::new("bad", 0, 4),
            Err(InterfaceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_manual_executor() {
        let executor = ManualExecutor::new();
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        assert!(executor.execute(Box::new(move || tx1.send(1).unwrap())));
        assert_eq!(executor.nof_pending(), 1);
        assert!(rx.try_recv().is_err());

        executor.set_accepting(false);
        assert!(!executor.defer(Box::new(move || tx.send(2).unwrap())));

        assert_eq!(executor.run_pending(), 1);
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_inline_executor() {
        let (tx, rx) = mpsc::channel();
        assert!(InlineExecutor.execute(Box::new(move || tx.send(7).unwrap())));
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_executor_bounds_in_flight_tasks() {
        let executor = TokioExecutor::new(tokio::runtime::Handle::current(), 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();

        assert!(executor.execute(Box::new(move || {
            gate_rx.recv().unwrap();
            done_tx.send(()).unwrap();
        })));
        assert_eq!(executor.available(), 0);
        assert!(!executor.defer(Box::new(|| {})));

        gate_tx.send(()).unwrap();
        tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .await
            .unwrap();
    }
}
