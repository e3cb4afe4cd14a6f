//! Execute tasks on one of possibly several pooled worker threads.
//!
//! [`ThreadPool`] owns the worker set and the shared task queue, and is
//! parameterized by a [`Mode`] marker selecting the dispatch discipline.
//! Workers pull records off the queue, run them, and route failures through
//! the retry policy. Dropping the pool drains the queue, stops the sizing
//! supervisor, and joins every worker; a task that is already executing
//! always runs to completion.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::SubmitError;
use crate::mode::{Discipline, Fifo, Mode, Priority};
use crate::queue::TaskQueue;
use crate::sizing::SizingController;
use crate::task::{SubmitOptions, Task, TaskHandle};

/// Identity of a pooled worker thread, assigned monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Snapshot of the pool's task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks that ran to completion.
    pub completed: usize,
    /// Failed attempts that were re-enqueued.
    pub retried: usize,
    /// Tasks that failed terminally.
    pub failed: usize,
}

/// A pool of worker threads pulling from a shared queue.
///
/// The mode parameter fixes the dispatch discipline at compile time;
/// see [`Fifo`] and [`Priority`].
pub struct ThreadPool<M: Mode = Fifo> {
    inner: Arc<Inner>,
    sizer: Option<SizingController>,
    _mode: PhantomData<M>,
}

/// Thread pool configuration.
///
/// Provides detailed control over the properties and behavior of the pool;
/// the [`ThreadPool`] constructors cover the common cases.
pub struct Builder<M: Mode = Fifo> {
    workers: Option<usize>,
    max_workers: usize,
    tick: Duration,
    queue_capacity: usize,
    name_prefix: String,
    stack_size: Option<usize>,
    _mode: PhantomData<M>,
}

// Worker thread naming/sizing configuration, applied at spawn time.
struct Config {
    name_prefix: String,
    stack_size: Option<usize>,
}

struct Counters {
    completed: AtomicUsize,
    retried: AtomicUsize,
    failed: AtomicUsize,
}

pub(crate) struct Inner {
    pub(crate) queue: TaskQueue,
    workers: Mutex<HashMap<WorkerId, JoinHandle<()>>>,
    next_worker_id: AtomicU64,
    pub(crate) upper_bound: usize,
    adaptive: bool,
    tick: Duration,
    config: Config,
    spawn_error: Mutex<Option<io::Error>>,
    counters: Counters,
}

// Tracks state associated with a worker thread.
struct Worker {
    id: WorkerId,
    inner: Arc<Inner>,
}

// ===== impl Builder =====

impl<M: Mode> Builder<M> {
    /// Returns a builder with default values.
    ///
    /// Defaults: as many workers as hardware threads, no adaptive sizing,
    /// threads named `workpool-<id>`.
    pub fn new() -> Builder<M> {
        Builder {
            workers: None,
            max_workers: num_cpus::get().max(1),
            tick: Duration::ZERO,
            queue_capacity: 0,
            name_prefix: "workpool-".to_string(),
            stack_size: None,
            _mode: PhantomData,
        }
    }

    /// Sets the initial number of workers.
    ///
    /// Clamped to `[1, max_workers]` when the pool is built.
    pub fn workers(mut self, val: usize) -> Self {
        self.workers = Some(val);
        self
    }

    /// Sets the upper bound on the worker set.
    ///
    /// The adaptive controller never grows the pool past this; values below
    /// one are treated as one. Defaults to the hardware concurrency.
    pub fn max_workers(mut self, val: usize) -> Self {
        self.max_workers = val;
        self
    }

    /// Enables adaptive sizing with the given wake period.
    ///
    /// A zero tick leaves the controller disabled and the worker set fixed
    /// for the pool's lifetime.
    pub fn adaptive_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Pre-reserves space in the task queue.
    pub fn queue_capacity(mut self, val: usize) -> Self {
        self.queue_capacity = val;
        self
    }

    /// Sets the name prefix of threads spawned by the pool.
    ///
    /// Threads are named `<prefix><worker id>`.
    pub fn name_prefix<S: Into<String>>(mut self, val: S) -> Self {
        self.name_prefix = val.into();
        self
    }

    /// Sets the stack size of threads spawned by the pool.
    pub fn stack_size(mut self, val: usize) -> Self {
        self.stack_size = Some(val);
        self
    }

    /// Builds the configured thread pool and spawns its initial workers.
    pub fn build(self) -> ThreadPool<M> {
        let upper_bound = self.max_workers.max(1);
        let initial = self.workers.unwrap_or(upper_bound).clamp(1, upper_bound);
        let adaptive = !self.tick.is_zero();

        let inner = Arc::new(Inner {
            queue: TaskQueue::new(M::DISCIPLINE),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicU64::new(1),
            upper_bound,
            adaptive,
            tick: self.tick,
            config: Config {
                name_prefix: self.name_prefix,
                stack_size: self.stack_size,
            },
            spawn_error: Mutex::new(None),
            counters: Counters {
                completed: AtomicUsize::new(0),
                retried: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
            },
        });

        if self.queue_capacity > 0 {
            inner.queue.reserve(self.queue_capacity);
        }

        for _ in 0..initial {
            if let Err(err) = inner.spawn_worker() {
                inner.record_spawn_error(err);
                break;
            }
        }

        let sizer = adaptive.then(|| SizingController::start(Arc::clone(&inner), self.tick));

        ThreadPool {
            inner,
            sizer,
            _mode: PhantomData,
        }
    }
}

impl<M: Mode> Default for Builder<M> {
    fn default() -> Self {
        Builder::new()
    }
}

impl<M: Mode> fmt::Debug for Builder<M> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Builder")
            .field("mode", &M::DISCIPLINE)
            .field("workers", &self.workers)
            .field("max_workers", &self.max_workers)
            .field("tick", &self.tick)
            .field("name_prefix", &self.name_prefix)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

// ===== impl ThreadPool =====

impl<M: Mode> ThreadPool<M> {
    /// Returns a builder for detailed configuration.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Creates a pool with a fixed worker set of the given size.
    ///
    /// The size is clamped to `[1, hardware concurrency]`; adaptive sizing
    /// is disabled.
    pub fn new(workers: usize) -> ThreadPool<M> {
        Builder::new().workers(workers).build()
    }

    /// Alias of [`new`](ThreadPool::new), matching the builder vocabulary.
    pub fn fixed_size(workers: usize) -> ThreadPool<M> {
        ThreadPool::new(workers)
    }

    /// Creates a pool with a single worker thread.
    ///
    /// Tasks are guaranteed to execute sequentially, and no more than one
    /// task will be active at any given time.
    pub fn single_thread() -> ThreadPool<M> {
        Builder::new().workers(1).build()
    }

    /// Creates a pool that grows and shrinks with observed load.
    ///
    /// The sizing supervisor wakes every `tick`, growing toward the
    /// hardware-concurrency bound under backlog and retiring idle workers
    /// when the queue runs dry.
    pub fn adaptive(workers: usize, tick: Duration) -> ThreadPool<M> {
        Builder::new().workers(workers).adaptive_tick(tick).build()
    }

    /// The dispatch discipline of this pool.
    pub fn mode(&self) -> Discipline {
        M::DISCIPLINE
    }

    /// Current number of queued records. A snapshot, not a transaction.
    pub fn queued_size(&self) -> usize {
        self.inner.queue.len()
    }

    /// Current number of worker threads. A snapshot, not a transaction.
    pub fn workers_size(&self) -> usize {
        self.inner.workers_size()
    }

    /// The bound the worker set may never exceed.
    pub fn upper_bound(&self) -> usize {
        self.inner.upper_bound
    }

    /// True when the adaptive sizing supervisor is running.
    pub fn is_adaptive(&self) -> bool {
        self.inner.adaptive
    }

    /// The sizing supervisor's wake period; zero when disabled.
    pub fn adaptive_tick(&self) -> Duration {
        self.inner.tick
    }

    /// Snapshot of the completed/retried/failed counters.
    pub fn status(&self) -> PoolStats {
        PoolStats {
            completed: self.inner.counters.completed.load(Relaxed),
            retried: self.inner.counters.retried.load(Relaxed),
            failed: self.inner.counters.failed.load(Relaxed),
        }
    }

    /// Stops accepting new work.
    ///
    /// Already-queued records are still executed; workers exit once the
    /// queue runs dry. Subsequent submissions fail with
    /// [`SubmitError::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.queue.close();
    }

    /// True once [`shutdown`](ThreadPool::shutdown) has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.is_closed()
    }

    fn enqueue<F, T>(&self, func: F, options: SubmitOptions) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        if let Some(err) = self.inner.take_spawn_error() {
            return Err(SubmitError::ResourceExhausted(err));
        }
        if self.inner.workers_size() == 0 {
            // Every spawn failed; accepting work would strand it.
            return Err(SubmitError::ResourceExhausted(io::Error::other(
                "no worker threads available",
            )));
        }

        let (task, handle) = Task::with_config(func, options);
        self.inner
            .queue
            .push(task)
            .map_err(|_| SubmitError::Shutdown)?;

        Ok(handle)
    }
}

impl ThreadPool<Fifo> {
    /// Submits a callable for execution in insertion order.
    ///
    /// Returns the handle that yields the callable's value, or its captured
    /// failure, exactly once.
    pub fn submit<F, T>(&self, func: F) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(func, SubmitOptions::default())
    }
}

impl ThreadPool<Priority> {
    /// Submits a callable with default options (priority 0, no retries).
    pub fn submit<F, T>(&self, func: F) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(func, SubmitOptions::default())
    }

    /// Submits a callable with an explicit priority and retry budget.
    pub fn submit_with<F, T>(
        &self,
        func: F,
        options: SubmitOptions,
    ) -> Result<TaskHandle<T>, SubmitError>
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(func, options)
    }

    /// Submits a pre-built record.
    ///
    /// On [`SubmitError::Shutdown`] the record is dropped and its handle
    /// observes the shutdown through the result channel.
    pub fn submit_task(&self, task: Task) -> Result<(), SubmitError> {
        if let Some(err) = self.inner.take_spawn_error() {
            return Err(SubmitError::ResourceExhausted(err));
        }
        if self.inner.workers_size() == 0 {
            return Err(SubmitError::ResourceExhausted(io::Error::other(
                "no worker threads available",
            )));
        }

        self.inner
            .queue
            .push(task)
            .map_err(|_| SubmitError::Shutdown)
    }
}

impl<M: Mode> Drop for ThreadPool<M> {
    /// Graceful drain-then-stop.
    ///
    /// Blocks until every queued record has been picked up, stops and joins
    /// the sizing supervisor, then stops and joins every worker. The worker
    /// currently running a task finishes it before exiting.
    fn drop(&mut self) {
        self.inner.queue.wait_drained();

        if let Some(sizer) = self.sizer.take() {
            sizer.stop();
        }

        self.inner.queue.close();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().unwrap();
            workers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl<M: Mode> fmt::Debug for ThreadPool<M> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ThreadPool")
            .field("mode", &M::DISCIPLINE)
            .field("workers", &self.workers_size())
            .field("queued", &self.queued_size())
            .field("adaptive", &self.is_adaptive())
            .finish()
    }
}

// ===== impl Inner =====

impl Inner {
    /// Spawns one worker thread and registers it in the worker set.
    ///
    /// The worker-set lock is held across the spawn so a retirement can
    /// never observe a live worker without its join handle.
    pub(crate) fn spawn_worker(self: &Arc<Inner>) -> io::Result<WorkerId> {
        let id = WorkerId(self.next_worker_id.fetch_add(1, Relaxed));
        let worker = Worker {
            id,
            inner: Arc::clone(self),
        };

        let mut builder = thread::Builder::new().name(format!("{}{}", self.config.name_prefix, id));
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let mut workers = self.workers.lock().unwrap();
        let handle = builder.spawn(move || worker.run())?;
        workers.insert(id, handle);

        debug!(worker = %id, "spawned worker");
        Ok(id)
    }

    pub(crate) fn workers_size(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Removes a retired worker's handle from the set, for joining.
    pub(crate) fn detach_worker(&self, id: WorkerId) -> Option<JoinHandle<()>> {
        self.workers.lock().unwrap().remove(&id)
    }

    pub(crate) fn record_spawn_error(&self, err: io::Error) {
        error!(error = %err, "failed to spawn worker thread");
        *self.spawn_error.lock().unwrap() = Some(err);
    }

    fn take_spawn_error(&self) -> Option<io::Error> {
        self.spawn_error.lock().unwrap().take()
    }

    /// Retry policy for a record whose attempt failed.
    ///
    /// With budget remaining, the record re-enters the queue at its current
    /// priority and stays pending. Once the budget is exhausted, or the
    /// queue no longer accepts the re-enqueue, the captured failure is
    /// reported through the record's channel and the error sink.
    fn handle_failure(&self, mut task: Task) {
        if task.retries() > 0 {
            task.decrease_retries(1);
            match self.queue.push(task) {
                Ok(()) => {
                    self.counters.retried.fetch_add(1, Relaxed);
                }
                Err(mut task) => {
                    self.counters.failed.fetch_add(1, Relaxed);
                    error!(
                        task = %task.id(),
                        attempts = task.attempts(),
                        "dropping failed task; pool is shutting down"
                    );
                    task.fail();
                }
            }
        } else {
            self.counters.failed.fetch_add(1, Relaxed);
            error!(
                task = %task.id(),
                attempts = task.attempts(),
                "task failed with no retries remaining"
            );
            task.fail();
        }
    }
}

// ===== impl Worker =====

impl Worker {
    fn run(self) {
        while let Some(mut task) = self.inner.queue.pop_blocking(self.id, self.inner.adaptive) {
            if task.try_execute() {
                self.inner.counters.completed.fetch_add(1, Relaxed);
            } else {
                self.inner.handle_failure(task);
            }
        }

        debug!(worker = %self.id, "worker exiting");
    }
}
