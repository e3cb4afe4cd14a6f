//! Adaptive sizing of the worker set.
//!
//! A single supervisor thread wakes every tick, compares the queue depth
//! against the worker count, and asks the pool to grow under backlog or to
//! retire one idle worker when the pool is oversized. The retirement floor
//! of one fifth of the upper bound keeps brief idle periods from collapsing
//! the pool.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::pool::Inner;

/// Handle to the supervisor thread; owned by the pool.
pub(crate) struct SizingController {
    handle: Option<JoinHandle<()>>,
    latch: Arc<StopLatch>,
}

// Interruptible sleep: the supervisor waits out its tick here, and the
// pool's shutdown cuts the wait short instead of riding out a long tick.
struct StopLatch {
    stopped: Mutex<bool>,
    signal: Condvar,
}

impl StopLatch {
    fn new() -> StopLatch {
        StopLatch {
            stopped: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    /// Sleeps for one tick; returns true once stop has been requested.
    fn wait(&self, tick: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap();
        if *stopped {
            return true;
        }
        let (stopped, _timeout) = self.signal.wait_timeout(stopped, tick).unwrap();
        *stopped
    }

    fn trigger(&self) {
        *self.stopped.lock().unwrap() = true;
        self.signal.notify_all();
    }
}

impl SizingController {
    /// Spawns the supervisor.
    ///
    /// If the thread cannot be spawned the pool simply keeps its fixed
    /// worker set; the failure is logged and surfaced on the next submit.
    pub(crate) fn start(inner: Arc<Inner>, tick: Duration) -> SizingController {
        let latch = Arc::new(StopLatch::new());
        let thread_latch = Arc::clone(&latch);

        let handle = thread::Builder::new()
            .name("workpool-sizing".to_string())
            .spawn(move || run(inner, tick, thread_latch));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to spawn sizing supervisor");
                None
            }
        };

        SizingController { handle, latch }
    }

    /// Requests stop and joins the supervisor thread.
    pub(crate) fn stop(mut self) {
        self.latch.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for SizingController {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SizingController")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn run(inner: Arc<Inner>, tick: Duration, latch: Arc<StopLatch>) {
    while !latch.wait(tick) {
        adjust(&inner);
    }
}

/// One evaluation of the grow/shrink rules.
fn adjust(inner: &Arc<Inner>) {
    // Queue hygiene first: stale completed records must not count as
    // backlog.
    inner.queue.purge_finished();

    let queued = inner.queue.len();
    let workers = inner.workers_size();
    let floor = inner.upper_bound.div_ceil(5);

    if workers > queued && workers > floor && inner.queue.idle_count() > 0 {
        // Oversized and provably idle: retire exactly one parked worker.
        if let Some(id) = inner.queue.halt_one_idle() {
            if let Some(handle) = inner.detach_worker(id) {
                let _ = handle.join();
            }
            debug!(worker = %id, workers = workers - 1, "retired idle worker");
        }
    } else if queued > workers && workers < inner.upper_bound {
        let wanted = (queued - workers).min(inner.upper_bound - workers);
        debug!(queued, workers, spawning = wanted, "growing worker set");
        for _ in 0..wanted {
            if let Err(err) = inner.spawn_worker() {
                inner.record_spawn_error(err);
                break;
            }
        }
    }
}
