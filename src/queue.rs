//! The synchronized task queue shared by producers and workers.
//!
//! One mutex guards the backing store, the pool-wide stop flag, and the
//! idle/halted worker bookkeeping, so that "a worker is idle" always means
//! "that worker is parked on this queue's condition variable". Two condition
//! variables hang off the mutex: `available` wakes workers when work arrives
//! or the pool stops, `drained` wakes the shutdown path when the backlog
//! reaches zero.

use std::collections::{BTreeSet, BinaryHeap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::mode::Discipline;
use crate::pool::WorkerId;
use crate::task::{Task, TaskId};

/// Thread-safe task container with a FIFO or max-priority discipline.
pub(crate) struct TaskQueue {
    shared: Mutex<Shared>,
    available: Condvar,
    drained: Condvar,
}

struct Shared {
    tasks: Backing,
    stopped: bool,
    idle: BTreeSet<WorkerId>,
    halted: HashSet<WorkerId>,
}

enum Backing {
    Fifo(VecDeque<Task>),
    Heap(BinaryHeap<Task>),
}

impl Backing {
    fn push(&mut self, task: Task) {
        match self {
            Backing::Fifo(deque) => deque.push_back(task),
            Backing::Heap(heap) => heap.push(task),
        }
    }

    fn pop(&mut self) -> Option<Task> {
        match self {
            Backing::Fifo(deque) => deque.pop_front(),
            Backing::Heap(heap) => heap.pop(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Fifo(deque) => deque.len(),
            Backing::Heap(heap) => heap.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reserve(&mut self, additional: usize) {
        match self {
            Backing::Fifo(deque) => deque.reserve(additional),
            Backing::Heap(heap) => heap.reserve(additional),
        }
    }

    fn retain<F: FnMut(&Task) -> bool>(&mut self, keep: F) {
        match self {
            Backing::Fifo(deque) => deque.retain(keep),
            Backing::Heap(heap) => heap.retain(keep),
        }
    }
}

impl TaskQueue {
    /// Creates an empty queue with the given discipline.
    pub(crate) fn new(discipline: Discipline) -> TaskQueue {
        let tasks = match discipline {
            Discipline::Fifo => Backing::Fifo(VecDeque::new()),
            Discipline::Priority => Backing::Heap(BinaryHeap::new()),
        };

        TaskQueue {
            shared: Mutex::new(Shared {
                tasks,
                stopped: false,
                idle: BTreeSet::new(),
                halted: HashSet::new(),
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Inserts a record and wakes one waiting worker.
    ///
    /// Once the queue is closed the record is handed back, so the caller can
    /// fulfil its result channel instead of losing it.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.stopped {
                return Err(task);
            }
            shared.tasks.push(task);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a record is available or the calling worker must exit.
    ///
    /// Returns `None` when the worker was individually retired, or when the
    /// queue is closed and empty. While parked on an empty queue the worker
    /// is registered in the idle set (if `track_idle` is set), making it a
    /// candidate for retirement.
    pub(crate) fn pop_blocking(&self, worker: WorkerId, track_idle: bool) -> Option<Task> {
        let mut shared = self.shared.lock().unwrap();

        loop {
            if shared.halted.remove(&worker) {
                return None;
            }

            if shared.stopped && shared.tasks.is_empty() {
                self.drained.notify_all();
                return None;
            }

            if let Some(task) = shared.tasks.pop() {
                if shared.tasks.is_empty() {
                    self.drained.notify_all();
                }
                return Some(task);
            }

            self.drained.notify_all();
            if track_idle {
                shared.idle.insert(worker);
            }
            shared = self.available.wait(shared).unwrap();
            if track_idle {
                shared.idle.remove(&worker);
            }
        }
    }

    /// Current depth.
    pub(crate) fn len(&self) -> usize {
        self.shared.lock().unwrap().tasks.len()
    }

    /// Capacity hint for the backing store.
    pub(crate) fn reserve(&self, additional: usize) {
        self.shared.lock().unwrap().tasks.reserve(additional);
    }

    /// Drops every record whose callable has already completed.
    ///
    /// Hygiene against records that outlive their execution; the heap
    /// invariant is preserved by the retain.
    pub(crate) fn purge_finished(&self) {
        let mut shared = self.shared.lock().unwrap();
        shared.tasks.retain(|task| !task.is_done());
        if shared.tasks.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Stops the queue: rejects further pushes and wakes every waiter.
    pub(crate) fn close(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.stopped = true;
        }
        self.available.notify_all();
        self.drained.notify_all();
    }

    /// True once [`close`](TaskQueue::close) has been called.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().stopped
    }

    /// Blocks the caller until the queue is empty.
    pub(crate) fn wait_drained(&self) {
        let mut shared = self.shared.lock().unwrap();
        while !shared.tasks.is_empty() {
            shared = self.drained.wait(shared).unwrap();
        }
    }

    /// Number of workers currently parked on the queue.
    pub(crate) fn idle_count(&self) -> usize {
        self.shared.lock().unwrap().idle.len()
    }

    /// Marks one parked worker for retirement and wakes the waiters.
    ///
    /// The smallest idle id is chosen. Selection and marking happen in one
    /// critical section, so the chosen worker is provably parked and not
    /// running user code.
    pub(crate) fn halt_one_idle(&self) -> Option<WorkerId> {
        let target = {
            let mut shared = self.shared.lock().unwrap();
            let id = shared.idle.iter().next().copied()?;
            shared.halted.insert(id);
            id
        };
        self.available.notify_all();
        Some(target)
    }
}

// Diagnostic surface, exercised by the test suite.
#[allow(dead_code)]
impl TaskQueue {
    /// Removes one record without blocking.
    pub(crate) fn try_pop(&self) -> Option<Task> {
        let mut shared = self.shared.lock().unwrap();
        let task = shared.tasks.pop();
        if task.is_some() && shared.tasks.is_empty() {
            self.drained.notify_all();
        }
        task
    }

    /// True when no records are queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.shared.lock().unwrap().tasks.is_empty()
    }

    /// Removes the record with the given identity, if queued.
    ///
    /// Linear scan; the heap is rebuilt by the retain.
    pub(crate) fn remove(&self, id: TaskId) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let before = shared.tasks.len();
        shared.tasks.retain(|task| task.id() != id);
        let removed = shared.tasks.len() < before;
        if removed && shared.tasks.is_empty() {
            self.drained.notify_all();
        }
        removed
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        fmt.debug_struct("TaskQueue")
            .field("len", &shared.tasks.len())
            .field("stopped", &shared.stopped)
            .field("idle", &shared.idle.len())
            .finish()
    }
}
