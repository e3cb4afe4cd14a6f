//! Execute tasks on a bounded, optionally self-sizing pool of worker
//! threads.
//!
//! A thread pool contains a set of previously spawned threads, enabling
//! running tasks in parallel without having to spawn up a new thread for
//! each task. Beyond the usual amortized-spawn benefits, this pool adds
//! three things:
//!
//! - **Typed result handles.** Every submission returns a
//!   [`TaskHandle<T>`] backed by a one-shot channel. The handle yields the
//!   callable's value, or its captured failure, exactly once; panics inside
//!   a task never escape a worker.
//! - **Two dispatch disciplines, chosen at compile time.** A
//!   [`ThreadPool<Fifo>`] runs submissions in insertion order. A
//!   [`ThreadPool<Priority>`] runs the highest-priority record first and
//!   additionally accepts a per-task retry budget; a failed attempt
//!   re-enters the queue until the budget runs out.
//! - **Adaptive sizing.** When built with a non-zero tick, a supervisor
//!   thread grows the worker set under backlog and retires idle workers
//!   when the queue runs dry, within `[ceil(upper/5), upper]`.
//!
//! Dropping a pool drains it: queued records are executed to completion
//! (with their retries) before the destructor returns, and no task is ever
//! abandoned mid-execution.
//!
//! # Examples
//!
//! ```
//! use workpool::{SubmitOptions, ThreadPool, Priority};
//!
//! let pool = ThreadPool::<Priority>::new(4);
//!
//! let mut urgent = pool
//!     .submit_with(|| 6 * 7, SubmitOptions::with_priority(10))
//!     .unwrap();
//! let mut background = pool.submit(|| "background work").unwrap();
//!
//! assert_eq!(urgent.recv().unwrap(), 42);
//! assert_eq!(background.recv().unwrap(), "background work");
//! ```

#![deny(missing_docs, missing_debug_implementations)]

mod error;
mod manager;
mod mode;
mod pool;
mod queue;
mod sizing;
mod task;

pub use error::{ManagerError, SubmitError, TaskError};
pub use manager::{ManagerConfig, PoolManager};
pub use mode::{Discipline, Fifo, Mode, Priority};
pub use pool::{Builder, PoolStats, ThreadPool, WorkerId};
pub use task::{SubmitOptions, Task, TaskHandle, TaskId, TaskState};
