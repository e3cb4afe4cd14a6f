//! A single submitted unit of work and its typed result handle.
//!
//! [`Task`] owns the user callable, its priority and retry accounting, and
//! the sending half of a one-shot result channel. [`TaskHandle`] owns the
//! receiving half and is handed back to the caller at construction time.
//!
//! The record is type-erased so that queues and workers can hold tasks of
//! mixed return types; the handle stays generic over the callable's return
//! type, so no downcasting happens on the receiving side.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering::SeqCst};
use std::sync::Arc;

use futures_channel::oneshot;
use futures_executor::block_on;

use crate::error::TaskError;

/// Execution state of a task.
///
/// Transitions are monotonic: `Pending` to `Completed` when the callable
/// returns normally, `Completed` to `Retrieved` when the caller consumes the
/// result. A failed attempt leaves the state at `Pending`; retry accounting
/// is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not yet executed successfully.
    Pending,
    /// The callable returned and the result channel is fulfilled.
    Completed,
    /// The caller has taken the result out of the handle.
    Retrieved,
}

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const RETRIEVED: u8 = 2;

/// Atomic cell holding a [`TaskState`], shared by a record and its handle.
struct StateCell {
    atomic: AtomicU8,
}

impl StateCell {
    fn new() -> StateCell {
        StateCell {
            atomic: AtomicU8::new(PENDING),
        }
    }

    fn load(&self) -> TaskState {
        match self.atomic.load(SeqCst) {
            PENDING => TaskState::Pending,
            COMPLETED => TaskState::Completed,
            RETRIEVED => TaskState::Retrieved,
            _ => unreachable!("invalid task state value"),
        }
    }

    fn complete(&self) {
        self.atomic.store(COMPLETED, SeqCst);
    }

    fn retrieve(&self) {
        // Only a completed result moves on; a failure observed through the
        // handle leaves the record in its pending state.
        let _ = self
            .atomic
            .compare_exchange(COMPLETED, RETRIEVED, SeqCst, SeqCst);
    }
}

/// Identity of a task, assigned monotonically at construction.
///
/// Used for targeted removal from a queue; it plays no part in the
/// scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn next() -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, SeqCst))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// Per-submission configuration: scheduling priority and retry budget.
///
/// Passed by value to [`Task::with_config`] and to the priority pool's
/// `submit_with`. Defaults to priority 0 and no retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Scheduling priority; a higher value runs earlier under the priority
    /// discipline.
    pub priority: u16,
    /// Additional attempts permitted after a first failure.
    pub retries: u8,
}

impl SubmitOptions {
    /// Options with the given priority and no retries.
    pub fn with_priority(priority: u16) -> SubmitOptions {
        SubmitOptions {
            priority,
            retries: 0,
        }
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: u16) -> SubmitOptions {
        self.priority = priority;
        self
    }

    /// Sets the retry budget.
    pub fn retries(mut self, retries: u8) -> SubmitOptions {
        self.retries = retries;
        self
    }
}

/// Type-erased execution surface of a task record.
trait Execute: Send {
    /// Runs the callable once. On normal return the result channel is
    /// fulfilled with the value and `Ok` comes back; on panic the captured
    /// payload text comes back and the channel is left untouched.
    fn call(&mut self) -> Result<(), String>;

    /// Fulfils the result channel with a terminal error. No-op if the
    /// channel was already fulfilled.
    fn fail(&mut self, err: TaskError);
}

struct Typed<F, T> {
    func: F,
    tx: Option<oneshot::Sender<Result<T, TaskError>>>,
}

impl<F, T> Execute for Typed<F, T>
where
    F: FnMut() -> T + Send,
    T: Send,
{
    fn call(&mut self) -> Result<(), String> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.func)())) {
            Ok(value) => {
                if let Some(tx) = self.tx.take() {
                    // The receiver may already be gone; the value is then
                    // discarded, nobody is waiting for it.
                    let _ = tx.send(Ok(value));
                }
                Ok(())
            }
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }

    fn fail(&mut self, err: TaskError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }
}

impl<F, T> Drop for Typed<F, T> {
    fn drop(&mut self) {
        // Keeps the fulfilled-exactly-once invariant on every drop path: a
        // record discarded without running reports Shutdown to its handle.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(TaskError::Shutdown));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A submitted unit of work.
///
/// Holds the callable, the sending half of the result channel, a scheduling
/// priority, and a retry budget. The record is exclusively owned by whoever
/// currently holds it: the submitting caller, the queue, or a worker.
pub struct Task {
    id: TaskId,
    exec: Box<dyn Execute>,
    state: Arc<StateCell>,
    priority: u16,
    retries: u8,
    attempts: u32,
    last_error: Option<String>,
}

impl Task {
    /// Builds a pending record with default options.
    ///
    /// Returns the record together with the [`TaskHandle`] the caller later
    /// uses to recover the result. The callable is `FnMut` so that a failed
    /// attempt can be re-invoked when retries are attached; plain `Fn`
    /// closures coerce without ceremony.
    pub fn new<F, T>(func: F) -> (Task, TaskHandle<T>)
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        Task::with_config(func, SubmitOptions::default())
    }

    /// Builds a pending record with the given priority and retry budget.
    pub fn with_config<F, T>(func: F, options: SubmitOptions) -> (Task, TaskHandle<T>)
    where
        F: FnMut() -> T + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(StateCell::new());
        let (tx, rx) = oneshot::channel();

        let task = Task {
            id: TaskId::next(),
            exec: Box::new(Typed { func, tx: Some(tx) }),
            state: state.clone(),
            priority: options.priority,
            retries: options.retries,
            attempts: 0,
            last_error: None,
        };

        let handle = TaskHandle {
            rx: Some(rx),
            state,
        };

        (task, handle)
    }

    /// Identity of this record.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current execution state.
    pub fn state(&self) -> TaskState {
        self.state.load()
    }

    /// True once the callable has completed, whether or not the caller has
    /// consumed the result yet.
    pub fn is_done(&self) -> bool {
        matches!(self.state(), TaskState::Completed | TaskState::Retrieved)
    }

    /// Current scheduling priority.
    pub fn priority(&self) -> u16 {
        self.priority
    }

    /// Remaining retry budget.
    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Raises the priority, clamping at `u16::MAX`.
    pub fn increase_priority(&mut self, amount: u16) {
        self.priority = self.priority.saturating_add(amount);
    }

    /// Lowers the priority, clamping at zero.
    pub fn decrease_priority(&mut self, amount: u16) {
        self.priority = self.priority.saturating_sub(amount);
    }

    /// Raises the retry budget, clamping at `u8::MAX`.
    pub fn increase_retries(&mut self, amount: u8) {
        self.retries = self.retries.saturating_add(amount);
    }

    /// Lowers the retry budget, clamping at zero.
    pub fn decrease_retries(&mut self, amount: u8) {
        self.retries = self.retries.saturating_sub(amount);
    }

    /// Raises the priority by one; see [`increase_priority`](Task::increase_priority).
    pub fn increment_priority(&mut self) {
        self.increase_priority(1);
    }

    /// Lowers the priority by one; see [`decrease_priority`](Task::decrease_priority).
    pub fn decrement_priority(&mut self) {
        self.decrease_priority(1);
    }

    /// Raises the retry budget by one; see [`increase_retries`](Task::increase_retries).
    pub fn increment_retries(&mut self) {
        self.increase_retries(1);
    }

    /// Lowers the retry budget by one; see [`decrease_retries`](Task::decrease_retries).
    pub fn decrement_retries(&mut self) {
        self.decrease_retries(1);
    }

    /// Runs the callable once.
    ///
    /// On normal return, fulfils the result channel with the value, moves
    /// the state to `Completed`, and returns true. On panic, records the
    /// payload text for the eventual terminal report and returns false; the
    /// state stays `Pending` and the channel stays open so the record can be
    /// re-enqueued.
    ///
    /// Calling this on a record that is not `Pending` is a programming
    /// error.
    pub fn try_execute(&mut self) -> bool {
        debug_assert!(
            self.state() == TaskState::Pending,
            "try_execute on a non-pending task"
        );

        self.attempts += 1;

        match self.exec.call() {
            Ok(()) => {
                self.state.complete();
                true
            }
            Err(reason) => {
                self.last_error = Some(reason);
                false
            }
        }
    }

    /// Fulfils the result channel with the terminal failure.
    ///
    /// Reports `RetryExhausted` when the record was attempted more than
    /// once, `Failed` otherwise.
    pub(crate) fn fail(&mut self) {
        let reason = self
            .last_error
            .take()
            .unwrap_or_else(|| "task was never executed".to_string());

        let err = if self.attempts > 1 {
            TaskError::RetryExhausted {
                attempts: self.attempts,
                reason,
            }
        } else {
            TaskError::Failed { reason }
        };

        self.exec.fail(err);
    }
}

// Ordering is on (priority, retries); identity is deliberately excluded so
// that records of equal rank may be dequeued in any relative order.

impl PartialEq for Task {
    fn eq(&self, other: &Task) -> bool {
        self.priority == other.priority && self.retries == other.retries
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Task) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Task) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.retries.cmp(&other.retries))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("priority", &self.priority)
            .field("retries", &self.retries)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Receiving half of a task's result channel.
///
/// Yields the callable's value, or the captured failure, exactly once.
pub struct TaskHandle<T> {
    rx: Option<oneshot::Receiver<Result<T, TaskError>>>,
    state: Arc<StateCell>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task's outcome is available and returns it.
    ///
    /// A second call returns [`TaskError::AlreadyRetrieved`]. If the pool
    /// dropped the record without fulfilling it, this yields
    /// [`TaskError::Shutdown`].
    pub fn recv(&mut self) -> Result<T, TaskError> {
        let rx = self.rx.take().ok_or(TaskError::AlreadyRetrieved)?;

        match block_on(rx) {
            Ok(Ok(value)) => {
                self.state.retrieve();
                Ok(value)
            }
            Ok(Err(err)) => Err(err),
            Err(oneshot::Canceled) => Err(TaskError::Shutdown),
        }
    }

    /// Non-blocking variant of [`recv`](TaskHandle::recv).
    ///
    /// Returns `Ok(None)` while the task has not finished yet.
    pub fn try_recv(&mut self) -> Result<Option<T>, TaskError> {
        let rx = self.rx.as_mut().ok_or(TaskError::AlreadyRetrieved)?;

        match rx.try_recv() {
            Ok(Some(Ok(value))) => {
                self.rx = None;
                self.state.retrieve();
                Ok(Some(value))
            }
            Ok(Some(Err(err))) => {
                self.rx = None;
                Err(err)
            }
            Ok(None) => Ok(None),
            Err(oneshot::Canceled) => {
                self.rx = None;
                Err(TaskError::Shutdown)
            }
        }
    }

    /// Current state of the task this handle observes.
    pub fn state(&self) -> TaskState {
        self.state.load()
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TaskHandle")
            .field("state", &self.state())
            .field("retrieved", &self.rx.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_and_retrieves() {
        let (mut task, mut handle) = Task::new(|| 6 * 7);

        assert_eq!(task.state(), TaskState::Pending);
        assert!(task.try_execute());
        assert_eq!(task.state(), TaskState::Completed);
        assert!(task.is_done());

        assert_eq!(handle.recv().unwrap(), 42);
        assert_eq!(handle.state(), TaskState::Retrieved);
    }

    #[test]
    fn second_recv_fails() {
        let (mut task, mut handle) = Task::new(|| "hi");
        assert!(task.try_execute());

        assert_eq!(handle.recv().unwrap(), "hi");
        assert!(matches!(handle.recv(), Err(TaskError::AlreadyRetrieved)));
    }

    #[test]
    fn panic_leaves_pending() {
        let (mut task, _handle) = Task::new(|| -> u32 { panic!("boom") });

        assert!(!task.try_execute());
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempts(), 1);
    }

    #[test]
    fn single_failure_reports_failed() {
        let (mut task, mut handle) = Task::new(|| -> u32 { panic!("boom") });

        assert!(!task.try_execute());
        task.fail();

        match handle.recv() {
            Err(TaskError::Failed { reason }) => assert_eq!(reason, "boom"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn repeated_failure_reports_exhausted() {
        let (mut task, mut handle) = Task::with_config(
            || -> u32 { panic!("boom") },
            SubmitOptions::default().retries(2),
        );

        for _ in 0..3 {
            assert!(!task.try_execute());
            task.decrease_retries(1);
        }
        assert_eq!(task.retries(), 0);
        task.fail();

        match handle.recv() {
            Err(TaskError::RetryExhausted { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn dropped_record_reports_shutdown() {
        let (task, mut handle) = Task::new(|| 1);
        drop(task);

        assert!(matches!(handle.recv(), Err(TaskError::Shutdown)));
    }

    #[test]
    fn try_recv_is_non_blocking() {
        let (mut task, mut handle) = Task::new(|| 5);

        assert!(matches!(handle.try_recv(), Ok(None)));
        assert!(task.try_execute());
        assert_eq!(handle.try_recv().unwrap(), Some(5));
        assert!(matches!(
            handle.try_recv(),
            Err(TaskError::AlreadyRetrieved)
        ));
    }

    #[test]
    fn saturating_mutators_clamp_at_bounds() {
        let (mut task, _handle) = Task::with_config(
            || (),
            SubmitOptions {
                priority: u16::MAX - 1,
                retries: 1,
            },
        );

        task.increase_priority(10);
        assert_eq!(task.priority(), u16::MAX);
        task.increase_priority(1);
        assert_eq!(task.priority(), u16::MAX);

        task.decrease_retries(5);
        assert_eq!(task.retries(), 0);
        task.decrease_retries(1);
        assert_eq!(task.retries(), 0);

        task.increase_retries(u8::MAX);
        task.increase_retries(1);
        assert_eq!(task.retries(), u8::MAX);

        task.decrease_priority(u16::MAX);
        task.decrease_priority(1);
        assert_eq!(task.priority(), 0);
    }

    #[test]
    fn by_one_mutators_follow_the_saturating_forms() {
        let (mut task, _handle) =
            Task::with_config(|| (), SubmitOptions::with_priority(5).retries(1));

        task.increment_priority();
        task.increment_retries();
        assert_eq!(task.priority(), 6);
        assert_eq!(task.retries(), 2);

        task.decrement_priority();
        task.decrement_retries();
        task.decrement_retries();
        assert_eq!(task.priority(), 5);
        assert_eq!(task.retries(), 0);

        // Clamped at zero, same as the amount-taking form.
        task.decrement_retries();
        assert_eq!(task.retries(), 0);
    }

    #[test]
    fn order_is_priority_then_retries() {
        let (low, _h1) = Task::with_config(|| (), SubmitOptions::with_priority(1));
        let (high, _h2) = Task::with_config(|| (), SubmitOptions::with_priority(9));
        let (high_retry, _h3) =
            Task::with_config(|| (), SubmitOptions::with_priority(9).retries(3));
        let (same_as_high, _h4) = Task::with_config(|| (), SubmitOptions::with_priority(9));

        assert!(low < high);
        assert!(high < high_retry);
        assert_eq!(high, same_as_high);
    }

    #[test]
    fn unit_returning_task_exposes_unit_result() {
        let (mut task, mut handle) = Task::new(|| {});
        assert!(task.try_execute());
        handle.recv().unwrap();
    }
}
