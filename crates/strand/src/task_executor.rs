//! A closure-queue executor with deadlines and cancellation.
//!
//! [`TaskExecutor`] keeps two queues under one mutex: a FIFO of immediate
//! tasks and a deadline-ordered queue of timed tasks. `update()` swaps the
//! FIFO into a double-buffer, promotes every timed task due within the
//! coalescing window, and runs the batch outside the lock.
//!
//! Tasks can be cancelled individually by the id minted at push time, or in
//! bulk by a user-chosen cancellation token. Schedules shorter than
//! [`TaskExecutor::min_time_to_schedule`] degrade to immediate pushes — there
//! is no point arming a timer for something about to happen anyway.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::context::ContextHandle;
use crate::executor::Executor;
use crate::timed_queue::{Timed, TimedQueue};

/// The default coalescing window.
pub const DEFAULT_MIN_TIME_TO_SCHEDULE: Duration = Duration::from_millis(20);

/// Identifier of a pending task, unique per executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// The raw id value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A user-chosen token grouping tasks for bulk cancellation.
///
/// The zero token means "no token": tasks carrying it cannot be bulk
/// cancelled, and cancelling by it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CancelToken(u32);

impl CancelToken {
    /// The absent token.
    pub const NONE: Self = Self(0);

    /// Wrap a raw token value. Zero is [`CancelToken::NONE`].
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw token value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the absent token.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

type TaskFn = Box<dyn FnOnce() + Send>;

struct TaskEntry {
    task: TaskFn,
    id: TaskId,
    token: CancelToken,
}

struct TimedTaskEntry {
    entry: TaskEntry,
    time: Instant,
}

impl Timed for TimedTaskEntry {
    fn time(&self) -> Instant {
        self.time
    }

    fn set_time(&mut self, time: Instant) {
        self.time = time;
    }
}

/// Both queues plus the id mint, guarded by the task mutex.
struct TaskQueues {
    next_id: u64,
    immediate: Vec<TaskEntry>,
    timed: TimedQueue<TimedTaskEntry>,
}

impl TaskQueues {
    fn mint_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn push(&mut self, task: TaskFn, own_token: CancelToken, cancel_token: CancelToken) -> TaskId {
        self.cancel_with_token(cancel_token);
        let id = self.mint_id();
        self.immediate.push(TaskEntry {
            task,
            id,
            token: own_token,
        });
        id
    }

    fn schedule(
        &mut self,
        min_time_to_schedule: Duration,
        after: Duration,
        task: TaskFn,
        own_token: CancelToken,
        cancel_token: CancelToken,
    ) -> TaskId {
        // No point arming a timer for something about to happen so soon.
        if after < min_time_to_schedule {
            return self.push(task, own_token, cancel_token);
        }
        self.cancel_with_token(cancel_token);
        let id = self.mint_id();
        self.timed.push(TimedTaskEntry {
            entry: TaskEntry {
                task,
                id,
                token: own_token,
            },
            time: Instant::now() + after,
        });
        id
    }

    fn reschedule(
        &mut self,
        min_time_to_schedule: Duration,
        after: Duration,
        id: TaskId,
    ) -> bool {
        if after < min_time_to_schedule {
            match self.timed.try_extract(|timed| timed.entry.id == id) {
                Some(timed) => {
                    self.immediate.push(timed.entry);
                    true
                }
                None => false,
            }
        } else {
            self.timed
                .try_reschedule(Instant::now() + after, |timed| timed.entry.id == id)
        }
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(position) = self.immediate.iter().position(|entry| entry.id == id) {
            self.immediate.remove(position);
            return true;
        }
        self.timed.try_extract(|timed| timed.entry.id == id).is_some()
    }

    fn cancel_with_token(&mut self, token: CancelToken) -> usize {
        if token.is_none() {
            return 0;
        }
        let before = self.immediate.len();
        self.immediate.retain(|entry| entry.token != token);
        let removed = before - self.immediate.len();
        removed + self.timed.erase_all(|timed| timed.entry.token == token)
    }
}

/// An executor that runs queued closures on each `update`.
///
/// All task operations are safe from any thread. Within one update,
/// immediate tasks run in push order, followed by the timed tasks that came
/// due this tick in deadline order. A task that panics takes the rest of its
/// batch down with it (the batch is discarded); the executor itself stays
/// consistent and the panic propagates to the driving worker.
pub struct TaskExecutor {
    handle: ContextHandle,
    min_time_to_schedule: Duration,
    finish_tasks_on_exit: AtomicBool,
    queues: Mutex<TaskQueues>,
    /// Double-buffer for the batch being executed; only touched by `update`
    /// and `finalize`, which the driving execution serializes. Keeping the
    /// buffer around lets both vectors settle at their peak capacity.
    executing: Mutex<Vec<TaskEntry>>,
}

impl TaskExecutor {
    /// An executor with the default coalescing window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_min_time_to_schedule(DEFAULT_MIN_TIME_TO_SCHEDULE)
    }

    /// An executor that degrades schedules shorter than
    /// `min_time_to_schedule` into immediate pushes.
    #[must_use]
    pub fn with_min_time_to_schedule(min_time_to_schedule: Duration) -> Self {
        Self {
            handle: ContextHandle::new(),
            min_time_to_schedule,
            finish_tasks_on_exit: AtomicBool::new(false),
            queues: Mutex::new(TaskQueues {
                next_id: 0,
                immediate: Vec::new(),
                timed: TimedQueue::new(),
            }),
            executing: Mutex::new(Vec::new()),
        }
    }

    /// The coalescing window.
    #[must_use]
    pub fn min_time_to_schedule(&self) -> Duration {
        self.min_time_to_schedule
    }

    /// Whether `finalize` drains the immediate queue (including tasks those
    /// tasks push) before clearing. Timed tasks that are not yet due are
    /// discarded regardless.
    pub fn set_finish_tasks_on_exit(&self, finish: bool) {
        self.finish_tasks_on_exit.store(finish, Ordering::Release);
    }

    /// Lock the queues for a batch of operations under one critical section.
    ///
    /// Dropping the locker releases the lock and wakes the executor once.
    #[must_use]
    pub fn task_locker(&self) -> TaskLocker<'_> {
        TaskLocker {
            executor: self,
            queues: Some(self.queues.lock()),
        }
    }

    /// Append a task to the immediate queue. Returns its id.
    pub fn push_task(&self, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.task_locker().push_task(task)
    }

    /// Append a task carrying `own_token`, first cancelling every pending
    /// task that carries `cancel_token`.
    pub fn push_task_with(
        &self,
        task: impl FnOnce() + Send + 'static,
        own_token: CancelToken,
        cancel_token: CancelToken,
    ) -> TaskId {
        self.task_locker().push_task_with(task, own_token, cancel_token)
    }

    /// Schedule a task to run once `after` has elapsed.
    pub fn schedule_task(&self, after: Duration, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.task_locker().schedule_task(after, task)
    }

    /// Schedule a task carrying `own_token`, first cancelling every pending
    /// task that carries `cancel_token`.
    pub fn schedule_task_with(
        &self,
        after: Duration,
        task: impl FnOnce() + Send + 'static,
        own_token: CancelToken,
        cancel_token: CancelToken,
    ) -> TaskId {
        self.task_locker()
            .schedule_task_with(after, task, own_token, cancel_token)
    }

    /// Move a scheduled task to a new deadline. Returns false when no
    /// pending timed task has this id.
    pub fn reschedule_task(&self, after: Duration, id: TaskId) -> bool {
        self.task_locker().reschedule_task(after, id)
    }

    /// Cancel a pending task by id.
    ///
    /// Returns false when the id is not pending — it may never have been
    /// added, be executing right now, or have already run.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        self.queues.lock().cancel(id)
    }

    /// Cancel every pending task carrying `token`; returns how many were
    /// cancelled. A no-op for [`CancelToken::NONE`].
    ///
    /// Tasks already handed to a running update are not affected.
    pub fn cancel_tasks_with_token(&self, token: CancelToken) -> usize {
        if token.is_none() {
            // Don't even take the lock for the absent token.
            return 0;
        }
        let cancelled = self.queues.lock().cancel_with_token(token);
        if cancelled > 0 {
            tracing::trace!(token = token.raw(), cancelled, "cancelled tasks by token");
        }
        cancelled
    }

    /// Swap the immediate queue into the executing buffer.
    fn fill_executing_batch(&self, batch: &mut Vec<TaskEntry>) {
        let mut queues = self.queues.lock();
        std::mem::swap(batch, &mut queues.immediate);
    }

    fn run_batch(&self, mut batch: Vec<TaskEntry>) {
        for entry in batch.drain(..) {
            (entry.task)();
        }
        // Hand the (empty) buffer back so its capacity is reused. If a task
        // panicked, the remaining entries were dropped with the batch and
        // the buffer stays empty for the next update.
        *self.executing.lock() = batch;
    }

    fn take_executing_buffer(&self) -> Vec<TaskEntry> {
        let mut executing = self.executing.lock();
        debug_assert!(executing.is_empty(), "update re-entered mid-batch");
        std::mem::take(&mut *executing)
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for TaskExecutor {
    fn context(&self) -> &ContextHandle {
        &self.handle
    }

    fn update(&self) {
        let mut batch = self.take_executing_buffer();

        {
            let mut queues = self.queues.lock();
            std::mem::swap(&mut batch, &mut queues.immediate);

            if !queues.timed.is_empty() {
                let now = Instant::now();
                // Anything due within the coalescing window runs this tick.
                let horizon = now + self.min_time_to_schedule;
                while let Some(top_time) = queues.timed.peek().map(|timed| timed.time) {
                    if top_time <= horizon {
                        if let Some(timed) = queues.timed.pop() {
                            batch.push(timed.entry);
                        }
                        if queues.timed.is_empty() {
                            self.handle.unschedule_next_wake_up();
                        }
                    } else {
                        self.handle.schedule_next_wake_up(top_time - now);
                        break;
                    }
                }
            }
        }

        self.run_batch(batch);
    }

    fn finalize(&self) {
        if self.finish_tasks_on_exit.load(Ordering::Acquire) {
            // Tasks may push further tasks, so drain until a swap comes up
            // empty. Timed tasks that are not due are deliberately skipped.
            loop {
                let mut batch = self.take_executing_buffer();
                self.fill_executing_batch(&mut batch);
                if batch.is_empty() {
                    *self.executing.lock() = batch;
                    break;
                }
                self.run_batch(batch);
            }
        }

        // Whether tasks were drained or not, drop whatever is left in case
        // the closures hold references that must be released.
        let mut queues = self.queues.lock();
        let discarded = queues.immediate.len() + queues.timed.len();
        if discarded > 0 {
            tracing::debug!(discarded, "discarding tasks at finalize");
        }
        queues.immediate.clear();
        queues.timed.clear();
    }
}

/// A scoped lock over a [`TaskExecutor`]'s queues.
///
/// Everything pushed, scheduled or cancelled through one locker happens
/// under a single critical section; dropping the locker releases the lock
/// and wakes the executor once.
pub struct TaskLocker<'a> {
    executor: &'a TaskExecutor,
    queues: Option<MutexGuard<'a, TaskQueues>>,
}

impl TaskLocker<'_> {
    fn queues(&mut self) -> &mut TaskQueues {
        self.queues.as_mut().expect("task queues are locked")
    }

    /// Append a task to the immediate queue. Returns its id.
    pub fn push_task(&mut self, task: impl FnOnce() + Send + 'static) -> TaskId {
        self.push_task_with(task, CancelToken::NONE, CancelToken::NONE)
    }

    /// Append a task carrying `own_token`, first cancelling every pending
    /// task that carries `cancel_token`.
    pub fn push_task_with(
        &mut self,
        task: impl FnOnce() + Send + 'static,
        own_token: CancelToken,
        cancel_token: CancelToken,
    ) -> TaskId {
        self.queues().push(Box::new(task), own_token, cancel_token)
    }

    /// Schedule a task to run once `after` has elapsed.
    pub fn schedule_task(
        &mut self,
        after: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TaskId {
        self.schedule_task_with(after, task, CancelToken::NONE, CancelToken::NONE)
    }

    /// Schedule a task carrying `own_token`, first cancelling every pending
    /// task that carries `cancel_token`.
    pub fn schedule_task_with(
        &mut self,
        after: Duration,
        task: impl FnOnce() + Send + 'static,
        own_token: CancelToken,
        cancel_token: CancelToken,
    ) -> TaskId {
        let min_time_to_schedule = self.executor.min_time_to_schedule;
        self.queues()
            .schedule(min_time_to_schedule, after, Box::new(task), own_token, cancel_token)
    }

    /// Move a scheduled task to a new deadline. Returns false when no
    /// pending timed task has this id.
    pub fn reschedule_task(&mut self, after: Duration, id: TaskId) -> bool {
        let min_time_to_schedule = self.executor.min_time_to_schedule;
        self.queues().reschedule(min_time_to_schedule, after, id)
    }

    /// Cancel a pending task by id.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        self.queues().cancel(id)
    }

    /// Cancel every pending task carrying `token`; returns how many were
    /// cancelled. A no-op for [`CancelToken::NONE`].
    pub fn cancel_tasks_with_token(&mut self, token: CancelToken) -> usize {
        self.queues().cancel_with_token(token)
    }
}

impl Drop for TaskLocker<'_> {
    fn drop(&mut self) {
        // Release the lock first, then wake: something has changed.
        self.queues.take();
        self.executor.handle.wake_up_now();
    }
}
